use crate::{
    api::{ApiState, error::{ApiError, ErrorBody}},
    ids::{self, IdKind},
    keys::TokenClass,
    token::jwks::{Jwk, Jwks},
};
use axum::{
    Json,
    extract::{Extension, Path},
};
use chrono::Utc;

#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}/jwks.json",
    params(("project_id" = String, Path, description = "Formatted project id")),
    responses(
        (status = 200, description = "Every unexpired session signing key of the project.", body = Jwks),
        (status = 404, description = "Malformed project id.", body = ErrorBody),
    ),
    tag = "keys"
)]
pub async fn jwks(
    state: Extension<ApiState>,
    Path(project_id): Path<String>,
) -> Result<Json<Jwks>, ApiError> {
    let project_id =
        ids::parse_as(IdKind::Project, &project_id).map_err(|_| ApiError::NotFound)?;
    let keys = state
        .keys
        .get_verification_keys(project_id, TokenClass::Session, Utc::now())
        .await?;

    Ok(Json(Jwks {
        keys: keys
            .iter()
            .map(|key| Jwk::from_verifying_key(&key.key, key.kid.clone()))
            .collect(),
    }))
}
