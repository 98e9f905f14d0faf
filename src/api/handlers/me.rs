use crate::{api::error::ErrorBody, auth::AuthContext};
use axum::{Json, extract::Extension};

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "The authenticated caller.", body = AuthContext),
        (status = 401, description = "Missing or invalid credential.", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn me(Extension(context): Extension<AuthContext>) -> Json<AuthContext> {
    Json(context)
}
