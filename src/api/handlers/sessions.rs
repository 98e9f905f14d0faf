use crate::api::{
    ApiState,
    error::{ApiError, ErrorBody},
};
use axum::{Json, extract::Extension};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RefreshResponse {
    pub access_token: String,
}

#[utoipa::path(
    post,
    path = "/v1/sessions/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "A fresh access token reflecting current state.", body = RefreshResponse),
        (status = 401, description = "Unknown, revoked or expired refresh token.", body = ErrorBody),
    ),
    tag = "sessions"
)]
pub async fn refresh(
    state: Extension<ApiState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let access_token = state
        .minter
        .mint(&request.refresh_token, Utc::now())
        .await?;
    Ok(Json(RefreshResponse { access_token }))
}
