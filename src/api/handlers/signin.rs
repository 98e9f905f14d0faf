//! Sign-in endpoints.
//!
//! 1) `start` takes an email and returns an intermediate-session bearer, plus a challenge
//!    id when a code was sent.
//! 2) `verify-email` completes the challenge (bearer: intermediate session).
//! 3) `exchange` turns the verified intermediate session into a session in one of the
//!    project's organizations (bearer: intermediate session).

use super::require_bearer;
use crate::{
    api::{
        ApiState,
        error::{ApiError, ErrorBody},
    },
    ids::{self, IdKind},
    signin::SignInState,
};
use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct StartRequest {
    pub project_id: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StartResponse {
    pub state: SignInState,
    pub intermediate_session_id: String,
    pub intermediate_session_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verification_challenge_id: Option<String>,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct VerifyEmailRequest {
    pub email_verification_challenge_id: String,
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ExchangeRequest {
    pub organization_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExchangeResponse {
    pub session_id: String,
    pub refresh_token: String,
    pub access_token: String,
}

#[utoipa::path(
    post,
    path = "/v1/signin/start",
    request_body = StartRequest,
    responses(
        (status = 200, description = "Intermediate session created.", body = StartResponse),
        (status = 400, description = "Malformed email.", body = ErrorBody),
        (status = 403, description = "Email login disabled for the project.", body = ErrorBody),
        (status = 404, description = "Unknown project.", body = ErrorBody),
    ),
    tag = "signin"
)]
pub async fn start(
    state: Extension<ApiState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let project_id =
        ids::parse_as(IdKind::Project, &request.project_id).map_err(|_| ApiError::NotFound)?;

    let outcome = state
        .signin
        .start(project_id, &request.email, Utc::now())
        .await?;

    Ok(Json(StartResponse {
        state: outcome.state,
        intermediate_session_id: ids::format(
            IdKind::IntermediateSession,
            outcome.intermediate_session_id,
        ),
        intermediate_session_token: outcome.intermediate_session_token.expose_secret().to_string(),
        email_verification_challenge_id: outcome
            .challenge_id
            .map(|id| ids::format(IdKind::EmailVerificationChallenge, id)),
        expire_time: outcome.expire_time,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/signin/verify-email",
    request_body = VerifyEmailRequest,
    responses(
        (status = 204, description = "Email verified."),
        (status = 400, description = "Incorrect code.", body = ErrorBody),
        (status = 401, description = "Missing or invalid intermediate session.", body = ErrorBody),
        (status = 404, description = "Unknown challenge.", body = ErrorBody),
        (status = 409, description = "Challenge already completed.", body = ErrorBody),
        (status = 410, description = "Challenge expired.", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "signin"
)]
pub async fn verify_email(
    state: Extension<ApiState>,
    headers: HeaderMap,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<StatusCode, ApiError> {
    let now = Utc::now();
    let session = state
        .signin
        .authenticate_intermediate(require_bearer(&headers)?, now)
        .await?;
    let challenge_id = ids::parse_as(
        IdKind::EmailVerificationChallenge,
        &request.email_verification_challenge_id,
    )
    .map_err(|_| ApiError::NotFound)?;

    state
        .signin
        .complete_email_challenge(&session, challenge_id, &request.code, now)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/signin/exchange",
    request_body = ExchangeRequest,
    responses(
        (status = 200, description = "Session issued.", body = ExchangeResponse),
        (status = 401, description = "Missing or invalid intermediate session.", body = ErrorBody),
        (status = 403, description = "Email not verified or email login disabled.", body = ErrorBody),
        (status = 404, description = "Unknown organization.", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "signin"
)]
pub async fn exchange(
    state: Extension<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let now = Utc::now();
    let session = state
        .signin
        .authenticate_intermediate(require_bearer(&headers)?, now)
        .await?;
    let organization_id = ids::parse_as(IdKind::Organization, &request.organization_id)
        .map_err(|_| ApiError::NotFound)?;

    let issued = state
        .sessions
        .exchange(&session, organization_id, now)
        .await?;

    Ok(Json(ExchangeResponse {
        session_id: ids::format(IdKind::Session, issued.session_id),
        refresh_token: issued.refresh_token.expose_secret().to_string(),
        access_token: issued.access_token,
    }))
}
