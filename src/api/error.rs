//! HTTP error surface.
//!
//! Declared variants carry fixed short messages. `Internal` renders an opaque 500 and
//! leaves the full error in the response extensions for
//! [`super::middleware::report_internal_errors`], which is the only place it is seen.

use crate::{
    auth::AuthError,
    session::SessionError,
    signin::{ChallengeError, SignInError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// Full detail of an internal error, carried from the handler to the reporting stage.
#[derive(Clone, Debug)]
pub struct InternalError(pub Arc<anyhow::Error>);

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    Unauthenticated,
    Forbidden(&'static str),
    NotFound,
    ChallengeAlreadyCompleted,
    ChallengeExpired,
    ChallengeMismatch,
    Internal(anyhow::Error),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, *message),
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, *message),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found"),
            Self::ChallengeAlreadyCompleted => {
                (StatusCode::CONFLICT, "challenge already completed")
            }
            Self::ChallengeExpired => (StatusCode::GONE, "challenge expired"),
            Self::ChallengeMismatch => (StatusCode::BAD_REQUEST, "incorrect code"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        let mut response = (
            status,
            Json(ErrorBody {
                error: message.to_string(),
            }),
        )
            .into_response();
        if let Self::Internal(err) = self {
            response
                .extensions_mut()
                .insert(InternalError(Arc::new(err)));
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotFound => Self::NotFound,
            AuthError::Unauthenticated(_) => Self::Unauthenticated,
            AuthError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<SignInError> for ApiError {
    fn from(err: SignInError) -> Self {
        match err {
            SignInError::NotFound | SignInError::Challenge(ChallengeError::NotFound) => {
                Self::NotFound
            }
            SignInError::BadRequest(message) => Self::BadRequest(message),
            SignInError::Forbidden => Self::Forbidden("login method disabled"),
            SignInError::Unauthenticated => Self::Unauthenticated,
            SignInError::Challenge(ChallengeError::AlreadyCompleted) => {
                Self::ChallengeAlreadyCompleted
            }
            SignInError::Challenge(ChallengeError::Expired) => Self::ChallengeExpired,
            SignInError::Challenge(ChallengeError::Mismatch) => Self::ChallengeMismatch,
            SignInError::Challenge(ChallengeError::Internal(err)) | SignInError::Internal(err) => {
                Self::Internal(err)
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unauthenticated => Self::Unauthenticated,
            SessionError::NotFound => Self::NotFound,
            SessionError::Forbidden(message) => Self::Forbidden(message),
            SessionError::Internal(err) => Self::Internal(err),
        }
    }
}
