pub mod health;
pub use self::health::health;

pub mod jwks;
pub mod me;
pub mod sessions;
pub mod signin;

use super::error::ApiError;
use crate::auth::dispatcher::bearer;
use axum::http::{HeaderMap, header::AUTHORIZATION};

// Bearer value for routes that authenticate with something other than a session
// token, such as the intermediate-session sign-in steps.
fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    bearer(
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    )
    .ok_or(ApiError::Unauthenticated)
}
