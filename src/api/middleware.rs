//! Request pipeline stages.
//!
//! Outermost first: request id, trace span, internal-error reporting, then per route the
//! credential gate. Handlers see an [`AuthContext`] extension on every authenticated
//! route.

use super::error::{ApiError, InternalError};
use crate::auth::{AuthContext, Authenticator};
use axum::{
    extract::{Extension, MatchedPath, Request, State},
    http::{
        HeaderMap,
        header::{AUTHORIZATION, HOST},
        uri::Authority,
    },
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

/// Error-tracking collaborator.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, route: &str, error: &anyhow::Error);
}

/// Default reporter: the error is already logged, this only records the handoff.
#[derive(Clone, Debug)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, route: &str, error: &anyhow::Error) {
        debug!(route, error = ?error, "Reported internal error");
    }
}

/// Authenticate the request and attach the resulting [`AuthContext`].
///
/// # Errors
/// Returns the mapped [`ApiError`] when authentication fails; the handler does not run.
pub async fn authenticate(
    Extension(authenticator): Extension<Arc<Authenticator>>,
    matched: Option<MatchedPath>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let route = matched
        .as_ref()
        .map_or_else(|| request.uri().path().to_string(), |m| m.as_str().to_string());
    let headers = request.headers();
    let host = request_host(headers);
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let context: Option<AuthContext> = authenticator
        .authenticate(host.as_deref(), &route, authorization, Utc::now())
        .await?;

    if let Some(context) = context {
        request.extensions_mut().insert(context);
    }
    Ok(next.run(request).await)
}

/// The `Host` header without its port. IPv6 literals keep their brackets.
fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Authority>().ok())
        .map(|authority| authority.host().to_string())
}

/// Capture the detail of any internal error before the opaque response leaves.
pub async fn report_internal_errors(
    State(reporter): State<Arc<dyn ErrorReporter>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |m| m.as_str().to_string());

    let mut response = next.run(request).await;
    if let Some(InternalError(err)) = response.extensions_mut().remove::<InternalError>() {
        error!(route = %route, status = %response.status(), "Internal error: {err:#}");
        reporter.report(&route, &err);
    }
    response
}
