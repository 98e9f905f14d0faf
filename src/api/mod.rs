use crate::{
    auth::{Authenticator, AuthenticatorConfig},
    keys::{KeyPolicy, SigningKeyStore, VerificationKeyCache},
    kms::Kms,
    session::{AccessTokenMinter, SessionIssuer},
    signin::SignInFlow,
    store::{CredentialRepository, Ping, SignInRepository, SigningKeyRepository},
};
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::{from_fn, from_fn_with_state},
};
use chrono::Duration;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub mod email;
pub mod error;
pub(crate) mod handlers;
pub mod middleware;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

/// Routes that run without a credential. Intermediate-session routes authenticate
/// their own bearer in the handler.
pub const UNAUTHENTICATED_ROUTES: [&str; 6] = [
    "/health",
    "/v1/signin/start",
    "/v1/signin/verify-email",
    "/v1/signin/exchange",
    "/v1/sessions/refresh",
    "/v1/projects/{project_id}/jwks.json",
];

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Issuance and verification settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// `iss` of access tokens.
    pub issuer: String,
    /// Accepted `Host` values; empty accepts any.
    pub allowed_hosts: Vec<String>,
    /// Master key the KMS wraps signing keys under.
    pub kms_key_id: String,
    pub access_token_ttl: Duration,
    pub intermediate_session_ttl: Duration,
    pub session_ttl: Duration,
    pub key_policy: KeyPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: env!("CARGO_PKG_NAME").to_string(),
            allowed_hosts: Vec::new(),
            kms_key_id: "portcullis-signing".to_string(),
            access_token_ttl: Duration::seconds(300),
            intermediate_session_ttl: Duration::seconds(900),
            session_ttl: Duration::days(7),
            key_policy: KeyPolicy::default(),
        }
    }
}

/// Everything handlers need, shared through an `Extension`.
#[derive(Clone)]
pub struct ApiState {
    pub signin: Arc<SignInFlow>,
    pub sessions: Arc<SessionIssuer>,
    pub minter: Arc<AccessTokenMinter>,
    pub keys: Arc<SigningKeyStore>,
    pub store: Arc<dyn Ping>,
}

/// The wired services of one process.
pub struct Services {
    pub state: ApiState,
    pub authenticator: Arc<Authenticator>,
}

impl Services {
    /// Wire every component on top of one store backend.
    pub fn new<S>(
        store: Arc<S>,
        kms: Arc<dyn Kms>,
        config: &AuthConfig,
        codes: Arc<dyn email::CodeSender>,
    ) -> Self
    where
        S: SigningKeyRepository + CredentialRepository + SignInRepository + Ping + 'static,
    {
        let keys = Arc::new(SigningKeyStore::new(
            store.clone(),
            kms,
            config.kms_key_id.clone(),
            config.key_policy,
        ));
        let minter = Arc::new(AccessTokenMinter::new(
            store.clone(),
            keys.clone(),
            config.issuer.clone(),
            config.access_token_ttl,
        ));
        let sessions = Arc::new(SessionIssuer::new(
            store.clone(),
            store.clone(),
            minter.clone(),
            config.session_ttl,
        ));
        let signin = Arc::new(SignInFlow::new(
            store.clone(),
            keys.clone(),
            codes,
            config.intermediate_session_ttl,
        ));
        let authenticator = Arc::new(Authenticator::new(
            store.clone(),
            Arc::new(VerificationKeyCache::new(keys.clone())),
            AuthenticatorConfig {
                allowed_hosts: config.allowed_hosts.clone(),
                skip_routes: UNAUTHENTICATED_ROUTES.iter().map(ToString::to_string).collect(),
            },
        ));

        Self {
            state: ApiState {
                signin,
                sessions,
                minter,
                keys,
                store,
            },
            authenticator,
        }
    }
}

/// The full HTTP application: routes, credential gate and request pipeline.
pub fn app(services: &Services, reporter: Arc<dyn middleware::ErrorReporter>) -> Router {
    let (router, _openapi) = router().split_for_parts();
    router
        .route_layer(from_fn(middleware::authenticate))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(from_fn_with_state(
                    reporter,
                    middleware::report_internal_errors,
                ))
                .layer(Extension(services.authenticator.clone()))
                .layer(Extension(services.state.clone())),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn serve(
    port: u16,
    services: &Services,
    mut shutdown: mpsc::UnboundedReceiver<()>,
) -> Result<()> {
    let app = app(services, Arc::new(middleware::LogErrorReporter));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.recv().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
