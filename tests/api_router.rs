mod common;

use anyhow::{Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use chrono::Utc;
use common::Fixture;
use portcullis::{
    api::{self, middleware::ErrorReporter},
    ids::{self, IdKind},
    keys::TokenClass,
    token::jwks::Jwk,
};
use p256::{ecdsa::VerifyingKey, pkcs8::DecodePublicKey};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingReporter(Mutex<Vec<(String, String)>>);

impl ErrorReporter for RecordingReporter {
    fn report(&self, route: &str, error: &anyhow::Error) {
        if let Ok(mut reports) = self.0.lock() {
            reports.push((route.to_string(), format!("{error:#}")));
        }
    }
}

struct Harness {
    fixture: Fixture,
    reporter: Arc<RecordingReporter>,
    app: Router,
}

async fn harness() -> Result<Harness> {
    let fixture = Fixture::new(Utc::now()).await?;
    let reporter = Arc::new(RecordingReporter::default());
    let app = api::app(&fixture.services, reporter.clone());
    Ok(Harness {
        fixture,
        reporter,
        app,
    })
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))?,
        None => request.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

fn str_field<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing {field} in {value}"))
}

#[tokio::test]
async fn health_reports_the_store() -> Result<()> {
    let h = harness().await?;
    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-app"));
    assert!(response.headers().contains_key("x-request-id"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["database"], "ok");
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    Ok(())
}

#[tokio::test]
async fn request_ids_are_propagated() -> Result<()> {
    let h = harness().await?;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-123")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
    Ok(())
}

#[tokio::test]
async fn sign_in_over_http() -> Result<()> {
    let h = harness().await?;
    let project_id = ids::format(IdKind::Project, h.fixture.project.id);

    let (status, started) = call(
        &h.app,
        Method::POST,
        "/v1/signin/start",
        None,
        Some(json!({ "project_id": project_id, "email": "alice@example.com" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["state"], "email_challenge_issued");
    let intermediate = str_field(&started, "intermediate_session_token")?.to_string();
    let challenge_id = str_field(&started, "email_verification_challenge_id")?.to_string();
    let code = h.fixture.outbox.last()?.code;

    let verify = json!({ "email_verification_challenge_id": challenge_id, "code": code });
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/v1/signin/verify-email",
        Some(&intermediate),
        Some(verify.clone()),
    )
    .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/signin/verify-email",
        Some(&intermediate),
        Some(verify),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "challenge already completed");

    let organization_id = ids::format(IdKind::Organization, h.fixture.organization.id);
    let (status, issued) = call(
        &h.app,
        Method::POST,
        "/v1/signin/exchange",
        Some(&intermediate),
        Some(json!({ "organization_id": organization_id })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let access_token = str_field(&issued, "access_token")?.to_string();
    let refresh_token = str_field(&issued, "refresh_token")?.to_string();

    let (status, me) = call(&h.app, Method::GET, "/v1/me", Some(&access_token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["type"], "session");
    assert_eq!(me["session_id"], issued["session_id"]);
    assert_eq!(me["organization_id"], organization_id.as_str());

    // The intermediate bearer is not a session credential.
    let (status, _) = call(&h.app, Method::GET, "/v1/me", Some(&intermediate), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, refreshed) = call(
        &h.app,
        Method::POST,
        "/v1/sessions/refresh",
        None,
        Some(json!({ "refresh_token": refresh_token })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(str_field(&refreshed, "access_token").is_ok());

    h.fixture.store.revoke_session(ids::parse_as(
        IdKind::Session,
        str_field(&issued, "session_id")?,
    )?)?;
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/v1/sessions/refresh",
        None,
        Some(json!({ "refresh_token": refresh_token })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn protected_routes_need_a_credential() -> Result<()> {
    let h = harness().await?;
    let (status, body) = call(&h.app, Method::GET, "/v1/me", None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "unauthenticated" }));

    let (status, _) = call(
        &h.app,
        Method::GET,
        "/v1/me",
        Some("portcullis_secret_key_bm9wZQ"),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn jwks_serves_session_keys_only() -> Result<()> {
    let h = harness().await?;
    let uri = format!(
        "/v1/projects/{}/jwks.json",
        ids::format(IdKind::Project, h.fixture.project.id)
    );
    let (status, jwks) = call(&h.app, Method::GET, &uri, None, None).await?;
    assert_eq!(status, StatusCode::OK);

    let keys = jwks["keys"]
        .as_array()
        .ok_or_else(|| anyhow!("no keys in {jwks}"))?;
    assert_eq!(keys.len(), 1);
    assert!(str_field(&keys[0], "kid")?.starts_with("session_signing_key_"));
    assert_eq!(keys[0]["crv"], "P-256");
    let served: Jwk = serde_json::from_value(keys[0].clone())?;
    let current = h
        .fixture
        .keys()
        .get_current_signing_key(h.fixture.project.id, TokenClass::Session, Utc::now())
        .await?
        .ok_or_else(|| anyhow!("no session key"))?;
    assert_eq!(
        served.to_verifying_key()?,
        VerifyingKey::from_public_key_der(&current.public_key)
            .map_err(|err| anyhow!("bad public key: {err}"))?
    );

    let (status, _) = call(
        &h.app,
        Method::GET,
        "/v1/projects/org_nope/jwks.json",
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn internal_errors_are_opaque_and_reported() -> Result<()> {
    let h = harness().await?;
    // A project without signing keys cannot issue intermediate tokens.
    let keyless = common::project(true, Utc::now());
    h.fixture.store.insert_project(keyless.clone())?;

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/signin/start",
        None,
        Some(json!({
            "project_id": ids::format(IdKind::Project, keyless.id),
            "email": "alice@example.com",
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "internal error" }));

    let reports = h
        .reporter
        .0
        .lock()
        .map_err(|_| anyhow!("Poisoned lock"))?
        .clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "/v1/signin/start");
    assert!(reports[0].1.contains("signing key"));
    Ok(())
}

#[test]
fn openapi_documents_every_route() {
    let doc = api::openapi();
    for path in [
        "/health",
        "/v1/signin/start",
        "/v1/signin/verify-email",
        "/v1/signin/exchange",
        "/v1/sessions/refresh",
        "/v1/projects/{project_id}/jwks.json",
        "/v1/me",
    ] {
        assert!(doc.paths.paths.contains_key(path), "missing {path}");
    }
}
