//! Inbound credential handling: classify the bearer, authenticate it, hand handlers a
//! typed [`AuthContext`].

pub mod context;
pub mod credential;
pub mod dispatcher;

pub use context::AuthContext;
pub use credential::{ApiKeyFamily, Credential, GeneratedApiKey, generate_api_key};
pub use dispatcher::{AuthError, Authenticator, AuthenticatorConfig, UnauthenticatedCause};
