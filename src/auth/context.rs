use super::credential::ApiKeyFamily;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Who is calling, as established by the dispatcher.
///
/// Handlers read this from the request extensions and never look at the bearer
/// themselves. All ids are formatted ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthContext {
    ApiKey {
        api_key_id: String,
        project_id: String,
        organization_id: Option<String>,
        family: ApiKeyFamily,
    },
    Session {
        session_id: String,
        user_id: String,
        organization_id: String,
        project_id: String,
    },
}

impl AuthContext {
    #[must_use]
    pub fn project_id(&self) -> &str {
        match self {
            Self::ApiKey { project_id, .. } | Self::Session { project_id, .. } => project_id,
        }
    }
}
