/// Config schema types (oauth client registration, refresh tuning, storage).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub oauth: OAuthSection,
    pub refresh: RefreshSection,
    pub storage: StorageSection,
}

/// OAuth client registration for the protected API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSection {
    /// API base URL. Used to derive `token_url` when that is not set.
    pub base_url: Option<String>,

    /// Browser login page the user is sent to.
    pub auth_url: Option<String>,

    /// Token endpoint. Defaults to `{base_url}/oauth/token`.
    pub token_url: Option<String>,

    pub client_id: Option<String>,

    /// Client secret. Prefer `${ENV_VAR}` substitution over a literal value.
    pub client_secret: Option<String>,

    /// Redirect URI registered with the server (usually an app deep link).
    pub redirect_uri: Option<String>,

    pub scopes: Vec<String>,
}

impl OAuthSection {
    /// Explicit `token_url`, or the conventional endpoint under `base_url`.
    pub fn resolved_token_url(&self) -> Option<String> {
        self.token_url.clone().or_else(|| {
            self.base_url
                .as_deref()
                .map(|base| format!("{}/oauth/token", base.trim_end_matches('/')))
        })
    }
}

/// Refresh tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    /// Treat a credential as expired this many seconds before `expires_at`.
    pub expiry_skew_secs: u64,

    /// Timeout applied to token endpoint and API calls.
    pub request_timeout_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            expiry_skew_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

/// Where the credential record is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Credential file. Defaults to `~/.keyward/credentials.json`.
    pub path: Option<PathBuf>,

    /// Key of the active session inside the credential file.
    pub session: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: None,
            session: "default".into(),
        }
    }
}

impl StorageSection {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("credentials.json"))
    }
}
