use std::time::{SystemTime, UNIX_EPOCH};

use {
    reqwest::header::HeaderValue,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Client registration used for both token exchanges and the login URL.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    /// Browser login page. Only needed to build the authorization URL.
    pub auth_url: Option<String>,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Serialize a `Secret<String>` by exposing its inner value.
pub fn serialize_secret<S: Serializer>(secret: &Secret<String>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(secret.expose_secret())
}

/// Seconds since the unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Uppercase the first character; the `Authorization` header needs `Bearer`, not `bearer`.
pub fn normalize_token_type(token_type: &str) -> String {
    let mut chars = token_type.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Raw `/oauth/token` success body.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<Secret<String>>,
    pub scope: Option<String>,
}

/// Standard OAuth2 error body (`{"error": "invalid_grant", ...}`).
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    pub error_description: Option<String>,
}

/// Why a credential could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCredential {
    #[error("access_token is empty")]
    EmptyAccessToken,
    #[error("refresh_token is missing or empty")]
    MissingRefreshToken,
    #[error("token_type is empty")]
    EmptyTokenType,
    #[error("token_type or access_token is not a valid header value")]
    InvalidHeaderValue,
}

/// One token issuance. Immutable once built; every constructor validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CredentialRecord")]
pub struct Credential {
    #[serde(serialize_with = "serialize_secret")]
    access_token: Secret<String>,
    #[serde(serialize_with = "serialize_secret")]
    refresh_token: Secret<String>,
    token_type: String,
    /// Unix seconds. `None` when the server did not send `expires_in`.
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
    /// Unix seconds the token endpoint answered at; bounds the expiry skew.
    #[serde(skip_serializing_if = "Option::is_none")]
    issued_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct CredentialRecord {
    access_token: Secret<String>,
    refresh_token: Secret<String>,
    token_type: String,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    issued_at: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TryFrom<CredentialRecord> for Credential {
    type Error = InvalidCredential;

    fn try_from(record: CredentialRecord) -> Result<Self, Self::Error> {
        Self::validated(
            record.access_token,
            record.refresh_token,
            &record.token_type,
            record.expires_at,
            record.scope,
        )
        .map(|credential| Self {
            issued_at: record.issued_at,
            ..credential
        })
    }
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        token_type: &str,
        expires_at: Option<u64>,
        scope: Option<String>,
    ) -> Result<Self, InvalidCredential> {
        Self::validated(
            Secret::new(access_token.into()),
            Secret::new(refresh_token.into()),
            token_type,
            expires_at,
            scope,
        )
    }

    /// Build from a token endpoint response issued at `issued_at`.
    ///
    /// A response without `refresh_token` keeps `previous_refresh_token`.
    pub fn from_token_response(
        resp: TokenResponse,
        issued_at: u64,
        previous_refresh_token: Option<&str>,
    ) -> Result<Self, InvalidCredential> {
        let refresh_token = match resp.refresh_token {
            Some(token) if !token.expose_secret().is_empty() => token,
            _ => Secret::new(
                previous_refresh_token
                    .ok_or(InvalidCredential::MissingRefreshToken)?
                    .to_string(),
            ),
        };
        let credential = Self::validated(
            resp.access_token,
            refresh_token,
            &resp.token_type,
            resp.expires_in.map(|secs| issued_at.saturating_add(secs)),
            resp.scope.filter(|s| !s.is_empty()),
        )?;
        Ok(Self {
            issued_at: Some(issued_at),
            ..credential
        })
    }

    fn validated(
        access_token: Secret<String>,
        refresh_token: Secret<String>,
        token_type: &str,
        expires_at: Option<u64>,
        scope: Option<String>,
    ) -> Result<Self, InvalidCredential> {
        if access_token.expose_secret().is_empty() {
            return Err(InvalidCredential::EmptyAccessToken);
        }
        if refresh_token.expose_secret().is_empty() {
            return Err(InvalidCredential::MissingRefreshToken);
        }
        let token_type = normalize_token_type(token_type.trim());
        if token_type.is_empty() {
            return Err(InvalidCredential::EmptyTokenType);
        }
        let header = format!("{token_type} {}", access_token.expose_secret());
        if HeaderValue::from_str(&header).is_err() {
            return Err(InvalidCredential::InvalidHeaderValue);
        }
        Ok(Self {
            access_token,
            refresh_token,
            token_type,
            expires_at,
            issued_at: None,
            scope,
        })
    }

    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    pub fn refresh_token(&self) -> &str {
        self.refresh_token.expose_secret()
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Value for the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.expose_secret())
    }

    /// Whether `other` comes from the same issuance (same access token).
    pub fn same_token(&self, other: &Credential) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
    }

    /// Expired at `now`, treating the last `skew_secs` before expiry as expired.
    /// A credential without expiry information never expires proactively.
    ///
    /// The skew never exceeds half the token's lifetime, so a token issued
    /// with a lifetime shorter than `skew_secs` is still usable for a while.
    pub fn is_expired_at(&self, now: u64, skew_secs: u64) -> bool {
        let Some(at) = self.expires_at else {
            return false;
        };
        let skew = match self.issued_at {
            Some(issued) => skew_secs.min(at.saturating_sub(issued) / 2),
            None => skew_secs,
        };
        now.saturating_add(skew) >= at
    }

    pub fn is_expired(&self, skew_secs: u64) -> bool {
        self.is_expired_at(now_secs(), skew_secs)
    }
}
