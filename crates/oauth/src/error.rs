//! Error taxonomy surfaced to request-sending code.

/// Outcome classes callers react to.
///
/// `Clone` because a single refresh result is handed to every waiter attached
/// to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No credential is stored, or the session ended. The user must log in.
    #[error("login required")]
    LoginRequired,

    /// The authorization-code login did not complete. Stored credentials are untouched.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Network or server hiccup. Nothing was mutated; retry the operation later.
    #[error("transient network failure: {0}")]
    TransientNetworkFailure(String),

    /// The refresh token was rejected (revoked, expired, invalid_grant). The store is cleared.
    #[error("refresh token rejected: {0}")]
    TerminalGrantFailure(String),

    /// The token endpoint answered with something that is not a usable token.
    #[error("malformed server response: {0}")]
    MalformedServerResponse(String),

    /// The API rejected the request again after a successful refresh.
    #[error("request still unauthorized after refreshing the access token")]
    AuthorizationRejected,

    /// The persistence backend failed. The in-memory credential is already updated.
    #[error("credential storage failed: {0}")]
    Storage(String),
}

impl Error {
    /// Whether retrying the whole operation later can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetworkFailure(_) | Self::Storage(_))
    }

    /// Whether the presentation layer should send the user back to the login page.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::LoginRequired | Self::TerminalGrantFailure(_))
    }
}

impl From<crate::storage::StoreError> for Error {
    fn from(err: crate::storage::StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
