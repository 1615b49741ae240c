//! Token endpoint calls: `authorization_code` and `refresh_token` grants.

use {
    async_trait::async_trait,
    reqwest::{StatusCode, header::ACCEPT},
    secrecy::ExposeSecret,
    tracing::{debug, warn},
};

use crate::types::{Credential, OAuthConfig, OAuthErrorBody, TokenResponse, now_secs};

/// How a failed exchange should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network trouble, timeouts, 408/429/5xx. Safe to try again later.
    Retryable,
    /// The server refused the grant (invalid_grant, revoked, bad client).
    Terminal,
    /// 200 but the body is not a usable token.
    Malformed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error(
        "token endpoint returned HTTP {status}: {}{}",
        .error.as_deref().unwrap_or("no error code"),
        .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
    )]
    Rejected {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },

    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Build from a non-200 response, capturing the OAuth error body if present.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<OAuthErrorBody>(body).ok();
        Self::Rejected {
            status,
            error: parsed.as_ref().map(|b| b.error.clone()),
            description: parsed.and_then(|b| b.error_description),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Retryable,
            Self::Malformed(_) => FailureKind::Malformed,
            Self::Rejected { status, .. } => match *status {
                408 | 429 => FailureKind::Retryable,
                s if s >= 500 => FailureKind::Retryable,
                _ => FailureKind::Terminal,
            },
        }
    }

    /// OAuth `error` code, when the server sent one.
    pub fn oauth_error(&self) -> Option<&str> {
        match self {
            Self::Rejected { error, .. } => error.as_deref(),
            _ => None,
        }
    }
}

/// The two network operations against the token endpoint. Stateless.
#[async_trait]
pub trait TokenExchangeClient: Send + Sync {
    async fn exchange_authorization_code(
        &self,
        code: &str,
        config: &OAuthConfig,
    ) -> Result<Credential, ExchangeError>;

    /// A response without a new refresh token keeps `refresh_token`.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        config: &OAuthConfig,
    ) -> Result<Credential, ExchangeError>;
}

#[derive(Clone, Copy)]
enum Grant<'a> {
    AuthorizationCode(&'a str),
    RefreshToken(&'a str),
}

impl Grant<'_> {
    fn grant_type(&self) -> &'static str {
        match self {
            Self::AuthorizationCode(_) => "authorization_code",
            Self::RefreshToken(_) => "refresh_token",
        }
    }
}

/// Form-encoded `POST` to `config.token_url` over reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTokenExchange {
    client: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn request(
        &self,
        config: &OAuthConfig,
        grant: Grant<'_>,
    ) -> Result<Credential, ExchangeError> {
        let (field, value, previous_refresh) = match grant {
            Grant::AuthorizationCode(code) => ("code", code, None),
            Grant::RefreshToken(token) => ("refresh_token", token, Some(token)),
        };
        let form = [
            (field, value),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret().as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("grant_type", grant.grant_type()),
        ];

        debug!(grant_type = grant.grant_type(), url = %config.token_url, "requesting token");

        let resp = self
            .client
            .post(&config.token_url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if status != StatusCode::OK {
            let err = ExchangeError::from_status(status.as_u16(), &body);
            warn!(grant_type = grant.grant_type(), status = status.as_u16(), error = %err, "token request rejected");
            return Err(err);
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| ExchangeError::Malformed(e.to_string()))?;
        Credential::from_token_response(token, now_secs(), previous_refresh)
            .map_err(|e| ExchangeError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TokenExchangeClient for HttpTokenExchange {
    async fn exchange_authorization_code(
        &self,
        code: &str,
        config: &OAuthConfig,
    ) -> Result<Credential, ExchangeError> {
        self.request(config, Grant::AuthorizationCode(code)).await
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        config: &OAuthConfig,
    ) -> Result<Credential, ExchangeError> {
        self.request(config, Grant::RefreshToken(refresh_token))
            .await
    }
}

#[cfg(test)]
mod tests {
    use {mockito::Matcher, secrecy::Secret};

    use super::*;

    fn config(base: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "client-1".into(),
            client_secret: Secret::new("shh".into()),
            auth_url: None,
            token_url: format!("{base}/oauth/token"),
            redirect_uri: "keyward://oauth".into(),
            scopes: vec![],
        }
    }

    fn form(pairs: &[(&str, &str)]) -> Matcher {
        Matcher::AllOf(
            pairs
                .iter()
                .map(|(k, v)| Matcher::UrlEncoded((*k).into(), (*v).into()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn authorization_code_exchange() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(form(&[
                ("code", "abc123"),
                ("client_id", "client-1"),
                ("client_secret", "shh"),
                ("redirect_uri", "keyward://oauth"),
                ("grant_type", "authorization_code"),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"A1","refresh_token":"R1","token_type":"bearer","expires_in":3600}"#)
            .create_async()
            .await;

        let cred = HttpTokenExchange::default()
            .exchange_authorization_code("abc123", &config(&server.url()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(cred.access_token(), "A1");
        assert_eq!(cred.refresh_token(), "R1");
        assert_eq!(cred.token_type(), "Bearer");
        assert!(cred.expires_at().unwrap() >= now_secs() + 3500);
    }

    #[tokio::test]
    async fn refresh_exchange_keeps_refresh_token_when_not_rotated() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(form(&[("refresh_token", "R1"), ("grant_type", "refresh_token")]))
            .with_status(200)
            .with_body(r#"{"access_token":"A2","token_type":"Bearer","scope":"read"}"#)
            .create_async()
            .await;

        let cred = HttpTokenExchange::default()
            .exchange_refresh_token("R1", &config(&server.url()))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(cred.access_token(), "A2");
        assert_eq!(cred.refresh_token(), "R1");
        assert_eq!(cred.scope(), Some("read"));
    }

    #[tokio::test]
    async fn invalid_grant_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#)
            .create_async()
            .await;

        let err = HttpTokenExchange::default()
            .exchange_refresh_token("R1", &config(&server.url()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Terminal);
        assert_eq!(err.oauth_error(), Some("invalid_grant"));
        assert!(err.to_string().contains("refresh token revoked"));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(503)
            .with_body("upstream down")
            .create_async()
            .await;

        let err = HttpTokenExchange::default()
            .exchange_refresh_token("R1", &config(&server.url()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Retryable);
        assert_eq!(err.oauth_error(), None);
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body("<html>login</html>")
            .create_async()
            .await;

        let err = HttpTokenExchange::default()
            .exchange_authorization_code("abc", &config(&server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Malformed);
    }

    #[tokio::test]
    async fn empty_access_token_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"","refresh_token":"R1","token_type":"bearer"}"#)
            .create_async()
            .await;

        let err = HttpTokenExchange::default()
            .exchange_authorization_code("abc", &config(&server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Malformed);
    }

    #[tokio::test]
    async fn token_unusable_as_header_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A2\nX","refresh_token":"R2","token_type":"Bearer"}"#)
            .create_async()
            .await;

        let err = HttpTokenExchange::default()
            .exchange_refresh_token("R1", &config(&server.url()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Malformed);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let err = HttpTokenExchange::default()
            .exchange_refresh_token("R1", &config("http://127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
        assert_eq!(err.kind(), FailureKind::Retryable);
    }

    #[test]
    fn status_classification() {
        assert_eq!(ExchangeError::from_status(401, "").kind(), FailureKind::Terminal);
        assert_eq!(ExchangeError::from_status(403, "").kind(), FailureKind::Terminal);
        assert_eq!(ExchangeError::from_status(429, "").kind(), FailureKind::Retryable);
        assert_eq!(ExchangeError::from_status(408, "").kind(), FailureKind::Retryable);
        assert_eq!(ExchangeError::from_status(502, "").kind(), FailureKind::Retryable);
    }
}
