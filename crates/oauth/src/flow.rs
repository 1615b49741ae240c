use std::sync::Arc;

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::RngCore,
    tracing::{info, warn},
    url::Url,
};

use crate::{
    error::Error,
    exchange::TokenExchangeClient,
    storage::CredentialStore,
    types::{Credential, OAuthConfig},
};

/// Where to send the user, and the `state` to expect back on the redirect.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Generate a random state parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Pull the authorization code out of a login redirect.
///
/// Fails when the redirect does not target `redirect_uri`, carries an OAuth
/// `error`, has a `state` other than `expected_state`, or has no `code`.
pub fn authorization_code(
    redirect: &str,
    redirect_uri: &str,
    expected_state: Option<&str>,
) -> Result<String, Error> {
    if !redirect.starts_with(redirect_uri) {
        return Err(Error::LoginFailed(format!(
            "redirect does not match {redirect_uri}"
        )));
    }
    let url = Url::parse(redirect)
        .map_err(|e| Error::LoginFailed(format!("invalid redirect URI: {e}")))?;

    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };

    if let Some(error) = param("error") {
        let detail = param("error_description")
            .map(|d| format!(": {d}"))
            .unwrap_or_default();
        return Err(Error::LoginFailed(format!(
            "authorization denied ({error}){detail}"
        )));
    }

    if let Some(expected) = expected_state
        && param("state").as_deref() != Some(expected)
    {
        return Err(Error::LoginFailed("state mismatch in redirect".into()));
    }

    param("code")
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::LoginFailed("redirect is missing the code parameter".into()))
}

/// First login: browser authorization followed by the code exchange.
///
/// Does not go through the refresh coordinator. Success seeds the store;
/// failure leaves it untouched.
#[derive(Clone)]
pub struct LoginFlow {
    config: Arc<OAuthConfig>,
    exchange: Arc<dyn TokenExchangeClient>,
    store: Arc<CredentialStore>,
}

impl LoginFlow {
    pub fn new(
        config: Arc<OAuthConfig>,
        exchange: Arc<dyn TokenExchangeClient>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            config,
            exchange,
            store,
        }
    }

    /// Build the login page URL.
    pub fn start(&self) -> Result<AuthorizationRequest, Error> {
        let auth_url = self
            .config
            .auth_url
            .as_deref()
            .ok_or_else(|| Error::LoginFailed("no authorization URL configured".into()))?;
        let mut url = Url::parse(auth_url)
            .map_err(|e| Error::LoginFailed(format!("invalid authorization URL: {e}")))?;
        let state = generate_state();

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri);
            if !self.config.scopes.is_empty() {
                query.append_pair("scope", &self.config.scopes.join(" "));
            }
            query.append_pair("state", &state);
        }

        Ok(AuthorizationRequest {
            url: url.into(),
            state,
        })
    }

    /// Finish the login from the redirect the presentation layer received.
    pub async fn complete(
        &self,
        redirect: &str,
        expected_state: Option<&str>,
    ) -> Result<Arc<Credential>, Error> {
        let code = authorization_code(redirect, &self.config.redirect_uri, expected_state)
            .inspect_err(|e| warn!(error = %e, "rejecting login redirect"))?;

        let credential = self
            .exchange
            .exchange_authorization_code(&code, &self.config)
            .await
            .map_err(|e| {
                warn!(error = %e, "authorization code exchange failed");
                Error::LoginFailed(e.to_string())
            })?;

        let credential = self.store.set(credential)?;
        info!(expires_at = ?credential.expires_at(), "logged in");
        Ok(credential)
    }
}
