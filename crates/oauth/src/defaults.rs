use {
    anyhow::{Context, Result},
    keyward_config::OAuthSection,
    secrecy::Secret,
};

use crate::types::OAuthConfig;

/// Resolve the client registration for the API.
///
/// Priority:
/// 1. Environment variables (`KEYWARD_OAUTH_CLIENT_ID`, `..._CLIENT_SECRET`,
///    `..._AUTH_URL`, `..._TOKEN_URL`, `..._REDIRECT_URI`)
/// 2. The `[oauth]` section of the config file
///
/// `token_url` falls back to `{base_url}/oauth/token`.
pub fn load_oauth_config(section: &OAuthSection) -> Result<OAuthConfig> {
    resolve(section, |name| std::env::var(name).ok())
}

fn resolve(section: &OAuthSection, env: impl Fn(&str) -> Option<String>) -> Result<OAuthConfig> {
    let pick = |var: &str, file: Option<String>| env(&format!("KEYWARD_OAUTH_{var}")).or(file);

    let client_id = pick("CLIENT_ID", section.client_id.clone())
        .context("missing oauth.client_id (or KEYWARD_OAUTH_CLIENT_ID)")?;
    let token_url = pick("TOKEN_URL", section.resolved_token_url())
        .context("missing oauth.token_url or oauth.base_url (or KEYWARD_OAUTH_TOKEN_URL)")?;
    let redirect_uri = pick("REDIRECT_URI", section.redirect_uri.clone())
        .context("missing oauth.redirect_uri (or KEYWARD_OAUTH_REDIRECT_URI)")?;
    url::Url::parse(&token_url).with_context(|| format!("invalid token URL: {token_url}"))?;

    Ok(OAuthConfig {
        client_id,
        client_secret: Secret::new(
            pick("CLIENT_SECRET", section.client_secret.clone()).unwrap_or_default(),
        ),
        auth_url: pick("AUTH_URL", section.auth_url.clone()),
        token_url,
        redirect_uri,
        scopes: section.scopes.clone(),
    })
}
