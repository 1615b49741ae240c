//! One logical session: store, coordinator, pipeline and login flow wired
//! around a single client registration.

use std::{sync::Arc, time::Duration};

use {anyhow::Context, keyward_config::KeywardConfig, tracing::info};

use crate::{
    coordinator::RefreshCoordinator,
    defaults::load_oauth_config,
    error::Error,
    exchange::{HttpTokenExchange, TokenExchangeClient},
    flow::LoginFlow,
    pipeline::{ApiRequest, ApiResponse, AuthorizingRequestPipeline, ReqwestTransport, Transport},
    storage::{CredentialStore, FilePersistence},
    types::{Credential, OAuthConfig, now_secs},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    LoggedOut,
    /// `expires_in_secs` is `None` when the server gave no expiry.
    Active {
        expires_in_secs: Option<u64>,
        scope: Option<String>,
    },
    /// Access token expired; the next request will refresh it.
    Expired,
}

pub struct Session {
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    pipeline: AuthorizingRequestPipeline,
    login: LoginFlow,
}

impl Session {
    /// Build from the loaded config: file-backed store, reqwest transport.
    pub fn from_config(config: &KeywardConfig) -> anyhow::Result<Self> {
        let oauth = load_oauth_config(&config.oauth)?;
        let persistence =
            FilePersistence::new(config.storage.resolved_path(), config.storage.session.clone());
        let store = CredentialStore::open(persistence).context("failed to open credential store")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.refresh.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self::with_parts(
            oauth,
            Arc::new(store),
            Arc::new(HttpTokenExchange::new(client.clone())),
            Arc::new(ReqwestTransport::new(client)),
            config.refresh.expiry_skew_secs,
        ))
    }

    pub fn with_parts(
        config: OAuthConfig,
        store: Arc<CredentialStore>,
        exchange: Arc<dyn TokenExchangeClient>,
        transport: Arc<dyn Transport>,
        expiry_skew_secs: u64,
    ) -> Self {
        let config = Arc::new(config);
        let coordinator =
            RefreshCoordinator::new(Arc::clone(&store), Arc::clone(&exchange), Arc::clone(&config));
        let pipeline =
            AuthorizingRequestPipeline::new(Arc::clone(&store), coordinator.clone(), transport)
                .with_expiry_skew(expiry_skew_secs);
        let login = LoginFlow::new(config, exchange, Arc::clone(&store));
        Self {
            store,
            coordinator,
            pipeline,
            login,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn login(&self) -> &LoginFlow {
        &self.login
    }

    pub fn pipeline(&self) -> &AuthorizingRequestPipeline {
        &self.pipeline
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        self.pipeline.execute(request).await
    }

    /// Refresh now, regardless of expiry.
    pub async fn refresh(&self) -> Result<Arc<Credential>, Error> {
        let current = self.store.get().ok_or(Error::LoginRequired)?;
        self.coordinator.refresh(&current).await
    }

    pub fn logout(&self) -> Result<(), Error> {
        self.store.clear()?;
        info!("logged out");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        let Some(credential) = self.store.get() else {
            return SessionStatus::LoggedOut;
        };
        let now = now_secs();
        if credential.is_expired_at(now, 0) {
            return SessionStatus::Expired;
        }
        SessionStatus::Active {
            expires_in_secs: credential.expires_at().map(|at| at - now),
            scope: credential.scope().map(str::to_string),
        }
    }
}
