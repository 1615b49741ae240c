//! Single-flight access token refresh.
//!
//! Any number of requests may discover that their access token was rejected
//! at the same time. They all call [`RefreshCoordinator::refresh`] with the
//! credential they used; callers that observed the same credential share one
//! `refresh_token` exchange, and callers whose view is already stale get the
//! newer stored credential back without any network call. Many servers
//! invalidate a refresh token on first use, so a second concurrent redeem
//! would fail and end the session.
//!
//! The exchange runs on its own task and commits its result to the store even
//! if every waiter has gone away.

use std::{panic::AssertUnwindSafe, sync::Arc};

#[cfg(feature = "metrics")]
use std::time::Instant;

use {
    futures::{
        FutureExt,
        future::{BoxFuture, Shared},
    },
    tokio::sync::Mutex,
    tracing::{debug, error, info, warn},
};

use crate::{
    error::Error,
    exchange::{FailureKind, TokenExchangeClient},
    storage::CredentialStore,
    types::{Credential, OAuthConfig},
};

type RefreshResult = Result<Arc<Credential>, Error>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

enum State {
    Idle,
    Refreshing {
        snapshot: Arc<Credential>,
        result: SharedRefresh,
    },
}

struct Inner {
    store: Arc<CredentialStore>,
    exchange: Arc<dyn TokenExchangeClient>,
    config: Arc<OAuthConfig>,
    state: Mutex<State>,
}

/// Cheap to clone; clones share the same in-flight state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        exchange: Arc<dyn TokenExchangeClient>,
        config: Arc<OAuthConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                exchange,
                config,
                state: Mutex::new(State::Idle),
            }),
        }
    }

    /// Obtain a credential newer than `observed`.
    ///
    /// Errors: `LoginRequired` when the store is empty, `TerminalGrantFailure`
    /// when the refresh token was rejected (the store is cleared),
    /// `TransientNetworkFailure` / `MalformedServerResponse` with the store
    /// untouched, `Storage` when persisting the new credential failed.
    pub async fn refresh(&self, observed: &Credential) -> RefreshResult {
        let pending = {
            let mut state = self.inner.state.lock().await;
            if let State::Refreshing { snapshot, result } = &*state {
                if snapshot.same_token(observed) {
                    debug!("joining in-flight token refresh");
                    #[cfg(feature = "metrics")]
                    metrics::counter!("oauth_refresh_joined_total").increment(1);
                    result.clone()
                } else if let Some(current) = self.newer_than(observed) {
                    return Ok(current);
                } else {
                    result.clone()
                }
            } else {
                let Some(snapshot) = self.inner.store.get() else {
                    debug!("refresh requested while logged out");
                    return Err(Error::LoginRequired);
                };
                if !snapshot.same_token(observed) {
                    debug!("credential already refreshed, skipping exchange");
                    return Ok(snapshot);
                }
                let result = self.spawn_exchange(Arc::clone(&snapshot));
                *state = State::Refreshing {
                    snapshot,
                    result: result.clone(),
                };
                result
            }
        };
        pending.await
    }

    /// Whether a refresh exchange is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.inner.state.lock().await, State::Refreshing { .. })
    }

    /// The stored credential, if the store already moved past `observed`.
    fn newer_than(&self, observed: &Credential) -> Option<Arc<Credential>> {
        let current = self.inner.store.get()?;
        if current.same_token(observed) {
            return None;
        }
        debug!("credential already refreshed, skipping exchange");
        Some(current)
    }

    fn spawn_exchange(&self, snapshot: Arc<Credential>) -> SharedRefresh {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(inner.run_exchange(&snapshot))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!("token refresh panicked");
                    Err(Error::TransientNetworkFailure("token refresh panicked".into()))
                });
            // The store is settled before any caller can observe `Idle`.
            *inner.state.lock().await = State::Idle;
            outcome
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(Error::TransientNetworkFailure(format!(
                    "token refresh task failed: {e}"
                )))
            })
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn run_exchange(&self, snapshot: &Arc<Credential>) -> RefreshResult {
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        debug!("refreshing access token");
        let outcome = match self
            .exchange
            .exchange_refresh_token(snapshot.refresh_token(), &self.config)
            .await
        {
            Ok(fresh) => self.commit(snapshot, fresh),
            Err(err) => match err.kind() {
                FailureKind::Terminal => {
                    warn!(error = %err, "refresh token rejected, ending session");
                    if let Err(e) = self.store.compare_and_swap(snapshot, None) {
                        error!(error = %e, "failed to persist logout after rejected refresh");
                    }
                    Err(Error::TerminalGrantFailure(err.to_string()))
                },
                FailureKind::Retryable => {
                    warn!(error = %err, "token refresh failed, keeping current credential");
                    Err(Error::TransientNetworkFailure(err.to_string()))
                },
                FailureKind::Malformed => {
                    warn!(error = %err, "token endpoint sent an unusable refresh response");
                    Err(Error::MalformedServerResponse(err.to_string()))
                },
            },
        };

        #[cfg(feature = "metrics")]
        {
            let label = match &outcome {
                Ok(_) => "success",
                Err(Error::TerminalGrantFailure(_)) => "terminal",
                Err(Error::TransientNetworkFailure(_)) => "transient",
                Err(Error::MalformedServerResponse(_)) => "malformed",
                Err(_) => "other",
            };
            metrics::counter!("oauth_refresh_total", "outcome" => label).increment(1);
            metrics::histogram!("oauth_refresh_duration_seconds")
                .record(started.elapsed().as_secs_f64());
        }

        outcome
    }

    /// Swap the fresh credential in, unless a logout or a new login replaced
    /// the snapshot while the exchange was running; the newer state wins then.
    fn commit(&self, snapshot: &Credential, fresh: Credential) -> RefreshResult {
        let fresh = Arc::new(fresh);
        match self.store.compare_and_swap(snapshot, Some(Arc::clone(&fresh))) {
            Ok(true) => {
                info!(expires_at = ?fresh.expires_at(), "access token refreshed");
                Ok(fresh)
            },
            Ok(false) => match self.store.get() {
                Some(current) => {
                    debug!("store changed during refresh, discarding refreshed token");
                    Ok(current)
                },
                None => {
                    info!("logged out during refresh, discarding refreshed token");
                    Err(Error::LoginRequired)
                },
            },
            Err(e) => {
                error!(error = %e, "failed to persist refreshed credential");
                Err(Error::from(e))
            },
        }
    }
}
