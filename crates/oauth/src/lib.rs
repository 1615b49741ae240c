//! OAuth2 credential lifecycle for a single API session.
//!
//! A [`Credential`] lives in a [`CredentialStore`]. Requests go through the
//! [`AuthorizingRequestPipeline`], which attaches the access token and, on a
//! rejected or expired token, asks the [`RefreshCoordinator`] for a new one.
//! The coordinator guarantees at most one refresh exchange in flight.

pub mod coordinator;
pub mod defaults;
pub mod error;
pub mod exchange;
pub mod flow;
pub mod pipeline;
pub mod session;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

pub use {
    coordinator::RefreshCoordinator,
    defaults::load_oauth_config,
    error::{Error, Result},
    exchange::{ExchangeError, FailureKind, HttpTokenExchange, TokenExchangeClient},
    flow::{AuthorizationRequest, LoginFlow, authorization_code, generate_state},
    pipeline::{
        ApiRequest, ApiResponse, AuthorizingRequestPipeline, ReqwestTransport, Transport,
        TransportError,
    },
    session::{Session, SessionStatus},
    storage::{
        CredentialPersistence, CredentialStore, FilePersistence, MemoryPersistence, StoreError,
    },
    types::{Credential, InvalidCredential, OAuthConfig},
};
