//! Fakes shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    reqwest::{StatusCode, header::AUTHORIZATION},
    secrecy::Secret,
    tokio::sync::Semaphore,
};

use crate::{
    exchange::{ExchangeError, TokenExchangeClient},
    storage::{CredentialPersistence, StoreError},
    pipeline::{ApiRequest, ApiResponse, Transport, TransportError},
    types::{Credential, OAuthConfig, TokenResponse, now_secs},
};

pub fn config() -> OAuthConfig {
    OAuthConfig {
        client_id: "client-1".into(),
        client_secret: Secret::new("shh".into()),
        auth_url: Some("https://api.example.com/oauth/authorize".into()),
        token_url: "https://api.example.com/oauth/token".into(),
        redirect_uri: "keyward://oauth".into(),
        scopes: vec!["read".into()],
    }
}

pub fn cred(access: &str, refresh: &str) -> Credential {
    Credential::new(access, refresh, "Bearer", Some(4_000_000_000), None).unwrap()
}

/// Credential issued now with an `expires_in` of `secs`.
pub fn short_lived(access: &str, refresh: &str, secs: u64) -> Credential {
    let resp = TokenResponse {
        access_token: Secret::new(access.into()),
        token_type: "Bearer".into(),
        expires_in: Some(secs),
        refresh_token: Some(Secret::new(refresh.into())),
        scope: None,
    };
    Credential::from_token_response(resp, now_secs(), None).unwrap()
}

/// Scripted token endpoint. Each call pops the next scripted result; when the
/// script is empty, code exchanges answer `A1/R1` and the n-th refresh
/// answers `A{n+1}/R{n+1}`.
/// When gated, every call waits for one permit from [`FakeExchange::release`].
#[derive(Default)]
pub struct FakeExchange {
    refresh_calls: AtomicUsize,
    code_calls: AtomicUsize,
    seen_refresh_tokens: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Result<Credential, ExchangeError>>>,
    gate: Option<Semaphore>,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn then(self, result: Result<Credential, ExchangeError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn code_calls(&self) -> usize {
        self.code_calls.load(Ordering::SeqCst)
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen_refresh_tokens.lock().unwrap().clone()
    }

    async fn next(&self, n: usize) -> Result<Credential, ExchangeError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(cred(&format!("A{}", n + 1), &format!("R{}", n + 1))))
    }
}

#[async_trait]
impl TokenExchangeClient for FakeExchange {
    async fn exchange_authorization_code(
        &self,
        _code: &str,
        _config: &OAuthConfig,
    ) -> Result<Credential, ExchangeError> {
        let n = self.code_calls.fetch_add(1, Ordering::SeqCst);
        self.next(n).await
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        _config: &OAuthConfig,
    ) -> Result<Credential, ExchangeError> {
        self.seen_refresh_tokens
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.next(n + 1).await
    }
}

type Responder = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

/// API stand-in that records the `Authorization` header of every request.
pub struct FakeTransport {
    respond: Box<Responder>,
    seen: Mutex<Vec<Option<String>>>,
}

impl FakeTransport {
    pub fn new(
        respond: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 200 for `Authorization: Bearer <token>`, 401 for anything else.
    pub fn accepting(token: &str) -> Self {
        let expected = format!("Bearer {token}");
        Self::new(move |req| {
            let ok = req
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected);
            Ok(if ok {
                response(StatusCode::OK, "ok")
            } else {
                response(StatusCode::UNAUTHORIZED, "")
            })
        })
    }

    pub fn seen_authorizations(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn sends(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

pub fn response(status: StatusCode, body: &str) -> ApiResponse {
    ApiResponse {
        status,
        headers: Default::default(),
        body: bytes::Bytes::from(body.to_string()),
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let auth = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.seen.lock().unwrap().push(auth);
        (self.respond)(&request)
    }
}

/// Persistence whose every write fails, as with a full or read-only disk.
pub struct FailingPersistence;

impl CredentialPersistence for FailingPersistence {
    fn load(&self) -> Result<Option<Credential>, StoreError> {
        Ok(None)
    }

    fn save(&self, _credential: &Credential) -> Result<(), StoreError> {
        Err(disk_full())
    }

    fn remove(&self) -> Result<(), StoreError> {
        Err(disk_full())
    }
}

fn disk_full() -> StoreError {
    StoreError::Io {
        path: "/keyward/credentials.json".into(),
        source: std::io::Error::other("no space left on device"),
    }
}
