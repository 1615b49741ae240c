//! Authorized request execution with one refresh-and-retry on 401.

use std::sync::Arc;

use {
    async_trait::async_trait,
    bytes::Bytes,
    reqwest::{
        Method, StatusCode, Url,
        header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
    },
    serde::{Serialize, de::DeserializeOwned},
    tracing::{debug, info, warn},
};

use crate::{coordinator::RefreshCoordinator, error::Error, storage::CredentialStore, types::Credential};

/// Outbound API request. Kept as plain data so it can be re-sent after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> serde_json::Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The transport-level signal that the presented access token was refused.
    pub fn is_authorization_failure(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends one request on the wire. No auth logic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

/// Attaches the stored credential to requests and recovers from one
/// authorization failure by refreshing through the [`RefreshCoordinator`].
#[derive(Clone)]
pub struct AuthorizingRequestPipeline {
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    transport: Arc<dyn Transport>,
    expiry_skew_secs: u64,
}

impl AuthorizingRequestPipeline {
    pub fn new(
        store: Arc<CredentialStore>,
        coordinator: RefreshCoordinator,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            coordinator,
            transport,
            expiry_skew_secs: 60,
        }
    }

    /// Refresh proactively once a credential is within `secs` of expiring.
    pub fn with_expiry_skew(mut self, secs: u64) -> Self {
        self.expiry_skew_secs = secs;
        self
    }

    /// Send `request` with the current access token.
    ///
    /// At most one refresh happens per call, either proactively for an
    /// expired credential or after a 401. Any non-401 response is returned
    /// as-is, error statuses included.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, Error> {
        let mut credential = self.store.get().ok_or(Error::LoginRequired)?;
        let mut refreshed = false;

        if credential.is_expired(self.expiry_skew_secs) {
            debug!(url = %request.url, "access token expired, refreshing before send");
            match self.refresh(&credential).await {
                Ok(fresh) => {
                    credential = fresh;
                    refreshed = true;
                },
                // Inside the skew window the current token still works.
                Err(e) if e.is_retryable() && !credential.is_expired(0) => {
                    warn!(url = %request.url, error = %e, "proactive refresh failed, sending with current token");
                },
                Err(e) => return Err(e),
            }
        }

        let resp = self.send(request.clone(), &credential).await?;
        if !resp.is_authorization_failure() {
            return Ok(resp);
        }
        if refreshed {
            warn!(url = %request.url, "request unauthorized with a freshly refreshed token");
            return Err(Error::AuthorizationRejected);
        }

        info!(url = %request.url, "access token rejected, refreshing and retrying once");
        let credential = self.refresh(&credential).await?;
        let resp = self.send(request.clone(), &credential).await?;
        if resp.is_authorization_failure() {
            warn!(url = %request.url, "request still unauthorized after refresh");
            return Err(Error::AuthorizationRejected);
        }
        Ok(resp)
    }

    async fn refresh(&self, observed: &Credential) -> Result<Arc<Credential>, Error> {
        self.coordinator
            .refresh(observed)
            .await
            .map_err(|e| match e {
                Error::TerminalGrantFailure(_) => Error::LoginRequired,
                other => other,
            })
    }

    async fn send(&self, mut request: ApiRequest, credential: &Credential) -> Result<ApiResponse, Error> {
        let mut value = HeaderValue::from_str(&credential.authorization_header()).map_err(|_| {
            Error::MalformedServerResponse("access token is not a valid header value".into())
        })?;
        value.set_sensitive(true);
        request.headers.insert(AUTHORIZATION, value);

        debug!(method = %request.method, url = %request.url, "sending authorized request");
        self.transport
            .send(request)
            .await
            .map_err(|e| Error::TransientNetworkFailure(e.to_string()))
    }
}
