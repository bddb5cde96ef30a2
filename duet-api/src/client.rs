//! HTTP client for the pairing backend.
//!
//! Bearer auth, per-request timeouts, envelope parsing, and a bounded
//! exponential retry for gateway errors and failed connects. Anything else
//! (4xx, 500, decode failures) surfaces on the first attempt.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use duet_core::config::{AppConfig, ServerConfig};
use duet_core::error::{DuetError, DuetResult};

use crate::response::ApiResponse;

/// When and how long to back off between attempts of one request.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first.
    pub max_retries: u32,
    /// Delay before the first retry; doubles after each.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryConfig {
    /// Fail fast: a single attempt per request.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << retry.min(16))
            .min(self.max_delay)
    }

    fn is_transient_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        )
    }
}

/// Outcome of one attempt.
enum Attempt {
    Done(DuetResult<Response>),
    Transient(DuetError),
}

/// Client for the pairing backend's REST API.
///
/// Clones share the connection pool and the access token.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    api_root: String,
    access_token: Arc<RwLock<Option<String>>>,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(config: &ServerConfig) -> DuetResult<Self> {
        let api_root = AppConfig::sanitize_url(&config.api_base_url);
        if api_root.is_empty() {
            return Err(DuetError::MissingConfig("server.api_base_url".into()));
        }

        let http = Client::builder()
            .timeout(Duration::from_millis(config.api_timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| DuetError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_root,
            access_token: Arc::new(RwLock::new(None)),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    /// Install or clear the bearer token sent with every request.
    pub async fn set_access_token(&self, token: Option<String>) {
        let signed_in = token.is_some();
        *self.access_token.write().await = token;
        debug!(signed_in, "access token updated");
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> DuetResult<ApiResponse<T>> {
        let response = self.execute::<()>(Method::GET, path, None).await?;
        Self::parse_response(response).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> DuetResult<ApiResponse<T>> {
        let response = self.execute(Method::PUT, path, Some(body)).await?;
        Self::parse_response(response).await
    }

    pub async fn parse_response<T: DeserializeOwned>(
        response: Response,
    ) -> DuetResult<ApiResponse<T>> {
        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| DuetError::Serialization(format!("unreadable response envelope: {e}")))
    }

    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> DuetResult<Response> {
        let url = self.url(path);
        let mut retry = 0;
        loop {
            debug!("{method} {path}");
            let err = match self.attempt(method.clone(), &url, body).await {
                Attempt::Done(result) => return result,
                Attempt::Transient(err) => err,
            };
            if retry >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.delay(retry);
            retry += 1;
            warn!(
                "{method} {path} failed ({err}); retry {retry}/{} in {delay:?}",
                self.retry.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Attempt {
        let mut request = self.http.request(method, url);
        if let Some(token) = self.access_token.read().await.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) if RetryConfig::is_transient_status(response.status()) => {
                let status = response.status().as_u16();
                Attempt::Transient(DuetError::ServerError {
                    status,
                    message: format!("gateway returned {status}"),
                })
            }
            Ok(response) => Attempt::Done(Self::check_status(response).await),
            Err(e) if e.is_connect() || e.is_timeout() => Attempt::Transient(Self::classify_error(e)),
            Err(e) => Attempt::Done(Err(Self::classify_error(e))),
        }
    }

    async fn check_status(response: Response) -> DuetResult<Response> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(DuetError::AuthFailed(format!("server returned {status}")))
            }
            s if s.is_client_error() || s.is_server_error() => Err(DuetError::ServerError {
                status: s.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(response),
        }
    }

    fn classify_error(e: reqwest::Error) -> DuetError {
        if e.is_timeout() {
            DuetError::Timeout(e.to_string())
        } else if e.is_connect() {
            DuetError::Http(format!("connection failed: {e}"))
        } else if e.is_decode() {
            DuetError::Serialization(e.to_string())
        } else {
            DuetError::Http(e.to_string())
        }
    }
}
