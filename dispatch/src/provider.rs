//! The analysis provider collaborator.
//!
//! The dispatcher is agnostic to which concrete provider performs the
//! analysis; it only sees the [`AnalysisProvider`] call-and-parse contract.
//! [`HttpAnalysisProvider`] is the production implementation, speaking JSON
//! over an adaptively sized connection pool.

use crate::config::HttpConfig;
use crate::metrics_defs::{POOL_IN_FLIGHT, POOL_RESIZED};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shared::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Provider-specific throttle header carrying a delay in milliseconds.
/// Preferred over the standard `Retry-After` when both are present.
const RETRY_AFTER_MS_HEADER: &str = "retry-after-ms";

const IN_FLIGHT_EMA_ALPHA: f64 = 0.3;

/// Abstract analysis collaborator invoked by the retrying dispatcher.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Failures surfaced by a provider call.
///
/// `Clone` so a settled error can be shared with every de-duplicated caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider throttled the request")]
    Throttled { retry_after: Option<Duration> },

    #[error("provider unavailable")]
    Unavailable { retry_after: Option<Duration> },

    #[error("provider request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Whether another attempt could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Throttled { .. }
            | ProviderError::Unavailable { .. }
            | ProviderError::Timeout
            | ProviderError::Transport(_) => true,
            ProviderError::Status { status } => *status >= 500,
            ProviderError::MalformedResponse(_) => false,
        }
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    analysis: String,
}

/// Shared outbound HTTP client whose connection pool is resized from a
/// rolling average of concurrent in-flight requests.
///
/// Swapping in a rebuilt client never drops requests in flight: they hold
/// clones of the previous client, whose pool drains as they complete.
pub struct ClientPool {
    config: HttpConfig,
    client: RwLock<reqwest::Client>,
    in_flight: AtomicUsize,
    state: Mutex<PoolState>,
}

struct PoolState {
    ema: f64,
    pool_size: usize,
    last_resize: Instant,
}

impl ClientPool {
    pub fn new(config: HttpConfig) -> Result<Arc<Self>, ProviderError> {
        let client = Self::build_client(&config, config.max_sockets)?;
        let pool_size = config.max_sockets;
        Ok(Arc::new(ClientPool {
            config,
            client: RwLock::new(client),
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(PoolState {
                ema: 0.0,
                pool_size,
                last_resize: Instant::now(),
            }),
        }))
    }

    fn build_client(config: &HttpConfig, max_idle: usize) -> Result<reqwest::Client, ProviderError> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(max_idle)
            .timeout(config.timeout())
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.read().clone()
    }

    /// Tracks one in-flight request and folds the current concurrency into
    /// the rolling average.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(POOL_IN_FLIGHT).set(current as f64);
        {
            let mut state = self.state.lock();
            state.ema = IN_FLIGHT_EMA_ALPHA * current as f64
                + (1.0 - IN_FLIGHT_EMA_ALPHA) * state.ema;
        }
        InFlightGuard {
            pool: Arc::clone(self),
        }
    }

    /// Rebuilds the client with a pool size derived from the in-flight
    /// average, at most once per resize interval.
    pub fn maybe_resize(&self) {
        let desired = {
            let mut state = self.state.lock();
            let interval = Duration::from_secs(self.config.pool_resize_interval_secs);
            if state.last_resize.elapsed() < interval {
                return;
            }
            state.last_resize = Instant::now();

            // Twice the average concurrency, bounded to the configured band
            let desired = ((state.ema.ceil() as usize) * 2)
                .clamp(self.config.free_sockets.max(1), self.config.max_sockets);
            if desired == state.pool_size {
                return;
            }
            state.pool_size = desired;
            desired
        };

        match Self::build_client(&self.config, desired) {
            Ok(client) => {
                *self.client.write() = client;
                counter!(POOL_RESIZED).increment(1);
                tracing::debug!(pool_size = desired, "resized outbound connection pool");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to rebuild HTTP client, keeping previous pool");
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

pub struct InFlightGuard {
    pool: Arc<ClientPool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let remaining = self.pool.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(POOL_IN_FLIGHT).set(remaining as f64);
    }
}

/// JSON-over-HTTP provider implementation.
pub struct HttpAnalysisProvider {
    config: HttpConfig,
    pool: Arc<ClientPool>,
}

impl HttpAnalysisProvider {
    pub fn new(config: HttpConfig) -> Result<Self, ProviderError> {
        let pool = ClientPool::new(config.clone())?;
        Ok(HttpAnalysisProvider { config, pool })
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisProvider {
    async fn analyze(&self, prompt: &str) -> Result<String, ProviderError> {
        let _guard = self.pool.track();
        let client = self.pool.client();

        let body = AnalyzeRequest {
            model: &self.config.model,
            prompt,
            max_tokens: self.config.max_tokens,
        };
        let mut request = client.post(&self.config.endpoint).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transport(err.to_string())
            }
        });
        self.pool.maybe_resize();
        let response = response?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            return Err(match status.as_u16() {
                429 => ProviderError::Throttled { retry_after },
                502 | 503 | 504 => ProviderError::Unavailable { retry_after },
                code => ProviderError::Status { status: code },
            });
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;
        if parsed.analysis.is_empty() {
            return Err(ProviderError::MalformedResponse("empty analysis".into()));
        }
        Ok(parsed.analysis)
    }
}

/// Extracts a throttle delay from response headers: the provider-specific
/// millisecond header first, then standard `Retry-After` as numeric seconds
/// or an HTTP date.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    if let Some(millis) = headers
        .get(RETRY_AFTER_MS_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_millis(millis));
    }

    let value = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .to_string();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = chrono::DateTime::parse_from_rfc2822(&value).ok()?;
    (date.with_timezone(&chrono::Utc) - chrono::Utc::now())
        .to_std()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioExecutor;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    /// Start a mock HTTP server that responds with a fixed status and body
    async fn start_mock_server(
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    ) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                let headers = headers.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                        let headers = headers.clone();
                        async move {
                            let mut response = Response::builder().status(status);
                            for (name, value) in headers {
                                response = response.header(name, value);
                            }
                            Ok::<_, Infallible>(
                                response.body(Full::new(Bytes::from(body))).unwrap(),
                            )
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        port
    }

    fn provider_for(port: u16) -> HttpAnalysisProvider {
        HttpAnalysisProvider::new(HttpConfig {
            endpoint: format!("http://127.0.0.1:{port}/v1/analyze"),
            timeout_secs: 5,
            ..HttpConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_analyze_parses_successful_response() {
        let port = start_mock_server(StatusCode::OK, vec![], r#"{"analysis":"check the null branch"}"#).await;
        let provider = provider_for(port);

        let analysis = provider.analyze("what happened?").await.unwrap();
        assert_eq!(analysis, "check the null branch");
    }

    #[tokio::test]
    async fn test_analyze_maps_throttle_with_header() {
        let port = start_mock_server(
            StatusCode::TOO_MANY_REQUESTS,
            vec![("retry-after-ms", "250")],
            r#"{"error":"slow down"}"#,
        )
        .await;
        let provider = provider_for(port);

        let err = provider.analyze("prompt").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Throttled {
                retry_after: Some(Duration::from_millis(250))
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_analyze_maps_unavailable() {
        let port = start_mock_server(StatusCode::SERVICE_UNAVAILABLE, vec![("retry-after", "2")], "").await;
        let provider = provider_for(port);

        let err = provider.analyze("prompt").await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Unavailable {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[tokio::test]
    async fn test_analyze_rejects_malformed_body() {
        let port = start_mock_server(StatusCode::OK, vec![], "not json").await;
        let provider = provider_for(port);

        let err = provider.analyze("prompt").await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_retry_after_prefers_millisecond_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after-ms", "1500".parse().unwrap());
        headers.insert("retry-after", "30".parse().unwrap());

        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_millis(1_500))
        );
    }

    #[test]
    fn test_parse_retry_after_numeric_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "30".parse().unwrap());

        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(60);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", future.to_rfc2822().parse().unwrap());

        let delay = parse_retry_after(&headers).unwrap();
        assert!(delay > Duration::from_secs(55) && delay <= Duration::from_secs(60));
    }

    #[test]
    fn test_parse_retry_after_past_date_and_absence() {
        let past = chrono::Utc::now() - chrono::Duration::seconds(60);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", past.to_rfc2822().parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::Status { status: 500 }.is_retryable());
        assert!(!ProviderError::Status { status: 404 }.is_retryable());
        assert!(!ProviderError::MalformedResponse("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_pool_tracks_in_flight_and_resizes_down() {
        let pool = ClientPool::new(HttpConfig {
            max_sockets: 40,
            free_sockets: 2,
            pool_resize_interval_secs: 1,
            ..HttpConfig::default()
        })
        .unwrap();

        {
            let _a = pool.track();
            let _b = pool.track();
            assert_eq!(pool.in_flight(), 2);
        }
        assert_eq!(pool.in_flight(), 0);

        // The average sits near 2, well under the initial 40-socket pool
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        pool.maybe_resize();
        let state = pool.state.lock();
        assert!(state.pool_size < 40, "pool_size = {}", state.pool_size);
        assert!(state.pool_size >= 2);
    }
}
