//! Network data loading.
//!
//! [`DataLoading`] is callback based: chunks are reported as they arrive and
//! the completion callback fires exactly once, after the last chunk. The
//! default [`DataLoader`] streams responses with `reqwest`.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::LoadError;

pub const DEFAULT_USER_AGENT: &str = concat!("pixflow/", env!("CARGO_PKG_VERSION"));

/// Metadata of the response a chunk belongs to.
#[derive(Debug, Clone)]
pub struct UrlResponse {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    /// `Content-Length` of this response, if the server sent one.
    pub expected_content_length: Option<u64>,
}

impl UrlResponse {
    fn from_response(response: &reqwest::Response) -> Self {
        Self {
            url: response.url().clone(),
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            expected_content_length: response.content_length(),
        }
    }
}

/// The parts of an image request a loader needs.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

impl Cancellable for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }
}

pub type OnChunk = Box<dyn FnMut(Bytes, UrlResponse) + Send>;
pub type OnCompletion = Box<dyn FnOnce(Result<(), LoadError>) + Send>;

pub trait DataLoading: Send + Sync {
    fn load_data(
        &self,
        request: LoadRequest,
        on_chunk: OnChunk,
        on_completion: OnCompletion,
    ) -> Box<dyn Cancellable>;
}

/// Configurable options for the default loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataLoaderConfig {
    /// Overall timeout for the entire HTTP request, zero for none
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            pool_max_idle_per_host: 6,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Default loader: one `reqwest` request per load, streamed chunk by chunk.
#[derive(Clone)]
pub struct DataLoader {
    client: reqwest::Client,
}

impl DataLoader {
    pub fn new(config: &DataLoaderConfig) -> Self {
        Self {
            client: create_client(config),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(
        client: reqwest::Client,
        request: LoadRequest,
        on_chunk: &mut OnChunk,
    ) -> Result<(), LoadError> {
        let scheme = request.url.scheme();
        if !matches!(scheme, "http" | "https") {
            return Err(LoadError::invalid_url(
                request.url.as_str(),
                format!("unsupported scheme `{scheme}`"),
            ));
        }

        let response = client
            .get(request.url.clone())
            .headers(request.headers)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::StatusCodeUnacceptable(status.as_u16()));
        }

        let url_response = UrlResponse::from_response(&response);
        debug!(
            url = %request.url,
            status = url_response.status,
            content_length = ?url_response.expected_content_length,
            "Response received"
        );

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            trace!(url = %request.url, len = chunk.len(), "Chunk received");
            on_chunk(chunk, url_response.clone());
        }
        Ok(())
    }
}

impl Default for DataLoader {
    fn default() -> Self {
        Self::new(&DataLoaderConfig::default())
    }
}

impl DataLoading for DataLoader {
    fn load_data(
        &self,
        request: LoadRequest,
        mut on_chunk: OnChunk,
        on_completion: OnCompletion,
    ) -> Box<dyn Cancellable> {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let url = request.url.clone();
            let result = tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!(url = %url, "Load cancelled");
                    Err(LoadError::Cancelled)
                }
                result = Self::fetch(client, request, &mut on_chunk) => result,
            };
            if let Err(error) = &result
                && !matches!(error, LoadError::Cancelled)
            {
                debug!(url = %url, error = %error, "Load failed");
            }
            on_completion(result);
        });

        Box::new(token)
    }
}

impl fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader").finish_non_exhaustive()
    }
}

fn create_client(config: &DataLoaderConfig) -> reqwest::Client {
    install_rustls_provider();

    let mut headers = HeaderMap::new();
    if let Ok(agent) = HeaderValue::from_str(&config.user_agent) {
        headers.insert(USER_AGENT, agent);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if config.timeout > Duration::ZERO {
        builder = builder.timeout(config.timeout);
    }

    builder.build().unwrap_or_else(|error| {
        warn!(
            error = %error,
            "Failed to create configured HTTP client; falling back to reqwest defaults"
        );
        reqwest::Client::new()
    })
}
