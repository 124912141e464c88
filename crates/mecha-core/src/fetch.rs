use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, ClientBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("download of {url} was interrupted: {source}")]
    Interrupted {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A response whose body has not been read yet.
pub struct Resource {
    pub url: String,
    pub status: StatusCode,
    pub content_type: Option<String>,
    response: reqwest::Response,
}

impl Resource {
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        self.response.bytes_stream()
    }

    /// Releases the connection without reading the body.
    pub fn discard(self) {
        debug!("Discarding response body from {}", self.url);
        drop(self.response);
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("mechafoord/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Issues a GET and returns once headers arrive. Only `http` and `https`
    /// are allowed; any non-2xx status is an error.
    pub async fn fetch(&self, url: &str) -> Result<Resource, FetchError> {
        let parsed = url::Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(FetchError::UnsupportedScheme(other.to_string())),
        }

        let response = self.client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(
            "Fetched headers for {} ({}, {:?})",
            url, status, content_type
        );

        Ok(Resource {
            url: url.to_string(),
            status,
            content_type,
            response,
        })
    }
}
