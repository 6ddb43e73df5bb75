//! Fetching of source images over HTTP.

use std::{future::Future, time::Duration};

use http::{header, HeaderMap, StatusCode};

use crate::{error::Error, img::Image};

/// Reads a source image from a URL.
///
/// The gateway is generic over this trait: tests swap in mocks, deployments
/// may fetch from object storage or add authentication. A custom loader can
/// return [`Error::Http`] to control the response status verbatim.
pub trait Loader: Send + Sync {
    /// Fetches the image at `url`.
    ///
    /// `extra_headers` is a per-request overlay applied on top of whatever
    /// headers the loader sends on its own.
    fn load(
        &self,
        url: &str,
        extra_headers: Option<HeaderMap>,
    ) -> impl Future<Output = Result<Image, Error>> + Send;
}

/// HTTP loader over a shared connection-pooling client.
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpLoader {
    /// Creates a loader with no global headers.
    pub fn new() -> Self {
        Self::with_headers(HeaderMap::new())
    }

    /// Creates a loader that sends `headers` with every origin request.
    pub fn with_headers(headers: HeaderMap) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Must build a reqwest client");

        Self { client, headers }
    }
}

impl Default for HttpLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader for HttpLoader {
    async fn load(&self, url: &str, extra_headers: Option<HeaderMap>) -> Result<Image, Error> {
        let mut request = self.client.get(url).headers(self.headers.clone());
        if let Some(extra) = extra_headers {
            request = request.headers(extra);
        }

        let response = request.send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::LoadNon200 {
                status,
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let mime_type = header_value(response.headers(), &header::CONTENT_TYPE);
        let content_encoding = header_value(response.headers(), &header::CONTENT_ENCODING);

        let data = response.bytes().await?;

        Ok(Image {
            id: url.to_string(),
            data,
            mime_type,
            content_encoding,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
