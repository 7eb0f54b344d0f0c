//! Transport seam: streaming byte sources for the fetch jobs.

use std::time::Duration;

use anyhow::anyhow;
use async_stream::try_stream;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use tracing::debug;
use url::Url;

use pictor_model::{CachePolicy, UrlRequest, UrlResponse};

/// A finite stream of `(chunk, response)` pairs. The response may be the
/// same envelope on every event. Dropping the stream cancels the load.
pub type DataStream = BoxStream<'static, anyhow::Result<(Bytes, UrlResponse)>>;

/// A streaming byte source for URL requests.
pub trait DataLoading: Send + Sync {
    fn load(&self, request: &UrlRequest) -> DataStream;
}

/// The default transport, backed by a pooled reqwest client.
pub struct ReqwestDataLoader {
    client: Client,
}

impl ReqwestDataLoader {
    pub fn new() -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Use a preconfigured client (proxies, extra roots, pinning).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestDataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoading for ReqwestDataLoader {
    fn load(&self, request: &UrlRequest) -> DataStream {
        let client = self.client.clone();
        let request = request.clone();
        Box::pin(try_stream! {
            let mut builder = client.get(request.url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            if request.cache_policy == CachePolicy::ReloadIgnoringCacheData {
                builder = builder.header("Cache-Control", "no-cache");
            }

            let response =
                builder.send().await.map_err(anyhow::Error::from)?;
            let status = response.status().as_u16();
            ensure_acceptable_status(status)?;

            let envelope = UrlResponse {
                url: Some(response.url().clone()),
                status,
                headers: response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_owned(),
                            String::from_utf8_lossy(value.as_bytes())
                                .into_owned(),
                        )
                    })
                    .collect(),
                expected_content_length: response.content_length(),
            };
            debug!(
                url = %request.url,
                status,
                expected = ?envelope.expected_content_length,
                "transport stream opened"
            );

            let mut chunks = response.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(anyhow::Error::from)?;
                yield (chunk, envelope.clone());
            }
        })
    }
}

fn ensure_acceptable_status(status: u16) -> anyhow::Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(anyhow!("unacceptable HTTP status {status}"))
    }
}

/// Read a `file://` or `data:` resource without touching the network.
pub(crate) async fn load_local_resource(url: &Url) -> anyhow::Result<Bytes> {
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("invalid file URL: {url}"))?;
            Ok(Bytes::from(tokio::fs::read(path).await?))
        }
        "data" => decode_data_url(url.as_str()),
        other => Err(anyhow!("unsupported local scheme {other:?}")),
    }
}

fn decode_data_url(url: &str) -> anyhow::Result<Bytes> {
    let content = url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URL"))?;
    let (meta, payload) = content
        .split_once(',')
        .ok_or_else(|| anyhow!("data URL has no payload"))?;
    if meta.ends_with(";base64") {
        let decoded =
            base64::engine::general_purpose::STANDARD.decode(payload)?;
        Ok(Bytes::from(decoded))
    } else {
        Ok(Bytes::copy_from_slice(payload.as_bytes()))
    }
}
