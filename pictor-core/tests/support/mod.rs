//! Scripted collaborators for pipeline integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_stream::try_stream;
use bytes::Bytes;
use parking_lot::Mutex;

use pictor_core::{
    DataCaching, DataStream, DataLoading, Image, ImageContainer,
    ImageDecoding, ImageDecodingContext, ImageEncoding,
    ImageEncodingContext, ImagePipelineConfiguration, ImageRequest,
    UrlRequest, UrlResponse,
};
use url::Url;

/// One scripted exchange: a response envelope plus the chunks the
/// server will emit, optionally ending in a transport error.
pub struct Attempt {
    pub response: UrlResponse,
    pub chunks: Vec<Bytes>,
    pub fail_after_chunks: bool,
    pub chunk_delay: Duration,
}

impl Attempt {
    pub fn new(response: UrlResponse, chunks: Vec<Bytes>) -> Self {
        Self {
            response,
            chunks,
            fail_after_chunks: false,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn failing_after_chunks(mut self) -> Self {
        self.fail_after_chunks = true;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

/// Build a success envelope with a known body length.
pub fn http_response(status: u16, content_length: u64) -> UrlResponse {
    let mut response = UrlResponse::new(None, status);
    response.expected_content_length = Some(content_length);
    response
}

/// Transport double: replays scripted attempts per URL and records
/// every request it was asked to start.
pub struct ScriptedLoader {
    scripts: Mutex<HashMap<String, VecDeque<Attempt>>>,
    started: AtomicUsize,
    requests: Mutex<Vec<UrlRequest>>,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, url: &str, attempt: Attempt) {
        self.scripts
            .lock()
            .entry(url.to_owned())
            .or_default()
            .push_back(attempt);
    }

    /// How many loads actually reached the transport.
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<UrlRequest> {
        self.requests.lock().clone()
    }
}

impl DataLoading for ScriptedLoader {
    fn load(&self, request: &UrlRequest) -> DataStream {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let attempt = self
            .scripts
            .lock()
            .get_mut(request.url.as_str())
            .and_then(VecDeque::pop_front);
        let url = request.url.clone();
        Box::pin(try_stream! {
            let attempt = attempt
                .ok_or_else(|| anyhow!("no scripted attempt for {url}"))?;
            let delay = attempt.chunk_delay;
            let response = attempt.response;
            for chunk in attempt.chunks {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                yield (chunk, response.clone());
            }
            if attempt.fail_after_chunks {
                interrupted()?;
            }
        })
    }
}

fn interrupted() -> anyhow::Result<()> {
    Err(anyhow!("transport interrupted"))
}

/// In-memory data cache that records every write key in order.
#[derive(Default)]
pub struct RecordingDataCache {
    entries: Mutex<HashMap<String, Bytes>>,
    writes: Mutex<Vec<String>>,
}

impl RecordingDataCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn write_keys(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn seed(&self, key: impl Into<String>, data: Bytes) {
        self.entries.lock().insert(key.into(), data);
    }
}

impl DataCaching for RecordingDataCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: String, data: Bytes) {
        self.writes.lock().push(key.clone());
        self.entries.lock().insert(key, data);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn remove_all(&self) {
        self.entries.lock().clear();
    }
}

/// Decoder double: accepts any bytes, counts calls, optionally stalls
/// so back-pressure becomes observable.
pub struct StubDecoder {
    final_calls: AtomicUsize,
    partial_calls: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    partial_stall: Duration,
    emit_previews: bool,
}

impl StubDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            final_calls: AtomicUsize::new(0),
            partial_calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            partial_stall: Duration::ZERO,
            emit_previews: true,
        })
    }

    pub fn stalling(partial_stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            final_calls: AtomicUsize::new(0),
            partial_calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            partial_stall,
            emit_previews: true,
        })
    }

    pub fn final_calls(&self) -> usize {
        self.final_calls.load(Ordering::SeqCst)
    }

    pub fn partial_calls(&self) -> usize {
        self.partial_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }

    fn container(data: &Bytes, is_preview: bool) -> ImageContainer {
        let mut container = ImageContainer::new(Image::from_dynamic(
            image::DynamicImage::ImageRgba8(image::RgbaImage::new(2, 2)),
        ));
        container.is_preview = is_preview;
        container.is_decompression_needed = true;
        container.data = Some(data.clone());
        container
    }
}

impl ImageDecoding for StubDecoder {
    fn decode(
        &self,
        context: &ImageDecodingContext,
    ) -> anyhow::Result<ImageContainer> {
        self.enter();
        self.final_calls.fetch_add(1, Ordering::SeqCst);
        self.exit();
        Ok(Self::container(&context.data, false))
    }

    fn decode_partially(
        &self,
        context: &ImageDecodingContext,
    ) -> Option<ImageContainer> {
        self.enter();
        self.partial_calls.fetch_add(1, Ordering::SeqCst);
        if self.partial_stall > Duration::ZERO {
            std::thread::sleep(self.partial_stall);
        }
        self.exit();
        self.emit_previews
            .then(|| Self::container(&context.data, true))
    }

    fn is_asynchronous(&self) -> bool {
        true
    }
}

/// Encoder double returning fixed bytes.
pub struct StubEncoder;

impl ImageEncoding for StubEncoder {
    fn encode(
        &self,
        _context: &ImageEncodingContext,
    ) -> anyhow::Result<Bytes> {
        Ok(Bytes::from_static(b"encoded-image"))
    }
}

/// A configuration wired to scripted collaborators: no rate limiter
/// pacing surprises, permissive decoding, memory cache on.
pub fn scripted_configuration(
    loader: &Arc<ScriptedLoader>,
    decoder: &Arc<StubDecoder>,
) -> ImagePipelineConfiguration {
    let decoder = decoder.clone();
    ImagePipelineConfiguration {
        data_loader: loader.clone(),
        make_image_decoder: Arc::new(move |_context| {
            Some(decoder.clone() as Arc<dyn ImageDecoding>)
        }),
        make_image_encoder: Arc::new(|_context| {
            Arc::new(StubEncoder) as Arc<dyn ImageEncoding>
        }),
        ..ImagePipelineConfiguration::default()
    }
}

pub fn request_for(url: &str) -> ImageRequest {
    ImageRequest::new(Url::parse(url).expect("test URL parses"))
}

/// Opt-in log output for debugging a failing test:
/// `RUST_LOG=pictor_core=trace cargo test ...`
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env(),
            )
            .try_init();
    });
}

pub fn body_bytes(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}
