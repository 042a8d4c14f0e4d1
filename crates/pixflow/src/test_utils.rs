use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::disk_cache::DataCaching;
use crate::error::LoadError;
use crate::loader::{Cancellable, DataLoading, LoadRequest, OnChunk, OnCompletion, UrlResponse};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer() // Write to test output
        .try_init();
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 128, 255]));
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Baseline (single scan) JPEG.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 64]));
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, 90)
        .encode_image(&image)
        .unwrap();
    buffer
}

pub fn test_url(path: &str) -> Url {
    Url::parse(&format!("https://example.com/{path}")).unwrap()
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

/// Serve a single HTTP/1.1 response on a local port.
pub async fn serve_once(status: u16, headers: &[(&str, &str)], body: Vec<u8>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut head = format!(
        "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request_head(&mut socket).await;
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
        let _ = socket.shutdown().await;
    });

    Url::parse(&format!("http://{addr}/image")).unwrap()
}

/// Accept one connection and never answer it.
pub async fn serve_stalled() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request_head(&mut socket).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        drop(socket);
    });
    Url::parse(&format!("http://{addr}/stalled")).unwrap()
}

/// Canned response of [`MockDataLoader`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub expected_content_length: Option<u64>,
    pub chunks: Vec<Bytes>,
    pub chunk_delay: Duration,
    /// Fail with this message after the chunks.
    pub failure: Option<String>,
    /// Never complete after the chunks, until cancelled.
    pub stall: bool,
}

impl MockResponse {
    pub fn ok(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            status: 200,
            headers: HeaderMap::new(),
            expected_content_length: Some(data.len() as u64),
            chunks: vec![data],
            chunk_delay: Duration::ZERO,
            failure: None,
            stall: false,
        }
    }

    /// Split the body into `count` chunks of roughly equal size.
    pub fn chunked(mut self, count: usize) -> Self {
        let data: Vec<u8> = self.chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let size = data.len().div_ceil(count.max(1)).max(1);
        self.chunks = data
            .chunks(size)
            .map(Bytes::copy_from_slice)
            .collect();
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.insert(name, value.parse().unwrap());
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_owned());
        self
    }
}

type Handler = Box<dyn Fn(&LoadRequest) -> MockResponse + Send + Sync>;

/// In-memory [`DataLoading`] that records every request it receives.
pub struct MockDataLoader {
    handler: Handler,
    requests: Mutex<Vec<LoadRequest>>,
    started: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
}

impl MockDataLoader {
    pub fn new(handler: impl Fn(&LoadRequest) -> MockResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn serving(response: MockResponse) -> Self {
        Self::new(move |_| response.clone())
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests.lock().clone()
    }
}

struct MockHandle {
    token: CancellationToken,
    cancelled: Arc<AtomicUsize>,
}

impl Cancellable for MockHandle {
    fn cancel(&self) {
        if !self.token.is_cancelled() {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        self.token.cancel();
    }
}

impl DataLoading for MockDataLoader {
    fn load_data(
        &self,
        request: LoadRequest,
        mut on_chunk: OnChunk,
        on_completion: OnCompletion,
    ) -> Box<dyn Cancellable> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let response = (self.handler)(&request);
        self.requests.lock().push(request.clone());

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let url_response = UrlResponse {
            url: request.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            expected_content_length: response.expected_content_length,
        };

        tokio::spawn(async move {
            let stream = async move {
                for chunk in response.chunks {
                    if !response.chunk_delay.is_zero() {
                        tokio::time::sleep(response.chunk_delay).await;
                    }
                    on_chunk(chunk, url_response.clone());
                }
                if response.stall {
                    std::future::pending::<()>().await;
                }
                match response.failure {
                    Some(message) => Err(LoadError::other(message)),
                    None => Ok(()),
                }
            };
            let result = tokio::select! {
                _ = cancelled.cancelled() => Err(LoadError::Cancelled),
                result = stream => result,
            };
            on_completion(result);
        });

        Box::new(MockHandle {
            token,
            cancelled: self.cancelled.clone(),
        })
    }
}

/// Synchronous in-memory [`DataCaching`] counting reads and writes.
#[derive(Default)]
pub struct MockDataCache {
    store: Mutex<HashMap<String, Bytes>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MockDataCache {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.lock().keys().cloned().collect()
    }
}

impl DataCaching for MockDataCache {
    fn cached_data(&self, key: &str) -> Option<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.store.lock().get(key).cloned()
    }

    fn store_data(&self, data: Bytes, key: &str) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.store.lock().insert(key.to_owned(), data);
    }

    fn remove_data(&self, key: &str) {
        self.store.lock().remove(key);
    }

    fn remove_all(&self) {
        self.store.lock().clear();
    }
}
