//! End-to-end loads through the real HTTP loader against a local server.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use pixflow::processing::Resize;
use pixflow::{
    DataCache, DataCacheItem, ImageRequest, LoadError, Pipeline, PipelineConfig, PipelineError,
    PrefetchDestination, Prefetcher,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8, y as u8, 200, 255]));
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Answers every request with the same response and counts them.
struct TestServer {
    url: Url,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start(status: u16, body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let header = format!(
                        "HTTP/1.1 {status} Status\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            url: Url::parse(&format!("http://{addr}/image.png")).unwrap(),
            hits,
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn pipeline(cache: Option<&DataCache>) -> Pipeline {
    let mut config = PipelineConfig::default();
    if let Some(cache) = cache {
        config = config.with_data_cache(Arc::new(cache.clone()));
    }
    Pipeline::new(config)
}

#[tokio::test]
async fn loads_over_http_and_reuses_the_disk_cache() {
    let server = TestServer::start(200, png(24, 12)).await;
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::with_path(dir.path()).unwrap();
    let request = ImageRequest::new(server.url.clone());

    let first = pipeline(Some(&cache));
    let response = first
        .load_image(request.clone())
        .response()
        .await
        .expect("cancelled")
        .expect("load failed");
    assert_eq!((response.image().width(), response.image().height()), (24, 12));
    assert_eq!(server.hits(), 1);

    cache.flush();
    let key = first.cache_key(&request, DataCacheItem::OriginalImageData);
    assert!(cache.file_path(&key).exists());

    // A new pipeline starts with an empty memory cache.
    let response = pipeline(Some(&cache))
        .load_image(request)
        .response()
        .await
        .expect("cancelled")
        .expect("load failed");
    assert_eq!(response.image().width(), 24);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn unacceptable_status_fails_the_load() {
    let server = TestServer::start(404, b"missing".to_vec()).await;

    let result = pipeline(None)
        .load_image(ImageRequest::new(server.url.clone()))
        .response()
        .await;

    match result {
        Some(Err(PipelineError::DataLoadingFailed(error))) => {
            assert!(matches!(*error, LoadError::StatusCodeUnacceptable(404)))
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn processors_resize_the_result() {
    let server = TestServer::start(200, png(40, 20)).await;
    let pipeline = pipeline(None);

    let request = ImageRequest::new(server.url.clone()).with_processor(Resize::new(10, 10));
    let response = pipeline
        .load_image(request.clone())
        .response()
        .await
        .expect("cancelled")
        .expect("load failed");

    // Aspect fill: the short side reaches the target.
    assert_eq!((response.image().width(), response.image().height()), (20, 10));
    assert!(pipeline.cached_image(&request).is_some());
    assert!(pipeline.cached_image(&ImageRequest::new(server.url.clone())).is_none());
}

#[tokio::test]
async fn disk_prefetch_serves_later_loads() {
    let server = TestServer::start(200, png(8, 8)).await;
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::with_path(dir.path()).unwrap();
    let pipeline = pipeline(Some(&cache));

    let prefetcher = Prefetcher::new(pipeline.clone(), PrefetchDestination::DiskCache, 2);
    prefetcher.start_prefetching_urls([server.url.clone()]);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !prefetcher.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("prefetch did not finish");
    assert_eq!(server.hits(), 1);

    let response = pipeline
        .load_image(ImageRequest::new(server.url.clone()))
        .response()
        .await
        .expect("cancelled");
    assert!(response.is_ok());
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn data_task_returns_raw_bytes() {
    let body = png(4, 4);
    let server = TestServer::start(200, body.clone()).await;

    let mut task = pipeline(None).load_data(ImageRequest::new(server.url.clone()));
    let data = task.response().await.expect("cancelled").expect("load failed");

    assert_eq!(&data.data[..], &body[..]);
    let response = data.response.expect("network response");
    assert_eq!(response.status, 200);
    assert_eq!(response.expected_content_length, Some(body.len() as u64));
}
