mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use image::GenericImageView;
use pixcache_engine::cache::INDEX_FILE_NAME;
use pixcache_engine::{
    CacheKey, CropTransform, Dispatcher, FetchError, FetchOptions, ImageFetcher, ImageTransform,
    PixcacheConfig,
};
use tokio::sync::mpsc;

use common::{ScriptedTransport, init_tracing, png, wait_until};

fn config(dir: &Path) -> PixcacheConfig {
    PixcacheConfig::builder()
        .with_cache_dir(dir)
        .with_response_cache(false)
        .build()
}

async fn open(dir: &Path, transport: &Arc<ScriptedTransport>) -> ImageFetcher {
    ImageFetcher::open_with(config(dir), transport.clone(), Dispatcher::spawn())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_second_fetch_is_served_from_cache() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/a.png";
    transport.ok(url, "image-a");
    let fetcher = open(dir.path(), &transport).await;

    let first = fetcher.fetch_async(url, FetchOptions::new()).await.unwrap();
    assert_eq!(first.bytes, Bytes::from_static(b"image-a"));
    assert!(!first.from_cache);

    let second = fetcher.fetch_async(url, FetchOptions::new()).await.unwrap();
    assert_eq!(second.bytes, first.bytes);
    assert!(second.from_cache);

    assert_eq!(transport.calls(url), 1);
    assert_eq!(fetcher.outstanding(), 0);
}

#[tokio::test]
async fn test_disk_tier_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let url = "https://img.example.com/persisted.png";
    let key = CacheKey::from_url(url);

    {
        let transport = ScriptedTransport::new();
        transport.ok(url, "persisted");
        let fetcher = open(dir.path(), &transport).await;
        fetcher.fetch_async(url, FetchOptions::new()).await.unwrap();
        fetcher.store().flush().await;

        let index = std::fs::read_to_string(dir.path().join(INDEX_FILE_NAME)).unwrap();
        assert!(index.contains(key.as_str()));
    }

    let offline = ScriptedTransport::new();
    let fetcher = open(dir.path(), &offline).await;
    assert_eq!(fetcher.store().memory_len(), 0);

    let image = fetcher.fetch_async(url, FetchOptions::new()).await.unwrap();
    assert_eq!(image.bytes, Bytes::from_static(b"persisted"));
    assert!(image.from_cache);
    assert_eq!(offline.total_calls(), 0);
    // promoted into memory
    assert_eq!(fetcher.store().memory_len(), 1);
}

#[tokio::test]
async fn test_transform_is_applied_before_caching() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/big.png";
    transport.ok(url, png(16, 12));
    let fetcher = open(dir.path(), &transport).await;

    let cropped = fetcher
        .fetch_async(url, FetchOptions::new().transform(CropTransform::new(4, 2)))
        .await
        .unwrap();
    let img = image::load_from_memory(&cropped.bytes).unwrap();
    assert_eq!(img.dimensions(), (4, 2));

    // cache hits come back as stored
    let again = fetcher.fetch_async(url, FetchOptions::new()).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(again.bytes, cropped.bytes);
}

#[tokio::test]
async fn test_failed_transform_is_not_cached() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/broken.png";
    transport.ok(url, "definitely not an image");
    let fetcher = open(dir.path(), &transport).await;

    let err = fetcher
        .fetch_async(url, FetchOptions::new().transform(CropTransform::new(4, 4)))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transform(_)));
    assert!(!fetcher.store().contains(&CacheKey::from_url(url)));
}

#[tokio::test]
async fn test_invalid_url_is_reported() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let fetcher = open(dir.path(), &transport).await;

    let err = fetcher
        .fetch_async("not a url", FetchOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidUrl(_)));
    assert_eq!(transport.total_calls(), 0);
    assert_eq!(fetcher.outstanding(), 0);
}

#[tokio::test]
async fn test_http_error_is_not_cached() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let fetcher = open(dir.path(), &transport).await;
    let url = "https://img.example.com/missing.png";

    let err = fetcher.fetch_async(url, FetchOptions::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(!fetcher.store().contains(&CacheKey::from_url(url)));

    // failures are not remembered; the next fetch goes back to the network
    let _ = fetcher.fetch_async(url, FetchOptions::new()).await;
    assert_eq!(transport.calls(url), 2);
}

#[tokio::test]
async fn test_cancel_suppresses_delivery() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/slow.png";
    transport.route(url, 200, "slow", Duration::from_millis(100));
    let fetcher = open(dir.path(), &transport).await;

    let delivered = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&delivered);
    let ticket = fetcher.fetch(url, FetchOptions::new(), move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    // let the fetch reach the network
    assert!(wait_until(Duration::from_secs(5), || transport.calls(url) == 1).await);
    assert_eq!(fetcher.cancel(url), 1);
    assert!(ticket.is_cancelled());

    tokio::time::sleep(Duration::from_millis(200)).await;
    fetcher.dispatcher().flush().await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.outstanding(), 0);
    assert!(!fetcher.store().contains(&CacheKey::from_url(url)));
}

#[tokio::test]
async fn test_dropping_fetch_future_cancels() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/abandoned.png";
    transport.route(url, 200, "abandoned", Duration::from_millis(100));
    let fetcher = open(dir.path(), &transport).await;

    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        fetcher.fetch_async(url, FetchOptions::new()),
    )
    .await;
    assert!(timed_out.is_err());
    assert_eq!(fetcher.outstanding(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fetcher.store().contains(&CacheKey::from_url(url)));
}

#[tokio::test]
async fn test_concurrent_fetch_supersedes_earlier() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/contended.png";
    transport.route(url, 200, "contended", Duration::from_millis(50));
    let fetcher = open(dir.path(), &transport).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
    let first_tx = tx.clone();
    fetcher.fetch(url, FetchOptions::new(), move |r| {
        assert!(r.is_ok());
        let _ = first_tx.send("first");
    });
    assert!(wait_until(Duration::from_secs(5), || transport.calls(url) == 1).await);
    fetcher.fetch(url, FetchOptions::new(), move |r| {
        assert!(r.is_ok());
        let _ = tx.send("second");
    });

    let who = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(who, "second");

    tokio::time::sleep(Duration::from_millis(100)).await;
    fetcher.dispatcher().flush().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.calls(url), 2);
    assert!(wait_until(Duration::from_secs(5), || fetcher.outstanding() == 0).await);
}

/// Passes bytes through after blocking for a while.
#[derive(Debug)]
struct SlowIdentity(Duration);

impl ImageTransform for SlowIdentity {
    fn apply(&self, data: Bytes) -> pixcache_engine::Result<Bytes> {
        std::thread::sleep(self.0);
        Ok(data)
    }
}

#[tokio::test]
async fn test_superseded_result_is_not_written_after_slow_transform() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let url = "https://img.example.com/racy.png";
    let key = CacheKey::from_url(url);
    transport.ok(url, "A");
    let fetcher = open(dir.path(), &transport).await;

    let slow = {
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            let options = FetchOptions::new().transform(SlowIdentity(Duration::from_millis(300)));
            fetcher.fetch_async(url, options).await
        })
    };

    // the first response was accepted and is now in the transform
    assert!(
        wait_until(Duration::from_secs(5), || {
            transport.calls(url) == 1 && fetcher.coordinator().in_flight() == 0
        })
        .await
    );

    transport.ok(url, "B");
    let fresh = fetcher.fetch_async(url, FetchOptions::new()).await.unwrap();
    assert_eq!(fresh.bytes, Bytes::from_static(b"B"));
    assert!(!fresh.from_cache);

    let stale = slow.await.unwrap();
    assert!(matches!(stale, Err(FetchError::Cancelled)));

    fetcher.store().flush().await;
    assert_eq!(fetcher.store().get(&key).await, Some(Bytes::from_static(b"B")));
    assert_eq!(transport.calls(url), 2);
    assert!(wait_until(Duration::from_secs(5), || fetcher.outstanding() == 0).await);
}

#[tokio::test]
async fn test_progress_and_prefetch() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new();
    let urls = [
        "https://img.example.com/p1.png",
        "https://img.example.com/p2.png",
    ];
    for url in urls {
        transport.ok(url, format!("body of {url}"));
    }
    let fetcher = open(dir.path(), &transport).await;

    let progress = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&progress);
    fetcher
        .fetch_async(
            urls[0],
            FetchOptions::new().on_progress(move |received, expected, _| {
                assert!(expected.is_none_or(|total| received <= total));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    fetcher.dispatcher().flush().await;
    assert_eq!(progress.load(Ordering::SeqCst), 2);

    let tickets = fetcher.prefetch(urls);
    assert_eq!(tickets.len(), 2);
    let keys: Vec<CacheKey> = urls.iter().map(|u| CacheKey::from_url(u)).collect();
    assert!(
        wait_until(Duration::from_secs(5), || keys
            .iter()
            .all(|k| fetcher.store().contains(k)))
        .await
    );
    // the first one was already cached
    assert_eq!(transport.calls(urls[0]), 1);
    assert_eq!(transport.calls(urls[1]), 1);
}
