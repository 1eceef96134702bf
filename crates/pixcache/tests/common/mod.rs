#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use pixcache_engine::Result;
use pixcache_engine::http::{ChunkCallback, Transport, TransportRequest, TransportResponse};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Bytes,
    pub delay: Duration,
}

/// In-process transport answering from a fixed route table.
///
/// Unknown URLs answer 404. Bodies are reported in two chunks so progress
/// callbacks fire more than once.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>, delay: Duration) {
        self.routes.lock().insert(
            url.to_string(),
            Route {
                status,
                body: body.into(),
                delay,
            },
        );
    }

    pub fn ok(&self, url: &str, body: impl Into<Bytes>) {
        self.route(url, 200, body, Duration::ZERO);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<TransportResponse> {
        let key = request.url.to_string();
        *self.calls.lock().entry(key.clone()).or_default() += 1;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let route = self.routes.lock().get(&key).cloned().unwrap_or(Route {
            status: 404,
            body: Bytes::from_static(b"{\"error\":\"not found\"}"),
            delay: Duration::ZERO,
        });

        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }

        let total = route.body.len() as u64;
        if total > 1 {
            on_chunk(total / 2, Some(total));
        }
        on_chunk(total, Some(total));

        Ok(TransportResponse {
            status: route.status,
            content_type: None,
            content_length: Some(total),
            final_url: request.url,
            body: route.body,
        })
    }
}

/// A solid-color PNG.
pub fn png(width: u32, height: u32) -> Bytes {
    let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
    let mut buffer = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    Bytes::from(buffer)
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
