//! End-to-end tests of the HTTP surface over a real socket

use async_trait::async_trait;
use pagecap::handler::{router, AppState};
use pagecap::{server, Error, RenderRequest, Result, Screenshotter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Answers every request with the same bytes
struct FixedPng(Vec<u8>);

#[async_trait]
impl Screenshotter for FixedPng {
    async fn capture(&self, _request: &RenderRequest, _cancel: &CancellationToken) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Blocks until cancelled and remembers that it was
#[derive(Default)]
struct StalledRender {
    started: Notify,
    cancelled: AtomicBool,
}

#[async_trait]
impl Screenshotter for StalledRender {
    async fn capture(&self, _request: &RenderRequest, cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.started.notify_one();
        cancel.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        Err(Error::Cancelled)
    }
}

struct Running {
    base: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

async fn start(screenshotter: Arc<dyn Screenshotter>, grace: Duration) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let renders = CancellationToken::new();
    let app = router(AppState::new(screenshotter).with_renders(renders.clone()));
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server::serve(listener, app, renders, grace, async move {
        let _ = stopped.await;
    }));

    Running { base, stop, task }
}

#[tokio::test]
async fn test_serves_png_over_tcp() {
    let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    let running = start(Arc::new(FixedPng(png.clone())), Duration::from_secs(5)).await;

    let response = reqwest::get(format!("{}/?url=example.com&width=800", running.base))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    assert_eq!(response.headers()["content-length"], png.len().to_string().as_str());
    assert_eq!(response.bytes().await.unwrap().to_vec(), png);

    let landing = reqwest::get(format!("{}/", running.base)).await.unwrap();
    assert_eq!(landing.status(), reqwest::StatusCode::OK);
    assert_eq!(landing.headers()["content-type"], "text/html; charset=utf-8");

    let missing = reqwest::get(format!("{}/robots.txt", running.base)).await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    running.stop.send(()).unwrap();
    let served = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(served.is_ok(), "{:?}", served);
}

#[tokio::test]
async fn test_shutdown_cancels_stalled_render_after_grace() {
    let shot = Arc::new(StalledRender::default());
    let running = start(shot.clone(), Duration::from_millis(100)).await;

    let url = format!("{}/?url=https://example.com", running.base);
    let client = tokio::spawn(async move { reqwest::get(url).await.map(|r| r.status()) });

    tokio::time::timeout(Duration::from_secs(5), shot.started.notified())
        .await
        .expect("render never started");

    running.stop.send(()).unwrap();
    let served = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(served.is_ok(), "{:?}", served);
    assert!(shot.cancelled.load(Ordering::SeqCst));

    // The connection may be torn down before the 502 reaches the client.
    if let Ok(status) = client.await.unwrap() {
        assert_eq!(status, reqwest::StatusCode::BAD_GATEWAY);
    }
}
