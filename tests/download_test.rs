use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pahe_engine::config::RetryConfig;
use pahe_engine::error::PipelineError;
use pahe_engine::model::TransferDescriptor;
use pahe_engine::transfer::{HttpDownloader, NoopReporter};

const TEST_SIZE: usize = 256 * 1024;

fn pattern() -> Vec<u8> {
    (0..TEST_SIZE).map(|i| (i % 251) as u8).collect()
}

fn ranged_response(req: &Request) -> axum::response::Response {
    let body = pattern();
    let total = body.len() as u64;

    if let Some(range_val) = req.headers().get(header::RANGE) {
        let range_str = range_val.to_str().unwrap_or("");
        if let Some(rest) = range_str.strip_prefix("bytes=") {
            let start: u64 = rest.trim_end_matches('-').parse().unwrap_or(0);
            let slice = body[start as usize..].to_vec();
            let content_range = format!("bytes {}-{}/{}", start, total - 1, total);
            return (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_RANGE, content_range),
                    (header::CONTENT_LENGTH, slice.len().to_string()),
                ],
                slice,
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_LENGTH, total.to_string())],
        body,
    )
        .into_response()
}

async fn serve_file(req: Request) -> impl IntoResponse {
    ranged_response(&req)
}

/// Fails every request until `failures_left` hits zero.
async fn serve_flaky(State(failures_left): State<Arc<AtomicUsize>>, req: Request) -> impl IntoResponse {
    if failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ranged_response(&req)
}

async fn start_server(initial_failures: usize) -> SocketAddr {
    let state = Arc::new(AtomicUsize::new(initial_failures));
    let app = Router::new()
        .route("/file", post(serve_file))
        .route("/flaky", post(serve_flaky))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn descriptor(url: String, filename: &str) -> TransferDescriptor {
    TransferDescriptor {
        url,
        form_data: HashMap::from([("_token".to_string(), "t".to_string())]),
        cookies: HashMap::from([("session".to_string(), "abc".to_string())]),
        headers: HashMap::from([(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )]),
        filename: Some(filename.to_string()),
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_secs: 0,
        max_elapsed_secs: 60,
    }
}

#[tokio::test]
async fn one_pass_download_matches_pattern() {
    let addr = start_server(0).await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(fast_retry(3)).unwrap();

    let fractions: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let fractions = fractions.clone();
        move |f: f64| fractions.lock().unwrap().push(f)
    };

    let path = downloader
        .download(
            &descriptor(format!("http://{addr}/file"), "one.mp4"),
            dir.path(),
            &sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&path).await.unwrap(), pattern());

    let seen = fractions.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed");
    assert_eq!(*seen.last().unwrap(), 1.0);
}

#[tokio::test]
async fn resumed_download_is_byte_identical() {
    let addr = start_server(0).await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(fast_retry(3)).unwrap();

    // Simulate a truncated earlier run.
    let cut = 100_000;
    let path = dir.path().join("resume.mp4");
    tokio::fs::write(&path, &pattern()[..cut]).await.unwrap();

    let resumed = downloader
        .download(
            &descriptor(format!("http://{addr}/file"), "resume.mp4"),
            dir.path(),
            &NoopReporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resumed, path);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), pattern());
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let addr = start_server(1).await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(fast_retry(3)).unwrap();

    let path = downloader
        .download(
            &descriptor(format!("http://{addr}/flaky"), "flaky.mp4"),
            dir.path(),
            &NoopReporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&path).await.unwrap(), pattern());
}

#[tokio::test]
async fn exhausted_budget_reports_failure() {
    let addr = start_server(usize::MAX).await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(fast_retry(2)).unwrap();

    let err = downloader
        .download(
            &descriptor(format!("http://{addr}/flaky"), "never.mp4"),
            dir.path(),
            &NoopReporter,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        PipelineError::TransferExhausted { attempts, reason } => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("500"), "unexpected reason: {reason}");
        }
        other => panic!("expected TransferExhausted, got {other}"),
    }
}

#[tokio::test]
async fn cancelled_token_stops_before_transfer() {
    let addr = start_server(0).await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(fast_retry(3)).unwrap();

    let token = CancellationToken::new();
    token.cancel();

    let err = downloader
        .download(
            &descriptor(format!("http://{addr}/file"), "cancelled.mp4"),
            dir.path(),
            &NoopReporter,
            &token,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert!(!dir.path().join("cancelled.mp4").exists());
}
