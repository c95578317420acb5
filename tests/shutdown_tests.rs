//! Graceful Shutdown Integration Tests
//!
//! Runs the real server on an ephemeral port and walks it through
//! `Running → Draining → Stopped`.

use greenlight::{
    config::ApplicationConfig,
    server::{self, AppState},
    services::{DrainOutcome, ShutdownState},
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

fn test_config(drain_secs: u64) -> ApplicationConfig {
    let mut config = ApplicationConfig::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.http_shutdown_timeout_secs = 2;
    config.background.drain_timeout_secs = drain_secs;
    config.monitoring.structured_logging = false;
    config
}

async fn start(config: ApplicationConfig) -> (AppState, SocketAddr, JoinHandle<greenlight::services::ShutdownReport>) {
    let addr = config.listen_addr().unwrap();
    let state = AppState::from_config(config).unwrap();
    let listener = server::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(server::serve(state.clone(), listener));
    (state, addr, handle)
}

async fn raw_get(addr: SocketAddr, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serves_then_drains_cleanly() {
    let (state, addr, handle) = start(test_config(5)).await;

    let response = raw_get(addr, "/v1/healthcheck").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("\"available\""));

    // Three tasks that each take ~300ms
    let finished = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let finished = Arc::clone(&finished);
        state.runner.run("slow-job", async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    let started = Instant::now();
    assert!(state.shutdown.begin_shutdown("test"));
    let report = handle.await.unwrap();

    assert!(report.is_clean());
    assert!(report.http.is_ok());
    assert_eq!(report.drain, DrainOutcome::Complete);
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert_eq!(state.shutdown.state(), ShutdownState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(3));

    // Listener is gone
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_deadline_is_enforced() {
    let (state, _addr, handle) = start(test_config(1)).await;

    state.runner.run("stuck-job", async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let started = Instant::now();
    state.shutdown.begin_shutdown("test");
    let report = handle.await.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.drain, DrainOutcome::TimedOut { remaining: 1 });
    assert_eq!(state.shutdown.state(), ShutdownState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.into_result().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_signal_is_ignored() {
    let (state, _addr, handle) = start(test_config(5)).await;

    assert!(state.shutdown.begin_shutdown("SIGTERM"));
    assert!(!state.shutdown.begin_shutdown("SIGINT"));

    let report = handle.await.unwrap();
    assert!(report.is_clean());
    assert_eq!(state.shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debug_vars_reports_draining_tasks() {
    let (state, addr, handle) = start(test_config(5)).await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    state.runner.run("held", async move {
        let _ = rx.await;
    });

    let response = raw_get(addr, "/debug/vars").await.unwrap();
    assert!(response.contains("\"outstanding\":1"), "got: {}", response);
    assert!(response.contains("\"shutdown_state\":\"running\""));

    state.shutdown.begin_shutdown("test");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.shutdown.state(), ShutdownState::Draining);

    tx.send(()).unwrap();
    let report = handle.await.unwrap();
    assert!(report.is_clean());
}
