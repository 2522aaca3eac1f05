//! Shared test helpers: mock provider engines and a gateway harness.
//!
//! The mock engine is an axum server standing in for every downstream
//! provider at once; counters let tests assert how often the gateway
//! actually called it. The harness runs the real hyper accept loop against
//! an injected `GatewayState`, so connection-level behavior (dropped
//! sockets, breaker refusals) is exercised the same way the binary does.
//!
//! Some helpers are only used by some test binaries.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mediagate_core::breaker::{BreakerConfig, TrafficBreaker};
use mediagate_core::config::GatewayConfig;
use mediagate_core::monitor::{LogMonitor, Monitor};

use mediagate_gateway::metrics::GatewayMetrics;
use mediagate_gateway::providers::{
    HttpChatProvider, HttpMailProvider, HttpMediaProvider, HttpScreenshotProvider, ProviderConfig,
};
use mediagate_gateway::service::{GatewayService, GatewayState};

// ─────────────────────────────────────────────────────────────────────────
// Mock provider engine
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EngineState {
    pub search_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub capture_calls: AtomicUsize,
    pub mail_calls: AtomicUsize,
    /// When set, resolve answers HTTP 500.
    pub fail_resolve: AtomicBool,
    /// Artificial latency for resolve, in milliseconds.
    pub resolve_delay_ms: AtomicUsize,
}

pub struct MockEngine {
    pub base_url: String,
    pub state: Arc<EngineState>,
    _server: JoinHandle<()>,
}

async fn search_handler(
    State(state): State<Arc<EngineState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> axum::Json<Value> {
    state.search_calls.fetch_add(1, Ordering::SeqCst);
    let q = params
        .iter()
        .find(|(k, _)| k == "q")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    axum::Json(json!({
        "results": [
            {"title": format!("{q} result"), "url": "https://youtu.be/found"}
        ]
    }))
}

async fn resolve_handler(
    State(state): State<Arc<EngineState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<axum::Json<Value>, StatusCode> {
    state.resolve_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.resolve_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
    if state.fail_resolve.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let url = params
        .iter()
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    Ok(axum::Json(json!({
        "title": format!("title for {url}"),
        "thumbnail": "https://cdn.example/thumb.jpg",
        "duration": "3:14",
        "download_url": "https://cdn.example/payload",
        "preview_url": "https://cdn.example/preview",
        "engine": "mock-engine",
    })))
}

async fn chat_handler(State(state): State<Arc<EngineState>>) -> axum::Json<Value> {
    state.chat_calls.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"result": "the answer"}))
}

async fn capture_handler(State(state): State<Arc<EngineState>>) -> axum::Json<Value> {
    state.capture_calls.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"url": "/shots/latest.png"}))
}

async fn mail_handler(State(state): State<Arc<EngineState>>) -> StatusCode {
    state.mail_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

impl MockEngine {
    /// Start a mock engine serving every provider contract at once.
    pub async fn start() -> Self {
        let state = Arc::new(EngineState::default());
        let app = Router::new()
            .route("/search", get(search_handler))
            .route("/mp3", get(resolve_handler))
            .route("/mp4", get(resolve_handler))
            .route("/chat", get(chat_handler))
            .route("/capture", get(capture_handler))
            .route("/send", post(mail_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            _server: server,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Gateway harness
// ─────────────────────────────────────────────────────────────────────────

pub struct GatewayHarness {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    _server: JoinHandle<()>,
}

impl GatewayHarness {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

/// Build a gateway config suitable for tests: short provider timeout,
/// temp-backed backup paths.
pub fn test_config(backup_root: &std::path::Path, staging: &std::path::Path) -> GatewayConfig {
    GatewayConfig {
        author: "test-suite".to_string(),
        provider_timeout: Duration::from_secs(5),
        provider_connect_timeout: Duration::from_secs(2),
        backup_root: backup_root.to_path_buf(),
        backup_staging: staging.to_path_buf(),
        ..GatewayConfig::default()
    }
}

/// Build gateway state wired to the mock engine for every provider.
pub fn engine_backed_state(
    config: &GatewayConfig,
    engine: &MockEngine,
    breaker_threshold: u32,
    shutdown: CancellationToken,
) -> GatewayState {
    let monitor: Arc<dyn Monitor> = Arc::new(LogMonitor);
    let breaker = Arc::new(TrafficBreaker::new(
        BreakerConfig {
            threshold: breaker_threshold,
            window: Duration::from_secs(1),
        },
        shutdown,
        monitor.clone(),
    ));
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut registry));

    let provider_config = ProviderConfig::new(
        engine.base_url.clone(),
        config.provider_timeout,
        config.provider_connect_timeout,
    );

    GatewayState::new(config, breaker, monitor, metrics)
        .expect("gateway state")
        .with_media(Arc::new(
            HttpMediaProvider::new(provider_config.clone()).expect("media provider"),
        ))
        .with_chat(Arc::new(
            HttpChatProvider::new(provider_config.clone()).expect("chat provider"),
        ))
        .with_screenshot(Arc::new(
            HttpScreenshotProvider::new(provider_config.clone()).expect("screenshot provider"),
        ))
        .with_mail(Arc::new(
            HttpMailProvider::new(provider_config).expect("mail provider"),
        ))
}

/// Run the real hyper accept loop for `state` on an ephemeral port.
pub async fn spawn_gateway(state: GatewayState, shutdown: CancellationToken) -> GatewayHarness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = GatewayService::new(Arc::new(state));

    let loop_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, peer_addr)) = accepted else { break };
                    let conn_service = service.clone();
                    let conn_shutdown = loop_shutdown.clone();
                    tokio::spawn(async move {
                        let io = hyper_util::rt::TokioIo::new(stream);
                        let svc_fn = hyper::service::service_fn(move |req| {
                            let service = conn_service.clone();
                            let peer = peer_addr.to_string();
                            async move { service.handle(req, &peer).await }
                        });
                        let builder = hyper_util::server::conn::auto::Builder::new(
                            hyper_util::rt::TokioExecutor::new(),
                        );
                        let conn = builder.serve_connection(io, svc_fn);
                        tokio::pin!(conn);
                        tokio::select! {
                            _ = &mut conn => {}
                            _ = conn_shutdown.cancelled() => {
                                conn.as_mut().graceful_shutdown();
                                let _ = tokio::time::timeout(
                                    Duration::from_secs(2),
                                    conn,
                                ).await;
                            }
                        }
                    });
                }
                _ = loop_shutdown.cancelled() => break,
            }
        }
    });

    GatewayHarness {
        addr,
        shutdown,
        _server: server,
    }
}
