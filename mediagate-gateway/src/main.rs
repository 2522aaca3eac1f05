//! Mediagate — HTTP gateway for slow media, AI and screenshot providers.
//!
//! Exposes a small uniform JSON/binary API in front of heterogeneous
//! downstream engines, with cache-aside dispatch, a streaming byte relay,
//! a self-triggered emergency shutdown breaker, and on-demand snapshot
//! backups.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mediagate_core::breaker::{BreakerConfig, TrafficBreaker};
use mediagate_core::config::GatewayConfig;
use mediagate_core::monitor::{LogMonitor, Monitor, RequestOutcome};

use mediagate_gateway::admin::AdminServer;
use mediagate_gateway::metrics::GatewayMetrics;
use mediagate_gateway::providers::{
    HttpChatProvider, HttpMailProvider, HttpMediaProvider, HttpScreenshotProvider, ProviderConfig,
};
use mediagate_gateway::service::{GatewayService, GatewayState};

/// Command-line surface. Most configuration lives in `MEDIAGATE_*`
/// environment variables; the CLI only overrides the listeners.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address (overrides MEDIAGATE_BIND)
    #[arg(short, long)]
    bind: Option<String>,

    /// Gateway port (overrides MEDIAGATE_PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

/// Monitor that layers gateway metrics over structured log reporting.
struct MetricsMonitor {
    inner: LogMonitor,
    metrics: Arc<GatewayMetrics>,
}

impl Monitor for MetricsMonitor {
    fn report(&self, outcome: &RequestOutcome) {
        self.inner.report(outcome);
    }

    fn breaker_tripped(&self, client: &str, reason: &str) {
        self.metrics.breaker_trips_total.inc();
        self.inner.breaker_tripped(client, reason);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Phase 1: observability. The guard must live for the whole process so
    // buffered log lines are flushed on exit.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Phase 2: configuration.
    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env();
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    // Phase 3: metrics registry and unified shutdown token.
    let mut prom_registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut prom_registry));
    let prom_registry = Arc::new(prom_registry);
    let shutdown = CancellationToken::new();

    let monitor: Arc<dyn Monitor> = Arc::new(MetricsMonitor {
        inner: LogMonitor,
        metrics: metrics.clone(),
    });

    let breaker = Arc::new(TrafficBreaker::new(
        BreakerConfig {
            threshold: config.rate_limit,
            window: Duration::from_secs(1),
        },
        shutdown.clone(),
        monitor.clone(),
    ));

    // Uptime gauge updater.
    let uptime_metrics = metrics.clone();
    let startup_instant = std::time::Instant::now();
    let uptime_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    uptime_metrics
                        .uptime_seconds
                        .set(startup_instant.elapsed().as_secs() as i64);
                }
                _ = uptime_shutdown.cancelled() => break,
            }
        }
    });

    // Phase 4: admin server on its dedicated port.
    let admin_addr = format!("{}:{}", config.bind, config.admin_port);
    let admin_shutdown = shutdown.clone();
    let admin_registry = prom_registry.clone();
    tokio::spawn(async move {
        let admin = AdminServer::new(admin_addr, admin_registry);
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });
    info!(
        admin_port = config.admin_port,
        "Admin server started (/health, /metrics)"
    );

    // Phase 5: provider adapters for every configured engine.
    let mut state = GatewayState::new(&config, breaker, monitor, metrics.clone())?;
    let provider_config = |base_url: &str| {
        ProviderConfig::new(
            base_url,
            config.provider_timeout,
            config.provider_connect_timeout,
        )
    };
    if let Some(base_url) = &config.providers.media {
        state = state.with_media(Arc::new(HttpMediaProvider::new(provider_config(base_url))?));
        info!(engine = %base_url, "Media extraction engine configured");
    }
    if let Some(base_url) = &config.providers.chat {
        state = state.with_chat(Arc::new(HttpChatProvider::new(provider_config(base_url))?));
        info!(engine = %base_url, "Chat backend configured");
    }
    if let Some(base_url) = &config.providers.screenshot {
        state = state.with_screenshot(Arc::new(HttpScreenshotProvider::new(provider_config(
            base_url,
        ))?));
        info!(engine = %base_url, "Screenshot renderer configured");
    }
    if let Some(base_url) = &config.providers.mail {
        state = state.with_mail(Arc::new(HttpMailProvider::new(provider_config(base_url))?));
        info!(engine = %base_url, "Mail relay configured");
    }
    let service = GatewayService::new(Arc::new(state));

    // Phase 6: bind the gateway listener.
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        rate_limit = config.rate_limit,
        provider_timeout_secs = config.provider_timeout.as_secs(),
        max_connections = config.max_connections,
        "Mediagate listening"
    );

    setup_signal_handlers(shutdown.clone());

    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let connection_timeout = config.connection_timeout;

    // Main accept loop. The breaker cancels `shutdown` when it trips, which
    // lands here and stops the process from serving.
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(peer = %peer_addr, "Rejected connection: at capacity");
                                tokio::spawn(async move {
                                    let _ = send_503_response(stream).await;
                                });
                                continue;
                            }
                        };

                        if let Err(e) = configure_tcp_stream(&stream, &config) {
                            debug!(error = %e, "Failed to tune socket");
                        }

                        metrics.connections_active.inc();
                        let conn_service = service.clone();
                        let conn_shutdown = shutdown.clone();
                        let conn_metrics = metrics.clone();

                        tokio::spawn(async move {
                            let served = tokio::time::timeout(
                                connection_timeout,
                                handle_connection(stream, peer_addr.to_string(), conn_service, conn_shutdown),
                            )
                            .await;
                            match served {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => debug!(error = %e, "Connection closed with error"),
                                Err(_) => warn!(
                                    peer = %peer_addr,
                                    timeout_secs = connection_timeout.as_secs(),
                                    "Connection timed out, dropping"
                                ),
                            }
                            conn_metrics.connections_active.dec();
                            drop(permit);
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, no longer accepting connections");
                break;
            }
        }
    }

    info!("Mediagate stopped");
    Ok(())
}

/// SIGINT and SIGTERM both begin a graceful shutdown via the unified token.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let sigint_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, shutting down");
                sigint_shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
            }
        });
    }

    #[cfg(not(unix))]
    let _ = shutdown;
}

/// Serve one connection. Handler errors are connection-level by contract
/// (breaker refusal, broken relay): returning them to hyper aborts the
/// socket without a structured body.
async fn handle_connection(
    stream: TcpStream,
    peer: String,
    service: GatewayService,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req: Request<Incoming>| {
        let service = service.clone();
        let peer = peer.clone();
        async move { service.handle(req, &peer).await }
    });

    let builder = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => result,
        _ = shutdown.cancelled() => {
            debug!("Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
            Ok(())
        }
    }
}

/// Tune an accepted socket: TCP_NODELAY, keepalive, buffer sizes.
fn configure_tcp_stream(stream: &TcpStream, config: &GatewayConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_send_buffer_size(config.socket_buffer_size)?;

    Ok(())
}

/// Plain-text 503 for connections rejected at the capacity bound.
async fn send_503_response(mut stream: TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = "503 Service Unavailable\n\n\
                Mediagate has reached its connection limit.\n\
                Please retry your request in a moment.";
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Retry-After: 1\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
