//! Gateway request router.
//!
//! One entry point for all gateway traffic: consults the traffic breaker,
//! extracts parameters, dispatches to the route handlers and renders every
//! JSON outcome through the uniform envelope. The two binary routes
//! (stream relay, backup delivery) return streaming responses; everything
//! else is a buffered JSON envelope.
//!
//! Error propagation: handler failures become failure envelopes here.
//! Relay failures and the breaker trip are the exception — they are
//! connection-level, so they bubble out as `Err` and the connection layer
//! drops the socket without a body.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::{header, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use mediagate_core::breaker::TrafficBreaker;
use mediagate_core::cache::single_flight::FlightGroup;
use mediagate_core::cache::{CacheKey, CacheStore, MemoryCache};
use mediagate_core::config::GatewayConfig;
use mediagate_core::envelope::Envelope;
use mediagate_core::error::{GatewayError, GatewayResult};
use mediagate_core::monitor::{Monitor, RequestOutcome};
use mediagate_core::provider::{
    ChatProvider, MailProvider, MediaKind, MediaProvider, ScreenshotProvider,
};

use crate::backup::BackupArchiver;
use crate::dispatch::{self, RequestParams};
use crate::metrics::GatewayMetrics;
use crate::relay::{StreamKind, StreamRelay, StreamRequest};
use crate::timeout::StreamDeadlines;

/// Unified boxed body for all gateway responses: buffered JSON envelopes
/// and streamed binaries share one response type.
pub type UnifiedBody = http_body_util::combinators::BoxBody<Bytes, GatewayError>;

/// Upper bound for buffered JSON request bodies.
const MAX_JSON_BODY: usize = 1024 * 1024;

/// Shared gateway dependencies, built once at startup and injected.
pub struct GatewayState {
    pub envelope: Envelope,
    pub cache: Arc<dyn CacheStore>,
    pub flights: FlightGroup<CacheKey, Value>,
    pub media: Option<Arc<dyn MediaProvider>>,
    pub chat: Option<Arc<dyn ChatProvider>>,
    pub screenshot: Option<Arc<dyn ScreenshotProvider>>,
    pub mail: Option<Arc<dyn MailProvider>>,
    pub relay: StreamRelay,
    pub archiver: BackupArchiver,
    pub breaker: Arc<TrafficBreaker>,
    pub monitor: Arc<dyn Monitor>,
    pub metrics: Arc<GatewayMetrics>,
    pub provider_timeout: Duration,
}

impl GatewayState {
    /// Assemble state from configuration and the injected collaborators.
    /// Providers start unset; attach them with the `with_*` builders.
    pub fn new(
        config: &GatewayConfig,
        breaker: Arc<TrafficBreaker>,
        monitor: Arc<dyn Monitor>,
        metrics: Arc<GatewayMetrics>,
    ) -> GatewayResult<Self> {
        let cache: Arc<dyn CacheStore> = match config.cache_capacity {
            Some(capacity) => Arc::new(MemoryCache::bounded(capacity)),
            None => Arc::new(MemoryCache::new()),
        };
        let relay = StreamRelay::new(StreamDeadlines::new(
            config.stream_chunk_timeout,
            config.stream_total_timeout,
        ))?;
        let archiver =
            BackupArchiver::new(config.backup_root.clone(), config.backup_staging.clone());

        Ok(Self {
            envelope: Envelope::new(config.author.clone()),
            cache,
            flights: FlightGroup::new(),
            media: None,
            chat: None,
            screenshot: None,
            mail: None,
            relay,
            archiver,
            breaker,
            monitor,
            metrics,
            provider_timeout: config.provider_timeout,
        })
    }

    pub fn with_media(mut self, provider: Arc<dyn MediaProvider>) -> Self {
        self.media = Some(provider);
        self
    }

    pub fn with_chat(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.chat = Some(provider);
        self
    }

    pub fn with_screenshot(mut self, provider: Arc<dyn ScreenshotProvider>) -> Self {
        self.screenshot = Some(provider);
        self
    }

    pub fn with_mail(mut self, provider: Arc<dyn MailProvider>) -> Self {
        self.mail = Some(provider);
        self
    }
}

/// The gateway service; cheap to clone per connection.
#[derive(Clone)]
pub struct GatewayService {
    state: Arc<GatewayState>,
}

impl GatewayService {
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Handle one request. `client` is the peer identity used for breaker
    /// accounting and (redacted) outcome reporting.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        client: &str,
    ) -> GatewayResult<Response<UnifiedBody>>
    where
        B: http_body::Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        if !self.state.breaker.admit(client) {
            debug!(path = %path, "Refusing request, breaker is open");
            return Err(GatewayError::ShutDown);
        }

        let mut params = RequestParams::from_query(req.uri().query());
        if method == Method::POST {
            match Limited::new(req.into_body(), MAX_JSON_BODY).collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    if !bytes.is_empty() {
                        match serde_json::from_slice::<Value>(&bytes) {
                            Ok(value) => params.merge_json_body(value),
                            // Non-JSON POST bodies fall back to query params.
                            Err(e) => debug!(error = %e, "Ignoring unparseable request body"),
                        }
                    }
                }
                Err(_) => {
                    return self.finish_json(
                        &path,
                        client,
                        Err(GatewayError::Validation(format!(
                            "request body exceeds {MAX_JSON_BODY} bytes"
                        ))),
                    );
                }
            }
        }

        match (method.clone(), path.as_str()) {
            (Method::GET, "/") => self.finish_json(
                &path,
                client,
                Ok(json!({ "msg": "mediagate is alive" })),
            ),
            (Method::GET, "/api/backup") => self.handle_backup(&path, client).await,
            (Method::GET, "/api/stream") => self.handle_stream(&path, client, &params).await,
            (Method::GET | Method::POST, "/api/ytdl/search") => {
                let result = dispatch::search(&self.state, &params).await;
                self.finish_json(&path, client, result)
            }
            (Method::GET | Method::POST, "/api/ytdl/mp3") => {
                let result = dispatch::media(&self.state, &params, MediaKind::Mp3).await;
                self.finish_json(&path, client, result)
            }
            (Method::GET | Method::POST, "/api/ytdl/mp4") => {
                let result = dispatch::media(&self.state, &params, MediaKind::Mp4).await;
                self.finish_json(&path, client, result)
            }
            (Method::GET, "/api/ai") => {
                let result = dispatch::chat(&self.state, &params).await;
                self.finish_json(&path, client, result)
            }
            (Method::GET, "/api/ssweb") => {
                let result = dispatch::screenshot(&self.state, &params).await;
                self.finish_json(&path, client, result)
            }
            (Method::POST, "/api/contact") => {
                let result = dispatch::contact(&self.state, &params).await;
                self.finish_json(&path, client, result)
            }
            _ => {
                self.state.metrics.record_request(&path, false);
                self.state
                    .monitor
                    .report(&RequestOutcome::failure(&path, client, "route not found"));
                self.json_response(
                    StatusCode::NOT_FOUND,
                    self.state.envelope.failure("route not found"),
                )
            }
        }
    }

    async fn handle_backup(
        &self,
        route: &str,
        client: &str,
    ) -> GatewayResult<Response<UnifiedBody>> {
        let delivered = match self.state.archiver.create().await {
            Ok(job) => self.state.archiver.deliver(job).await,
            Err(e) => Err(e),
        };

        match delivered {
            Ok(response) => {
                self.state.metrics.backups_total.inc();
                self.state.metrics.record_request(route, true);
                self.state
                    .monitor
                    .report(&RequestOutcome::success(route, client));
                Ok(response)
            }
            Err(e) => self.finish_json(route, client, Err(e)),
        }
    }

    async fn handle_stream(
        &self,
        route: &str,
        client: &str,
        params: &RequestParams,
    ) -> GatewayResult<Response<UnifiedBody>> {
        let stream_req = match parse_stream_request(params) {
            Ok(parsed) => parsed,
            Err(e) => return self.finish_json(route, client, Err(e)),
        };

        match self.state.relay.relay(stream_req).await {
            Ok(response) => {
                self.state.metrics.record_request(route, true);
                self.state
                    .monitor
                    .report(&RequestOutcome::success(route, client));
                Ok(response)
            }
            Err(e @ GatewayError::Validation(_)) => self.finish_json(route, client, Err(e)),
            Err(e) => {
                // Headers may already be committed: drop the connection.
                self.state.metrics.record_request(route, false);
                self.state
                    .monitor
                    .report(&RequestOutcome::failure(route, client, e.to_string()));
                Err(e)
            }
        }
    }

    /// Render a handler result as the uniform envelope, recording the
    /// outcome. Connection-level errors propagate instead.
    fn finish_json(
        &self,
        route: &str,
        client: &str,
        result: GatewayResult<Value>,
    ) -> GatewayResult<Response<UnifiedBody>> {
        match result {
            Ok(payload) => {
                self.state.metrics.record_request(route, true);
                self.state
                    .monitor
                    .report(&RequestOutcome::success(route, client));
                self.json_response(StatusCode::OK, self.state.envelope.success(payload))
            }
            Err(e) if e.is_connection_level() => {
                self.state.metrics.record_request(route, false);
                self.state
                    .monitor
                    .report(&RequestOutcome::failure(route, client, e.to_string()));
                Err(e)
            }
            Err(e) => {
                self.state.metrics.record_request(route, false);
                self.state
                    .monitor
                    .report(&RequestOutcome::failure(route, client, e.to_string()));
                warn!(route = %route, error = %e, "Request failed");
                let status = StatusCode::from_u16(e.status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                self.json_response(status, self.state.envelope.failure(e.to_string()))
            }
        }
    }

    fn json_response(
        &self,
        status: StatusCode,
        body: Value,
    ) -> GatewayResult<Response<UnifiedBody>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            // Full<Bytes> has an Infallible error: convert via the absurd pattern.
            .body(
                Full::new(Bytes::from(body.to_string()))
                    .map_err(|e| match e {})
                    .boxed(),
            )
            .map_err(|e| GatewayError::Provider(format!("failed to build response: {e}")))
    }
}

fn parse_stream_request(params: &RequestParams) -> GatewayResult<StreamRequest> {
    let raw_url = params.require("url")?;
    let origin_url = url::Url::parse(raw_url.trim())
        .map_err(|e| GatewayError::Validation(format!("malformed url: {e}")))?;
    let kind = params.require("type")?.parse::<StreamKind>()?;
    let title = params.get("title").unwrap_or("media").to_string();
    let force_download = params.flag("download");

    Ok(StreamRequest {
        origin_url,
        kind,
        title,
        force_download,
    })
}
