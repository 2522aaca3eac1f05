//! Streaming byte relay.
//!
//! Pulls a media payload from an origin URL and forwards it to the client
//! without materializing the body: as soon as origin headers arrive the
//! response is built around a pass-through streaming body. Hyper's pull
//! model gives the ordering and backpressure guarantees for free — a chunk
//! is only requested from the origin once the previous one has been
//! flushed to the client, and dropping the body (client disconnect) tears
//! down the origin connection.
//!
//! Relay failures are connection-level: once headers may have been
//! committed there is no way to deliver a JSON error body, so the caller
//! drops the client socket and logs instead.

use std::str::FromStr;
use std::sync::OnceLock;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, BodyStream, Empty, StreamBody};
use hyper::header;
use hyper::{Request, Response, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::{info, warn};
use url::Url;

use mediagate_core::error::{GatewayError, GatewayResult};

use crate::service::UnifiedBody;
use crate::timeout::{DeadlineBody, StreamDeadlines};

/// Content kind of a relayed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio/mpeg",
            StreamKind::Video => "video/mp4",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            StreamKind::Audio => "mp3",
            StreamKind::Video => "mp4",
        }
    }
}

impl FromStr for StreamKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" | "mp3" => Ok(StreamKind::Audio),
            "video" | "mp4" => Ok(StreamKind::Video),
            other => Err(GatewayError::Validation(format!(
                "unknown stream type '{other}' (expected audio or video)"
            ))),
        }
    }
}

/// One relay request, owned by the connection that issued it.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub origin_url: Url,
    pub kind: StreamKind,
    pub title: String,
    pub force_download: bool,
}

/// HTTPS-capable relay with streaming pass-through.
#[derive(Clone)]
pub struct StreamRelay {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    deadlines: StreamDeadlines,
}

impl StreamRelay {
    /// Build the relay client.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Relay` if the TLS crypto provider cannot be
    /// installed or native roots cannot be loaded.
    pub fn new(deadlines: StreamDeadlines) -> GatewayResult<Self> {
        // rustls needs a process-wide crypto provider exactly once.
        static RUSTLS_INIT: OnceLock<Result<(), ()>> = OnceLock::new();
        let init = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init.is_err() {
            return Err(GatewayError::Relay(
                "failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);
        http_connector.enforce_http(false);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| GatewayError::Relay(format!("failed to load native TLS roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build(https_connector);

        Ok(Self { client, deadlines })
    }

    /// Open the origin and return a streaming pass-through response.
    pub async fn relay(&self, stream_req: StreamRequest) -> GatewayResult<Response<UnifiedBody>> {
        let origin_uri: hyper::Uri = stream_req
            .origin_url
            .as_str()
            .parse()
            .map_err(|e| GatewayError::Validation(format!("malformed origin url: {e}")))?;

        info!(
            origin = %stream_req.origin_url,
            kind = ?stream_req.kind,
            download = stream_req.force_download,
            "Opening origin stream"
        );

        let origin_req = Request::builder()
            .method(hyper::Method::GET)
            .uri(origin_uri)
            .header(header::USER_AGENT, concat!("mediagate/", env!("CARGO_PKG_VERSION")))
            .body(Empty::new())
            .map_err(|e| GatewayError::Relay(format!("failed to build origin request: {e}")))?;

        let origin_res = self.client.request(origin_req).await.map_err(|e| {
            warn!(origin = %stream_req.origin_url, error = %e, "Origin connection failed");
            GatewayError::Relay(format!("origin connection failed: {e}"))
        })?;

        if !origin_res.status().is_success() {
            warn!(
                origin = %stream_req.origin_url,
                status = %origin_res.status(),
                "Origin returned error status"
            );
            return Err(GatewayError::Relay(format!(
                "origin returned {}",
                origin_res.status()
            )));
        }

        let content_length = origin_res
            .headers()
            .get(header::CONTENT_LENGTH)
            .cloned();

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, stream_req.kind.content_type())
            .header(
                header::CONTENT_DISPOSITION,
                content_disposition(&stream_req.title, stream_req.kind, stream_req.force_download),
            );
        if let Some(length) = content_length {
            response = response.header(header::CONTENT_LENGTH, length);
        }

        // Forward the origin body chunk-by-chunk under stream deadlines.
        let (_parts, origin_body) = origin_res.into_parts();
        let deadline_body = DeadlineBody::new(origin_body, self.deadlines);
        let mapped = BodyStream::new(deadline_body)
            .map(|frame| frame.map_err(|e| GatewayError::Relay(format!("origin stream broke: {e}"))));
        let body: UnifiedBody = BodyExt::boxed(StreamBody::new(mapped));

        response
            .body(body)
            .map_err(|e| GatewayError::Relay(format!("failed to build relay response: {e}")))
    }
}

/// Replace every character outside `[A-Za-z0-9]` with `_`.
///
/// The result is embedded in a `Content-Disposition` header: no spaces,
/// separators, quotes or control bytes survive.
pub fn sanitize_filename(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Build the `Content-Disposition` value for a relayed payload.
pub fn content_disposition(title: &str, kind: StreamKind, force_download: bool) -> String {
    if force_download {
        let name = sanitize_filename(title);
        let name = if name.is_empty() {
            "download".to_string()
        } else {
            name
        };
        format!("attachment; filename=\"{}.{}\"", name, kind.extension())
    } else {
        "inline".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_everything_but_alphanumerics() {
        assert_eq!(sanitize_filename("Song / Title?.mp3"), "Song___Title__mp3");
        assert_eq!(sanitize_filename("plain"), "plain");
        assert_eq!(sanitize_filename("ÜberTrack!"), "_berTrack_");
    }

    #[test]
    fn test_sanitized_name_has_no_header_metacharacters() {
        let sanitized = sanitize_filename("evil\"; rm -rf /\r\nX-Injected: 1");
        assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_disposition_attachment_with_fixed_extension() {
        let value = content_disposition("Song / Title?.mp3", StreamKind::Audio, true);
        assert_eq!(value, "attachment; filename=\"Song___Title__mp3.mp3\"");

        let inner = value
            .strip_prefix("attachment; filename=\"")
            .and_then(|s| s.strip_suffix("\""))
            .unwrap();
        let (stem, ext) = inner.rsplit_once('.').unwrap();
        assert_eq!(ext, "mp3");
        assert!(stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_disposition_inline_when_not_forced() {
        assert_eq!(
            content_disposition("anything", StreamKind::Video, false),
            "inline"
        );
    }

    #[test]
    fn test_disposition_empty_title_falls_back() {
        assert_eq!(
            content_disposition("???", StreamKind::Video, true),
            "attachment; filename=\"___.mp4\""
        );
        assert_eq!(
            content_disposition("", StreamKind::Video, true),
            "attachment; filename=\"download.mp4\""
        );
    }

    #[test]
    fn test_stream_kind_parsing_and_headers() {
        assert_eq!("audio".parse::<StreamKind>().unwrap(), StreamKind::Audio);
        assert_eq!("mp4".parse::<StreamKind>().unwrap(), StreamKind::Video);
        assert!("flac".parse::<StreamKind>().is_err());

        assert_eq!(StreamKind::Audio.content_type(), "audio/mpeg");
        assert_eq!(StreamKind::Video.content_type(), "video/mp4");
    }
}
