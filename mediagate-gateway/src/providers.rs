//! HTTP-backed provider adapters.
//!
//! Each downstream engine is reached through a pooled reqwest client with
//! a generous request deadline — media extraction and headless rendering
//! legitimately run for minutes, so the provider timeout is configured far
//! above normal API expectations. Transport errors are classified into the
//! gateway taxonomy here so the dispatch layer never sees reqwest types.
//!
//! No adapter retries: a failed extraction is surfaced to the client,
//! which must resubmit.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use mediagate_core::error::{GatewayError, GatewayResult};
use mediagate_core::provider::{
    ChatProvider, ContactMessage, MailProvider, MediaKind, MediaMetadata, MediaProvider,
    ScreenshotKind, ScreenshotProvider,
};

/// Connection settings shared by all provider adapters.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            connect_timeout,
        }
    }
}

fn build_client(config: &ProviderConfig) -> GatewayResult<Client> {
    if config.base_url.is_empty() {
        return Err(GatewayError::Provider("provider base url is empty".into()));
    }
    if let Err(e) = reqwest::Url::parse(&config.base_url) {
        return Err(GatewayError::Provider(format!(
            "invalid provider base url '{}': {e}",
            config.base_url
        )));
    }

    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| GatewayError::Provider(format!("failed to build provider client: {e}")))
}

/// Classify a reqwest transport error into the gateway taxonomy.
fn classify_error(error: reqwest::Error, timeout: Duration, target: &str) -> GatewayError {
    if error.is_timeout() {
        warn!(target = %target, timeout_secs = timeout.as_secs(), "Provider request timed out");
        GatewayError::ProviderTimeout {
            timeout_secs: timeout.as_secs(),
        }
    } else if error.is_connect() {
        warn!(target = %target, error = %error, "Failed to connect to provider");
        GatewayError::Provider(format!("connection to {target} failed: {error}"))
    } else {
        warn!(target = %target, error = %error, "Provider request failed");
        GatewayError::Provider(error.to_string())
    }
}

async fn read_json(response: reqwest::Response, target: &str) -> GatewayResult<Value> {
    let status = response.status();
    if !status.is_success() {
        return Err(GatewayError::Provider(format!(
            "{target} returned HTTP {status}"
        )));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| GatewayError::Provider(format!("unparseable {target} response: {e}")))
}

/// Media extraction engine adapter.
///
/// Engine contract: `GET /search?q=<keyword>` returns `{"results": [...]}`
/// (or a bare array); `GET /<kind>?url=<target>` returns the metadata
/// object for that target.
#[derive(Clone)]
pub struct HttpMediaProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpMediaProvider {
    pub fn new(config: ProviderConfig) -> GatewayResult<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl MediaProvider for HttpMediaProvider {
    async fn search(&self, query: &str) -> GatewayResult<Vec<Value>> {
        debug!(query = %query, "Searching extraction engine");
        let response = self
            .client
            .get(self.endpoint("search"))
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| classify_error(e, self.config.timeout, "extraction engine"))?;

        let body = read_json(response, "extraction engine").await?;
        match body {
            Value::Array(items) => Ok(items),
            Value::Object(mut fields) => match fields.remove("results") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(GatewayError::Provider(
                    "extraction engine returned no results array".into(),
                )),
            },
            _ => Err(GatewayError::Provider(
                "extraction engine returned no results array".into(),
            )),
        }
    }

    async fn resolve(&self, url: &Url, kind: MediaKind) -> GatewayResult<MediaMetadata> {
        debug!(target = %url, kind = %kind, "Resolving media target");
        let response = self
            .client
            .get(self.endpoint(kind.as_str()))
            .query(&[("url", url.as_str())])
            .send()
            .await
            .map_err(|e| classify_error(e, self.config.timeout, "extraction engine"))?;

        let body = read_json(response, "extraction engine").await?;
        serde_json::from_value(body)
            .map_err(|e| GatewayError::Provider(format!("malformed engine metadata: {e}")))
    }
}

/// AI chat backend adapter. `GET /chat?query=<q>[&model=<m>]` returns
/// `{"result": "..."}` or a bare string.
#[derive(Clone)]
pub struct HttpChatProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpChatProvider {
    pub fn new(config: ProviderConfig) -> GatewayResult<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, query: &str, model: Option<&str>) -> GatewayResult<String> {
        let mut request = self
            .client
            .get(format!(
                "{}/chat",
                self.config.base_url.trim_end_matches('/')
            ))
            .query(&[("query", query)]);
        if let Some(model) = model {
            request = request.query(&[("model", model)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_error(e, self.config.timeout, "chat backend"))?;

        let body = read_json(response, "chat backend").await?;
        match body {
            Value::String(text) => Ok(text),
            Value::Object(fields) => fields
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| GatewayError::Provider("chat backend returned no result".into())),
            _ => Err(GatewayError::Provider(
                "chat backend returned no result".into(),
            )),
        }
    }
}

/// Screenshot renderer adapter. `GET /capture?url=<u>&type=<kind>` returns
/// `{"url": "<served path>"}`.
#[derive(Clone)]
pub struct HttpScreenshotProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpScreenshotProvider {
    pub fn new(config: ProviderConfig) -> GatewayResult<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl ScreenshotProvider for HttpScreenshotProvider {
    async fn capture(&self, url: &Url, kind: ScreenshotKind) -> GatewayResult<String> {
        let response = self
            .client
            .get(format!(
                "{}/capture",
                self.config.base_url.trim_end_matches('/')
            ))
            .query(&[("url", url.as_str()), ("type", kind.as_str())])
            .send()
            .await
            .map_err(|e| classify_error(e, self.config.timeout, "screenshot renderer"))?;

        let body = read_json(response, "screenshot renderer").await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::Provider("screenshot renderer returned no url".into())
            })
    }
}

/// Mail relay adapter. `POST /send` with the contact message as JSON.
#[derive(Clone)]
pub struct HttpMailProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpMailProvider {
    pub fn new(config: ProviderConfig) -> GatewayResult<Self> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl MailProvider for HttpMailProvider {
    async fn deliver(&self, message: &ContactMessage) -> GatewayResult<()> {
        let response = self
            .client
            .post(format!(
                "{}/send",
                self.config.base_url.trim_end_matches('/')
            ))
            .json(message)
            .send()
            .await
            .map_err(|e| classify_error(e, self.config.timeout, "mail relay"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Provider(format!(
                "mail relay returned HTTP {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> ProviderConfig {
        ProviderConfig::new(
            server.uri(),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let config = ProviderConfig::new(
            "not-a-url",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(
            HttpMediaProvider::new(config),
            Err(GatewayError::Provider(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_parses_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mp3"))
            .and(query_param("url", "https://youtu.be/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": "A Song",
                "thumbnail": "https://cdn/t.jpg",
                "duration": "3:14",
                "download_url": "https://cdn/a.mp3",
                "preview_url": "https://cdn/p",
                "engine": "ytdl-core",
            })))
            .mount(&server)
            .await;

        let provider = HttpMediaProvider::new(config_for(&server)).unwrap();
        let url = Url::parse("https://youtu.be/abc123").unwrap();
        let metadata = provider.resolve(&url, MediaKind::Mp3).await.unwrap();

        assert_eq!(metadata.title, "A Song");
        assert_eq!(metadata.engine, "ytdl-core");
    }

    #[tokio::test]
    async fn test_engine_error_status_classified_as_provider_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mp4"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = HttpMediaProvider::new(config_for(&server)).unwrap();
        let url = Url::parse("https://youtu.be/abc123").unwrap();
        let result = provider.resolve(&url, MediaKind::Mp4).await;

        match result {
            Err(GatewayError::Provider(msg)) => assert!(msg.contains("HTTP 500"), "got: {msg}"),
            other => panic!("expected Provider error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_engine_classified_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(json!({})),
            )
            .mount(&server)
            .await;

        let provider = HttpMediaProvider::new(config_for(&server)).unwrap();
        let url = Url::parse("https://youtu.be/abc123").unwrap();
        let result = provider.resolve(&url, MediaKind::Mp3).await;

        assert!(matches!(
            result,
            Err(GatewayError::ProviderTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_search_accepts_wrapped_and_bare_arrays() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "lofi"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [{"title": "hit"}]})),
            )
            .mount(&server)
            .await;

        let provider = HttpMediaProvider::new(config_for(&server)).unwrap();
        let results = provider.search("lofi").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["title"], "hit");
    }

    #[tokio::test]
    async fn test_chat_reads_result_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat"))
            .and(query_param("query", "hello"))
            .and(query_param("model", "gpt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "hi there"})))
            .mount(&server)
            .await;

        let provider = HttpChatProvider::new(config_for(&server)).unwrap();
        let answer = provider.chat("hello", Some("gpt")).await.unwrap();
        assert_eq!(answer, "hi there");
    }

    #[tokio::test]
    async fn test_screenshot_reads_served_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/capture"))
            .and(query_param("type", "phone"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"url": "/shots/1.png"})),
            )
            .mount(&server)
            .await;

        let provider = HttpScreenshotProvider::new(config_for(&server)).unwrap();
        let url = Url::parse("https://example.com").unwrap();
        let served = provider.capture(&url, ScreenshotKind::Phone).await.unwrap();
        assert_eq!(served, "/shots/1.png");
    }

    #[tokio::test]
    async fn test_mail_delivery_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let provider = HttpMailProvider::new(config_for(&server)).unwrap();
        let message = ContactMessage {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            message: "hello".into(),
        };
        assert!(provider.deliver(&message).await.is_ok());
    }
}
