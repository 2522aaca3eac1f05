//! Route dispatch: parameter extraction and provider invocation.
//!
//! Cached media routes go through the cache-aside path: consult the store,
//! collapse concurrent identical misses into one provider call, write back
//! on success. Non-cached routes (search, chat, screenshot, contact) call
//! their adapter on every request. Either way the result is a payload for
//! the uniform envelope; downstream failures surface as `GatewayError` and
//! are rendered by the service layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use mediagate_core::cache::CacheKey;
use mediagate_core::error::{GatewayError, GatewayResult};
use mediagate_core::provider::{ContactMessage, MediaKind, ScreenshotKind};

use crate::service::GatewayState;

/// Parameters merged from the query string and an optional JSON body.
///
/// Body values win over query values, matching what clients of the POST
/// variants expect.
#[derive(Debug, Default, Clone)]
pub struct RequestParams {
    values: HashMap<String, String>,
    body: Option<Value>,
}

impl RequestParams {
    pub fn from_query(query: Option<&str>) -> Self {
        let values = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        Self { values, body: None }
    }

    /// Merge scalar fields of a JSON object body over the query values.
    pub fn merge_json_body(&mut self, body: Value) {
        if let Value::Object(fields) = &body {
            for (key, value) in fields {
                let scalar = match value {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                };
                if let Some(scalar) = scalar {
                    self.values.insert(key.clone(), scalar);
                }
            }
        }
        self.body = Some(body);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> GatewayResult<&str> {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| GatewayError::Validation(format!("{key} parameter is required")))
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Truthy flags: `1`, `true`, `yes` (any case).
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(str::to_ascii_lowercase).as_deref(),
            Some("1") | Some("true") | Some("yes")
        )
    }
}

/// Cache-aside media dispatch for the mp3/mp4 routes.
///
/// Once the provider call has been dispatched it runs to completion (or
/// failure) in a detached task: a client disconnect does not cancel work
/// already handed to the engine, and the settled result still lands in the
/// cache for every coalesced waiter.
pub async fn media(
    state: &Arc<GatewayState>,
    params: &RequestParams,
    kind: MediaKind,
) -> GatewayResult<Value> {
    let raw_url = params.require("url")?;
    let key = CacheKey::new(raw_url, kind)?;

    match state.cache.get(&key).await {
        Ok(Some(cached)) => {
            state.metrics.record_cache_lookup("hit");
            return Ok(json!({
                "type": kind.as_str(),
                "cached": true,
                "metadata": cached,
            }));
        }
        Ok(None) => state.metrics.record_cache_lookup("miss"),
        Err(e) => {
            // An unavailable store is a permanent miss, never a failure.
            warn!(error = %e, "Cache store unavailable, treating as miss");
            state.metrics.record_cache_lookup("miss");
        }
    }

    let provider = state
        .media
        .as_ref()
        .ok_or_else(|| GatewayError::Provider("media engine is not configured".into()))?
        .clone();

    // CacheKey::new already validated the URL.
    let target = Url::parse(key.url())
        .map_err(|e| GatewayError::Validation(format!("malformed url: {e}")))?;

    let task_state = state.clone();
    let flight = tokio::spawn(async move {
        let cache = task_state.cache.clone();
        let metrics = task_state.metrics.clone();
        let timeout = task_state.provider_timeout;
        let flight_key = key.clone();

        task_state
            .flights
            .run(key, move || async move {
                let started = Instant::now();
                let resolved =
                    tokio::time::timeout(timeout, provider.resolve(&target, kind)).await;
                metrics
                    .record_provider_duration("media", started.elapsed().as_secs_f64() * 1000.0);

                let metadata = match resolved {
                    Ok(Ok(metadata)) => metadata,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        return Err(GatewayError::ProviderTimeout {
                            timeout_secs: timeout.as_secs(),
                        })
                    }
                };

                let value = serde_json::to_value(&metadata)
                    .map_err(|e| GatewayError::Provider(format!("unserializable metadata: {e}")))?;

                // Failed writes degrade to a permanent miss on the next request.
                if let Err(e) = cache.put(&flight_key, value.clone()).await {
                    warn!(error = %e, "Cache store unavailable, result not cached");
                }
                Ok(value)
            })
            .await
    });

    let metadata = flight
        .await
        .map_err(|e| GatewayError::Provider(format!("dispatch task failed: {e}")))??;

    Ok(json!({
        "type": kind.as_str(),
        "metadata": metadata,
    }))
}

/// Keyword search against the extraction engine. Never cached.
pub async fn search(state: &GatewayState, params: &RequestParams) -> GatewayResult<Value> {
    let query = params
        .get("q")
        .or_else(|| params.get("query"))
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| GatewayError::Validation("q parameter is required".into()))?;

    let provider = state
        .media
        .as_ref()
        .ok_or_else(|| GatewayError::Provider("media engine is not configured".into()))?;

    let started = Instant::now();
    let results = tokio::time::timeout(state.provider_timeout, provider.search(query))
        .await
        .map_err(|_| GatewayError::ProviderTimeout {
            timeout_secs: state.provider_timeout.as_secs(),
        })??;
    state
        .metrics
        .record_provider_duration("media", started.elapsed().as_secs_f64() * 1000.0);

    Ok(json!({ "results": results }))
}

/// One AI chat turn. Never cached.
pub async fn chat(state: &GatewayState, params: &RequestParams) -> GatewayResult<Value> {
    let query = params.require("query")?;
    let model = params.get("model");

    let provider = state
        .chat
        .as_ref()
        .ok_or_else(|| GatewayError::Provider("chat backend is not configured".into()))?;

    let started = Instant::now();
    let answer = tokio::time::timeout(state.provider_timeout, provider.chat(query, model))
        .await
        .map_err(|_| GatewayError::ProviderTimeout {
            timeout_secs: state.provider_timeout.as_secs(),
        })??;
    state
        .metrics
        .record_provider_duration("chat", started.elapsed().as_secs_f64() * 1000.0);

    Ok(json!({ "result": answer }))
}

/// Screenshot capture. Never cached.
pub async fn screenshot(state: &GatewayState, params: &RequestParams) -> GatewayResult<Value> {
    let raw_url = params.require("url")?;
    let target = Url::parse(raw_url.trim())
        .map_err(|e| GatewayError::Validation(format!("malformed url: {e}")))?;
    let kind = match params.get("type") {
        Some(raw) => raw.parse::<ScreenshotKind>()?,
        None => ScreenshotKind::default(),
    };

    let provider = state
        .screenshot
        .as_ref()
        .ok_or_else(|| GatewayError::Provider("screenshot renderer is not configured".into()))?;

    let started = Instant::now();
    let served = tokio::time::timeout(state.provider_timeout, provider.capture(&target, kind))
        .await
        .map_err(|_| GatewayError::ProviderTimeout {
            timeout_secs: state.provider_timeout.as_secs(),
        })??;
    state
        .metrics
        .record_provider_duration("screenshot", started.elapsed().as_secs_f64() * 1000.0);

    Ok(json!({ "url": served }))
}

/// Forward a contact message to the mail relay.
pub async fn contact(state: &GatewayState, params: &RequestParams) -> GatewayResult<Value> {
    let message = ContactMessage {
        name: params.get("name").unwrap_or_default().to_string(),
        email: params.require("email")?.to_string(),
        message: params.require("message")?.to_string(),
    };

    let provider = state
        .mail
        .as_ref()
        .ok_or_else(|| GatewayError::Provider("mail relay is not configured".into()))?;

    let started = Instant::now();
    tokio::time::timeout(state.provider_timeout, provider.deliver(&message))
        .await
        .map_err(|_| GatewayError::ProviderTimeout {
            timeout_secs: state.provider_timeout.as_secs(),
        })??;
    state
        .metrics
        .record_provider_duration("mail", started.elapsed().as_secs_f64() * 1000.0);

    Ok(json!({ "msg": "message delivered" }))
}
