//! Provider adapter traits and payload types.
//!
//! Providers are external collaborators: the extraction engine, the AI chat
//! backend, the headless-browser screenshot renderer, and the mail relay.
//! The gateway only knows their call contracts; concrete HTTP-backed
//! implementations live in `mediagate-gateway`. The traits exist so tests
//! can inject mock providers without network access.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::GatewayError;

/// Media operation requested from the extraction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Mp3,
    Mp4,
}

impl MediaKind {
    /// Wire value used in the `type` envelope field and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Mp3 => "mp3",
            MediaKind::Mp4 => "mp4",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for an extracted media target, as served to clients and cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub thumbnail: String,
    pub duration: String,
    pub download_url: String,
    pub preview_url: String,
    /// Name of the extraction engine that produced this result.
    pub engine: String,
}

/// Screenshot capture viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScreenshotKind {
    #[default]
    Desktop,
    Tablet,
    Phone,
}

impl ScreenshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenshotKind::Desktop => "desktop",
            ScreenshotKind::Tablet => "tablet",
            ScreenshotKind::Phone => "phone",
        }
    }
}

impl FromStr for ScreenshotKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(ScreenshotKind::Desktop),
            "tablet" => Ok(ScreenshotKind::Tablet),
            "phone" | "mobile" => Ok(ScreenshotKind::Phone),
            other => Err(GatewayError::Validation(format!(
                "unknown screenshot type '{other}' (expected desktop, tablet or phone)"
            ))),
        }
    }
}

/// A support message submitted through the contact route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactMessage {
    #[serde(default)]
    pub name: String,
    pub email: String,
    pub message: String,
}

/// Extraction engine: keyword search and per-target media resolution.
#[async_trait::async_trait]
pub trait MediaProvider: Send + Sync {
    /// Search the engine's catalog by keyword.
    async fn search(&self, query: &str) -> Result<Vec<Value>, GatewayError>;

    /// Resolve a target URL into media metadata for the requested kind.
    ///
    /// This is the expensive call the cache-aside layer guards.
    async fn resolve(&self, url: &Url, kind: MediaKind) -> Result<MediaMetadata, GatewayError>;
}

/// AI chat backend.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run one chat turn; `model` selects a backend-specific model when set.
    async fn chat(&self, query: &str, model: Option<&str>) -> Result<String, GatewayError>;
}

/// Headless-browser screenshot renderer.
#[async_trait::async_trait]
pub trait ScreenshotProvider: Send + Sync {
    /// Capture `url` and return the served path of the rendered image.
    async fn capture(&self, url: &Url, kind: ScreenshotKind) -> Result<String, GatewayError>;
}

/// Outbound mail relay for contact messages.
#[async_trait::async_trait]
pub trait MailProvider: Send + Sync {
    async fn deliver(&self, message: &ContactMessage) -> Result<(), GatewayError>;
}
