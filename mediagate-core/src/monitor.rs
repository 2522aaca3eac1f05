//! Per-request outcome reporting to the operations collaborator.
//!
//! The gateway core does not format or deliver reports itself; it hands
//! [`RequestOutcome`] events to a [`Monitor`] implementation. The default
//! [`LogMonitor`] emits structured tracing events; deployments can plug in
//! a delivery-backed implementation at construction time.

use serde::Serialize;
use tracing::{info, warn};

/// Outcome of one handled request, emitted after the response is decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub route: String,
    pub success: bool,
    /// Partially redacted client identity; never a full address.
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl RequestOutcome {
    pub fn success(route: impl Into<String>, client: &str) -> Self {
        Self {
            route: route.into(),
            success: true,
            client: redact_client(client),
            error_detail: None,
        }
    }

    pub fn failure(route: impl Into<String>, client: &str, detail: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            success: false,
            client: redact_client(client),
            error_detail: Some(detail.into()),
        }
    }
}

/// Receiver for operational events. External collaborator boundary.
pub trait Monitor: Send + Sync {
    fn report(&self, outcome: &RequestOutcome);

    /// The traffic breaker tripped; `client` is already redacted.
    fn breaker_tripped(&self, client: &str, reason: &str);
}

/// Monitor that emits structured log events.
#[derive(Debug, Default, Clone)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn report(&self, outcome: &RequestOutcome) {
        if outcome.success {
            info!(
                route = %outcome.route,
                client = %outcome.client,
                "Request completed"
            );
        } else {
            warn!(
                route = %outcome.route,
                client = %outcome.client,
                error = outcome.error_detail.as_deref().unwrap_or("unknown"),
                "Request failed"
            );
        }
    }

    fn breaker_tripped(&self, client: &str, reason: &str) {
        warn!(client = %client, reason = %reason, "Traffic breaker tripped");
    }
}

/// Partially redact a client identity before it leaves the process.
///
/// IPv4 addresses keep their first two octets; IPv6 keeps the first
/// segment; anything else keeps a short prefix.
pub fn redact_client(identity: &str) -> String {
    // Strip a port suffix if the identity is a socket address.
    let host = identity
        .rsplit_once(':')
        .filter(|(h, p)| p.chars().all(|c| c.is_ascii_digit()) && !h.contains(':'))
        .map(|(h, _)| h)
        .unwrap_or(identity);

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                let octets = v4.octets();
                format!("{}.{}.x.x", octets[0], octets[1])
            }
            std::net::IpAddr::V6(v6) => {
                let segments = v6.segments();
                format!("{:x}:…", segments[0])
            }
        };
    }

    let prefix: String = host.chars().take(4).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_ipv4_last_octets() {
        assert_eq!(redact_client("203.0.113.7"), "203.0.x.x");
    }

    #[test]
    fn test_redacts_socket_addr_port_and_octets() {
        assert_eq!(redact_client("203.0.113.7:54321"), "203.0.x.x");
    }

    #[test]
    fn test_redacts_ipv6_to_first_segment() {
        assert_eq!(redact_client("2001:db8::1"), "2001:…");
    }

    #[test]
    fn test_redacts_opaque_identity() {
        assert_eq!(redact_client("some-forwarded-token"), "some…");
    }

    #[test]
    fn test_outcome_constructors_redact() {
        let ok = RequestOutcome::success("/api/ytdl/mp3", "203.0.113.7:1000");
        assert_eq!(ok.client, "203.0.x.x");
        assert!(ok.success);
        assert!(ok.error_detail.is_none());

        let failed = RequestOutcome::failure("/api/ai", "203.0.113.7", "provider failure");
        assert!(!failed.success);
        assert_eq!(failed.error_detail.as_deref(), Some("provider failure"));
    }

    #[test]
    fn test_outcome_serializes_without_empty_error() {
        let ok = RequestOutcome::success("/", "203.0.113.7");
        let value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("error_detail").is_none());
    }
}
