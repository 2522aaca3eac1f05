//! Process-wide traffic breaker.
//!
//! The gateway guards downstream work expensive enough (media extraction,
//! headless-browser rendering) that partial degradation is not meaningfully
//! recoverable. Every inbound request is counted against a fixed one-second
//! window; exceeding the threshold moves the breaker into a terminal
//! shut-down state for the life of the process. There is no automatic
//! recovery; an operator restart is required.
//!
//! State is a handful of atomics plus a [`CancellationToken`] shared with
//! the accept loop. The breaker is built once at startup and injected into
//! the request path; it is never module-level state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::monitor::Monitor;

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Requests allowed within one window before the breaker trips.
    pub threshold: u32,
    /// Window length. One second unless a test narrows it.
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 50,
            window: Duration::from_secs(1),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Active,
    ShutDown,
}

/// Fixed-window request counter with a one-way trip.
pub struct TrafficBreaker {
    config: BreakerConfig,
    /// Monotonic reference point for window arithmetic.
    started: Instant,
    /// Millisecond offset (from `started`) of the current window's start.
    window_start_ms: AtomicU64,
    /// Requests counted in the current window.
    count: AtomicU32,
    /// Terminal flag; once set it is never cleared.
    tripped: AtomicBool,
    /// Cancelled on trip so the accept loop stops serving.
    shutdown: CancellationToken,
    monitor: Arc<dyn Monitor>,
}

impl TrafficBreaker {
    pub fn new(
        config: BreakerConfig,
        shutdown: CancellationToken,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        info!(
            threshold = config.threshold,
            window_ms = config.window.as_millis() as u64,
            "Traffic breaker armed"
        );
        Self {
            config,
            started: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            count: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            shutdown,
            monitor,
        }
    }

    pub fn state(&self) -> BreakerState {
        if self.tripped.load(Ordering::Acquire) {
            BreakerState::ShutDown
        } else {
            BreakerState::Active
        }
    }

    /// Count one inbound request and decide whether to serve it.
    ///
    /// Returns `false` once the breaker has tripped. The transition itself
    /// happens exactly once: the tripping call notifies the monitor with
    /// the (redacted) triggering client and cancels the shutdown token.
    pub fn admit(&self, client: &str) -> bool {
        if self.tripped.load(Ordering::Acquire) {
            return false;
        }

        let now_ms = self.started.elapsed().as_millis() as u64;
        let window_ms = self.config.window.as_millis() as u64;
        let window_start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(window_start) >= window_ms {
            // One caller wins the reset; losers count into the fresh window.
            if self
                .window_start_ms
                .compare_exchange(window_start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.count.store(0, Ordering::Release);
            }
        }

        let seen = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if seen <= self.config.threshold {
            return true;
        }

        if !self.tripped.swap(true, Ordering::AcqRel) {
            let redacted = crate::monitor::redact_client(client);
            let reason = format!(
                "request burst exceeded {} within {}ms",
                self.config.threshold,
                self.config.window.as_millis()
            );
            warn!(
                client = %redacted,
                requests_in_window = seen,
                threshold = self.config.threshold,
                "Traffic burst detected, shutting down"
            );
            self.monitor.breaker_tripped(&redacted, &reason);
            self.shutdown.cancel();
        }
        false
    }
}
