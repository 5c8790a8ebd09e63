//! Shared health state for the /health endpoint.
//! Updated by the venue sessions and the store schema probe.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::types::Platform;

#[derive(Default)]
pub struct HealthState {
    /// True while the Polymarket session is inside its read loop.
    pub polymarket_connected: AtomicBool,
    /// True while the Kalshi session is inside its read loop.
    pub kalshi_connected: AtomicBool,
    /// True when the startup schema probe found tables missing.
    pub schema_degraded: AtomicBool,
    /// Unix-ms timestamp of the most recent emitted quote (0 = none).
    pub last_quote_at_ms: AtomicI64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, platform: Platform, v: bool) {
        match platform {
            Platform::Polymarket => self.polymarket_connected.store(v, Ordering::Relaxed),
            Platform::Kalshi => self.kalshi_connected.store(v, Ordering::Relaxed),
        }
    }

    pub fn connected(&self, platform: Platform) -> bool {
        match platform {
            Platform::Polymarket => self.polymarket_connected.load(Ordering::Relaxed),
            Platform::Kalshi => self.kalshi_connected.load(Ordering::Relaxed),
        }
    }

    pub fn set_schema_degraded(&self, v: bool) {
        self.schema_degraded.store(v, Ordering::Relaxed);
    }

    pub fn schema_degraded(&self) -> bool {
        self.schema_degraded.load(Ordering::Relaxed)
    }

    pub fn mark_quote_emitted(&self, at_ms: i64) {
        self.last_quote_at_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn last_quote_at_ms(&self) -> i64 {
        self.last_quote_at_ms.load(Ordering::Relaxed)
    }
}
