//! Injected metrics sink.
//!
//! Handlers call `sink.increment(name)` and stay agnostic of the backing
//! store; the default sink keeps in-process counters that `/v1/metrics`
//! snapshots. A broker- or TSDB-backed sink only needs to implement the
//! trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

pub const OTP_SEND: &str = "otp_send";
pub const OTP_VERIFY: &str = "otp_verify";
pub const LOGIN: &str = "login";
pub const LOGOUT: &str = "logout";
pub const SESSION_REFRESH: &str = "session_refresh";
pub const KEYS_MINT: &str = "keys_mint";
pub const KEYS_REDEEM: &str = "keys_redeem";
pub const KEYS_REVOKE: &str = "keys_revoke";
pub const ROLE_UPGRADE: &str = "role_upgrade";
pub const ROLE_DOWNGRADE: &str = "role_downgrade";
pub const ENTITLEMENTS_UPDATE: &str = "entitlements_update";
pub const STREAMS_OPENED: &str = "streams_opened";
pub const BRIDGES_OPENED: &str = "bridges_opened";
pub const VERIFICATIONS_TRIGGERED: &str = "verifications_triggered";

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);
}

/// In-process counters, snapshotted by the metrics endpoint.
#[derive(Debug, Default)]
pub struct AtomicMetricsSink {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl AtomicMetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for AtomicMetricsSink {
    fn increment(&self, name: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }
}

#[derive(Clone, Debug)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _name: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_sink_counts_increments() {
        let sink = AtomicMetricsSink::new();
        sink.increment(LOGIN);
        sink.increment(LOGIN);
        sink.increment(KEYS_REDEEM);

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.get(LOGIN), Some(&2));
        assert_eq!(snapshot.get(KEYS_REDEEM), Some(&1));
        assert_eq!(snapshot.get(KEYS_MINT), None);
    }

    #[test]
    fn noop_sink_ignores_increments() {
        let sink = NoopMetricsSink;
        sink.increment(LOGIN);
    }
}
