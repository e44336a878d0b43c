//! Opt-in fuel accounting sidecar.
//!
//! Keeps per-function consumption statistics in memory. The meter sits
//! outside the isolation core: the execution manager records into it after an
//! outcome is decided and never consults it to decide one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

/// Consumption statistics for one guest function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuelStats {
    pub count: u64,
    pub total_consumed: u64,
    pub max: u64,
    pub min: u64,
    pub last: u64,
    pub last_timestamp: DateTime<Utc>,
}

/// In-memory fuel accounting table keyed by function name.
///
/// Writes are serialized per entry; reads return snapshots and never block a
/// recording call.
#[derive(Debug, Default)]
pub struct FuelMeter {
    entries: DashMap<String, FuelStats>,
}

impl FuelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's fuel consumption.
    pub fn record(&self, function: &str, consumed: u64) {
        let now = Utc::now();
        self.entries
            .entry(function.to_string())
            .and_modify(|stats| {
                stats.count += 1;
                stats.total_consumed += consumed;
                stats.max = stats.max.max(consumed);
                stats.min = stats.min.min(consumed);
                stats.last = consumed;
                stats.last_timestamp = now;
            })
            .or_insert_with(|| FuelStats {
                count: 1,
                total_consumed: consumed,
                max: consumed,
                min: consumed,
                last: consumed,
                last_timestamp: now,
            });
    }

    /// Snapshot of one function's statistics.
    pub fn stats_for(&self, function: &str) -> Option<FuelStats> {
        self.entries.get(function).map(|entry| entry.clone())
    }

    /// Snapshot of the whole table.
    pub fn snapshot(&self) -> HashMap<String, FuelStats> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Clear all entries.
    pub fn reset(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_aggregates() {
        let meter = FuelMeter::new();
        meter.record("add", 100);
        meter.record("add", 50);
        meter.record("add", 200);

        let stats = meter.stats_for("add").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_consumed, 350);
        assert_eq!(stats.max, 200);
        assert_eq!(stats.min, 50);
        assert_eq!(stats.last, 200);
    }

    #[test]
    fn test_functions_tracked_independently() {
        let meter = FuelMeter::new();
        meter.record("a", 1);
        meter.record("b", 2);
        let snapshot = meter.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["a"].total_consumed, 1);
        assert_eq!(snapshot["b"].total_consumed, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let meter = FuelMeter::new();
        meter.record("a", 1);
        meter.reset();
        assert!(meter.snapshot().is_empty());
        assert!(meter.stats_for("a").is_none());
    }

    #[test]
    fn test_unknown_function_has_no_stats() {
        assert!(FuelMeter::new().stats_for("nope").is_none());
    }
}
