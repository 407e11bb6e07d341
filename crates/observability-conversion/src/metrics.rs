use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

/// Receives the outcome of every conversion.
pub trait ConversionMetrics: Debug + Send + Sync {
    fn record_conversion(&self, succeeded: bool);
}

/// Process-wide conversion counters.
#[derive(Debug, Default)]
pub struct ConversionCounters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ConversionCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl ConversionMetrics for ConversionCounters {
    fn record_conversion(&self, succeeded: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let outcome = if succeeded {
            &self.succeeded
        } else {
            &self.failed
        };
        outcome.fetch_add(1, Ordering::Relaxed);
    }
}
