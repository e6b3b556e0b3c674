//! Process-local runtime metrics. Atomic counters only; the scrape
//! endpoint snapshots them into JSON. Phase-specific extras (e.g. the
//! server-sort counter) register on first use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::phase::{PHASE_ORDER, Phase};

#[derive(Default)]
pub struct RuntimeMetrics {
    pub mode_changes: AtomicU64,
    pub phase_starts: AtomicU64,
    pub phase_auto_starts: AtomicU64,
    pub phase_completions: AtomicU64,
    pub phase_failures: AtomicU64,
    pub chain_blocked: AtomicU64,
    pub phase_config_updates: AtomicU64,
    pub events_dropped: AtomicU64,
    pub reconciler_corrections: AtomicU64,
    pub rehydration_resumes: AtomicU64,
    phase_duration_ns: [AtomicU64; 5],
    extras: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl RuntimeMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_phase_duration(&self, phase: Phase, nanos: u64) {
        self.phase_duration_ns[phase.index()].fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn phase_duration_ns(&self, phase: Phase) -> u64 {
        self.phase_duration_ns[phase.index()].load(Ordering::Relaxed)
    }

    /// Named counter registered on first use.
    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        let mut extras = self.extras.lock().expect("metrics extras lock poisoned");
        Arc::clone(
            extras
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    pub fn snapshot(&self) -> Value {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let durations: serde_json::Map<String, Value> = PHASE_ORDER
            .iter()
            .map(|phase| {
                (
                    phase.wire_name().to_string(),
                    json!(self.phase_duration_ns(*phase)),
                )
            })
            .collect();
        let extras: serde_json::Map<String, Value> = self
            .extras
            .lock()
            .expect("metrics extras lock poisoned")
            .iter()
            .map(|(name, counter)| (name.clone(), json!(load(counter))))
            .collect();
        json!({
            "mode_changes": load(&self.mode_changes),
            "phase_starts": load(&self.phase_starts),
            "phase_auto_starts": load(&self.phase_auto_starts),
            "phase_completions": load(&self.phase_completions),
            "phase_failures": load(&self.phase_failures),
            "chain_blocked": load(&self.chain_blocked),
            "phase_config_updates": load(&self.phase_config_updates),
            "events_dropped": load(&self.events_dropped),
            "reconciler_corrections": load(&self.reconciler_corrections),
            "rehydration_resumes": load(&self.rehydration_resumes),
            "phase_duration_ns": durations,
            "extras": extras,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = RuntimeMetrics::new();
        metrics.phase_starts.fetch_add(2, Ordering::Relaxed);
        metrics.phase_completions.fetch_add(1, Ordering::Relaxed);
        metrics.record_phase_duration(Phase::DnsValidation, 1_500);
        metrics.record_phase_duration(Phase::DnsValidation, 500);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["phase_starts"], 2);
        assert_eq!(snapshot["phase_completions"], 1);
        assert_eq!(snapshot["phase_duration_ns"]["validation"], 2_000);
        assert_eq!(snapshot["phase_duration_ns"]["discovery"], 0);
    }

    #[test]
    fn test_extras_register_on_first_use() {
        let metrics = RuntimeMetrics::new();
        metrics
            .counter("domains_sort_requests")
            .fetch_add(3, Ordering::Relaxed);
        // Same name returns the same counter.
        metrics
            .counter("domains_sort_requests")
            .fetch_add(1, Ordering::Relaxed);
        assert_eq!(metrics.snapshot()["extras"]["domains_sort_requests"], 4);
    }
}
