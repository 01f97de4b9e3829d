use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub phases: BTreeMap<String, PhaseMetrics>,
    pub fragments_transferred: u64,
    pub fragments_unchanged: u64,
    pub bytes_transferred: u64,
    pub fragments_collected: u64,
    pub fragments_merged: u64,
    pub file_issues: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct PhaseMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared counters for one producer or collector run. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct ExchangeMetrics {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl ExchangeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_phase(&self, phase: &str) -> PhaseTimer {
        PhaseTimer {
            phase: phase.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_transfer(&self, bytes: u64, unchanged: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            if unchanged {
                guard.fragments_unchanged += 1;
            } else {
                guard.fragments_transferred += 1;
                guard.bytes_transferred += bytes;
            }
        }
    }

    pub fn record_collected(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.fragments_collected += 1;
        }
    }

    pub fn record_merged(&self, fragments: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.fragments_merged += fragments;
        }
    }

    pub fn record_file_issue(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.file_issues += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records the elapsed time of a phase when dropped.
pub struct PhaseTimer {
    phase: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl PhaseTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.phases.entry(self.phase.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            phase = self.phase.as_str(),
            duration_ms, "Phase duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        fragments_transferred = snapshot.fragments_transferred,
        fragments_unchanged = snapshot.fragments_unchanged,
        bytes_transferred = snapshot.bytes_transferred,
        fragments_collected = snapshot.fragments_collected,
        fragments_merged = snapshot.fragments_merged,
        file_issues = snapshot.file_issues,
        "Exchange metrics summary"
    );
    for (phase, metrics) in &snapshot.phases {
        info!(
            phase = phase.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Phase metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            (
                "coverage_relay_fragments_transferred_total",
                "Fragments written to the shared store",
                self.fragments_transferred,
            ),
            (
                "coverage_relay_fragments_unchanged_total",
                "Fragments already present with identical content",
                self.fragments_unchanged,
            ),
            (
                "coverage_relay_bytes_transferred_total",
                "Fragment bytes written to the shared store",
                self.bytes_transferred,
            ),
            (
                "coverage_relay_fragments_collected_total",
                "Fragments retrieved from the shared store",
                self.fragments_collected,
            ),
            (
                "coverage_relay_fragments_merged_total",
                "Fragments merged into the coverage database",
                self.fragments_merged,
            ),
            (
                "coverage_relay_file_issues_total",
                "Fragments or files skipped with a non-fatal error",
                self.file_issues,
            ),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name} {value}\n"));
        }

        output.push_str("# HELP coverage_relay_phase_calls_total Phase invocation count\n");
        output.push_str("# TYPE coverage_relay_phase_calls_total counter\n");
        output.push_str(
            "# HELP coverage_relay_phase_duration_seconds_total Accumulated phase duration in seconds\n",
        );
        output.push_str("# TYPE coverage_relay_phase_duration_seconds_total counter\n");
        for (phase, metrics) in &self.phases {
            output.push_str(&format!(
                "coverage_relay_phase_calls_total{{phase=\"{}\"}} {}\n",
                phase, metrics.calls
            ));
            output.push_str(&format!(
                "coverage_relay_phase_duration_seconds_total{{phase=\"{}\"}} {:.6}\n",
                phase,
                metrics.total_duration_ms / 1_000.0
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_and_counters_accumulate() {
        let metrics = ExchangeMetrics::new();
        {
            let _timer = metrics.start_phase("transfer");
        }
        metrics.record_transfer(128, false);
        metrics.record_transfer(128, true);
        metrics.record_file_issue();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phases["transfer"].calls, 1);
        assert_eq!(snapshot.fragments_transferred, 1);
        assert_eq!(snapshot.fragments_unchanged, 1);
        assert_eq!(snapshot.bytes_transferred, 128);

        let prom = snapshot.to_prometheus();
        assert!(prom.contains("coverage_relay_fragments_transferred_total 1"));
        assert!(prom.contains("coverage_relay_phase_calls_total{phase=\"transfer\"} 1"));

        metrics.reset();
        assert_eq!(metrics.snapshot().fragments_transferred, 0);
    }
}
