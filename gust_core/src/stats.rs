use crate::exec::TARGET_RESTART_PROBABILITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Campaign-wide counters, shared across lanes and updated with relaxed
/// atomics. Only aggregates live here; per-lane state stays in the lane.
pub struct CampaignStats {
    started: Instant,
    executions: AtomicU64,
    forced_restarts: AtomicU64,
    fault_restarts: AtomicU64,
    hangs: AtomicU64,
    crashers: AtomicU64,
    active_workers: AtomicUsize,
    last_discovery: Mutex<Option<Instant>>,
    /// Execution total carried over from a restored checkpoint; subtracted
    /// when computing this process's execution rate.
    restored: AtomicU64,
}

/// The durable subset of [`CampaignStats`], saved beside the corpus so
/// totals keep accumulating across process restarts.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsCheckpoint {
    pub executions: u64,
    pub forced_restarts: u64,
    pub fault_restarts: u64,
    pub hangs: u64,
    pub crashers: u64,
}

impl CampaignStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            executions: AtomicU64::new(0),
            forced_restarts: AtomicU64::new(0),
            fault_restarts: AtomicU64::new(0),
            hangs: AtomicU64::new(0),
            crashers: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            last_discovery: Mutex::new(None),
            restored: AtomicU64::new(0),
        }
    }

    pub fn record_executions(&self, count: u64) {
        self.executions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_forced_restarts(&self, count: u64) {
        self.forced_restarts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_fault_restarts(&self, count: u64) {
        self.fault_restarts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_hangs(&self, count: u64) {
        self.hangs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_crasher(&self) {
        self.crashers.fetch_add(1, Ordering::Relaxed);
        self.note_discovery();
    }

    pub fn note_discovery(&self) {
        *self.last_discovery.lock().unwrap() = Some(Instant::now());
    }

    pub fn worker_connected(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_disconnected(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn crashers(&self) -> u64 {
        self.crashers.load(Ordering::Relaxed)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Executions per second since the process started. Checkpointed totals
    /// restored from a previous run are excluded so the rate reflects the
    /// current process only.
    pub fn exec_rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.current_run_executions() as f64 / elapsed
    }

    fn current_run_executions(&self) -> u64 {
        self.executions
            .load(Ordering::Relaxed)
            .saturating_sub(self.restored.load(Ordering::Relaxed))
    }

    /// Fraction of executions that ended in a restart of any cause.
    pub fn restart_rate(&self) -> f64 {
        let executions = self.executions.load(Ordering::Relaxed);
        if executions == 0 {
            return 0.0;
        }
        let restarts = self.forced_restarts.load(Ordering::Relaxed)
            + self.fault_restarts.load(Ordering::Relaxed)
            + self.hangs.load(Ordering::Relaxed);
        restarts as f64 / executions as f64
    }

    pub fn checkpoint(&self) -> StatsCheckpoint {
        StatsCheckpoint {
            executions: self.executions.load(Ordering::Relaxed),
            forced_restarts: self.forced_restarts.load(Ordering::Relaxed),
            fault_restarts: self.fault_restarts.load(Ordering::Relaxed),
            hangs: self.hangs.load(Ordering::Relaxed),
            crashers: self.crashers.load(Ordering::Relaxed),
        }
    }

    /// Seeds the counters from a previous run's checkpoint. Call once,
    /// before any lane starts recording.
    pub fn restore(&self, checkpoint: &StatsCheckpoint) {
        self.executions
            .store(checkpoint.executions, Ordering::Relaxed);
        self.forced_restarts
            .store(checkpoint.forced_restarts, Ordering::Relaxed);
        self.fault_restarts
            .store(checkpoint.fault_restarts, Ordering::Relaxed);
        self.hangs.store(checkpoint.hangs, Ordering::Relaxed);
        self.crashers.store(checkpoint.crashers, Ordering::Relaxed);
        self.restored
            .store(checkpoint.executions, Ordering::Relaxed);
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.checkpoint())?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> std::io::Result<StatsCheckpoint> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// One human-readable line summarizing campaign health, printed
    /// periodically by the coordinator and the standalone runner.
    pub fn status_line(&self, corpus_len: usize, coverage_density: f64) -> String {
        let last = self
            .last_discovery
            .lock()
            .unwrap()
            .map(|t| format!("{}s ago", t.elapsed().as_secs()))
            .unwrap_or_else(|| "never".to_string());
        let mut line = format!(
            "up: {}s, workers: {}, corpus: {}, crashers: {}, execs: {} ({:.0}/sec), restarts: 1/{:.0} (target 1/{:.0}), cover: {:.2}%, last new input: {}",
            self.started.elapsed().as_secs(),
            self.active_workers(),
            corpus_len,
            self.crashers(),
            self.executions(),
            self.exec_rate(),
            self.restart_rate().recip().min(1e9),
            TARGET_RESTART_PROBABILITY.recip(),
            coverage_density * 100.0,
            last,
        );
        if coverage_density > 0.05 {
            line.push_str(" [coverage map saturating, novelty signal degraded]");
        }
        line
    }
}

impl Default for CampaignStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counters_accumulate() {
        let stats = CampaignStats::new();
        stats.record_executions(100);
        stats.record_executions(50);
        stats.record_hangs(2);
        stats.record_crasher();
        assert_eq!(stats.executions(), 150);
        assert_eq!(stats.crashers(), 1);
    }

    #[test]
    fn restart_rate_covers_all_causes() {
        let stats = CampaignStats::new();
        stats.record_executions(1000);
        stats.record_forced_restarts(1);
        stats.record_fault_restarts(2);
        stats.record_hangs(1);
        assert!((stats.restart_rate() - 0.004).abs() < 1e-9);
    }

    #[test]
    fn checkpoint_survives_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = CampaignStats::new();
        stats.record_executions(42);
        stats.record_hangs(3);
        stats.record_crasher();
        stats.save(&path).unwrap();

        let restored = CampaignStats::new();
        restored.restore(&CampaignStats::load(&path).unwrap());
        assert_eq!(restored.executions(), 42);
        assert_eq!(restored.crashers(), 1);
        assert_eq!(restored.checkpoint(), stats.checkpoint());
    }

    #[test]
    fn restored_totals_do_not_inflate_exec_rate() {
        let stats = CampaignStats::new();
        stats.restore(&StatsCheckpoint {
            executions: 1_000_000,
            ..StatsCheckpoint::default()
        });
        assert_eq!(stats.exec_rate(), 0.0);
        stats.record_executions(10);
        assert!(stats.exec_rate() >= 0.0);
        assert_eq!(stats.executions(), 1_000_010);
    }

    #[test]
    fn status_line_shows_observed_and_target_restart_rate() {
        let stats = CampaignStats::new();
        stats.record_executions(1_000);
        stats.record_forced_restarts(10);
        let line = stats.status_line(0, 0.0);
        assert!(line.contains("restarts: 1/100"));
        assert!(line.contains("(target 1/10000)"));
    }

    #[test]
    fn status_line_warns_on_saturated_coverage() {
        let stats = CampaignStats::new();
        assert!(!stats.status_line(0, 0.01).contains("saturating"));
        assert!(stats.status_line(0, 0.06).contains("saturating"));
    }

    #[test]
    fn worker_counting_is_balanced() {
        let stats = CampaignStats::new();
        stats.worker_connected();
        stats.worker_connected();
        stats.worker_disconnected();
        assert_eq!(stats.active_workers(), 1);
    }
}
