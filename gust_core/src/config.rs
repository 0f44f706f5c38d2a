use crate::exec::{Budget, TARGET_RESTART_PROBABILITY};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level campaign configuration, loaded from a TOML file. Every field
/// has a default, so an empty file (or no file) yields a working standalone
/// setup.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GustConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default)]
    pub workdir: WorkdirSettings,
    /// Present when this process should attach to (or serve as) a
    /// coordinator; absent for standalone runs.
    #[serde(default)]
    pub coordinator: Option<CoordinatorSettings>,
    /// Optional seed token dictionary, one quoted token per line.
    #[serde(default)]
    pub dictionary: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Parallel execution lanes in this process.
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    /// Stop after this many executions; unbounded when absent.
    #[serde(default)]
    pub max_executions: Option<u64>,
    /// Executions between coordinator syncs (or local checkpoints).
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    /// Fixed RNG seed for reproducible runs; entropy-seeded when absent.
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            max_executions: None,
            sync_interval: default_sync_interval(),
            rng_seed: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BudgetSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    #[serde(default = "default_restart_probability")]
    pub restart_probability: f64,
}

impl BudgetSettings {
    pub fn budget(&self) -> Budget {
        Budget {
            deadline: Duration::from_millis(self.timeout_ms),
            memory_limit: self.memory_limit_mb << 20,
        }
    }
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            restart_probability: default_restart_probability(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkdirSettings {
    /// Root of the campaign's durable state.
    #[serde(default = "default_workdir_root")]
    pub root: PathBuf,
}

impl WorkdirSettings {
    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join("corpus")
    }

    pub fn crashers_dir(&self) -> PathBuf {
        self.root.join("crashers")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join("stats.json")
    }
}

impl Default for WorkdirSettings {
    fn default() -> Self {
        Self {
            root: default_workdir_root(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CoordinatorSettings {
    #[serde(default = "default_coordinator_addr")]
    pub addr: String,
    /// Seconds between status lines.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Seconds between durable checkpoints of corpus index and stats.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            addr: default_coordinator_addr(),
            status_interval_secs: default_status_interval_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

impl GustConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let config: GustConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {path:?}"))?;
        Ok(config)
    }
}

fn default_lanes() -> usize {
    1
}

fn default_sync_interval() -> u64 {
    256
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_memory_limit_mb() -> usize {
    1024
}

fn default_restart_probability() -> f64 {
    TARGET_RESTART_PROBABILITY
}

fn default_workdir_root() -> PathBuf {
    PathBuf::from("./.gust")
}

fn default_coordinator_addr() -> String {
    "127.0.0.1:8798".to_string()
}

fn default_status_interval_secs() -> u64 {
    3
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}
