pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod coverage;
pub mod crash;
pub mod exec;
pub mod input;
pub mod mutate;
pub mod proto;
pub mod stats;
pub mod worker;

pub use config::GustConfig;
pub use coordinator::{Coordinator, CoordinatorHub};
pub use corpus::{Corpus, CorpusEntry, CorpusError, minimize};
pub use coverage::{Classification, CoverageSample, GlobalCoverage, MAP_BITS};
pub use crash::{CrashStore, Crasher, quote_bytes};
pub use exec::{Budget, ExecLane, Execution, Outcome, Target};
pub use input::content_id;
pub use mutate::{Dictionary, MutationEngine};
pub use stats::CampaignStats;
pub use worker::{SessionState, SharedLocal, WorkerSession, run_lanes};
