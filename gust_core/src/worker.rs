use crate::config::{GustConfig, WorkdirSettings};
use crate::corpus::{Corpus, minimize};
use crate::coverage::{CoverageSample, GlobalCoverage};
use crate::crash::{CrashStore, Crasher};
use crate::exec::{
    Budget, ExecLane, Outcome, RestartCounters, Target, hang_signature, resource_signature,
};
use crate::mutate::MutationEngine;
use crate::proto::{NewInput, Request, Response, StatsDelta, read_frame, write_frame};
use crate::stats::CampaignStats;
use anyhow::Context;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const MAX_CONNECT_ATTEMPTS: u32 = 5;
/// Execution budget spent shrinking one fresh crasher or one rich discovery.
const MINIMIZE_BUDGET: usize = 64;
/// Coverage discoveries crediting at least this many fresh bits get a
/// shrinking pass before admission; smaller deltas are admitted as-is.
const NOVEL_MINIMIZE_THRESHOLD: u32 = 16;

/// Campaign state shared by every lane in this process: the local corpus
/// mirror, the crash archive, the coverage accumulator and the counters.
/// For a standalone run this is the authoritative state; for a connected
/// worker it mirrors the coordinator and is reconciled on every sync.
pub struct SharedLocal {
    pub corpus: Mutex<Corpus>,
    pub crashes: Mutex<CrashStore>,
    pub coverage: GlobalCoverage,
    pub stats: CampaignStats,
    pub stop: AtomicBool,
    stats_path: Option<PathBuf>,
}

impl SharedLocal {
    pub fn in_memory() -> Self {
        Self {
            corpus: Mutex::new(Corpus::in_memory()),
            crashes: Mutex::new(CrashStore::in_memory()),
            coverage: GlobalCoverage::new(),
            stats: CampaignStats::new(),
            stop: AtomicBool::new(false),
            stats_path: None,
        }
    }

    /// Opens durable local state under `workdir`, rebuilding the coverage
    /// accumulator from the persisted corpus and restoring stats totals.
    pub fn open(workdir: &WorkdirSettings) -> anyhow::Result<Self> {
        let corpus = Corpus::open(&workdir.corpus_dir())
            .with_context(|| format!("opening corpus under {:?}", workdir.root))?;
        let crashes = CrashStore::open(&workdir.crashers_dir())
            .with_context(|| format!("opening crash store under {:?}", workdir.root))?;
        let coverage = GlobalCoverage::new();
        corpus.rebuild_coverage(&coverage);

        let stats = CampaignStats::new();
        let stats_path = workdir.stats_path();
        if stats_path.is_file() {
            stats.restore(&CampaignStats::load(&stats_path)?);
        }

        Ok(Self {
            corpus: Mutex::new(corpus),
            crashes: Mutex::new(crashes),
            coverage,
            stats,
            stop: AtomicBool::new(false),
            stats_path: Some(stats_path),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn save_stats(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.stats_path {
            self.stats
                .save(path)
                .with_context(|| format!("saving stats to {path:?}"))?;
        }
        Ok(())
    }
}

/// Where one session is in its fuzzing loop. Exposed for observability;
/// the transitions live in [`WorkerSession::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Idle,
    Mutating,
    Executing,
    Reporting,
    Restarting,
    Stopped,
}

enum Transport {
    Standalone,
    Coordinator {
        addr: String,
        conn: Option<TcpStream>,
        attempts: u32,
    },
}

/// One fuzzing lane driven as an explicit state machine: pick a seed,
/// mutate, execute, classify, periodically sync findings, restart the
/// target when the lane says so.
///
/// A standalone session checkpoints straight to disk on sync; a connected
/// session exchanges findings with the coordinator instead and treats its
/// local state as a mirror.
pub struct WorkerSession {
    shared: Arc<SharedLocal>,
    lane: ExecLane,
    engine: MutationEngine,
    rng: ChaCha8Rng,
    state: SessionState,
    transport: Transport,
    name: String,
    sync_interval: u64,
    max_executions: Option<u64>,
    total_executions: u64,
    executions_since_sync: u64,
    final_report_done: bool,
    candidate: Option<(Vec<u8>, String)>,
    last_restarts: RestartCounters,
    pending_inputs: Vec<NewInput>,
    pending_crashers: Vec<Crasher>,
    pending_stats: StatsDelta,
    inbox: Vec<NewInput>,
}

impl WorkerSession {
    pub fn standalone(shared: Arc<SharedLocal>, target: Arc<dyn Target>, budget: Budget) -> Self {
        Self::new(shared, target, budget, Transport::Standalone, SessionState::Idle)
    }

    pub fn connected(
        shared: Arc<SharedLocal>,
        target: Arc<dyn Target>,
        budget: Budget,
        addr: impl Into<String>,
    ) -> Self {
        let transport = Transport::Coordinator {
            addr: addr.into(),
            conn: None,
            attempts: 0,
        };
        Self::new(shared, target, budget, transport, SessionState::Connecting)
    }

    fn new(
        shared: Arc<SharedLocal>,
        target: Arc<dyn Target>,
        budget: Budget,
        transport: Transport,
        state: SessionState,
    ) -> Self {
        Self {
            shared,
            lane: ExecLane::new(target, budget),
            engine: MutationEngine::new(),
            rng: ChaCha8Rng::from_os_rng(),
            state,
            transport,
            name: "lane-0".to_string(),
            sync_interval: 256,
            max_executions: None,
            total_executions: 0,
            executions_since_sync: 0,
            final_report_done: false,
            candidate: None,
            last_restarts: RestartCounters::default(),
            pending_inputs: Vec::new(),
            pending_crashers: Vec::new(),
            pending_stats: StatsDelta::default(),
            inbox: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_engine(mut self, engine: MutationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_sync_interval(mut self, interval: u64) -> Self {
        self.sync_interval = interval.max(1);
        self
    }

    pub fn with_max_executions(mut self, max: u64) -> Self {
        self.max_executions = Some(max);
        self
    }

    pub fn with_restart_probability(mut self, probability: f64) -> Self {
        self.lane = self.lane.with_restart_probability(probability);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn executions(&self) -> u64 {
        self.total_executions
    }

    fn should_stop(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
            || self
                .max_executions
                .is_some_and(|max| self.total_executions >= max)
    }

    /// Drives the session until it reaches [`SessionState::Stopped`].
    pub fn run(&mut self) -> anyhow::Result<()> {
        while self.state != SessionState::Stopped {
            self.step()?;
        }
        Ok(())
    }

    /// Performs exactly one state transition.
    pub fn step(&mut self) -> anyhow::Result<()> {
        match self.state {
            SessionState::Connecting => self.step_connecting(),
            SessionState::Idle => self.step_idle(),
            SessionState::Mutating => self.step_mutating(),
            SessionState::Executing => self.step_executing(),
            SessionState::Reporting => self.step_reporting(),
            SessionState::Restarting => self.step_restarting(),
            SessionState::Stopped => Ok(()),
        }
    }

    fn step_connecting(&mut self) -> anyhow::Result<()> {
        let Transport::Coordinator {
            addr,
            conn,
            attempts,
        } = &mut self.transport
        else {
            self.state = SessionState::Idle;
            return Ok(());
        };

        match TcpStream::connect(&*addr).and_then(|stream| {
            stream.set_nodelay(true)?;
            Ok(stream)
        }) {
            Ok(mut stream) => {
                let hello = Request::Hello {
                    worker: self.name.clone(),
                };
                match write_frame(&mut stream, &hello).and_then(|()| read_frame(&mut stream)) {
                    Ok(Response::Welcome { seeds }) => {
                        self.inbox.extend(seeds);
                        *conn = Some(stream);
                        *attempts = 0;
                        self.state = SessionState::Idle;
                    }
                    Ok(other) => {
                        eprintln!("{}: unexpected handshake reply {other:?}", self.name);
                        *attempts += 1;
                    }
                    Err(err) => {
                        eprintln!("{}: handshake failed: {err}", self.name);
                        *attempts += 1;
                    }
                }
            }
            Err(err) => {
                eprintln!("{}: cannot reach coordinator at {addr}: {err}", self.name);
                *attempts += 1;
            }
        }

        if *attempts > 0 {
            if *attempts >= MAX_CONNECT_ATTEMPTS {
                eprintln!("{}: giving up after {attempts} attempts", self.name);
                self.state = SessionState::Stopped;
            } else {
                thread::sleep(Duration::from_millis(100 * u64::from(*attempts)));
            }
        }
        Ok(())
    }

    fn step_idle(&mut self) -> anyhow::Result<()> {
        if self.should_stop() {
            // One last sync flushes findings that arrived since the previous
            // report.
            if self.final_report_done {
                self.state = SessionState::Stopped;
            } else {
                self.final_report_done = true;
                self.state = SessionState::Reporting;
            }
            return Ok(());
        }
        if !self.inbox.is_empty() {
            self.absorb_inbox()?;
            return Ok(());
        }
        if self.executions_since_sync >= self.sync_interval {
            self.state = SessionState::Reporting;
            return Ok(());
        }
        self.state = SessionState::Mutating;
        Ok(())
    }

    /// Folds peer discoveries into the local mirror. Their signatures were
    /// computed on the reporting worker, so no local execution is needed.
    fn absorb_inbox(&mut self) -> anyhow::Result<()> {
        let discoveries = std::mem::take(&mut self.inbox);
        let mut corpus = self.shared.corpus.lock().unwrap();
        for discovery in discoveries {
            if corpus.contains_input(&discovery.input) {
                continue;
            }
            let sample = CoverageSample::from_bits(&discovery.signature);
            let classification = self.shared.coverage.classify(&sample);
            corpus
                .admit(
                    discovery.input,
                    &classification,
                    discovery.verdict,
                    &discovery.parentage,
                )
                .context("admitting peer discovery")?;
        }
        Ok(())
    }

    fn step_mutating(&mut self) -> anyhow::Result<()> {
        let (parent, donor) = {
            let mut corpus = self.shared.corpus.lock().unwrap();
            let parent = corpus
                .select_seed(&mut self.rng)
                .map(|entry| entry.input.clone())
                .unwrap_or_default();
            let donor = corpus.random_donor(&mut self.rng).map(|e| e.input.clone());
            (parent, donor)
        };
        self.candidate = Some(self.engine.mutate(&parent, donor.as_deref(), &mut self.rng));
        self.state = SessionState::Executing;
        Ok(())
    }

    fn step_executing(&mut self) -> anyhow::Result<()> {
        let Some((candidate, parentage)) = self.candidate.take() else {
            self.state = SessionState::Idle;
            return Ok(());
        };

        let executions_before = self.lane.executions();
        match self.lane.run(&candidate, &mut self.rng) {
            Outcome::Valid {
                verdict,
                sample,
                tokens,
            } => {
                self.engine.harvest(&tokens);
                let classification = self.shared.coverage.classify(&sample);
                if classification.is_novel {
                    let mut accepted = candidate;
                    let mut signature = sample.bits();
                    let mut verdict = verdict;
                    if classification.credited_bits() >= NOVEL_MINIMIZE_THRESHOLD {
                        let (shrunk, kept) = self.shrink_novel(&accepted, &classification.new_bits);
                        if let Some((kept_sample, kept_verdict)) = kept {
                            accepted = shrunk;
                            signature = kept_sample.bits();
                            verdict = kept_verdict;
                        }
                    }
                    let admitted = self
                        .shared
                        .corpus
                        .lock()
                        .unwrap()
                        .admit(accepted.clone(), &classification, verdict, &parentage)
                        .context("admitting local discovery")?;
                    if admitted.is_some() {
                        self.shared.stats.note_discovery();
                        self.pending_inputs.push(NewInput {
                            input: accepted,
                            signature,
                            verdict,
                            parentage,
                        });
                    }
                }
            }
            Outcome::Crash { signature, log } => {
                self.handle_crasher(candidate, signature, log)?;
            }
            Outcome::Hang => {
                self.handle_crasher(
                    candidate,
                    hang_signature(),
                    "execution exceeded its deadline".to_string(),
                )?;
            }
            Outcome::ResourceExceeded => {
                self.handle_crasher(
                    candidate,
                    resource_signature(),
                    "execution exceeded its memory budget".to_string(),
                )?;
            }
        }

        // Minimization re-executions count too.
        let ran = self.lane.executions() - executions_before;
        self.total_executions += ran;
        self.executions_since_sync += ran;
        self.pending_stats.executions += ran;
        self.shared.stats.record_executions(ran);

        self.state = SessionState::Restarting;
        Ok(())
    }

    /// Shrinks a coverage discovery while every bit it was credited with
    /// keeps showing up in the re-executed sample. The check compares raw
    /// samples against the credited delta, never the global accumulator,
    /// which already absorbed those bits. Returns the surviving input and
    /// the sample and verdict of its last accepted execution, or `None` if
    /// no shorter form reproduced the coverage.
    fn shrink_novel(
        &mut self,
        input: &[u8],
        new_bits: &CoverageSample,
    ) -> (Vec<u8>, Option<(CoverageSample, i32)>) {
        let lane = &mut self.lane;
        let rng = &mut self.rng;
        let mut kept = None;
        let shrunk = minimize(
            input,
            |candidate| match lane.run(candidate, rng) {
                Outcome::Valid {
                    verdict, sample, ..
                } if sample.contains(new_bits) => {
                    kept = Some((sample, verdict));
                    true
                }
                _ => false,
            },
            MINIMIZE_BUDGET,
        );
        (shrunk, kept)
    }

    /// Records a fresh crasher, shrinking its input first. Known failure
    /// classes are dropped on the spot so the archive is only touched once
    /// per class per sync.
    fn handle_crasher(
        &mut self,
        input: Vec<u8>,
        signature: String,
        log: String,
    ) -> anyhow::Result<()> {
        if self.shared.crashes.lock().unwrap().contains(&signature) {
            return Ok(());
        }

        let minimized = {
            let lane = &mut self.lane;
            let rng = &mut self.rng;
            let expected = signature.as_str();
            minimize(
                &input,
                |candidate| {
                    let reproduced = match lane.run(candidate, rng) {
                        Outcome::Crash { signature, .. } => signature,
                        Outcome::Hang => hang_signature(),
                        Outcome::ResourceExceeded => resource_signature(),
                        Outcome::Valid { .. } => return false,
                    };
                    reproduced == expected
                },
                MINIMIZE_BUDGET,
            )
        };

        let crasher = Crasher {
            input: minimized,
            signature,
            log,
        };
        let is_new = self
            .shared
            .crashes
            .lock()
            .unwrap()
            .report(&crasher)
            .context("persisting crasher")?;
        if is_new {
            self.shared.stats.record_crasher();
            self.pending_crashers.push(crasher);
        }
        Ok(())
    }

    fn step_reporting(&mut self) -> anyhow::Result<()> {
        if matches!(self.transport, Transport::Standalone) {
            self.shared
                .corpus
                .lock()
                .unwrap()
                .checkpoint()
                .context("checkpointing corpus")?;
            self.pending_inputs.clear();
            self.pending_crashers.clear();
            self.pending_stats = StatsDelta::default();
            self.executions_since_sync = 0;
            self.state = SessionState::Idle;
            return Ok(());
        }

        let Some(mut stream) = self.take_conn() else {
            self.state = SessionState::Connecting;
            return Ok(());
        };
        let request = Request::ReportResult {
            new_inputs: std::mem::take(&mut self.pending_inputs),
            crashers: std::mem::take(&mut self.pending_crashers),
            stats: std::mem::take(&mut self.pending_stats),
        };
        match write_frame(&mut stream, &request).and_then(|()| read_frame(&mut stream)) {
            Ok(Response::Ack { discoveries }) => {
                self.inbox.extend(discoveries);
                self.put_conn(stream);
                self.executions_since_sync = 0;
                self.state = SessionState::Idle;
            }
            Ok(other) => {
                eprintln!("{}: unexpected sync reply {other:?}", self.name);
                self.requeue(request);
                self.state = SessionState::Connecting;
            }
            Err(err) => {
                eprintln!("{}: sync failed, reconnecting: {err}", self.name);
                self.requeue(request);
                self.state = SessionState::Connecting;
            }
        }
        Ok(())
    }

    fn take_conn(&mut self) -> Option<TcpStream> {
        match &mut self.transport {
            Transport::Coordinator { conn, .. } => conn.take(),
            Transport::Standalone => None,
        }
    }

    fn put_conn(&mut self, stream: TcpStream) {
        if let Transport::Coordinator { conn, .. } = &mut self.transport {
            *conn = Some(stream);
        }
    }

    /// Puts an unsent report's payload back so the next sync retries it.
    fn requeue(&mut self, request: Request) {
        if let Request::ReportResult {
            new_inputs,
            crashers,
            stats,
        } = request
        {
            self.pending_inputs = new_inputs;
            self.pending_crashers = crashers;
            self.pending_stats = stats;
        }
    }

    fn step_restarting(&mut self) -> anyhow::Result<()> {
        let now = self.lane.restart_counters();
        let delta = now.since(&self.last_restarts);
        self.last_restarts = now;

        self.pending_stats.forced_restarts += delta.forced;
        self.pending_stats.fault_restarts += delta.faults;
        self.pending_stats.hangs += delta.hangs;
        self.shared.stats.record_forced_restarts(delta.forced);
        self.shared.stats.record_fault_restarts(delta.faults);
        self.shared.stats.record_hangs(delta.hangs);

        self.state = SessionState::Idle;
        Ok(())
    }
}

/// Spawns the configured number of lanes against one target and blocks
/// until all of them stop. This is the whole-process entry point used by
/// both the standalone runner and a connected worker.
pub fn run_lanes(
    shared: Arc<SharedLocal>,
    target: Arc<dyn Target>,
    config: &GustConfig,
) -> anyhow::Result<()> {
    let lanes = config.fuzzer.lanes.max(1);
    let budget = config.budget.budget();
    let base_seed = config
        .fuzzer
        .rng_seed
        .unwrap_or_else(|| rand::random::<u64>());
    let per_lane_max = config
        .fuzzer
        .max_executions
        .map(|max| (max / lanes as u64).max(1));

    let mut handles = Vec::with_capacity(lanes);
    for lane_index in 0..lanes {
        let shared = Arc::clone(&shared);
        let target = Arc::clone(&target);
        let mut engine = MutationEngine::new();
        if let Some(path) = &config.dictionary {
            let loaded = engine
                .dictionary_mut()
                .load_file(path)
                .with_context(|| format!("loading dictionary {path:?}"))?;
            if lane_index == 0 {
                println!("loaded {loaded} dictionary tokens from {path:?}");
            }
        }
        let addr = config.coordinator.as_ref().map(|c| c.addr.clone());
        let sync_interval = config.fuzzer.sync_interval;
        let restart_probability = config.budget.restart_probability;

        let handle = thread::Builder::new()
            .name(format!("lane-{lane_index}"))
            .spawn(move || -> anyhow::Result<()> {
                let name = format!("lane-{lane_index}");
                let mut session = match addr {
                    Some(addr) => WorkerSession::connected(shared, target, budget, addr),
                    None => WorkerSession::standalone(shared, target, budget),
                }
                .with_name(name)
                .with_engine(engine)
                .with_seed(base_seed.wrapping_add(lane_index as u64))
                .with_sync_interval(sync_interval)
                .with_restart_probability(restart_probability);
                if let Some(max) = per_lane_max {
                    session = session.with_max_executions(max);
                }
                session.run()
            })
            .context("spawning lane thread")?;
        handles.push(handle);
    }

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("lane thread panicked"))??;
    }

    shared.corpus.lock().unwrap().checkpoint()?;
    shared.save_stats()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorSettings;
    use crate::coordinator::{Coordinator, CoordinatorHub};
    use crate::exec::Execution;

    const MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

    /// Gradient target: each matched magic-prefix byte lights a new site,
    /// the full header lights an extra one, and a 0xFF payload byte after
    /// the header panics.
    fn magic_target() -> Arc<dyn Target> {
        Arc::new(|input: &[u8]| {
            let matched = input
                .iter()
                .zip(MAGIC.iter())
                .take_while(|(a, b)| a == b)
                .count();
            let mut counters: Vec<(u64, u32)> =
                (0..=matched).map(|i| (10 + i as u64, 1)).collect();
            if matched == MAGIC.len() {
                counters.push((100, 1));
                if input.get(4) == Some(&0xFF) {
                    panic!("magic payload overflow");
                }
            }
            let verdict = if matched == MAGIC.len() { 2 } else { 0 };
            Execution::new(verdict, counters).with_tokens(vec![MAGIC.to_vec()])
        })
    }

    fn fast_budget() -> Budget {
        Budget {
            deadline: Duration::from_millis(500),
            memory_limit: 1 << 24,
        }
    }

    #[test]
    fn campaign_finds_gradient_guarded_magic_and_dedups_the_crash() {
        let shared = Arc::new(SharedLocal::in_memory());
        let mut session =
            WorkerSession::standalone(Arc::clone(&shared), magic_target(), fast_budget())
                .with_seed(42)
                .with_sync_interval(1024)
                .with_restart_probability(0.0)
                .with_max_executions(300_000);
        session.run().unwrap();

        let corpus = shared.corpus.lock().unwrap();
        let reached_magic = corpus
            .entries()
            .any(|entry| entry.input.starts_with(&MAGIC));
        assert!(
            reached_magic,
            "no corpus entry carries the full magic header after {} executions",
            session.executions()
        );

        // Every overflow panic folds into one failure class.
        let crashes = shared.crashes.lock().unwrap();
        assert_eq!(crashes.len(), 1);
        assert_eq!(shared.stats.crashers(), 1);
    }

    #[test]
    fn hangs_are_detected_shrunk_and_deduplicated() {
        let target: Arc<dyn Target> = Arc::new(|input: &[u8]| {
            if input.len() > 100 {
                thread::sleep(Duration::from_millis(200));
            }
            // Length deciles as coverage so growth registers as progress.
            Execution::new(1, vec![(input.len() as u64 / 10, 1)])
        });
        let shared = Arc::new(SharedLocal::in_memory());
        let mut session = WorkerSession::standalone(
            Arc::clone(&shared),
            target,
            Budget {
                deadline: Duration::from_millis(10),
                memory_limit: 1 << 24,
            },
        )
        .with_seed(7)
        .with_sync_interval(1024)
        .with_restart_probability(0.0)
        .with_max_executions(600);
        session.run().unwrap();

        let crashes = shared.crashes.lock().unwrap();
        assert_eq!(crashes.len(), 1, "all hangs share one failure class");
        assert!(crashes.contains(&hang_signature()));
        assert!(shared.stats.checkpoint().hangs > 0);
    }

    #[test]
    fn rich_coverage_discoveries_are_shrunk_before_admission() {
        // A single 0xAB byte anywhere lights a wide block of sites at once,
        // so the first input carrying it is credited well past the shrink
        // threshold while everything around the byte is dead weight.
        let target: Arc<dyn Target> = Arc::new(|input: &[u8]| {
            if input.contains(&0xAB) {
                let counters: Vec<(u64, u32)> = (200..230).map(|site| (site, 1)).collect();
                Execution::new(1, counters)
            } else {
                Execution::new(1, vec![(1, 1)])
            }
        });
        let mut engine = MutationEngine::new();
        engine.dictionary_mut().add(&[0xAB]);
        let shared = Arc::new(SharedLocal::in_memory());
        let mut session = WorkerSession::standalone(Arc::clone(&shared), target, fast_budget())
            .with_engine(engine)
            .with_seed(11)
            .with_sync_interval(1024)
            .with_restart_probability(0.0)
            .with_max_executions(5_000);
        session.run().unwrap();

        let corpus = shared.corpus.lock().unwrap();
        let entry = corpus
            .entries()
            .find(|entry| entry.input.contains(&0xAB))
            .expect("the wide-coverage discovery was admitted");
        assert!(
            entry.input.len() <= 8,
            "a {}-byte input was admitted unshrunk",
            entry.input.len()
        );
        // The stored form still produces every credited bit.
        let replayed = CoverageSample::from_counters(
            &(200..230).map(|site| (site, 1)).collect::<Vec<_>>(),
        );
        assert!(replayed.contains(&CoverageSample::from_bits(&entry.signature)));
    }

    #[test]
    fn memory_budget_breaches_reach_the_crash_store_as_one_class() {
        let target: Arc<dyn Target> = Arc::new(|input: &[u8]| {
            let execution = Execution::new(1, vec![(input.len() as u64 / 4, 1)]);
            if input.len() > 8 {
                execution.with_peak_memory(1 << 30)
            } else {
                execution
            }
        });
        let shared = Arc::new(SharedLocal::in_memory());
        let mut session = WorkerSession::standalone(
            Arc::clone(&shared),
            target,
            Budget {
                deadline: Duration::from_millis(500),
                memory_limit: 1 << 20,
            },
        )
        .with_seed(5)
        .with_sync_interval(1024)
        .with_restart_probability(0.0)
        .with_max_executions(500);
        session.run().unwrap();

        let crashes = shared.crashes.lock().unwrap();
        assert_eq!(crashes.len(), 1, "every breach folds into one class");
        assert!(crashes.contains(&resource_signature()));
    }

    #[test]
    fn session_stops_at_its_execution_ceiling() {
        let target: Arc<dyn Target> =
            Arc::new(|input: &[u8]| Execution::new(1, vec![(input.len() as u64, 1)]));
        let shared = Arc::new(SharedLocal::in_memory());
        let mut session = WorkerSession::standalone(Arc::clone(&shared), target, fast_budget())
            .with_seed(1)
            .with_restart_probability(0.0)
            .with_max_executions(50);
        session.run().unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.executions() >= 50);
        assert_eq!(shared.stats.executions(), session.executions());
    }

    #[test]
    fn stop_flag_halts_a_session_promptly() {
        let target: Arc<dyn Target> = Arc::new(|_: &[u8]| Execution::rejected());
        let shared = Arc::new(SharedLocal::in_memory());
        shared.request_stop();
        let mut session =
            WorkerSession::standalone(Arc::clone(&shared), target, fast_budget()).with_seed(2);
        session.run().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.executions(), 0);
    }

    #[test]
    fn connected_session_syncs_findings_with_the_coordinator() {
        let hub = Arc::new(CoordinatorHub::in_memory());
        hub.plant_seed(b"starter".to_vec(), &[40_000]).unwrap();
        let coordinator = Coordinator::bind(
            "127.0.0.1:0",
            Arc::clone(&hub),
            CoordinatorSettings::default(),
        )
        .unwrap();
        let addr = coordinator.local_addr().unwrap();
        let stop = coordinator.stop_flag();
        let server = thread::spawn(move || coordinator.serve());

        let target: Arc<dyn Target> =
            Arc::new(|input: &[u8]| Execution::new(1, vec![(input.len() as u64 % 32, 1)]));
        let shared = Arc::new(SharedLocal::in_memory());
        let mut session = WorkerSession::connected(
            Arc::clone(&shared),
            target,
            fast_budget(),
            addr.to_string(),
        )
        .with_seed(3)
        .with_sync_interval(50)
        .with_restart_probability(0.0)
        .with_max_executions(2_000);
        session.run().unwrap();

        // The Welcome seed landed in the local mirror.
        assert!(shared.corpus.lock().unwrap().contains_input(b"starter"));
        // Reports reached the coordinator.
        assert!(hub.stats().executions() >= 2_000);
        assert!(hub.corpus_len() > 1, "local discoveries were forwarded");

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap().unwrap();
    }
}
