use crate::coverage::CoverageSample;
use rand::Rng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// Fraction of invocations after which a lane worker is restarted regardless
/// of faults, to bound resource leak accumulation in long-lived targets.
/// An observed restart rate far above this signals frequent underlying
/// faults; the status line reports both.
pub const TARGET_RESTART_PROBABILITY: f64 = 1.0 / 10_000.0;

/// What one invocation of the instrumented target reports back.
///
/// This is the engine's entire contract with the opaque artifact: a verdict,
/// the raw coverage counters, the peak memory the run claimed, and any
/// comparison operands worth feeding into the mutation dictionary.
/// Application-level defects are raised as panics and caught at the lane
/// boundary.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    /// 0 = rejected/invalid, 1 = accepted, 2 = accepted and notably
    /// interesting; negative reserved.
    pub verdict: i32,
    /// (call-site, hit-count) pairs touched during the run.
    pub counters: Vec<(u64, u32)>,
    /// Peak memory the run claimed, in bytes; checked against the budget.
    pub peak_memory: usize,
    /// Comparison operands observed during the run, harvested as dictionary
    /// tokens.
    pub tokens: Vec<Vec<u8>>,
}

impl Execution {
    pub fn new(verdict: i32, counters: Vec<(u64, u32)>) -> Self {
        Self {
            verdict,
            counters,
            ..Self::default()
        }
    }

    pub fn rejected() -> Self {
        Self::default()
    }

    pub fn with_tokens(mut self, tokens: Vec<Vec<u8>>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_peak_memory(mut self, peak_memory: usize) -> Self {
        self.peak_memory = peak_memory;
        self
    }
}

/// The instrumented-target artifact. Implementations must not perform
/// interactive I/O; a panic is the sole channel for reporting an
/// application-level defect.
pub trait Target: Send + Sync + 'static {
    fn execute(&self, input: &[u8]) -> Execution;
}

impl<F> Target for F
where
    F: Fn(&[u8]) -> Execution + Send + Sync + 'static,
{
    fn execute(&self, input: &[u8]) -> Execution {
        self(input)
    }
}

/// Per-execution resource budget.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub deadline: Duration,
    pub memory_limit: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(1),
            memory_limit: 1 << 30,
        }
    }
}

/// Classified result of one execution. Faults never escape the lane as
/// errors; they are converted into `Outcome` values here.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Valid {
        verdict: i32,
        sample: CoverageSample,
        tokens: Vec<Vec<u8>>,
    },
    Crash {
        signature: String,
        log: String,
    },
    Hang,
    ResourceExceeded,
}

/// Derives the deduplication key for an application fault. Digit runs in the
/// first line of the failure message are normalized away so the same defect
/// reported with different addresses or lengths folds into one signature.
pub fn fault_signature(log: &str) -> String {
    let first_line = log.lines().next().unwrap_or("");
    let normalized: String = first_line
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    format!("{:x}", md5::compute(normalized.as_bytes()))
}

/// Hangs share one constant signature: the defect class is "unbounded hang",
/// not any particular input.
pub fn hang_signature() -> String {
    format!("{:x}", md5::compute(b"hang: deadline exceeded"))
}

/// Memory-ceiling breaches likewise dedup to a single class.
pub fn resource_signature() -> String {
    format!("{:x}", md5::compute(b"resource limit exceeded"))
}

/// Restart bookkeeping for one lane, split by cause so the status line can
/// compare the observed rate against [`TARGET_RESTART_PROBABILITY`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartCounters {
    pub forced: u64,
    pub faults: u64,
    pub hangs: u64,
}

impl RestartCounters {
    pub fn total(&self) -> u64 {
        self.forced + self.faults + self.hangs
    }

    pub fn since(&self, earlier: &RestartCounters) -> RestartCounters {
        RestartCounters {
            forced: self.forced - earlier.forced,
            faults: self.faults - earlier.faults,
            hangs: self.hangs - earlier.hangs,
        }
    }
}

enum LaneReply {
    Done(Execution),
    Fault { log: String },
}

struct LaneWorker {
    submit: Sender<Vec<u8>>,
    replies: Receiver<LaneReply>,
}

/// One execution lane: owns a single supervised worker standing in for the
/// sandboxed target subprocess, enforces the budget, and classifies every
/// invocation into an [`Outcome`].
///
/// A fault ends the worker and a fresh one is spawned, so one bad execution
/// cannot corrupt the next. A hung worker cannot be interrupted in-process;
/// the lane abandons it and respawns, the moral equivalent of killing the
/// child after the deadline.
pub struct ExecLane {
    target: Arc<dyn Target>,
    budget: Budget,
    restart_probability: f64,
    worker: Option<LaneWorker>,
    executions: u64,
    restarts: RestartCounters,
}

impl ExecLane {
    pub fn new(target: Arc<dyn Target>, budget: Budget) -> Self {
        Self {
            target,
            budget,
            restart_probability: TARGET_RESTART_PROBABILITY,
            worker: None,
            executions: 0,
            restarts: RestartCounters::default(),
        }
    }

    pub fn with_restart_probability(mut self, probability: f64) -> Self {
        self.restart_probability = probability;
        self
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn restart_counters(&self) -> RestartCounters {
        self.restarts
    }

    fn submit_input(&self, input: &[u8]) -> Result<(), ()> {
        match &self.worker {
            Some(worker) => worker.submit.send(input.to_vec()).map_err(|_| ()),
            None => Err(()),
        }
    }

    fn spawn_worker(&mut self) {
        let (submit, work) = mpsc::channel::<Vec<u8>>();
        let (reply, replies) = mpsc::channel::<LaneReply>();
        let target = Arc::clone(&self.target);
        thread::spawn(move || {
            while let Ok(input) = work.recv() {
                match catch_unwind(AssertUnwindSafe(|| target.execute(&input))) {
                    Ok(execution) => {
                        if reply.send(LaneReply::Done(execution)).is_err() {
                            break;
                        }
                    }
                    Err(payload) => {
                        // One fault ends this worker, like a crashed child
                        // process; the lane spawns a replacement.
                        let _ = reply.send(LaneReply::Fault {
                            log: panic_message(payload),
                        });
                        break;
                    }
                }
            }
        });
        self.worker = Some(LaneWorker { submit, replies });
    }

    /// Runs one input under the budget. Applies the periodic-restart policy
    /// before dispatching, independent of faults.
    pub fn run<R: Rng + ?Sized>(&mut self, input: &[u8], rng: &mut R) -> Outcome {
        if self.worker.is_none() {
            self.spawn_worker();
        } else if rng.random_bool(self.restart_probability) {
            self.restarts.forced += 1;
            self.spawn_worker();
        }
        self.executions += 1;

        if self.submit_input(input).is_err() {
            // The previous worker died after its last reply; replace it and
            // retry once.
            self.restarts.faults += 1;
            self.spawn_worker();
            if self.submit_input(input).is_err() {
                let log = "lane worker unavailable".to_string();
                return Outcome::Crash {
                    signature: fault_signature(&log),
                    log,
                };
            }
        }

        let reply = {
            let worker = self.worker.as_ref().expect("lane worker just spawned");
            worker.replies.recv_timeout(self.budget.deadline)
        };
        match reply {
            Ok(LaneReply::Done(execution)) => {
                if execution.peak_memory > self.budget.memory_limit {
                    self.restarts.faults += 1;
                    self.spawn_worker();
                    return Outcome::ResourceExceeded;
                }
                Outcome::Valid {
                    verdict: execution.verdict,
                    sample: CoverageSample::from_counters(&execution.counters),
                    tokens: execution.tokens,
                }
            }
            Ok(LaneReply::Fault { log }) => {
                self.restarts.faults += 1;
                self.spawn_worker();
                Outcome::Crash {
                    signature: fault_signature(&log),
                    log,
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                self.restarts.hangs += 1;
                self.spawn_worker();
                Outcome::Hang
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.restarts.faults += 1;
                self.spawn_worker();
                let log = "lane worker exited without a reply".to_string();
                Outcome::Crash {
                    signature: fault_signature(&log),
                    log,
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn quiet_target() -> Arc<dyn Target> {
        Arc::new(|input: &[u8]| Execution::new(1, vec![(input.len() as u64, 1)]))
    }

    fn fast_budget() -> Budget {
        Budget {
            deadline: Duration::from_millis(200),
            memory_limit: 1 << 20,
        }
    }

    #[test]
    fn valid_execution_carries_sample_and_verdict() {
        let mut lane = ExecLane::new(quiet_target(), fast_budget()).with_restart_probability(0.0);
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        match lane.run(b"abc", &mut rng) {
            Outcome::Valid { verdict, sample, .. } => {
                assert_eq!(verdict, 1);
                assert_eq!(sample.count_ones(), 1);
            }
            other => panic!("expected Valid, got {other:?}"),
        }
        assert_eq!(lane.executions(), 1);
        assert_eq!(lane.restart_counters().total(), 0);
    }

    #[test]
    fn fault_is_classified_and_lane_survives() {
        let target: Arc<dyn Target> = Arc::new(|input: &[u8]| {
            if input.first() == Some(&0xFF) {
                panic!("index out of range: {}", input.len());
            }
            Execution::rejected()
        });
        let mut lane = ExecLane::new(target, fast_budget()).with_restart_probability(0.0);
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);

        let first = lane.run(&[0xFF, 1, 2], &mut rng);
        let Outcome::Crash { signature, log } = first else {
            panic!("expected Crash, got {first:?}");
        };
        assert!(log.contains("index out of range"));

        // Same defect with a different length folds into the same signature.
        let second = lane.run(&[0xFF; 9], &mut rng);
        let Outcome::Crash { signature: second_signature, .. } = second else {
            panic!("expected Crash, got {second:?}");
        };
        assert_eq!(signature, second_signature);
        assert_eq!(lane.restart_counters().faults, 2);

        // The lane keeps executing after fault-driven respawns.
        assert_eq!(
            lane.run(&[0x00], &mut rng),
            Outcome::Valid {
                verdict: 0,
                sample: CoverageSample::empty(),
                tokens: Vec::new(),
            }
        );
    }

    #[test]
    fn deadline_breach_is_a_hang_and_the_lane_recovers() {
        let target: Arc<dyn Target> = Arc::new(|input: &[u8]| {
            if input.len() > 2 {
                thread::sleep(Duration::from_secs(2));
            }
            Execution::rejected()
        });
        let budget = Budget {
            deadline: Duration::from_millis(50),
            memory_limit: 1 << 20,
        };
        let mut lane = ExecLane::new(target, budget).with_restart_probability(0.0);
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);

        assert_eq!(lane.run(&[1, 2, 3, 4], &mut rng), Outcome::Hang);
        assert_eq!(lane.restart_counters().hangs, 1);
        assert!(matches!(lane.run(&[1], &mut rng), Outcome::Valid { .. }));
    }

    #[test]
    fn memory_ceiling_breach_is_resource_exceeded() {
        let target: Arc<dyn Target> =
            Arc::new(|_: &[u8]| Execution::new(1, vec![(1, 1)]).with_peak_memory(usize::MAX));
        let mut lane = ExecLane::new(target, fast_budget()).with_restart_probability(0.0);
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        assert_eq!(lane.run(b"x", &mut rng), Outcome::ResourceExceeded);
    }

    #[test]
    fn forced_restarts_follow_the_configured_probability() {
        let mut lane = ExecLane::new(quiet_target(), fast_budget()).with_restart_probability(1.0);
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        lane.run(b"a", &mut rng);
        lane.run(b"b", &mut rng);
        lane.run(b"c", &mut rng);
        // The first run spawns rather than restarts.
        assert_eq!(lane.restart_counters().forced, 2);
    }

    #[test]
    fn fault_signature_normalizes_digits_but_not_text() {
        let a = fault_signature("slice index 17 out of bounds");
        let b = fault_signature("slice index 90210 out of bounds");
        let c = fault_signature("divide by zero");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hang_and_resource_signatures_are_constant() {
        assert_eq!(hang_signature(), hang_signature());
        assert_eq!(resource_signature(), resource_signature());
        assert_ne!(hang_signature(), resource_signature());
    }
}
