use crate::config::{CoordinatorSettings, WorkdirSettings};
use crate::corpus::Corpus;
use crate::coverage::{Classification, CoverageSample, GlobalCoverage};
use crate::crash::CrashStore;
use crate::proto::{NewInput, Request, Response, StatsDelta, read_frame, write_frame};
use crate::stats::CampaignStats;
use anyhow::Context;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// The coordinator's authoritative campaign state: corpus, crash archive,
/// coverage accumulator and stats, shared between connection handlers.
///
/// Workers report everything they found locally novel; the hub re-classifies
/// each report against its own accumulator, so a discovery racing in from
/// two workers is admitted exactly once.
pub struct CoordinatorHub {
    corpus: Mutex<Corpus>,
    crashes: Mutex<CrashStore>,
    coverage: GlobalCoverage,
    stats: CampaignStats,
    stats_path: Option<PathBuf>,
}

impl CoordinatorHub {
    pub fn in_memory() -> Self {
        Self {
            corpus: Mutex::new(Corpus::in_memory()),
            crashes: Mutex::new(CrashStore::in_memory()),
            coverage: GlobalCoverage::new(),
            stats: CampaignStats::new(),
            stats_path: None,
        }
    }

    /// Opens durable campaign state under `workdir`, restoring the corpus,
    /// the crash archive, the coverage accumulator and the stats totals from
    /// a previous run.
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
            let checkpoint = CampaignStats::load(&stats_path)
                .with_context(|| format!("loading stats from {stats_path:?}"))?;
            stats.restore(&checkpoint);
        }

        Ok(Self {
            corpus: Mutex::new(corpus),
            crashes: Mutex::new(crashes),
            coverage,
            stats,
            stats_path: Some(stats_path),
        })
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.lock().unwrap().len()
    }

    pub fn crasher_count(&self) -> usize {
        self.crashes.lock().unwrap().len()
    }

    /// Seeds an empty campaign with user-provided starting inputs. No
    /// execution happens here: a seed carrying a signature goes through the
    /// usual classify, while a seed with no signature yet is deduplicated by
    /// its raw byte identity only, so it still enters the corpus once.
    pub fn plant_seed(&self, input: Vec<u8>, signature: &[u32]) -> anyhow::Result<bool> {
        let classification = if signature.is_empty() {
            Classification {
                is_novel: true,
                new_bits: CoverageSample::empty(),
            }
        } else {
            self.coverage.classify(&CoverageSample::from_bits(signature))
        };
        let mut corpus = self.corpus.lock().unwrap();
        let admitted = corpus
            .admit(input, &classification, 1, "seed")?
            .is_some();
        Ok(admitted)
    }

    /// Folds one worker report into the global state. Returns an error only
    /// on persistence failure, which is fatal to the campaign: continuing
    /// with a corpus that silently stopped persisting would lose findings.
    pub fn absorb_report(
        &self,
        new_inputs: &[NewInput],
        crashers: &[crate::crash::Crasher],
        delta: &StatsDelta,
    ) -> anyhow::Result<()> {
        for discovery in new_inputs {
            let sample = CoverageSample::from_bits(&discovery.signature);
            let classification = self.coverage.classify(&sample);
            if !classification.is_novel {
                continue;
            }
            let mut corpus = self.corpus.lock().unwrap();
            if corpus
                .admit(
                    discovery.input.clone(),
                    &classification,
                    discovery.verdict,
                    &discovery.parentage,
                )
                .context("persisting corpus entry")?
                .is_some()
            {
                self.stats.note_discovery();
            }
        }

        for crasher in crashers {
            let mut crashes = self.crashes.lock().unwrap();
            if crashes.report(crasher).context("persisting crasher")? {
                self.stats.record_crasher();
            }
        }

        self.stats.record_executions(delta.executions);
        self.stats.record_forced_restarts(delta.forced_restarts);
        self.stats.record_fault_restarts(delta.fault_restarts);
        self.stats.record_hangs(delta.hangs);
        Ok(())
    }

    /// Corpus entries admitted after `cursor`, as wire discoveries, plus the
    /// advanced cursor. The corpus is append-only, so a plain index is a
    /// stable broadcast position.
    pub fn entries_since(&self, cursor: usize) -> (Vec<NewInput>, usize) {
        let corpus = self.corpus.lock().unwrap();
        let discoveries = (cursor..corpus.len())
            .filter_map(|i| corpus.get(i))
            .map(|entry| NewInput {
                input: entry.input.clone(),
                signature: entry.signature.clone(),
                verdict: entry.verdict,
                parentage: entry.parentage.clone(),
            })
            .collect();
        (discoveries, corpus.len().max(cursor))
    }

    /// Flushes the durable pieces: corpus index and stats totals. Inputs and
    /// crashers are persisted eagerly at admission, so only the small files
    /// rewrite here.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        self.corpus
            .lock()
            .unwrap()
            .checkpoint()
            .context("checkpointing corpus index")?;
        if let Some(path) = &self.stats_path {
            self.stats
                .save(path)
                .with_context(|| format!("saving stats to {path:?}"))?;
        }
        Ok(())
    }

    pub fn status_line(&self) -> String {
        self.stats
            .status_line(self.corpus_len(), self.coverage.density())
    }
}

/// TCP front end for a [`CoordinatorHub`]: accepts worker connections,
/// answers the sync protocol, and runs the periodic status and checkpoint
/// tickers.
pub struct Coordinator {
    hub: Arc<CoordinatorHub>,
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn bind(
        addr: impl ToSocketAddrs,
        hub: Arc<CoordinatorHub>,
        settings: CoordinatorSettings,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).context("binding coordinator listener")?;
        listener
            .set_nonblocking(true)
            .context("configuring coordinator listener")?;
        Ok(Self {
            hub,
            listener,
            stop: Arc::new(AtomicBool::new(false)),
            settings,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for asking the serve loop to wind down.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Accept loop. Blocks until the stop flag is raised; each connection is
    /// served on its own thread with blocking frame reads.
    pub fn serve(&self) -> anyhow::Result<()> {
        let ticker = {
            let hub = Arc::clone(&self.hub);
            let stop = Arc::clone(&self.stop);
            let status_every = Duration::from_secs(self.settings.status_interval_secs);
            let checkpoint_every = Duration::from_secs(self.settings.checkpoint_interval_secs);
            thread::spawn(move || run_tickers(&hub, &stop, status_every, checkpoint_every))
        };

        while !self.stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&self.hub);
                    let stop = Arc::clone(&self.stop);
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, &hub, &stop) {
                            eprintln!("coordinator: connection from {peer} ended: {err}");
                        }
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(err).context("accepting worker connection"),
            }
        }

        let _ = ticker.join();
        self.hub.checkpoint()
    }
}

fn run_tickers(
    hub: &CoordinatorHub,
    stop: &AtomicBool,
    status_every: Duration,
    checkpoint_every: Duration,
) {
    let mut last_status = Instant::now();
    let mut last_checkpoint = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if last_status.elapsed() >= status_every {
            println!("{}", hub.status_line());
            last_status = Instant::now();
        }
        if last_checkpoint.elapsed() >= checkpoint_every {
            if let Err(err) = hub.checkpoint() {
                eprintln!("coordinator: checkpoint failed, stopping: {err:#}");
                stop.store(true, Ordering::Relaxed);
                return;
            }
            last_checkpoint = Instant::now();
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    hub: &CoordinatorHub,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    // Bound reads so a silent peer cannot pin the handler past shutdown.
    stream.set_read_timeout(Some(Duration::from_secs(60)))?;

    let mut cursor = 0usize;
    let mut registered = false;
    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        let request: Request = match read_frame(&mut stream) {
            Ok(request) => request,
            // Peer hangup ends the session without noise.
            Err(crate::proto::ProtoError::Io(_)) => break Ok(()),
            Err(err) => break Err(err.into()),
        };
        let response = match request {
            Request::Hello { worker } => {
                println!("coordinator: worker {worker} connected");
                hub.stats.worker_connected();
                registered = true;
                let (seeds, next) = hub.entries_since(0);
                cursor = next;
                Response::Welcome { seeds }
            }
            Request::GetWork => {
                let (discoveries, next) = hub.entries_since(cursor);
                cursor = next;
                Response::Work { discoveries }
            }
            Request::ReportResult {
                new_inputs,
                crashers,
                stats,
            } => {
                if let Err(err) = hub.absorb_report(&new_inputs, &crashers, &stats) {
                    // Losing persistence invalidates the whole campaign.
                    eprintln!("coordinator: failed to absorb report, stopping: {err:#}");
                    stop.store(true, Ordering::Relaxed);
                    break Err(err);
                }
                let (discoveries, next) = hub.entries_since(cursor);
                cursor = next;
                Response::Ack { discoveries }
            }
        };
        if let Err(err) = write_frame(&mut stream, &response) {
            break Err(err.into());
        }
    };
    if registered {
        hub.stats.worker_disconnected();
    }
    result
}
