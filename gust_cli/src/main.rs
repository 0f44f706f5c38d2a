use gust_core::config::{CoordinatorSettings, GustConfig};
use gust_core::coordinator::{Coordinator, CoordinatorHub};
use gust_core::exec::{Execution, Target};
use gust_core::worker::{SharedLocal, run_lanes};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the campaign hub workers connect to.
    Coordinator {
        #[clap(long)]
        listen: Option<String>,
        #[clap(long)]
        workdir: Option<PathBuf>,
    },
    /// Run fuzzing lanes attached to a coordinator.
    Worker {
        #[clap(long)]
        coordinator: Option<String>,
        #[clap(short, long)]
        lanes: Option<usize>,
    },
    /// Run a self-contained campaign in this process.
    Fuzz {
        #[clap(short, long)]
        lanes: Option<usize>,
        #[clap(long)]
        workdir: Option<PathBuf>,
        #[clap(long)]
        max_executions: Option<u64>,
    },
}

/// Demo harness: a four-byte header guards the interesting region, and a
/// 0xFF mode byte right after a valid header trips a defect.
fn demo_target() -> Arc<dyn Target> {
    const HEADER: [u8; 4] = *b"GST1";
    Arc::new(|data: &[u8]| {
        let matched = data
            .iter()
            .zip(HEADER.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut counters: Vec<(u64, u32)> = (0..=matched).map(|i| (i as u64, 1)).collect();
        if matched == HEADER.len() {
            counters.push((64, data.len().min(255) as u32));
            if data.get(4) == Some(&0xFF) {
                panic!("unsupported mode byte in header");
            }
        }
        Execution::new(i32::from(matched == HEADER.len()) + 1, counters)
            .with_tokens(vec![HEADER.to_vec()])
    })
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<GustConfig> {
    match path {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            GustConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("gust.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                GustConfig::load_from_file(&default_config_path)
            } else {
                println!(
                    "No config file specified and default 'gust.toml' not found, using built-in defaults."
                );
                Ok(GustConfig::default())
            }
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config_file)?;

    match cli.command {
        Command::Coordinator { listen, workdir } => {
            if let Some(root) = workdir {
                config.workdir.root = root;
            }
            let mut settings = config.coordinator.clone().unwrap_or_default();
            if let Some(listen) = listen {
                settings.addr = listen;
            }
            println!("Effective configuration: {config:#?}");

            let hub = Arc::new(CoordinatorHub::open(&config.workdir)?);
            let listen_addr = settings.addr.clone();
            let coordinator = Coordinator::bind(listen_addr.as_str(), hub, settings)?;
            println!("coordinator listening on {}", coordinator.local_addr()?);
            coordinator.serve()
        }
        Command::Worker { coordinator, lanes } => {
            let mut settings = config.coordinator.clone().unwrap_or_default();
            if let Some(addr) = coordinator {
                settings.addr = addr;
            }
            config.coordinator = Some(settings);
            if let Some(lanes) = lanes {
                config.fuzzer.lanes = lanes;
            }
            println!("Effective configuration: {config:#?}");

            // Connected workers keep their mirror in memory; the
            // coordinator owns the durable state.
            let shared = Arc::new(SharedLocal::in_memory());
            run_lanes(shared, demo_target(), &config)
        }
        Command::Fuzz {
            lanes,
            workdir,
            max_executions,
        } => {
            config.coordinator = None;
            if let Some(lanes) = lanes {
                config.fuzzer.lanes = lanes;
            }
            if let Some(root) = workdir {
                config.workdir.root = root;
            }
            if let Some(max) = max_executions {
                config.fuzzer.max_executions = Some(max);
            }
            println!("Effective configuration: {config:#?}");

            let shared = Arc::new(SharedLocal::open(&config.workdir)?);
            let status_settings = CoordinatorSettings::default();
            let printer = spawn_status_printer(
                Arc::clone(&shared),
                Duration::from_secs(status_settings.status_interval_secs),
            );
            let result = run_lanes(Arc::clone(&shared), demo_target(), &config);
            shared.request_stop();
            let _ = printer.join();
            println!("{}", status_line(&shared));
            result
        }
    }
}

fn status_line(shared: &SharedLocal) -> String {
    shared.stats.status_line(
        shared.corpus.lock().unwrap().len(),
        shared.coverage.density(),
    )
}

fn spawn_status_printer(shared: Arc<SharedLocal>, every: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !shared.stop.load(Ordering::Relaxed) {
            thread::sleep(every);
            if shared.stop.load(Ordering::Relaxed) {
                break;
            }
            println!("{}", status_line(&shared));
        }
    })
}
