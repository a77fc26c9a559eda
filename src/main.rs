//! Binary entrypoint for the meshcollect CLI.
//!
//! Commands:
//! - `start [--replay <events.jsonl>] [--roster <roster.json>]` - run the
//!   collector, optionally replaying a recorded event stream
//! - `init` - create a starter `config.toml`
//! - `status` - print store counts and health
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::{mpsc, RwLock};

use meshcollect::collector::Collector;
use meshcollect::config::Config;
use meshcollect::store::StoreConn;
use meshcollect::transport::{JsonlReplay, RosterSnapshot};

#[derive(Parser)]
#[command(name = "meshcollect")]
#[command(about = "A telemetry collector for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the collector
    Start {
        /// Replay a JSON-lines event stream instead of a live device
        #[arg(long)]
        replay: Option<String>,

        /// Roster snapshot file for the reconcile sweep
        #[arg(long)]
        roster: Option<String>,
    },
    /// Initialize a new collector configuration
    Init,
    /// Show store counts and health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { replay, roster } => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            config.validate()?;
            info!("Starting meshcollect v{}", env!("CARGO_PKG_VERSION"));

            let roster_snapshot = match roster {
                Some(path) => {
                    let snapshot = RosterSnapshot::load(&path).await?;
                    info!("Loaded roster with {} node(s) from {}", snapshot.nodes.len(), path);
                    snapshot
                }
                None => RosterSnapshot::default(),
            };
            let roster = Arc::new(RwLock::new(roster_snapshot));

            let collector = Collector::open(config)?;
            let running = collector.shutdown_handle();

            let signal_flag = Arc::clone(&running);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received; shutting down");
                    signal_flag.store(false, Ordering::SeqCst);
                }
            });

            let (tx, rx) = mpsc::channel(64);
            match replay {
                Some(path) => {
                    tokio::spawn(async move {
                        match JsonlReplay::open(&path).await {
                            Ok(mut source) => loop {
                                match source.next_event().await {
                                    Ok(Some(event)) => {
                                        if tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(None) => {
                                        info!("Replay stream {} exhausted", path);
                                        break;
                                    }
                                    Err(e) => {
                                        warn!("Replay stream {} failed: {:#}", path, e);
                                        break;
                                    }
                                }
                            },
                            Err(e) => warn!("Could not open replay stream: {:#}", e),
                        }
                    });
                }
                None => {
                    // No transport source attached; keep the channel open so
                    // the sweep and stats cadences run until shutdown.
                    info!("No replay source given; running with background tasks only");
                    let holder_flag = Arc::clone(&running);
                    tokio::spawn(async move {
                        let _tx = tx;
                        while holder_flag.load(Ordering::SeqCst) {
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                    });
                }
            }

            collector.run(rx, roster).await?;
        }
        Commands::Init => {
            info!("Initializing collector configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            let collector = Collector::open(config)?;
            let store = collector.store();
            let nodes = store.execute(|conn| conn.node_count()).await?;
            let metrics_rows = store.execute(|conn| conn.metric_count()).await?;
            let healthy = store.health().await;
            println!("Nodes:   {}", nodes);
            println!("Metrics: {}", metrics_rows);
            println!("Health:  {}", if healthy { "ok" } else { "unhealthy" });
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(file) = config.as_ref().and_then(|c| c.logging.file.clone()) {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            let write_mutex = mutex.clone();
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
