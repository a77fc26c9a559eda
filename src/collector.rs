//! # Collector runtime
//!
//! Wires the store, directory, recorder, and dispatcher together and runs
//! the ingestion loop: events are taken off the transport channel one at a
//! time, in arrival order, while the reconcile sweep, the stats report, and
//! the store health supervisor run as background tasks. Shutdown is
//! cooperative; the run flag is checked between events and cycles, never
//! mid-event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, MissedTickBehavior};

use crate::config::Config;
use crate::directory::NodeDirectory;
use crate::dispatch::EventDispatcher;
use crate::metrics::Metrics;
use crate::recorder::PacketRecorder;
use crate::store::{ResilientStore, SledBackend, StoreBackend};
use crate::transport::{PacketEvent, RosterSnapshot};

/// How often the event loop wakes up to notice a cleared run flag while the
/// channel is quiet.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

pub struct Collector<B: StoreBackend> {
    store: Arc<ResilientStore<B>>,
    directory: Arc<NodeDirectory<B>>,
    dispatcher: EventDispatcher<B>,
    metrics: Arc<Metrics>,
    config: Config,
    running: Arc<AtomicBool>,
    started: Instant,
}

impl Collector<SledBackend> {
    /// Open the sled-backed store described by `config` and assemble the
    /// full ingestion pipeline around it.
    pub fn open(config: Config) -> Result<Self> {
        let backend = SledBackend::open(&config.storage.data_dir)
            .with_context(|| format!("failed to open store at {}", config.storage.data_dir))?;
        Self::with_backend(backend, config)
    }
}

impl<B: StoreBackend> Collector<B> {
    pub fn with_backend(backend: B, config: Config) -> Result<Self> {
        let store = Arc::new(ResilientStore::new(
            backend,
            config.storage.pool_config(),
            config.storage.retry_policy(),
        )?);
        let metrics = Arc::new(Metrics::new());
        let directory = Arc::new(NodeDirectory::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.collector.enable_position_tracking,
        ));
        let recorder = PacketRecorder::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&metrics),
            config.collector.max_event_bytes,
        );
        let dispatcher = EventDispatcher::new(
            Arc::clone(&directory),
            recorder,
            Arc::clone(&metrics),
            config.collector.enable_direct_nodeinfo,
        );
        Ok(Self {
            store,
            directory,
            dispatcher,
            metrics,
            config,
            running: Arc::new(AtomicBool::new(true)),
            started: Instant::now(),
        })
    }

    /// Flag shared with signal handlers; clearing it stops the run loop at
    /// the next event boundary.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<ResilientStore<B>> {
        Arc::clone(&self.store)
    }

    pub fn directory(&self) -> Arc<NodeDirectory<B>> {
        Arc::clone(&self.directory)
    }

    /// Run the ingestion loop until the transport channel closes or the run
    /// flag is cleared. Background cadences are spawned here and stopped on
    /// the way out.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<PacketEvent>,
        roster: Arc<RwLock<RosterSnapshot>>,
    ) -> Result<()> {
        info!(
            "collector started (direct_nodeinfo={}, sweep={}, position_tracking={})",
            self.config.collector.enable_direct_nodeinfo,
            self.config.collector.enable_sweep,
            self.config.collector.enable_position_tracking
        );

        let mut background: Vec<JoinHandle<()>> = Vec::new();
        if self.config.collector.enable_sweep {
            background.push(self.spawn_sweep(Arc::clone(&roster)));
        }
        background.push(self.spawn_stats());
        background.push(self.spawn_health_supervisor());

        let mut poll = tokio::time::interval(SHUTDOWN_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if !self.running.load(Ordering::SeqCst) {
                info!("shutdown requested; stopping event loop");
                break;
            }
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.dispatcher.on_event(&event).await,
                    None => {
                        info!("transport channel closed; stopping event loop");
                        break;
                    }
                },
                _ = poll.tick() => {}
            }
        }

        for handle in background {
            handle.abort();
        }
        let snapshot = self.metrics.snapshot();
        info!(
            "final {}",
            snapshot.summary(self.started.elapsed().as_secs(), self.store.health().await)
        );
        Ok(())
    }

    /// Periodic reconcile sweep over the pending set, against the roster
    /// snapshot the transport maintains.
    fn spawn_sweep(&self, roster: Arc<RwLock<RosterSnapshot>>) -> JoinHandle<()> {
        let directory = Arc::clone(&self.directory);
        let running = Arc::clone(&self.running);
        let period = Duration::from_secs(self.config.collector.sweep_interval_secs.max(1));
        let max_entries = self.config.collector.sweep_max_entries;
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if directory.pending_count() == 0 {
                    continue;
                }
                let snapshot = roster.read().await.clone();
                if let Err(err) = directory.reconcile(&snapshot, max_entries).await {
                    warn!("reconcile sweep failed: {}", err);
                }
            }
        })
    }

    /// Periodic operational stats line, including a store health probe.
    fn spawn_stats(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let running = Arc::clone(&self.running);
        let started = self.started;
        let period = Duration::from_secs(self.config.collector.stats_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let healthy = store.health().await;
                info!(
                    "{}",
                    metrics.snapshot().summary(started.elapsed().as_secs(), healthy)
                );
            }
        })
    }

    /// Keepalive-style supervision: after an initial idle period, probe the
    /// store on a fixed cadence and reset the pool once the consecutive
    /// failure threshold is reached.
    fn spawn_health_supervisor(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let running = Arc::clone(&self.running);
        let idle = Duration::from_secs(self.config.storage.keepalive_idle_secs.max(1));
        let probe = Duration::from_secs(self.config.storage.keepalive_probe_secs.max(1));
        let threshold = self.config.storage.keepalive_failure_threshold.max(1);
        tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + idle, probe);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failures = 0u32;
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if store.health().await {
                    failures = 0;
                    continue;
                }
                failures += 1;
                warn!(
                    "store health probe failed ({}/{} consecutive)",
                    failures, threshold
                );
                if failures >= threshold {
                    warn!("health threshold reached; resetting connection pool");
                    store.reset_pool();
                    failures = 0;
                }
            }
        })
    }
}
