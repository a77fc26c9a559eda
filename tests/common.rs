//! Test utilities & fixtures.
//! Builds a full ingestion pipeline over a sled store in a temp directory.
#![allow(dead_code)] // Each integration test binary uses a subset of these.

use std::sync::Arc;

use meshcollect::config::Config;
use meshcollect::directory::NodeDirectory;
use meshcollect::dispatch::EventDispatcher;
use meshcollect::metrics::Metrics;
use meshcollect::recorder::PacketRecorder;
use meshcollect::store::{PoolConfig, ResilientStore, RetryPolicy, SledBackend};
use meshcollect::transport::PacketEvent;

pub struct Pipeline {
    pub store: Arc<ResilientStore<SledBackend>>,
    pub directory: Arc<NodeDirectory<SledBackend>>,
    pub dispatcher: EventDispatcher<SledBackend>,
    pub metrics: Arc<Metrics>,
    // Dropping the TempDir removes the store files; keep it alive with the
    // pipeline.
    _data_dir: tempfile::TempDir,
}

/// Pipeline with default feature toggles: direct NODEINFO on, position
/// tracking off.
pub fn pipeline() -> Pipeline {
    pipeline_with(Config::default())
}

pub fn pipeline_with(config: Config) -> Pipeline {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let backend = SledBackend::open(data_dir.path()).expect("open sled store");
    let store = Arc::new(
        ResilientStore::new(backend, PoolConfig::default(), RetryPolicy::default())
            .expect("store"),
    );
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
    Pipeline {
        store,
        directory,
        dispatcher,
        metrics,
        _data_dir: data_dir,
    }
}

/// Event as the transport would serialize it, with sensible defaults.
pub fn event(from: &str, to: Option<&str>, portnum: &str, payload: serde_json::Value) -> PacketEvent {
    let raw = serde_json::json!({
        "from": from,
        "to": to,
        "decoded": {
            "portnum": portnum,
            "payload": payload,
            "hopLimit": 3,
            "wantAck": false
        },
        "rxTime": 1724900000u32,
        "rxSnr": 7.25,
        "rxRssi": -91,
        "channel": 0,
        "id": 42,
        "viaMqtt": false
    });
    serde_json::from_value(raw).expect("event fixture")
}
