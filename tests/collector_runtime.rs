//! Collector run loop: events drain in order, the loop exits when the
//! transport channel closes, and the assembled pipeline persists rows.

use std::sync::Arc;

use meshcollect::store::StoreConn;
use meshcollect::collector::Collector;
use meshcollect::config::Config;
use meshcollect::store::SledBackend;
use meshcollect::transport::{PacketEvent, RosterSnapshot};
use tokio::sync::{mpsc, RwLock};

fn event_json(from: &str, id: u32) -> PacketEvent {
    serde_json::from_value(serde_json::json!({
        "from": from,
        "to": "^all",
        "decoded": {"portnum": "TELEMETRY_APP", "payload": [1, 2, 3]},
        "id": id
    }))
    .expect("event")
}

#[tokio::test]
async fn run_drains_channel_and_stops_on_close() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let backend = SledBackend::open(data_dir.path()).expect("open");
    let mut config = Config::default();
    config.collector.enable_sweep = false;
    let collector = Collector::with_backend(backend, config).expect("collector");

    let (tx, rx) = mpsc::channel(8);
    for i in 0..5u32 {
        tx.send(event_json("!2f8a1c00", i)).await.expect("send");
    }
    drop(tx);

    collector
        .run(rx, Arc::new(RwLock::new(RosterSnapshot::default())))
        .await
        .expect("run");

    let snap = collector.metrics().snapshot();
    assert_eq!(snap.received, 5);
    assert_eq!(snap.stored, 5);
    assert_eq!(snap.errors, 0);

    let store = collector.store();
    let rows = store.execute(|conn| conn.metric_count()).await.expect("count");
    assert_eq!(rows, 5);
    let nodes = store.execute(|conn| conn.node_count()).await.expect("count");
    assert_eq!(nodes, 1, "same source collapses to one node row");
}

#[tokio::test]
async fn shutdown_flag_stops_the_loop_without_closing_the_channel() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let backend = SledBackend::open(data_dir.path()).expect("open");
    let mut config = Config::default();
    config.collector.enable_sweep = false;
    let collector = Collector::with_backend(backend, config).expect("collector");

    let (tx, rx) = mpsc::channel::<PacketEvent>(8);
    let running = collector.shutdown_handle();
    running.store(false, std::sync::atomic::Ordering::SeqCst);

    collector
        .run(rx, Arc::new(RwLock::new(RosterSnapshot::default())))
        .await
        .expect("run");
    drop(tx);
}
