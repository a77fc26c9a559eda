//! JSON-lines replay source: malformed and blank lines are skipped, valid
//! events flow through the dispatcher.

mod common;

use std::io::Write;

use meshcollect::store::StoreConn;
use meshcollect::transport::JsonlReplay;

#[tokio::test]
async fn replay_skips_bad_lines_and_feeds_the_dispatcher() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");
    {
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(
            f,
            r#"{{"from":"!2f8a1c00","to":"^all","decoded":{{"portnum":"TELEMETRY_APP"}},"id":1}}"#
        )
        .unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{{not json").unwrap();
        writeln!(
            f,
            r#"{{"from":"!00bc614e","to":"^all","decoded":{{"portnum":"POSITION_APP"}},"id":2}}"#
        )
        .unwrap();
    }

    let mut source = JsonlReplay::open(path.to_str().expect("utf-8 path"))
        .await
        .expect("open replay");

    let p = common::pipeline();
    let mut seen = 0usize;
    while let Some(event) = source.next_event().await.expect("next event") {
        p.dispatcher.on_event(&event).await;
        seen += 1;
    }
    assert_eq!(seen, 2, "one blank and one malformed line skipped");

    let metrics_rows = p
        .store
        .execute(|conn| conn.metric_count())
        .await
        .expect("count");
    assert_eq!(metrics_rows, 2);
    let snap = p.metrics.snapshot();
    assert_eq!(snap.received, 2);
    assert_eq!(snap.stored, 2);
    assert_eq!(snap.errors, 0);
}
