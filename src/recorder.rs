//! # Packet telemetry recording
//!
//! Derives one append-only `mesh_packet_metrics` row per inbound event.
//! Before the insert, the source node and any non-broadcast destination are
//! upserted through the directory, so every metric row's node references
//! already exist. All name-write policy stays in the directory; this module
//! only synthesizes placeholder candidates.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::{debug, warn};

use crate::directory::{NodeCandidate, NodeDirectory};
use crate::logutil::escape_log;
use crate::metrics::Metrics;
use crate::model::{PacketMetricRow, BROADCAST_ADDR};
use crate::store::{ResilientStore, StoreBackend, StoreConn};
use crate::transport::{parse_node_ref, payload_size_bytes, PacketEvent, PortnumTag};

/// Normalize a portnum tag: `0` or absent means the application is unknown,
/// numeric values in the private range (≥ 256) are private applications,
/// known tags pass through unchanged.
pub fn classify_portnum(tag: Option<&PortnumTag>) -> String {
    match tag {
        None => "UNKNOWN_APP".to_string(),
        Some(PortnumTag::Code(0)) => "UNKNOWN_APP".to_string(),
        Some(PortnumTag::Code(code)) if *code >= 256 => "PRIVATE_APP".to_string(),
        Some(PortnumTag::Code(code)) => known_port_name(*code).to_string(),
        Some(PortnumTag::Name(name)) if name.trim().is_empty() => "UNKNOWN_APP".to_string(),
        Some(PortnumTag::Name(name)) => name.clone(),
    }
}

/// Numeric tags in the public range, per the radio protocol's port table.
fn known_port_name(code: u32) -> &'static str {
    match code {
        1 => "TEXT_MESSAGE_APP",
        2 => "REMOTE_HARDWARE_APP",
        3 => "POSITION_APP",
        4 => "NODEINFO_APP",
        5 => "ROUTING_APP",
        6 => "ADMIN_APP",
        7 => "TEXT_MESSAGE_COMPRESSED_APP",
        8 => "WAYPOINT_APP",
        10 => "DETECTION_SENSOR_APP",
        32 => "REPLY_APP",
        34 => "PAXCOUNTER_APP",
        64 => "SERIAL_APP",
        65 => "STORE_FORWARD_APP",
        66 => "RANGE_TEST_APP",
        67 => "TELEMETRY_APP",
        70 => "TRACEROUTE_APP",
        71 => "NEIGHBORINFO_APP",
        73 => "MAP_REPORT_APP",
        _ => "UNKNOWN_APP",
    }
}

pub struct PacketRecorder<B: StoreBackend> {
    store: Arc<ResilientStore<B>>,
    directory: Arc<NodeDirectory<B>>,
    metrics: Arc<Metrics>,
    max_event_bytes: usize,
}

impl<B: StoreBackend> PacketRecorder<B> {
    pub fn new(
        store: Arc<ResilientStore<B>>,
        directory: Arc<NodeDirectory<B>>,
        metrics: Arc<Metrics>,
        max_event_bytes: usize,
    ) -> Self {
        Self {
            store,
            directory,
            metrics,
            max_event_bytes,
        }
    }

    /// Derive and persist the metric row for one event. Oversize events are
    /// dropped (logged, counted), unparseable source references are skipped.
    pub async fn record(&self, event: &PacketEvent) -> Result<()> {
        let serialized_len = serde_json::to_vec(event)?.len();
        if serialized_len > self.max_event_bytes {
            warn!(
                "dropping oversize event from {}: {} bytes exceeds ceiling of {}",
                escape_log(&event.from),
                serialized_len,
                self.max_event_bytes
            );
            self.metrics.inc_dropped_oversize();
            return Ok(());
        }

        let Some(source_id) = parse_node_ref(&event.from) else {
            warn!(
                "could not parse source node reference: {}",
                escape_log(&event.from)
            );
            return Ok(());
        };

        // A missing destination is an implicit broadcast; only an
        // unparseable reference stores as unknown.
        let destination_id = match event.to.as_deref() {
            None => Some(BROADCAST_ADDR),
            Some(raw) => parse_node_ref(raw),
        };
        let portnum = classify_portnum(event.decoded.portnum.as_ref());
        let message_size_bytes = payload_size_bytes(event.decoded.payload.as_ref());

        // Referential completeness: node rows first, metric row second.
        let mut source_candidate = NodeCandidate::placeholder(source_id);
        source_candidate.via_mqtt = event.via_mqtt;
        self.directory.upsert(source_id, &source_candidate).await?;
        if let Some(dest) = destination_id {
            if dest != BROADCAST_ADDR {
                self.directory
                    .upsert(dest, &NodeCandidate::placeholder(dest))
                    .await?;
            }
        }

        let row = PacketMetricRow {
            time: Utc::now(),
            source_id,
            destination_id,
            portnum,
            packet_id: event.id,
            channel: event.channel,
            rx_time: event.rx_time,
            rx_snr: event.rx_snr,
            rx_rssi: event.rx_rssi,
            hop_limit: event.decoded.hop_limit,
            hop_start: event.decoded.hop_start,
            want_ack: event.decoded.want_ack,
            via_mqtt: event.via_mqtt,
            message_size_bytes,
        };
        self.store.execute(|conn| conn.insert_metric(&row)).await?;
        self.metrics.inc_stored();
        debug!(
            "stored metric row: {} -> {:?} port={} size={}",
            source_id, destination_id, row.portnum, message_size_bytes
        );
        Ok(())
    }
}
