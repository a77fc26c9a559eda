//! # Event dispatch
//!
//! Single entry point for inbound packet events. Identity announcements
//! (NODEINFO) feed the directory through the decode chain; every event, of
//! any application type, then flows into the recorder. This is also the
//! error boundary of the ingestion path: a failure while handling one event
//! is logged and counted, and the next event is processed normally.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, error};

use crate::directory::{NodeCandidate, NodeDirectory, UpsertOutcome};
use crate::logutil::escape_log;
use crate::metrics::Metrics;
use crate::recorder::PacketRecorder;
use crate::store::StoreBackend;
use crate::transport::{identity_payload_from_value, parse_node_ref, PacketEvent, PortnumTag};

/// Application tag carried by identity announcements.
const NODEINFO_PORT: u32 = 4;

fn is_identity_announcement(tag: Option<&PortnumTag>) -> bool {
    match tag {
        Some(PortnumTag::Name(name)) => name == "NODEINFO_APP",
        Some(PortnumTag::Code(code)) => *code == NODEINFO_PORT,
        None => false,
    }
}

pub struct EventDispatcher<B: StoreBackend> {
    directory: Arc<NodeDirectory<B>>,
    recorder: PacketRecorder<B>,
    metrics: Arc<Metrics>,
    direct_nodeinfo: bool,
}

impl<B: StoreBackend> EventDispatcher<B> {
    pub fn new(
        directory: Arc<NodeDirectory<B>>,
        recorder: PacketRecorder<B>,
        metrics: Arc<Metrics>,
        direct_nodeinfo: bool,
    ) -> Self {
        Self {
            directory,
            recorder,
            metrics,
            direct_nodeinfo,
        }
    }

    /// Process one event end to end. Never propagates an error: any failure
    /// lands in the log and the error counter, and the caller moves on.
    pub async fn on_event(&self, event: &PacketEvent) {
        self.metrics.inc_received();
        if let Err(err) = self.handle(event).await {
            error!(
                "error processing packet from {}: {:#}",
                escape_log(&event.from),
                err
            );
            self.metrics.inc_errors();
        }
    }

    async fn handle(&self, event: &PacketEvent) -> Result<()> {
        if self.direct_nodeinfo && is_identity_announcement(event.decoded.portnum.as_ref()) {
            self.metrics.inc_nodeinfo_triggers();
            self.handle_identity(event).await?;
        }
        self.recorder.record(event).await
    }

    /// Direct identity path: decode the announcement payload and push the
    /// resolved candidate into the directory without waiting for the sweep.
    async fn handle_identity(&self, event: &PacketEvent) -> Result<()> {
        let Some(source_id) = parse_node_ref(&event.from) else {
            // The recorder warns about this on the shared path.
            return Ok(());
        };
        let Some(payload) = event.decoded.payload.as_ref() else {
            debug!("identity announcement from {} has no payload", source_id);
            return Ok(());
        };

        let tagged = identity_payload_from_value(payload);
        match crate::decode::decode(&tagged) {
            Some(identity) => {
                let mut candidate = NodeCandidate::from_identity(identity);
                candidate.via_mqtt = event.via_mqtt;
                match self.directory.upsert(source_id, &candidate).await? {
                    UpsertOutcome::Promoted
                    | UpsertOutcome::Refreshed
                    | UpsertOutcome::Created { resolved: true } => {
                        self.metrics.inc_direct_updates();
                    }
                    _ => {}
                }
            }
            None => {
                // Undecodable announcements are expected noise; the node
                // stays pending for the reconcile sweep.
                debug!("identity payload from {} did not decode", source_id);
            }
        }
        Ok(())
    }
}
