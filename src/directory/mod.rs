//! # Node directory
//!
//! Owns the write policy for `node_details`. The one invariant everything
//! here serves: a node's resolution status only moves forward. A row created
//! with synthesized placeholder names is *provisional*; the first write
//! carrying real announced names *promotes* it, and from then on no upsert,
//! sweep, or race may regress the names back to placeholders.
//!
//! Promotion itself happens inside the store as a conditional replace (the
//! row is only rewritten while its stored names are still
//! placeholder-shaped), which makes the direct upsert path and the periodic
//! reconcile sweep commutative and idempotent under any interleaving — no
//! in-process lock is needed for correctness. The pending set kept here is
//! advisory bookkeeping for the sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::decode::DecodedIdentity;
use crate::metrics::Metrics;
use crate::model::{
    is_placeholder_name, placeholder_long_name, placeholder_short_name, NodeRecord, Position,
};
use crate::store::{NodeRefresh, ResilientStore, StoreBackend, StoreConn, StoreError};
use crate::transport::RosterSnapshot;

/// Candidate state for a node, carried by every upsert.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
    pub long_name: String,
    pub short_name: String,
    pub hardware_model: String,
    pub role: String,
    pub position: Option<Position>,
    pub via_mqtt: bool,
}

impl NodeCandidate {
    /// Synthesized candidate for a node only known by its identifier.
    pub fn placeholder(node_id: u32) -> Self {
        Self {
            long_name: placeholder_long_name(node_id),
            short_name: placeholder_short_name(node_id),
            hardware_model: "UNKNOWN".to_string(),
            role: "CLIENT".to_string(),
            position: None,
            via_mqtt: false,
        }
    }

    /// Candidate from a successfully decoded identity announcement.
    pub fn from_identity(identity: DecodedIdentity) -> Self {
        Self {
            long_name: identity.long_name,
            short_name: identity.short_name,
            hardware_model: identity.hardware_model,
            role: identity.role,
            position: None,
            via_mqtt: false,
        }
    }

    /// Resolved means the candidate carries real names, not placeholders.
    pub fn is_resolved(&self) -> bool {
        !is_placeholder_name(&self.long_name, &self.short_name)
    }
}

/// What an upsert did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { resolved: bool },
    /// Provisional row took the candidate's resolved names.
    Promoted,
    /// Row existed; descriptive fields refreshed, names untouched.
    Refreshed,
    Unchanged,
}

pub struct NodeDirectory<B: StoreBackend> {
    store: Arc<ResilientStore<B>>,
    metrics: Arc<Metrics>,
    position_tracking: bool,
    pending: Mutex<HashMap<u32, DateTime<Utc>>>,
}

impl<B: StoreBackend> NodeDirectory<B> {
    pub fn new(store: Arc<ResilientStore<B>>, metrics: Arc<Metrics>, position_tracking: bool) -> Self {
        Self {
            store,
            metrics,
            position_tracking,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or reconcile one node row against `candidate`.
    ///
    /// Missing row: insert, provisional rows entering the pending set.
    /// Existing row: promote names only when the row is provisional and the
    /// candidate resolved; refresh descriptive fields independently.
    /// Promotion is idempotent — repeating it with the same resolved
    /// candidate leaves the row unchanged.
    pub async fn upsert(
        &self,
        node_id: u32,
        candidate: &NodeCandidate,
    ) -> Result<UpsertOutcome, StoreError> {
        let resolved = candidate.is_resolved();

        let existing = self.store.execute(|conn| conn.get_node(node_id)).await?;
        if existing.is_none() {
            let record = self.build_record(node_id, candidate);
            let created = self
                .store
                .execute(|conn| conn.insert_node(&record))
                .await?;
            if created {
                self.metrics.inc_nodes_created();
                if resolved {
                    info!(
                        "node {} created resolved: {} ({})",
                        node_id, candidate.long_name, candidate.short_name
                    );
                } else {
                    self.track_pending(node_id);
                    debug!("node {} created provisional, awaiting identity", node_id);
                }
                return Ok(UpsertOutcome::Created { resolved });
            }
            // Duplicate insert race: another path created the row between
            // the read and the write. Benign; continue as an update.
        }

        let mut outcome = UpsertOutcome::Unchanged;
        if !resolved {
            // Re-seen provisional node (e.g. after a restart emptied the
            // advisory pending set): make sure the sweep knows about it.
            if matches!(&existing, Some(row) if row.is_provisional()) {
                self.track_pending(node_id);
            }
        }
        if resolved {
            let promoted = self
                .store
                .execute(|conn| {
                    conn.promote_node_names(node_id, &candidate.long_name, &candidate.short_name)
                })
                .await?;
            if promoted {
                info!(
                    "node {} promoted: {} ({})",
                    node_id, candidate.long_name, candidate.short_name
                );
            }

            let update = NodeRefresh {
                hardware_model: Some(candidate.hardware_model.clone()),
                role: Some(candidate.role.clone()),
                position: if self.position_tracking {
                    candidate.position.clone()
                } else {
                    None
                },
                mqtt_status: candidate.via_mqtt.then(|| "gateway".to_string()),
            };
            let refreshed = self
                .store
                .execute(|conn| conn.refresh_node(node_id, &update))
                .await?;

            // Resolved by this path or a concurrent one; either way the
            // node no longer waits on the sweep.
            self.clear_pending(node_id);

            outcome = if promoted {
                UpsertOutcome::Promoted
            } else if refreshed {
                UpsertOutcome::Refreshed
            } else {
                UpsertOutcome::Unchanged
            };
            if outcome != UpsertOutcome::Unchanged {
                self.metrics.inc_nodes_updated();
            }
        }
        Ok(outcome)
    }

    /// Sweep a bounded slice of the pending set against the transport's
    /// roster cache, applying the same promotion rule as a direct upsert.
    /// Returns how many nodes resolved this cycle.
    pub async fn reconcile(
        &self,
        roster: &RosterSnapshot,
        max_entries: usize,
    ) -> Result<usize, StoreError> {
        let batch: Vec<u32> = {
            let pending = self.pending.lock().expect("pending mutex poisoned");
            pending.keys().copied().take(max_entries).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut resolved = 0usize;
        for node_id in batch {
            let Some(candidate) = roster_candidate(roster, node_id) else {
                continue;
            };
            match self.upsert(node_id, &candidate).await? {
                UpsertOutcome::Promoted | UpsertOutcome::Created { resolved: true } => {
                    resolved += 1;
                }
                // Already resolved by the direct path; upsert cleared the
                // pending entry.
                _ => {}
            }
        }
        if resolved > 0 {
            info!("reconcile sweep resolved {} pending node(s)", resolved);
        }
        Ok(resolved)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending mutex poisoned").len()
    }

    pub fn pending_contains(&self, node_id: u32) -> bool {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .contains_key(&node_id)
    }

    fn build_record(&self, node_id: u32, candidate: &NodeCandidate) -> NodeRecord {
        let mut record = NodeRecord::new(
            node_id,
            &candidate.long_name,
            &candidate.short_name,
            &candidate.hardware_model,
            &candidate.role,
        );
        if self.position_tracking {
            record.position = candidate.position.clone();
        }
        if candidate.via_mqtt {
            record.mqtt_status = "gateway".to_string();
        }
        record
    }

    fn track_pending(&self, node_id: u32) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        pending.entry(node_id).or_insert_with(Utc::now);
        self.metrics.set_pending(pending.len() as u64);
    }

    fn clear_pending(&self, node_id: u32) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        if pending.remove(&node_id).is_some() {
            debug!("node {} left the pending set", node_id);
        }
        self.metrics.set_pending(pending.len() as u64);
    }
}

/// Build a resolved candidate from a roster entry, or `None` when the entry
/// has no usable names.
fn roster_candidate(roster: &RosterSnapshot, node_id: u32) -> Option<NodeCandidate> {
    let entry = roster.lookup(node_id)?;
    let user = entry.user.as_ref()?;
    let long_name = user.long_name.as_deref()?.trim();
    let short_name = user.short_name.as_deref()?.trim();
    if long_name.is_empty() || short_name.is_empty() {
        return None;
    }
    if is_placeholder_name(long_name, short_name) {
        return None;
    }
    let position = entry.position.as_ref().and_then(|p| {
        let latitude = p.latitude?;
        let longitude = p.longitude?;
        Some(Position {
            longitude,
            latitude,
            altitude: p.altitude,
            precision: p.precision_bits,
        })
    });
    Some(NodeCandidate {
        long_name: long_name.to_string(),
        short_name: short_name.to_string(),
        hardware_model: user
            .hw_model
            .clone()
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        role: "CLIENT".to_string(),
        position,
        via_mqtt: false,
    })
}
