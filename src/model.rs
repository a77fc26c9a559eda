//! Persisted record types shared by the store and the node directory.
//!
//! A node's *resolution status* is derived from its names rather than stored:
//! a record whose names still follow the synthesized placeholder pattern
//! (`Node-<id>` / `N<digits>`) is provisional; once real announced names are
//! written the record is resolved, and no later write may regress it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Destination identifier meaning "all nodes".
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// One row in the `node_details` tree, keyed by `node_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: u32,
    pub long_name: String,
    pub short_name: String,
    pub hardware_model: String,
    pub role: String,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default = "default_mqtt_status")]
    pub mqtt_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_mqtt_status() -> String {
    "none".to_string()
}

/// Last known position for a node, refreshed only when position tracking
/// is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub longitude: f64,
    pub latitude: f64,
    #[serde(default)]
    pub altitude: Option<i32>,
    #[serde(default)]
    pub precision: Option<u32>,
}

impl NodeRecord {
    /// Build a fresh record for `node_id` with both timestamps set to now.
    pub fn new(node_id: u32, long_name: &str, short_name: &str, hardware_model: &str, role: &str) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            long_name: long_name.to_string(),
            short_name: short_name.to_string(),
            hardware_model: hardware_model.to_string(),
            role: role.to_string(),
            position: None,
            mqtt_status: default_mqtt_status(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True while the stored names still follow the placeholder pattern.
    pub fn is_provisional(&self) -> bool {
        is_placeholder_name(&self.long_name, &self.short_name)
    }
}

/// One append-only row in the `mesh_packet_metrics` tree. Never updated
/// after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketMetricRow {
    pub time: DateTime<Utc>,
    pub source_id: u32,
    pub destination_id: Option<u32>,
    pub portnum: String,
    pub packet_id: u32,
    pub channel: u32,
    pub rx_time: u32,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub want_ack: bool,
    pub via_mqtt: bool,
    pub message_size_bytes: u64,
}

/// Synthesized long name assigned before a node's real identity is known.
pub fn placeholder_long_name(node_id: u32) -> String {
    format!("Node-{}", node_id)
}

/// Synthesized short name: `N` followed by the last four decimal digits of
/// the node id.
pub fn placeholder_short_name(node_id: u32) -> String {
    let digits = node_id.to_string();
    let tail = if digits.len() > 4 {
        &digits[digits.len() - 4..]
    } else {
        &digits[..]
    };
    format!("N{}", tail)
}

/// Placeholder-shape heuristic applied to a (long, short) name pair.
///
/// A name pair is placeholder-shaped when the long name carries the `Node-`
/// prefix or the short name is `N` followed only by digits. Note the short
/// check can falsely match a legitimate short name like `N1234`; that
/// behavior is intentional and covered by tests rather than corrected.
pub fn is_placeholder_name(long_name: &str, short_name: &str) -> bool {
    if long_name.trim().is_empty() || short_name.trim().is_empty() {
        return true;
    }
    if long_name.starts_with("Node-") {
        return true;
    }
    match short_name.strip_prefix('N') {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_names_follow_pattern() {
        assert_eq!(placeholder_long_name(12345678), "Node-12345678");
        assert_eq!(placeholder_short_name(12345678), "N5678");
        assert_eq!(placeholder_short_name(42), "N42");
    }

    #[test]
    fn placeholder_shape_detection() {
        assert!(is_placeholder_name("Node-12345678", "N5678"));
        assert!(is_placeholder_name("Sydney-BNS1", "N5678")); // short alone suffices
        assert!(!is_placeholder_name("Sydney-BNS1", "BNS1"));
        assert!(!is_placeholder_name("North Ridge", "NR1")); // digits must follow N exclusively
        assert!(is_placeholder_name("", "BNS1"));
        assert!(is_placeholder_name("Sydney-BNS1", "  "));
    }

    #[test]
    fn legitimate_n_digit_short_name_is_falsely_rejected() {
        // Known limitation preserved from the source heuristic: a real short
        // name of N + digits cannot be told apart from a synthesized one.
        assert!(is_placeholder_name("November Repeater", "N1234"));
    }

    #[test]
    fn provisional_status_derived_from_names() {
        let provisional = NodeRecord::new(7, &placeholder_long_name(7), &placeholder_short_name(7), "UNKNOWN", "CLIENT");
        assert!(provisional.is_provisional());
        let resolved = NodeRecord::new(7, "Hilltop Gate", "HTG", "RAK4631", "ROUTER");
        assert!(!resolved.is_provisional());
    }
}
