//! # Transport boundary
//!
//! Types delivered by the radio transport, consumed read-only by the core:
//! per-packet [`PacketEvent`]s and the [`RosterSnapshot`] node cache the
//! reconcile sweep consults. The driver itself is an external collaborator;
//! the reference transport here is a JSON-lines replay source, which is also
//! what the integration tests feed the dispatcher with.
//!
//! The payload shape decision happens once, here: a raw payload value is
//! classified into the [`IdentityPayload`] tagged union before the decode
//! chain ever sees it.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::decode::{IdentityPayload, UserFields};
use crate::model::BROADCAST_ADDR;

/// Reserved destination token meaning "all nodes".
pub const BROADCAST_TOKEN: &str = "^all";

/// One inbound packet event, as the transport serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketEvent {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub decoded: DecodedData,
    #[serde(default)]
    pub rx_time: u32,
    #[serde(default)]
    pub rx_snr: Option<f32>,
    #[serde(default)]
    pub rx_rssi: Option<i32>,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub via_mqtt: bool,
}

/// Decoded section of a packet event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedData {
    #[serde(default)]
    pub portnum: Option<PortnumTag>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub hop_limit: Option<u32>,
    #[serde(default)]
    pub hop_start: Option<u32>,
    #[serde(default)]
    pub want_ack: bool,
}

/// Application-layer tag: either a symbolic name or a raw port number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortnumTag {
    Code(u32),
    Name(String),
}

/// Parse a node reference: the broadcast token, a hex-prefixed identifier
/// (`!2f8a1c00`), a `0x` hex form, or a plain decimal. `None` when the
/// reference is unparseable.
pub fn parse_node_ref(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed == BROADCAST_TOKEN {
        return Some(BROADCAST_ADDR);
    }
    if let Some(hex) = trimmed.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = trimmed.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok();
    }
    trimmed.parse::<u32>().ok()
}

/// Classify a raw payload value into the tagged union the decode chain
/// consumes. Decided exactly once, here at the transport boundary.
pub fn identity_payload_from_value(value: &Value) -> IdentityPayload {
    match value {
        Value::Object(map) => {
            match serde_json::from_value::<UserFields>(Value::Object(map.clone())) {
                Ok(fields) => IdentityPayload::Structured(fields),
                Err(_) => IdentityPayload::Mapping(map.clone()),
            }
        }
        Value::Array(_) => match serde_json::from_value::<Vec<u8>>(value.clone()) {
            Ok(bytes) => IdentityPayload::RawBytes(bytes),
            Err(_) => IdentityPayload::Text(value.to_string()),
        },
        Value::String(text) => IdentityPayload::Text(text.clone()),
        other => IdentityPayload::Text(other.to_string()),
    }
}

/// Payload byte length independent of encoding: binary length for byte
/// arrays, UTF-8 byte length for text, serialized length otherwise.
pub fn payload_size_bytes(payload: Option<&Value>) -> u64 {
    match payload {
        None | Some(Value::Null) => 0,
        Some(Value::String(text)) => text.len() as u64,
        Some(array @ Value::Array(_)) => {
            match serde_json::from_value::<Vec<u8>>(array.clone()) {
                Ok(bytes) => bytes.len() as u64,
                Err(_) => array.to_string().len() as u64,
            }
        }
        Some(other) => other.to_string().len() as u64,
    }
}

/// Transport-maintained cache of recently seen nodes, keyed by hex-string
/// (`!xxxxxxxx`) or numeric identifier. Consulted only by the reconcile
/// sweep; read-only to this core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterSnapshot {
    #[serde(default)]
    pub nodes: HashMap<String, RosterEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(default)]
    pub user: Option<RosterUser>,
    #[serde(default)]
    pub position: Option<RosterPosition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterUser {
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub hw_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterPosition {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<i32>,
    #[serde(default)]
    pub precision_bits: Option<u32>,
}

impl RosterSnapshot {
    /// Look a node up under both key conventions the transport uses.
    pub fn lookup(&self, node_id: u32) -> Option<&RosterEntry> {
        self.nodes
            .get(&format!("!{:08x}", node_id))
            .or_else(|| self.nodes.get(&node_id.to_string()))
    }

    /// Load a roster snapshot from a JSON file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read roster file {}", path))?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("failed to parse roster file {}: {}", path, e))
    }
}

/// JSON-lines event source: one serialized [`PacketEvent`] per line.
pub struct JsonlReplay {
    lines: Lines<BufReader<File>>,
}

impl JsonlReplay {
    pub async fn open(path: &str) -> Result<Self> {
        let file = File::open(path)
            .await
            .with_context(|| format!("failed to open replay file {}", path))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
        })
    }

    /// Next event, skipping blank and malformed lines. `None` at end of
    /// stream.
    pub async fn next_event(&mut self) -> Result<Option<PacketEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<PacketEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    log::warn!("skipping malformed event line: {}", e);
                }
            }
        }
        Ok(None)
    }
}
