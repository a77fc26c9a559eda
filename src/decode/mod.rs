//! # Identity payload decoding
//!
//! Identity announcements arrive in four shapes depending on the transport
//! path: a structured record with named fields, a key-value mapping with
//! alternate key spellings, the raw binary encoding of the Meshtastic `User`
//! schema, or an opaque value whose only accessible form is its text/debug
//! representation. The shape is decided once at the transport boundary (see
//! [`crate::transport`]) and carried as the [`IdentityPayload`] tagged union;
//! decoding is an ordered walk over [`STRATEGIES`], returning the first
//! successful extraction.
//!
//! Post-decode validation rejects results whose names still match the
//! synthesized placeholder pattern, so a decode error can never masquerade
//! as a name change.

pub mod hardware;

use log::trace;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::is_placeholder_name;
use hardware::{hardware_model_name, role_name};

/// An identity announcement payload, tagged by shape.
#[derive(Debug, Clone)]
pub enum IdentityPayload {
    /// Typed record with snake_case named fields.
    Structured(UserFields),
    /// Loose key-value mapping; key spellings vary (snake_case, camelCase).
    Mapping(serde_json::Map<String, Value>),
    /// Raw binary encoding of the Meshtastic `User` schema.
    RawBytes(Vec<u8>),
    /// Opaque value; only its text/debug rendering is accessible.
    Text(String),
}

/// The structured record shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserFields {
    pub long_name: String,
    pub short_name: String,
    #[serde(default)]
    pub hw_model: Option<u32>,
    #[serde(default)]
    pub role: Option<u32>,
}

/// Meshtastic `User` identity schema (field tags per the radio protocol).
#[derive(Clone, PartialEq, Message)]
pub struct UserProto {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bytes = "vec", tag = "4")]
    pub macaddr: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(int32, tag = "7")]
    pub role: i32,
}

/// Successful decode result, ready for the node directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedIdentity {
    pub long_name: String,
    pub short_name: String,
    pub hardware_model: String,
    pub role: String,
}

/// Hardware/role fields as a strategy saw them, before table mapping.
#[derive(Debug, Clone)]
enum FieldValue {
    Code(u32),
    Label(String),
}

#[derive(Debug, Clone)]
struct RawIdentity {
    long_name: String,
    short_name: String,
    hw: Option<FieldValue>,
    role: Option<FieldValue>,
}

/// One extraction strategy. Adding or removing a strategy is an edit to
/// [`STRATEGIES`] only; no other control flow changes.
struct Strategy {
    name: &'static str,
    extract: fn(&IdentityPayload) -> Option<RawIdentity>,
}

/// Fixed strategy order; the first success wins and later entries are not
/// attempted.
static STRATEGIES: &[Strategy] = &[
    Strategy {
        name: "structured",
        extract: extract_structured,
    },
    Strategy {
        name: "mapping",
        extract: extract_mapping,
    },
    Strategy {
        name: "raw-bytes",
        extract: extract_raw_bytes,
    },
    Strategy {
        name: "text",
        extract: extract_text,
    },
];

/// Decode an identity payload into names and hardware. Returns `None` when
/// no strategy extracts both names, or when the extracted names are still
/// placeholder-shaped.
pub fn decode(payload: &IdentityPayload) -> Option<DecodedIdentity> {
    for strategy in STRATEGIES {
        if let Some(raw) = (strategy.extract)(payload) {
            trace!("identity extracted via {} strategy", strategy.name);
            return finalize(raw);
        }
    }
    None
}

fn finalize(raw: RawIdentity) -> Option<DecodedIdentity> {
    let long_name = raw.long_name.trim().to_string();
    let short_name = raw.short_name.trim().to_string();
    if long_name.is_empty() || short_name.is_empty() {
        return None;
    }
    if is_placeholder_name(&long_name, &short_name) {
        // Placeholder-shaped output means the extraction found synthesized
        // names, not an announcement; treat as no-result.
        return None;
    }
    let hardware_model = match raw.hw {
        Some(FieldValue::Code(code)) => hardware_model_name(code),
        Some(FieldValue::Label(label)) if !label.trim().is_empty() => label.trim().to_string(),
        _ => "UNKNOWN".to_string(),
    };
    let role = match raw.role {
        Some(FieldValue::Code(code)) => role_name(code),
        Some(FieldValue::Label(label)) if !label.trim().is_empty() => label.trim().to_string(),
        _ => "CLIENT".to_string(),
    };
    Some(DecodedIdentity {
        long_name,
        short_name,
        hardware_model,
        role,
    })
}

fn extract_structured(payload: &IdentityPayload) -> Option<RawIdentity> {
    let IdentityPayload::Structured(fields) = payload else {
        return None;
    };
    if fields.long_name.trim().is_empty() || fields.short_name.trim().is_empty() {
        return None;
    }
    Some(RawIdentity {
        long_name: fields.long_name.clone(),
        short_name: fields.short_name.clone(),
        hw: fields.hw_model.map(FieldValue::Code),
        role: fields.role.map(FieldValue::Code),
    })
}

const LONG_KEYS: &[&str] = &["long_name", "longName"];
const SHORT_KEYS: &[&str] = &["short_name", "shortName"];
const HW_KEYS: &[&str] = &["hw_model", "hwModel", "hw"];
const ROLE_KEYS: &[&str] = &["role"];

fn extract_mapping(payload: &IdentityPayload) -> Option<RawIdentity> {
    let IdentityPayload::Mapping(map) = payload else {
        return None;
    };
    let lookup = |keys: &[&str]| -> Option<Value> {
        keys.iter().find_map(|k| map.get(*k)).cloned()
    };
    let long_name = lookup(LONG_KEYS).and_then(value_as_string)?;
    let short_name = lookup(SHORT_KEYS).and_then(value_as_string)?;
    if long_name.trim().is_empty() || short_name.trim().is_empty() {
        return None;
    }
    Some(RawIdentity {
        long_name,
        short_name,
        hw: lookup(HW_KEYS).and_then(value_as_field),
        role: lookup(ROLE_KEYS).and_then(value_as_field),
    })
}

fn value_as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn value_as_field(value: Value) -> Option<FieldValue> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| FieldValue::Code(v as u32)),
        Value::String(s) => match s.parse::<u32>() {
            Ok(code) => Some(FieldValue::Code(code)),
            Err(_) => Some(FieldValue::Label(s)),
        },
        _ => None,
    }
}

fn extract_raw_bytes(payload: &IdentityPayload) -> Option<RawIdentity> {
    let IdentityPayload::RawBytes(bytes) = payload else {
        return None;
    };
    let user = UserProto::decode(&bytes[..]).ok()?;
    if user.long_name.trim().is_empty() || user.short_name.trim().is_empty() {
        return None;
    }
    Some(RawIdentity {
        long_name: user.long_name,
        short_name: user.short_name,
        hw: u32::try_from(user.hw_model).ok().map(FieldValue::Code),
        role: u32::try_from(user.role).ok().map(FieldValue::Code),
    })
}

fn extract_text(payload: &IdentityPayload) -> Option<RawIdentity> {
    let IdentityPayload::Text(text) = payload else {
        return None;
    };
    let long_name = scan_field(text, LONG_KEYS)?;
    let short_name = scan_field(text, SHORT_KEYS)?;
    let hw = scan_field(text, HW_KEYS).map(|raw| match raw.parse::<u32>() {
        Ok(code) => FieldValue::Code(code),
        Err(_) => FieldValue::Label(raw),
    });
    let role = scan_field(text, ROLE_KEYS).map(|raw| match raw.parse::<u32>() {
        Ok(code) => FieldValue::Code(code),
        Err(_) => FieldValue::Label(raw),
    });
    Some(RawIdentity {
        long_name,
        short_name,
        hw,
        role,
    })
}

/// Pull `key: "value"` / `key=value` shapes out of a debug rendering.
/// Quoted values may contain separators; bare values end at the first
/// delimiter.
fn scan_field(text: &str, keys: &[&str]) -> Option<String> {
    for key in keys {
        let Some(idx) = text.find(key) else { continue };
        let rest = &text[idx + key.len()..];
        let rest = rest.trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            quoted.split('"').next().unwrap_or("")
        } else if let Some(quoted) = rest.strip_prefix('\'') {
            quoted.split('\'').next().unwrap_or("")
        } else {
            rest.split(|c: char| {
                c == ',' || c == '}' || c == ')' || c == '"' || c.is_whitespace()
            })
            .next()
            .unwrap_or("")
        };
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn expected() -> DecodedIdentity {
        DecodedIdentity {
            long_name: "Sydney-BNS1".to_string(),
            short_name: "BNS1".to_string(),
            hardware_model: "RAK4631".to_string(),
            role: "CLIENT".to_string(),
        }
    }

    fn structured() -> IdentityPayload {
        IdentityPayload::Structured(UserFields {
            long_name: "Sydney-BNS1".to_string(),
            short_name: "BNS1".to_string(),
            hw_model: Some(9),
            role: Some(0),
        })
    }

    fn mapping_camel() -> IdentityPayload {
        let map = serde_json::json!({
            "longName": "Sydney-BNS1",
            "shortName": "BNS1",
            "hwModel": 9
        });
        match map {
            serde_json::Value::Object(map) => IdentityPayload::Mapping(map),
            _ => unreachable!(),
        }
    }

    fn raw_bytes() -> IdentityPayload {
        let user = UserProto {
            id: "!00bc614e".to_string(),
            long_name: "Sydney-BNS1".to_string(),
            short_name: "BNS1".to_string(),
            macaddr: Vec::new(),
            hw_model: 9,
            is_licensed: false,
            role: 0,
        };
        let mut buf = Vec::new();
        user.encode(&mut buf).expect("encode");
        IdentityPayload::RawBytes(buf)
    }

    fn debug_text() -> IdentityPayload {
        IdentityPayload::Text(
            "User { id: \"!00bc614e\", long_name: \"Sydney-BNS1\", short_name: \"BNS1\", hw_model: 9 }"
                .to_string(),
        )
    }

    #[test]
    fn four_encodings_decode_identically() {
        for payload in [structured(), mapping_camel(), raw_bytes(), debug_text()] {
            let decoded = decode(&payload).expect("decodes");
            assert_eq!(decoded, expected(), "payload variant {:?}", payload);
        }
    }

    #[test]
    fn mapping_accepts_snake_case_keys() {
        let map = serde_json::json!({
            "long_name": "Sydney-BNS1",
            "short_name": "BNS1",
            "hw": "9"
        });
        let serde_json::Value::Object(map) = map else {
            unreachable!()
        };
        let decoded = decode(&IdentityPayload::Mapping(map)).expect("decodes");
        assert_eq!(decoded, expected());
    }

    #[test]
    fn unknown_hardware_code_gets_deterministic_label() {
        let payload = IdentityPayload::Structured(UserFields {
            long_name: "Ridge Relay".to_string(),
            short_name: "RR1".to_string(),
            hw_model: Some(9999),
            role: Some(2),
        });
        let decoded = decode(&payload).expect("decodes");
        assert_eq!(decoded.hardware_model, "UNKNOWN_HW_9999");
        assert_eq!(decoded.role, "ROUTER");
    }

    #[test]
    fn placeholder_shaped_names_are_rejected() {
        let payload = IdentityPayload::Structured(UserFields {
            long_name: "Node-12345678".to_string(),
            short_name: "N5678".to_string(),
            hw_model: Some(9),
            role: None,
        });
        assert!(decode(&payload).is_none());
    }

    #[test]
    fn legitimate_n_digit_short_name_is_rejected_by_heuristic() {
        // Preserved limitation: a real announcement with an N+digits short
        // name is indistinguishable from a synthesized placeholder.
        let payload = IdentityPayload::Structured(UserFields {
            long_name: "November Repeater".to_string(),
            short_name: "N1234".to_string(),
            hw_model: None,
            role: None,
        });
        assert!(decode(&payload).is_none());
    }

    #[test]
    fn missing_names_yield_no_result() {
        let map = serde_json::json!({ "longName": "Sydney-BNS1" });
        let serde_json::Value::Object(map) = map else {
            unreachable!()
        };
        assert!(decode(&IdentityPayload::Mapping(map)).is_none());
        assert!(decode(&IdentityPayload::RawBytes(vec![0xff, 0x01, 0x02])).is_none());
        assert!(decode(&IdentityPayload::Text("no names here".to_string())).is_none());
    }

    #[test]
    fn text_strategy_handles_bare_key_value_pairs() {
        let payload =
            IdentityPayload::Text("longName=Sydney-BNS1 shortName=BNS1 hwModel=9".to_string());
        let decoded = decode(&payload).expect("decodes");
        assert_eq!(decoded, expected());
    }
}
