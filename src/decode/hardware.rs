//! Static hardware-model and device-role enumeration tables.
//!
//! Pure data: numeric codes from identity announcements map to the labels
//! stored in `node_details`. Codes not in the table yield deterministic
//! `UNKNOWN_HW_<code>` / `UNKNOWN_ROLE_<code>` labels rather than failing.

/// Hardware model code to label.
pub fn hardware_model_name(code: u32) -> String {
    let known = match code {
        0 => "UNSET",
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        42 => "M5STACK",
        43 => "HELTEC_V3",
        55 => "ESP32_S3_PICO",
        68 => "HELTEC_VISION_MASTER_E290",
        69 => "HELTEC_MESH_NODE_T114",
        71 => "TRACKER_T1000_E",
        80 => "M5STACK_CORES3",
        81 => "SEEED_XIAO_S3",
        _ => return format!("UNKNOWN_HW_{}", code),
    };
    known.to_string()
}

/// Device role code to label. Unknown and absent values default the way
/// firmware does, to CLIENT.
pub fn role_name(code: u32) -> String {
    let known = match code {
        0 => "CLIENT",
        1 => "CLIENT_MUTE",
        2 => "ROUTER",
        3 => "ROUTER_CLIENT",
        4 => "REPEATER",
        5 => "TRACKER",
        6 => "SENSOR",
        7 => "TAK",
        8 => "CLIENT_HIDDEN",
        9 => "LOST_AND_FOUND",
        10 => "TAK_TRACKER",
        11 => "ROUTER_LATE",
        _ => return format!("UNKNOWN_ROLE_{}", code),
    };
    known.to_string()
}
