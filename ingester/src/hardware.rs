//! Hardware model normalization.
//!
//! NODEINFO carries the board as a raw enum value; downstream wants a stable
//! friendly name. The table below covers the boards actually seen carrying
//! environmental sensors; anything else passes through as the raw enum name
//! (or `UNKNOWN_<n>` when the value is not in the enum at all). The table is
//! a living artefact: extend it as new boards appear in the field.

/// Raw enum-variant name for a Meshtastic `HardwareModel` value.
pub fn model_name(value: i32) -> Option<&'static str> {
    Some(match value {
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
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        25 => "STATION_G1",
        26 => "RAK11310",
        29 => "CANARYONE",
        31 => "RP2040_LORA",
        32 => "STATION_G2",
        39 => "DIY_V1",
        41 => "DR_DEV",
        42 => "M5STACK",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        47 => "RPI_PICO",
        48 => "HELTEC_WIRELESS_TRACKER",
        49 => "HELTEC_WIRELESS_PAPER",
        50 => "T_DECK",
        51 => "T_WATCH_S3",
        52 => "PICOMPUTER_S3",
        53 => "HELTEC_HT62",
        57 => "HELTEC_MESH_NODE_T114",
        58 => "SENSECAP_INDICATOR",
        59 => "TRACKER_T1000_E",
        60 => "RAK3172",
        64 => "SEEED_XIAO_S3",
        _ => return None,
    })
}

/// Friendly display name for a raw enum-variant name. Missing entries map to
/// the raw string unchanged.
pub fn display_name(raw: &str) -> String {
    const TABLE: &[(&str, &str)] = &[
        ("TBEAM", "LILYGO T-Beam"),
        ("TBEAM_V0P7", "LILYGO T-Beam v0.7"),
        ("LILYGO_TBEAM_S3_CORE", "LILYGO T-Beam S3 Core"),
        ("TLORA_V1", "LILYGO T-LoRa v1"),
        ("TLORA_V1_1P3", "LILYGO T-LoRa v1.3"),
        ("TLORA_V2", "LILYGO T-LoRa v2"),
        ("TLORA_V2_1_1P6", "LILYGO T-LoRa v2.1-1.6"),
        ("T_ECHO", "LILYGO T-Echo"),
        ("T_DECK", "LILYGO T-Deck"),
        ("T_WATCH_S3", "LILYGO T-Watch S3"),
        ("HELTEC_V1", "Heltec WiFi LoRa 32 v1"),
        ("HELTEC_V2_0", "Heltec WiFi LoRa 32 v2"),
        ("HELTEC_V2_1", "Heltec WiFi LoRa 32 v2.1"),
        ("HELTEC_V3", "Heltec WiFi LoRa 32 v3"),
        ("HELTEC_WSL_V3", "Heltec Wireless Stick Lite v3"),
        ("HELTEC_WIRELESS_TRACKER", "Heltec Wireless Tracker"),
        ("HELTEC_WIRELESS_PAPER", "Heltec Wireless Paper"),
        ("HELTEC_HT62", "Heltec HT62"),
        ("HELTEC_MESH_NODE_T114", "Heltec Mesh Node T114"),
        ("RAK4631", "RAK WisBlock 4631"),
        ("RAK11200", "RAK WisBlock 11200"),
        ("RAK11310", "RAK WisBlock 11310"),
        ("RAK3172", "RAK WisBlock 3172"),
        ("NANO_G1", "B&Q Nano G1"),
        ("STATION_G1", "B&Q Station G1"),
        ("STATION_G2", "B&Q Station G2"),
        ("CANARYONE", "CanaryOne"),
        ("RP2040_LORA", "RP2040 LoRa"),
        ("RPI_PICO", "Raspberry Pi Pico"),
        ("M5STACK", "M5Stack"),
        ("DIY_V1", "DIY v1"),
        ("DR_DEV", "DR Dev Board"),
        ("PICOMPUTER_S3", "Picomputer S3"),
        ("SENSECAP_INDICATOR", "SenseCAP Indicator"),
        ("TRACKER_T1000_E", "Seeed Tracker T1000-E"),
        ("SEEED_XIAO_S3", "Seeed XIAO S3"),
    ];
    TABLE
        .iter()
        .find(|(k, _)| *k == raw)
        .map(|(_, v)| (*v).to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// NODEINFO hw_model value -> display name, `UNKNOWN_<n>` for values outside
/// the known enum. Zero means the node did not report a board.
pub fn normalize(value: i32) -> Option<String> {
    if value == 0 {
        return None;
    }
    Some(match model_name(value) {
        Some(raw) => display_name(raw),
        None => format!("UNKNOWN_{value}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_gets_friendly_name() {
        assert_eq!(normalize(4).as_deref(), Some("LILYGO T-Beam"));
        assert_eq!(normalize(43).as_deref(), Some("Heltec WiFi LoRa 32 v3"));
    }

    #[test]
    fn unknown_enum_value_is_tagged() {
        assert_eq!(normalize(9999).as_deref(), Some("UNKNOWN_9999"));
    }

    #[test]
    fn unreported_model_is_none() {
        assert_eq!(normalize(0), None);
    }

    #[test]
    fn missing_display_entry_passes_raw_through() {
        assert_eq!(display_name("SOME_FUTURE_BOARD"), "SOME_FUTURE_BOARD");
    }
}
