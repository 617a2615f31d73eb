//! Constraint set and stop-reason mapping (§4.6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    #[serde(rename = "not_required")]
    NotRequired,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "unmetered")]
    Unmetered,
    #[serde(rename = "not_roaming")]
    NotRoaming,
    #[serde(rename = "metered")]
    Metered,
}

impl Default for NetworkType {
    fn default() -> Self {
        NetworkType::NotRequired
    }
}

/// Opaque, persisted-as-a-blob constraint set a session runs under (§4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub network_type: NetworkType,
    pub requires_charging: bool,
    pub requires_battery_not_low: bool,
    pub requires_storage_not_low: bool,
    pub auto_resume_when_satisfied: bool,
    pub auto_resume_delay_ms: u64,
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            network_type: NetworkType::NotRequired,
            requires_charging: false,
            requires_battery_not_low: false,
            requires_storage_not_low: false,
            auto_resume_when_satisfied: true,
            auto_resume_delay_ms: 0,
        }
    }
}

impl ConstraintSet {
    pub fn to_blob(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_blob(blob: &str) -> Self {
        serde_json::from_str(blob).unwrap_or_default()
    }
}

/// Maps a stop-reason code from the external Scheduler to a human-readable
/// message, per the named codes in §4.6 — numbered to match the host
/// scheduler's own `STOP_REASON_*` ordering (`STOP_REASON_CONSTRAINT_
/// CONNECTIVITY` = 7).
pub fn message_for_code(code: u32) -> &'static str {
    match code {
        1 => "Quota exceeded",
        2 => "Charging constraint violated",
        3 => "Battery low",
        4 => "Storage low",
        5 => "Device idle",
        6 => "App standby",
        7 => "Network constraint violated",
        8 => "Background execution restricted",
        9 => "Cancelled by app",
        10 => "Preempted by higher-priority work",
        11 => "Timed out",
        12 => "Device state changed",
        13 => "Stopped by user",
        14 => "System processing",
        15 => "Estimated launch time changed",
        16 => "Foreground service timeout",
        _ => "Unknown constraint violation",
    }
}
