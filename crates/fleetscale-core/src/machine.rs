//! Domain types for the machines observed via the Fleet API.
//!
//! A `Machine` is a point-in-time snapshot: a stable id, a lifecycle
//! state, a region, a host health indicator, and an opaque configuration
//! object that doubles as the clone template when new machines are
//! created.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a machine (opaque, assigned by the Fleet API).
pub type MachineId = String;

// ── Machine ────────────────────────────────────────────────────────

/// Lifecycle state of a machine.
///
/// States outside the three the scaler acts on are carried verbatim so
/// a newer API never breaks deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MachineState {
    Created,
    Started,
    Stopped,
    Other(String),
}

impl From<String> for MachineState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => MachineState::Created,
            "started" => MachineState::Started,
            "stopped" => MachineState::Stopped,
            _ => MachineState::Other(s),
        }
    }
}

impl From<MachineState> for String {
    fn from(state: MachineState) -> Self {
        match state {
            MachineState::Created => "created".to_string(),
            MachineState::Started => "started".to_string(),
            MachineState::Stopped => "stopped".to_string(),
            MachineState::Other(s) => s,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Created => write!(f, "created"),
            MachineState::Started => write!(f, "started"),
            MachineState::Stopped => write!(f, "stopped"),
            MachineState::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Host health as reported by the Fleet API.
///
/// Only machines on an `ok` host participate in scaling decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HostStatus {
    Ok,
    Other(String),
}

impl HostStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HostStatus::Ok)
    }
}

impl Default for HostStatus {
    fn default() -> Self {
        HostStatus::Ok
    }
}

impl From<String> for HostStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ok" => HostStatus::Ok,
            _ => HostStatus::Other(s),
        }
    }
}

impl From<HostStatus> for String {
    fn from(status: HostStatus) -> Self {
        match status {
            HostStatus::Ok => "ok".to_string(),
            HostStatus::Other(s) => s,
        }
    }
}

/// Machine configuration, used only as a clone template.
///
/// The image reference and metadata map are the fields the scaler
/// touches; everything else round-trips untouched through the flattened
/// `extra` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Point-in-time snapshot of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub state: MachineState,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub host_status: HostStatus,
    #[serde(default)]
    pub config: MachineConfig,
}

impl Machine {
    /// Whether this machine counts toward scaling decisions.
    pub fn is_reachable(&self) -> bool {
        self.host_status.is_ok()
    }
}

// ── Lifecycle requests ─────────────────────────────────────────────

/// Request to create a new machine from a clone template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub config: MachineConfig,
    pub region: String,
    /// When true the machine is created in `stopped` state instead of
    /// being booted immediately.
    #[serde(default)]
    pub skip_launch: bool,
}

/// Request to remove a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub id: MachineId,
    /// Force removal even if the machine is running.
    #[serde(default)]
    pub kill: bool,
}

/// Request to stop a started machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub id: MachineId,
}

/// Response from a start call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartResponse {
    #[serde(default)]
    pub previous_state: String,
}
