//! Session records as they live in the persisted store, plus the derived
//! display status and account tiers.

use serde::{Deserialize, Serialize};

/// Accelerator class a session was provisioned with. Immutable after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorVariant {
    Gpu,
    Tpu,
    Cpu,
}

/// Last observed protocol-level kernel state. Persisted and refreshed on
/// every interaction; never derived from live connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    #[default]
    Unknown,
    Starting,
    Idle,
    Busy,
    Dead,
    InitFailed,
    Disconnected,
}

/// Derived display status. Computed at read time, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Active,
    Stale,
    Unknown,
}

/// Account tier bounding concurrent session count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    ProPlus,
}

impl Tier {
    /// Maximum concurrent sessions the tier allows.
    pub fn max_sessions(self) -> usize {
        match self {
            Tier::Free => 1,
            Tier::Pro => 2,
            Tier::ProPlus => 3,
        }
    }
}

/// Remote runtime backing a session. Set at provisioning time, immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    /// Concrete accelerator class, e.g. a GPU model name.
    pub accelerator: String,
    /// WebSocket endpoint of the runtime's kernel.
    pub endpoint: String,
    /// Unix time at which the runtime's quota expires, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// A named remote runtime binding, as persisted in the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub label: String,
    pub variant: AcceleratorVariant,
    pub runtime: RuntimeInfo,
    #[serde(default)]
    pub kernel_state: KernelState,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: u64,
    pub last_used_at: u64,
}

impl Session {
    /// Truncated display form of the id, used in listings and ambiguity
    /// errors.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map_or(self.id.len(), |(i, _)| i);
        &self.id[..end]
    }
}

/// A session enriched with its computed status, as returned by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub status: SessionStatus,
}

/// Aggregate counts by computed status. Pure function over stored records
/// and the clock; producing it never touches the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_sessions: usize,
    pub connected: usize,
    pub active: usize,
    pub stale: usize,
    pub unknown: usize,
    pub max_sessions: usize,
}
