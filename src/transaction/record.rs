use super::context::TxnCtxConfig;
use super::step::Step;
use crate::types::{NodeId, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Pending => "Pending",
            TxnState::Running => "Running",
            TxnState::Succeeded => "Succeeded",
            TxnState::Failed => "Failed",
            TxnState::Unknown => "Unknown",
        }
    }

    /// `Unknown` is never written; it stands for an absent or unreadable record.
    pub fn is_valid(&self) -> bool {
        !matches!(self, TxnState::Unknown)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-(transaction, node) status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStatus {
    pub state: TxnState,
    pub txn_id: TxnId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl TxnStatus {
    pub fn new(state: TxnState, txn_id: TxnId) -> Self {
        Self {
            state,
            txn_id,
            reason: String::new(),
        }
    }

    pub fn failed(txn_id: TxnId, reason: impl Into<String>) -> Self {
        Self {
            state: TxnState::Failed,
            txn_id,
            reason: reason.into(),
        }
    }

    pub fn unknown(txn_id: TxnId) -> Self {
        Self::new(TxnState::Unknown, txn_id)
    }
}

/// What gets published under `pending-transaction/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub id: TxnId,
    pub req_id: String,
    pub initiator: NodeId,
    pub nodes: Vec<NodeId>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub locks: Vec<String>,
    #[serde(default)]
    pub dont_check_alive: bool,
    #[serde(default)]
    pub disable_rollback: bool,
    pub start_time: SystemTime,
    pub ctx: TxnCtxConfig,
}

impl TxnRecord {
    pub fn is_participant(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.start_time).unwrap_or_default()
    }

    pub fn is_expired(&self, max_age: Duration, now: SystemTime) -> bool {
        self.age(now) > max_age
    }
}
