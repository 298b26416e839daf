//! Store layout of the pending-transaction namespace.
//!
//! ```text
//! pending-transaction/<txn>                  serialized TxnRecord
//! pending-transaction/<txn>/<node>/status    TxnStatus
//! pending-transaction/<txn>/<node>/laststep  decimal step index
//! pending-transaction/<txn>/ctx/<key>        TxnCtx entries
//! ```

use crate::types::{NodeId, TxnId};

pub const PENDING_TXN_PREFIX: &str = "pending-transaction/";
pub const STATUS_SUFFIX: &str = "status";
pub const LAST_STEP_SUFFIX: &str = "laststep";
pub const CTX_SEGMENT: &str = "ctx";

pub fn txn_key(id: &TxnId) -> String {
    format!("{}{}", PENDING_TXN_PREFIX, id)
}

/// Prefix covering every key that belongs to `id`, excluding the record.
pub fn txn_namespace(id: &TxnId) -> String {
    format!("{}{}/", PENDING_TXN_PREFIX, id)
}

pub fn status_key(id: &TxnId, node: &NodeId) -> String {
    format!("{}{}/{}/{}", PENDING_TXN_PREFIX, id, node, STATUS_SUFFIX)
}

pub fn last_step_key(id: &TxnId, node: &NodeId) -> String {
    format!("{}{}/{}/{}", PENDING_TXN_PREFIX, id, node, LAST_STEP_SUFFIX)
}

pub fn ctx_prefix(id: &TxnId) -> String {
    format!("{}{}/{}/", PENDING_TXN_PREFIX, id, CTX_SEGMENT)
}

/// Is `key` a transaction record (as opposed to one of its sub-keys)?
pub fn parse_txn_key(key: &str) -> Option<TxnId> {
    let rest = key.strip_prefix(PENDING_TXN_PREFIX)?;
    if rest.contains('/') {
        return None;
    }
    TxnId::parse(rest).ok()
}

/// Split a status key into its transaction and node.
pub fn parse_status_key(key: &str) -> Option<(TxnId, NodeId)> {
    let rest = key.strip_prefix(PENDING_TXN_PREFIX)?;
    let mut parts = rest.split('/');
    let txn = TxnId::parse(parts.next()?).ok()?;
    let node = NodeId::parse(parts.next()?).ok()?;
    match (parts.next(), parts.next()) {
        (Some(STATUS_SUFFIX), None) => Some((txn, node)),
        _ => None,
    }
}
