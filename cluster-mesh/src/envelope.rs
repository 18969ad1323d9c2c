use serde::{Deserialize, Serialize};

use crate::config::{NodeId, BROADCAST};

/// Unit of transmission between nodes.
///
/// Applications fill in `target` and `payload`. The sending node's
/// dispatcher assigns `message_id`, so whatever the caller puts there is
/// overwritten. On the wire `target` is always a concrete node id: a
/// broadcast is expanded into one envelope per node before it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    pub target: NodeId,
    pub message_id: i64,
    pub payload: String,
}

impl Envelope {
    pub fn unicast(target: NodeId, payload: impl Into<String>) -> Self {
        Self {
            target,
            message_id: 0,
            payload: payload.into(),
        }
    }

    pub fn broadcast(payload: impl Into<String>) -> Self {
        Self::unicast(BROADCAST, payload)
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST
    }

    /// Copy of this envelope resolved to a concrete recipient and id.
    pub(crate) fn addressed(&self, target: NodeId, message_id: i64) -> Self {
        Self {
            target,
            message_id,
            payload: self.payload.clone(),
        }
    }
}
