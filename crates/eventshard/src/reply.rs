use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::ClusterError;

/// Taxonomy kind of a failed command, carried across node boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The entity could not be recovered from the journal.
    Recovery,
    /// Appending the command's events failed.
    Persist,
    /// The journal reported a second writer.
    ConsistencyViolation,
    /// Shard ownership could not be resolved or the owner was unreachable.
    Routing,
    /// The command could not be decoded or its entity type is unknown.
    Rejected,
    /// The entity stopped (shutdown or handoff) before handling the command.
    Interrupted,
    /// The entity handled the command without replying to it.
    NoReply,
}

/// Result of one ask exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    pub outcome: ReplyOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyOutcome {
    /// MessagePack-encoded reply value.
    Success(Vec<u8>),
    Failure { kind: FailureKind, reason: String },
}

impl Reply {
    pub fn success(correlation_id: CorrelationId, payload: Vec<u8>) -> Self {
        Self {
            correlation_id,
            outcome: ReplyOutcome::Success(payload),
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: &ClusterError) -> Self {
        Self {
            correlation_id,
            outcome: ReplyOutcome::Failure {
                kind: error.failure_kind(),
                reason: error.to_string(),
            },
        }
    }
}
