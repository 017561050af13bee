use crate::hash::djb2_hash64;
use crate::types::NodeAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const NODE_TAG_BITS: u32 = 20;
const SEQUENCE_BITS: u32 = 64 - NODE_TAG_BITS;
const NODE_TAG_MASK: u64 = (1 << NODE_TAG_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Identifies one ask exchange: the reply-address a command carries and the
/// id the reply is matched against.
///
/// Layout: 20-bit node tag (hash of the issuing node's address), 44-bit
/// sequence seeded from the wall clock at startup.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    pub fn node_tag(&self) -> u64 {
        self.0 >> SEQUENCE_BITS
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lock-free per-node correlation id source.
pub struct CorrelationIdGenerator {
    node_tag: u64,
    sequence: AtomicU64,
}

impl CorrelationIdGenerator {
    pub fn new(node: &NodeAddress) -> Self {
        let node_tag = djb2_hash64(node.to_string().as_bytes()) & NODE_TAG_MASK;
        // Microsecond seed keeps ids from a restarted node clear of the ones
        // its previous incarnation handed out.
        let seed = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self {
            node_tag,
            sequence: AtomicU64::new(seed & SEQUENCE_MASK),
        }
    }

    pub fn next(&self) -> CorrelationId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK;
        CorrelationId((self.node_tag << SEQUENCE_BITS) | sequence)
    }
}
