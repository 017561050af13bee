use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::types::EntityAddress;

/// A serialized command addressed to one entity. This is what crosses the
/// transport between regions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub address: EntityAddress,
    /// MessagePack-encoded command.
    pub payload: Vec<u8>,
    /// `false` for `tell`: no reply channel travels with the command.
    pub expects_reply: bool,
}
