use tokio::sync::oneshot;

use crate::envelope::Envelope;
use crate::error::ClusterError;
use crate::reply::Reply;

/// Sender half of a reply channel. Exactly one reply is ever sent per ask.
pub type ReplySender = oneshot::Sender<Reply>;

/// Receiver half of a reply channel.
pub type ReplyReceiver = oneshot::Receiver<Reply>;

/// A command travelling through a region and shard towards its entity.
#[derive(Debug)]
pub enum IncomingMessage {
    /// An ask: the reply goes back through `reply_tx`.
    Request {
        envelope: Envelope,
        reply_tx: ReplySender,
    },
    /// A tell: nobody waits for the outcome.
    Tell { envelope: Envelope },
}

impl IncomingMessage {
    /// Build a message from an envelope, returning the reply receiver for asks.
    pub fn from_envelope(envelope: Envelope) -> (Self, Option<ReplyReceiver>) {
        if envelope.expects_reply {
            let (reply_tx, reply_rx) = oneshot::channel();
            (IncomingMessage::Request { envelope, reply_tx }, Some(reply_rx))
        } else {
            (IncomingMessage::Tell { envelope }, None)
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            IncomingMessage::Request { envelope, .. } => envelope,
            IncomingMessage::Tell { envelope } => envelope,
        }
    }

    /// Complete the exchange with `reply`. Tells drop it.
    pub fn reply(self, reply: Reply) {
        if let IncomingMessage::Request { envelope, reply_tx } = self {
            if reply_tx.send(reply).is_err() {
                tracing::debug!(
                    entity_address = %envelope.address,
                    correlation_id = %envelope.correlation_id,
                    "reply discarded, caller no longer waiting"
                );
            }
        }
    }

    /// Fail the exchange with `error`. Tells only log it.
    pub fn fail(self, error: &ClusterError) {
        match self {
            IncomingMessage::Request { envelope, reply_tx } => {
                if reply_tx
                    .send(Reply::failure(envelope.correlation_id, error))
                    .is_err()
                {
                    tracing::debug!(
                        entity_address = %envelope.address,
                        correlation_id = %envelope.correlation_id,
                        "failure reply discarded, caller no longer waiting"
                    );
                }
            }
            IncomingMessage::Tell { envelope } => {
                tracing::warn!(
                    entity_address = %envelope.address,
                    correlation_id = %envelope.correlation_id,
                    error = %error,
                    "tell could not be processed"
                );
            }
        }
    }
}
