//! Durable Log capability: per-entity append-only event streams plus snapshot storage.
//!
//! The storage engine itself lives outside this crate. Implementations must make
//! `append` atomic per stream and reject writers whose expected sequence number is
//! stale; the single-writer guarantee of the runtime rests on that check.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::types::PersistenceId;

/// One persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub persistence_id: PersistenceId,
    /// Starts at 1 and increases by exactly 1 per event.
    pub sequence_nr: u64,
    /// MessagePack-encoded event.
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// State of an entity as of `sequence_nr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub persistence_id: PersistenceId,
    pub sequence_nr: u64,
    /// MessagePack-encoded state.
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The stream is not at the sequence number the writer expected.
    #[error("sequence conflict: expected {expected}, journal is at {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("journal I/O failure: {reason}")]
    Io {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Lazily consumed sequence of events in ascending sequence order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<JournalEntry, JournalError>> + Send>>;

#[async_trait]
pub trait EventJournal: Send + Sync {
    /// Atomically append `events` to the stream.
    ///
    /// `expected_sequence_nr` is the highest sequence number the writer has
    /// applied. The events receive `expected + 1 ..= expected + n`. Returns the
    /// new highest sequence number, or `Conflict` if the stream has moved on.
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        expected_sequence_nr: u64,
        events: Vec<Vec<u8>>,
    ) -> Result<u64, JournalError>;

    /// Read events with `sequence_nr >= from_sequence_nr`.
    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<EventStream, JournalError>;

    /// Highest sequence number ever appended, including deleted events. 0 for a new stream.
    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId)
        -> Result<u64, JournalError>;

    /// Drop events up to and including `to_sequence_nr`. The highest sequence
    /// number is unaffected.
    async fn delete_up_to(
        &self,
        persistence_id: &PersistenceId,
        to_sequence_nr: u64,
    ) -> Result<(), JournalError>;

    /// Store a snapshot, replacing any older one for the stream.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), JournalError>;

    async fn load_snapshot(
        &self,
        persistence_id: &PersistenceId,
    ) -> Result<Option<Snapshot>, JournalError>;
}
