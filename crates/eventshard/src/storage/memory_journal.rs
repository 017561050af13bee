use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::journal::{EventJournal, EventStream, JournalEntry, JournalError, Snapshot};
use crate::types::PersistenceId;

/// In-memory journal for tests and single-process use.
///
/// Supports fault injection: failing the next N appends or reads, and delaying
/// appends to simulate a slow storage engine.
pub struct MemoryJournal {
    inner: Mutex<Inner>,
    fail_appends: AtomicUsize,
    fail_reads: AtomicUsize,
    append_delay: Mutex<Option<Duration>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<PersistenceId, EventLog>,
    snapshots: HashMap<PersistenceId, Snapshot>,
}

#[derive(Default)]
struct EventLog {
    events: BTreeMap<u64, JournalEntry>,
    highest: u64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fail_appends: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
            append_delay: Mutex::new(None),
        }
    }

    /// Make the next `count` appends fail with an I/O error.
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads (snapshot loads and event reads) fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    /// Delay every append by `delay` before it is applied.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        *self.append_delay.lock() = delay;
    }

    /// All retained events of a stream, in sequence order.
    pub fn events(&self, persistence_id: &PersistenceId) -> Vec<JournalEntry> {
        self.inner
            .lock()
            .streams
            .get(persistence_id)
            .map(|log| log.events.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write an event bypassing the sequence check, as a rogue second writer would.
    pub fn inject_event(&self, persistence_id: &PersistenceId, payload: Vec<u8>) -> u64 {
        let mut inner = self.inner.lock();
        let log = inner.streams.entry(persistence_id.clone()).or_default();
        log.highest += 1;
        let sequence_nr = log.highest;
        log.events.insert(
            sequence_nr,
            JournalEntry {
                persistence_id: persistence_id.clone(),
                sequence_nr,
                payload,
                timestamp: Utc::now(),
            },
        );
        sequence_nr
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(reason: &str) -> JournalError {
        JournalError::Io {
            reason: reason.to_string(),
            source: None,
        }
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        expected_sequence_nr: u64,
        events: Vec<Vec<u8>>,
    ) -> Result<u64, JournalError> {
        let delay = *self.append_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.fail_appends) {
            return Err(Self::injected("injected append failure"));
        }

        let mut inner = self.inner.lock();
        let log = inner.streams.entry(persistence_id.clone()).or_default();
        if log.highest != expected_sequence_nr {
            return Err(JournalError::Conflict {
                expected: expected_sequence_nr,
                actual: log.highest,
            });
        }
        let timestamp = Utc::now();
        for payload in events {
            log.highest += 1;
            log.events.insert(
                log.highest,
                JournalEntry {
                    persistence_id: persistence_id.clone(),
                    sequence_nr: log.highest,
                    payload,
                    timestamp,
                },
            );
        }
        Ok(log.highest)
    }

    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<EventStream, JournalError> {
        if Self::take_failure(&self.fail_reads) {
            return Err(Self::injected("injected read failure"));
        }
        let entries: Vec<JournalEntry> = self
            .inner
            .lock()
            .streams
            .get(persistence_id)
            .map(|log| {
                log.events
                    .range(from_sequence_nr..)
                    .map(|(_, entry)| entry.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(entries.into_iter().map(Ok))))
    }

    async fn highest_sequence_nr(
        &self,
        persistence_id: &PersistenceId,
    ) -> Result<u64, JournalError> {
        Ok(self
            .inner
            .lock()
            .streams
            .get(persistence_id)
            .map_or(0, |log| log.highest))
    }

    async fn delete_up_to(
        &self,
        persistence_id: &PersistenceId,
        to_sequence_nr: u64,
    ) -> Result<(), JournalError> {
        if let Some(log) = self.inner.lock().streams.get_mut(persistence_id) {
            log.events = log.events.split_off(&(to_sequence_nr + 1));
        }
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), JournalError> {
        let mut inner = self.inner.lock();
        let newer_exists = inner
            .snapshots
            .get(&snapshot.persistence_id)
            .is_some_and(|existing| existing.sequence_nr > snapshot.sequence_nr);
        if !newer_exists {
            inner
                .snapshots
                .insert(snapshot.persistence_id.clone(), snapshot);
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        persistence_id: &PersistenceId,
    ) -> Result<Option<Snapshot>, JournalError> {
        if Self::take_failure(&self.fail_reads) {
            return Err(Self::injected("injected read failure"));
        }
        Ok(self.inner.lock().snapshots.get(persistence_id).cloned())
    }
}
