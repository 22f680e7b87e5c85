//! The authoritative job store with per-id change notification.
//!
//! Each job lives in its own slot: a mutex-guarded record plus a broadcast
//! channel for post-image events. Updates serialize per id; reads never
//! block writers on other ids. Subscribers get the current snapshot and the
//! receiver atomically (both taken under the slot lock), so no transition
//! can fall between snapshot and stream. Every subscriber has an
//! independent bounded buffer; one that falls behind observes a lag error
//! and is expected to disconnect rather than back-pressure the writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use opthub_protocol::JobId;
use opthub_protocol::JobRecord;
use opthub_protocol::JobState;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Change events published per job id.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Post-image of a committed update.
    Updated(JobRecord),
    /// The record was garbage-collected; no further events follow.
    Evicted,
}

/// Misuse of the store is a programmer error, not a client error: ids are
/// allocated by the submission boundary and never guessed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("job {0} not found")]
    UnknownJob(JobId),
    #[error("illegal state transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}

struct JobSlot {
    record: Mutex<JobRecord>,
    events: broadcast::Sender<JobEvent>,
}

pub struct JobStore {
    subscriber_buffer: usize,
    slots: RwLock<HashMap<JobId, Arc<JobSlot>>>,
}

impl JobStore {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            subscriber_buffer: subscriber_buffer.max(2),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Atomic insert; fails if the id already exists.
    pub fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(&record.id) {
            return Err(StoreError::DuplicateJob(record.id));
        }
        let (events, _) = broadcast::channel(self.subscriber_buffer);
        slots.insert(
            record.id,
            Arc::new(JobSlot {
                record: Mutex::new(record),
                events,
            }),
        );
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        let slot = self.slot(id)?;
        let record = slot.record.lock().unwrap_or_else(|e| e.into_inner());
        Some(record.clone())
    }

    /// Atomic read-modify-write. The transition must not regress the state
    /// machine; terminal states never change. On success the post-image is
    /// published to every subscriber and returned.
    pub fn update(
        &self,
        id: JobId,
        transition: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord, StoreError> {
        let slot = self.slot(id).ok_or(StoreError::UnknownJob(id))?;
        let mut record = slot.record.lock().unwrap_or_else(|e| e.into_inner());
        let previous_state = record.state;

        let mut next = record.clone();
        transition(&mut next);

        if next.state != previous_state && !previous_state.can_transition_to(next.state) {
            return Err(StoreError::IllegalTransition {
                id,
                from: previous_state,
                to: next.state,
            });
        }

        *record = next.clone();
        // Published while the slot is locked, so subscribers observe updates
        // in commit order. No receivers is fine.
        let _ = slot.events.send(JobEvent::Updated(next.clone()));
        Ok(next)
    }

    /// Current snapshot plus a live event stream, taken atomically. Returns
    /// `None` for unknown (or already evicted) ids.
    pub fn subscribe(&self, id: JobId) -> Option<(JobRecord, broadcast::Receiver<JobEvent>)> {
        let slot = self.slot(id)?;
        let record = slot.record.lock().unwrap_or_else(|e| e.into_inner());
        let receiver = slot.events.subscribe();
        Some((record.clone(), receiver))
    }

    /// Remove records that have been terminal for at least `retention`,
    /// notifying any stragglers with a final gone event. Returns how many
    /// records were evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = match chrono::Duration::from_std(retention) {
            Ok(retention) => retention,
            Err(_) => return 0,
        };
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<JobId> = slots
            .iter()
            .filter(|(_, slot)| {
                let record = slot.record.lock().unwrap_or_else(|e| e.into_inner());
                record.state.is_terminal()
                    && record
                        .finished_at
                        .is_some_and(|finished| finished + retention <= now)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(slot) = slots.remove(id) {
                let _ = slot.events.send(JobEvent::Evicted);
                debug!("evicted job {id}");
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: JobId) -> Option<Arc<JobSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}
