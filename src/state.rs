use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::files::SelectedFile;
use crate::persistence::{PersistedState, PersistenceMirror};
use crate::record::{Coordinates, ExtractedRecord, Section};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "camelCase")]
pub enum WorkflowStatus {
    Idle,
    FileSelected,
    Extracting,
    Reviewing,
    Submitting,
    Error(String),
}

impl WorkflowStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, WorkflowStatus::Extracting | WorkflowStatus::Submitting)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Idle => f.write_str("idle"),
            WorkflowStatus::FileSelected => f.write_str("fileSelected"),
            WorkflowStatus::Extracting => f.write_str("extracting"),
            WorkflowStatus::Reviewing => f.write_str("reviewing"),
            WorkflowStatus::Submitting => f.write_str("submitting"),
            WorkflowStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeEvent {
    StatusChanged(WorkflowStatus),
    FieldChanged {
        section: Section,
        key: &'static str,
        value: String,
    },
    PickupLocated(Coordinates),
    FilePickerRequested,
    ReceiptReady(String),
}

#[derive(Debug, Clone)]
pub struct IntakeSnapshot {
    pub status: WorkflowStatus,
    pub message: Option<String>,
    pub is_error: bool,
    pub file: Option<SelectedFile>,
    pub record: Option<ExtractedRecord>,
    pub receipt: Option<String>,
    pub pickup_fix: Option<Coordinates>,
    /// Bumped whenever the record is replaced or discarded; async work
    /// captures it and drops its result on mismatch.
    pub(crate) epoch: u64,
}

impl IntakeSnapshot {
    pub(crate) fn from_persisted(persisted: PersistedState) -> Self {
        let status = match (&persisted.record, persisted.is_error, &persisted.message) {
            (_, true, Some(message)) => WorkflowStatus::Error(message.clone()),
            (Some(_), _, _) => WorkflowStatus::Reviewing,
            _ => WorkflowStatus::Idle,
        };
        Self {
            status,
            is_error: persisted.is_error && persisted.message.is_some(),
            message: persisted.message,
            file: None,
            record: persisted.record,
            receipt: None,
            pickup_fix: None,
            epoch: 0,
        }
    }

    pub fn dropoff_coordinates(&self) -> Option<Coordinates> {
        self.record
            .as_ref()
            .and_then(|record| record.dropoff_location.coordinates())
    }

    pub(crate) fn persisted(&self) -> PersistedState {
        PersistedState {
            record: self.record.clone(),
            message: self.message.clone(),
            is_error: self.is_error,
        }
    }

    pub(crate) fn set_status(&mut self, status: WorkflowStatus, events: &mut Vec<IntakeEvent>) {
        if self.status != status {
            self.status = status.clone();
            events.push(IntakeEvent::StatusChanged(status));
        }
    }

    pub(crate) fn set_notice(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
        self.is_error = false;
    }

    pub(crate) fn set_error(&mut self, message: impl Into<String>, events: &mut Vec<IntakeEvent>) {
        let message = message.into();
        self.message = Some(message.clone());
        self.is_error = true;
        self.set_status(WorkflowStatus::Error(message), events);
    }

    pub(crate) fn clear_notice(&mut self) {
        self.message = None;
        self.is_error = false;
    }

    /// Writes one record leaf, recording a change event when the text differs.
    pub(crate) fn write_field(
        &mut self,
        section: Section,
        key: &'static str,
        value: &str,
        events: &mut Vec<IntakeEvent>,
    ) -> bool {
        let Some(record) = self.record.as_mut() else {
            return false;
        };
        match record.set_field(section, key, value) {
            Ok(true) => {
                events.push(IntakeEvent::FieldChanged {
                    section,
                    key,
                    value: value.to_string(),
                });
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(target: "intake_state", ?err, "rejected write to unknown field");
                false
            }
        }
    }

    pub(crate) fn replace_record(&mut self, record: Option<ExtractedRecord>) {
        self.record = record;
        self.pickup_fix = None;
        self.epoch += 1;
    }
}

/// The single owner of in-progress intake state. Every mutation goes through
/// [`SharedIntake::update`], which mirrors the persisted view when it changed
/// and publishes the collected events once the lock is released.
#[derive(Clone)]
pub(crate) struct SharedIntake {
    inner: Arc<Mutex<IntakeSnapshot>>,
    mirror: PersistenceMirror,
    events: broadcast::Sender<IntakeEvent>,
}

impl SharedIntake {
    pub(crate) fn new(snapshot: IntakeSnapshot, mirror: PersistenceMirror) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(snapshot)),
            mirror,
            events,
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&IntakeSnapshot) -> R) -> R {
        f(&self.inner.lock())
    }

    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&mut IntakeSnapshot, &mut Vec<IntakeEvent>) -> R,
    ) -> R {
        let mut events = Vec::new();
        let result = {
            let mut guard = self.inner.lock();
            let before = guard.persisted();
            let result = f(&mut guard, &mut events);
            let after = guard.persisted();
            if after != before {
                if let Err(err) = self.mirror.save(&after) {
                    warn!(target: "intake_store", ?err, "failed to mirror intake state");
                }
            }
            result
        };
        self.publish(events);
        result
    }

    /// Like [`SharedIntake::update`], but wipes the durable mirror afterwards
    /// instead of saving the new view.
    pub(crate) fn reset<R>(
        &self,
        f: impl FnOnce(&mut IntakeSnapshot, &mut Vec<IntakeEvent>) -> R,
    ) -> R {
        let mut events = Vec::new();
        let result = {
            let mut guard = self.inner.lock();
            let result = f(&mut guard, &mut events);
            self.clear_persisted();
            result
        };
        self.publish(events);
        result
    }

    pub(crate) fn clear_persisted(&self) {
        if let Err(err) = self.mirror.clear() {
            warn!(target: "intake_store", ?err, "failed to clear persisted intake state");
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<IntakeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<IntakeEvent>) {
        for event in events {
            // No subscribers is fine; nobody is rendering.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::STORAGE_RECORD;
    use crate::store::LocalStore;

    fn shared() -> (SharedIntake, LocalStore) {
        let store = LocalStore::in_memory();
        let mirror = PersistenceMirror::new(store.clone());
        let snapshot = IntakeSnapshot::from_persisted(PersistedState::default());
        (SharedIntake::new(snapshot, mirror), store)
    }

    #[test]
    fn rehydrated_status_follows_persisted_flags() {
        let reviewing = IntakeSnapshot::from_persisted(PersistedState {
            record: Some(ExtractedRecord::default()),
            message: Some("Document extracted successfully.".into()),
            is_error: false,
        });
        assert_eq!(reviewing.status, WorkflowStatus::Reviewing);
        assert!(reviewing.file.is_none());

        let failed = IntakeSnapshot::from_persisted(PersistedState {
            record: Some(ExtractedRecord::default()),
            message: Some("Webhook failed (500)".into()),
            is_error: true,
        });
        assert_eq!(
            failed.status,
            WorkflowStatus::Error("Webhook failed (500)".into())
        );

        let empty = IntakeSnapshot::from_persisted(PersistedState::default());
        assert_eq!(empty.status, WorkflowStatus::Idle);
    }

    #[test]
    fn update_mirrors_and_publishes() {
        let (shared, store) = shared();
        let mut rx = shared.subscribe();

        shared.update(|state, events| {
            state.replace_record(Some(ExtractedRecord::default()));
            state.set_status(WorkflowStatus::Reviewing, events);
        });
        assert!(store.contains(STORAGE_RECORD).unwrap());
        assert_eq!(
            rx.try_recv().unwrap(),
            IntakeEvent::StatusChanged(WorkflowStatus::Reviewing)
        );

        let changed = shared.update(|state, events| {
            state.write_field(Section::Vehicle, "vin", "1HGCM", events)
        });
        assert!(changed);
        assert!(matches!(
            rx.try_recv().unwrap(),
            IntakeEvent::FieldChanged { section: Section::Vehicle, key: "vin", .. }
        ));

        shared.reset(|state, _| state.replace_record(None));
        assert!(!store.contains(STORAGE_RECORD).unwrap());
    }

    #[test]
    fn writes_without_record_are_ignored() {
        let (shared, _) = shared();
        let changed = shared.update(|state, events| {
            state.write_field(Section::Vehicle, "vin", "X", events)
        });
        assert!(!changed);
    }
}
