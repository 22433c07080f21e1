use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::record::ExtractedRecord;
use crate::store::LocalStore;

pub const STORAGE_RECORD: &str = "ed_extractedFormData";
pub const STORAGE_MESSAGE: &str = "ed_submitMessage";
pub const STORAGE_ERROR: &str = "ed_submitError";

/// What survives a reload. The selected file is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub record: Option<ExtractedRecord>,
    pub message: Option<String>,
    pub is_error: bool,
}

#[derive(Clone)]
pub struct PersistenceMirror {
    store: LocalStore,
}

impl PersistenceMirror {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn save(&self, state: &PersistedState) -> AppResult<()> {
        match &state.record {
            Some(record) => {
                let encoded = serde_json::to_string(record)?;
                self.store.set(STORAGE_RECORD, &encoded)?;
            }
            None => self.store.remove(STORAGE_RECORD)?,
        }
        match &state.message {
            Some(message) => self.store.set(STORAGE_MESSAGE, message)?,
            None => self.store.remove(STORAGE_MESSAGE)?,
        }
        self.store
            .set(STORAGE_ERROR, if state.is_error { "true" } else { "false" })?;
        Ok(())
    }

    pub fn clear(&self) -> AppResult<()> {
        self.store.remove(STORAGE_RECORD)?;
        self.store.remove(STORAGE_MESSAGE)?;
        self.store.remove(STORAGE_ERROR)?;
        Ok(())
    }

    /// Reads the snapshot once at cold start. Unreadable entries degrade to
    /// their empty defaults.
    pub fn load(&self) -> PersistedState {
        let record = match self.store.get(STORAGE_RECORD) {
            Ok(Some(raw)) => match serde_json::from_str::<ExtractedRecord>(&raw) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        target: "intake_store",
                        error = %err,
                        "discarding unreadable persisted record"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(target: "intake_store", ?err, "failed to read persisted record");
                None
            }
        };
        let message = self.store.get(STORAGE_MESSAGE).unwrap_or_else(|err| {
            warn!(target: "intake_store", ?err, "failed to read persisted message");
            None
        });
        let is_error = matches!(self.store.get(STORAGE_ERROR), Ok(Some(flag)) if flag == "true");

        debug!(
            target: "intake_store",
            has_record = record.is_some(),
            has_message = message.is_some(),
            is_error,
            "loaded persisted intake state"
        );
        PersistedState {
            record,
            message,
            is_error,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}
