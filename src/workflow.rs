//! The intake state machine: file selection, extraction, review and
//! submission, plus the public operations a front end drives it with.
//!
//! All operations that may start background geocoding must run inside a
//! tokio runtime.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::files::SelectedFile;
use crate::geocoding::GeocodingService;
use crate::persistence::PersistenceMirror;
use crate::record::{Coordinates, ExtractedRecord, Section};
use crate::session::Session;
use crate::state::{IntakeEvent, IntakeSnapshot, SharedIntake, WorkflowStatus};
use crate::sync::{AddressSynchronizer, MapFocus, SyncSettings, SyncTarget};
use crate::webhook::{Submission, WebhookClient};

pub const NO_FILE_MESSAGE: &str = "Please select a file to submit.";
pub const EXTRACTED_MESSAGE: &str =
    "Document extracted successfully. Please review the details then click Submit Document.";
pub const EMPTY_EXTRACTION_MESSAGE: &str = "Extraction returned no data for this document.";
pub const SUBMITTED_MESSAGE: &str = "Document submitted successfully.";

enum SubmitStart {
    Busy(WorkflowStatus),
    Extract,
    Deliver {
        file: Option<SelectedFile>,
        record: ExtractedRecord,
        epoch: u64,
    },
}

#[derive(Clone)]
pub struct IntakeWorkflow {
    session: Session,
    shared: SharedIntake,
    webhooks: WebhookClient,
    sync: AddressSynchronizer,
}

impl IntakeWorkflow {
    /// Builds the workflow over the session's store, rehydrating whatever
    /// the previous run left behind. A restored record has no file.
    pub fn restore(
        session: Session,
        webhooks: WebhookClient,
        geocoder: GeocodingService,
        settings: SyncSettings,
    ) -> Self {
        let mirror = PersistenceMirror::new(session.store().clone());
        let snapshot = IntakeSnapshot::from_persisted(mirror.load());
        let restored = snapshot.record.is_some();
        let shared = SharedIntake::new(snapshot, mirror);
        let sync = AddressSynchronizer::new(shared.clone(), geocoder, settings);

        if restored {
            info!(target: "workflow", "restored record from previous session");
            sync.record_installed();
        }

        Self {
            session,
            shared,
            webhooks,
            sync,
        }
    }

    /// Replaces the held file. Any previous record, notice and persisted
    /// state are discarded.
    pub fn select_file(&self, file: SelectedFile) {
        debug!(
            target: "workflow",
            id = %file.id,
            name = %file.name,
            size = %file.size,
            "file selected"
        );
        self.sync.reset();
        self.shared.reset(|state, events| {
            state.replace_record(None);
            state.clear_notice();
            state.receipt = None;
            state.file = Some(file);
            state.set_status(WorkflowStatus::FileSelected, events);
        });
    }

    pub async fn extract(&self) -> WorkflowStatus {
        let start = self.shared.update(|state, events| {
            if state.status.is_busy() {
                return Err(state.status.clone());
            }
            let Some(file) = state.file.clone() else {
                state.set_error(NO_FILE_MESSAGE, events);
                events.push(IntakeEvent::FilePickerRequested);
                return Err(state.status.clone());
            };
            state.clear_notice();
            state.receipt = None;
            state.set_status(WorkflowStatus::Extracting, events);
            Ok((file, state.epoch))
        });
        let (file, epoch) = match start {
            Ok(start) => start,
            Err(status) => return status,
        };

        let result = self.webhooks.extract(&[file.to_payload()]).await;

        let (status, installed) = self.shared.update(|state, events| {
            if state.epoch != epoch {
                debug!(target: "workflow", "discarding extraction for a superseded selection");
                return (state.status.clone(), false);
            }
            let installed = match result {
                Ok(Some(record)) => {
                    state.replace_record(Some(record));
                    state.set_notice(EXTRACTED_MESSAGE);
                    state.set_status(WorkflowStatus::Reviewing, events);
                    true
                }
                Ok(None) => {
                    warn!(target: "workflow", "extraction response carried no output");
                    state.set_error(EMPTY_EXTRACTION_MESSAGE, events);
                    false
                }
                Err(err) => {
                    log_failure("extraction", &err);
                    state.set_error(err.to_string(), events);
                    false
                }
            };
            (state.status.clone(), installed)
        });

        if installed {
            info!(target: "workflow", file = %file.name, "document extracted");
            self.sync.record_installed();
        }
        status
    }

    /// Replaces one record field. Returns whether the stored text changed;
    /// with no record held nothing is written.
    pub fn edit_field(&self, section: Section, key: &str, value: &str) -> AppResult<bool> {
        let key = section
            .keys()
            .iter()
            .copied()
            .find(|candidate| *candidate == key)
            .ok_or_else(|| AppError::UnknownField {
                section: section.as_str().to_string(),
                key: key.to_string(),
            })?;

        let changed = self
            .shared
            .update(|state, events| state.write_field(section, key, value, events));
        if changed && key == "address" {
            self.sync.address_changed(section);
        }
        Ok(changed)
    }

    /// Sends the confirmed record. Without a record this runs extraction
    /// instead, so one action drives both phases.
    pub async fn submit(&self) -> WorkflowStatus {
        let start = self.shared.update(|state, events| {
            if state.status.is_busy() {
                return SubmitStart::Busy(state.status.clone());
            }
            let Some(record) = state.record.clone() else {
                return SubmitStart::Extract;
            };
            state.clear_notice();
            state.receipt = None;
            state.set_status(WorkflowStatus::Submitting, events);
            SubmitStart::Deliver {
                file: state.file.clone(),
                record,
                epoch: state.epoch,
            }
        });
        let (file, record, epoch) = match start {
            SubmitStart::Busy(status) => return status,
            SubmitStart::Extract => return self.extract().await,
            SubmitStart::Deliver {
                file,
                record,
                epoch,
            } => (file, record, epoch),
        };

        let files = file.iter().map(SelectedFile::to_payload).collect();
        let submission = Submission::new(self.session.identity(), files, record);
        let result = self.webhooks.submit(&submission).await;

        match result {
            Ok(receipt) => {
                let (status, cleared) = self.shared.update(|state, events| {
                    if state.epoch != epoch {
                        debug!(target: "workflow", "submission finished after the record was replaced");
                        return (state.status.clone(), false);
                    }
                    state.replace_record(None);
                    state.file = None;
                    state.set_notice(SUBMITTED_MESSAGE);
                    if let Some(text) = receipt.text {
                        state.receipt = Some(text.clone());
                        events.push(IntakeEvent::ReceiptReady(text));
                    }
                    state.set_status(WorkflowStatus::Idle, events);
                    (state.status.clone(), true)
                });
                if cleared {
                    self.shared.clear_persisted();
                    self.sync.reset();
                    info!(target: "workflow", user = %submission.user_name, "document submitted");
                }
                status
            }
            Err(err) => {
                log_failure("submission", &err);
                self.shared.update(|state, events| {
                    if state.epoch == epoch {
                        state.set_error(err.to_string(), events);
                    }
                    state.status.clone()
                })
            }
        }
    }

    /// Discards the file, record, notice, receipt and persisted state.
    pub fn clear_all(&self) {
        self.sync.reset();
        self.shared.reset(|state, events| {
            state.replace_record(None);
            state.file = None;
            state.clear_notice();
            state.receipt = None;
            state.set_status(WorkflowStatus::Idle, events);
        });
        debug!(target: "workflow", "intake cleared");
    }

    pub fn map_click(&self, lat: f64, lng: f64) -> bool {
        self.sync.map_click(Coordinates::new(lat, lng))
    }

    /// Drops the held file but keeps any record for review.
    pub fn remove_file(&self) {
        self.shared.update(|state, events| {
            if state.status.is_busy() || state.file.take().is_none() {
                return;
            }
            let next = if state.record.is_some() {
                WorkflowStatus::Reviewing
            } else {
                WorkflowStatus::Idle
            };
            if !matches!(state.status, WorkflowStatus::Error(_)) {
                state.set_status(next, events);
            }
        });
    }

    pub fn dismiss_receipt(&self) {
        self.shared.update(|state, _| state.receipt = None);
    }

    pub fn status(&self) -> WorkflowStatus {
        self.shared.read(|state| state.status.clone())
    }

    pub fn record(&self) -> Option<ExtractedRecord> {
        self.shared.read(|state| state.record.clone())
    }

    pub fn file(&self) -> Option<SelectedFile> {
        self.shared.read(|state| state.file.clone())
    }

    pub fn message(&self) -> Option<String> {
        self.shared.read(|state| state.message.clone())
    }

    pub fn is_error(&self) -> bool {
        self.shared.read(|state| state.is_error)
    }

    pub fn receipt(&self) -> Option<String> {
        self.shared.read(|state| state.receipt.clone())
    }

    pub fn pickup_coordinates(&self) -> Option<Coordinates> {
        self.shared.read(|state| state.pickup_fix)
    }

    pub fn dropoff_coordinates(&self) -> Option<Coordinates> {
        self.shared.read(IntakeSnapshot::dropoff_coordinates)
    }

    pub fn map_focus(&self) -> MapFocus {
        self.shared
            .read(|state| MapFocus::resolve(state.dropoff_coordinates(), state.pickup_fix))
    }

    pub fn snapshot(&self) -> IntakeSnapshot {
        self.shared.read(IntakeSnapshot::clone)
    }

    pub fn is_sync_pending(&self, target: SyncTarget) -> bool {
        self.sync.is_pending(target)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntakeEvent> {
        self.shared.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Cancels background geocoding. State and the persisted mirror stay.
    pub fn shutdown(&self) {
        self.sync.reset();
    }
}

fn log_failure(phase: &'static str, err: &AppError) {
    if err.is_network() {
        warn!(target: "workflow", phase, error = %err, "webhook call failed");
    } else {
        warn!(target: "workflow", phase, ?err, "webhook call failed unexpectedly");
    }
}
