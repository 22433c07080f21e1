mod config;
mod errors;
mod files;
mod geocoding;
mod persistence;
mod record;
mod session;
mod state;
mod store;
mod sync;
mod webhook;
mod workflow;

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::files::{format_file_size, FilePayload, SelectedFile};
pub use crate::geocoding::{GeocodeQuery, Geocoder, GeocodingService, HttpGeocoder};
pub use crate::persistence::{
    PersistedState, PersistenceMirror, STORAGE_ERROR, STORAGE_MESSAGE, STORAGE_RECORD,
};
pub use crate::record::{
    Authorization, BuyingDealership, Coordinates, DropoffLocation, ExtractedRecord,
    PickupLocation, Section, SellingDealership, Transaction, Vehicle,
};
pub use crate::session::{Identity, Session, STORAGE_CREDENTIAL};
pub use crate::state::{IntakeEvent, IntakeSnapshot, WorkflowStatus};
pub use crate::store::{bootstrap, LocalStore, StoreBootstrap};
pub use crate::sync::{Debouncer, MapFocus, SuppressionFlag, SyncSettings, SyncTarget, DEFAULT_CENTER};
pub use crate::webhook::{Submission, SubmissionReceipt, WebhookClient};
pub use crate::workflow::{
    IntakeWorkflow, EMPTY_EXTRACTION_MESSAGE, EXTRACTED_MESSAGE, NO_FILE_MESSAGE,
    SUBMITTED_MESSAGE,
};

/// Everything a front end needs, wired from configuration.
pub struct AppState {
    config: AppConfig,
    store_path: PathBuf,
    store_recovered: bool,
    session: Session,
    workflow: IntakeWorkflow,
}

impl AppState {
    /// Opens the durable store and restores the previous intake. Must be
    /// called inside a tokio runtime.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let StoreBootstrap {
            store,
            path,
            recovered,
        } = bootstrap(&config.data_dir, &config.store_file_name)?;
        if recovered {
            warn!(target: "intake_store", path = %path.display(), "previous local store was discarded");
        }

        let session = Session::open(store);
        let webhooks = WebhookClient::new(&config)?;
        let geocoder = GeocodingService::new(&config)?;
        let workflow = IntakeWorkflow::restore(
            session.clone(),
            webhooks,
            geocoder,
            SyncSettings::from_config(&config),
        );

        info!(
            target: "document_intake",
            version = env!("CARGO_PKG_VERSION"),
            signed_in = session.is_signed_in(),
            status = %workflow.status(),
            "intake ready"
        );
        Ok(Self {
            config,
            store_path: path,
            store_recovered: recovered,
            session,
            workflow,
        })
    }

    pub fn workflow(&self) -> &IntakeWorkflow {
        &self.workflow
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn store_recovered(&self) -> bool {
        self.store_recovered
    }

    /// Ends the session: pending geocoding is cancelled and the identity
    /// token removed. In-progress work stays persisted for the next sign-in.
    pub fn logout(&self) -> AppResult<()> {
        self.workflow.shutdown();
        self.session.logout()?;
        info!(target: "document_intake", "signed out");
        Ok(())
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,document_intake=debug"));
        // A host that already installed a subscriber keeps it.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
