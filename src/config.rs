use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use tracing::debug;

const DEFAULT_EXTRACTION_WEBHOOK_URL: &str = "http://127.0.0.1:5678/webhook/upload";
const DEFAULT_SUBMISSION_WEBHOOK_URL: &str = "http://127.0.0.1:5678/webhook/Dox";
const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_PICKUP_DEBOUNCE_MS: u64 = 500;
const DEFAULT_DROPOFF_DEBOUNCE_MS: u64 = 700;
const DATA_DIR_NAME: &str = "document-intake";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub extraction_webhook_url: String,
    pub submission_webhook_url: String,
    pub geocoder_base_url: String,
    pub geocoder_user_agent: String,
    pub pickup_debounce_ms: u64,
    pub dropoff_debounce_ms: u64,
    pub data_dir: PathBuf,
    pub store_file_name: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            extraction_webhook_url: parse_string(
                "EXTRACTION_WEBHOOK_URL",
                DEFAULT_EXTRACTION_WEBHOOK_URL,
            ),
            submission_webhook_url: parse_string(
                "SUBMISSION_WEBHOOK_URL",
                DEFAULT_SUBMISSION_WEBHOOK_URL,
            ),
            geocoder_base_url: parse_string("GEOCODER_BASE_URL", DEFAULT_GEOCODER_BASE_URL),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| format!("document-intake/{}", env!("CARGO_PKG_VERSION"))),
            pickup_debounce_ms: parse_u64("PICKUP_GEOCODE_DEBOUNCE_MS", DEFAULT_PICKUP_DEBOUNCE_MS),
            dropoff_debounce_ms: parse_u64(
                "DROPOFF_GEOCODE_DEBOUNCE_MS",
                DEFAULT_DROPOFF_DEBOUNCE_MS,
            ),
            data_dir: env::var("INTAKE_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            store_file_name: parse_string("INTAKE_STORE_FILE", "document-intake.db"),
        }
    }

    pub fn pickup_debounce(&self) -> Duration {
        Duration::from_millis(self.pickup_debounce_ms)
    }

    pub fn dropoff_debounce(&self) -> Duration {
        Duration::from_millis(self.dropoff_debounce_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
