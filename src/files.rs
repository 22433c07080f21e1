use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::Serialize;

const FILE_ID_LENGTH: usize = 9;
const SIZE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// The single document the user picked or dropped. Raw bytes live only in
/// memory and are never written to the durable store.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub id: String,
    pub name: String,
    pub size: String,
    pub content_type: String,
    bytes: Arc<[u8]>,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let content_type = content_type.into();
        Self {
            id: random_file_id(),
            name: name.into(),
            size: format_file_size(bytes.len() as u64),
            content_type: if content_type.trim().is_empty() {
                "unknown".to_string()
            } else {
                content_type
            },
            bytes: Arc::from(bytes),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn to_payload(&self) -> FilePayload {
        FilePayload {
            name: self.name.clone(),
            content_type: self.content_type.clone(),
            size: self.byte_len(),
            base64: STANDARD.encode(&self.bytes),
        }
    }
}

/// Wire form of a file: metadata plus base64 content.
#[derive(Debug, Clone, Serialize)]
pub struct FilePayload {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: u64,
    pub base64: String,
}

pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut exponent = 0;
    let mut divisor = 1_u64;
    while exponent < SIZE_UNITS.len() - 1 && bytes / divisor >= 1024 {
        divisor *= 1024;
        exponent += 1;
    }
    let scaled = bytes as f64 / divisor as f64;
    let rounded = (scaled * 100.0).round() / 100.0;
    format!("{} {}", rounded, SIZE_UNITS[exponent])
}

fn random_file_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LENGTH)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
