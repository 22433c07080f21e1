//! Session context injected into the workflow at construction.
//!
//! Created at app start, torn down by [`Session::logout`]. It owns the
//! sign-in token handed over by the identity provider and the durable store
//! everything else persists into.

use std::sync::Arc;

use base64::alphabet::URL_SAFE;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::store::LocalStore;

pub const STORAGE_CREDENTIAL: &str = "ed_googleCredential";
const GENERIC_LABEL: &str = "Account";

const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    /// Decodes the claims segment of a sign-in token. Anything malformed
    /// yields `None`; callers fall back to the generic label.
    pub fn from_token(token: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Claims {
            name: Option<String>,
            email: Option<String>,
        }

        let claims_segment = token.split('.').nth(1)?;
        let decoded = TOKEN_ENGINE.decode(claims_segment.trim()).ok()?;
        let claims: Claims = serde_json::from_slice(&decoded).ok()?;
        Some(Self {
            name: claims.name.unwrap_or_default(),
            email: claims.email.unwrap_or_default(),
        })
    }

    pub fn display_label(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if !self.email.is_empty() {
            &self.email
        } else {
            GENERIC_LABEL
        }
    }
}

#[derive(Clone)]
pub struct Session {
    store: LocalStore,
    token: Arc<Mutex<Option<SecretString>>>,
}

impl Session {
    pub fn open(store: LocalStore) -> Self {
        let token = match store.get(STORAGE_CREDENTIAL) {
            Ok(value) => value.map(SecretString::from),
            Err(err) => {
                warn!(target: "session", ?err, "failed to read stored credential");
                None
            }
        };
        Self {
            store,
            token: Arc::new(Mutex::new(token)),
        }
    }

    pub fn sign_in(&self, token: impl Into<String>) -> AppResult<()> {
        let token = token.into();
        self.store.set(STORAGE_CREDENTIAL, &token)?;
        *self.token.lock() = Some(SecretString::from(token));
        debug!(target: "session", "credential stored");
        Ok(())
    }

    pub fn logout(&self) -> AppResult<()> {
        *self.token.lock() = None;
        self.store.remove(STORAGE_CREDENTIAL)
    }

    pub fn is_signed_in(&self) -> bool {
        self.token.lock().is_some()
    }

    pub fn identity(&self) -> Identity {
        let guard = self.token.lock();
        guard
            .as_ref()
            .and_then(|token| Identity::from_token(token.expose_secret()))
            .unwrap_or_default()
    }

    pub fn account_label(&self) -> String {
        self.identity().display_label().to_string()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn token_with(claims: &str) -> String {
        format!("header.{}.signature", URL_SAFE_NO_PAD.encode(claims))
    }

    #[test]
    fn decodes_name_and_email() {
        let token = token_with(r#"{"name":"Dana Roy","email":"dana@example.com"}"#);
        let identity = Identity::from_token(&token).unwrap();
        assert_eq!(identity.name, "Dana Roy");
        assert_eq!(identity.display_label(), "Dana Roy");
    }

    #[test]
    fn label_falls_back_to_email_then_generic() {
        let token = token_with(r#"{"email":"ops@example.com"}"#);
        assert_eq!(
            Identity::from_token(&token).unwrap().display_label(),
            "ops@example.com"
        );
        assert_eq!(Identity::default().display_label(), "Account");
    }

    #[test]
    fn malformed_tokens_are_not_fatal() {
        assert!(Identity::from_token("no-dots-here").is_none());
        assert!(Identity::from_token("a.%%%.c").is_none());
        assert!(Identity::from_token(&token_with("not json")).is_none());

        let session = Session::open(LocalStore::in_memory());
        session.sign_in("garbage").unwrap();
        assert_eq!(session.identity(), Identity::default());
        assert_eq!(session.account_label(), "Account");
    }

    #[test]
    fn padded_claims_decode() {
        let claims = URL_SAFE_NO_PAD.encode(r#"{"name":"Al"}"#);
        let padded = format!("h.{claims}==.s");
        assert_eq!(Identity::from_token(&padded).unwrap().name, "Al");
    }

    #[test]
    fn logout_removes_stored_credential() {
        let store = LocalStore::in_memory();
        let session = Session::open(store.clone());
        session
            .sign_in(token_with(r#"{"name":"Dana"}"#))
            .unwrap();

        let reopened = Session::open(store.clone());
        assert_eq!(reopened.account_label(), "Dana");

        reopened.logout().unwrap();
        assert!(!reopened.is_signed_in());
        assert!(!store.contains(STORAGE_CREDENTIAL).unwrap());
    }
}
