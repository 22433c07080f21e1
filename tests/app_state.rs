use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tempfile::tempdir;

use document_intake::{
    AppConfig, AppState, ExtractedRecord, PersistedState, PersistenceMirror, WorkflowStatus,
    STORAGE_CREDENTIAL,
};

fn config_in(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        extraction_webhook_url: "http://127.0.0.1:9/webhook/upload".into(),
        submission_webhook_url: "http://127.0.0.1:9/webhook/Dox".into(),
        geocoder_base_url: "http://127.0.0.1:9".into(),
        geocoder_user_agent: "intake-tests".into(),
        pickup_debounce_ms: 500,
        dropoff_debounce_ms: 700,
        data_dir: dir.join("data"),
        store_file_name: "intake.db".into(),
    }
}

#[tokio::test]
async fn initialize_signs_in_and_out() {
    let dir = tempdir().unwrap();
    let state = AppState::initialize(config_in(dir.path())).unwrap();
    assert!(state.store_path().exists());
    assert!(!state.store_recovered());
    assert_eq!(state.workflow().status(), WorkflowStatus::Idle);
    assert_eq!(state.session().account_label(), "Account");

    let claims = URL_SAFE_NO_PAD.encode(r#"{"name":"Dana Roy","email":"dana@example.com"}"#);
    state
        .session()
        .sign_in(format!("header.{claims}.signature"))
        .unwrap();
    assert_eq!(state.session().account_label(), "Dana Roy");

    state.logout().unwrap();
    assert!(!state.session().is_signed_in());
    assert!(!state
        .session()
        .store()
        .contains(STORAGE_CREDENTIAL)
        .unwrap());
}

#[tokio::test]
async fn initialize_resumes_persisted_error() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    {
        let state = AppState::initialize(config.clone()).unwrap();
        PersistenceMirror::new(state.session().store().clone())
            .save(&PersistedState {
                record: Some(ExtractedRecord::default()),
                message: Some("Webhook failed (500)".into()),
                is_error: true,
            })
            .unwrap();
        state.logout().unwrap();
    }

    let state = AppState::initialize(config).unwrap();
    assert_eq!(
        state.workflow().status(),
        WorkflowStatus::Error("Webhook failed (500)".into())
    );
    assert!(state.workflow().record().is_some());
    assert!(state.workflow().file().is_none());
}
