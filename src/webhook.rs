//! HTTP adapters for the extraction and confirmation webhooks.
//!
//! Both endpoints may answer with a bare object or with a list wrapping it;
//! [`Envelope`] resolves that here so callers only ever see typed values.

use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::files::FilePayload;
use crate::record::ExtractedRecord;
use crate::session::Identity;

/// Response body shapes accepted from a webhook, tried in declaration order:
/// a list (first element wins), then a single object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Envelope<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Envelope::Many(items) => items.into_iter().next(),
            Envelope::One(item) => Some(item),
        }
    }
}

fn decode_envelope<T: DeserializeOwned>(body: &str) -> Option<T> {
    serde_json::from_str::<Envelope<T>>(body)
        .ok()
        .and_then(Envelope::into_first)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtractionBody {
    output: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfirmationBody {
    text: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ExtractionRequest<'a> {
    files: &'a [FilePayload],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub submitted_at: DateTime<Utc>,
    pub user: Identity,
    pub user_name: String,
    pub files: Vec<FilePayload>,
    pub form_data: ExtractedRecord,
}

impl Submission {
    pub fn new(identity: Identity, files: Vec<FilePayload>, form_data: ExtractedRecord) -> Self {
        let user_name = identity.display_label().to_string();
        Self {
            submitted_at: Utc::now(),
            user: identity,
            user_name,
            files,
            form_data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub text: Option<String>,
}

#[derive(Clone)]
pub struct WebhookClient {
    http: Client,
    extraction_url: String,
    submission_url: String,
}

impl WebhookClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_endpoints(&config.extraction_webhook_url, &config.submission_webhook_url)
    }

    pub fn with_endpoints(extraction_url: &str, submission_url: &str) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("document-intake/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            extraction_url: extraction_url.to_string(),
            submission_url: submission_url.to_string(),
        })
    }

    /// Sends the document for extraction. `Ok(None)` means the service
    /// answered successfully but without a usable `output` object.
    pub async fn extract(&self, files: &[FilePayload]) -> AppResult<Option<ExtractedRecord>> {
        info!(
            target: "webhook",
            url = %self.extraction_url,
            files = files.len(),
            "sending document for extraction"
        );
        let response = self
            .http
            .post(&self.extraction_url)
            .json(&ExtractionRequest { files })
            .send()
            .await?;
        let response = ensure_success(response, "Upload failed").await?;

        let body = response.text().await.unwrap_or_default();
        let record = decode_envelope::<ExtractionBody>(&body)
            .and_then(|payload| ExtractedRecord::from_output(payload.output.as_ref()));
        debug!(target: "webhook", has_record = record.is_some(), "extraction response decoded");
        Ok(record)
    }

    pub async fn submit(&self, submission: &Submission) -> AppResult<SubmissionReceipt> {
        info!(
            target: "webhook",
            url = %self.submission_url,
            files = submission.files.len(),
            user = %submission.user_name,
            "submitting confirmed record"
        );
        let response = self
            .http
            .post(&self.submission_url)
            .json(submission)
            .send()
            .await?;
        let response = ensure_success(response, "Webhook failed").await?;

        let body = response.text().await.unwrap_or_default();
        let text = decode_envelope::<ConfirmationBody>(&body)
            .and_then(|payload| payload.text)
            .and_then(|value| match value {
                Value::String(text) if !text.trim().is_empty() => Some(text),
                _ => None,
            });
        Ok(SubmissionReceipt { text })
    }
}

async fn ensure_success(response: Response, fallback: &str) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("{fallback} ({})", status.as_u16())
    } else {
        body
    };
    Err(AppError::Webhook {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::SelectedFile;
    use httptest::matchers::{all_of, eq, json_decoded, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn client(server: &Server) -> WebhookClient {
        WebhookClient::with_endpoints(
            &server.url_str("/webhook/upload"),
            &server.url_str("/webhook/Dox"),
        )
        .unwrap()
    }

    #[test]
    fn envelope_unwraps_first_list_element() {
        let listed: Option<ExtractionBody> = decode_envelope(r#"[{"output":{"a":1}},{"output":null}]"#);
        assert_eq!(listed.unwrap().output, Some(json!({ "a": 1 })));

        let single: Option<ExtractionBody> = decode_envelope(r#"{"output":{"b":2}}"#);
        assert_eq!(single.unwrap().output, Some(json!({ "b": 2 })));

        assert!(decode_envelope::<ExtractionBody>("[]").is_none());
        assert!(decode_envelope::<ExtractionBody>("<html>").is_none());
    }

    #[tokio::test]
    async fn extraction_posts_files_and_maps_output() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/webhook/upload"),
                request::body(json_decoded(eq(json!({
                    "files": [{
                        "name": "scan.pdf",
                        "type": "application/pdf",
                        "size": 5,
                        "base64": "aGVsbG8="
                    }]
                })))),
            ])
            .respond_with(json_encoded(json!([
                { "output": { "vehicle": { "vin": "1HGCM", "year": 2019 } } }
            ]))),
        );

        let file = SelectedFile::new("scan.pdf", "application/pdf", b"hello".to_vec());
        let record = client(&server)
            .extract(&[file.to_payload()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.vehicle.vin, "1HGCM");
        assert_eq!(record.vehicle.year, "2019");
    }

    #[tokio::test]
    async fn extraction_without_output_yields_no_record() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/webhook/upload"))
                .respond_with(status_code(200).body("accepted")),
        );

        let record = client(&server).extract(&[]).await.unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn failures_carry_server_text_or_status() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/webhook/upload"))
                .respond_with(status_code(500).body("extractor offline")),
        );
        server.expect(
            Expectation::matching(request::method_path("POST", "/webhook/Dox"))
                .respond_with(status_code(502)),
        );

        let client = client(&server);
        let err = client.extract(&[]).await.unwrap_err();
        assert_eq!(err.to_string(), "extractor offline");
        assert!(matches!(err, AppError::Webhook { status: 500, .. }));

        let submission = Submission::new(Identity::default(), Vec::new(), ExtractedRecord::default());
        let err = client.submit(&submission).await.unwrap_err();
        assert_eq!(err.to_string(), "Webhook failed (502)");
    }

    #[tokio::test]
    async fn submission_surfaces_receipt_text() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/webhook/Dox"))
                .respond_with(json_encoded(json!([{ "text": "Order #42 booked" }]))),
        );

        let submission = Submission::new(
            Identity {
                name: String::new(),
                email: "ops@example.com".into(),
            },
            Vec::new(),
            ExtractedRecord::default(),
        );
        assert_eq!(submission.user_name, "ops@example.com");

        let receipt = client(&server).submit(&submission).await.unwrap();
        assert_eq!(receipt.text.as_deref(), Some("Order #42 booked"));
    }

    #[tokio::test]
    async fn blank_or_non_text_receipt_is_dropped() {
        let submission = Submission::new(Identity::default(), Vec::new(), ExtractedRecord::default());
        for body in [json!({ "text": "   " }), json!([{ "text": 7 }]), json!([{}])] {
            let server = Server::run();
            server.expect(
                Expectation::matching(request::method_path("POST", "/webhook/Dox"))
                    .respond_with(json_encoded(body)),
            );

            let receipt = client(&server).submit(&submission).await.unwrap();
            assert_eq!(receipt.text, None);
        }
    }

    #[test]
    fn submission_serializes_camel_case() {
        let submission = Submission::new(Identity::default(), Vec::new(), ExtractedRecord::default());
        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(value["userName"], "Account");
        assert_eq!(value["user"], json!({ "name": "", "email": "" }));
        assert!(value["submittedAt"].is_string());
        assert_eq!(value["formData"]["dropoff_location"]["lat"], "");
        assert_eq!(value["files"], json!([]));
    }
}
