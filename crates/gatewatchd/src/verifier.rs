//! Remote identity verification over HTTP.

use crate::cache::Verdict;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("verification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("verification service returned HTTP {0}")]
    Status(u16),
    #[error("verification backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Serialize)]
pub struct VerifyRequest<'a> {
    pub embedding: &'a [f32],
    pub camera_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    /// Identified and recorded.
    Success,
    /// Identified, but the service chose not to record it (e.g. recently seen).
    Ignored,
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    pub status: VerifyStatus,
    #[serde(default)]
    pub person_name: Option<String>,
}

impl VerifyResponse {
    pub fn verdict(&self) -> Verdict {
        match self.status {
            VerifyStatus::Success | VerifyStatus::Ignored => Verdict::Recognized,
            VerifyStatus::Unknown => Verdict::Unrecognized,
        }
    }

    pub fn label(&self) -> &str {
        self.person_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("Unknown")
    }
}

/// Something that can turn an embedding into an identity verdict.
///
/// Called from the dispatcher's worker threads; implementations block.
pub trait Verifier: Send + Sync + 'static {
    fn verify(&self, embedding: &[f32]) -> Result<VerifyResponse, VerifyError>;
}

/// Posts embeddings as JSON to the attendance service.
pub struct HttpVerifier {
    client: reqwest::blocking::Client,
    url: String,
    source_id: String,
}

impl HttpVerifier {
    pub fn new(url: &str, source_id: &str, timeout: Duration) -> Result<Self, VerifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            source_id: source_id.to_string(),
        })
    }
}

impl Verifier for HttpVerifier {
    fn verify(&self, embedding: &[f32]) -> Result<VerifyResponse, VerifyError> {
        let request = VerifyRequest {
            embedding,
            camera_id: &self.source_id,
        };
        let response = self.client.post(&self.url).json(&request).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifyError::Status(status.as_u16()));
        }
        Ok(response.json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let values = [0.25f32, -0.5];
        let body = serde_json::to_value(VerifyRequest {
            embedding: &values,
            camera_id: "gate-a",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"embedding": [0.25, -0.5], "camera_id": "gate-a"}));
    }

    #[test]
    fn test_success_and_ignored_are_recognized() {
        let r: VerifyResponse =
            serde_json::from_str(r#"{"status":"success","person_name":"Jane"}"#).unwrap();
        assert_eq!(r.verdict(), Verdict::Recognized);
        assert_eq!(r.label(), "Jane");

        let r: VerifyResponse =
            serde_json::from_str(r#"{"status":"ignored","person_name":"Jane","message":"seen"}"#)
                .unwrap();
        assert_eq!(r.verdict(), Verdict::Recognized);
    }

    #[test]
    fn test_unknown_defaults_label() {
        let r: VerifyResponse = serde_json::from_str(r#"{"status":"unknown"}"#).unwrap();
        assert_eq!(r.verdict(), Verdict::Unrecognized);
        assert_eq!(r.label(), "Unknown");

        let r: VerifyResponse =
            serde_json::from_str(r#"{"status":"success","person_name":null}"#).unwrap();
        assert_eq!(r.label(), "Unknown");
    }

    #[test]
    fn test_unexpected_status_is_rejected() {
        assert!(serde_json::from_str::<VerifyResponse>(r#"{"status":"error"}"#).is_err());
    }
}
