//! Server-side transcription of recorded audio.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, StatusCode, Url,
    multipart::{Form, Part},
};
use serde::Deserialize;
use tracing::{debug, info};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// A finished audio recording ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub data: Bytes,
    pub mime_type: String,
    pub file_name: String,
}

impl Recording {
    pub fn wav(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            mime_type: "audio/wav".to_string(),
            file_name: "recording.wav".to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscribeError {
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
    #[error("transcription request failed: {0}")]
    Request(String),
    #[error("transcription service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Rejected(String),
    #[error("unreadable transcription response: {0}")]
    Decode(String),
}

#[derive(Deserialize, Debug)]
struct TranscribeResponse {
    #[serde(default)]
    success: bool,
    text: Option<String>,
    error: Option<String>,
}

/// Turns a recording into text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, recording: Recording) -> Result<String, TranscribeError>;
}

/// Uploads recordings to `POST {backend}/api/transcribe` as multipart field
/// `audio`.
pub struct HttpTranscriber {
    client: Client,
    endpoint: Url,
}

impl HttpTranscriber {
    pub fn new(backend_url: &str) -> Result<Self, TranscribeError> {
        Self::with_client(Client::new(), backend_url)
    }

    pub fn with_client(client: Client, backend_url: &str) -> Result<Self, TranscribeError> {
        let endpoint = format!("{}/api/transcribe", backend_url.trim_end_matches('/'));
        let endpoint =
            Url::parse(&endpoint).map_err(|e| TranscribeError::InvalidUrl(e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, recording: Recording) -> Result<String, TranscribeError> {
        info!(bytes = recording.data.len(), "Uploading audio for transcription.");
        let part = Part::stream(recording.data)
            .file_name(recording.file_name)
            .mime_str(&recording.mime_type)
            .map_err(|e| TranscribeError::Request(e.to_string()))?;
        let form = Form::new().part("audio", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscribeError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TranscribeError::Request(e.to_string()))?;
        debug!(%status, body, "Transcription response received.");

        interpret_response(status, &body)
    }
}

fn interpret_response(status: StatusCode, body: &str) -> Result<String, TranscribeError> {
    let parsed = serde_json::from_str::<TranscribeResponse>(body);
    if !status.is_success() {
        let message = parsed
            .ok()
            .and_then(|r| r.error)
            .unwrap_or_else(|| body.trim().to_string());
        return Err(TranscribeError::Status {
            status: status.as_u16(),
            message,
        });
    }
    let response = parsed.map_err(|e| TranscribeError::Decode(e.to_string()))?;
    match response.text {
        Some(text) if response.success && !text.trim().is_empty() => Ok(text),
        _ => Err(TranscribeError::Rejected(
            response
                .error
                .unwrap_or_else(|| "Transcription failed".to_string()),
        )),
    }
}
