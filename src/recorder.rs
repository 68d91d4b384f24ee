//! Call record handoff
//!
//! At teardown the call's transcript and extracted lead fields are handed to
//! a storage collaborator. Persistence failures are logged by the caller and
//! never affect the call itself.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transcript::ExtractedFields;

/// Status given to every freshly recorded call
pub const NEW_CALL_STATUS: &str = "new";

/// Timeout for the storage request
const RECORD_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while recording a call
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(String),
    /// Storage service rejected the record
    #[error("Storage API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// What gets persisted for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub caller: Option<String>,
    pub call_sid: Option<String>,
    pub stream_sid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// `Caller:` / `AI:` lines in call order
    pub transcript: String,
    pub fields: ExtractedFields,
    pub status: String,
}

/// Storage collaborator for finished calls
pub trait CallRecorder: Send + Sync + 'static {
    fn record(&self, record: CallRecord) -> BoxFuture<'_, Result<(), RecorderError>>;
}

/// POSTs records as JSON to a storage endpoint
pub struct HttpCallRecorder {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpCallRecorder {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, RecorderError> {
        let client = Client::builder()
            .timeout(RECORD_TIMEOUT)
            .build()
            .map_err(|e| RecorderError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

impl CallRecorder for HttpCallRecorder {
    fn record(&self, record: CallRecord) -> BoxFuture<'_, Result<(), RecorderError>> {
        Box::pin(async move {
            let mut request = self.client.post(&self.url).json(&record);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| RecorderError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(RecorderError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            log::info!(
                "Recorder: stored call {} ({}s)",
                record.call_sid.as_deref().unwrap_or("?"),
                record.duration_secs
            );
            Ok(())
        })
    }
}

/// Logs records instead of storing them (no storage configured)
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCallRecorder;

impl CallRecorder for LogCallRecorder {
    fn record(&self, record: CallRecord) -> BoxFuture<'_, Result<(), RecorderError>> {
        Box::pin(async move {
            match serde_json::to_string(&record) {
                Ok(json) => log::info!("Recorder: call record {}", json),
                Err(e) => log::warn!("Recorder: could not serialize record: {}", e),
            }
            Ok(())
        })
    }
}
