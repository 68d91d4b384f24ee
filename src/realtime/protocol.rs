//! OpenAI Realtime API protocol types
//!
//! This module defines the JSON message types exchanged with the
//! speech-to-speech model over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://api.openai.com/v1/realtime?model=...`
//! 2. Receive `session.created` event
//! 3. Send `session.update` with persona, voice and VAD settings
//! 4. Stream caller audio via `input_audio_buffer.append` (g711 µ-law, base64)
//! 5. Receive `response.audio.delta` chunks and relay them to the phone
//! 6. On barge-in send `response.cancel` and later `conversation.item.truncate`

use serde::{Deserialize, Serialize};

/// OpenAI Realtime API endpoint
pub const REALTIME_API_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17";

/// Session configuration for the Realtime API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Output modalities, e.g. `["text", "audio"]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// Persona / system instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice used for generated audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Caller audio format - telephony uses "g711_ulaw"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Generated audio format, must match what the phone leg plays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Server-side voice activity detection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Upper bound on tokens per response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: None,
            voice: Some("alloy".to_string()),
            input_audio_format: Some("g711_ulaw".to_string()),
            output_audio_format: Some("g711_ulaw".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
            turn_detection: Some(TurnDetection::default()),
            temperature: Some(0.8),
            max_response_output_tokens: None,
        }
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Model to use for transcription
    pub model: String,
}

/// Server VAD configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    /// Type of turn detection
    #[serde(rename = "type")]
    pub detection_type: String,

    /// Onset sensitivity (0.0 - 1.0); higher needs louder speech
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    /// Audio kept before detected speech onset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,

    /// Trailing silence that ends a caller turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            detection_type: "server_vad".to_string(),
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
        }
    }
}

/// Per-response overrides for `response.create`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Session information returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Unique session ID
    pub id: String,

    /// Model being used
    #[serde(default)]
    pub model: String,

    /// Current modalities
    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Summary of a finished response
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,

    /// "completed", "cancelled", "incomplete" or "failed"
    #[serde(default)]
    pub status: Option<String>,
}

/// Error information from the API
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    /// Error type/code
    #[serde(rename = "type", default)]
    pub error_type: String,

    /// Error code
    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Client Messages (sent TO OpenAI)
// ============================================================================

/// Messages sent from the bridge to the Realtime API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append caller audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded audio, passed through from the phone leg
        audio: String,
    },

    /// Ask the model to generate a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },

    /// Stop the in-progress response
    #[serde(rename = "response.cancel")]
    ResponseCancel,

    /// Cut an assistant item down to what the caller actually heard
    #[serde(rename = "conversation.item.truncate")]
    ItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
}

impl ClientMessage {
    /// Create a session update message
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate { session }
    }

    /// Create an audio append message from an already-encoded payload
    pub fn audio_append(payload: impl Into<String>) -> Self {
        Self::AudioAppend {
            audio: payload.into(),
        }
    }

    /// Create a `response.create`, optionally steering it with instructions
    pub fn response_create(instructions: Option<String>) -> Self {
        Self::ResponseCreate {
            response: instructions.map(|instructions| ResponseOptions {
                instructions: Some(instructions),
            }),
        }
    }

    /// Create a truncate command for the first content part of `item_id`
    pub fn truncate(item_id: impl Into<String>, audio_end_ms: u64) -> Self {
        Self::ItemTruncate {
            item_id: item_id.into(),
            content_index: 0,
            audio_end_ms,
        }
    }

    /// True for caller audio; everything else is a control command
    pub fn is_audio(&self) -> bool {
        matches!(self, ClientMessage::AudioAppend { .. })
    }
}

// ============================================================================
// Server Messages (received FROM OpenAI)
// ============================================================================

/// Messages received from the Realtime API
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Session was created successfully
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    /// Session was updated successfully
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    /// An error occurred
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Server VAD detected caller speech
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Server VAD detected the end of caller speech
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    /// A chunk of generated audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Base64-encoded audio in the session's output format
        delta: String,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Generated audio for the current item is complete
    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        item_id: Option<String>,
    },

    /// The response finished (completed, cancelled or failed)
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },

    /// Final transcript of a caller utterance
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        transcript: String,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Final text of a text-modality response
    #[serde(rename = "response.text.done")]
    ResponseTextDone { text: String },

    /// Transcript of the generated audio
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone { transcript: String },

    /// Catch-all for message types we don't handle
    /// This prevents deserialization failures for unknown types
    #[serde(other)]
    Unknown,
}
