//! Speech-AI realtime link
//!
//! WebSocket plumbing towards the OpenAI Realtime API: the wire protocol,
//! the connection handle, the pre-open outbox and the redial strategy.
//!
//! # Architecture
//!
//! ```text
//! Caller frames ──▶ Outbox (while connecting) ──▶ RealtimeSession ──▶ Speech-AI
//!                                                     │
//!                                            receiver task (mpsc)
//!                                                     │
//!                                                     ▼
//!                                          ServerMessage → call reducer
//! ```
//!
//! # Reconnect Strategy
//!
//! - Dialling retries follow a pluggable [`ReconnectStrategy`]
//! - A socket that drops mid-call ends the call (no mid-call redial)

mod client;
mod outbox;
mod protocol;
mod reconnect;

pub use client::{get_api_key, RealtimeEndpoint, RealtimeSession};
pub use outbox::{LinkState, Outbox, OverflowPolicy, PushOutcome, SpeechAiLink};
pub use protocol::{
    ClientMessage, ErrorInfo, ResponseInfo, ResponseOptions, ServerMessage, SessionConfig,
    SessionInfo, TranscriptionConfig, TurnDetection, REALTIME_API_URL,
};
pub use reconnect::{ExponentialBackoff, NoReconnect, ReconnectStrategy};

/// Errors that can occur on the Speech-AI link
#[derive(Debug, Clone, thiserror::Error)]
pub enum RealtimeError {
    /// Failed to establish WebSocket connection
    #[error("Failed to connect to realtime API: {0}")]
    ConnectionFailed(String),
    /// The API rejected our credentials or session
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    /// Connection was closed unexpectedly
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    /// Failed to send a message
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    /// The reconnect strategy gave up
    #[error("Realtime API unreachable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}
