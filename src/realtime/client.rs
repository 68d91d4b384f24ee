//! Realtime API WebSocket client
//!
//! Manages the Speech-AI socket for a single call.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Dial (with redials per strategy), wait for `session.created`
//! 2. `send()` - Session config, caller audio, cancel/truncate commands
//! 3. `take_incoming_receiver()` - Server events for the call loop
//! 4. `disconnect()` - Clean shutdown
//!
//! The session configuration is *not* sent here: the call state machine
//! sends it as the first message after the link opens, so it always
//! precedes anything buffered while dialling.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage, REALTIME_API_URL};
use super::reconnect::ReconnectStrategy;
use super::RealtimeError;

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for session.created message
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Server events buffered between the socket and the call loop
const INCOMING_CAPACITY: usize = 256;

/// Where and how to dial the Speech-AI endpoint
#[derive(Debug, Clone)]
pub struct RealtimeEndpoint {
    pub url: String,
    /// Sent as a bearer token when present
    pub api_key: Option<String>,
}

impl Default for RealtimeEndpoint {
    fn default() -> Self {
        Self {
            url: REALTIME_API_URL.to_string(),
            api_key: get_api_key(),
        }
    }
}

type WsWrite = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Handle to an active Realtime API session
///
/// The session owns the WebSocket write half; the read half is drained by
/// a background task into an mpsc channel.
pub struct RealtimeSession {
    write: WsWrite,
    /// Wrapped in Option so it can be taken by the call loop
    incoming_rx: Option<mpsc::Receiver<ServerMessage>>,
    /// Session ID from OpenAI
    session_id: String,
    /// Handle to the receiver task (for cleanup on disconnect/drop)
    receiver_task: tokio::task::JoinHandle<()>,
}

impl RealtimeSession {
    /// Connect to the Realtime API, redialling as the strategy allows
    ///
    /// `on_failure` is called after every failed attempt with the running
    /// count of failures, so the caller can keep its own books.
    pub async fn connect<F>(
        endpoint: &RealtimeEndpoint,
        strategy: &dyn ReconnectStrategy,
        mut on_failure: F,
    ) -> Result<Self, RealtimeError>
    where
        F: FnMut(u32, &RealtimeError),
    {
        let mut failed: u32 = 0;

        loop {
            match Self::try_connect(endpoint).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    failed += 1;
                    log::warn!("Realtime: connection attempt {} failed: {}", failed, e);
                    on_failure(failed, &e);

                    match strategy.next_delay(failed) {
                        Some(delay) => {
                            log::info!(
                                "Realtime: retrying in {:?} (attempt {})",
                                delay,
                                failed + 1
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(RealtimeError::Exhausted {
                                attempts: failed,
                                last: e.to_string(),
                            })
                        }
                    }
                }
            }
        }
    }

    /// Single connection attempt (no retries)
    async fn try_connect(endpoint: &RealtimeEndpoint) -> Result<Self, RealtimeError> {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        if let Some(api_key) = endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .map_err(|e| RealtimeError::AuthenticationFailed(e.to_string()))?,
            );
        }

        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("Realtime: connecting to {}", endpoint.url);

        // disable_nagle = true: audio deltas are small and latency-sensitive
        let (ws_stream, _response) =
            timeout(CONNECTION_TIMEOUT, connect_async_with_config(request, None, true))
                .await
                .map_err(|_| RealtimeError::ConnectionFailed("Connection timeout".to_string()))?
                .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        log::debug!("Realtime: WebSocket connected, waiting for session.created");

        let (write, mut read) = ws_stream.split();

        let session_id = timeout(SESSION_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::SessionCreated { session }) => {
                            log::info!("Realtime: session created: {}", session.id);
                            return Ok(session.id);
                        }
                        Ok(ServerMessage::Error { error }) => {
                            return Err(RealtimeError::AuthenticationFailed(error.message));
                        }
                        Ok(_) => {
                            log::debug!("Realtime: ignoring message while waiting for session.created");
                        }
                        Err(e) => {
                            log::warn!("Realtime: failed to parse message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        return Err(RealtimeError::Disconnected(
                            "Connection closed before session created".to_string(),
                        ));
                    }
                    Err(e) => {
                        return Err(RealtimeError::ProtocolError(e.to_string()));
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            Err(RealtimeError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| RealtimeError::ConnectionFailed("Session creation timeout".to_string()))??;

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        // Dropping incoming_tx on exit is how the call loop learns the socket is gone
        let receiver_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if incoming_tx.send(msg).await.is_err() {
                                log::debug!("Realtime: receiver channel closed");
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("Realtime: dropping malformed message: {}", e);
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        log::info!("Realtime: WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    Err(e) => {
                        log::warn!("Realtime: WebSocket error: {}", e);
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }
            log::debug!("Realtime: receiver task exiting");
        });

        Ok(Self {
            write,
            incoming_rx: Some(incoming_rx),
            session_id,
            receiver_task,
        })
    }

    /// Send a client message over the WebSocket
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), RealtimeError> {
        let json =
            serde_json::to_string(msg).map_err(|e| RealtimeError::ProtocolError(e.to_string()))?;

        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| RealtimeError::SendFailed(e.to_string()))
    }

    /// Take ownership of the incoming message receiver
    ///
    /// Returns `None` if already taken.
    pub fn take_incoming_receiver(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.incoming_rx.take()
    }

    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Gracefully disconnect from the API
    pub async fn disconnect(mut self) {
        log::info!("Realtime: disconnecting session {}", self.session_id);

        self.receiver_task.abort();

        if let Err(e) = self.write.close().await {
            log::debug!("Realtime: error closing WebSocket: {}", e);
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        // Ensure receiver task is aborted if session is dropped without disconnect()
        self.receiver_task.abort();
    }
}

/// Get the OpenAI API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}
