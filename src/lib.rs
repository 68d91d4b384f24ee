//! Phone call to realtime speech-AI bridge
//!
//! The carrier streams call audio to `/media-stream`; each connection gets
//! its own [`bridge::run_call`] task that dials the speech AI, relays audio
//! both ways, handles caller barge-in and hands the transcript to a
//! [`recorder::CallRecorder`] when the call ends.

pub mod barge_in;
pub mod bridge;
pub mod metrics;
pub mod realtime;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod telephony;
pub mod transcript;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Form, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;

use realtime::{RealtimeEndpoint, ReconnectStrategy};
use recorder::{CallRecorder, HttpCallRecorder, LogCallRecorder, RecorderError};
use session::TurnConfig;
use settings::BridgeSettings;

/// Errors that stop the server itself (never a single call)
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

/// Shared, read-only state handed to every call
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<BridgeSettings>,
    pub endpoint: RealtimeEndpoint,
    pub turn: Arc<TurnConfig>,
    pub reconnect: Arc<dyn ReconnectStrategy>,
    pub recorder: Arc<dyn CallRecorder>,
}

impl AppState {
    /// Build from settings: HTTP recorder when a URL is configured, log-only otherwise
    pub fn from_settings(settings: BridgeSettings) -> Result<Self, BridgeError> {
        let recorder: Arc<dyn CallRecorder> = match &settings.recorder_url {
            Some(url) => Arc::new(HttpCallRecorder::new(
                url.clone(),
                settings.recorder_token.clone(),
            )?),
            None => {
                log::warn!("No recorder URL configured, call records will only be logged");
                Arc::new(LogCallRecorder)
            }
        };

        if settings.openai_api_key.is_none() {
            log::warn!("OPENAI_API_KEY not set, speech AI will likely refuse connections");
        }

        Ok(Self {
            endpoint: settings.realtime_endpoint(),
            turn: Arc::new(settings.turn_config()),
            reconnect: Arc::new(settings.reconnect_strategy()),
            recorder,
            settings: Arc::new(settings),
        })
    }
}

/// Carrier webhook parameters we care about
#[derive(Debug, Default, Deserialize)]
struct IncomingCall {
    #[serde(rename = "From", default)]
    from: Option<String>,
    #[serde(rename = "CallSid", default)]
    call_sid: Option<String>,
}

async fn health() -> &'static str {
    "Call bridge is running"
}

/// Answer an incoming call with TwiML pointing at our media stream
async fn incoming_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(call): Form<IncomingCall>,
) -> Response {
    let host = state
        .settings
        .public_host
        .clone()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "localhost".to_string());

    log::info!(
        "Incoming call {} from {}",
        call.call_sid.as_deref().unwrap_or("?"),
        call.from.as_deref().unwrap_or("unknown")
    );

    let stream_url = format!("wss://{}/media-stream", host);
    let twiml = telephony::stream_twiml(&stream_url, call.from.as_deref());
    ([(header::CONTENT_TYPE, "text/xml")], twiml).into_response()
}

async fn media_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| bridge::run_call(socket, state))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/incoming-call", get(incoming_call).post(incoming_call))
        .route("/media-stream", get(media_stream))
        .with_state(state)
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), BridgeError> {
    axum::serve(listener, router(state))
        .await
        .map_err(BridgeError::Serve)
}

/// Bind the configured address and serve until the process exits
pub async fn run(settings: BridgeSettings) -> Result<(), BridgeError> {
    let addr = settings.bind_addr.clone();
    let state = AppState::from_settings(settings)?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BridgeError::Bind {
            addr: addr.clone(),
            source,
        })?;

    log::info!("Call bridge listening on {}", addr);
    serve(listener, state).await
}
