use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::barge_in::{FillerWordPolicy, DEFAULT_FILLER_WORDS, DEFAULT_MAX_BACKCHANNEL_TOKENS};
use crate::realtime::{
    ExponentialBackoff, OverflowPolicy, RealtimeEndpoint, SessionConfig, TranscriptionConfig,
    TurnDetection, REALTIME_API_URL,
};
use crate::session::TurnConfig;
use crate::transcript::WindowedDedup;

/// Environment variable naming the settings file
pub const SETTINGS_ENV: &str = "CALLBRIDGE_SETTINGS";

const DEFAULT_PERSONA: &str = "You are a friendly receptionist answering the phone for a small \
business. Keep answers short and conversational. Find out the caller's name, what kind of \
business they run, and the best email or phone number to reach them on.";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Listen address for the HTTP / WebSocket server.
    pub bind_addr: String,

    /// Host name the carrier reaches us on; falls back to the request's Host header.
    pub public_host: Option<String>,

    /// Realtime API WebSocket URL (including the model query).
    pub realtime_url: String,

    /// Never written to the settings file; comes from `OPENAI_API_KEY`.
    #[serde(skip)]
    pub openai_api_key: Option<String>,

    /// Where finished call records are POSTed. When unset they are only logged.
    pub recorder_url: Option<String>,

    #[serde(skip)]
    pub recorder_token: Option<String>,

    /// Persona / system instructions for the speech AI.
    pub persona_instructions: String,

    /// Optional steering for the very first response.
    pub greeting_instructions: Option<String>,

    pub voice: String,
    pub temperature: f32,
    pub modalities: Vec<String>,
    pub max_response_output_tokens: Option<u32>,
    pub transcription_model: String,

    /// Server VAD onset sensitivity (0.0 - 1.0).
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,

    /// Caller speech this soon after the assistant starts is not a barge-in.
    pub grace_period_ms: u64,

    /// How long the greeting waits for the speech AI socket before being queued anyway.
    pub greeting_fallback_ms: u64,

    /// Identical transcripts inside this window are dropped; overlaps inside twice the window
    /// are merged.
    pub dedup_window_ms: u64,

    /// Words that on their own never count as an interruption.
    pub filler_words: Vec<String>,
    pub max_backchannel_tokens: usize,

    /// Caller frames parked while the speech AI socket is dialling.
    pub outbox_capacity: usize,
    pub overflow_policy: OverflowPolicy,

    /// Dial attempts per call, including the first.
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5050".to_string(),
            public_host: None,
            realtime_url: REALTIME_API_URL.to_string(),
            openai_api_key: None,
            recorder_url: None,
            recorder_token: None,
            persona_instructions: DEFAULT_PERSONA.to_string(),
            greeting_instructions: None,
            voice: "alloy".to_string(),
            temperature: 0.8,
            modalities: vec!["text".to_string(), "audio".to_string()],
            max_response_output_tokens: None,
            transcription_model: "whisper-1".to_string(),
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
            grace_period_ms: 200,
            greeting_fallback_ms: 300,
            dedup_window_ms: 500,
            filler_words: DEFAULT_FILLER_WORDS.iter().map(|w| w.to_string()).collect(),
            max_backchannel_tokens: DEFAULT_MAX_BACKCHANNEL_TOKENS,
            outbox_capacity: 500,
            overflow_policy: OverflowPolicy::DropOldest,
            reconnect_max_attempts: 3,
            reconnect_base_delay_ms: 250,
        }
    }
}

impl BridgeSettings {
    /// Overlay deployment values and secrets from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`; empty values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(bind) = get("CALLBRIDGE_BIND") {
            self.bind_addr = bind;
        } else if let Some(port) = get("PORT") {
            self.bind_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(host) = get("CALLBRIDGE_PUBLIC_HOST") {
            self.public_host = Some(host);
        }
        if let Some(url) = get("CALLBRIDGE_RECORDER_URL") {
            self.recorder_url = Some(url);
        }
        if let Some(token) = get("CALLBRIDGE_RECORDER_TOKEN") {
            self.recorder_token = Some(token);
        }
        if let Some(url) = get("CALLBRIDGE_REALTIME_URL") {
            self.realtime_url = url;
        }
    }

    /// `session.update` payload sent when the speech AI socket opens
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: Some(self.modalities.clone()),
            instructions: Some(self.persona_instructions.clone()),
            voice: Some(self.voice.clone()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: self.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection {
                threshold: Some(self.vad_threshold),
                prefix_padding_ms: Some(self.vad_prefix_padding_ms),
                silence_duration_ms: Some(self.vad_silence_duration_ms),
                ..TurnDetection::default()
            }),
            temperature: Some(self.temperature),
            max_response_output_tokens: self.max_response_output_tokens,
            ..SessionConfig::default()
        }
    }

    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            grace_period: Duration::from_millis(self.grace_period_ms),
            greeting_fallback: Duration::from_millis(self.greeting_fallback_ms),
            greeting_instructions: self.greeting_instructions.clone(),
            session: self.session_config(),
            outbox_capacity: self.outbox_capacity,
            overflow_policy: self.overflow_policy,
            interruption: Arc::new(FillerWordPolicy::new(
                &self.filler_words,
                self.max_backchannel_tokens,
            )),
            dedup: Arc::new(WindowedDedup::new(Duration::from_millis(
                self.dedup_window_ms,
            ))),
        }
    }

    pub fn realtime_endpoint(&self) -> RealtimeEndpoint {
        RealtimeEndpoint {
            url: self.realtime_url.clone(),
            api_key: self.openai_api_key.clone(),
        }
    }

    pub fn reconnect_strategy(&self) -> ExponentialBackoff {
        let base_delay = Duration::from_millis(self.reconnect_base_delay_ms);
        ExponentialBackoff {
            max_attempts: self.reconnect_max_attempts.max(1),
            base_delay,
            max_delay: base_delay.saturating_mul(8),
        }
    }
}

/// Settings file from `CALLBRIDGE_SETTINGS`, if set
pub fn settings_path() -> Option<PathBuf> {
    std::env::var_os(SETTINGS_ENV)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

pub fn read_settings(path: &Path) -> Result<BridgeSettings, SettingsError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str::<BridgeSettings>(&contents).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load settings from `path` (if any), falling back to defaults on any problem.
pub fn load_settings(path: Option<&Path>) -> BridgeSettings {
    let Some(path) = path else {
        return BridgeSettings::default();
    };

    match read_settings(path) {
        Ok(settings) => {
            log::info!("Settings: loaded {:?}", path);
            settings
        }
        Err(SettingsError::Read { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            log::info!("Settings: {:?} not found, using defaults", path);
            BridgeSettings::default()
        }
        Err(e) => {
            log::warn!("Settings: {}", e);
            BridgeSettings::default()
        }
    }
}
