//! Telephony media stream protocol types
//!
//! JSON frames exchanged with the carrier over the `/media-stream`
//! WebSocket, tagged by their `event` field.
//!
//! # Stream Lifecycle
//!
//! 1. `connected` - socket is up, nothing known about the call yet
//! 2. `start` - stream and call identifiers, custom parameters
//! 3. `media` - 20ms µ-law frames, base64, one per track
//! 4. `mark` - playback reached a marker we sent
//! 5. `stop` - call is over

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Track name of audio coming from the caller
pub const INBOUND_TRACK: &str = "inbound";

/// Custom parameter carrying the caller's number (set by our TwiML)
pub const CALLER_PARAMETER: &str = "callerNumber";

// ============================================================================
// Incoming frames (carrier -> bridge)
// ============================================================================

/// Frames received from the telephony media endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected,

    Start { start: StartInfo },

    Media { media: MediaFrame },

    /// Playback acknowledgment for a mark we sent
    Mark { mark: MarkInfo },

    Stop,

    /// Frames we don't handle (e.g. `dtmf`)
    #[serde(other)]
    Unknown,
}

/// Payload of the `start` frame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub stream_sid: String,

    #[serde(default)]
    pub call_sid: Option<String>,

    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

impl StartInfo {
    /// Caller address as passed through the stream parameters
    pub fn caller(&self) -> Option<&str> {
        self.custom_parameters
            .get(CALLER_PARAMETER)
            .or_else(|| self.custom_parameters.get("from"))
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

/// One audio frame
#[derive(Debug, Clone, Deserialize)]
pub struct MediaFrame {
    /// `inbound` for the caller; anything else is our own audio echoed back
    #[serde(default)]
    pub track: Option<String>,

    /// Milliseconds since the stream started; the carrier sends it as a string
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: Option<u64>,

    /// Base64 µ-law audio
    pub payload: String,
}

impl MediaFrame {
    pub fn is_caller(&self) -> bool {
        self.track.as_deref() == Some(INBOUND_TRACK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInfo {
    pub name: String,
}

/// Accept `"1234"`, `1234` or nothing
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Millis>::deserialize(deserializer)? {
        Some(Millis::Number(n)) => Some(n),
        Some(Millis::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

// ============================================================================
// Outgoing commands (bridge -> carrier)
// ============================================================================

/// Commands sent to the telephony media endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    /// Play a chunk of audio to the caller
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },

    /// Ask for an acknowledgment once playback reaches this point
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkInfo,
    },

    /// Drop all buffered, not yet played audio
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl TelephonyCommand {
    pub fn media(stream_sid: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Media {
            stream_sid: stream_sid.into(),
            media: OutboundMedia {
                payload: payload.into(),
            },
        }
    }

    pub fn mark(stream_sid: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Mark {
            stream_sid: stream_sid.into(),
            mark: MarkInfo { name: name.into() },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        Self::Clear {
            stream_sid: stream_sid.into(),
        }
    }
}
