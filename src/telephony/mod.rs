//! Telephony media stream leg
//!
//! Wire types for the carrier's bidirectional media WebSocket and the
//! TwiML that points an incoming call at it.

mod protocol;
mod twiml;

pub use protocol::{
    MarkInfo, MediaFrame, OutboundMedia, StartInfo, TelephonyCommand, TelephonyEvent,
    CALLER_PARAMETER, INBOUND_TRACK,
};
pub use twiml::stream_twiml;
