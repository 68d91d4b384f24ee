//! Per-call counters
//!
//! Tracks relay volumes and barge-in outcomes for a single call. The
//! summary is logged when the call is torn down and included in nothing
//! else; it exists for diagnostics and tuning the interruption heuristics.

use serde::{Deserialize, Serialize};

/// Counters for one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetrics {
    /// Caller frames forwarded (or parked) towards the speech AI
    pub inbound_frames: u64,
    /// Frames on a non-caller track, never forwarded
    pub echo_frames_dropped: u64,
    /// Frames with unparsable JSON or payload
    pub malformed_frames: u64,
    /// Audio frames evicted or refused by the pre-open outbox
    pub outbox_overflow: u64,
    /// Assistant audio chunks sent to the phone
    pub audio_deltas: u64,
    /// Deltas dropped because they belonged to a cancelled item
    pub stale_deltas_dropped: u64,
    /// Playback marks acknowledged by the carrier
    pub marks_acked: u64,
    /// Timing-phase interruptions (cancel + clear issued)
    pub barge_ins: u64,
    /// Speech-started signals inside the grace period
    pub grace_suppressed: u64,
    /// Barge-ins whose transcript turned out to be a backchannel
    pub false_positives: u64,
    /// Truncate commands issued
    pub truncates: u64,
    /// Transcripts discarded or merged as duplicates
    pub transcripts_deduplicated: u64,
    /// Errors reported by the speech AI
    pub realtime_errors: u64,
}

impl CallMetrics {
    /// Log the counters at info level, tagged with the call label
    pub fn log_summary(&self, call: &str, duration_secs: u64) {
        log::info!(
            "Call {}: ended after {}s, inbound={} echo_dropped={} malformed={} overflow={} \
             deltas={} stale_deltas={} marks_acked={} barge_ins={} grace_suppressed={} \
             false_positives={} ({}) truncates={} deduped={} realtime_errors={}",
            call,
            duration_secs,
            self.inbound_frames,
            self.echo_frames_dropped,
            self.malformed_frames,
            self.outbox_overflow,
            self.audio_deltas,
            self.stale_deltas_dropped,
            self.marks_acked,
            self.barge_ins,
            self.grace_suppressed,
            self.false_positives,
            self.false_positive_rate()
                .map(|rate| format!("{:.0}%", rate * 100.0))
                .unwrap_or_else(|| "n/a".to_string()),
            self.truncates,
            self.transcripts_deduplicated,
            self.realtime_errors,
        );
    }

    /// Share of barge-ins that were only backchannels
    pub fn false_positive_rate(&self) -> Option<f64> {
        if self.barge_ins == 0 {
            None
        } else {
            Some(self.false_positives as f64 / self.barge_ins as f64)
        }
    }
}
