//! Per-call session state
//!
//! One [`CallSession`] exists per telephony connection. It is owned by the
//! connection's task and mutated only by [`crate::state_machine::reduce`],
//! so ordering is exactly the order in which events reach the reducer.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::barge_in::{FillerWordPolicy, InterruptionPolicy, DEFAULT_GRACE_PERIOD};
use crate::metrics::CallMetrics;
use crate::realtime::{Outbox, OverflowPolicy, SessionConfig, SpeechAiLink};
use crate::state_machine::CallPhase;
use crate::transcript::{DedupPolicy, TranscriptLog, WindowedDedup};

/// Default wait for the speech AI before the greeting is queued anyway
pub const DEFAULT_GREETING_FALLBACK: Duration = Duration::from_millis(300);

/// Default bound on audio parked while the speech AI socket is dialling
pub const DEFAULT_OUTBOX_CAPACITY: usize = 500;

/// Turn-taking knobs shared by every call
pub struct TurnConfig {
    /// Caller speech this soon after the assistant starts talking is ignored
    pub grace_period: Duration,
    /// How long the greeting waits for the speech AI socket
    pub greeting_fallback: Duration,
    /// Optional steering for the first response
    pub greeting_instructions: Option<String>,
    /// Sent as `session.update` when the socket opens
    pub session: SessionConfig,
    pub outbox_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub interruption: Arc<dyn InterruptionPolicy>,
    pub dedup: Arc<dyn DedupPolicy>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            greeting_fallback: DEFAULT_GREETING_FALLBACK,
            greeting_instructions: None,
            session: SessionConfig::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            interruption: Arc::new(FillerWordPolicy::default()),
            dedup: Arc::new(WindowedDedup::default()),
        }
    }
}

impl fmt::Debug for TurnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnConfig")
            .field("grace_period", &self.grace_period)
            .field("greeting_fallback", &self.greeting_fallback)
            .field("outbox_capacity", &self.outbox_capacity)
            .field("overflow_policy", &self.overflow_policy)
            .finish_non_exhaustive()
    }
}

/// Outbound playback markers awaiting acknowledgment, oldest first
#[derive(Debug, Default)]
pub struct MarkQueue {
    pending: VecDeque<String>,
}

impl MarkQueue {
    /// Generate a fresh marker name and queue it
    pub fn issue(&mut self) -> String {
        let name = Uuid::new_v4().to_string();
        self.pending.push_back(name.clone());
        name
    }

    /// Pop the oldest marker, whatever name the acknowledgment carried
    pub fn ack(&mut self) -> Option<String> {
        self.pending.pop_front()
    }

    /// Forget all outstanding markers, returning how many there were
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What the assistant was saying when the caller barged in
///
/// Captured in the timing phase so the content phase can still truncate
/// after the cancelled response has been wound up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptedTurn {
    pub item_id: Option<String>,
    pub response_start_ts: Option<u64>,
}

/// State of one bridged call
#[derive(Debug)]
pub struct CallSession {
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    pub caller: Option<String>,
    pub started_at: DateTime<Utc>,
    pub started_instant: Instant,

    pub phase: CallPhase,
    /// Set with the phase; kept separately for the grace-period check
    pub ai_speaking_since: Option<Instant>,
    /// Latest caller media timestamp (ms since stream start)
    pub latest_media_ts: u64,
    /// Some while a barge-in awaits its transcript
    pub pending_interruption: Option<InterruptedTurn>,
    pub last_assistant_item: Option<String>,
    /// Media timestamp when the current assistant turn started playing
    pub response_start_ts: Option<u64>,
    /// Cancelled item whose late deltas must not be played
    pub suppressed_item: Option<String>,
    pub marks: MarkQueue,

    pub reconnect_attempts: u32,
    pub greeting_sent: bool,
    pub greeting_timer_armed: bool,

    pub link: SpeechAiLink,
    pub transcript: TranscriptLog,
    pub metrics: CallMetrics,
    pub config: Arc<TurnConfig>,
    /// Teardown has run
    pub finalized: bool,
}

impl CallSession {
    pub fn new(config: Arc<TurnConfig>) -> Self {
        Self {
            stream_sid: None,
            call_sid: None,
            caller: None,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            phase: CallPhase::Idle,
            ai_speaking_since: None,
            latest_media_ts: 0,
            pending_interruption: None,
            last_assistant_item: None,
            response_start_ts: None,
            suppressed_item: None,
            marks: MarkQueue::default(),
            reconnect_attempts: 0,
            greeting_sent: false,
            greeting_timer_armed: false,
            link: SpeechAiLink::new(Outbox::new(config.outbox_capacity, config.overflow_policy)),
            transcript: TranscriptLog::new(),
            metrics: CallMetrics::default(),
            config,
            finalized: false,
        }
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.phase == CallPhase::AiSpeaking
    }

    pub fn interrupt_pending(&self) -> bool {
        self.pending_interruption.is_some()
    }

    /// Short identifier for log lines
    pub fn label(&self) -> &str {
        self.stream_sid.as_deref().unwrap_or("<no stream>")
    }
}
