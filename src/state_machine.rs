//! Call state machine
//!
//! This module implements the per-call state machine using a single-writer
//! pattern. Every event from either socket (or the greeting timer) goes
//! through [`reduce`], which mutates the [`CallSession`] and returns the
//! effects the call runner must execute, in order.
//!
//! # Phases
//!
//! ```text
//! Idle ─start─▶ Greeting ─delta─▶ AiSpeaking ◀─delta─ Listening
//!                   │                  │  ▲              ▲
//!                   │                  │  └──────────────┤
//!                   └──── done ────────┴─ done/barge-in ─┘
//!   any ── stop / socket closed ──▶ Ended
//! ```
//!
//! A pending interruption is an overlay on top of the phase, not a phase of
//! its own: it lives from a barge-in until that utterance's transcript is
//! classified.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use std::time::{Duration, Instant};

use crate::barge_in::{audio_end_ms, passes_grace_period, Utterance};
use crate::realtime::{ClientMessage, PushOutcome, ServerMessage};
use crate::recorder::{CallRecord, NEW_CALL_STATUS};
use crate::session::{CallSession, InterruptedTurn};
use crate::telephony::{MediaFrame, StartInfo, TelephonyCommand, TelephonyEvent};
use crate::transcript::{extract_fields, DedupDecision, Speaker, TranscriptEvent};

/// Conversation phase of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Socket accepted, `start` not seen yet
    Idle,
    /// Call started, first response not playing yet
    Greeting,
    Listening,
    AiSpeaking,
    Ended,
}

/// Inputs to the phase transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    CallStarted,
    /// First assistant audio of a turn
    AudioStarted,
    /// Assistant audio or response finished
    TurnFinished,
    /// Caller barged in past the grace period
    Interrupted,
    Hangup,
}

impl CallPhase {
    /// Transition table; `None` means the trigger is not valid here
    pub fn next(self, trigger: Trigger) -> Option<CallPhase> {
        use CallPhase::*;
        use Trigger::*;

        match (self, trigger) {
            (Ended, _) => None,
            (_, Hangup) => Some(Ended),
            (Idle, CallStarted) => Some(Greeting),
            (Greeting | Listening | AiSpeaking, AudioStarted) => Some(AiSpeaking),
            (Greeting | Listening | AiSpeaking, TurnFinished) => Some(Listening),
            (AiSpeaking, Interrupted) => Some(Listening),
            _ => None,
        }
    }
}

/// Events that drive a call
#[derive(Debug, Clone)]
pub enum Event {
    /// Parsed frame from the telephony socket
    Telephony(TelephonyEvent),
    /// Telephony frame that failed to parse
    MalformedTelephony,
    /// Parsed message from the speech AI socket
    Realtime(ServerMessage),
    /// Speech AI socket finished its handshake
    RealtimeOpened,
    /// A dial attempt failed; `attempt` counts failures so far
    RealtimeAttemptFailed { attempt: u32 },
    /// Dialling gave up
    RealtimeUnavailable { reason: String },
    /// Speech AI socket closed or errored after opening
    RealtimeClosed,
    /// Telephony socket closed or errored
    TelephonyClosed,
    GreetingTimerFired,
}

/// Effects to be executed by the call runner, in order
#[derive(Debug, Clone)]
pub enum Effect {
    SendRealtime(ClientMessage),
    SendTelephony(TelephonyCommand),
    ArmGreetingTimer(Duration),
    CloseRealtime,
    CloseTelephony,
    RecordCall(CallRecord),
}

/// Reducer: apply `event` to `session` and collect effects
///
/// Key rules:
/// - Nothing happens once the call has ended
/// - Malformed or out-of-place input is dropped, never fatal
/// - Teardown runs once and hands off at most one call record
pub fn reduce(session: &mut CallSession, event: Event, now: Instant) -> Vec<Effect> {
    let mut effects = Vec::new();

    if session.phase == CallPhase::Ended {
        return effects;
    }

    match event {
        Event::Telephony(frame) => on_telephony(session, frame, now, &mut effects),
        Event::MalformedTelephony => {
            session.metrics.malformed_frames += 1;
            log::debug!("Call {}: dropped malformed telephony frame", session.label());
        }
        Event::Realtime(msg) => on_realtime(session, msg, now, &mut effects),
        Event::RealtimeOpened => on_link_opened(session, &mut effects),
        Event::RealtimeAttemptFailed { attempt } => {
            session.reconnect_attempts = attempt;
            log::warn!(
                "Call {}: speech AI dial attempt {} failed",
                session.label(),
                attempt
            );
        }
        Event::RealtimeUnavailable { reason } => {
            log::error!("Call {}: speech AI unavailable: {}", session.label(), reason);
            teardown(session, "speech AI unavailable", now, &mut effects);
        }
        Event::RealtimeClosed => teardown(session, "speech AI socket closed", now, &mut effects),
        Event::TelephonyClosed => teardown(session, "telephony socket closed", now, &mut effects),
        Event::GreetingTimerFired => {
            session.greeting_timer_armed = false;
            if !session.greeting_sent {
                log::debug!(
                    "Call {}: greeting fallback fired (link {:?})",
                    session.label(),
                    session.link.state()
                );
            }
            send_greeting(session, &mut effects);
        }
    }

    effects
}

// ============================================================================
// Telephony side
// ============================================================================

fn on_telephony(
    session: &mut CallSession,
    frame: TelephonyEvent,
    now: Instant,
    effects: &mut Vec<Effect>,
) {
    match frame {
        TelephonyEvent::Connected => log::debug!("Telephony: media stream connected"),
        TelephonyEvent::Start { start } => on_call_start(session, start, now, effects),
        TelephonyEvent::Media { media } => relay_inbound(session, media, effects),
        TelephonyEvent::Mark { mark } => match session.marks.ack() {
            Some(oldest) => {
                session.metrics.marks_acked += 1;
                if oldest != mark.name {
                    log::debug!(
                        "Call {}: mark {} acknowledged out of order (expected {})",
                        session.label(),
                        mark.name,
                        oldest
                    );
                }
            }
            None => log::debug!("Call {}: ack for unknown mark {}", session.label(), mark.name),
        },
        TelephonyEvent::Stop => teardown(session, "caller hung up", now, effects),
        TelephonyEvent::Unknown => {}
    }
}

fn on_call_start(
    session: &mut CallSession,
    start: StartInfo,
    now: Instant,
    effects: &mut Vec<Effect>,
) {
    let Some(next) = session.phase.next(Trigger::CallStarted) else {
        log::warn!(
            "Call {}: ignoring repeated start for stream {}",
            session.label(),
            start.stream_sid
        );
        return;
    };

    session.phase = next;
    session.caller = start.caller().map(str::to_string);
    session.stream_sid = Some(start.stream_sid);
    session.call_sid = start.call_sid;
    session.started_at = Utc::now();
    session.started_instant = now;

    log::info!(
        "Call {}: started (call {}, caller {})",
        session.label(),
        session.call_sid.as_deref().unwrap_or("?"),
        session.caller.as_deref().unwrap_or("unknown")
    );

    if session.link.is_open() {
        send_greeting(session, effects);
    } else if !session.greeting_timer_armed {
        session.greeting_timer_armed = true;
        effects.push(Effect::ArmGreetingTimer(session.config.greeting_fallback));
    }
}

/// Inbound relay: caller audio towards the speech AI
fn relay_inbound(session: &mut CallSession, media: MediaFrame, effects: &mut Vec<Effect>) {
    if !media.is_caller() {
        session.metrics.echo_frames_dropped += 1;
        return;
    }

    if STANDARD.decode(media.payload.as_bytes()).is_err() {
        session.metrics.malformed_frames += 1;
        log::debug!("Call {}: dropped frame with invalid payload", session.label());
        return;
    }

    if let Some(ts) = media.timestamp {
        session.latest_media_ts = ts;
    }

    match session.link.route(ClientMessage::audio_append(media.payload)) {
        (Some(msg), _) => {
            session.metrics.inbound_frames += 1;
            effects.push(Effect::SendRealtime(msg));
        }
        (None, PushOutcome::Queued) => session.metrics.inbound_frames += 1,
        (None, PushOutcome::Evicted) => {
            session.metrics.inbound_frames += 1;
            session.metrics.outbox_overflow += 1;
        }
        (None, PushOutcome::Rejected) => session.metrics.outbox_overflow += 1,
    }
}

// ============================================================================
// Speech AI side
// ============================================================================

fn on_link_opened(session: &mut CallSession, effects: &mut Vec<Effect>) {
    let parked = session.link.open();
    log::info!(
        "Call {}: speech AI link open, flushing {} parked messages",
        session.label(),
        parked.len()
    );

    // Session config always goes first
    effects.push(Effect::SendRealtime(ClientMessage::session_update(
        session.config.session.clone(),
    )));
    effects.extend(parked.into_iter().map(Effect::SendRealtime));

    send_greeting(session, effects);
}

fn on_realtime(
    session: &mut CallSession,
    msg: ServerMessage,
    now: Instant,
    effects: &mut Vec<Effect>,
) {
    match msg {
        ServerMessage::SessionCreated { session: info }
        | ServerMessage::SessionUpdated { session: info } => {
            log::debug!("Call {}: speech AI session {} acknowledged", session.label(), info.id);
        }
        ServerMessage::Error { error } => {
            session.metrics.realtime_errors += 1;
            log::warn!(
                "Call {}: speech AI error ({}): {}",
                session.label(),
                error.error_type,
                error.message
            );
        }
        ServerMessage::SpeechStarted { .. } => on_speech_started(session, now, effects),
        ServerMessage::AudioDelta { delta, item_id } => {
            relay_outbound(session, delta, item_id, now, effects)
        }
        ServerMessage::AudioDone { item_id } => {
            // A late done for an older item must not end the current turn
            let stale = matches!(
                (&item_id, &session.last_assistant_item),
                (Some(done), Some(current)) if done != current
            );
            if !stale {
                finish_turn(session);
            }
        }
        ServerMessage::ResponseDone { response } => {
            let cancelled = response
                .as_ref()
                .and_then(|r| r.status.as_deref())
                .is_some_and(|s| s == "cancelled");
            finish_turn(session);
            session.suppressed_item = None;

            // A later turn completed without the interruption ever being transcribed
            if !cancelled && session.pending_interruption.take().is_some() {
                log::debug!(
                    "Call {}: interruption expired unclassified",
                    session.label()
                );
            }
        }
        ServerMessage::TranscriptionCompleted { transcript, .. } => {
            on_caller_transcript(session, transcript, now, effects)
        }
        ServerMessage::ResponseTextDone { text } => {
            record_transcript(session, Speaker::Assistant, text, now)
        }
        ServerMessage::AudioTranscriptDone { transcript } => {
            record_transcript(session, Speaker::Assistant, transcript, now)
        }
        ServerMessage::SpeechStopped { .. } | ServerMessage::Unknown => {}
    }
}

/// Outbound relay: one media frame plus one paired mark per delta
fn relay_outbound(
    session: &mut CallSession,
    delta: String,
    item_id: Option<String>,
    now: Instant,
    effects: &mut Vec<Effect>,
) {
    let stale = match (&item_id, &session.suppressed_item) {
        (Some(id), Some(suppressed)) => id == suppressed,
        // Until the cancelled response winds up, unlabelled audio can only be its tail
        (None, Some(_)) => session.interrupt_pending(),
        _ => false,
    };
    if stale {
        session.metrics.stale_deltas_dropped += 1;
        return;
    }

    let Some(stream_sid) = session.stream_sid.clone() else {
        log::debug!("Call {}: audio delta before call start dropped", session.label());
        return;
    };

    if session.phase != CallPhase::AiSpeaking {
        let Some(next) = session.phase.next(Trigger::AudioStarted) else {
            return;
        };
        session.phase = next;
        session.ai_speaking_since = Some(now);
        session.response_start_ts = Some(session.latest_media_ts);
        log::debug!(
            "Call {}: assistant speaking from media ts {}",
            session.label(),
            session.latest_media_ts
        );
    }

    if item_id.is_some() {
        session.last_assistant_item = item_id;
    }

    let mark = session.marks.issue();
    effects.push(Effect::SendTelephony(TelephonyCommand::media(
        stream_sid.clone(),
        delta,
    )));
    effects.push(Effect::SendTelephony(TelephonyCommand::mark(stream_sid, mark)));
    session.metrics.audio_deltas += 1;
}

/// Barge-in timing phase
fn on_speech_started(session: &mut CallSession, now: Instant, effects: &mut Vec<Effect>) {
    if session.interrupt_pending() {
        log::debug!("Call {}: speech started while interruption pending", session.label());
        return;
    }

    if !session.is_ai_speaking() {
        return;
    }

    let Some(since) = session.ai_speaking_since else {
        return;
    };

    if !passes_grace_period(since, now, session.config.grace_period) {
        session.metrics.grace_suppressed += 1;
        log::debug!(
            "Call {}: caller speech {:?} into assistant turn ignored",
            session.label(),
            now.saturating_duration_since(since)
        );
        return;
    }

    log::info!(
        "Call {}: barge-in on item {}",
        session.label(),
        session.last_assistant_item.as_deref().unwrap_or("?")
    );

    // Stop generation and flush what the carrier has buffered
    push_realtime(session, ClientMessage::ResponseCancel, effects);
    session.marks.clear();
    if let Some(stream_sid) = &session.stream_sid {
        effects.push(Effect::SendTelephony(TelephonyCommand::clear(
            stream_sid.clone(),
        )));
    }

    if let Some(next) = session.phase.next(Trigger::Interrupted) {
        session.phase = next;
    }
    session.ai_speaking_since = None;
    session.pending_interruption = Some(InterruptedTurn {
        item_id: session.last_assistant_item.clone(),
        response_start_ts: session.response_start_ts,
    });
    session.suppressed_item = session.last_assistant_item.clone();
    session.metrics.barge_ins += 1;
}

/// Barge-in content phase
fn on_caller_transcript(
    session: &mut CallSession,
    transcript: String,
    now: Instant,
    effects: &mut Vec<Effect>,
) {
    let Some(turn) = session.pending_interruption.take() else {
        record_transcript(session, Speaker::Caller, transcript, now);
        return;
    };

    match session.config.interruption.classify(&transcript) {
        Utterance::Backchannel => {
            session.metrics.false_positives += 1;
            log::info!(
                "Call {}: barge-in was a backchannel ({:?})",
                session.label(),
                transcript
            );
        }
        Utterance::Interruption => {
            if let (Some(item_id), Some(start_ts)) = (turn.item_id, turn.response_start_ts) {
                let heard_ms = audio_end_ms(session.latest_media_ts, start_ts);
                log::info!(
                    "Call {}: truncating {} at {}ms",
                    session.label(),
                    item_id,
                    heard_ms
                );

                if session.last_assistant_item.as_deref() == Some(item_id.as_str()) {
                    session.last_assistant_item = None;
                    session.response_start_ts = None;
                }
                push_realtime(session, ClientMessage::truncate(item_id, heard_ms), effects);
                session.metrics.truncates += 1;
            }
        }
    }

    record_transcript(session, Speaker::Caller, transcript, now);
}

fn finish_turn(session: &mut CallSession) {
    if let Some(next) = session.phase.next(Trigger::TurnFinished) {
        session.phase = next;
    }
    session.ai_speaking_since = None;
    session.last_assistant_item = None;
    session.response_start_ts = None;
}

fn record_transcript(session: &mut CallSession, speaker: Speaker, text: String, now: Instant) {
    let event = TranscriptEvent {
        speaker,
        text,
        at: now,
    };
    let policy = session.config.dedup.clone();
    match session.transcript.record(event, policy.as_ref()) {
        DedupDecision::Append => {}
        DedupDecision::Discard | DedupDecision::ReplacePrevious => {
            session.metrics.transcripts_deduplicated += 1;
        }
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Generate the first response, once, after the call has started
fn send_greeting(session: &mut CallSession, effects: &mut Vec<Effect>) {
    if session.greeting_sent || session.stream_sid.is_none() {
        return;
    }
    session.greeting_sent = true;

    let greeting = ClientMessage::response_create(session.config.greeting_instructions.clone());
    push_realtime(session, greeting, effects);
}

/// Send now if the link is open, park otherwise
fn push_realtime(session: &mut CallSession, msg: ClientMessage, effects: &mut Vec<Effect>) {
    match session.link.route(msg) {
        (Some(msg), _) => effects.push(Effect::SendRealtime(msg)),
        (None, PushOutcome::Rejected) => {
            log::debug!("Call {}: speech AI link closed, command dropped", session.label());
        }
        (None, _) => {}
    }
}

fn teardown(session: &mut CallSession, reason: &str, now: Instant, effects: &mut Vec<Effect>) {
    if session.finalized {
        return;
    }
    session.finalized = true;

    if let Some(next) = session.phase.next(Trigger::Hangup) {
        session.phase = next;
    }
    session.ai_speaking_since = None;
    session.link.close();
    session.marks.clear();
    if session.pending_interruption.take().is_some() {
        log::debug!("Call {}: pending interruption never classified", session.label());
    }

    let duration_secs = now.saturating_duration_since(session.started_instant).as_secs();
    log::info!("Call {}: ending ({})", session.label(), reason);
    session.metrics.log_summary(session.label(), duration_secs);

    effects.push(Effect::CloseRealtime);
    effects.push(Effect::CloseTelephony);

    // Nothing worth recording if the call never started
    if session.stream_sid.is_some() {
        effects.push(Effect::RecordCall(build_record(session, duration_secs)));
    }
}

fn build_record(session: &CallSession, duration_secs: u64) -> CallRecord {
    CallRecord {
        caller: session.caller.clone(),
        call_sid: session.call_sid.clone(),
        stream_sid: session.stream_sid.clone(),
        started_at: session.started_at,
        duration_secs,
        transcript: session.transcript.render(),
        fields: extract_fields(session.transcript.caller_lines(), session.caller.as_deref()),
        status: NEW_CALL_STATUS.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ResponseInfo;
    use crate::session::TurnConfig;
    use crate::telephony::MarkInfo;
    use std::collections::HashMap;
    use std::sync::Arc;

    const SID: &str = "MZ123";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn new_session() -> CallSession {
        CallSession::new(Arc::new(TurnConfig::default()))
    }

    fn start_event() -> Event {
        Event::Telephony(TelephonyEvent::Start {
            start: StartInfo {
                stream_sid: SID.to_string(),
                call_sid: Some("CA123".to_string()),
                custom_parameters: HashMap::from([(
                    "callerNumber".to_string(),
                    "+15551234567".to_string(),
                )]),
            },
        })
    }

    fn media(track: &str, ts: u64) -> Event {
        Event::Telephony(TelephonyEvent::Media {
            media: MediaFrame {
                track: Some(track.to_string()),
                timestamp: Some(ts),
                payload: "f39/".to_string(),
            },
        })
    }

    fn mark_ack(name: &str) -> Event {
        Event::Telephony(TelephonyEvent::Mark {
            mark: MarkInfo {
                name: name.to_string(),
            },
        })
    }

    fn delta(item: &str) -> Event {
        Event::Realtime(ServerMessage::AudioDelta {
            delta: "AAAA".to_string(),
            item_id: Some(item.to_string()),
        })
    }

    fn speech_started() -> Event {
        Event::Realtime(ServerMessage::SpeechStarted {
            audio_start_ms: None,
            item_id: None,
        })
    }

    fn transcript(text: &str) -> Event {
        Event::Realtime(ServerMessage::TranscriptionCompleted {
            transcript: text.to_string(),
            item_id: None,
        })
    }

    fn response_done(status: &str) -> Event {
        Event::Realtime(ServerMessage::ResponseDone {
            response: Some(ResponseInfo {
                id: None,
                status: Some(status.to_string()),
            }),
        })
    }

    /// Started call with an open link
    fn live_session(t0: Instant) -> CallSession {
        let mut session = new_session();
        reduce(&mut session, Event::RealtimeOpened, t0);
        reduce(&mut session, start_event(), t0);
        session
    }

    fn count(effects: &[Effect], pred: impl Fn(&Effect) -> bool) -> usize {
        effects.iter().filter(|e| pred(e)).count()
    }

    fn is_cancel(e: &Effect) -> bool {
        matches!(e, Effect::SendRealtime(ClientMessage::ResponseCancel))
    }

    fn is_clear(e: &Effect) -> bool {
        matches!(e, Effect::SendTelephony(TelephonyCommand::Clear { .. }))
    }

    fn is_truncate(e: &Effect) -> bool {
        matches!(e, Effect::SendRealtime(ClientMessage::ItemTruncate { .. }))
    }

    fn is_greeting(e: &Effect) -> bool {
        matches!(e, Effect::SendRealtime(ClientMessage::ResponseCreate { .. }))
    }

    fn is_record(e: &Effect) -> bool {
        matches!(e, Effect::RecordCall(_))
    }

    // =========================================================================
    // Transition table
    // =========================================================================

    #[test]
    fn phase_table() {
        use CallPhase::*;
        assert_eq!(Idle.next(Trigger::CallStarted), Some(Greeting));
        assert_eq!(Idle.next(Trigger::AudioStarted), None);
        assert_eq!(Greeting.next(Trigger::AudioStarted), Some(AiSpeaking));
        assert_eq!(AiSpeaking.next(Trigger::Interrupted), Some(Listening));
        assert_eq!(Listening.next(Trigger::Interrupted), None);
        assert_eq!(AiSpeaking.next(Trigger::TurnFinished), Some(Listening));
        assert_eq!(Listening.next(Trigger::Hangup), Some(Ended));
        assert_eq!(Ended.next(Trigger::Hangup), None);
        assert_eq!(Greeting.next(Trigger::CallStarted), None);
    }

    // =========================================================================
    // Greeting
    // =========================================================================

    #[test]
    fn greeting_fires_once_when_link_opens_before_start() {
        let t0 = Instant::now();
        let mut session = new_session();

        let opened = reduce(&mut session, Event::RealtimeOpened, t0);
        assert!(matches!(
            opened[0],
            Effect::SendRealtime(ClientMessage::SessionUpdate { .. })
        ));
        assert_eq!(count(&opened, is_greeting), 0);

        let started = reduce(&mut session, start_event(), t0 + ms(50));
        assert_eq!(count(&started, is_greeting), 1);
        assert!(!started
            .iter()
            .any(|e| matches!(e, Effect::ArmGreetingTimer(_))));

        let late_timer = reduce(&mut session, Event::GreetingTimerFired, t0 + ms(400));
        assert_eq!(count(&late_timer, is_greeting), 0);
    }

    #[test]
    fn greeting_waits_for_link_when_start_comes_first() {
        let t0 = Instant::now();
        let mut session = new_session();

        let started = reduce(&mut session, start_event(), t0);
        assert!(started
            .iter()
            .any(|e| matches!(e, Effect::ArmGreetingTimer(d) if *d == ms(300))));
        assert_eq!(count(&started, is_greeting), 0);
        assert_eq!(session.phase, CallPhase::Greeting);

        let opened = reduce(&mut session, Event::RealtimeOpened, t0 + ms(100));
        assert!(matches!(
            opened[0],
            Effect::SendRealtime(ClientMessage::SessionUpdate { .. })
        ));
        assert_eq!(count(&opened, is_greeting), 1);

        let timer = reduce(&mut session, Event::GreetingTimerFired, t0 + ms(300));
        assert_eq!(count(&timer, is_greeting), 0);
    }

    #[test]
    fn greeting_timer_parks_command_until_link_opens() {
        let t0 = Instant::now();
        let mut session = new_session();
        reduce(&mut session, start_event(), t0);

        let timer = reduce(&mut session, Event::GreetingTimerFired, t0 + ms(300));
        assert!(timer.is_empty());
        assert!(session.greeting_sent);
        assert_eq!(session.link.buffered(), 1);

        let opened = reduce(&mut session, Event::RealtimeOpened, t0 + ms(900));
        assert_eq!(count(&opened, is_greeting), 1);
        assert!(matches!(
            opened[0],
            Effect::SendRealtime(ClientMessage::SessionUpdate { .. })
        ));
    }

    // =========================================================================
    // Inbound relay
    // =========================================================================

    #[test]
    fn echo_track_is_never_forwarded() {
        let t0 = Instant::now();
        let mut session = live_session(t0);

        let effects = reduce(&mut session, media("outbound", 20), t0);
        assert!(effects.is_empty());
        assert_eq!(session.metrics.echo_frames_dropped, 1);
        assert_eq!(session.latest_media_ts, 0);
    }

    #[test]
    fn caller_audio_is_forwarded_and_timestamp_tracked() {
        let t0 = Instant::now();
        let mut session = live_session(t0);

        let effects = reduce(&mut session, media("inbound", 40), t0);
        assert!(matches!(
            effects.as_slice(),
            [Effect::SendRealtime(ClientMessage::AudioAppend { audio })] if audio == "f39/"
        ));
        assert_eq!(session.latest_media_ts, 40);
    }

    #[test]
    fn caller_audio_is_buffered_in_order_until_open() {
        let t0 = Instant::now();
        let mut session = new_session();
        reduce(&mut session, start_event(), t0);

        assert!(reduce(&mut session, media("inbound", 20), t0).is_empty());
        assert!(reduce(&mut session, media("inbound", 40), t0).is_empty());
        assert_eq!(session.link.buffered(), 2);

        let opened = reduce(&mut session, Event::RealtimeOpened, t0 + ms(100));
        let appends = count(&opened, |e| {
            matches!(e, Effect::SendRealtime(ClientMessage::AudioAppend { .. }))
        });
        assert_eq!(appends, 2);
        // session.update, two frames, then the greeting
        assert!(is_greeting(&opened[3]));
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let t0 = Instant::now();
        let mut session = live_session(t0);

        let bad = Event::Telephony(TelephonyEvent::Media {
            media: MediaFrame {
                track: Some("inbound".to_string()),
                timestamp: Some(20),
                payload: "not base64!".to_string(),
            },
        });
        assert!(reduce(&mut session, bad, t0).is_empty());
        assert!(reduce(&mut session, Event::MalformedTelephony, t0).is_empty());
        assert_eq!(session.metrics.malformed_frames, 2);
        assert_ne!(session.phase, CallPhase::Ended);
    }

    // =========================================================================
    // Outbound relay and marks
    // =========================================================================

    #[test]
    fn delta_relays_media_and_paired_mark() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, media("inbound", 1000), t0);

        let effects = reduce(&mut session, delta("item_1"), t0);
        assert!(matches!(
            &effects[0],
            Effect::SendTelephony(TelephonyCommand::Media { stream_sid, media })
                if stream_sid == SID && media.payload == "AAAA"
        ));
        let queued = session.marks.ack();
        assert!(matches!(
            &effects[1],
            Effect::SendTelephony(TelephonyCommand::Mark { mark, .. })
                if Some(&mark.name) == queued.as_ref()
        ));

        assert!(session.is_ai_speaking());
        assert_eq!(session.response_start_ts, Some(1000));
        assert_eq!(session.last_assistant_item.as_deref(), Some("item_1"));
    }

    #[test]
    fn mark_queue_never_exceeds_unacked_deltas() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        let mut sent = 0usize;
        let mut acked = 0usize;

        let script = ["d", "d", "a", "d", "a", "a", "d", "d", "a"];
        for step in script {
            match step {
                "d" => {
                    reduce(&mut session, delta("item_1"), t0);
                    sent += 1;
                }
                _ => {
                    reduce(&mut session, mark_ack("whatever"), t0);
                    acked += 1;
                }
            }
            assert!(session.marks.len() <= sent.saturating_sub(acked));
        }
    }

    #[test]
    fn ack_with_empty_queue_is_ignored() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        assert!(reduce(&mut session, mark_ack("m"), t0).is_empty());
        assert_eq!(session.metrics.marks_acked, 0);
    }

    #[test]
    fn delta_before_start_is_dropped() {
        let t0 = Instant::now();
        let mut session = new_session();
        reduce(&mut session, Event::RealtimeOpened, t0);

        assert!(reduce(&mut session, delta("item_1"), t0).is_empty());
        assert_eq!(session.phase, CallPhase::Idle);
    }

    #[test]
    fn audio_done_returns_to_listening() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("item_1"), t0);

        let done = Event::Realtime(ServerMessage::AudioDone {
            item_id: Some("item_1".to_string()),
        });
        reduce(&mut session, done, t0 + ms(500));
        assert_eq!(session.phase, CallPhase::Listening);
        assert!(session.last_assistant_item.is_none());
        assert!(session.response_start_ts.is_none());
    }

    // =========================================================================
    // Barge-in timing phase
    // =========================================================================

    #[test]
    fn speech_inside_grace_period_is_ignored() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("item_1"), t0);

        let effects = reduce(&mut session, speech_started(), t0 + ms(150));
        assert_eq!(count(&effects, is_cancel), 0);
        assert_eq!(count(&effects, is_clear), 0);
        assert!(session.is_ai_speaking());
        assert!(!session.interrupt_pending());
    }

    #[test]
    fn speech_after_grace_period_cancels_once() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("item_1"), t0);
        reduce(&mut session, delta("item_1"), t0 + ms(20));

        let effects = reduce(&mut session, speech_started(), t0 + ms(250));
        assert_eq!(count(&effects, is_cancel), 1);
        assert_eq!(count(&effects, is_clear), 1);
        assert!(!session.is_ai_speaking());
        assert!(session.interrupt_pending());
        assert!(session.marks.is_empty());

        // Second signal while pending is a no-op
        let again = reduce(&mut session, speech_started(), t0 + ms(400));
        assert!(again.is_empty());
    }

    #[test]
    fn speech_while_listening_is_ignored() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        assert!(reduce(&mut session, speech_started(), t0 + ms(500)).is_empty());
    }

    #[test]
    fn late_deltas_of_cancelled_item_are_dropped() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("item_1"), t0);
        reduce(&mut session, speech_started(), t0 + ms(300));

        assert!(reduce(&mut session, delta("item_1"), t0 + ms(310)).is_empty());
        assert!(!session.is_ai_speaking());

        reduce(&mut session, response_done("cancelled"), t0 + ms(320));
        let next_turn = reduce(&mut session, delta("item_2"), t0 + ms(900));
        assert_eq!(next_turn.len(), 2);
        assert!(session.is_ai_speaking());
    }

    #[test]
    fn late_unlabelled_deltas_after_cancel_are_dropped() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("item_1"), t0);
        reduce(&mut session, speech_started(), t0 + ms(300));

        let unlabelled = Event::Realtime(ServerMessage::AudioDelta {
            delta: "AAAA".to_string(),
            item_id: None,
        });
        assert!(reduce(&mut session, unlabelled.clone(), t0 + ms(310)).is_empty());
        assert!(!session.is_ai_speaking());
        assert_eq!(session.metrics.stale_deltas_dropped, 1);

        // Once the cancelled response is done, unlabelled audio plays again
        reduce(&mut session, response_done("cancelled"), t0 + ms(320));
        assert_eq!(reduce(&mut session, unlabelled, t0 + ms(900)).len(), 2);
        assert!(session.is_ai_speaking());
    }

    // =========================================================================
    // Barge-in content phase
    // =========================================================================

    #[test]
    fn backchannel_after_barge_in_does_not_truncate() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("abc"), t0);
        reduce(&mut session, speech_started(), t0 + ms(300));

        let effects = reduce(&mut session, transcript("uh-huh, okay"), t0 + ms(900));
        assert_eq!(count(&effects, is_truncate), 0);
        assert!(!session.interrupt_pending());
        assert_eq!(session.metrics.false_positives, 1);
        assert_eq!(session.transcript.len(), 1);
    }

    #[test]
    fn genuine_interruption_truncates_to_heard_audio() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, media("inbound", 1000), t0);
        reduce(&mut session, delta("abc"), t0);
        reduce(&mut session, speech_started(), t0 + ms(300));
        reduce(&mut session, media("inbound", 1450), t0 + ms(450));

        let effects = reduce(&mut session, transcript("Wait, I have a question"), t0 + ms(900));
        let truncates: Vec<&Effect> = effects.iter().filter(|e| is_truncate(e)).collect();
        assert_eq!(truncates.len(), 1);
        assert!(matches!(
            truncates[0],
            Effect::SendRealtime(ClientMessage::ItemTruncate { item_id, audio_end_ms, .. })
                if item_id == "abc" && *audio_end_ms == 450
        ));
        assert!(!session.interrupt_pending());
        assert!(session.last_assistant_item.is_none());
        assert!(session.response_start_ts.is_none());
    }

    #[test]
    fn truncate_survives_cancelled_response_done() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, media("inbound", 1000), t0);
        reduce(&mut session, delta("abc"), t0);
        reduce(&mut session, speech_started(), t0 + ms(300));
        reduce(&mut session, response_done("cancelled"), t0 + ms(320));
        reduce(&mut session, media("inbound", 1450), t0 + ms(450));

        let effects = reduce(&mut session, transcript("No, stop"), t0 + ms(900));
        assert_eq!(count(&effects, is_truncate), 1);
    }

    #[test]
    fn transcript_without_pending_interruption_only_logs() {
        let t0 = Instant::now();
        let mut session = live_session(t0);

        let effects = reduce(&mut session, transcript("I need a quote"), t0);
        assert!(effects.is_empty());
        assert_eq!(session.transcript.render(), "Caller: I need a quote");
    }

    #[test]
    fn identical_transcripts_within_window_logged_once() {
        let t0 = Instant::now();
        let mut session = live_session(t0);

        reduce(&mut session, transcript("My name is Dana"), t0);
        reduce(&mut session, transcript("My name is Dana"), t0 + ms(300));
        assert_eq!(session.transcript.len(), 1);
        assert_eq!(session.metrics.transcripts_deduplicated, 1);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    #[test]
    fn stop_closes_both_sockets_and_records_once() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(
            &mut session,
            Event::Realtime(ServerMessage::AudioTranscriptDone {
                transcript: "Thanks for calling!".to_string(),
            }),
            t0,
        );
        reduce(&mut session, transcript("my name is Dana and I run a bakery"), t0 + ms(2000));

        let effects = reduce(&mut session, Event::Telephony(TelephonyEvent::Stop), t0 + ms(5000));
        assert_eq!(session.phase, CallPhase::Ended);
        assert_eq!(count(&effects, |e| matches!(e, Effect::CloseRealtime)), 1);
        assert_eq!(count(&effects, |e| matches!(e, Effect::CloseTelephony)), 1);
        assert_eq!(count(&effects, is_record), 1);

        match effects.iter().find(|e| is_record(e)) {
            Some(Effect::RecordCall(record)) => {
                assert_eq!(record.duration_secs, 5);
                assert_eq!(record.status, "new");
                assert_eq!(record.caller.as_deref(), Some("+15551234567"));
                assert_eq!(record.fields.name.as_deref(), Some("Dana"));
                assert_eq!(record.fields.business_type.as_deref(), Some("bakery"));
                assert_eq!(record.fields.phone.as_deref(), Some("+15551234567"));
                assert!(record.transcript.starts_with("AI: Thanks for calling!"));
            }
            _ => unreachable!(),
        }

        // Both sockets closing afterwards changes nothing
        assert!(reduce(&mut session, Event::RealtimeClosed, t0 + ms(5001)).is_empty());
        assert!(reduce(&mut session, Event::TelephonyClosed, t0 + ms(5002)).is_empty());
        assert!(reduce(&mut session, delta("late"), t0 + ms(5003)).is_empty());
    }

    #[test]
    fn realtime_closure_tears_down_call() {
        let t0 = Instant::now();
        let mut session = live_session(t0);

        let effects = reduce(&mut session, Event::RealtimeClosed, t0 + ms(10));
        assert_eq!(session.phase, CallPhase::Ended);
        assert!(effects.iter().any(|e| matches!(e, Effect::CloseTelephony)));
        assert_eq!(count(&effects, is_record), 1);
    }

    #[test]
    fn closure_before_start_records_nothing() {
        let t0 = Instant::now();
        let mut session = new_session();

        let effects = reduce(&mut session, Event::TelephonyClosed, t0);
        assert_eq!(session.phase, CallPhase::Ended);
        assert_eq!(count(&effects, is_record), 0);
    }

    #[test]
    fn call_ending_with_pending_interruption_is_fine() {
        let t0 = Instant::now();
        let mut session = live_session(t0);
        reduce(&mut session, delta("abc"), t0);
        reduce(&mut session, speech_started(), t0 + ms(300));

        let effects = reduce(&mut session, Event::Telephony(TelephonyEvent::Stop), t0 + ms(400));
        assert_eq!(count(&effects, is_truncate), 0);
        assert_eq!(count(&effects, is_record), 1);
        assert!(reduce(&mut session, transcript("wait"), t0 + ms(900)).is_empty());
    }

    #[test]
    fn dial_failures_are_counted_then_unavailable_ends_call() {
        let t0 = Instant::now();
        let mut session = new_session();
        reduce(&mut session, start_event(), t0);

        reduce(&mut session, Event::RealtimeAttemptFailed { attempt: 1 }, t0);
        reduce(&mut session, Event::RealtimeAttemptFailed { attempt: 2 }, t0);
        assert_eq!(session.reconnect_attempts, 2);
        assert_ne!(session.phase, CallPhase::Ended);

        let effects = reduce(
            &mut session,
            Event::RealtimeUnavailable {
                reason: "refused".to_string(),
            },
            t0 + ms(100),
        );
        assert_eq!(session.phase, CallPhase::Ended);
        assert_eq!(count(&effects, is_record), 1);
    }
}
