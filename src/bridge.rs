//! Per-call runner
//!
//! One task per telephony WebSocket. It owns the [`CallSession`], both
//! sockets and the greeting timer, and funnels everything that happens into
//! [`reduce`] one event at a time. Effects are executed in order; an effect
//! that fails (a send on a dead socket) feeds a closure event back into the
//! reducer before anything else is processed.
//!
//! ```text
//! telephony ws ──┐
//! speech AI rx ──┼──▶ select! ──▶ reduce(session) ──▶ effects ──▶ CallIo
//! dialer ────────┤                    ▲                               │
//! greeting timer ┘                    └──── follow-up events ─────────┘
//! ```

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::realtime::{
    RealtimeEndpoint, RealtimeError, RealtimeSession, ReconnectStrategy, ServerMessage,
};
use crate::recorder::CallRecorder;
use crate::session::CallSession;
use crate::state_machine::{reduce, CallPhase, Effect, Event};
use crate::telephony::TelephonyEvent;
use crate::AppState;

/// Progress reports from the dialer task
enum LinkEvent {
    AttemptFailed { attempt: u32 },
    Opened(RealtimeSession),
    Unavailable(RealtimeError),
}

/// Dial the speech AI in the background so caller audio keeps flowing
fn spawn_dialer(
    endpoint: RealtimeEndpoint,
    strategy: Arc<dyn ReconnectStrategy>,
    tx: mpsc::Sender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let failures = tx.clone();
        let result = RealtimeSession::connect(&endpoint, strategy.as_ref(), |attempt, _| {
            if failures
                .try_send(LinkEvent::AttemptFailed { attempt })
                .is_err()
            {
                log::debug!("Dialer: call loop gone, attempt {} not reported", attempt);
            }
        })
        .await;

        let event = match result {
            Ok(session) => LinkEvent::Opened(session),
            Err(e) => LinkEvent::Unavailable(e),
        };
        // If the call already ended the session is dropped here, which closes it
        let _ = tx.send(event).await;
    })
}

/// Executes reducer effects against the real sockets
struct CallIo {
    telephony: SplitSink<WebSocket, Message>,
    realtime: Option<RealtimeSession>,
    dialer: Option<JoinHandle<()>>,
    recorder: Arc<dyn CallRecorder>,
}

impl CallIo {
    /// Run one effect; a returned event must be fed back into the reducer
    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::SendRealtime(msg) => {
                let Some(realtime) = self.realtime.as_mut() else {
                    log::debug!("Bridge: no speech AI session for {:?}", msg);
                    return None;
                };
                match realtime.send(&msg).await {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("Bridge: speech AI send failed: {}", e);
                        Some(Event::RealtimeClosed)
                    }
                }
            }
            Effect::SendTelephony(cmd) => {
                let json = match serde_json::to_string(&cmd) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Bridge: failed to encode telephony command: {}", e);
                        return None;
                    }
                };
                match self.telephony.send(Message::Text(json.into())).await {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("Bridge: telephony send failed: {}", e);
                        Some(Event::TelephonyClosed)
                    }
                }
            }
            Effect::CloseRealtime => {
                if let Some(dialer) = self.dialer.take() {
                    dialer.abort();
                }
                if let Some(realtime) = self.realtime.take() {
                    realtime.disconnect().await;
                }
                None
            }
            Effect::CloseTelephony => {
                if let Err(e) = self.telephony.close().await {
                    log::debug!("Bridge: telephony close: {}", e);
                }
                None
            }
            Effect::RecordCall(record) => {
                if let Err(e) = self.recorder.record(record).await {
                    log::error!("Bridge: failed to record call: {}", e);
                }
                None
            }
            // Timers live in the call loop
            Effect::ArmGreetingTimer(_) => None,
        }
    }
}

async fn next_server_message(
    rx: &mut Option<mpsc::Receiver<ServerMessage>>,
) -> Option<ServerMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Bridge one phone call until either side goes away
pub async fn run_call(socket: WebSocket, state: AppState) {
    let (telephony_tx, mut telephony_rx) = socket.split();
    let mut session = CallSession::new(state.turn.clone());

    let (link_tx, mut link_rx) = mpsc::channel::<LinkEvent>(8);
    let dialer = spawn_dialer(state.endpoint.clone(), state.reconnect.clone(), link_tx);
    let mut dialing = true;

    let mut io = CallIo {
        telephony: telephony_tx,
        realtime: None,
        dialer: Some(dialer),
        recorder: state.recorder.clone(),
    };
    let mut realtime_rx: Option<mpsc::Receiver<ServerMessage>> = None;
    let mut greeting_timer: Option<Pin<Box<Sleep>>> = None;
    let mut pending: VecDeque<Event> = VecDeque::new();

    log::info!("Bridge: media stream accepted");

    loop {
        let event = tokio::select! {
            frame = telephony_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<TelephonyEvent>(text.as_str()) {
                        Ok(event) => Event::Telephony(event),
                        Err(e) => {
                            log::debug!("Bridge: malformed telephony frame: {}", e);
                            Event::MalformedTelephony
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => Event::TelephonyClosed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::warn!("Bridge: telephony socket error: {}", e);
                    Event::TelephonyClosed
                }
            },
            link = link_rx.recv(), if dialing => match link {
                Some(LinkEvent::AttemptFailed { attempt }) => {
                    Event::RealtimeAttemptFailed { attempt }
                }
                Some(LinkEvent::Opened(mut realtime)) => {
                    dialing = false;
                    log::info!("Bridge: speech AI session {}", realtime.session_id());
                    realtime_rx = realtime.take_incoming_receiver();
                    io.realtime = Some(realtime);
                    Event::RealtimeOpened
                }
                Some(LinkEvent::Unavailable(e)) => {
                    dialing = false;
                    Event::RealtimeUnavailable { reason: e.to_string() }
                }
                None => {
                    dialing = false;
                    continue;
                }
            },
            msg = next_server_message(&mut realtime_rx) => match msg {
                Some(msg) => Event::Realtime(msg),
                None => {
                    realtime_rx = None;
                    Event::RealtimeClosed
                }
            },
            _ = wait_timer(&mut greeting_timer) => {
                greeting_timer = None;
                Event::GreetingTimerFired
            }
        };

        pending.push_back(event);
        while let Some(event) = pending.pop_front() {
            let before = session.phase;
            let effects = reduce(&mut session, event, Instant::now());
            if session.phase != before {
                log::debug!(
                    "Call {}: phase {:?} -> {:?}",
                    session.label(),
                    before,
                    session.phase
                );
            }

            for effect in effects {
                match effect {
                    Effect::ArmGreetingTimer(after) => {
                        greeting_timer = Some(Box::pin(tokio::time::sleep(after)));
                    }
                    other => {
                        if let Some(follow_up) = io.execute(other).await {
                            pending.push_back(follow_up);
                        }
                    }
                }
            }
        }

        if session.phase == CallPhase::Ended {
            break;
        }
    }

    log::info!("Bridge: call {} finished", session.label());
}
