//! Pre-open message buffer for the Speech-AI link
//!
//! Caller audio starts flowing as soon as the phone leg connects, which is
//! usually before the realtime socket has finished its handshake. Messages
//! are parked here in order and flushed once the socket opens.
//!
//! # Memory Budget
//!
//! Telephony frames are 20ms of 8kHz µ-law (160 bytes, ~216 base64 chars):
//! - 500 messages ≈ 10 seconds ≈ 110 KB
//!
//! When full, the [`OverflowPolicy`] decides what gives. Control commands
//! (greeting, etc.) are never evicted.

use std::collections::VecDeque;

use super::protocol::ClientMessage;

/// What to do when the outbox is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered audio frame to make room
    #[default]
    DropOldest,
    /// Refuse the incoming audio frame
    Reject,
}

/// Result of pushing into the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest audio frame
    Evicted,
    /// Not queued
    Rejected,
}

/// Bounded FIFO of messages waiting for the socket to open
///
/// Thread-safety: This struct is NOT internally synchronized. It lives
/// inside a single call session.
#[derive(Debug)]
pub struct Outbox {
    messages: VecDeque<ClientMessage>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl Outbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            policy,
        }
    }

    /// Queue a message, applying the overflow policy to audio frames
    pub fn push(&mut self, msg: ClientMessage) -> PushOutcome {
        if self.messages.len() < self.capacity || !msg.is_audio() {
            self.messages.push_back(msg);
            return PushOutcome::Queued;
        }

        match self.policy {
            OverflowPolicy::Reject => PushOutcome::Rejected,
            OverflowPolicy::DropOldest => {
                match self.messages.iter().position(ClientMessage::is_audio) {
                    Some(oldest) => {
                        self.messages.remove(oldest);
                        self.messages.push_back(msg);
                        PushOutcome::Evicted
                    }
                    // Full of control commands; nothing to evict
                    None => PushOutcome::Rejected,
                }
            }
        }
    }

    /// Drain all messages in arrival order
    ///
    /// The outbox will be empty after this call.
    pub fn drain_all(&mut self) -> Vec<ClientMessage> {
        self.messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Connection state of the Speech-AI socket as seen by the call session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

/// Speech-AI connection state plus its pre-open outbox
#[derive(Debug)]
pub struct SpeechAiLink {
    state: LinkState,
    outbox: Outbox,
}

impl SpeechAiLink {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            state: LinkState::Connecting,
            outbox,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Route a message: returned if it can go out now, parked otherwise
    ///
    /// Messages for a closed link are dropped.
    pub fn route(&mut self, msg: ClientMessage) -> (Option<ClientMessage>, PushOutcome) {
        match self.state {
            LinkState::Open => (Some(msg), PushOutcome::Queued),
            LinkState::Connecting => (None, self.outbox.push(msg)),
            LinkState::Closed => (None, PushOutcome::Rejected),
        }
    }

    /// Mark the link open and hand back everything parked so far
    pub fn open(&mut self) -> Vec<ClientMessage> {
        self.state = LinkState::Open;
        self.outbox.drain_all()
    }

    /// Mark the link closed and discard anything parked
    pub fn close(&mut self) {
        self.state = LinkState::Closed;
        self.outbox.clear();
    }

    pub fn buffered(&self) -> usize {
        self.outbox.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(tag: &str) -> ClientMessage {
        ClientMessage::audio_append(tag)
    }

    fn payload(msg: &ClientMessage) -> &str {
        match msg {
            ClientMessage::AudioAppend { audio } => audio,
            _ => "<control>",
        }
    }

    #[test]
    fn test_outbox_preserves_order() {
        let mut outbox = Outbox::new(10, OverflowPolicy::DropOldest);
        outbox.push(audio("a"));
        outbox.push(audio("b"));
        outbox.push(audio("c"));

        let drained = outbox.drain_all();
        let order: Vec<&str> = drained.iter().map(payload).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_drop_oldest_evicts_audio() {
        let mut outbox = Outbox::new(3, OverflowPolicy::DropOldest);
        for tag in ["a", "b", "c"] {
            assert_eq!(outbox.push(audio(tag)), PushOutcome::Queued);
        }
        assert_eq!(outbox.push(audio("d")), PushOutcome::Evicted);
        assert_eq!(outbox.len(), 3);

        let drained = outbox.drain_all();
        let order: Vec<&str> = drained.iter().map(payload).collect();
        assert_eq!(order, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_drop_oldest_skips_control_commands() {
        let mut outbox = Outbox::new(2, OverflowPolicy::DropOldest);
        outbox.push(ClientMessage::response_create(None));
        outbox.push(audio("a"));
        assert_eq!(outbox.push(audio("b")), PushOutcome::Evicted);

        let drained = outbox.drain_all();
        assert!(matches!(drained[0], ClientMessage::ResponseCreate { .. }));
        assert_eq!(payload(&drained[1]), "b");
    }

    #[test]
    fn test_reject_policy_keeps_existing() {
        let mut outbox = Outbox::new(2, OverflowPolicy::Reject);
        outbox.push(audio("a"));
        outbox.push(audio("b"));
        assert_eq!(outbox.push(audio("c")), PushOutcome::Rejected);

        let drained = outbox.drain_all();
        let order: Vec<&str> = drained.iter().map(payload).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_control_commands_bypass_capacity() {
        let mut outbox = Outbox::new(1, OverflowPolicy::Reject);
        outbox.push(audio("a"));
        assert_eq!(
            outbox.push(ClientMessage::response_create(None)),
            PushOutcome::Queued
        );
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn test_link_buffers_until_open() {
        let mut link = SpeechAiLink::new(Outbox::new(10, OverflowPolicy::DropOldest));
        assert_eq!(link.state(), LinkState::Connecting);

        let (now, _) = link.route(audio("a"));
        assert!(now.is_none());
        assert_eq!(link.buffered(), 1);

        let flushed = link.open();
        assert_eq!(flushed.len(), 1);
        assert!(link.is_open());

        let (now, _) = link.route(audio("b"));
        assert!(now.is_some());
        assert_eq!(link.buffered(), 0);
    }

    #[test]
    fn test_closed_link_discards() {
        let mut link = SpeechAiLink::new(Outbox::new(10, OverflowPolicy::DropOldest));
        link.route(audio("a"));
        link.close();
        assert_eq!(link.buffered(), 0);

        let (now, outcome) = link.route(audio("b"));
        assert!(now.is_none());
        assert_eq!(outcome, PushOutcome::Rejected);
    }
}
