//! Barge-in classification
//!
//! Interrupting the assistant happens in two phases:
//!
//! 1. **Timing**: the realtime API's VAD reports caller speech. If the
//!    assistant has been speaking for at least the grace period, playback is
//!    stopped immediately, before any words are known.
//! 2. **Content**: once the utterance's transcript arrives it is classified.
//!    A short acknowledgment ("yeah", "uh-huh") is a backchannel and needs no
//!    further action. Anything else is a genuine interruption and the
//!    assistant's item is truncated to what the caller actually heard.
//!
//! The word list is a product choice, so classification sits behind
//! [`InterruptionPolicy`].

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Default grace period after the assistant starts speaking
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Longest utterance that can still be a backchannel
pub const DEFAULT_MAX_BACKCHANNEL_TOKENS: usize = 3;

pub const DEFAULT_FILLER_WORDS: &[&str] = &[
    "yes", "yeah", "yep", "yup", "ok", "okay", "uh", "um", "uhm", "huh", "uh-huh", "mhm", "mm",
    "mmm", "hmm", "hm", "right", "sure", "alright", "cool", "great", "nice", "gotcha",
];

/// Outcome of the content phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utterance {
    /// Acknowledgment only; the caller did not mean to take the turn
    Backchannel,
    /// The caller took the turn
    Interruption,
}

/// Decides whether a finalized caller utterance is a backchannel
pub trait InterruptionPolicy: Send + Sync + 'static {
    fn is_backchannel(&self, transcript: &str) -> bool;

    fn classify(&self, transcript: &str) -> Utterance {
        if self.is_backchannel(transcript) {
            Utterance::Backchannel
        } else {
            Utterance::Interruption
        }
    }
}

/// Closed filler-word list with a token limit
#[derive(Debug, Clone)]
pub struct FillerWordPolicy {
    words: HashSet<String>,
    max_tokens: usize,
}

impl FillerWordPolicy {
    pub fn new<I, S>(words: I, max_tokens: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            max_tokens,
        }
    }
}

impl Default for FillerWordPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FILLER_WORDS, DEFAULT_MAX_BACKCHANNEL_TOKENS)
    }
}

impl InterruptionPolicy for FillerWordPolicy {
    fn is_backchannel(&self, transcript: &str) -> bool {
        let tokens: Vec<String> = transcript
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '\'')
                    .trim_matches(|c: char| c == '-' || c == '\'')
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect();

        // Silence or noise that transcribed to nothing
        if tokens.is_empty() {
            return true;
        }

        tokens.len() <= self.max_tokens && tokens.iter().all(|t| self.words.contains(t))
    }
}

/// Timing phase check: has the assistant spoken long enough to be interrupted?
pub fn passes_grace_period(speaking_since: Instant, now: Instant, grace: Duration) -> bool {
    now.saturating_duration_since(speaking_since) >= grace
}

/// Milliseconds of assistant audio the caller heard
pub fn audio_end_ms(current_media_ts: u64, response_start_ts: u64) -> u64 {
    current_media_ts.saturating_sub(response_start_ts)
}
