//! Repeated / overlapping transcript suppression
//!
//! The realtime API occasionally finalizes the same caller utterance twice,
//! or first a fragment and then the full sentence. Each new transcript is
//! compared with the previous entry of the same speaker.

use std::time::Duration;

use super::conversation::TranscriptEntry;

/// What to do with a new transcript given the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Append,
    /// Drop the new transcript
    Discard,
    /// The new transcript is a refinement; it takes the previous entry's place
    ReplacePrevious,
}

/// Swappable duplicate-detection heuristic
pub trait DedupPolicy: Send + Sync + 'static {
    fn judge(&self, previous: &TranscriptEntry, next: &TranscriptEntry) -> DedupDecision;
}

/// Time-windowed exact and substring matching
#[derive(Debug, Clone)]
pub struct WindowedDedup {
    /// Identical text inside this window is a duplicate
    pub exact_window: Duration,
    /// Substring overlap inside this window is a refinement
    pub overlap_window: Duration,
}

impl WindowedDedup {
    /// Overlap window is twice the exact window
    pub fn new(exact_window: Duration) -> Self {
        Self {
            exact_window,
            overlap_window: exact_window * 2,
        }
    }
}

impl Default for WindowedDedup {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl DedupPolicy for WindowedDedup {
    fn judge(&self, previous: &TranscriptEntry, next: &TranscriptEntry) -> DedupDecision {
        let elapsed = next.at.saturating_duration_since(previous.at);
        let prev = normalize(&previous.text);
        let new = normalize(&next.text);

        if prev == new && elapsed <= self.exact_window {
            return DedupDecision::Discard;
        }

        // Identical text counts as its own substring here
        if elapsed <= self.overlap_window && !prev.is_empty() && !new.is_empty() {
            if prev.contains(&new) {
                return DedupDecision::Discard;
            }
            if new.contains(&prev) {
                return DedupDecision::ReplacePrevious;
            }
        }

        DedupDecision::Append
    }
}

/// Lowercase, strip punctuation, collapse whitespace
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
