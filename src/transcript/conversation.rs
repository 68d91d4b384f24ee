//! Running conversation transcript for a call
//!
//! Collects finalized caller and assistant transcripts as they arrive and
//! renders them into the text handed to the call recorder.
//!
//! # Aggregation Strategy
//!
//! - **Finalized only**: partial deltas never reach the log
//! - **Deduplicated**: every entry goes through a [`DedupPolicy`] against the
//!   previous entry of the same speaker

use std::time::Instant;

use super::dedup::{DedupDecision, DedupPolicy};

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Caller,
    Assistant,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Caller => "Caller",
            Speaker::Assistant => "AI",
        }
    }
}

/// A finalized transcript fragment
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub speaker: Speaker,
    pub text: String,
    pub at: Instant,
}

pub type TranscriptEntry = TranscriptEvent;

/// Ordered, deduplicated transcript of one call
#[derive(Debug, Clone, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized transcript
    ///
    /// Blank text is ignored. Returns the decision taken.
    pub fn record(&mut self, event: TranscriptEvent, policy: &dyn DedupPolicy) -> DedupDecision {
        if event.text.trim().is_empty() {
            return DedupDecision::Discard;
        }

        let event = TranscriptEvent {
            text: event.text.trim().to_string(),
            ..event
        };

        let decision = match self
            .entries
            .iter()
            .rev()
            .find(|e| e.speaker == event.speaker)
        {
            Some(previous) => policy.judge(previous, &event),
            None => DedupDecision::Append,
        };

        match decision {
            DedupDecision::Append => self.entries.push(event),
            DedupDecision::Discard => {
                log::debug!("Transcript: dropped duplicate {:?}", event.text);
            }
            DedupDecision::ReplacePrevious => {
                if let Some(previous) = self
                    .entries
                    .iter_mut()
                    .rev()
                    .find(|e| e.speaker == event.speaker)
                {
                    log::debug!(
                        "Transcript: {:?} refined to {:?}",
                        previous.text,
                        event.text
                    );
                    *previous = event;
                }
            }
        }

        decision
    }

    /// Render as `Speaker: text` lines
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.speaker.label(), e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Caller utterances in order
    pub fn caller_lines(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.speaker == Speaker::Caller)
            .map(|e| e.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
