//! Call transcript handling
//!
//! Finalized caller and assistant transcripts are deduplicated into a
//! per-call log. At teardown the log is rendered and mined for lead fields.

mod conversation;
mod dedup;
mod extract;

pub use conversation::{Speaker, TranscriptEntry, TranscriptEvent, TranscriptLog};
pub use dedup::{normalize, DedupDecision, DedupPolicy, WindowedDedup};
pub use extract::{extract_fields, ExtractedFields};
