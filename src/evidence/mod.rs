//! Durable as-run evidence.
//!
//! Every observable execution event becomes an `EvidenceRecord`: an envelope
//! with a strictly monotonic per-session sequence and a typed JSON payload.
//! Records append to the spool (durable JSONL + ack file) and stream to Core
//! with at-least-once delivery; Core dedupes on
//! `(channel_id, playout_session_id, sequence)`.

pub mod emitter;
pub mod spool;
pub mod streamer;

pub use emitter::EvidenceEmitter;
pub use spool::{AppendStatus, EvidenceSpool};
pub use streamer::EvidenceStreamer;

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

pub const PAYLOAD_BLOCK_START: &str = "BLOCK_START";
pub const PAYLOAD_SEGMENT_START: &str = "SEGMENT_START";
pub const PAYLOAD_SEGMENT_END: &str = "SEGMENT_END";
pub const PAYLOAD_BLOCK_FENCE: &str = "BLOCK_FENCE";
pub const PAYLOAD_CHANNEL_TERMINATED: &str = "CHANNEL_TERMINATED";

/// Envelope for one evidence event. One JSON object per spool line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub schema_version: u32,
    pub channel_id: String,
    pub playout_session_id: String,
    pub sequence: u64,
    pub event_uuid: String,
    pub emitted_utc: String,
    pub payload_type: String,
    pub payload: serde_json::Value,
}

impl EvidenceRecord {
    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    /// Parse one line; `None` when the line is corrupt or incomplete
    /// (e.g. a partial final write after a crash).
    pub fn from_json_line(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Outcome classification carried by `SEGMENT_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentEndStatus {
    Aired,
    Skipped,
    Truncated,
}

// Payload bodies. All timestamps are epoch ms integers; Core converts to
// ISO-8601 when writing the as-run log.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStartPayload {
    pub block_id: String,
    pub swap_tick: u64,
    pub fence_tick: u64,
    pub actual_start_utc_ms: i64,
    pub primed_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStartPayload {
    pub block_id: String,
    pub event_id: String,
    pub segment_index: i32,
    pub actual_start_utc_ms: i64,
    pub actual_start_frame: i64,
    pub scheduled_duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEndPayload {
    pub block_id: String,
    pub event_id_ref: String,
    pub actual_start_utc_ms: i64,
    pub actual_end_utc_ms: i64,
    pub actual_start_frame: i64,
    pub actual_end_frame: i64,
    /// Wall-clock duration: `end_ms - start_ms`.
    pub computed_duration_ms: i64,
    /// Deterministic duration: `end_frame - start_frame`.
    pub computed_duration_frames: i64,
    pub status: SegmentEndStatus,
    pub reason: String,
    pub fallback_frames_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFencePayload {
    pub block_id: String,
    pub swap_tick: u64,
    pub fence_tick: u64,
    pub actual_end_utc_ms: i64,
    pub ct_at_fence_ms: u64,
    pub total_frames_emitted: u64,
    pub truncated_by_fence: bool,
    pub early_exhaustion: bool,
    pub primed_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelTerminatedPayload {
    pub termination_utc_ms: i64,
    pub reason: String,
    pub detail: String,
}
