//! Evidence emitter: wraps payloads into envelopes, assigns sequence/UUID/
//! timestamp, appends to the spool, and forwards to the live stream.
//!
//! Emission happens only on the tick thread (and once at teardown), so
//! sequence assignment is serialized by construction. Playout is never
//! blocked by evidence I/O: a full spool flips the emitter into degraded
//! mode (logged once on entry and once on exit) and the event is dropped
//! without consuming its sequence number, keeping the spool gap-free.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::spool::{AppendStatus, EvidenceSpool};
use super::{
    BlockFencePayload, BlockStartPayload, ChannelTerminatedPayload, EvidenceRecord,
    SegmentEndPayload, SegmentStartPayload, PAYLOAD_BLOCK_FENCE, PAYLOAD_BLOCK_START,
    PAYLOAD_CHANNEL_TERMINATED, PAYLOAD_SEGMENT_END, PAYLOAD_SEGMENT_START, SCHEMA_VERSION,
};

/// Live-stream hand-off; `None` when no streamer is attached (tests).
pub type LiveSender = tokio::sync::mpsc::UnboundedSender<EvidenceRecord>;

pub struct EvidenceEmitter {
    channel_id: String,
    playout_session_id: String,
    spool: Arc<EvidenceSpool>,
    live_tx: Option<LiveSender>,
    sequence: AtomicU64,
    degraded: AtomicBool,
}

impl EvidenceEmitter {
    pub fn new(spool: Arc<EvidenceSpool>, live_tx: Option<LiveSender>) -> Self {
        Self {
            channel_id: spool.channel_id().to_string(),
            playout_session_id: spool.playout_session_id().to_string(),
            sequence: AtomicU64::new(spool.last_appended_sequence()),
            spool,
            live_tx,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn playout_session_id(&self) -> &str {
        &self.playout_session_id
    }

    /// Current epoch ms (UTC).
    pub fn now_utc_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn emit_block_start(&self, p: &BlockStartPayload) {
        self.emit(PAYLOAD_BLOCK_START, serde_json::to_value(p));
    }

    pub fn emit_segment_start(&self, p: &SegmentStartPayload) {
        self.emit(PAYLOAD_SEGMENT_START, serde_json::to_value(p));
    }

    pub fn emit_segment_end(&self, p: &SegmentEndPayload) {
        self.emit(PAYLOAD_SEGMENT_END, serde_json::to_value(p));
    }

    pub fn emit_block_fence(&self, p: &BlockFencePayload) {
        self.emit(PAYLOAD_BLOCK_FENCE, serde_json::to_value(p));
    }

    pub fn emit_channel_terminated(&self, p: &ChannelTerminatedPayload) {
        self.emit(PAYLOAD_CHANNEL_TERMINATED, serde_json::to_value(p));
        // Termination is the last thing a session says; make it durable now.
        self.spool.flush();
    }

    fn emit(
        &self,
        payload_type: &str,
        payload: std::result::Result<serde_json::Value, serde_json::Error>,
    ) {
        let payload = match payload {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(payload_type, error = %e, "evidence payload serialization failed");
                return;
            }
        };

        let sequence = self.sequence.load(Ordering::Relaxed) + 1;
        let record = EvidenceRecord {
            schema_version: SCHEMA_VERSION,
            channel_id: self.channel_id.clone(),
            playout_session_id: self.playout_session_id.clone(),
            sequence,
            event_uuid: uuid::Uuid::new_v4().to_string(),
            emitted_utc: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            payload_type: payload_type.to_string(),
            payload,
        };

        match self.spool.append(&record) {
            Ok(AppendStatus::Ok) => {
                self.sequence.store(sequence, Ordering::Relaxed);
                if self.degraded.swap(false, Ordering::AcqRel) {
                    tracing::warn!("evidence emitter leaving degraded mode");
                }
                if let Some(tx) = &self.live_tx {
                    let _ = tx.send(record);
                }
            }
            Ok(AppendStatus::SpoolFull) => {
                // The sequence number is not consumed, so later appends stay
                // gap-free.
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        payload_type,
                        "evidence spool full; entering degraded mode (events dropped)"
                    );
                }
            }
            Err(e) => {
                tracing::error!(payload_type, error = %e, "evidence append failed");
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}
