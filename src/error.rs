use thiserror::Error;

/// Main error type for the playout engine
#[derive(Error, Debug)]
pub enum PlayoutError {
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("block plan rejected: {0}")]
    PlanRejected(#[from] PlanRejection),

    #[error("preparation failed: {0}")]
    PreparationFailed(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("asset probe failed: {0}")]
    Probe(String),

    #[error("seek not possible: {0}")]
    SeekNotPossible(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("evidence spool full")]
    SpoolFull,

    #[error("evidence error: {0}")]
    Evidence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Named rejection reasons for block plan validation.
///
/// A plan that fails any of these is refused at ingestion; nothing about it
/// reaches the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanRejection {
    #[error("empty block id")]
    EmptyBlockId,

    #[error("block {block_id}: end_utc_ms {end_utc_ms} must be greater than start_utc_ms {start_utc_ms}")]
    NonPositiveDuration {
        block_id: String,
        start_utc_ms: i64,
        end_utc_ms: i64,
    },

    #[error("block {0}: no segments")]
    NoSegments(String),

    #[error("block {block_id}: segment durations sum to {segment_sum_ms} ms, block duration is {block_duration_ms} ms")]
    DurationMismatch {
        block_id: String,
        segment_sum_ms: i64,
        block_duration_ms: i64,
    },

    #[error("block {block_id}: segment_index {found} at position {position} (expected {expected})")]
    NonMonotonicSegmentIndex {
        block_id: String,
        position: usize,
        expected: i32,
        found: i32,
    },

    #[error("block {block_id}: segment {segment_index} has empty asset_uri")]
    EmptyAssetUri {
        block_id: String,
        segment_index: i32,
    },

    #[error("block {block_id}: segment {segment_index} has non-positive duration {duration_ms} ms")]
    NonPositiveSegmentDuration {
        block_id: String,
        segment_index: i32,
        duration_ms: i64,
    },

    #[error("block {block_id}: segment {segment_index} has negative asset_start_offset_ms {offset_ms}")]
    NegativeAssetOffset {
        block_id: String,
        segment_index: i32,
        offset_ms: i64,
    },

    #[error("next slot occupied (block {occupied_by} already queued)")]
    SlotOccupied { occupied_by: String },
}

/// Why a session left the Running state.
///
/// Every exit path emits `CHANNEL_TERMINATED` carrying one of these reasons
/// before teardown. The string forms are the wire values in evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Fence reached with nothing in the next slot.
    UnderrunNoNextBlock,
    /// Video lookahead could not satisfy a pop after priming.
    VideoUnderflow,
    /// Audio lookahead could not satisfy a pop after priming.
    AudioUnderflow,
    /// A prepared segment result was absent at its boundary tick.
    SeamMiss,
    /// Background preparation rejected the block/segment whose fence arrived.
    PreparationFailed,
    /// The network sink detached (slow consumer or throttle timeout).
    SinkDetached,
    /// External stop request; drained gracefully.
    ExternalStop,
    /// Programmer error detected at runtime.
    InvariantViolation,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::UnderrunNoNextBlock => "UnderrunNoNextBlock",
            TerminationReason::VideoUnderflow => "VideoUnderflow",
            TerminationReason::AudioUnderflow => "AudioUnderflow",
            TerminationReason::SeamMiss => "SeamMiss",
            TerminationReason::PreparationFailed => "PreparationFailed",
            TerminationReason::SinkDetached => "SinkDetached",
            TerminationReason::ExternalStop => "ExternalStop",
            TerminationReason::InvariantViolation => "InvariantViolation",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, PlayoutError>;
