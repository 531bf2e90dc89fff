//! Block plans: the unit of work Core feeds the engine.
//!
//! A block is a contiguous wall-clock interval composed of segments; segment
//! boundaries are precomputed in channel-time (CT) so the tick loop does a
//! single range lookup per tick.

mod queue;
mod validator;

pub use queue::BlockPlanQueue;
pub use validator::validate_plan;

use serde::{Deserialize, Serialize};

/// Playback classification of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Content,
    Pad,
}

impl Default for SegmentType {
    fn default() -> Self {
        SegmentType::Content
    }
}

/// One playback unit inside a block: an asset at an offset for a duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_index: i32,
    pub asset_uri: String,
    pub asset_start_offset_ms: i64,
    pub duration_ms: i64,
    #[serde(default)]
    pub segment_type: SegmentType,
    /// Event id from the transmission log, echoed in segment evidence.
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub looping: bool,
}

impl Segment {
    /// True when two segments decode from the same source position, meaning
    /// no seam preparation is needed between them.
    pub fn same_source(&self, other: &Segment) -> bool {
        self.asset_uri == other.asset_uri
            && self.asset_start_offset_ms == other.asset_start_offset_ms
    }
}

/// The structured message Core sends: a block id, wall-clock bounds, and an
/// ordered segment list whose durations exactly tile the interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPlan {
    pub block_id: String,
    pub start_utc_ms: i64,
    pub end_utc_ms: i64,
    pub segments: Vec<Segment>,
}

impl BlockPlan {
    pub fn duration_ms(&self) -> i64 {
        self.end_utc_ms - self.start_utc_ms
    }
}

/// Derived CT range of one segment. The range is right-open; the final
/// segment's `end_ct_ms` equals the block duration (the exclusive fence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBoundary {
    pub segment_index: i32,
    pub start_ct_ms: i64,
    pub end_ct_ms: i64,
}

impl SegmentBoundary {
    pub fn contains(&self, ct_ms: i64) -> bool {
        ct_ms >= self.start_ct_ms && ct_ms < self.end_ct_ms
    }
}

/// A plan that passed validation, with boundaries precomputed.
#[derive(Debug, Clone)]
pub struct ValidatedBlock {
    pub plan: BlockPlan,
    pub boundaries: Vec<SegmentBoundary>,
}

impl ValidatedBlock {
    /// Segment owning `ct_ms`, or `None` past the fence.
    pub fn segment_index_at(&self, ct_ms: i64) -> Option<i32> {
        self.boundaries
            .iter()
            .find(|b| b.contains(ct_ms))
            .map(|b| b.segment_index)
    }

    pub fn segment(&self, segment_index: i32) -> Option<&Segment> {
        self.plan
            .segments
            .iter()
            .find(|s| s.segment_index == segment_index)
    }

    pub fn boundary(&self, segment_index: i32) -> Option<&SegmentBoundary> {
        self.boundaries
            .iter()
            .find(|b| b.segment_index == segment_index)
    }

    pub fn duration_ms(&self) -> i64 {
        self.plan.duration_ms()
    }

    pub fn block_id(&self) -> &str {
        &self.plan.block_id
    }

    /// Wrap a single segment as a standalone block for seam preparation.
    /// The preparer opens decoders against blocks; a mid-block segment swap
    /// hands it this synthetic one-segment view.
    pub fn for_single_segment(&self, segment_index: i32) -> Option<ValidatedBlock> {
        let seg = self.segment(segment_index)?.clone();
        let bound = self.boundary(segment_index)?;
        let duration = bound.end_ct_ms - bound.start_ct_ms;
        let plan = BlockPlan {
            block_id: self.plan.block_id.clone(),
            start_utc_ms: self.plan.start_utc_ms + bound.start_ct_ms,
            end_utc_ms: self.plan.start_utc_ms + bound.end_ct_ms,
            segments: vec![Segment {
                segment_index: seg.segment_index,
                ..seg
            }],
        };
        Some(ValidatedBlock {
            plan,
            boundaries: vec![SegmentBoundary {
                segment_index,
                start_ct_ms: 0,
                end_ct_ms: duration,
            }],
        })
    }
}

#[cfg(test)]
pub(crate) fn test_plan(block_id: &str, start: i64, segs: &[(&str, i64, i64)]) -> BlockPlan {
    let mut segments = Vec::new();
    let mut total = 0i64;
    for (i, (uri, offset, dur)) in segs.iter().enumerate() {
        segments.push(Segment {
            segment_index: i as i32,
            asset_uri: uri.to_string(),
            asset_start_offset_ms: *offset,
            duration_ms: *dur,
            segment_type: SegmentType::Content,
            event_id: format!("ev-{}-{}", block_id, i),
            looping: false,
        });
        total += dur;
    }
    BlockPlan {
        block_id: block_id.to_string(),
        start_utc_ms: start,
        end_utc_ms: start + total,
        segments,
    }
}
