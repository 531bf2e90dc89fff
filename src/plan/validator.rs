//! Block plan acceptance rules.
//!
//! Every rule maps to a named `PlanRejection`; a plan is either fully
//! accepted (with boundaries derived) or refused with the first violation.

use crate::error::PlanRejection;

use super::{BlockPlan, SegmentBoundary, ValidatedBlock};

/// Validate a plan and derive its segment boundaries.
///
/// Rules, in order:
/// - non-empty `block_id`
/// - `end_utc_ms > start_utc_ms`
/// - at least one segment
/// - `segment_index` monotonic from 0
/// - non-empty `asset_uri`, `duration_ms > 0`, `asset_start_offset_ms >= 0`
/// - segment durations sum exactly to the block duration (hard fence equality)
pub fn validate_plan(plan: BlockPlan) -> Result<ValidatedBlock, PlanRejection> {
    if plan.block_id.is_empty() {
        return Err(PlanRejection::EmptyBlockId);
    }
    if plan.end_utc_ms <= plan.start_utc_ms {
        return Err(PlanRejection::NonPositiveDuration {
            block_id: plan.block_id.clone(),
            start_utc_ms: plan.start_utc_ms,
            end_utc_ms: plan.end_utc_ms,
        });
    }
    if plan.segments.is_empty() {
        return Err(PlanRejection::NoSegments(plan.block_id.clone()));
    }

    let mut sum_ms = 0i64;
    for (position, seg) in plan.segments.iter().enumerate() {
        let expected = position as i32;
        if seg.segment_index != expected {
            return Err(PlanRejection::NonMonotonicSegmentIndex {
                block_id: plan.block_id.clone(),
                position,
                expected,
                found: seg.segment_index,
            });
        }
        if seg.asset_uri.is_empty() {
            return Err(PlanRejection::EmptyAssetUri {
                block_id: plan.block_id.clone(),
                segment_index: seg.segment_index,
            });
        }
        if seg.duration_ms <= 0 {
            return Err(PlanRejection::NonPositiveSegmentDuration {
                block_id: plan.block_id.clone(),
                segment_index: seg.segment_index,
                duration_ms: seg.duration_ms,
            });
        }
        if seg.asset_start_offset_ms < 0 {
            return Err(PlanRejection::NegativeAssetOffset {
                block_id: plan.block_id.clone(),
                segment_index: seg.segment_index,
                offset_ms: seg.asset_start_offset_ms,
            });
        }
        sum_ms += seg.duration_ms;
    }

    let block_duration_ms = plan.duration_ms();
    if sum_ms != block_duration_ms {
        return Err(PlanRejection::DurationMismatch {
            block_id: plan.block_id.clone(),
            segment_sum_ms: sum_ms,
            block_duration_ms,
        });
    }

    // Boundaries are contiguous by construction: each segment starts where
    // the previous one ended.
    let mut boundaries = Vec::with_capacity(plan.segments.len());
    let mut ct = 0i64;
    for seg in &plan.segments {
        boundaries.push(SegmentBoundary {
            segment_index: seg.segment_index,
            start_ct_ms: ct,
            end_ct_ms: ct + seg.duration_ms,
        });
        ct += seg.duration_ms;
    }

    Ok(ValidatedBlock { plan, boundaries })
}
