//! FPS-resample gate: maps decoded source frames onto the house output tick
//! grid by PTS comparison.
//!
//! The grid is authoritative: for each output tick the most recent decoded
//! frame with `pts <= tick` is stamped to that tick. Fast sources drop
//! intermediate frames; slow sources repeat the held frame on empty ticks;
//! VFR sources fall out of the same comparison. Stamped PTS is strictly
//! monotonic regardless of source jitter.

use crate::fps::RationalFps;
use crate::media::VideoFrame;

/// Number of consecutive repeat emissions before the freeze-frame warning.
const REPEAT_LOG_THRESHOLD: u64 = 30;

/// One stamped output emission.
#[derive(Debug, Clone)]
pub struct CadenceEmit {
    pub frame: VideoFrame,
    /// True when the same source frame was already emitted for an earlier tick.
    pub repeat: bool,
}

/// Decision for a single decoded frame (diagnostic view of `on_frame`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Frame absorbed as the new held candidate; nothing emitted.
    Hold,
    /// One or more tick-stamped frames emitted.
    Emit,
    /// Resampler inactive (rates match within tolerance); frame passed as-is.
    Pass,
}

pub struct CadenceResolver {
    active: bool,
    tick_interval_us: i64,
    output_fps: RationalFps,
    /// Index of the next unserved output tick (media-time grid).
    next_tick_index: i64,
    /// Grid origin in media time; set by the first admitted frame so seeks
    /// into the middle of an asset align the grid to the content.
    origin_us: Option<i64>,
    held: Option<VideoFrame>,
    held_emitted: bool,
    consecutive_repeats: u64,
    repeat_warned: bool,
    frames_in: u64,
    frames_out: u64,
}

impl CadenceResolver {
    /// `source_fps` of `None` (unknown) activates resampling defensively only
    /// when PTS spacing disagrees with the grid — which the PTS comparison
    /// handles uniformly, so unknown rates simply run the active path.
    pub fn new(source_fps: Option<RationalFps>, output_fps: RationalFps) -> Self {
        let active = match source_fps {
            Some(src) => !src.matches(&output_fps),
            None => true,
        };
        Self {
            active,
            tick_interval_us: output_fps.frame_duration_us(),
            output_fps,
            next_tick_index: 0,
            origin_us: None,
            held: None,
            held_emitted: false,
            consecutive_repeats: 0,
            repeat_warned: false,
            frames_in: 0,
            frames_out: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    fn tick_us(&self, index: i64) -> i64 {
        self.origin_us.unwrap_or(0) + self.output_fps.frame_deadline_ns(index) / 1000
    }

    fn stamp(&mut self, mut frame: VideoFrame, repeat: bool) -> CadenceEmit {
        frame.metadata.pts_us = self.tick_us(self.next_tick_index);
        frame.metadata.duration_us = self.tick_interval_us;
        self.next_tick_index += 1;
        self.frames_out += 1;
        if repeat {
            self.consecutive_repeats += 1;
            if self.consecutive_repeats > REPEAT_LOG_THRESHOLD && !self.repeat_warned {
                tracing::warn!(
                    consecutive_repeats = self.consecutive_repeats,
                    "cadence repeating the same source frame for an extended run"
                );
                self.repeat_warned = true;
            }
        } else {
            self.consecutive_repeats = 0;
            self.repeat_warned = false;
        }
        CadenceEmit { frame, repeat }
    }

    /// Feed one decoded frame; returns the tick-stamped emissions due before
    /// the next decode, plus the decision taken.
    pub fn on_frame(&mut self, frame: VideoFrame) -> (GateDecision, Vec<CadenceEmit>) {
        self.frames_in += 1;

        if !self.active {
            // Same rate: the frame passes untouched, but held/tick state is
            // still maintained so a pad-tail hold-last works uniformly.
            if self.origin_us.is_none() {
                self.origin_us = Some(frame.metadata.pts_us);
            }
            self.held = Some(frame.clone());
            self.held_emitted = true;
            self.next_tick_index += 1;
            self.frames_out += 1;
            return (
                GateDecision::Pass,
                vec![CadenceEmit {
                    frame,
                    repeat: false,
                }],
            );
        }

        if self.origin_us.is_none() {
            self.origin_us = Some(frame.metadata.pts_us);
        }

        let mut emits = Vec::new();
        // Serve every tick that this frame's arrival proves complete: a tick
        // strictly before the new frame's PTS is owned by the held frame.
        while self.tick_us(self.next_tick_index) < frame.metadata.pts_us {
            match self.held.clone() {
                Some(held) => {
                    let repeat = self.held_emitted;
                    emits.push(self.stamp(held, repeat));
                    self.held_emitted = true;
                }
                None => break,
            }
        }
        self.held = Some(frame);
        self.held_emitted = false;

        if emits.is_empty() {
            (GateDecision::Hold, emits)
        } else {
            (GateDecision::Emit, emits)
        }
    }

    /// At source EOF: the held frame still owes its tick.
    pub fn flush(&mut self) -> Option<CadenceEmit> {
        if !self.active {
            return None;
        }
        let held = self.held.clone()?;
        let repeat = self.held_emitted;
        self.held_emitted = true;
        Some(self.stamp(held, repeat))
    }

    /// One more repeat of the held frame (pad-tail hold-last).
    pub fn repeat_held(&mut self) -> Option<CadenceEmit> {
        let held = self.held.clone()?;
        Some(self.stamp(held, true))
    }
}
