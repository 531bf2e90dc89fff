//! The pipeline manager: a single tick thread that turns validated block
//! plans into a continuous, wall-clock-paced A/V stream.
//!
//! Per tick: fence check (commit the prepared next block or terminate),
//! segment-boundary lookup (seam swap via prepared results), clock wait, one
//! video pop, one exact-size audio pop, one sink emit. All fence and
//! boundary decisions are exact integer arithmetic over the rational FPS;
//! UTC appears only in evidence. Any contract the loop cannot satisfy
//! terminates the session immediately — no silence, no hold-last, no
//! filler at this layer.

pub mod metrics;

pub use metrics::PipelineMetrics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::audio::AudioBufferConfig;
use crate::buffer::video::VideoBufferConfig;
use crate::buffer::{AudioLookaheadBuffer, VideoLookaheadBuffer};
use crate::clock::SessionClock;
use crate::decode::{DecoderFactory, OutputGeometry};
use crate::error::{Result, TerminationReason};
use crate::evidence::{
    BlockFencePayload, BlockStartPayload, ChannelTerminatedPayload, EvidenceEmitter,
    SegmentEndPayload, SegmentEndStatus, SegmentStartPayload,
};
use crate::plan::{validate_plan, BlockPlan, BlockPlanQueue, ValidatedBlock};
use crate::prepare::{ProducerPreloader, SeamPreparer, SeamRequest, SeamRequestType};
use crate::sink::{OutputSink, SinkEmitError};

/// Immutable per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub channel_id: String,
    pub playout_session_id: String,
    pub geometry: OutputGeometry,
    pub min_audio_prime_ms: i64,
    pub audio_config: AudioBufferConfig,
    pub video_config: VideoBufferConfig,
}

struct Shared {
    queue: BlockPlanQueue,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    metrics: Mutex<PipelineMetrics>,
    termination: Mutex<Option<(TerminationReason, String)>>,
}

/// Everything the tick thread takes ownership of at start.
struct Startup {
    clock: SessionClock,
    sink: Box<dyn OutputSink>,
    emitter: Arc<EvidenceEmitter>,
    factory: Arc<dyn DecoderFactory>,
}

pub struct PipelineManager {
    ctx: SessionContext,
    shared: Arc<Shared>,
    startup: Option<Startup>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineManager {
    pub fn new(
        ctx: SessionContext,
        clock: SessionClock,
        sink: Box<dyn OutputSink>,
        emitter: Arc<EvidenceEmitter>,
        factory: Arc<dyn DecoderFactory>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: BlockPlanQueue::new(),
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            metrics: Mutex::new(PipelineMetrics {
                channel_id: ctx.channel_id.clone(),
                ..Default::default()
            }),
            termination: Mutex::new(None),
        });
        Self {
            ctx,
            shared,
            startup: Some(Startup {
                clock,
                sink,
                emitter,
                factory,
            }),
            thread: None,
        }
    }

    /// Validate and enqueue a block plan from Core. Fails with a named
    /// rejection, including when the two-slot lookahead is full.
    pub fn submit_block(&self, plan: BlockPlan) -> Result<()> {
        let validated = validate_plan(plan)?;
        tracing::info!(
            block_id = validated.block_id(),
            duration_ms = validated.duration_ms(),
            segments = validated.plan.segments.len(),
            "block plan accepted"
        );
        self.shared.queue.enqueue(validated)?;
        Ok(())
    }

    /// Spawn the tick thread. Idempotent.
    pub fn start(&mut self) {
        let Some(startup) = self.startup.take() else {
            return;
        };
        self.shared.stop.store(false, Ordering::Release);
        let ctx = self.ctx.clone();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("pipeline-tick".into())
            .spawn(move || {
                let factory = Arc::clone(&startup.factory);
                let mut runner = SessionRunner {
                    preparer: SeamPreparer::new(factory),
                    preloader: ProducerPreloader::new(),
                    audio: Arc::new(AudioLookaheadBuffer::new(ctx.audio_config)),
                    video: None,
                    retired_fills: Vec::new(),
                    live: None,
                    tick: 0,
                    block_prep_submitted: None,
                    clock: startup.clock,
                    sink: startup.sink,
                    emitter: startup.emitter,
                    factory: startup.factory,
                    ctx,
                    shared,
                };
                runner.run();
            })
            .expect("spawn pipeline tick thread");
        self.thread = Some(handle);
    }

    /// Request stop and join the tick thread (which joins everything it
    /// owns). Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.shared.metrics.lock().clone()
    }

    /// Set once the session has terminated, with the recorded reason.
    pub fn termination(&self) -> Option<(TerminationReason, String)> {
        self.shared.termination.lock().clone()
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Live-block bookkeeping on the tick thread.
struct LiveBlock {
    block: ValidatedBlock,
    start_tick: i64,
    fence_tick: i64,
    swap_tick: i64,
    primed_success: bool,
    current_segment: i32,
    segment_start_tick: i64,
    segment_start_utc_ms: i64,
    segment_fallback_base: u64,
    /// Segment index whose seam prep is in flight (at most one per block).
    segment_prep_submitted: Option<i32>,
}

struct SessionRunner {
    ctx: SessionContext,
    shared: Arc<Shared>,
    clock: SessionClock,
    sink: Box<dyn OutputSink>,
    emitter: Arc<EvidenceEmitter>,
    factory: Arc<dyn DecoderFactory>,
    preparer: SeamPreparer,
    preloader: ProducerPreloader,
    audio: Arc<AudioLookaheadBuffer>,
    video: Option<Arc<VideoLookaheadBuffer>>,
    retired_fills: Vec<JoinHandle<()>>,
    live: Option<LiveBlock>,
    tick: i64,
    block_prep_submitted: Option<String>,
}

type Exit = (TerminationReason, String);

impl SessionRunner {
    fn run(&mut self) {
        self.shared.running.store(true, Ordering::Release);
        let (reason, detail) = match self.session() {
            Ok(exit) | Err(exit) => exit,
        };

        // Close an open segment truthfully before the terminal record.
        if let Some(live) = self.live.take() {
            let end_utc = self
                .clock
                .is_started()
                .then(|| self.clock.frame_utc_ms(self.tick))
                .unwrap_or_else(EvidenceEmitter::now_utc_ms);
            self.close_segment(
                &live,
                end_utc,
                SegmentEndStatus::Truncated,
                reason.as_str(),
            );
        }

        tracing::error!(
            channel_id = %self.ctx.channel_id,
            reason = %reason,
            detail = %detail,
            tick = self.tick,
            "channel terminated"
        );
        self.emitter.emit_channel_terminated(&ChannelTerminatedPayload {
            termination_utc_ms: EvidenceEmitter::now_utc_ms(),
            reason: reason.as_str().to_string(),
            detail: detail.clone(),
        });
        *self.shared.termination.lock() = Some((reason, detail));

        self.teardown();
        self.shared.running.store(false, Ordering::Release);
    }

    /// The session body. `Ok` carries the graceful-stop exit; `Err` carries
    /// a fault exit — both feed the same terminal evidence path.
    fn session(&mut self) -> std::result::Result<Exit, Exit> {
        let stop = Arc::clone(&self.shared.stop);
        let fps = self.ctx.geometry.fps;
        let sample_rate = self.ctx.audio_config.sample_rate as i64;

        // Wait for the first block (blocks are fed just-in-time).
        let first = loop {
            if stop.load(Ordering::Acquire) {
                return Ok((TerminationReason::ExternalStop, "stop before first block".into()));
            }
            if let Some(b) = self.shared.queue.take_current() {
                break b;
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        // Preload the first block off-thread, then adopt the ready source.
        self.preloader.start_preload(
            &first,
            self.ctx.geometry,
            self.ctx.min_audio_prime_ms,
            Arc::clone(&self.factory),
        );
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok((TerminationReason::ExternalStop, "stop during preload".into()));
            }
            if self.preloader.is_ready() {
                break;
            }
            if self.preloader.has_failed() {
                return Err((
                    TerminationReason::PreparationFailed,
                    format!("first block {} failed preparation", first.block_id()),
                ));
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let producer = self.preloader.take_source().ok_or((
            TerminationReason::PreparationFailed,
            "preloaded source vanished before take".to_string(),
        ))?;
        let frames_per_block = producer.frames_per_block();
        let prime_depth_ms = producer.audio_prime_depth_ms();

        self.audio.reset();
        let video = Arc::new(VideoLookaheadBuffer::new(self.ctx.video_config, fps));
        Arc::clone(&video).start_filling(producer, Arc::clone(&self.audio), Arc::clone(&stop));
        self.video = Some(Arc::clone(&video));

        // Anchors are captured only now, after all blocking setup I/O, so
        // tick 0 is not born late.
        self.clock
            .start()
            .map_err(|e| (TerminationReason::InvariantViolation, e.to_string()))?;

        let start_utc = self.clock.frame_utc_ms(0);
        self.emitter.emit_block_start(&BlockStartPayload {
            block_id: first.block_id().to_string(),
            swap_tick: 0,
            fence_tick: frames_per_block as u64,
            actual_start_utc_ms: start_utc,
            primed_success: prime_depth_ms >= self.ctx.min_audio_prime_ms,
        });
        self.live = Some(LiveBlock {
            start_tick: 0,
            fence_tick: frames_per_block,
            swap_tick: 0,
            primed_success: prime_depth_ms >= self.ctx.min_audio_prime_ms,
            current_segment: 0,
            segment_start_tick: 0,
            segment_start_utc_ms: start_utc,
            segment_fallback_base: 0,
            segment_prep_submitted: None,
            block: first,
        });
        self.emit_segment_start(0, start_utc);
        self.submit_next_segment_seam();

        tracing::info!(
            channel_id = %self.ctx.channel_id,
            fps = %fps,
            frames_per_block,
            prime_depth_ms,
            "session running"
        );

        // The tick loop.
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok((TerminationReason::ExternalStop, "external stop".into()));
            }

            self.kickoff_next_block_prep();

            // 1-2. Fence arithmetic, commit or terminate.
            let (start_tick, duration_ms) = {
                let live = self.live_ref()?;
                (live.start_tick, live.block.duration_ms())
            };
            if fps.tick_to_ct_ms(self.tick - start_tick) >= duration_ms {
                self.commit_at_fence()?;
            }

            // 3. Segment boundary lookup and seam handling.
            self.check_segment_seam()?;

            // 4. Wait for this frame's deadline.
            self.clock
                .wait_for_frame(self.tick)
                .map_err(|e| (TerminationReason::InvariantViolation, e.to_string()))?;

            // 5. One video frame.
            let video = Arc::clone(self.video.as_ref().ok_or((
                TerminationReason::InvariantViolation,
                "tick with no video buffer".to_string(),
            ))?);
            let vframe = video.try_pop_frame().ok_or_else(|| {
                (
                    TerminationReason::VideoUnderflow,
                    format!("video lookahead empty at tick {}", self.tick),
                )
            })?;

            // 6. Exactly this tick's worth of audio samples.
            let samples = fps.samples_for_tick(self.tick, sample_rate) as usize;
            let aframe = self.audio.try_pop_samples(samples).ok_or_else(|| {
                (
                    TerminationReason::AudioUnderflow,
                    format!(
                        "audio lookahead below {} samples at tick {} (depth {} ms)",
                        samples,
                        self.tick,
                        self.audio.depth_ms()
                    ),
                )
            })?;

            // 7. Hand off to the network sink.
            let pts_90k = self.clock.frame_pts_90k(self.tick);
            match self.sink.emit(&vframe.frame, &aframe, pts_90k) {
                Ok(()) => {}
                Err(SinkEmitError::Detached) => {
                    return Err((
                        TerminationReason::SinkDetached,
                        format!("sink detached at tick {}", self.tick),
                    ));
                }
                Err(SinkEmitError::Closed) => {
                    return Err((
                        TerminationReason::SinkDetached,
                        format!("sink closed at tick {}", self.tick),
                    ));
                }
            }

            // 8. Advance.
            self.tick += 1;
            self.after_tick_housekeeping(&video);
        }
    }

    fn live_ref(&self) -> std::result::Result<&LiveBlock, Exit> {
        self.live.as_ref().ok_or((
            TerminationReason::InvariantViolation,
            "tick loop with no live block".to_string(),
        ))
    }

    /// TAKE-at-commit. The tick whose channel-time crosses the block
    /// duration is the fence: the frame emitted at this tick must come from
    /// the next block, so the swap happens before any pop.
    fn commit_at_fence(&mut self) -> std::result::Result<(), Exit> {
        let live = self.live.take().ok_or((
            TerminationReason::InvariantViolation,
            "fence with no live block".to_string(),
        ))?;
        let fps = self.ctx.geometry.fps;
        let fence_utc = self.clock.frame_utc_ms(self.tick);
        let old_video = Arc::clone(self.video.as_ref().ok_or((
            TerminationReason::InvariantViolation,
            "fence with no video buffer".to_string(),
        ))?);

        // Close the old block's evidence regardless of what happens next.
        self.close_segment(&live, fence_utc, SegmentEndStatus::Aired, "");
        self.emit_block_fence(&live, fence_utc, &old_video);

        let next = self.shared.queue.advance().ok_or_else(|| {
            (
                TerminationReason::UnderrunNoNextBlock,
                format!(
                    "fence for {} at tick {} with empty next slot",
                    live.block.block_id(),
                    self.tick
                ),
            )
        })?;

        let result = match self.preparer.take_block_result() {
            Some(r) if r.block_id == next.block_id() => r,
            _ => {
                self.shared.metrics.lock().seam_misses += 1;
                return Err((
                    TerminationReason::PreparationFailed,
                    format!(
                        "next block {} has no prepared source at fence tick {}",
                        next.block_id(),
                        self.tick
                    ),
                ));
            }
        };

        // Retire the old fill worker without blocking the tick thread; the
        // generation bump fences its stragglers.
        if let Some(handle) = old_video.stop_filling_async(true) {
            self.retired_fills.push(handle);
        }
        self.audio.reset();
        // Stale segment prep from the retired block must not shadow the new
        // block's seams. Block prep is precious and untouched.
        self.preparer.cancel_segment_requests();

        let frames_per_block = result.producer.frames_per_block();
        let primed_success = result.audio_prime_depth_ms >= self.ctx.min_audio_prime_ms;
        let new_video = Arc::new(VideoLookaheadBuffer::new(self.ctx.video_config, fps));
        Arc::clone(&new_video).start_filling(
            result.producer,
            Arc::clone(&self.audio),
            Arc::clone(&self.shared.stop),
        );
        self.video = Some(new_video);

        self.emitter.emit_block_start(&BlockStartPayload {
            block_id: next.block_id().to_string(),
            swap_tick: self.tick as u64,
            fence_tick: (self.tick + frames_per_block) as u64,
            actual_start_utc_ms: fence_utc,
            primed_success,
        });
        tracing::info!(
            old_block = live.block.block_id(),
            new_block = next.block_id(),
            tick = self.tick,
            "block committed at fence"
        );

        self.live = Some(LiveBlock {
            start_tick: self.tick,
            fence_tick: self.tick + frames_per_block,
            swap_tick: self.tick,
            primed_success,
            current_segment: 0,
            segment_start_tick: self.tick,
            segment_start_utc_ms: fence_utc,
            segment_fallback_base: 0,
            segment_prep_submitted: None,
            block: next,
        });
        self.emit_segment_start(0, fence_utc);
        self.submit_next_segment_seam();

        {
            let mut m = self.shared.metrics.lock();
            m.blocks_committed += 1;
            m.seams_taken += 1;
        }
        self.join_finished_retired();
        Ok(())
    }

    /// Segment-boundary lookup for the current tick; on a seam, emit the
    /// evidence pair and swap the decode source if it changed.
    fn check_segment_seam(&mut self) -> std::result::Result<(), Exit> {
        let fps = self.ctx.geometry.fps;
        let (ct, current_segment) = {
            let live = self.live_ref()?;
            (
                fps.tick_to_ct_ms(self.tick - live.start_tick),
                live.current_segment,
            )
        };
        let live = self.live.as_ref().ok_or((
            TerminationReason::InvariantViolation,
            "seam check with no live block".to_string(),
        ))?;
        let new_segment = live.block.segment_index_at(ct).ok_or((
            TerminationReason::InvariantViolation,
            format!("ct {} ms outside block {}", ct, live.block.block_id()),
        ))?;
        if new_segment == current_segment {
            return Ok(());
        }

        let now_utc = self.clock.frame_utc_ms(self.tick);
        let block_id = live.block.block_id().to_string();
        let source_changed = {
            let old = live.block.segment(current_segment);
            let new = live.block.segment(new_segment);
            match (old, new) {
                (Some(a), Some(b)) => !a.same_source(b),
                _ => true,
            }
        };

        // Evidence first: the previous segment ends exactly where the new
        // one starts.
        let live = self.live.take().ok_or((
            TerminationReason::InvariantViolation,
            "seam with no live block".to_string(),
        ))?;
        self.close_segment(&live, now_utc, SegmentEndStatus::Aired, "");
        let mut live = live;
        live.current_segment = new_segment;
        live.segment_start_tick = self.tick;
        live.segment_start_utc_ms = now_utc;
        self.live = Some(live);
        self.emit_segment_start(new_segment, now_utc);

        if source_changed {
            let result = match self.preparer.take_segment_result() {
                Some(r) if r.block_id == block_id && r.segment_index == new_segment => r,
                _ => {
                    self.shared.metrics.lock().seam_misses += 1;
                    return Err((
                        TerminationReason::SeamMiss,
                        format!(
                            "segment {} of {} not prepared at tick {}",
                            new_segment, block_id, self.tick
                        ),
                    ));
                }
            };

            let old_video = Arc::clone(self.video.as_ref().ok_or((
                TerminationReason::InvariantViolation,
                "seam with no video buffer".to_string(),
            ))?);
            if let Some(handle) = old_video.stop_filling_async(true) {
                self.retired_fills.push(handle);
            }
            self.audio.reset();

            let fps = self.ctx.geometry.fps;
            let new_video = Arc::new(VideoLookaheadBuffer::new(self.ctx.video_config, fps));
            Arc::clone(&new_video).start_filling(
                result.producer,
                Arc::clone(&self.audio),
                Arc::clone(&self.shared.stop),
            );
            self.video = Some(new_video);
            self.shared.metrics.lock().seams_taken += 1;
            tracing::debug!(
                block_id = %block_id,
                segment_index = new_segment,
                tick = self.tick,
                "segment source swapped at seam"
            );
            self.join_finished_retired();
        }

        // Fallback accounting restarts per segment, relative to whichever
        // buffer now serves it.
        let base = self
            .video
            .as_ref()
            .map(|v| v.fallback_frames())
            .unwrap_or(0);
        if let Some(live) = self.live.as_mut() {
            live.segment_fallback_base = base;
        }

        // This seam is behind us; put the next one in flight.
        self.submit_next_segment_seam();
        Ok(())
    }

    /// Queue preparation for the next upcoming in-block seam whose source
    /// differs from its predecessor. Exactly one segment prep is in flight
    /// at a time — the preparer publishes into a single segment slot, so a
    /// later seam's result must never race an untaken earlier one. The next
    /// submission happens when the current seam is taken.
    fn submit_next_segment_seam(&mut self) {
        let request = {
            let Some(live) = self.live.as_ref() else {
                return;
            };
            let fps = self.ctx.geometry.fps;
            let segments = &live.block.plan.segments;
            let current = live.current_segment.max(0) as usize;
            let mut found = None;
            for i in (current + 1)..segments.len() {
                if segments[i - 1].same_source(&segments[i]) {
                    // Continuous decode through this boundary; keep scanning
                    // for the first seam that actually needs a new source.
                    continue;
                }
                let index = segments[i].segment_index;
                if live.segment_prep_submitted == Some(index) {
                    return; // already in flight
                }
                let Some(synthetic) = live.block.for_single_segment(index) else {
                    return;
                };
                let Some(boundary) = live.block.boundary(index) else {
                    return;
                };
                let seam_frame = live.start_tick + fps.ct_ms_to_tick_ceil(boundary.start_ct_ms);
                found = Some((
                    index,
                    SeamRequest {
                        request_type: SeamRequestType::Segment,
                        block: synthetic,
                        seam_frame,
                        geometry: self.ctx.geometry,
                        min_audio_prime_ms: self.ctx.min_audio_prime_ms,
                        parent_block_id: live.block.block_id().to_string(),
                        segment_index: index,
                    },
                ));
                break;
            }
            found
        };
        if let Some((index, request)) = request {
            self.preparer.submit(request);
            if let Some(live) = self.live.as_mut() {
                live.segment_prep_submitted = Some(index);
            }
        }
    }

    /// When a next block appears in the queue, submit its preparation once,
    /// due at the live block's fence.
    fn kickoff_next_block_prep(&mut self) {
        let Some(next_id) = self.shared.queue.next_block_id() else {
            return;
        };
        if self.block_prep_submitted.as_deref() == Some(next_id.as_str()) {
            return;
        }
        let Some(next) = self.shared.queue.peek_next() else {
            return;
        };
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let block_id = next.block_id().to_string();
        self.preparer.submit(SeamRequest {
            request_type: SeamRequestType::Block,
            seam_frame: live.fence_tick,
            block: next,
            geometry: self.ctx.geometry,
            min_audio_prime_ms: self.ctx.min_audio_prime_ms,
            parent_block_id: live.block.block_id().to_string(),
            segment_index: 0,
        });
        self.block_prep_submitted = Some(block_id);
    }

    fn emit_segment_start(&self, segment_index: i32, now_utc: i64) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let Some(seg) = live.block.segment(segment_index) else {
            return;
        };
        self.emitter.emit_segment_start(&SegmentStartPayload {
            block_id: live.block.block_id().to_string(),
            event_id: seg.event_id.clone(),
            segment_index,
            actual_start_utc_ms: now_utc,
            actual_start_frame: self.tick,
            scheduled_duration_ms: seg.duration_ms,
        });
    }

    fn close_segment(
        &self,
        live: &LiveBlock,
        end_utc: i64,
        status: SegmentEndStatus,
        reason: &str,
    ) {
        let Some(seg) = live.block.segment(live.current_segment) else {
            return;
        };
        let fallback = self
            .video
            .as_ref()
            .map(|v| v.fallback_frames().saturating_sub(live.segment_fallback_base))
            .unwrap_or(0);
        self.emitter.emit_segment_end(&SegmentEndPayload {
            block_id: live.block.block_id().to_string(),
            event_id_ref: seg.event_id.clone(),
            actual_start_utc_ms: live.segment_start_utc_ms,
            actual_end_utc_ms: end_utc,
            actual_start_frame: live.segment_start_tick,
            actual_end_frame: self.tick,
            computed_duration_ms: end_utc - live.segment_start_utc_ms,
            computed_duration_frames: self.tick - live.segment_start_tick,
            status,
            reason: reason.to_string(),
            fallback_frames_used: fallback,
        });
    }

    fn emit_block_fence(&self, live: &LiveBlock, fence_utc: i64, video: &VideoLookaheadBuffer) {
        let fps = self.ctx.geometry.fps;
        self.emitter.emit_block_fence(&BlockFencePayload {
            block_id: live.block.block_id().to_string(),
            swap_tick: live.swap_tick as u64,
            fence_tick: self.tick as u64,
            actual_end_utc_ms: fence_utc,
            ct_at_fence_ms: fps.tick_to_ct_ms(self.tick - live.start_tick) as u64,
            total_frames_emitted: (self.tick - live.start_tick) as u64,
            truncated_by_fence: !video.source_exhausted(),
            early_exhaustion: video.fallback_frames() > 0,
            primed_success: live.primed_success,
        });
    }

    fn after_tick_housekeeping(&mut self, video: &Arc<VideoLookaheadBuffer>) {
        // Audio-vs-video fill policy: boost while audio is short, release
        // once it has rebuilt past high water.
        if self.audio.is_below_low_water() {
            video.set_audio_boost(true);
        } else if self.audio.is_above_high_water() {
            video.set_audio_boost(false);
        }

        let mut m = self.shared.metrics.lock();
        m.frames_emitted += 1;
        m.current_tick = self.tick;
        m.audio_depth_ms = self.audio.depth_ms();
        m.video_depth_frames = video.depth_frames();
        m.fallback_frames = video.fallback_frames();
        m.video_underflows = video.underflow_count();
        m.audio_underflows = self.audio.underflow_count();
        m.preparer_depth = self.preparer.pending_depth();
        if self.tick % 30 == 0 {
            m.decode_latency_p95_us = video.decode_latency_p95_us();
            m.decode_latency_mean_us = video.decode_latency_mean_us();
            m.refill_rate_fps = video.refill_rate_fps();
            if let Ok(late) = self.clock.lateness_us(self.tick) {
                if late > 0 {
                    m.late_ticks += 1;
                }
            }
        }
    }

    fn join_finished_retired(&mut self) {
        let mut remaining = Vec::new();
        for handle in self.retired_fills.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                remaining.push(handle);
            }
        }
        self.retired_fills = remaining;
    }

    /// Teardown in reverse dependency order: live fill worker, deferred
    /// fills, preparer, preloader, sink. A defensive audit confirms nothing
    /// owned is still joinable afterwards.
    fn teardown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);

        if let Some(video) = self.video.take() {
            video.stop_filling(true);
            if video.is_filling() {
                tracing::error!("BUG: live fill worker still running after stop");
            }
        }
        for handle in self.retired_fills.drain(..) {
            let _ = handle.join();
        }
        self.preparer.cancel();
        self.preloader.cancel();
        self.sink.close();

        if !self.retired_fills.is_empty() {
            tracing::error!(
                "BUG: {} retired fill handles survived teardown",
                self.retired_fills.len()
            );
        }
    }
}
