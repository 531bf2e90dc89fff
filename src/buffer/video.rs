//! Per-block video lookahead with a background fill worker.
//!
//! The fill worker decodes ahead through a `TickProducer`, resolves cadence
//! to 0/1/k tick-stamped frames per decode, pushes them here, and forwards
//! decoder-queued audio to the audio lookahead (generation-fenced). It parks
//! at target depth, doubles its target under audio boost, and pushes past
//! target (bounded) while audio is under the burst threshold.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::AudioLookaheadBuffer;
use crate::fps::RationalFps;
use crate::media::VideoFrame;
use crate::producer::cadence::CadenceResolver;
use crate::producer::TickProducer;

const LATENCY_RING_SIZE: usize = 128;
/// Hard cap on fill-ahead: never more than 4x the configured target.
const BURST_CAP_MULTIPLIER: usize = 4;
/// Capacity-park recheck interval (also bounds stop latency).
const PARK_RECHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct VideoBufferConfig {
    pub target_depth_frames: usize,
    pub low_water_frames: usize,
    /// Below this audio depth the fill worker keeps decoding past its video
    /// target to rebuild audio headroom.
    pub audio_burst_threshold_ms: i64,
}

impl Default for VideoBufferConfig {
    fn default() -> Self {
        Self {
            target_depth_frames: 15,
            low_water_frames: 5,
            audio_burst_threshold_ms: 200,
        }
    }
}

/// A queued frame plus provenance the tick loop cares about.
#[derive(Debug, Clone)]
pub struct VideoBufferFrame {
    pub frame: VideoFrame,
    /// True for a fresh decode, false for a cadence repeat or hold-last.
    pub was_decoded: bool,
    /// True for pad-tail hold-last frames.
    pub is_fallback: bool,
}

struct State {
    frames: VecDeque<VideoBufferFrame>,
    total_pushed: i64,
    total_popped: i64,
    underflow_count: i64,
    primed: bool,
    fill_running: bool,
    generation: u64,
    latency_ring: [i64; LATENCY_RING_SIZE],
    ring_pos: usize,
    ring_len: usize,
    fill_start: Option<Instant>,
}

pub struct VideoLookaheadBuffer {
    config: VideoBufferConfig,
    output_fps: RationalFps,
    state: Mutex<State>,
    space_cv: Condvar,
    audio_boost: AtomicBool,
    fill_stop: Arc<AtomicBool>,
    fallback_frames: AtomicU64,
    source_exhausted: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl VideoLookaheadBuffer {
    pub fn new(config: VideoBufferConfig, output_fps: RationalFps) -> Self {
        Self {
            config,
            output_fps,
            state: Mutex::new(State {
                frames: VecDeque::new(),
                total_pushed: 0,
                total_popped: 0,
                underflow_count: 0,
                primed: false,
                fill_running: false,
                generation: 1,
                latency_ring: [0; LATENCY_RING_SIZE],
                ring_pos: 0,
                ring_len: 0,
                fill_start: None,
            }),
            space_cv: Condvar::new(),
            audio_boost: AtomicBool::new(false),
            fill_stop: Arc::new(AtomicBool::new(false)),
            fallback_frames: AtomicU64::new(0),
            source_exhausted: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VideoBufferConfig {
        &self.config
    }

    // --- fill lifecycle ---

    /// Consume the producer's primed frame/audio synchronously, then spawn
    /// the fill worker. The producer moves into the worker and is dropped
    /// (decoder released) when the worker exits.
    pub fn start_filling(
        self: Arc<Self>,
        mut producer: TickProducer,
        audio: Arc<AudioLookaheadBuffer>,
        session_stop: Arc<AtomicBool>,
    ) {
        let audio_generation = audio.current_generation();
        let video_generation = {
            let mut s = self.state.lock();
            s.fill_running = true;
            s.fill_start = Some(Instant::now());
            s.generation
        };
        self.fill_stop.store(false, Ordering::Release);
        self.source_exhausted.store(false, Ordering::Release);

        // Blocking media I/O observes both stop flags through the decoder's
        // interrupt hooks, so stop propagates promptly even mid-read.
        producer.set_interrupt_flags(crate::decode::InterruptFlags {
            fill_stop: Some(Arc::clone(&self.fill_stop)),
            session_stop: Some(Arc::clone(&session_stop)),
        });

        // Primed hand-off: everything decoded during preparation enters the
        // buffers synchronously (no blocking), through the same cadence gate
        // the fill worker will keep using.
        let mut resolver = CadenceResolver::new(producer.input_fps(), self.output_fps);
        let (primed_frames, prime_audio) = producer.take_primed();
        for frame in primed_frames {
            let (_, emits) = resolver.on_frame(frame);
            for e in emits {
                self.push_frame(
                    VideoBufferFrame {
                        frame: e.frame,
                        was_decoded: !e.repeat,
                        is_fallback: false,
                    },
                    video_generation,
                );
            }
        }
        for a in prime_audio {
            audio.push(a, audio_generation);
        }

        let buffer = Arc::clone(&self);
        let stop = Arc::clone(&self.fill_stop);
        let handle = std::thread::Builder::new()
            .name("video-fill".into())
            .spawn(move || {
                buffer.fill_loop(
                    producer,
                    resolver,
                    audio,
                    audio_generation,
                    video_generation,
                    stop,
                    session_stop,
                );
            })
            .expect("spawn video fill worker");
        *self.handle.lock() = Some(handle);
    }

    fn fill_loop(
        &self,
        mut producer: TickProducer,
        mut resolver: CadenceResolver,
        audio: Arc<AudioLookaheadBuffer>,
        audio_generation: u64,
        video_generation: u64,
        stop: Arc<AtomicBool>,
        session_stop: Arc<AtomicBool>,
    ) {
        let pad_segment = producer.segment_type() == crate::plan::SegmentType::Pad;
        let stopped =
            |a: &Arc<AtomicBool>, b: &Arc<AtomicBool>| a.load(Ordering::Acquire) || b.load(Ordering::Acquire);

        loop {
            if stopped(&stop, &session_stop) {
                break;
            }
            if !self.park_for_space(&audio, &stop, &session_stop) {
                break;
            }

            let t0 = Instant::now();
            match producer.try_get_frame() {
                Ok(Some(frame)) => {
                    self.record_decode_latency(t0.elapsed().as_micros() as i64);
                    let (_, emits) = resolver.on_frame(frame);
                    for e in emits {
                        self.push_frame(
                            VideoBufferFrame {
                                frame: e.frame,
                                was_decoded: !e.repeat,
                                is_fallback: false,
                            },
                            video_generation,
                        );
                    }
                    while let Some(a) = producer.take_pending_audio() {
                        audio.push(a, audio_generation);
                    }
                }
                Ok(None) => {
                    self.source_exhausted.store(true, Ordering::Release);
                    if let Some(e) = resolver.flush() {
                        self.push_frame(
                            VideoBufferFrame {
                                frame: e.frame,
                                was_decoded: !e.repeat,
                                is_fallback: false,
                            },
                            video_generation,
                        );
                    }
                    while let Some(a) = producer.take_pending_audio() {
                        audio.push(a, audio_generation);
                    }
                    if pad_segment {
                        self.pad_tail_loop(
                            &mut resolver,
                            &audio,
                            audio_generation,
                            video_generation,
                            &stop,
                            &session_stop,
                        );
                    }
                    break;
                }
                Err(e) => {
                    // An interrupt-driven abort during stop is expected.
                    if !stopped(&stop, &session_stop) {
                        tracing::warn!(error = %e, "fill worker decode failed");
                    }
                    break;
                }
            }
        }

        producer.reset();
        let mut s = self.state.lock();
        s.fill_running = false;
    }

    /// Hold-last for a pad-classified segment whose asset exhausted early:
    /// repeat the last frame and synthesize silent audio until stopped at the
    /// boundary. Declared by the plan, so this is not an underflow.
    fn pad_tail_loop(
        &self,
        resolver: &mut CadenceResolver,
        audio: &Arc<AudioLookaheadBuffer>,
        audio_generation: u64,
        video_generation: u64,
        stop: &Arc<AtomicBool>,
        session_stop: &Arc<AtomicBool>,
    ) {
        let samples_per_tick =
            (crate::media::HOUSE_SAMPLE_RATE as i64 * self.output_fps.den / self.output_fps.num)
                as usize;
        loop {
            if stop.load(Ordering::Acquire) || session_stop.load(Ordering::Acquire) {
                return;
            }
            if !self.park_for_space(audio, stop, session_stop) {
                return;
            }
            let Some(e) = resolver.repeat_held() else {
                return;
            };
            let pts_us = e.frame.metadata.pts_us;
            self.push_frame(
                VideoBufferFrame {
                    frame: e.frame,
                    was_decoded: false,
                    is_fallback: true,
                },
                video_generation,
            );
            self.fallback_frames.fetch_add(1, Ordering::Relaxed);
            audio.push(
                crate::media::AudioFrame::silence(samples_per_tick, pts_us),
                audio_generation,
            );
        }
    }

    /// Park until the buffer has room (per target/boost/burst policy) or a
    /// stop is requested. Returns false when stopping.
    fn park_for_space(
        &self,
        audio: &Arc<AudioLookaheadBuffer>,
        stop: &Arc<AtomicBool>,
        session_stop: &Arc<AtomicBool>,
    ) -> bool {
        loop {
            if stop.load(Ordering::Acquire) || session_stop.load(Ordering::Acquire) {
                return false;
            }
            let audio_low = audio.depth_ms() < self.config.audio_burst_threshold_ms;
            let mut s = self.state.lock();
            let boost = self.audio_boost.load(Ordering::Acquire);
            let effective_target = self.config.target_depth_frames * if boost { 2 } else { 1 };
            let cap = self.config.target_depth_frames * BURST_CAP_MULTIPLIER;
            let depth = s.frames.len();
            if depth < effective_target || (audio_low && depth < cap) {
                return true;
            }
            self.space_cv.wait_for(&mut s, PARK_RECHECK);
        }
    }

    fn push_frame(&self, frame: VideoBufferFrame, expected_generation: u64) {
        let mut s = self.state.lock();
        if expected_generation != 0 && expected_generation != s.generation {
            tracing::debug!(
                expected_generation,
                current_generation = s.generation,
                "video push rejected (stale generation)"
            );
            return;
        }
        s.frames.push_back(frame);
        s.total_pushed += 1;
        s.primed = true;
    }

    /// Stop the fill worker and join it. `flush` clears buffered frames and
    /// the primed flag.
    pub fn stop_filling(&self, flush: bool) {
        self.fill_stop.store(true, Ordering::Release);
        self.space_cv.notify_all();
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
        if flush {
            let mut s = self.state.lock();
            s.frames.clear();
            s.primed = false;
        }
    }

    /// Async stop: signal, bump the generation so stragglers are fenced,
    /// hand back the join handle for a deferred join. Never blocks.
    pub fn stop_filling_async(&self, flush: bool) -> Option<JoinHandle<()>> {
        self.fill_stop.store(true, Ordering::Release);
        {
            let mut s = self.state.lock();
            s.generation += 1;
            if flush {
                s.frames.clear();
                s.primed = false;
            }
        }
        self.space_cv.notify_all();
        self.handle.lock().take()
    }

    pub fn is_filling(&self) -> bool {
        self.state.lock().fill_running
    }

    // --- consumer ---

    /// Pop one frame for the tick loop. Non-blocking; `None` after priming
    /// is a hard fault for the caller.
    pub fn try_pop_frame(&self) -> Option<VideoBufferFrame> {
        let mut s = self.state.lock();
        match s.frames.pop_front() {
            Some(f) => {
                s.total_popped += 1;
                drop(s);
                self.space_cv.notify_one();
                Some(f)
            }
            None => {
                s.underflow_count += 1;
                None
            }
        }
    }

    // --- observability ---

    pub fn depth_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn underflow_count(&self) -> i64 {
        self.state.lock().underflow_count
    }

    pub fn total_pushed(&self) -> i64 {
        self.state.lock().total_pushed
    }

    pub fn total_popped(&self) -> i64 {
        self.state.lock().total_popped
    }

    pub fn is_primed(&self) -> bool {
        self.state.lock().primed
    }

    pub fn is_below_low_water(&self) -> bool {
        let s = self.state.lock();
        s.primed && s.frames.len() < self.config.low_water_frames
    }

    /// Audio-boost mode: doubles the fill worker's effective target so more
    /// decodes (and thus more audio) happen before parking.
    pub fn set_audio_boost(&self, enable: bool) {
        self.audio_boost.store(enable, Ordering::Release);
        if enable {
            self.space_cv.notify_all();
        }
    }

    pub fn fallback_frames(&self) -> u64 {
        self.fallback_frames.load(Ordering::Relaxed)
    }

    pub fn source_exhausted(&self) -> bool {
        self.source_exhausted.load(Ordering::Acquire)
    }

    fn record_decode_latency(&self, us: i64) {
        let mut s = self.state.lock();
        let pos = s.ring_pos;
        s.latency_ring[pos] = us;
        s.ring_pos = (pos + 1) % LATENCY_RING_SIZE;
        s.ring_len = (s.ring_len + 1).min(LATENCY_RING_SIZE);
    }

    /// P95 decode latency over the last <=128 decodes (0 when none).
    pub fn decode_latency_p95_us(&self) -> i64 {
        let s = self.state.lock();
        if s.ring_len == 0 {
            return 0;
        }
        let mut sorted: Vec<i64> = s.latency_ring[..s.ring_len].to_vec();
        sorted.sort_unstable();
        sorted[(s.ring_len * 95 / 100).min(s.ring_len - 1)]
    }

    /// Mean decode latency over the last <=128 decodes (0 when none).
    pub fn decode_latency_mean_us(&self) -> i64 {
        let s = self.state.lock();
        if s.ring_len == 0 {
            return 0;
        }
        s.latency_ring[..s.ring_len].iter().sum::<i64>() / s.ring_len as i64
    }

    /// Frames pushed per second since fill start.
    pub fn refill_rate_fps(&self) -> f64 {
        let s = self.state.lock();
        match s.fill_start {
            Some(t0) => {
                let elapsed = t0.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    s.total_pushed as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }
}
