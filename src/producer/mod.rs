//! Block-scoped decode lifecycle.
//!
//! A `TickProducer` owns one decoder for one block (or one synthetic
//! single-segment block), seeks it precisely to the first segment's offset,
//! and pre-decodes enough audio (plus exactly one video frame) that the
//! pipeline can begin serving ticks at commit without starving.

pub mod cadence;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::decode::{Decoder, DecoderFactory, InterruptFlags, OutputGeometry};
use crate::error::{PlayoutError, Result};
use crate::fps::RationalFps;
use crate::media::{AudioFrame, VideoFrame, HOUSE_SAMPLE_RATE};
use crate::plan::{SegmentType, ValidatedBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Empty,
    Ready,
}

pub struct TickProducer {
    geometry: OutputGeometry,
    factory: Arc<dyn DecoderFactory>,
    state: ProducerState,
    decoder: Option<Box<dyn Decoder>>,
    block: Option<ValidatedBlock>,
    frames_per_block: i64,
    segment_type: SegmentType,
    segment_index: i32,

    /// First decoded frame, retained for synchronous hand-off to the video
    /// buffer when filling starts.
    primed_first: Option<VideoFrame>,
    /// Frames decoded past the first while accumulating audio prime.
    buffered: VecDeque<VideoFrame>,
    primed_audio: Vec<AudioFrame>,
    audio_prime_depth_ms: i64,

    /// Silence queued for assets with no audio stream, paced one source
    /// frame's worth per decoded frame.
    synth_audio: VecDeque<AudioFrame>,
}

impl TickProducer {
    pub fn new(geometry: OutputGeometry, factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            geometry,
            factory,
            state: ProducerState::Empty,
            decoder: None,
            block: None,
            frames_per_block: 0,
            segment_type: SegmentType::Content,
            segment_index: 0,
            primed_first: None,
            buffered: VecDeque::new(),
            primed_audio: Vec::new(),
            audio_prime_depth_ms: 0,
            synth_audio: VecDeque::new(),
        }
    }

    /// Open, seek and prime for the block's first segment. Synchronous;
    /// intended to run on a preparation worker, never on the tick thread.
    ///
    /// Fails when the asset does not open, the precise seek is not possible
    /// (offset past EOF, rewind of an exhausted asset), or the audio prime
    /// depth cannot be reached before EOF.
    pub fn assign_block(&mut self, block: &ValidatedBlock, min_audio_prime_ms: i64) -> Result<()> {
        let seg = block.plan.segments.first().ok_or_else(|| {
            PlayoutError::InvariantViolation("assign_block on empty segment list".into())
        })?;

        let mut decoder = self.factory.open_decoder(&seg.asset_uri, self.geometry)?;
        if seg.asset_start_offset_ms > 0 {
            let preroll = decoder.seek_precise_to_ms(seg.asset_start_offset_ms)?;
            tracing::debug!(
                block_id = block.block_id(),
                segment_index = seg.segment_index,
                offset_ms = seg.asset_start_offset_ms,
                preroll,
                "segment seek complete"
            );
        }

        self.segment_type = seg.segment_type;
        self.segment_index = seg.segment_index;
        self.frames_per_block = self.geometry.fps.frames_for_duration_ms(block.duration_ms());
        self.decoder = Some(decoder);
        self.block = Some(block.clone());
        self.primed_first = None;
        self.buffered.clear();
        self.primed_audio.clear();
        self.synth_audio.clear();
        self.audio_prime_depth_ms = 0;

        // Accumulate the prime: one retained video frame plus at least
        // min_audio_prime_ms of audio.
        let mut audio_samples = 0i64;
        loop {
            let frame = self.decode_next()?;
            match frame {
                Some(f) => {
                    if self.primed_first.is_none() {
                        self.primed_first = Some(f);
                    } else {
                        self.buffered.push_back(f);
                    }
                }
                None => {
                    // EOF during prime: fatal unless we already met both goals.
                    break;
                }
            }
            while let Some(a) = self.drain_audio() {
                audio_samples += a.nb_samples as i64;
                self.primed_audio.push(a);
            }
            let depth_ms = audio_samples * 1000 / HOUSE_SAMPLE_RATE as i64;
            if self.primed_first.is_some() && depth_ms >= min_audio_prime_ms {
                break;
            }
        }
        // Audio flushed by an EOF decode still counts toward the prime.
        while let Some(a) = self.drain_audio() {
            audio_samples += a.nb_samples as i64;
            self.primed_audio.push(a);
        }

        self.audio_prime_depth_ms = audio_samples * 1000 / HOUSE_SAMPLE_RATE as i64;
        if self.primed_first.is_none() {
            self.reset();
            return Err(PlayoutError::PreparationFailed(format!(
                "no video frame decodable at offset {} ms of {}",
                seg.asset_start_offset_ms, seg.asset_uri
            )));
        }
        if self.audio_prime_depth_ms < min_audio_prime_ms {
            let detail = format!(
                "audio prime reached {} ms of {} ms before EOF ({})",
                self.audio_prime_depth_ms, min_audio_prime_ms, seg.asset_uri
            );
            self.reset();
            return Err(PlayoutError::PreparationFailed(detail));
        }

        self.state = ProducerState::Ready;
        Ok(())
    }

    /// Decode the next frame, synthesizing paced silence for mute assets.
    fn decode_next(&mut self) -> Result<Option<VideoFrame>> {
        let decoder = self.decoder.as_mut().ok_or_else(|| {
            PlayoutError::InvariantViolation("decode without decoder".into())
        })?;
        let frame = decoder.decode_frame()?;
        if let Some(f) = &frame {
            if !decoder.has_audio_stream() {
                // A mute asset still owes house audio: one source-frame's
                // worth of silence per decoded frame keeps A/V paced.
                let fps = decoder.video_fps().unwrap_or(self.geometry.fps);
                let nb = (HOUSE_SAMPLE_RATE as i64 * fps.den / fps.num) as usize;
                self.synth_audio
                    .push_back(AudioFrame::silence(nb, f.metadata.pts_us));
            }
        }
        Ok(frame)
    }

    fn drain_audio(&mut self) -> Option<AudioFrame> {
        if let Some(a) = self.synth_audio.pop_front() {
            return Some(a);
        }
        self.decoder.as_mut().and_then(|d| d.take_pending_audio())
    }

    /// Pop one frame: primed backlog first, then live decode.
    /// `Ok(None)` is end of stream.
    pub fn try_get_frame(&mut self) -> Result<Option<VideoFrame>> {
        if let Some(f) = self.buffered.pop_front() {
            return Ok(Some(f));
        }
        self.decode_next()
    }

    /// Audio queued behind decodes (decoder-produced or synthesized).
    pub fn take_pending_audio(&mut self) -> Option<AudioFrame> {
        self.drain_audio()
    }

    /// Move every frame decoded during priming (the retained first frame
    /// plus the backlog accumulated while reaching the audio threshold) and
    /// the prime audio out. Called once when the video buffer starts
    /// filling; the frames enter the buffer synchronously, through the same
    /// cadence gate as live decodes.
    pub fn take_primed(&mut self) -> (Vec<VideoFrame>, Vec<AudioFrame>) {
        let mut frames = Vec::with_capacity(1 + self.buffered.len());
        frames.extend(self.primed_first.take());
        frames.extend(self.buffered.drain(..));
        (frames, std::mem::take(&mut self.primed_audio))
    }

    /// Release decoder and block state; back to Empty.
    pub fn reset(&mut self) {
        self.decoder = None;
        self.block = None;
        self.state = ProducerState::Empty;
        self.primed_first = None;
        self.buffered.clear();
        self.primed_audio.clear();
        self.synth_audio.clear();
        self.frames_per_block = 0;
        self.audio_prime_depth_ms = 0;
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn block(&self) -> Option<&ValidatedBlock> {
        self.block.as_ref()
    }

    pub fn frames_per_block(&self) -> i64 {
        self.frames_per_block
    }

    pub fn has_decoder(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn segment_type(&self) -> SegmentType {
        self.segment_type
    }

    pub fn segment_index(&self) -> i32 {
        self.segment_index
    }

    pub fn audio_prime_depth_ms(&self) -> i64 {
        self.audio_prime_depth_ms
    }

    /// Source frame rate detected by the decoder; feeds the cadence gate.
    pub fn input_fps(&self) -> Option<RationalFps> {
        self.decoder.as_ref().and_then(|d| d.video_fps())
    }

    pub fn set_interrupt_flags(&mut self, flags: InterruptFlags) {
        if let Some(d) = self.decoder.as_mut() {
            d.set_interrupt_flags(flags);
        }
    }

    pub fn is_eof(&self) -> bool {
        self.buffered.is_empty()
            && self
                .decoder
                .as_ref()
                .map(|d| d.is_eof())
                .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::harness::{FakeAsset, FakeDecoderFactory};
    use crate::plan::{test_plan, validate_plan};

    fn geometry() -> OutputGeometry {
        OutputGeometry {
            width: 640,
            height: 360,
            fps: RationalFps::new(30, 1),
        }
    }

    #[test]
    fn test_assign_block_primes_video_and_audio() {
        let factory = Arc::new(FakeDecoderFactory::new());
        factory.add_asset("a.mp4", FakeAsset::new(10_000, RationalFps::new(30, 1)));

        let block = validate_plan(test_plan("b1", 0, &[("a.mp4", 0, 2000)])).unwrap();
        let mut producer = TickProducer::new(geometry(), factory);
        producer.assign_block(&block, 100).unwrap();

        assert_eq!(producer.state(), ProducerState::Ready);
        assert_eq!(producer.frames_per_block(), 60);
        assert!(producer.audio_prime_depth_ms() >= 100);

        let (frames, audio) = producer.take_primed();
        assert!(!frames.is_empty());
        let total_samples: usize = audio.iter().map(|a| a.nb_samples).sum();
        assert!(total_samples as i64 * 1000 / HOUSE_SAMPLE_RATE as i64 >= 100);
    }

    #[test]
    fn test_assign_block_seeks_to_offset() {
        let factory = Arc::new(FakeDecoderFactory::new());
        factory.add_asset("a.mp4", FakeAsset::new(10_000, RationalFps::new(30, 1)));

        let block = validate_plan(test_plan("b1", 0, &[("a.mp4", 4000, 2000)])).unwrap();
        let mut producer = TickProducer::new(geometry(), factory);
        producer.assign_block(&block, 100).unwrap();

        let (frames, _) = producer.take_primed();
        // First decoded frame lands at/after the 4 s offset.
        assert!(frames[0].metadata.pts_us >= 4_000_000);
    }

    #[test]
    fn test_offset_past_duration_rejected() {
        let factory = Arc::new(FakeDecoderFactory::new());
        factory.add_asset("a.mp4", FakeAsset::new(3_000, RationalFps::new(30, 1)));

        let block = validate_plan(test_plan("b1", 0, &[("a.mp4", 5_000, 1000)])).unwrap();
        let mut producer = TickProducer::new(geometry(), factory);
        assert!(producer.assign_block(&block, 100).is_err());
        assert_eq!(producer.state(), ProducerState::Empty);
    }

    #[test]
    fn test_prime_depth_unreachable_fails() {
        let factory = Arc::new(FakeDecoderFactory::new());
        // 50 ms asset cannot yield 100 ms of prime audio.
        factory.add_asset("tiny.mp4", FakeAsset::new(50, RationalFps::new(30, 1)));

        let block = validate_plan(test_plan("b1", 0, &[("tiny.mp4", 0, 50)])).unwrap();
        let mut producer = TickProducer::new(geometry(), factory);
        let err = producer.assign_block(&block, 100).unwrap_err();
        assert!(matches!(err, PlayoutError::PreparationFailed(_)));
    }

    #[test]
    fn test_mute_asset_synthesizes_silence() {
        let factory = Arc::new(FakeDecoderFactory::new());
        factory.add_asset(
            "mute.mp4",
            FakeAsset::new(5_000, RationalFps::new(30, 1)).without_audio(),
        );

        let block = validate_plan(test_plan("b1", 0, &[("mute.mp4", 0, 2000)])).unwrap();
        let mut producer = TickProducer::new(geometry(), factory);
        producer.assign_block(&block, 100).unwrap();

        let (_, audio) = producer.take_primed();
        assert!(!audio.is_empty());
        assert!(audio.iter().all(|a| a.data.iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_reset_returns_to_empty() {
        let factory = Arc::new(FakeDecoderFactory::new());
        factory.add_asset("a.mp4", FakeAsset::new(10_000, RationalFps::new(30, 1)));

        let block = validate_plan(test_plan("b1", 0, &[("a.mp4", 0, 2000)])).unwrap();
        let mut producer = TickProducer::new(geometry(), factory);
        producer.assign_block(&block, 100).unwrap();
        producer.reset();
        assert_eq!(producer.state(), ProducerState::Empty);
        assert!(!producer.has_decoder());
    }
}
