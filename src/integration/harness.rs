//! Deterministic test doubles: scripted decoder factory, recording sink,
//! and a paced wait strategy for end-to-end scenario runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::clock::WaitStrategy;
use crate::decode::{Decoder, DecoderFactory, InterruptFlags, OutputGeometry};
use crate::error::{PlayoutError, Result};
use crate::fps::RationalFps;
use crate::media::{AudioFrame, FrameMetadata, PixelFormat, VideoFrame, HOUSE_SAMPLE_RATE};
use crate::sink::{OutputSink, SinkEmitError};

/// Scripted asset: a synthetic source of `duration_ms` of video at `fps`,
/// with paired house-format audio unless muted.
#[derive(Debug, Clone)]
pub struct FakeAsset {
    pub duration_ms: i64,
    pub fps: RationalFps,
    pub has_audio: bool,
}

impl FakeAsset {
    pub fn new(duration_ms: i64, fps: RationalFps) -> Self {
        Self {
            duration_ms,
            fps,
            has_audio: true,
        }
    }

    pub fn without_audio(mut self) -> Self {
        self.has_audio = false;
        self
    }

    fn total_frames(&self) -> i64 {
        self.fps.frames_for_duration_ms(self.duration_ms)
    }
}

/// Factory handing out `FakeDecoder`s for registered URIs; unknown URIs
/// fail to open, modeling a missing asset.
#[derive(Default)]
pub struct FakeDecoderFactory {
    assets: Mutex<HashMap<String, FakeAsset>>,
}

impl FakeDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(&self, uri: &str, asset: FakeAsset) {
        self.assets.lock().insert(uri.to_string(), asset);
    }
}

impl DecoderFactory for FakeDecoderFactory {
    fn open_decoder(&self, asset_uri: &str, geometry: OutputGeometry) -> Result<Box<dyn Decoder>> {
        let asset = self
            .assets
            .lock()
            .get(asset_uri)
            .cloned()
            .ok_or_else(|| PlayoutError::Decode(format!("cannot open {}", asset_uri)))?;
        Ok(Box::new(FakeDecoder {
            uri: asset_uri.to_string(),
            asset,
            geometry,
            next_frame: 0,
            eof: false,
            pending_video: VecDeque::new(),
            pending_audio: VecDeque::new(),
            interrupt: InterruptFlags::default(),
        }))
    }
}

/// Synthetic decoder: frame `i` has PTS on the asset's FPS grid and carries
/// its index in the first 8 payload bytes so tests can identify frames.
pub struct FakeDecoder {
    uri: String,
    asset: FakeAsset,
    geometry: OutputGeometry,
    next_frame: i64,
    eof: bool,
    pending_video: VecDeque<VideoFrame>,
    pending_audio: VecDeque<AudioFrame>,
    interrupt: InterruptFlags,
}

impl FakeDecoder {
    fn produce_one(&mut self) -> Option<VideoFrame> {
        if self.next_frame >= self.asset.total_frames() {
            self.eof = true;
            return None;
        }
        let index = self.next_frame;
        self.next_frame += 1;
        let pts_us = self.asset.fps.frame_deadline_ns(index) / 1000;

        if self.asset.has_audio {
            let nb = self.asset.fps.samples_for_tick(index, HOUSE_SAMPLE_RATE as i64) as usize;
            self.pending_audio.push_back(AudioFrame {
                sample_rate: HOUSE_SAMPLE_RATE,
                channels: crate::media::HOUSE_CHANNELS,
                nb_samples: nb,
                data: Bytes::from(vec![0u8; nb * crate::media::HOUSE_BYTES_PER_SAMPLE]),
                pts_us,
            });
        }

        let mut data = vec![0u8; 16];
        data[..8].copy_from_slice(&index.to_le_bytes());
        Some(VideoFrame {
            width: self.geometry.width,
            height: self.geometry.height,
            pixel_format: PixelFormat::Yuv420p,
            data: Bytes::from(data),
            metadata: FrameMetadata {
                pts_us,
                dts_us: pts_us,
                duration_us: self.asset.fps.frame_duration_us(),
                asset_uri: self.uri.clone(),
            },
        })
    }
}

/// Read the frame index tag a `FakeDecoder` wrote into a frame payload.
pub fn frame_tag(frame: &[u8]) -> i64 {
    i64::from_le_bytes(frame[..8].try_into().unwrap())
}

impl Decoder for FakeDecoder {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek_precise_to_ms(&mut self, target_ms: i64) -> Result<u32> {
        if target_ms == 0 && self.eof {
            return Err(PlayoutError::SeekNotPossible(format!(
                "rewind to 0 after EOF on {} (looping prohibited)",
                self.uri
            )));
        }
        if target_ms >= self.asset.duration_ms {
            return Err(PlayoutError::SeekNotPossible(format!(
                "offset {} ms past end of {} ({} ms)",
                target_ms, self.uri, self.asset.duration_ms
            )));
        }
        self.pending_video.clear();
        self.pending_audio.clear();
        self.eof = false;
        self.next_frame = self.asset.fps.ct_ms_to_tick_ceil(target_ms);
        Ok(2) // nominal preroll
    }

    fn video_fps(&self) -> Option<RationalFps> {
        Some(self.asset.fps)
    }

    fn decode_frame(&mut self) -> Result<Option<VideoFrame>> {
        if self.interrupt.interrupted() {
            return Err(PlayoutError::Decode("decode interrupted".into()));
        }
        if let Some(f) = self.pending_video.pop_front() {
            return Ok(Some(f));
        }
        Ok(self.produce_one())
    }

    fn take_pending_audio(&mut self) -> Option<AudioFrame> {
        self.pending_audio.pop_front()
    }

    fn is_eof(&self) -> bool {
        self.eof && self.pending_video.is_empty()
    }

    fn has_audio_stream(&self) -> bool {
        self.asset.has_audio
    }

    fn set_interrupt_flags(&mut self, flags: InterruptFlags) {
        self.interrupt = flags;
    }

    fn pump(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.produce_one() {
            Some(f) => {
                self.pending_video.push_back(f);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// One recorded tick emission.
#[derive(Debug, Clone)]
pub struct RecordedTick {
    pub pts_90k: i64,
    pub asset_uri: String,
    pub frame_tag: i64,
    pub video_pts_us: i64,
    pub audio_samples: usize,
}

#[derive(Default)]
pub struct Recording {
    pub ticks: Vec<RecordedTick>,
    pub closed: bool,
}

/// In-memory `OutputSink` capturing every emission; optionally scripted to
/// detach after N ticks (slow-consumer scenarios).
pub struct RecordingSink {
    recording: Arc<Mutex<Recording>>,
    detach_after: Option<usize>,
    detached: bool,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<Recording>>) {
        let recording = Arc::new(Mutex::new(Recording::default()));
        (
            Self {
                recording: Arc::clone(&recording),
                detach_after: None,
                detached: false,
            },
            recording,
        )
    }

    pub fn detach_after(mut self, ticks: usize) -> Self {
        self.detach_after = Some(ticks);
        self
    }
}

impl OutputSink for RecordingSink {
    fn emit(
        &mut self,
        video: &VideoFrame,
        audio: &AudioFrame,
        pts_90k: i64,
    ) -> std::result::Result<(), SinkEmitError> {
        if self.detached {
            return Err(SinkEmitError::Detached);
        }
        let mut rec = self.recording.lock();
        if let Some(limit) = self.detach_after {
            if rec.ticks.len() >= limit {
                self.detached = true;
                return Err(SinkEmitError::Detached);
            }
        }
        rec.ticks.push(RecordedTick {
            pts_90k,
            asset_uri: video.metadata.asset_uri.clone(),
            frame_tag: frame_tag(&video.data),
            video_pts_us: video.metadata.pts_us,
            audio_samples: audio.nb_samples,
        });
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.detached
    }

    fn close(&mut self) {
        self.recording.lock().closed = true;
    }
}

/// Wait strategy for scenario runs: a fixed short pause per frame, fast
/// enough to run hundreds of ticks in milliseconds but long enough for the
/// background preparation workers to stay ahead, as they do in real time.
pub struct PacedWait(pub Duration);

impl WaitStrategy for PacedWait {
    fn wait_until(&self, _deadline: Instant) {
        std::thread::sleep(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_decoder_eof_and_loop_rejection() {
        let factory = FakeDecoderFactory::new();
        factory.add_asset("a", FakeAsset::new(100, RationalFps::new(30, 1)));
        let mut dec = factory
            .open_decoder(
                "a",
                OutputGeometry {
                    width: 64,
                    height: 36,
                    fps: RationalFps::new(30, 1),
                },
            )
            .unwrap();
        let mut frames = 0;
        while dec.decode_frame().unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 3); // 100 ms at 30 fps
        assert!(dec.is_eof());
        // Rewind-to-zero on an exhausted asset is an EOF loop: rejected.
        assert!(dec.seek_precise_to_ms(0).is_err());
    }

    #[test]
    fn test_fake_decoder_seek_lands_on_grid() {
        let factory = FakeDecoderFactory::new();
        factory.add_asset("a", FakeAsset::new(10_000, RationalFps::new(30, 1)));
        let mut dec = factory
            .open_decoder(
                "a",
                OutputGeometry {
                    width: 64,
                    height: 36,
                    fps: RationalFps::new(30, 1),
                },
            )
            .unwrap();
        dec.seek_precise_to_ms(1000).unwrap();
        let f = dec.decode_frame().unwrap().unwrap();
        assert!(f.metadata.pts_us >= 1_000_000);
        assert_eq!(frame_tag(&f.data), 30);
    }

    #[test]
    fn test_recording_sink_detach_script() {
        let (sink, recording) = RecordingSink::new();
        let mut sink = sink.detach_after(2);
        let frame = VideoFrame {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Yuv420p,
            data: Bytes::from(vec![0u8; 16]),
            metadata: FrameMetadata::default(),
        };
        let audio = AudioFrame::silence(100, 0);
        assert!(sink.emit(&frame, &audio, 0).is_ok());
        assert!(sink.emit(&frame, &audio, 3003).is_ok());
        assert_eq!(sink.emit(&frame, &audio, 6006), Err(SinkEmitError::Detached));
        assert!(sink.is_detached());
        assert_eq!(recording.lock().ticks.len(), 2);
    }
}
