//! FFmpeg-backed implementation of the `Decoder` trait.
//!
//! One instance per block (or synthetic single-segment block): demuxes the
//! asset, decodes video scaled to the session geometry as YUV420P, and
//! decodes+resamples audio straight to house format (48 kHz stereo S16
//! interleaved). Audio is a side effect of the packet pump; decoded audio
//! frames queue up behind `take_pending_audio`.

use std::collections::VecDeque;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::software::{resampling, scaling};
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::sample::{Sample, Type as SampleType};

use crate::error::{PlayoutError, Result};
use crate::fps::RationalFps;
use crate::media::{
    AudioFrame, FrameMetadata, PixelFormat, VideoFrame, HOUSE_BYTES_PER_SAMPLE,
    HOUSE_CHANNELS, HOUSE_SAMPLE_RATE,
};

use super::{Decoder, InterruptFlags, OutputGeometry};

/// House audio sample format on the FFmpeg side: packed (interleaved) S16.
const HOUSE_SAMPLE_FORMAT: Sample = Sample::I16(SampleType::Packed);

fn ts_to_us(ts: i64, time_base: ffmpeg::Rational) -> i64 {
    (ts as i128 * time_base.numerator() as i128 * 1_000_000
        / time_base.denominator() as i128) as i64
}

pub struct FfmpegDecoder {
    asset_uri: String,
    geometry: OutputGeometry,

    input: Option<ffmpeg::format::context::Input>,
    video_stream_index: usize,
    audio_stream_index: Option<usize>,
    video_time_base: ffmpeg::Rational,
    audio_time_base: ffmpeg::Rational,

    video_decoder: Option<ffmpeg::decoder::Video>,
    audio_decoder: Option<ffmpeg::decoder::Audio>,
    scaler: Option<scaling::Context>,
    resampler: Option<resampling::Context>,

    detected_fps: Option<RationalFps>,
    pending_video: VecDeque<VideoFrame>,
    pending_audio: VecDeque<AudioFrame>,

    /// Frame-admission gate after a precise seek: decoded frames with
    /// PTS below this are preroll and discarded.
    admit_from_us: i64,

    eof: bool,
    flushed: bool,
    any_packet_read: bool,
    interrupt: InterruptFlags,
}

impl FfmpegDecoder {
    pub fn new(asset_uri: &str, geometry: OutputGeometry) -> Self {
        Self {
            asset_uri: asset_uri.to_string(),
            geometry,
            input: None,
            video_stream_index: 0,
            audio_stream_index: None,
            video_time_base: ffmpeg::Rational::new(1, 1_000_000),
            audio_time_base: ffmpeg::Rational::new(1, 1_000_000),
            video_decoder: None,
            audio_decoder: None,
            scaler: None,
            resampler: None,
            detected_fps: None,
            pending_video: VecDeque::new(),
            pending_audio: VecDeque::new(),
            admit_from_us: 0,
            eof: false,
            flushed: false,
            any_packet_read: false,
            interrupt: InterruptFlags::default(),
        }
    }

    fn decode_err(&self, what: &str, e: impl std::fmt::Display) -> PlayoutError {
        PlayoutError::Decode(format!("{} ({}): {}", what, self.asset_uri, e))
    }

    /// Scale a decoded frame to output geometry / YUV420P and pack the
    /// planes contiguously.
    fn assemble_video(&mut self, decoded: &ffmpeg::util::frame::Video) -> Result<VideoFrame> {
        let out_w = self.geometry.width;
        let out_h = self.geometry.height;

        if self.scaler.is_none() {
            let scaler = scaling::Context::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                ffmpeg::format::Pixel::YUV420P,
                out_w,
                out_h,
                scaling::Flags::BILINEAR,
            )
            .map_err(|e| self.decode_err("scaler create failed", e))?;
            self.scaler = Some(scaler);
        }

        let mut scaled = ffmpeg::util::frame::Video::empty();
        self.scaler
            .as_mut()
            .expect("scaler initialized above")
            .run(decoded, &mut scaled)
            .map_err(|e| PlayoutError::Decode(format!("scale failed: {}", e)))?;

        // Strides may exceed the visible width; copy row-by-row into a
        // compact buffer (luma then both chroma planes).
        let mut data = Vec::with_capacity(VideoFrame::yuv420p_size(out_w, out_h));
        let plane_dims = [
            (out_w as usize, out_h as usize),
            (out_w as usize / 2, out_h as usize / 2),
            (out_w as usize / 2, out_h as usize / 2),
        ];
        for (plane, &(pw, ph)) in plane_dims.iter().enumerate() {
            let src = scaled.data(plane);
            let stride = scaled.stride(plane);
            for row in 0..ph {
                let start = row * stride;
                data.extend_from_slice(&src[start..start + pw]);
            }
        }

        let pts_us = decoded
            .timestamp()
            .or(decoded.pts())
            .map(|ts| ts_to_us(ts, self.video_time_base))
            .unwrap_or(0);

        Ok(VideoFrame {
            width: out_w,
            height: out_h,
            pixel_format: PixelFormat::Yuv420p,
            data: Bytes::from(data),
            metadata: FrameMetadata {
                pts_us,
                dts_us: pts_us,
                duration_us: self
                    .detected_fps
                    .unwrap_or(self.geometry.fps)
                    .frame_duration_us(),
                asset_uri: self.asset_uri.clone(),
            },
        })
    }

    /// Resample one decoded audio frame into house format and queue it.
    fn queue_audio(&mut self, decoded: &ffmpeg::util::frame::Audio) -> Result<()> {
        let pts_us = decoded
            .timestamp()
            .or(decoded.pts())
            .map(|ts| ts_to_us(ts, self.audio_time_base))
            .unwrap_or(0);

        if self.resampler.is_none() {
            let src_layout = if decoded.channel_layout().bits() == 0 {
                // No channel layout set; fall back based on channel count
                match decoded.channels() {
                    1 => ChannelLayout::MONO,
                    _ => ChannelLayout::STEREO,
                }
            } else {
                decoded.channel_layout()
            };
            let resampler = resampling::Context::get(
                decoded.format(),
                src_layout,
                decoded.rate(),
                HOUSE_SAMPLE_FORMAT,
                ChannelLayout::STEREO,
                HOUSE_SAMPLE_RATE,
            )
            .map_err(|e| self.decode_err("resampler create failed", e))?;
            self.resampler = Some(resampler);
        }

        let mut out = ffmpeg::util::frame::Audio::empty();
        self.resampler
            .as_mut()
            .expect("resampler initialized above")
            .run(decoded, &mut out)
            .map_err(|e| PlayoutError::Decode(format!("resample failed: {}", e)))?;

        let nb_samples = out.samples();
        if nb_samples == 0 {
            return Ok(());
        }
        let byte_len = nb_samples * HOUSE_BYTES_PER_SAMPLE;
        let raw = &out.data(0)[..byte_len];

        // Audio PTS below the admission gate is seek preroll.
        if pts_us >= self.admit_from_us {
            self.pending_audio.push_back(AudioFrame {
                sample_rate: HOUSE_SAMPLE_RATE,
                channels: HOUSE_CHANNELS,
                nb_samples,
                data: Bytes::copy_from_slice(raw),
                pts_us,
            });
        }
        Ok(())
    }

    /// Drain every frame currently available from the audio decoder.
    fn receive_audio_frames(&mut self) -> Result<()> {
        loop {
            let mut decoded = ffmpeg::util::frame::Audio::empty();
            let status = match self.audio_decoder.as_mut() {
                Some(dec) => dec.receive_frame(&mut decoded),
                None => return Ok(()),
            };
            match status {
                Ok(()) => self.queue_audio(&decoded)?,
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    return Ok(())
                }
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => return Err(PlayoutError::Decode(format!("audio decode: {}", e))),
            }
        }
    }

    /// Drain every frame currently available from the video decoder, applying
    /// the seek admission gate.
    fn receive_video_frames(&mut self) -> Result<u32> {
        let mut discarded = 0u32;
        loop {
            let mut decoded = ffmpeg::util::frame::Video::empty();
            let status = match self.video_decoder.as_mut() {
                Some(dec) => dec.receive_frame(&mut decoded),
                None => return Ok(discarded),
            };
            match status {
                Ok(()) => {
                    let pts = decoded
                        .timestamp()
                        .or(decoded.pts())
                        .map(|ts| ts_to_us(ts, self.video_time_base))
                        .unwrap_or(0);
                    if pts < self.admit_from_us {
                        discarded += 1;
                        continue;
                    }
                    let frame = self.assemble_video(&decoded)?;
                    self.pending_video.push_back(frame);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    return Ok(discarded)
                }
                Err(ffmpeg::Error::Eof) => return Ok(discarded),
                Err(e) => return Err(PlayoutError::Decode(format!("video decode: {}", e))),
            }
        }
    }

    /// Send EOF to both decoders and collect whatever they still hold.
    fn flush_decoders(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;
        if let Some(dec) = self.video_decoder.as_mut() {
            let _ = dec.send_eof();
        }
        if let Some(dec) = self.audio_decoder.as_mut() {
            let _ = dec.send_eof();
        }
        self.receive_video_frames()?;
        self.receive_audio_frames()?;
        Ok(())
    }
}

impl Decoder for FfmpegDecoder {
    fn open(&mut self) -> Result<()> {
        let input = ffmpeg::format::input(&self.asset_uri)
            .map_err(|e| self.decode_err("open failed", e))?;

        let video_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| {
                PlayoutError::Decode(format!("no video stream in {}", self.asset_uri))
            })?;
        self.video_stream_index = video_stream.index();
        self.video_time_base = video_stream.time_base();

        let rate = video_stream.avg_frame_rate();
        if rate.numerator() > 0 && rate.denominator() > 0 {
            self.detected_fps = Some(
                RationalFps::new(rate.numerator() as i64, rate.denominator() as i64).snapped(),
            );
        }

        let video_decoder =
            ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
                .map_err(|e| self.decode_err("video codec context failed", e))?
                .decoder()
                .video()
                .map_err(|e| self.decode_err("video decoder create failed", e))?;
        self.video_decoder = Some(video_decoder);

        if let Some(audio_stream) = input.streams().best(ffmpeg::media::Type::Audio) {
            self.audio_stream_index = Some(audio_stream.index());
            self.audio_time_base = audio_stream.time_base();
            let audio_decoder =
                ffmpeg::codec::context::Context::from_parameters(audio_stream.parameters())
                    .map_err(|e| self.decode_err("audio codec context failed", e))?
                    .decoder()
                    .audio()
                    .map_err(|e| self.decode_err("audio decoder create failed", e))?;
            self.audio_decoder = Some(audio_decoder);
        }

        self.input = Some(input);
        tracing::debug!(
            asset_uri = %self.asset_uri,
            fps = ?self.detected_fps,
            has_audio = self.audio_stream_index.is_some(),
            "decoder opened"
        );
        Ok(())
    }

    fn seek_precise_to_ms(&mut self, target_ms: i64) -> Result<u32> {
        if self.input.is_none() {
            return Err(PlayoutError::InvariantViolation(
                "seek before open".into(),
            ));
        }
        // Rewinding an exhausted asset to zero would be an EOF loop, which
        // block-plan playout prohibits.
        if target_ms == 0 && self.eof {
            return Err(PlayoutError::SeekNotPossible(format!(
                "rewind to 0 after EOF on {} (looping prohibited)",
                self.asset_uri
            )));
        }
        if target_ms == 0 && !self.any_packet_read {
            self.admit_from_us = 0;
            return Ok(0);
        }

        let target_us = target_ms * 1000;
        let ts = target_us * ffmpeg::ffi::AV_TIME_BASE as i64 / 1_000_000;
        self.input
            .as_mut()
            .expect("input checked above")
            .seek(ts, ..=ts)
            .map_err(|e| {
                PlayoutError::SeekNotPossible(format!(
                    "seek to {} ms in {} failed: {}",
                    target_ms, self.asset_uri, e
                ))
            })?;
        if let Some(dec) = self.video_decoder.as_mut() {
            dec.flush();
        }
        if let Some(dec) = self.audio_decoder.as_mut() {
            dec.flush();
        }
        self.pending_video.clear();
        self.pending_audio.clear();
        self.admit_from_us = target_us;

        // Decode forward from the keyframe until a frame at/after the target
        // comes out; those decodes are the preroll.
        let mut preroll = 0u32;
        while self.pending_video.is_empty() {
            if self.interrupt.interrupted() {
                return Err(PlayoutError::Decode("seek interrupted".into()));
            }
            if !self.pump_preroll(&mut preroll)? {
                return Err(PlayoutError::SeekNotPossible(format!(
                    "EOF before reaching {} ms in {}",
                    target_ms, self.asset_uri
                )));
            }
        }
        tracing::debug!(
            asset_uri = %self.asset_uri,
            target_ms,
            preroll,
            "precise seek complete"
        );
        Ok(preroll)
    }

    fn video_fps(&self) -> Option<RationalFps> {
        self.detected_fps
    }

    fn decode_frame(&mut self) -> Result<Option<VideoFrame>> {
        loop {
            if let Some(frame) = self.pending_video.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }
            if self.interrupt.interrupted() {
                return Err(PlayoutError::Decode("decode interrupted".into()));
            }
            self.pump()?;
        }
    }

    fn take_pending_audio(&mut self) -> Option<AudioFrame> {
        self.pending_audio.pop_front()
    }

    fn is_eof(&self) -> bool {
        self.eof && self.pending_video.is_empty()
    }

    fn has_audio_stream(&self) -> bool {
        self.audio_stream_index.is_some()
    }

    fn set_interrupt_flags(&mut self, flags: InterruptFlags) {
        self.interrupt = flags;
    }

    fn pump(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.read_packet()? {
            Some((index, packet)) => {
                self.any_packet_read = true;
                if index == self.video_stream_index {
                    if let Some(dec) = self.video_decoder.as_mut() {
                        match dec.send_packet(&packet) {
                            Ok(()) => {}
                            Err(ffmpeg::Error::Other { errno })
                                if errno == ffmpeg::error::EAGAIN => {}
                            Err(e) => {
                                return Err(PlayoutError::Decode(format!(
                                    "video send_packet: {}",
                                    e
                                )))
                            }
                        }
                    }
                    self.receive_video_frames()?;
                } else if Some(index) == self.audio_stream_index {
                    if let Some(dec) = self.audio_decoder.as_mut() {
                        match dec.send_packet(&packet) {
                            Ok(()) => {}
                            Err(ffmpeg::Error::Other { errno })
                                if errno == ffmpeg::error::EAGAIN => {}
                            Err(e) => {
                                return Err(PlayoutError::Decode(format!(
                                    "audio send_packet: {}",
                                    e
                                )))
                            }
                        }
                    }
                    self.receive_audio_frames()?;
                }
                Ok(true)
            }
            None => {
                self.flush_decoders()?;
                self.eof = true;
                Ok(false)
            }
        }
    }
}

impl FfmpegDecoder {
    /// Read one packet; the returned stream index outlives the demuxer
    /// borrow so decode calls can follow.
    fn read_packet(&mut self) -> Result<Option<(usize, ffmpeg::codec::packet::Packet)>> {
        let input = self.input.as_mut().ok_or_else(|| {
            PlayoutError::InvariantViolation("pump before open".into())
        })?;
        Ok(input
            .packets()
            .next()
            .map(|(stream, packet)| (stream.index(), packet)))
    }

    /// One pump cycle during seek preroll: counts discarded video frames.
    fn pump_preroll(&mut self, preroll: &mut u32) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        match self.read_packet()? {
            Some((index, packet)) => {
                self.any_packet_read = true;
                if index == self.video_stream_index {
                    if let Some(dec) = self.video_decoder.as_mut() {
                        match dec.send_packet(&packet) {
                            Ok(()) => {}
                            Err(ffmpeg::Error::Other { errno })
                                if errno == ffmpeg::error::EAGAIN => {}
                            Err(e) => {
                                return Err(PlayoutError::Decode(format!(
                                    "video send_packet: {}",
                                    e
                                )))
                            }
                        }
                    }
                    *preroll += self.receive_video_frames()?;
                } else if Some(index) == self.audio_stream_index {
                    if let Some(dec) = self.audio_decoder.as_mut() {
                        let _ = dec.send_packet(&packet);
                    }
                    self.receive_audio_frames()?;
                }
                Ok(true)
            }
            None => {
                self.flush_decoders()?;
                self.eof = true;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_to_us() {
        // 90 kHz timebase: 90 ticks = 1 ms.
        let tb = ffmpeg::Rational::new(1, 90_000);
        assert_eq!(ts_to_us(90_000, tb), 1_000_000);
        assert_eq!(ts_to_us(3003, tb), 33_366);
    }

    #[test]
    fn test_unopened_decoder_rejects_seek() {
        let mut dec = FfmpegDecoder::new(
            "/nonexistent.mp4",
            OutputGeometry {
                width: 640,
                height: 360,
                fps: RationalFps::new(30, 1),
            },
        );
        assert!(dec.seek_precise_to_ms(1000).is_err());
    }
}
