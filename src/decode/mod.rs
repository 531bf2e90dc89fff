//! Decoder capability surface.
//!
//! The engine never talks to libavformat/libavcodec directly; it consumes
//! this trait. Production uses `decode::ffmpeg::FfmpegDecoder`; the
//! deterministic test harness injects a fake. One decoder instance serves
//! one block (or one synthetic single-segment block).

pub mod ffmpeg;
pub mod probe;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::fps::RationalFps;
use crate::media::{AudioFrame, VideoFrame};

/// Borrowed stop flags wired into the decoder's I/O path.
///
/// The fill worker's stop and the session stop both abort blocking reads
/// promptly; the decoder polls these between packet cycles.
#[derive(Clone, Default)]
pub struct InterruptFlags {
    pub fill_stop: Option<Arc<AtomicBool>>,
    pub session_stop: Option<Arc<AtomicBool>>,
}

impl InterruptFlags {
    pub fn interrupted(&self) -> bool {
        let hit = |f: &Option<Arc<AtomicBool>>| {
            f.as_ref()
                .map(|a| a.load(Ordering::Acquire))
                .unwrap_or(false)
        };
        hit(&self.fill_stop) || hit(&self.session_stop)
    }
}

/// Output geometry a decoder must deliver: scaled video at the session's
/// dimensions, audio already in house format.
#[derive(Debug, Clone, Copy)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: RationalFps,
}

/// Abstract media decoder for one asset.
pub trait Decoder: Send {
    /// Open the container and codecs. Must be called before anything else.
    fn open(&mut self) -> Result<()>;

    /// Seek so the next decoded video frame lands at or after `target_ms`,
    /// decoding and discarding preroll frames as needed. Returns the number
    /// of frames discarded. Errors mean the position is unreachable
    /// (including a rewind-to-zero on an exhausted, non-looping asset).
    fn seek_precise_to_ms(&mut self, target_ms: i64) -> Result<u32>;

    /// Source frame rate as detected from the container/stream, snapped to
    /// canonical rationals. `None` until probed/opened.
    fn video_fps(&self) -> Option<RationalFps>;

    /// Decode the next video frame. `Ok(None)` means end of stream. Audio
    /// encountered along the way is queued for `take_pending_audio`.
    fn decode_frame(&mut self) -> Result<Option<VideoFrame>>;

    /// Pop one decoded house-format audio frame, if any is queued.
    fn take_pending_audio(&mut self) -> Option<AudioFrame>;

    fn is_eof(&self) -> bool;

    fn has_audio_stream(&self) -> bool;

    /// Install stop flags observed by blocking I/O.
    fn set_interrupt_flags(&mut self, flags: InterruptFlags);

    /// Process one packet-dispatch cycle (demux + decode side effects),
    /// queueing any incidental audio. Returns `false` once the demuxer is
    /// exhausted. `decode_frame` is implemented on top of this.
    fn pump(&mut self) -> Result<bool>;
}

/// Opens decoders for asset URIs. The pipeline and preparation workers share
/// one factory; tests swap in a deterministic one.
pub trait DecoderFactory: Send + Sync {
    fn open_decoder(&self, asset_uri: &str, geometry: OutputGeometry) -> Result<Box<dyn Decoder>>;
}

/// Production factory backed by FFmpeg.
pub struct FfmpegDecoderFactory;

impl DecoderFactory for FfmpegDecoderFactory {
    fn open_decoder(&self, asset_uri: &str, geometry: OutputGeometry) -> Result<Box<dyn Decoder>> {
        let mut decoder = Box::new(ffmpeg::FfmpegDecoder::new(asset_uri, geometry));
        decoder.open()?;
        Ok(decoder)
    }
}

/// Initialize the FFmpeg runtime once at startup and quiet its log output.
pub fn init() -> Result<()> {
    ffmpeg_next::init()
        .map_err(|e| crate::error::PlayoutError::Decode(format!("ffmpeg init failed: {}", e)))?;
    unsafe {
        ffmpeg_next::ffi::av_log_set_level(ffmpeg_next::ffi::AV_LOG_WARNING as i32);
    }
    Ok(())
}

/// FFmpeg library version string for startup logging.
pub fn version_info() -> String {
    format!("libavformat {}", unsafe {
        ffmpeg_next::ffi::avformat_version()
    })
}
