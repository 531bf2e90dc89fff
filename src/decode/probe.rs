//! Asset prober: duration and stream layout of a media URI.
//!
//! Used during preparation to reject segments whose offset lies past the
//! asset's end before any decoder state is built.

use ffmpeg_next as ffmpeg;

use crate::error::{PlayoutError, Result};
use crate::fps::RationalFps;

/// What the prober learned about an asset.
#[derive(Debug, Clone)]
pub struct AssetProbe {
    pub asset_uri: String,
    pub duration_ms: i64,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_fps: Option<RationalFps>,
    pub width: u32,
    pub height: u32,
}

impl AssetProbe {
    /// True when the asset can cover `duration_ms` of content starting at
    /// `offset_ms`.
    pub fn covers(&self, offset_ms: i64, duration_ms: i64) -> bool {
        self.duration_ms >= offset_ms + duration_ms
    }
}

/// Open the container briefly and extract duration/stream facts.
pub fn probe_asset(asset_uri: &str) -> Result<AssetProbe> {
    let input = ffmpeg::format::input(&asset_uri)
        .map_err(|e| PlayoutError::Probe(format!("cannot open {}: {}", asset_uri, e)))?;

    let duration_ms = if input.duration() > 0 {
        input.duration() * 1000 / ffmpeg::ffi::AV_TIME_BASE as i64
    } else {
        0
    };

    let mut probe = AssetProbe {
        asset_uri: asset_uri.to_string(),
        duration_ms,
        has_video: false,
        has_audio: false,
        video_fps: None,
        width: 0,
        height: 0,
    };

    if let Some(stream) = input.streams().best(ffmpeg::media::Type::Video) {
        probe.has_video = true;
        let rate = stream.avg_frame_rate();
        if rate.numerator() > 0 && rate.denominator() > 0 {
            probe.video_fps = Some(
                RationalFps::new(rate.numerator() as i64, rate.denominator() as i64).snapped(),
            );
        }
        if let Ok(ctx) =
            ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        {
            if let Ok(video) = ctx.decoder().video() {
                probe.width = video.width();
                probe.height = video.height();
            }
        }
    }
    probe.has_audio = input.streams().best(ffmpeg::media::Type::Audio).is_some();

    if !probe.has_video {
        return Err(PlayoutError::Probe(format!(
            "no video stream in {}",
            asset_uri
        )));
    }

    tracing::debug!(
        asset_uri,
        duration_ms = probe.duration_ms,
        fps = ?probe.video_fps,
        width = probe.width,
        height = probe.height,
        has_audio = probe.has_audio,
        "probed asset"
    );

    Ok(probe)
}
