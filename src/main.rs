//! Frame-accurate continuous playout engine.
//!
//! Consumes time-bounded block plans just-in-time, decodes and cadence-
//! resolves their segments, and emits a continuous wall-clock-paced A/V
//! stream over a network sink — with a durable evidence trail of everything
//! that aired. Any contract it cannot satisfy terminates the session
//! immediately with a recorded reason.

#![allow(dead_code)]

mod buffer;
mod clock;
mod config;
mod decode;
mod error;
mod evidence;
mod fps;
#[cfg(test)]
mod integration;
mod media;
mod pipeline;
mod plan;
mod prepare;
mod producer;
mod sink;

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::clock::{RealtimeWait, SessionClock};
use crate::config::EngineConfig;
use crate::decode::FfmpegDecoderFactory;
use crate::error::{PlanRejection, PlayoutError, Result};
use crate::evidence::{EvidenceEmitter, EvidenceSpool, EvidenceStreamer};
use crate::pipeline::{PipelineManager, SessionContext};
use crate::plan::BlockPlan;
use crate::sink::{FrameStream, SocketSink, SocketSinkConfig};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "playout-server";

fn main() -> Result<()> {
    // Load configuration first: the log filter lives there.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "playout.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        EngineConfig::from_file(&config_path)?
    } else {
        EngineConfig::default()
    };

    init_logging(&config.log_filter);
    tracing::info!("{} v{} starting", APP_NAME, VERSION);

    decode::init()?;
    tracing::info!("FFmpeg initialized ({})", decode::version_info());
    tracing::info!("configuration: {:?}", config);

    let channel_id = if config.channel_id.is_empty() {
        "channel-0".to_string()
    } else {
        config.channel_id.clone()
    };
    let session_id = format!("PS-{}", uuid::Uuid::new_v4());

    // Evidence: spool + emitter, and the Core stream when configured.
    let spool = Arc::new(EvidenceSpool::new(
        &channel_id,
        &session_id,
        &config.evidence.spool_root,
        config.evidence.max_spool_bytes,
    )?);
    let mut streamer = if config.evidence.core_address.is_empty() {
        None
    } else {
        Some(EvidenceStreamer::start(
            config.evidence.core_address.clone(),
            Arc::clone(&spool),
        ))
    };
    let emitter = Arc::new(EvidenceEmitter::new(
        Arc::clone(&spool),
        streamer.as_ref().map(|s| s.live_sender()),
    ));

    // Network sink: connected non-blocking TCP socket, owned by the sink.
    let stream = std::net::TcpStream::connect(&config.sink.address).map_err(|e| {
        PlayoutError::Sink(format!("cannot connect to {}: {}", config.sink.address, e))
    })?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let socket_sink = SocketSink::new(
        OwnedFd::from(stream),
        SocketSinkConfig {
            name: format!("sink:{}", config.sink.address),
            buffer_capacity: config.sink.buffer_capacity_bytes,
            detach_on_overflow: config.sink.detach_on_overflow,
        },
    );
    let frame_stream = FrameStream::new(
        Arc::clone(&socket_sink),
        !config.sink.detach_on_overflow,
        config.sink.throttle_wait_ms,
    );

    let ctx = SessionContext {
        channel_id: channel_id.clone(),
        playout_session_id: session_id.clone(),
        geometry: config.output.geometry(),
        min_audio_prime_ms: config.buffers.min_audio_prime_ms,
        audio_config: config.buffers.audio_config(),
        video_config: config.buffers.video_config(),
    };
    let clock = SessionClock::new(config.output.fps(), Box::new(RealtimeWait));
    let mut manager = PipelineManager::new(
        ctx,
        clock,
        Box::new(frame_stream),
        Arc::clone(&emitter),
        Arc::new(FfmpegDecoderFactory),
    );
    manager.start();
    tracing::info!(channel_id, session_id, "session created");

    // Feed block plans. In deployment this is Core's RPC; the standalone
    // binary reads a JSONL plan feed and pushes plans as slots free up.
    let plans = load_plan_feed(&config)?;
    let mut pending = plans.into_iter().peekable();
    while pending.peek().is_some() {
        if manager.termination().is_some() {
            break;
        }
        let plan = pending.peek().cloned().ok_or_else(|| {
            PlayoutError::InvariantViolation("peeked plan vanished".into())
        })?;
        match manager.submit_block(plan) {
            Ok(()) => {
                pending.next();
            }
            Err(PlayoutError::PlanRejected(PlanRejection::SlotOccupied { .. })) => {
                // Two-slot lookahead is full: feed again once a fence frees
                // the next slot.
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                tracing::error!(error = %e, "block plan rejected; skipping");
                pending.next();
            }
        }
    }

    // Run until the session terminates (fence underrun after the feed ends,
    // a fault, or operator stop).
    let (reason, detail) = loop {
        if let Some(t) = manager.termination() {
            break t;
        }
        std::thread::sleep(Duration::from_millis(200));
    };
    tracing::info!(reason = %reason, detail, "session over; shutting down");

    manager.stop();
    if let Some(s) = streamer.as_mut() {
        // Give the stream a moment to deliver the terminal evidence.
        std::thread::sleep(Duration::from_millis(300));
        s.stop();
    }
    Ok(())
}

/// Read the JSONL plan feed (one block plan per line), probing each
/// segment's asset so obviously broken feeds fail loudly at startup.
fn load_plan_feed(config: &EngineConfig) -> Result<Vec<BlockPlan>> {
    let Some(path) = &config.plan_feed else {
        tracing::warn!("no plan_feed configured; session will wait for nothing");
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path)?;
    let mut plans = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let plan: BlockPlan = serde_json::from_str(line).map_err(|e| {
            PlayoutError::Config(format!("{}:{}: {}", path.display(), lineno + 1, e))
        })?;
        for seg in &plan.segments {
            match decode::probe::probe_asset(&seg.asset_uri) {
                Ok(probe) => {
                    if !probe.covers(seg.asset_start_offset_ms, seg.duration_ms) {
                        tracing::warn!(
                            block_id = %plan.block_id,
                            segment_index = seg.segment_index,
                            asset_uri = %seg.asset_uri,
                            asset_duration_ms = probe.duration_ms,
                            "segment extends past asset end (pad tail expected)"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        block_id = %plan.block_id,
                        asset_uri = %seg.asset_uri,
                        error = %e,
                        "asset probe failed; preparation will decide"
                    );
                }
            }
        }
        plans.push(plan);
    }
    tracing::info!("loaded {} block plans from {}", plans.len(), path.display());
    Ok(plans)
}

/// Initialize logging with tracing
fn init_logging(filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
