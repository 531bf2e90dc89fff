//! Engine configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::buffer::audio::AudioBufferConfig;
use crate::buffer::video::VideoBufferConfig;
use crate::decode::OutputGeometry;
use crate::fps::RationalFps;

/// Output geometry and cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output frame width
    pub width: u32,

    /// Output frame height
    pub height: u32,

    /// House frame rate numerator
    pub fps_num: i64,

    /// House frame rate denominator
    pub fps_den: i64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps_num: 30000,
            fps_den: 1001,
        }
    }
}

impl OutputConfig {
    pub fn fps(&self) -> RationalFps {
        RationalFps::new(self.fps_num, self.fps_den)
    }

    pub fn geometry(&self) -> OutputGeometry {
        OutputGeometry {
            width: self.width,
            height: self.height,
            fps: self.fps(),
        }
    }
}

/// Lookahead buffer depths and priming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Audio lookahead target depth in milliseconds
    pub audio_target_depth_ms: i64,

    /// Audio low-water mark in milliseconds (enables audio boost below)
    pub audio_low_water_ms: i64,

    /// Audio high-water mark in milliseconds (releases audio boost above)
    pub audio_high_water_ms: i64,

    /// Video lookahead target depth in frames
    pub video_target_depth_frames: usize,

    /// Video low-water mark in frames
    pub video_low_water_frames: usize,

    /// Audio depth below which the fill worker bursts past its video target
    pub audio_burst_threshold_ms: i64,

    /// Audio that must be pre-decoded before a source is committable
    pub min_audio_prime_ms: i64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            audio_target_depth_ms: 1000,
            audio_low_water_ms: 333,
            audio_high_water_ms: 800,
            video_target_depth_frames: 15,
            video_low_water_frames: 5,
            audio_burst_threshold_ms: 200,
            min_audio_prime_ms: 100,
        }
    }
}

impl BufferConfig {
    pub fn audio_config(&self) -> AudioBufferConfig {
        AudioBufferConfig {
            target_depth_ms: self.audio_target_depth_ms,
            low_water_ms: self.audio_low_water_ms,
            high_water_ms: self.audio_high_water_ms,
            ..AudioBufferConfig::default()
        }
    }

    pub fn video_config(&self) -> VideoBufferConfig {
        VideoBufferConfig {
            target_depth_frames: self.video_target_depth_frames,
            low_water_frames: self.video_low_water_frames,
            audio_burst_threshold_ms: self.audio_burst_threshold_ms,
        }
    }
}

/// Network sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Address of the downstream consumer (TCP host:port)
    pub address: String,

    /// Bounded output queue size in bytes
    pub buffer_capacity_bytes: usize,

    /// true: overflow detaches the consumer immediately.
    /// false: overflow throttles upstream with a bounded wait.
    pub detach_on_overflow: bool,

    /// Bounded wait for the throttle path, in milliseconds
    pub throttle_wait_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9300".into(),
            buffer_capacity_bytes: 2 * 1024 * 1024,
            detach_on_overflow: false,
            throttle_wait_ms: 40,
        }
    }
}

/// Evidence spool + stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Root directory for spool files
    pub spool_root: PathBuf,

    /// Core's evidence endpoint (empty disables streaming)
    pub core_address: String,

    /// Cap on pending-unacked spool bytes (0 = unlimited)
    pub max_spool_bytes: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            spool_root: PathBuf::from("/var/lib/playout/evidence_spool"),
            core_address: String::new(),
            max_spool_bytes: 0,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Channel identity reported in evidence
    #[serde(default)]
    pub channel_id: String,

    /// JSONL file of block plans to feed the session (one plan per line)
    #[serde(default)]
    pub plan_feed: Option<PathBuf>,

    /// Log filter (overridden by RUST_LOG)
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub buffers: BufferConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub evidence: EvidenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            plan_feed: None,
            log_filter: default_log_filter(),
            output: OutputConfig::default(),
            buffers: BufferConfig::default(),
            sink: SinkConfig::default(),
            evidence: EvidenceConfig::default(),
        }
    }
}

fn default_log_filter() -> String {
    "playout_server=info".into()
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            crate::error::PlayoutError::Config(format!("{}: {}", path, e))
        })
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &str) -> crate::error::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::PlayoutError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.output.width, 1920);
        assert_eq!(config.output.fps(), RationalFps::new(30000, 1001));
        assert_eq!(config.buffers.min_audio_prime_ms, 100);
        assert!(!config.sink.detach_on_overflow);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = EngineConfig::default();
        config.channel_id = "chan-1".into();
        config.sink.address = "10.0.0.5:9000".into();
        config.to_file(path.to_str().unwrap()).unwrap();

        let loaded = EngineConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.channel_id, "chan-1");
        assert_eq!(loaded.sink.address, "10.0.0.5:9000");
        assert_eq!(loaded.output.fps_num, 30000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: EngineConfig =
            toml::from_str("channel_id = \"c\"\n[output]\nwidth = 1280\nheight = 720\nfps_num = 25\nfps_den = 1\n").unwrap();
        assert_eq!(parsed.output.width, 1280);
        assert_eq!(parsed.buffers.audio_target_depth_ms, 1000);
        assert_eq!(parsed.log_filter, "playout_server=info");
    }
}
