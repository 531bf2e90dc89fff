//! Session metrics snapshot + Prometheus text rendering.

/// Point-in-time view of the pipeline, refreshed by the tick thread and
/// snapshotted by observers.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub channel_id: String,
    pub frames_emitted: u64,
    pub current_tick: i64,
    pub blocks_committed: u64,
    pub seams_taken: u64,
    pub seam_misses: u64,
    pub video_underflows: i64,
    pub audio_underflows: i64,
    pub audio_depth_ms: i64,
    pub video_depth_frames: usize,
    pub decode_latency_p95_us: i64,
    pub decode_latency_mean_us: i64,
    pub refill_rate_fps: f64,
    pub preparer_depth: usize,
    pub fallback_frames: u64,
    pub late_ticks: u64,
}

impl PipelineMetrics {
    /// Render in Prometheus exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        let label = format!("{{channel_id=\"{}\"}}", self.channel_id);
        let mut gauge = |name: &str, value: String| {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" gauge\n");
            out.push_str(name);
            out.push_str(&label);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        };
        gauge("playout_frames_emitted", self.frames_emitted.to_string());
        gauge("playout_current_tick", self.current_tick.to_string());
        gauge("playout_blocks_committed", self.blocks_committed.to_string());
        gauge("playout_seams_taken", self.seams_taken.to_string());
        gauge("playout_seam_misses", self.seam_misses.to_string());
        gauge("playout_video_underflows", self.video_underflows.to_string());
        gauge("playout_audio_underflows", self.audio_underflows.to_string());
        gauge("playout_audio_depth_ms", self.audio_depth_ms.to_string());
        gauge(
            "playout_video_depth_frames",
            self.video_depth_frames.to_string(),
        );
        gauge(
            "playout_decode_latency_p95_us",
            self.decode_latency_p95_us.to_string(),
        );
        gauge(
            "playout_decode_latency_mean_us",
            self.decode_latency_mean_us.to_string(),
        );
        gauge(
            "playout_refill_rate_fps",
            format!("{:.3}", self.refill_rate_fps),
        );
        gauge("playout_preparer_depth", self.preparer_depth.to_string());
        gauge("playout_fallback_frames", self.fallback_frames.to_string());
        gauge("playout_late_ticks", self.late_ticks.to_string());
        out
    }
}
