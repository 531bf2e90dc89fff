//! Session-lifetime audio lookahead.
//!
//! Producers push decoded house-format frames; the tick loop pops exact
//! per-tick sample counts, splitting frames as needed via a consumed-offset
//! cursor on the head frame. Depth is measured in milliseconds.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::media::{AudioFrame, HOUSE_BYTES_PER_SAMPLE, HOUSE_CHANNELS, HOUSE_SAMPLE_RATE};

/// Buffer configuration (all depths in milliseconds).
#[derive(Debug, Clone, Copy)]
pub struct AudioBufferConfig {
    pub target_depth_ms: i64,
    pub low_water_ms: i64,
    pub high_water_ms: i64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self {
            target_depth_ms: 1000,
            low_water_ms: 333,
            high_water_ms: 800,
            sample_rate: HOUSE_SAMPLE_RATE,
            channels: HOUSE_CHANNELS,
        }
    }
}

#[derive(Default)]
struct State {
    frames: std::collections::VecDeque<AudioFrame>,
    /// Samples already consumed from the head frame.
    head_consumed: usize,
    samples_in_buffer: i64,
    total_pushed: i64,
    total_popped: i64,
    underflow_count: i64,
    primed: bool,
    /// Bumped on every reset; pushes carrying a stale expectation are dropped.
    generation: u64,
}

pub struct AudioLookaheadBuffer {
    config: AudioBufferConfig,
    state: Mutex<State>,
}

impl AudioLookaheadBuffer {
    pub fn new(config: AudioBufferConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                generation: 1,
                ..State::default()
            }),
        }
    }

    pub fn config(&self) -> &AudioBufferConfig {
        &self.config
    }

    /// Append a frame. When `expected_generation` is nonzero and disagrees
    /// with the current generation, the push is a stale leftover from a
    /// torn-down fill worker and is silently dropped.
    pub fn push(&self, frame: AudioFrame, expected_generation: u64) {
        if frame.nb_samples == 0 {
            return;
        }
        let mut s = self.state.lock();
        if expected_generation != 0 && expected_generation != s.generation {
            tracing::debug!(
                nb_samples = frame.nb_samples,
                expected_generation,
                current_generation = s.generation,
                "audio push rejected (stale generation)"
            );
            return;
        }
        s.total_pushed += frame.nb_samples as i64;
        s.samples_in_buffer += frame.nb_samples as i64;
        s.primed = true;
        s.frames.push_back(frame);
    }

    /// Pop exactly `samples_needed` samples. On underflow nothing is consumed,
    /// the underflow counter increments, and `None` is returned — the caller
    /// treats that as a hard fault. The buffer never zero-fills.
    pub fn try_pop_samples(&self, samples_needed: usize) -> Option<AudioFrame> {
        if samples_needed == 0 {
            return Some(AudioFrame {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
                nb_samples: 0,
                data: Bytes::new(),
                pts_us: 0,
            });
        }

        let mut s = self.state.lock();
        if s.samples_in_buffer < samples_needed as i64 {
            s.underflow_count += 1;
            return None;
        }

        let mut out = Vec::with_capacity(samples_needed * HOUSE_BYTES_PER_SAMPLE);
        let pts_us = s.frames.front().map(|f| f.pts_us).unwrap_or(0);
        let mut remaining = samples_needed;

        while remaining > 0 {
            let head_consumed = s.head_consumed;
            let (take, drained) = {
                let head = s
                    .frames
                    .front()
                    .expect("samples_in_buffer accounted for queued frames");
                let avail = head.nb_samples - head_consumed;
                let take = avail.min(remaining);
                let start = head_consumed * HOUSE_BYTES_PER_SAMPLE;
                let end = (head_consumed + take) * HOUSE_BYTES_PER_SAMPLE;
                out.extend_from_slice(&head.data[start..end]);
                (take, take == avail)
            };
            remaining -= take;
            if drained {
                s.frames.pop_front();
                s.head_consumed = 0;
            } else {
                s.head_consumed += take;
            }
        }

        s.samples_in_buffer -= samples_needed as i64;
        s.total_popped += samples_needed as i64;

        Some(AudioFrame {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            nb_samples: samples_needed,
            data: Bytes::from(out),
            pts_us,
        })
    }

    pub fn depth_ms(&self) -> i64 {
        let s = self.state.lock();
        s.samples_in_buffer * 1000 / self.config.sample_rate as i64
    }

    pub fn depth_samples(&self) -> i64 {
        self.state.lock().samples_in_buffer
    }

    pub fn total_pushed(&self) -> i64 {
        self.state.lock().total_pushed
    }

    pub fn total_popped(&self) -> i64 {
        self.state.lock().total_popped
    }

    pub fn underflow_count(&self) -> i64 {
        self.state.lock().underflow_count
    }

    pub fn is_primed(&self) -> bool {
        self.state.lock().primed
    }

    pub fn current_generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_below_low_water(&self) -> bool {
        let s = self.state.lock();
        if !s.primed {
            return false;
        }
        s.samples_in_buffer * 1000 / self.config.sample_rate as i64 < self.config.low_water_ms
    }

    pub fn is_above_high_water(&self) -> bool {
        let s = self.state.lock();
        s.samples_in_buffer * 1000 / self.config.sample_rate as i64 >= self.config.high_water_ms
    }

    /// Clear queue, cursor, counters and primed flag; bump the generation so
    /// any in-flight push from an old fill worker lands in the void.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        let old_depth_ms = s.samples_in_buffer * 1000 / self.config.sample_rate as i64;
        s.generation += 1;
        s.frames.clear();
        s.head_consumed = 0;
        s.samples_in_buffer = 0;
        s.total_pushed = 0;
        s.total_popped = 0;
        s.underflow_count = 0;
        s.primed = false;
        tracing::debug!(
            old_depth_ms,
            new_generation = s.generation,
            "audio buffer reset"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(nb: usize, fill: u8) -> AudioFrame {
        AudioFrame {
            sample_rate: HOUSE_SAMPLE_RATE,
            channels: HOUSE_CHANNELS,
            nb_samples: nb,
            data: Bytes::from(vec![fill; nb * HOUSE_BYTES_PER_SAMPLE]),
            pts_us: 0,
        }
    }

    #[test]
    fn test_exact_pop_across_frames() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig::default());
        buf.push(frame(1000, 1), 0);
        buf.push(frame(1000, 2), 0);

        let out = buf.try_pop_samples(1500).unwrap();
        assert_eq!(out.nb_samples, 1500);
        assert_eq!(out.data.len(), 1500 * HOUSE_BYTES_PER_SAMPLE);
        // First 1000 samples from frame 1, next 500 from frame 2.
        assert_eq!(out.data[999 * HOUSE_BYTES_PER_SAMPLE], 1);
        assert_eq!(out.data[1000 * HOUSE_BYTES_PER_SAMPLE], 2);
        assert_eq!(buf.depth_samples(), 500);
    }

    #[test]
    fn test_partial_head_cursor_survives_pops() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig::default());
        buf.push(frame(1000, 7), 0);
        assert_eq!(buf.try_pop_samples(300).unwrap().nb_samples, 300);
        assert_eq!(buf.try_pop_samples(300).unwrap().nb_samples, 300);
        assert_eq!(buf.depth_samples(), 400);
        assert_eq!(buf.total_popped(), 600);
    }

    #[test]
    fn test_underflow_is_hard_fault_no_state_change() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig::default());
        buf.push(frame(100, 0), 0);
        assert!(buf.try_pop_samples(101).is_none());
        assert_eq!(buf.underflow_count(), 1);
        // Nothing consumed by the failed pop.
        assert_eq!(buf.depth_samples(), 100);
        assert_eq!(buf.try_pop_samples(100).unwrap().nb_samples, 100);
    }

    #[test]
    fn test_generation_fences_stale_push() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig::default());
        let old_gen = buf.current_generation();
        buf.push(frame(100, 0), old_gen);
        assert_eq!(buf.depth_samples(), 100);

        buf.reset();
        // Late push from the old fill worker: dropped silently.
        buf.push(frame(100, 0), old_gen);
        assert_eq!(buf.depth_samples(), 0);
        assert!(!buf.is_primed());

        // Push tagged with the new generation is accepted.
        buf.push(frame(50, 0), buf.current_generation());
        assert_eq!(buf.depth_samples(), 50);
    }

    #[test]
    fn test_untagged_push_always_accepted() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig::default());
        buf.reset();
        buf.push(frame(10, 0), 0);
        assert_eq!(buf.depth_samples(), 10);
    }

    #[test]
    fn test_water_marks() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig {
            target_depth_ms: 1000,
            low_water_ms: 333,
            high_water_ms: 800,
            ..Default::default()
        });
        // Unprimed buffer is not "below low water".
        assert!(!buf.is_below_low_water());
        buf.push(frame(4800, 0), 0); // 100 ms
        assert!(buf.is_below_low_water());
        assert!(!buf.is_above_high_water());
        buf.push(frame(48000, 0), 0); // +1000 ms
        assert!(!buf.is_below_low_water());
        assert!(buf.is_above_high_water());
    }

    #[test]
    fn test_zero_sample_pop_is_noop_success() {
        let buf = AudioLookaheadBuffer::new(AudioBufferConfig::default());
        let out = buf.try_pop_samples(0).unwrap();
        assert_eq!(out.nb_samples, 0);
        assert_eq!(buf.underflow_count(), 0);
    }
}
