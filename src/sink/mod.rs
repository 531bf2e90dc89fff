//! Output side: byte-transparent socket sink plus the frame-level trait the
//! tick loop emits through.

pub mod socket;

pub use socket::{SocketSink, SocketSinkConfig};

use crate::media::{AudioFrame, VideoFrame};

/// Why an emit was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEmitError {
    /// Sink detached (slow consumer or throttle timeout). Terminal.
    Detached,
    /// Sink already closed.
    Closed,
}

/// Frame-level output abstraction for the tick loop. Exactly one call per
/// tick; the implementation owns interleaving and byte framing.
pub trait OutputSink: Send {
    fn emit(
        &mut self,
        video: &VideoFrame,
        audio: &AudioFrame,
        pts_90k: i64,
    ) -> Result<(), SinkEmitError>;

    fn is_detached(&self) -> bool;

    fn close(&mut self);
}

/// Simple self-delimiting A/V framing over a `SocketSink`.
///
/// The downstream muxer is an external collaborator; this stream carries one
/// record per payload: tag byte (`V`/`A`), 90 kHz PTS, payload length,
/// payload bytes. The socket sink itself stays byte-transparent.
pub struct FrameStream {
    sink: std::sync::Arc<SocketSink>,
    /// Upstream-throttle mode: block for space (bounded) instead of
    /// detaching on a full buffer.
    throttle: bool,
    throttle_wait: std::time::Duration,
    scratch: Vec<u8>,
}

impl FrameStream {
    pub fn new(
        sink: std::sync::Arc<SocketSink>,
        throttle: bool,
        throttle_wait_ms: u64,
    ) -> Self {
        Self {
            sink,
            throttle,
            throttle_wait: std::time::Duration::from_millis(throttle_wait_ms),
            scratch: Vec::new(),
        }
    }

    fn frame_record(scratch: &mut Vec<u8>, tag: u8, pts_90k: i64, payload: &[u8]) {
        scratch.clear();
        scratch.reserve(13 + payload.len());
        scratch.push(tag);
        scratch.extend_from_slice(&pts_90k.to_be_bytes());
        scratch.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        scratch.extend_from_slice(payload);
    }

    fn push(&mut self) -> Result<(), SinkEmitError> {
        let ok = if self.throttle {
            let accepted = self
                .sink
                .wait_and_consume_bytes(&self.scratch, self.throttle_wait);
            if !accepted && !self.sink.is_detached() && !self.sink.is_closed() {
                // Throttle window expired with no space: the consumer is not
                // keeping up. No drops allowed, so detach and go off-air.
                self.sink.detach("throttle timeout (consumer stalled)");
            }
            accepted
        } else {
            self.sink.try_consume_bytes(&self.scratch)
        };
        if ok {
            Ok(())
        } else if self.sink.is_detached() {
            Err(SinkEmitError::Detached)
        } else {
            Err(SinkEmitError::Closed)
        }
    }
}

impl OutputSink for FrameStream {
    fn emit(
        &mut self,
        video: &VideoFrame,
        audio: &AudioFrame,
        pts_90k: i64,
    ) -> Result<(), SinkEmitError> {
        let mut scratch = std::mem::take(&mut self.scratch);
        Self::frame_record(&mut scratch, b'V', pts_90k, &video.data);
        self.scratch = scratch;
        self.push()?;

        let mut scratch = std::mem::take(&mut self.scratch);
        Self::frame_record(&mut scratch, b'A', pts_90k, &audio.data);
        self.scratch = scratch;
        self.push()
    }

    fn is_detached(&self) -> bool {
        self.sink.is_detached()
    }

    fn close(&mut self) {
        self.sink.close();
    }
}
