//! Lookahead buffers between the decode side and the tick loop.
//!
//! Both are bounded FIFOs under a single mutex. Underflow after priming is a
//! hard fault for the caller; the buffers never zero-fill or hold-last. A
//! generation counter fences late pushes from torn-down fill workers.

pub mod audio;
pub mod video;

pub use audio::AudioLookaheadBuffer;
pub use video::{VideoBufferFrame, VideoLookaheadBuffer};
