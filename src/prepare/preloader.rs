//! One-shot background preload of a block's `TickProducer`.
//!
//! Used for the session's first block (before the tick loop exists) so the
//! clock starts against a ready source. `start_preload` cancels any previous
//! in-flight preload; `is_ready`/`take_source` form a non-blocking
//! ownership-transfer protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::decode::{DecoderFactory, OutputGeometry};
use crate::plan::ValidatedBlock;
use crate::producer::TickProducer;

#[derive(Default)]
struct Slot {
    producer: Option<TickProducer>,
    audio_prime_depth_ms: i64,
    failed: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    cancel_requested: AtomicBool,
    in_progress: AtomicBool,
}

pub struct ProducerPreloader {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ProducerPreloader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerPreloader {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                cancel_requested: AtomicBool::new(false),
                in_progress: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start preloading `block` on a background thread. Any previous preload
    /// is cancelled first. The result is READY only if the audio prime depth
    /// was achieved.
    pub fn start_preload(
        &self,
        block: &ValidatedBlock,
        geometry: OutputGeometry,
        min_audio_prime_ms: i64,
        factory: Arc<dyn DecoderFactory>,
    ) {
        self.cancel();
        self.shared.cancel_requested.store(false, Ordering::Release);
        {
            let mut slot = self.shared.slot.lock();
            *slot = Slot::default();
        }
        self.shared.in_progress.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let block = block.clone();
        let handle = std::thread::Builder::new()
            .name("producer-preload".into())
            .spawn(move || {
                let mut producer = TickProducer::new(geometry, factory);
                let outcome = producer.assign_block(&block, min_audio_prime_ms);
                let mut slot = shared.slot.lock();
                if shared.cancel_requested.load(Ordering::Acquire) {
                    shared.in_progress.store(false, Ordering::Release);
                    return;
                }
                match outcome {
                    Ok(()) => {
                        slot.audio_prime_depth_ms = producer.audio_prime_depth_ms();
                        slot.producer = Some(producer);
                    }
                    Err(e) => {
                        slot.failed = true;
                        tracing::warn!(
                            block_id = %block.block_id(),
                            error = %e,
                            "block preload failed"
                        );
                    }
                }
                shared.in_progress.store(false, Ordering::Release);
            })
            .expect("spawn producer preloader");
        *self.handle.lock() = Some(handle);
    }

    /// Non-blocking: background work finished with a ready producer.
    pub fn is_ready(&self) -> bool {
        self.shared.slot.lock().producer.is_some()
    }

    /// Non-blocking: a preload worker is active with no result yet.
    pub fn is_running(&self) -> bool {
        self.shared.in_progress.load(Ordering::Acquire) && !self.is_ready()
    }

    /// The last completed preload ended in failure.
    pub fn has_failed(&self) -> bool {
        self.shared.slot.lock().failed
    }

    /// Audio prime depth (ms) achieved by the last completed preload.
    pub fn audio_prime_depth_ms(&self) -> i64 {
        self.shared.slot.lock().audio_prime_depth_ms
    }

    /// Move the preloaded producer out, if ready. After this the preloader
    /// is idle.
    pub fn take_source(&self) -> Option<TickProducer> {
        let producer = self.shared.slot.lock().producer.take()?;
        // Worker has already exited (it published then returned).
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Some(producer)
    }

    /// Cancel any in-flight preload and join the worker. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        let mut slot = self.shared.slot.lock();
        slot.producer = None;
        self.shared.in_progress.store(false, Ordering::Release);
    }
}

impl Drop for ProducerPreloader {
    fn drop(&mut self) {
        self.cancel();
    }
}
