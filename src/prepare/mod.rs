//! Background preparation for seam transitions.
//!
//! `SeamPreparer` is the persistent worker: it accepts segment and block
//! prep requests, processes them in `seam_frame` order (earliest due first),
//! and publishes finished `TickProducer`s into typed slots the tick thread
//! takes by move. `ProducerPreloader` (in `preloader`) is the one-shot
//! variant used for the session's first block.

pub mod preloader;

pub use preloader::ProducerPreloader;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::decode::{DecoderFactory, OutputGeometry};
use crate::plan::{SegmentType, ValidatedBlock};
use crate::producer::TickProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeamRequestType {
    Segment,
    Block,
}

/// A preparation request. For `Segment` the block is the synthetic
/// single-segment view; for `Block` it is the full next block.
pub struct SeamRequest {
    pub request_type: SeamRequestType,
    pub block: ValidatedBlock,
    /// Session frame index at which the result is needed. Defines queue
    /// priority: earliest due first.
    pub seam_frame: i64,
    pub geometry: OutputGeometry,
    pub min_audio_prime_ms: i64,
    /// Logging context.
    pub parent_block_id: String,
    pub segment_index: i32,
}

/// A finished preparation, ready for TAKE at the seam tick.
pub struct SeamResult {
    pub producer: TickProducer,
    pub audio_prime_depth_ms: i64,
    pub request_type: SeamRequestType,
    pub block_id: String,
    pub segment_index: i32,
    pub segment_type: SegmentType,
}

struct Inner {
    /// Sorted by `seam_frame` ascending.
    queue: Vec<SeamRequest>,
    segment_result: Option<SeamResult>,
    block_result: Option<SeamResult>,
    worker_active: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    work_cv: Condvar,
    idle_cv: Condvar,
    cancel_requested: AtomicBool,
    shutdown: AtomicBool,
    factory: Arc<dyn DecoderFactory>,
}

pub struct SeamPreparer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SeamPreparer {
    pub fn new(factory: Arc<dyn DecoderFactory>) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: Vec::new(),
                segment_result: None,
                block_result: None,
                worker_active: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            factory,
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("seam-preparer".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("spawn seam preparer");
        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a request; wakes the worker if idle.
    ///
    /// Safe to call while the worker is busy. Callers must NOT gate
    /// submission on `is_running()` — the queue is ordered by `seam_frame`,
    /// so an earlier-due request submitted while the worker is busy still
    /// runs before later ones. Gating on the worker state starves exactly
    /// those requests and produces a miss at seam time.
    pub fn submit(&self, request: SeamRequest) {
        {
            let mut inner = self.shared.inner.lock();
            let pos = inner
                .queue
                .partition_point(|r| r.seam_frame < request.seam_frame);
            inner.queue.insert(pos, request);
        }
        self.shared.work_cv.notify_one();
    }

    pub fn has_segment_result(&self) -> bool {
        self.shared.inner.lock().segment_result.is_some()
    }

    pub fn has_block_result(&self) -> bool {
        self.shared.inner.lock().block_result.is_some()
    }

    /// Move the prepared segment result out (ownership transfer).
    pub fn take_segment_result(&self) -> Option<SeamResult> {
        self.shared.inner.lock().segment_result.take()
    }

    /// Move the prepared block result out (ownership transfer).
    pub fn take_block_result(&self) -> Option<SeamResult> {
        self.shared.inner.lock().block_result.take()
    }

    /// Cancel all pending and in-progress work; blocks until the worker is
    /// idle, then clears both result slots.
    pub fn cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
        {
            let mut inner = self.shared.inner.lock();
            inner.queue.clear();
            self.shared.work_cv.notify_all();
            while inner.worker_active {
                self.shared.idle_cv.wait(&mut inner);
            }
            inner.segment_result = None;
            inner.block_result = None;
        }
        self.shared.cancel_requested.store(false, Ordering::Release);
    }

    /// Remove segment-type requests and any segment result. Block prep is
    /// precious and preserved.
    pub fn cancel_segment_requests(&self) {
        let mut inner = self.shared.inner.lock();
        inner
            .queue
            .retain(|r| r.request_type != SeamRequestType::Segment);
        inner.segment_result = None;
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().worker_active
    }

    pub fn has_pending(&self) -> bool {
        !self.shared.inner.lock().queue.is_empty()
    }

    pub fn pending_depth(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }
}

impl Drop for SeamPreparer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cancel_requested.store(true, Ordering::Release);
        self.shared.work_cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let request = {
            let mut inner = shared.inner.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if !inner.queue.is_empty() {
                    break;
                }
                shared.work_cv.wait(&mut inner);
            }
            inner.worker_active = true;
            inner.queue.remove(0)
        };

        process_request(&shared, request);

        let mut inner = shared.inner.lock();
        inner.worker_active = false;
        shared.idle_cv.notify_all();
    }
}

fn process_request(shared: &Arc<Shared>, req: SeamRequest) {
    if shared.cancel_requested.load(Ordering::Acquire) {
        return;
    }
    let mut producer = TickProducer::new(req.geometry, Arc::clone(&shared.factory));
    let segment_type = req
        .block
        .plan
        .segments
        .first()
        .map(|s| s.segment_type)
        .unwrap_or_default();

    match producer.assign_block(&req.block, req.min_audio_prime_ms) {
        Ok(()) => {
            if shared.cancel_requested.load(Ordering::Acquire) {
                return;
            }
            let result = SeamResult {
                audio_prime_depth_ms: producer.audio_prime_depth_ms(),
                request_type: req.request_type,
                block_id: req.block.block_id().to_string(),
                segment_index: req.segment_index,
                segment_type,
                producer,
            };
            let mut inner = shared.inner.lock();
            match req.request_type {
                SeamRequestType::Segment => inner.segment_result = Some(result),
                SeamRequestType::Block => inner.block_result = Some(result),
            }
            tracing::debug!(
                block_id = %req.block.block_id(),
                segment_index = req.segment_index,
                seam_frame = req.seam_frame,
                request_type = ?req.request_type,
                "seam preparation published"
            );
        }
        Err(e) => {
            tracing::warn!(
                block_id = %req.parent_block_id,
                segment_index = req.segment_index,
                seam_frame = req.seam_frame,
                error = %e,
                "seam preparation failed"
            );
        }
    }
}
