//! Non-blocking socket sink: bounded byte queue plus a dedicated writer
//! worker draining to the fd.
//!
//! Invariants carried from the output contract:
//! - ingress never blocks (`try_consume_bytes`); the bounded queue absorbs
//!   backpressure
//! - no drops: overflow either detaches the slow consumer (detach mode) or
//!   rejects the write for the caller's bounded-wait path (throttle mode)
//! - honest liveness: `last_accepted_time` moves only when the kernel
//!   accepts bytes
//! - the fd MUST be non-blocking; a blocking fd would stall `send` and turn
//!   queue overflow into a false slow-consumer verdict (debug-asserted)

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

pub type DetachCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ThrottleCallback = Box<dyn Fn(bool) + Send + Sync>;

const HIGH_WATER_RATIO: f64 = 0.8;
const LOW_WATER_RATIO: f64 = 0.5;
const POLL_TIMEOUT_MS: libc::c_int = 100;

#[derive(Debug, Clone)]
pub struct SocketSinkConfig {
    pub name: String,
    pub buffer_capacity: usize,
    pub detach_on_overflow: bool,
}

impl Default for SocketSinkConfig {
    fn default() -> Self {
        Self {
            name: "SocketSink".into(),
            buffer_capacity: 2 * 1024 * 1024,
            detach_on_overflow: true,
        }
    }
}

struct QueueState {
    queue: VecDeque<Bytes>,
    buffer_size: usize,
}

struct Shared {
    name: String,
    capacity: usize,
    detach_on_overflow: bool,

    state: Mutex<QueueState>,
    queue_cv: Condvar,
    drain_cv: Condvar,

    // fd as a raw atomic so the writer can poll it without locking; the
    // OwnedFd below keeps it alive until drop.
    raw_fd: AtomicI32,
    owned_fd: Mutex<Option<OwnedFd>>,

    closed: AtomicBool,
    detached: AtomicBool,
    writer_stop: AtomicBool,
    throttling: AtomicBool,
    emission_gate_open: AtomicBool,

    bytes_enqueued: AtomicU64,
    bytes_delivered: AtomicU64,
    write_errors: AtomicU64,
    overflow_detach_count: AtomicU64,
    last_accepted_time: Mutex<Instant>,
    overflow_log_at: Mutex<Instant>,

    detach_callback: Mutex<Option<DetachCallback>>,
    throttle_callback: Mutex<Option<ThrottleCallback>>,
}

pub struct SocketSink {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SocketSink {
    /// Take ownership of a connected, non-blocking fd and start the writer
    /// worker. The sink closes the fd on detach/close.
    pub fn new(fd: OwnedFd, config: SocketSinkConfig) -> Arc<Self> {
        let raw = fd.as_raw_fd();
        debug_assert!(
            fd_is_nonblocking(raw),
            "SocketSink fd must have O_NONBLOCK set; a blocking fd causes false slow-consumer detach"
        );

        let shared = Arc::new(Shared {
            name: config.name,
            capacity: config.buffer_capacity,
            detach_on_overflow: config.detach_on_overflow,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                buffer_size: 0,
            }),
            queue_cv: Condvar::new(),
            drain_cv: Condvar::new(),
            raw_fd: AtomicI32::new(raw),
            owned_fd: Mutex::new(Some(fd)),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            writer_stop: AtomicBool::new(false),
            throttling: AtomicBool::new(false),
            emission_gate_open: AtomicBool::new(true),
            bytes_enqueued: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            overflow_detach_count: AtomicU64::new(0),
            last_accepted_time: Mutex::new(Instant::now()),
            overflow_log_at: Mutex::new(Instant::now() - Duration::from_secs(10)),
            detach_callback: Mutex::new(None),
            throttle_callback: Mutex::new(None),
        });

        let writer_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("sink-writer".into())
            .spawn(move || writer_loop(writer_shared))
            .expect("spawn sink writer");

        Arc::new(Self {
            shared,
            writer: Mutex::new(Some(handle)),
        })
    }

    pub fn set_detach_callback(&self, cb: DetachCallback) {
        *self.shared.detach_callback.lock() = Some(cb);
    }

    pub fn set_throttle_callback(&self, cb: ThrottleCallback) {
        *self.shared.throttle_callback.lock() = Some(cb);
    }

    /// Enqueue bytes for delivery. NEVER blocks. Returns false when the sink
    /// is closed/detached or (throttle mode) the buffer is full.
    pub fn try_consume_bytes(&self, data: &[u8]) -> bool {
        let sh = &self.shared;
        if sh.closed.load(Ordering::Acquire) || sh.detached.load(Ordering::Acquire) {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let mut state = sh.state.lock();
        let high_water = (sh.capacity as f64 * HIGH_WATER_RATIO) as usize;

        if state.buffer_size + data.len() > sh.capacity {
            if sh.detach_on_overflow {
                drop(state);
                self.detach(&format!(
                    "buffer overflow (incoming={} bytes)",
                    data.len()
                ));
                return false;
            }
            // Throttle mode: reject without detaching; the caller's bounded
            // wait owns the backpressure. Log at most once per second.
            let mut last = sh.overflow_log_at.lock();
            if last.elapsed() >= Duration::from_secs(1) {
                tracing::warn!(
                    sink = %sh.name,
                    buffer_size = state.buffer_size,
                    capacity = sh.capacity,
                    incoming = data.len(),
                    "sink buffer full (write rejected, not detaching)"
                );
                *last = Instant::now();
            }
            return false;
        }

        if !sh.throttling.load(Ordering::Acquire) && state.buffer_size + data.len() >= high_water
        {
            sh.throttling.store(true, Ordering::Release);
            tracing::info!(
                sink = %sh.name,
                buffer_size = state.buffer_size + data.len(),
                threshold = high_water,
                "sink high-water mark (throttling on)"
            );
            if let Some(cb) = sh.throttle_callback.lock().as_ref() {
                cb(true);
            }
        }

        state.queue.push_back(Bytes::copy_from_slice(data));
        state.buffer_size += data.len();
        sh.bytes_enqueued
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        drop(state);
        sh.queue_cv.notify_one();
        true
    }

    /// Blocking variant: wait up to `timeout` for buffer space, then
    /// enqueue. Returns false on timeout, close, or detach — never drops.
    pub fn wait_and_consume_bytes(&self, data: &[u8], timeout: Duration) -> bool {
        let sh = &self.shared;
        if sh.closed.load(Ordering::Acquire) || sh.detached.load(Ordering::Acquire) {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut state = sh.state.lock();
        while state.buffer_size + data.len() > sh.capacity {
            if sh.closed.load(Ordering::Acquire) || sh.detached.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if sh
                .drain_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return false;
            }
        }

        state.queue.push_back(Bytes::copy_from_slice(data));
        state.buffer_size += data.len();
        sh.bytes_enqueued
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        drop(state);
        sh.queue_cv.notify_one();
        true
    }

    /// One-shot slow-consumer detach: marks the sink dead, shuts down the
    /// socket (unblocking the writer), and fires the detach callback.
    /// All subsequent consume calls return false forever.
    pub fn detach(&self, reason: &str) {
        let sh = &self.shared;
        if sh
            .detached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        sh.overflow_detach_count.fetch_add(1, Ordering::Relaxed);
        let state = sh.state.lock();
        tracing::error!(
            sink = %sh.name,
            reason,
            bytes_enqueued = sh.bytes_enqueued.load(Ordering::Relaxed),
            bytes_delivered = sh.bytes_delivered.load(Ordering::Relaxed),
            buffer_size = state.buffer_size,
            capacity = sh.capacity,
            "slow consumer detach"
        );
        drop(state);

        sh.closed.store(true, Ordering::Release);
        sh.writer_stop.store(true, Ordering::Release);
        sh.queue_cv.notify_all();
        sh.drain_cv.notify_all();

        // Shut down (not close) so a writer mid-poll unblocks without an fd
        // reuse race; the fd itself is released at join time.
        let raw = sh.raw_fd.load(Ordering::Acquire);
        if raw >= 0 {
            unsafe {
                libc::shutdown(raw, libc::SHUT_RDWR);
            }
        }

        if let Some(cb) = sh.detach_callback.lock().as_ref() {
            cb(reason);
        }
    }

    /// Close the sink: stop and join the writer, then release the fd.
    /// Idempotent.
    pub fn close(&self) {
        let sh = &self.shared;
        if sh
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            sh.writer_stop.store(true, Ordering::Release);
            sh.queue_cv.notify_all();
            sh.drain_cv.notify_all();
        }
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
        sh.raw_fd.store(-1, Ordering::Release);
        let _ = sh.owned_fd.lock().take();
    }

    /// Park the writer before the first frame; bytes queue but nothing hits
    /// the socket until the gate opens.
    pub fn hold_emission(&self) {
        self.shared
            .emission_gate_open
            .store(false, Ordering::Release);
    }

    pub fn open_emission_gate(&self) {
        self.shared.emission_gate_open.store(true, Ordering::Release);
        self.shared.queue_cv.notify_all();
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_throttling(&self) -> bool {
        self.shared.throttling.load(Ordering::Acquire)
    }

    pub fn bytes_enqueued(&self) -> u64 {
        self.shared.bytes_enqueued.load(Ordering::Relaxed)
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.shared.bytes_delivered.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.shared.write_errors.load(Ordering::Relaxed)
    }

    pub fn overflow_detach_count(&self) -> u64 {
        self.shared.overflow_detach_count.load(Ordering::Relaxed)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.state.lock().buffer_size
    }

    /// Time of the last successful `send` into the kernel buffer. The only
    /// source of truth for downstream liveness.
    pub fn last_accepted_time(&self) -> Instant {
        *self.shared.last_accepted_time.lock()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for SocketSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn fd_is_nonblocking(fd: RawFd) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    flags >= 0 && (flags & libc::O_NONBLOCK) != 0
}

fn writer_loop(sh: Arc<Shared>) {
    while !sh.writer_stop.load(Ordering::Acquire) {
        // Wait for a packet (and an open emission gate).
        let packet = {
            let mut state = sh.state.lock();
            sh.queue_cv
                .wait_for(&mut state, Duration::from_millis(POLL_TIMEOUT_MS as u64));
            if sh.writer_stop.load(Ordering::Acquire) {
                break;
            }
            if state.queue.is_empty() || !sh.emission_gate_open.load(Ordering::Acquire) {
                continue;
            }
            let packet = state.queue.pop_front().expect("checked non-empty");
            state.buffer_size -= packet.len();
            packet
        };
        // Space freed: wake any producer blocked in wait_and_consume_bytes.
        sh.drain_cv.notify_one();

        // Drain this packet to the socket.
        let mut offset = 0usize;
        while offset < packet.len() && !sh.writer_stop.load(Ordering::Acquire) {
            let fd = sh.raw_fd.load(Ordering::Acquire);
            if fd < 0 {
                break;
            }

            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            };
            let poll_ret = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
            if poll_ret < 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                let count = sh.write_errors.fetch_add(1, Ordering::Relaxed);
                if count % 256 == 0 {
                    tracing::warn!(sink = %sh.name, error = %errno, "sink poll error");
                }
                break;
            }
            if poll_ret == 0 {
                continue; // Timeout: recheck stop flag.
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                break;
            }

            let n = unsafe {
                libc::send(
                    fd,
                    packet[offset..].as_ptr() as *const libc::c_void,
                    packet.len() - offset,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error();
                if errno == Some(libc::EAGAIN)
                    || errno == Some(libc::EWOULDBLOCK)
                    || errno == Some(libc::EINTR)
                {
                    continue;
                }
                let count = sh.write_errors.fetch_add(1, Ordering::Relaxed);
                if count % 256 == 0 {
                    tracing::warn!(
                        sink = %sh.name,
                        errno = ?errno,
                        "sink send error"
                    );
                }
                break;
            }

            offset += n as usize;
            sh.bytes_delivered.fetch_add(n as u64, Ordering::Relaxed);
            *sh.last_accepted_time.lock() = Instant::now();
        }

        // Low-water check after draining a packet.
        let state = sh.state.lock();
        let low_water = (sh.capacity as f64 * LOW_WATER_RATIO) as usize;
        if sh.throttling.load(Ordering::Acquire) && state.buffer_size < low_water {
            sh.throttling.store(false, Ordering::Release);
            tracing::info!(
                sink = %sh.name,
                buffer_size = state.buffer_size,
                threshold = low_water,
                "sink low-water mark (throttling off)"
            );
            if let Some(cb) = sh.throttle_callback.lock().as_ref() {
                cb(false);
            }
        }
    }
}
