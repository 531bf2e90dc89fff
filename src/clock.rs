//! Session clock: rational frame timing anchored to a monotonic epoch.
//!
//! The clock owns two anchors captured at `start()`: a `std::time::Instant`
//! for pacing and a UTC epoch (ms) for schedule reporting. Pacing never
//! consults UTC; UTC never moves after start. A new session requires an
//! explicit `reset_epoch_for_new_session()`.

use std::time::{Duration, Instant};

use crate::error::{PlayoutError, Result};
use crate::fps::RationalFps;

/// Pluggable pacing behavior for `SessionClock::wait_for_frame`.
///
/// Production sleeps to the absolute deadline; tests inject the
/// deterministic variant and the loop free-runs.
pub trait WaitStrategy: Send + Sync {
    fn wait_until(&self, deadline: Instant);
}

/// Sleeps until the deadline using the OS timer.
pub struct RealtimeWait;

impl WaitStrategy for RealtimeWait {
    fn wait_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Returns immediately; frame indices advance as fast as the loop runs.
pub struct DeterministicWait;

impl WaitStrategy for DeterministicWait {
    fn wait_until(&self, _deadline: Instant) {}
}

/// Frame-indexed session clock.
pub struct SessionClock {
    fps: RationalFps,
    wait: Box<dyn WaitStrategy>,
    session_start: Option<Instant>,
    session_epoch_utc_ms: i64,
}

impl SessionClock {
    pub fn new(fps: RationalFps, wait: Box<dyn WaitStrategy>) -> Self {
        Self {
            fps,
            wait,
            session_start: None,
            session_epoch_utc_ms: 0,
        }
    }

    /// Capture the monotonic and UTC anchors. Call exactly once per session,
    /// after any blocking setup I/O so tick 0 is not born late.
    pub fn start(&mut self) -> Result<()> {
        if self.session_start.is_some() {
            return Err(PlayoutError::InvariantViolation(
                "SessionClock::start called twice".into(),
            ));
        }
        self.session_start = Some(Instant::now());
        self.session_epoch_utc_ms = chrono::Utc::now().timestamp_millis();
        Ok(())
    }

    /// Clear both anchors between sessions. Never called mid-session.
    pub fn reset_epoch_for_new_session(&mut self) {
        self.session_start = None;
        self.session_epoch_utc_ms = 0;
    }

    pub fn is_started(&self) -> bool {
        self.session_start.is_some()
    }

    pub fn fps(&self) -> RationalFps {
        self.fps
    }

    /// UTC wall time (ms) captured at `start()`. Reporting only.
    pub fn session_epoch_utc_ms(&self) -> i64 {
        self.session_epoch_utc_ms
    }

    /// Projected UTC time (ms) of frame `n`, for evidence reporting.
    pub fn frame_utc_ms(&self, n: i64) -> i64 {
        self.session_epoch_utc_ms + self.fps.frame_deadline_ns(n) / 1_000_000
    }

    pub fn frame_pts_90k(&self, n: i64) -> i64 {
        self.fps.frame_pts_90k(n)
    }

    /// Absolute deadline for frame `n`. Pure arithmetic, no side effects.
    pub fn deadline_for(&self, n: i64) -> Result<Instant> {
        let start = self.session_start.ok_or_else(|| {
            PlayoutError::InvariantViolation("SessionClock queried before start".into())
        })?;
        Ok(start + Duration::from_nanos(self.fps.frame_deadline_ns(n) as u64))
    }

    /// Block (per the wait strategy) until it is time for frame `n`.
    pub fn wait_for_frame(&self, n: i64) -> Result<()> {
        let deadline = self.deadline_for(n)?;
        self.wait.wait_until(deadline);
        Ok(())
    }

    /// How late frame `n` is being serviced, in microseconds (0 if early).
    pub fn lateness_us(&self, n: i64) -> Result<i64> {
        let deadline = self.deadline_for(n)?;
        let now = Instant::now();
        Ok(now
            .checked_duration_since(deadline)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0))
    }
}
