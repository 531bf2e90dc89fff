//! Rational frame-rate arithmetic.
//!
//! Every pacing, fence, and sample-count decision in the engine derives from
//! a `(num, den)` pair; floating point appears only in diagnostics. The
//! whole/remainder split keeps per-frame deadlines exact over millions of
//! frames (no accumulated rounding).

use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Canonical broadcast rates. Detected source rates within ±1% of one of
/// these are snapped to the exact rational.
const CANONICAL_RATES: [(i64, i64); 8] = [
    (24000, 1001),
    (24, 1),
    (25, 1),
    (30000, 1001),
    (30, 1),
    (50, 1),
    (60000, 1001),
    (60, 1),
];

/// Tolerance for treating two rates as the same (and for canonical snapping).
/// 29.97 vs 30, probe noise, and container metadata rounding all fall inside.
pub const FPS_MATCH_TOLERANCE_RATIO: f64 = 0.01;

/// An exact frame rate as `num / den` frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RationalFps {
    pub num: i64,
    pub den: i64,
}

impl RationalFps {
    /// Construct a rational rate. Both terms must be positive.
    pub fn new(num: i64, den: i64) -> Self {
        debug_assert!(num > 0 && den > 0, "RationalFps terms must be positive");
        Self { num, den }
    }

    /// Snap a detected floating-point rate to the nearest canonical rational
    /// within tolerance, or fall back to a per-mille rational of the raw value.
    pub fn from_detected(fps: f64) -> Option<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return None;
        }
        for (num, den) in CANONICAL_RATES {
            let canonical = num as f64 / den as f64;
            if ((fps - canonical) / canonical).abs() <= FPS_MATCH_TOLERANCE_RATIO {
                return Some(Self::new(num, den));
            }
        }
        // Non-standard rate: keep three decimal places exactly.
        Some(Self::new((fps * 1000.0).round() as i64, 1000))
    }

    /// Snap an exact rational (e.g. from a container) to a canonical rate
    /// when it is within tolerance, otherwise keep it as-is.
    pub fn snapped(self) -> Self {
        let raw = self.as_f64();
        for (num, den) in CANONICAL_RATES {
            let canonical = num as f64 / den as f64;
            if ((raw - canonical) / canonical).abs() <= FPS_MATCH_TOLERANCE_RATIO {
                return Self::new(num, den);
            }
        }
        self
    }

    /// Diagnostic float value. Never used in control flow.
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// True when the two rates are within the match tolerance of each other.
    pub fn matches(&self, other: &RationalFps) -> bool {
        // Cross-multiplied integer comparison: |a/b - c/d| <= tol * c/d
        //   <=> |a*d - c*b| * 100 <= c * b   (tol = 1/100)
        let lhs = (self.num * other.den - other.num * self.den).abs() * 100;
        let rhs = other.num * self.den;
        lhs <= rhs
    }

    /// Nanoseconds from session start to the deadline of frame `n`,
    /// computed as `n*whole + (n*rem)/num` to avoid drift.
    pub fn frame_deadline_ns(&self, n: i64) -> i64 {
        let total = NANOS_PER_SECOND * self.den;
        let whole = total / self.num;
        let rem = total % self.num;
        n * whole + (n * rem) / self.num
    }

    /// Duration of one frame in 90 kHz units, rounded to nearest.
    pub fn frame_duration_90k(&self) -> i64 {
        (90_000 * self.den + self.num / 2) / self.num
    }

    /// PTS of frame `n` on the 90 kHz grid.
    pub fn frame_pts_90k(&self, n: i64) -> i64 {
        n * self.frame_duration_90k()
    }

    /// Duration of one frame in milliseconds, rounded to nearest.
    /// Diagnostics only — fences use exact channel-time math.
    pub fn frame_duration_ms(&self) -> i64 {
        (1000 * self.den + self.num / 2) / self.num
    }

    /// Duration of one frame in microseconds, rounded to nearest.
    pub fn frame_duration_us(&self) -> i64 {
        (1_000_000 * self.den + self.num / 2) / self.num
    }

    /// Exact channel-time in ms at tick `n`: `(n * den * 1000) / num`,
    /// truncated. Monotonic and drift-free.
    pub fn tick_to_ct_ms(&self, n: i64) -> i64 {
        (n as i128 * self.den as i128 * 1000 / self.num as i128) as i64
    }

    /// First tick whose channel-time is >= `ct_ms` (ceiling division).
    pub fn ct_ms_to_tick_ceil(&self, ct_ms: i64) -> i64 {
        let num = self.num as i128;
        let den_ms = self.den as i128 * 1000;
        ((ct_ms as i128 * num + den_ms - 1) / den_ms) as i64
    }

    /// Number of output frames covering `duration_ms`, rounded to nearest.
    /// Exact for canonical rates with on-grid durations (e.g. 10 010 ms at
    /// 30000/1001 -> 300).
    pub fn frames_for_duration_ms(&self, duration_ms: i64) -> i64 {
        let num = self.num as i128;
        let den_ms = self.den as i128 * 1000;
        ((duration_ms as i128 * num + den_ms / 2) / den_ms) as i64
    }

    /// Audio samples owed up to (not including) tick `n` at `sample_rate`.
    ///
    /// The per-tick pop is the difference of two cumulative values, which
    /// keeps any one-second window within ±1 sample of `sample_rate` for
    /// every rational rate (a rounded per-tick constant does not).
    pub fn cumulative_samples(&self, n: i64, sample_rate: i64) -> i64 {
        (n as i128 * sample_rate as i128 * self.den as i128 / self.num as i128) as i64
    }

    /// Samples to pop for tick `n`.
    pub fn samples_for_tick(&self, n: i64, sample_rate: i64) -> i64 {
        self.cumulative_samples(n + 1, sample_rate) - self.cumulative_samples(n, sample_rate)
    }
}

impl std::fmt::Display for RationalFps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}
