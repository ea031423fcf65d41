//! The simulation clock shared by all workers (spec.md §4.3).
//!
//! `Clock` is a read-mostly struct: every field is updated with a handful of
//! atomics rather than a mutex, so `now()` never blocks a worker that is
//! merely reading the time (spec.md §5: "the Clock is a read-mostly struct
//! with atomic updates on pause/resume/scale-change").

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;

use crate::error::{Error, Result};

fn wall_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}

struct ClockInner {
    base_millis: AtomicI64,
    start_wall_millis: AtomicI64,
    scale_bits: AtomicU64,
    paused: AtomicBool,
    paused_sim_millis: AtomicI64,
    adjustable: AtomicBool,
    base_adjusted: AtomicBool,
}

/// Cloneable handle onto the single simulation clock owned by the [`System`](crate::system::System).
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

impl Clock {
    /// Create a clock whose simulation epoch starts at `base` the moment this call returns.
    pub fn new(base: OffsetDateTime, scale: f64) -> Self {
        assert!(scale > 0.0, "clock scale must be > 0");
        let now = wall_now_millis();
        Clock {
            inner: Arc::new(ClockInner {
                base_millis: AtomicI64::new(base.unix_timestamp_nanos() as i64 / 1_000_000),
                start_wall_millis: AtomicI64::new(now),
                scale_bits: AtomicU64::new(scale.to_bits()),
                paused: AtomicBool::new(false),
                paused_sim_millis: AtomicI64::new(0),
                adjustable: AtomicBool::new(true),
                base_adjusted: AtomicBool::new(false),
            }),
        }
    }

    fn scale(&self) -> f64 {
        f64::from_bits(self.inner.scale_bits.load(Ordering::Acquire))
    }

    /// Current simulation time in milliseconds since the UNIX epoch.
    ///
    /// Monotone non-decreasing while running (spec.md §8 invariants); frozen
    /// at the pause instant while paused.
    pub fn now_millis(&self) -> i64 {
        if self.inner.paused.load(Ordering::Acquire) {
            return self.inner.paused_sim_millis.load(Ordering::Acquire);
        }
        let base = self.inner.base_millis.load(Ordering::Acquire);
        let start_wall = self.inner.start_wall_millis.load(Ordering::Acquire);
        let elapsed_wall = wall_now_millis() - start_wall;
        base + (elapsed_wall as f64 * self.scale()) as i64
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(self.now_millis() as i128 * 1_000_000)
            .expect("simulation time out of range")
    }

    /// Allow or forbid `set_base`/`set_scale` calls. The [`System`](crate::system::System)
    /// flips this at startup and whenever the clock is paused.
    pub fn set_adjustable(&self, adjustable: bool) {
        self.inner.adjustable.store(adjustable, Ordering::Release);
    }

    pub fn set_base(&self, base: OffsetDateTime) -> Result<()> {
        if !self.inner.adjustable.load(Ordering::Acquire) {
            return Err(Error::Programming(
                "clock base can only be set at startup or while paused".into(),
            ));
        }
        let millis = (base.unix_timestamp_nanos() / 1_000_000) as i64;
        self.inner.base_millis.store(millis, Ordering::Release);
        self.inner
            .start_wall_millis
            .store(wall_now_millis(), Ordering::Release);
        Ok(())
    }

    pub fn set_scale(&self, scale: f64) -> Result<()> {
        if scale <= 0.0 {
            return Err(Error::Programming("clock scale must be > 0".into()));
        }
        if !self.inner.adjustable.load(Ordering::Acquire) {
            return Err(Error::Programming(
                "clock scale can only be set at startup or while paused".into(),
            ));
        }
        // Re-anchor base/wall to `now()` first so the scale change takes effect
        // from this instant rather than retroactively.
        let now_millis = self.now_millis();
        self.inner.base_millis.store(now_millis, Ordering::Release);
        self.inner
            .start_wall_millis
            .store(wall_now_millis(), Ordering::Release);
        self.inner
            .scale_bits
            .store(scale.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Freeze `now()` at its current value. `pause()` then `resume()` yields
    /// no jump: the wall reference is shifted forward by the pause duration.
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::AcqRel) {
            return; // already paused
        }
        self.inner
            .paused_sim_millis
            .store(self.now_millis(), Ordering::Release);
    }

    pub fn resume(&self) {
        if !self.inner.paused.swap(false, Ordering::AcqRel) {
            return; // was not paused
        }
        let frozen = self.inner.paused_sim_millis.load(Ordering::Acquire);
        self.inner.base_millis.store(frozen, Ordering::Release);
        self.inner
            .start_wall_millis
            .store(wall_now_millis(), Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Convert a simulation-time delta (in millis) to the wall-clock delta it
    /// corresponds to at the current scale.
    pub fn sim_to_wall_millis(&self, sim_delta_millis: i64) -> i64 {
        (sim_delta_millis as f64 / self.scale()) as i64
    }

    /// Convert a wall-clock delta (in millis) to the simulation-time delta it
    /// corresponds to at the current scale.
    pub fn wall_to_sim_millis(&self, wall_delta_millis: i64) -> i64 {
        (wall_delta_millis as f64 * self.scale()) as i64
    }

    /// Called by a designated clock-adjuster replayer on its first observed
    /// entry. The System resolves conflicting adjusters by accepting only the
    /// first to fire; returns `true` if this call won that race.
    ///
    /// Chosen policy (spec.md §9 open question): first writer wins via a
    /// single atomic compare-and-swap, so simultaneous adjusters never both
    /// apply a base -- whichever thread's CAS lands first is authoritative,
    /// the rest are silently no-ops. This is documented, not inherited, per
    /// the open question in spec.md §9.
    pub fn try_adjust_base_once(&self, base: OffsetDateTime) -> bool {
        if self
            .inner
            .base_adjusted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.set_base(base);
        true
    }
}
