use crate::error::{Result, SourceError};
use parking_lot::Mutex;

/// Drift-compensated mapping between the device sample counter and host
/// wall-clock time.
///
/// The estimate is a single additive offset in seconds
/// (`offset = host_seconds - device_tick / sysfreq`), exponentially smoothed
/// across monitor observations. Smoothing tracks the slow relative drift of the
/// two clocks; a hard reset handles the device clock jumping backward on a
/// device-side reset or reconnect, where blending would leave a stale estimate
/// in place for a long time.
///
/// One instance per session, shared behind an `Arc` by everything that converts
/// timestamps. Updates and reads go through a mutex, so a reader sees either the
/// pre- or post-update offset, never a torn value. A read racing an in-flight
/// update may observe the previous estimate; that is acceptable.
pub struct ClockSync {
    alpha: f64,
    sysfreq: f64,
    state: Mutex<ClockState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    offset: Option<f64>,
    /// Last accepted (device_tick, host_time) pair, for regression detection.
    last_pair: Option<(u64, f64)>,
}

impl ClockSync {
    /// `alpha` is the smoothing factor in (0, 1]; `sysfreq` the device counter
    /// rate in ticks per second.
    ///
    /// # Panics
    ///
    /// Panics when `alpha` is outside (0, 1] or `sysfreq` is not positive.
    /// α = 0 would freeze the estimate after the first pair and α > 1 makes
    /// the blend oscillate, so neither is a usable configuration.
    pub fn new(alpha: f64, sysfreq: f64) -> Self {
        assert!(
            alpha > 0.0 && alpha <= 1.0,
            "smoothing factor must be in (0, 1], got {alpha}"
        );
        assert!(sysfreq > 0.0, "device frequency must be positive, got {sysfreq}");
        Self {
            alpha,
            sysfreq,
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Record one (device tick, host time) correspondence point.
    ///
    /// The first observation, and any observation whose tick or host time is
    /// behind the previously accepted pair, replaces the estimate outright;
    /// anything else is blended with weight `alpha`.
    pub fn add_pair(&self, device_tick: u64, host_time: f64) {
        let candidate = host_time - device_tick as f64 / self.sysfreq;
        let mut state = self.state.lock();

        let regressed = state
            .last_pair
            .map(|(t, h)| device_tick < t || host_time < h)
            .unwrap_or(false);

        state.offset = match state.offset {
            Some(prev) if !regressed => Some((1.0 - self.alpha) * prev + self.alpha * candidate),
            _ => Some(candidate),
        };
        state.last_pair = Some((device_tick, host_time));
    }

    /// Convert a device tick to host seconds.
    ///
    /// Errors with [`SourceError::ClockUnsynchronized`] until the first
    /// [`add_pair`](Self::add_pair); callers are expected to have fed at least
    /// one monitor sample before converting.
    pub fn device_to_host(&self, tick: u64) -> Result<f64> {
        let offset = self
            .state
            .lock()
            .offset
            .ok_or(SourceError::ClockUnsynchronized)?;
        Ok(tick as f64 / self.sysfreq + offset)
    }

    /// Convert host seconds to the nearest device tick.
    pub fn host_to_device(&self, host_time: f64) -> Result<i64> {
        let offset = self
            .state
            .lock()
            .offset
            .ok_or(SourceError::ClockUnsynchronized)?;
        Ok(((host_time - offset) * self.sysfreq).round() as i64)
    }

    pub fn offset(&self) -> Option<f64> {
        self.state.lock().offset
    }

    /// True once at least one observation has been accepted.
    pub fn is_ready(&self) -> bool {
        self.state.lock().offset.is_some()
    }

    pub fn sysfreq(&self) -> f64 {
        self.sysfreq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn first_pair_sets_offset_directly() {
        let clock = ClockSync::new(0.5, 1000.0);
        assert!(clock.offset().is_none());
        assert!(!clock.is_ready());

        clock.add_pair(0, 1.0);
        assert!((clock.offset().unwrap() - 1.0).abs() < EPS);
        assert!(clock.is_ready());
    }

    #[test]
    fn monotonic_pairs_blend_exponentially() {
        let clock = ClockSync::new(0.5, 1000.0);
        clock.add_pair(0, 1.0); // offset = 1.0
        clock.add_pair(1000, 2.5); // candidate = 1.5, offset = 0.5*1.0 + 0.5*1.5
        assert!((clock.offset().unwrap() - 1.25).abs() < EPS);

        assert!((clock.device_to_host(2000).unwrap() - 3.25).abs() < EPS);
    }

    #[test]
    fn smoothing_matches_closed_form() {
        let alpha = 0.1;
        let sysfreq = 30_000.0;
        let clock = ClockSync::new(alpha, sysfreq);

        let pairs = [(0u64, 5.0f64), (30_000, 6.01), (60_000, 7.003), (90_000, 8.02)];
        let mut expected: Option<f64> = None;
        for &(tick, host) in &pairs {
            clock.add_pair(tick, host);
            let candidate = host - tick as f64 / sysfreq;
            expected = Some(match expected {
                None => candidate,
                Some(prev) => (1.0 - alpha) * prev + alpha * candidate,
            });
            assert!((clock.offset().unwrap() - expected.unwrap()).abs() < EPS);
        }
    }

    #[test]
    fn regression_resets_without_blending() {
        let clock = ClockSync::new(0.1, 1.0);
        clock.add_pair(100, 10.0);
        // Both coordinates go backward: device clock reset.
        clock.add_pair(50, 3.0);
        let expected = 3.0 - 50.0;
        assert!((clock.offset().unwrap() - expected).abs() < EPS);
    }

    #[test]
    fn single_coordinate_regression_also_resets() {
        let clock = ClockSync::new(0.1, 1.0);
        clock.add_pair(100, 10.0);
        clock.add_pair(50, 11.0); // tick regressed, host advanced
        let expected = 11.0 - 50.0;
        assert!((clock.offset().unwrap() - expected).abs() < EPS);
    }

    #[test]
    fn round_trip_within_one_tick() {
        let clock = ClockSync::new(0.3, 30_000.0);
        clock.add_pair(12_345, 98.7654);
        clock.add_pair(42_345, 99.7661);

        for tick in [0u64, 1, 29_999, 123_456_789] {
            let host = clock.device_to_host(tick).unwrap();
            let back = clock.host_to_device(host).unwrap();
            assert!((back - tick as i64).abs() <= 1, "tick {tick} -> {back}");
        }
    }

    #[test]
    #[should_panic(expected = "smoothing factor")]
    fn zero_alpha_is_rejected() {
        let _ = ClockSync::new(0.0, 1000.0);
    }

    #[test]
    #[should_panic(expected = "smoothing factor")]
    fn alpha_above_one_is_rejected() {
        let _ = ClockSync::new(1.5, 1000.0);
    }

    #[test]
    fn conversion_before_first_pair_errors() {
        let clock = ClockSync::new(0.1, 30_000.0);
        assert!(matches!(
            clock.device_to_host(100),
            Err(SourceError::ClockUnsynchronized)
        ));
        assert!(matches!(
            clock.host_to_device(1.0),
            Err(SourceError::ClockUnsynchronized)
        ));
    }
}
