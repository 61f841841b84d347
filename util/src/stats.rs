use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Thread-safe bytes-and-time accumulator for the acquisition path.
pub struct RateStats {
    total_bytes: AtomicU64,
    start_time: Mutex<Instant>,
}

impl Default for RateStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RateStats {
    pub fn new() -> Self {
        RateStats {
            total_bytes: AtomicU64::new(0),
            start_time: Mutex::new(Instant::now()),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.total_bytes.store(0, Ordering::Relaxed);
        *self.start_time.lock().unwrap() = Instant::now();
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.lock().unwrap().elapsed().as_millis() as u64
    }

    /// Average rate since the last reset, in MB/s. Zero before any time has
    /// elapsed.
    pub fn rate_mb_per_sec(&self) -> f64 {
        let elapsed_ms = self.elapsed_ms();
        if elapsed_ms == 0 {
            return 0.0;
        }
        self.total_bytes() as f64 * 1000.0 / elapsed_ms as f64 / BYTES_PER_MB
    }
}

/// Exponentially weighted moving average used for display rates.
pub struct SmoothedRate {
    alpha: f64,
    value: Mutex<Option<f64>>,
}

impl SmoothedRate {
    pub fn new(alpha: f64) -> Self {
        SmoothedRate {
            alpha,
            value: Mutex::new(None),
        }
    }

    /// Feed an instantaneous sample, returning the smoothed value.
    pub fn update(&self, sample: f64) -> f64 {
        let mut value = self.value.lock().unwrap();
        let next = match *value {
            Some(previous) => self.alpha * sample + (1.0 - self.alpha) * previous,
            None => sample,
        };
        *value = Some(next);
        next
    }

    pub fn current(&self) -> f64 {
        self.value.lock().unwrap().unwrap_or(0.0)
    }

    pub fn reset(&self) {
        *self.value.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_bytes_is_monotonic() {
        let stats = RateStats::new();
        stats.add_bytes(100);
        stats.add_bytes(50);
        assert_eq!(stats.total_bytes(), 150);
    }

    #[test]
    fn rate_is_zero_without_elapsed_time() {
        let stats = RateStats::new();
        stats.add_bytes(1024 * 1024);
        // A freshly constructed accumulator can report 0 elapsed ms.
        if stats.elapsed_ms() == 0 {
            assert_eq!(stats.rate_mb_per_sec(), 0.0);
        }
    }

    #[test]
    fn reset_clears_counter() {
        let stats = RateStats::new();
        stats.add_bytes(4096);
        stats.reset();
        assert_eq!(stats.total_bytes(), 0);
    }

    #[test]
    fn rate_matches_bytes_over_time() {
        let stats = RateStats::new();
        stats.add_bytes(2 * 1024 * 1024);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let rate = stats.rate_mb_per_sec();
        assert!(rate > 0.0);
    }

    #[test]
    fn ewma_converges_towards_samples() {
        let smoothed = SmoothedRate::new(0.3);
        assert_eq!(smoothed.update(10.0), 10.0);
        let second = smoothed.update(20.0);
        assert!((second - 13.0).abs() < 1e-9);
        assert!(smoothed.current() > 10.0);
    }

    #[test]
    fn ewma_reset_forgets_history() {
        let smoothed = SmoothedRate::new(0.3);
        smoothed.update(42.0);
        smoothed.reset();
        assert_eq!(smoothed.current(), 0.0);
        assert_eq!(smoothed.update(7.0), 7.0);
    }
}
