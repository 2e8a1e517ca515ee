const EWMA_GAIN_SHIFT: u32 = 4;

/// RFC 3550 interarrival jitter over round-trip samples: J += (|D| - J) / 16,
/// where D is the difference between consecutive round trips.
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    last_rtt_ns: Option<u64>,
    jitter_ns: u64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, rtt_ns: u64) {
        let Some(last) = self.last_rtt_ns.replace(rtt_ns) else {
            return;
        };
        let d = rtt_ns.abs_diff(last);
        if d > self.jitter_ns {
            self.jitter_ns += (d - self.jitter_ns) >> EWMA_GAIN_SHIFT;
        } else {
            self.jitter_ns -= (self.jitter_ns - d) >> EWMA_GAIN_SHIFT;
        }
    }

    pub fn get(&self) -> u64 {
        self.jitter_ns
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_rtt_has_no_jitter() {
        let mut j = JitterEstimator::new();
        for _ in 0..100 {
            j.update(50_000);
        }
        assert_eq!(j.get(), 0);
    }

    #[test]
    fn test_alternating_rtt_converges() {
        let mut j = JitterEstimator::new();
        for i in 0..2000 {
            j.update(if i % 2 == 0 { 10_000 } else { 26_000 });
        }
        // Converges towards |D| = 16us from below
        assert!(j.get() > 15_000 && j.get() <= 16_000, "jitter {}", j.get());
    }

    #[test]
    fn test_first_sample_only_seeds() {
        let mut j = JitterEstimator::new();
        j.update(1_000_000);
        assert_eq!(j.get(), 0);
        j.update(1_016_000);
        assert_eq!(j.get(), 1_000);
    }
}
