/// Smallest bucket edge.
pub const BASE_NS: u64 = 10_000;
pub const DECADES: usize = 6;
const DIGITS: usize = 9;

/// Round-trip histogram in decade/digit buckets: 10-90us, 100-900us, up to
/// 1-9s. Samples below the base land in the underflow count, above the top
/// in the overflow count.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    buckets: [[u64; DIGITS]; DECADES],
    underflow: u64,
    overflow: u64,
    count: u64,
    sum_ns: u128,
    min_ns: u64,
    max_ns: u64,
    window_max_ns: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: f64,
    pub window_max_ns: u64,
    pub underflow: u64,
    pub overflow: u64,
    /// Non-empty buckets as (lower edge ns, count)
    pub buckets: Vec<(u64, u64)>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: [[0; DIGITS]; DECADES],
            underflow: 0,
            overflow: 0,
            count: 0,
            sum_ns: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            window_max_ns: 0,
        }
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ns: u64) {
        self.count += 1;
        self.sum_ns += u128::from(ns);
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.window_max_ns = self.window_max_ns.max(ns);

        if ns < BASE_NS {
            self.underflow += 1;
            return;
        }
        let mut edge = BASE_NS;
        for decade in 0..DECADES {
            let next = edge * 10;
            if ns < next {
                let digit = (ns / edge) as usize;
                self.buckets[decade][digit - 1] += 1;
                return;
            }
            edge = next;
        }
        self.overflow += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max_ns(&self) -> u64 {
        self.max_ns
    }

    pub fn average_ns(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum_ns as f64 / self.count as f64 }
    }

    /// Close the current window. Called on every sync tick.
    pub fn end_window(&mut self) {
        self.window_max_ns = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = Vec::new();
        let mut edge = BASE_NS;
        for decade in &self.buckets {
            for (i, &n) in decade.iter().enumerate() {
                if n > 0 {
                    buckets.push((edge * (i as u64 + 1), n));
                }
            }
            edge *= 10;
        }
        HistogramSnapshot {
            count: self.count,
            min_ns: if self.count == 0 { 0 } else { self.min_ns },
            max_ns: self.max_ns,
            avg_ns: self.average_ns(),
            window_max_ns: self.window_max_ns,
            underflow: self.underflow,
            overflow: self.overflow,
            buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_placement() {
        let mut h = LatencyHistogram::new();
        h.add(5_000);
        h.add(10_000);
        h.add(19_999);
        h.add(250_000);
        h.add(9_999_999_999);
        h.add(20_000_000_000);

        let snap = h.snapshot();
        assert_eq!(snap.count, 6);
        assert_eq!(snap.underflow, 1);
        assert_eq!(snap.overflow, 1);
        assert_eq!(snap.buckets, vec![(10_000, 2), (200_000, 1), (9_000_000_000, 1)]);
        assert_eq!(snap.min_ns, 5_000);
    }

    #[test]
    fn test_window_max_resets_but_max_does_not() {
        let mut h = LatencyHistogram::new();
        h.add(100_000);
        h.end_window();
        h.add(20_000);
        let snap = h.snapshot();
        assert_eq!(snap.window_max_ns, 20_000);
        assert_eq!(snap.max_ns, 100_000);
        assert_eq!(snap.avg_ns, 60_000.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = LatencyHistogram::new().snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.min_ns, 0);
        assert!(snap.buckets.is_empty());
    }
}
