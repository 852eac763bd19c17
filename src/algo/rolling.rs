use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Samples kept per window; oldest samples are evicted first.
pub const WINDOW_CAPACITY: usize = 16;

/// Bounded FIFO of integer samples with an exact median.
///
/// Serialized as a plain JSON array. Arrays longer than the capacity are
/// trimmed oldest-first when loaded.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(from = "Vec<i32>", into = "Vec<i32>")]
pub struct RollingWindow {
    samples: VecDeque<i32>,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Push a sample. Non-positive samples are dropped.
    pub fn push(&mut self, sample: i32) -> bool {
        sample > 0 && self.admit(sample)
    }

    /// Push a sample that may be zero. Negative samples are dropped.
    pub fn push_non_negative(&mut self, sample: i32) -> bool {
        sample >= 0 && self.admit(sample)
    }

    fn admit(&mut self, sample: i32) -> bool {
        self.samples.push_back(sample);
        while self.samples.len() > WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        true
    }

    /// Push a sample after capping it at `max`.
    pub fn push_capped(&mut self, sample: i32, max: i32) -> bool {
        self.push(sample.min(max))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.samples.iter().copied()
    }

    /// Median of the window; even counts average the two middle samples.
    pub fn median(&self) -> Option<i32> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: SmallVec<[i32; WINDOW_CAPACITY]> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        } else {
            Some(sorted[mid])
        }
    }

    /// Median clamped into `[lo, hi]`.
    pub fn median_clamped(&self, lo: i32, hi: i32) -> Option<i32> {
        self.median().map(|m| m.clamp(lo, hi))
    }
}

impl From<Vec<i32>> for RollingWindow {
    fn from(values: Vec<i32>) -> Self {
        let skip = values.len().saturating_sub(WINDOW_CAPACITY);
        let mut window = Self::new();
        for v in values.into_iter().skip(skip) {
            window.push_non_negative(v);
        }
        window
    }
}

impl From<RollingWindow> for Vec<i32> {
    fn from(window: RollingWindow) -> Self {
        window.samples.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut w = RollingWindow::new();
        for i in 1..=20 {
            w.push(i);
        }
        assert_eq!(w.len(), WINDOW_CAPACITY);
        assert_eq!(w.iter().next(), Some(5));
        assert_eq!(w.iter().last(), Some(20));
    }

    #[test]
    fn test_non_positive_samples_ignored() {
        let mut w = RollingWindow::new();
        assert!(!w.push(0));
        assert!(!w.push(-3));
        assert!(w.is_empty());
        assert_eq!(w.median(), None);

        assert!(w.push_non_negative(0));
        assert!(!w.push_non_negative(-1));
        assert_eq!(w.median(), Some(0));
    }

    #[test]
    fn test_median_order_independent() {
        let a: RollingWindow = vec![4, 9, 1, 4, 6].into();
        let b: RollingWindow = vec![6, 4, 4, 1, 9].into();
        assert_eq!(a.median(), Some(4));
        assert_eq!(a.median(), b.median());
    }

    #[test]
    fn test_median_even_count_uses_integer_mean() {
        let w: RollingWindow = vec![3, 6].into();
        assert_eq!(w.median(), Some(4));
    }

    #[test]
    fn test_median_rejects_single_outlier() {
        let w: RollingWindow = vec![4, 4, 1].into();
        assert_eq!(w.median(), Some(4));
    }

    #[test]
    fn test_evicted_samples_no_longer_count() {
        let mut w = RollingWindow::new();
        for _ in 0..8 {
            w.push(60);
        }
        for _ in 0..WINDOW_CAPACITY {
            w.push(5);
        }
        assert_eq!(w.median(), Some(5));
    }

    #[test]
    fn test_push_capped() {
        let mut w = RollingWindow::new();
        w.push_capped(95, 60);
        assert_eq!(w.iter().next(), Some(60));
    }

    #[test]
    fn test_load_trims_oversized_array() {
        let w: RollingWindow = serde_json::from_str("[1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18]").unwrap();
        assert_eq!(w.len(), WINDOW_CAPACITY);
        assert_eq!(w.iter().next(), Some(3));
        assert_eq!(serde_json::to_string(&RollingWindow::from(vec![2, 3])).unwrap(), "[2,3]");
    }
}
