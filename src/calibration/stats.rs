// src/calibration/stats.rs
//! Histogram statistics behind Entropy and Percentile calibration.
//!
//! A [`Histogram`] is zero-centred over `[-threshold, threshold]` with a fixed
//! bin width. When a later batch exceeds the threshold the histogram grows by
//! the same number of bins on each side, so earlier counts never need
//! re-binning.

/// Smoothing epsilon applied before KL divergence.
const SMOOTHING_EPS: f64 = 0.0001;

#[derive(Debug, Clone)]
pub struct Histogram {
    counts: Vec<u64>,
    threshold: f32,
    min: f32,
    max: f32,
}

fn finite(values: &[f32]) -> Vec<f32> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

fn min_max(values: &[f32]) -> (f32, f32) {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (min, max)
}

/// Bin `values` into `num_bins` equal bins over `[-threshold, threshold]`.
/// Values on the upper edge land in the last bin; values outside are dropped.
fn bin_values(values: &[f32], num_bins: usize, threshold: f32) -> Vec<u64> {
    let mut counts = vec![0u64; num_bins];
    if threshold <= 0.0 {
        counts[num_bins / 2] += values.len() as u64;
        return counts;
    }
    let width = 2.0 * threshold as f64 / num_bins as f64;
    for &v in values {
        let v = v as f64;
        if v.is_nan() || v < -(threshold as f64) || v > threshold as f64 {
            continue;
        }
        let idx = ((v + threshold as f64) / width).floor() as usize;
        counts[idx.min(num_bins - 1)] += 1;
    }
    counts
}

impl Histogram {
    /// Build from the first batch. `num_bins` is rounded up to an even count
    /// so 0 sits on a bin edge. Non-finite values are ignored.
    pub fn from_values(values: &[f32], num_bins: usize) -> Self {
        let num_bins = (num_bins.max(2) + 1) & !1;
        let values = finite(values);
        let values = values.as_slice();
        let (min, max) = if values.is_empty() { (0.0, 0.0) } else { min_max(values) };
        let threshold = min.abs().max(max.abs());
        Self {
            counts: bin_values(values, num_bins, threshold),
            threshold,
            min,
            max,
        }
    }

    /// Fold another batch in, growing the histogram if needed. Non-finite
    /// values are ignored.
    pub fn collect(&mut self, values: &[f32]) {
        let values = finite(values);
        let values = values.as_slice();
        if values.is_empty() {
            return;
        }
        let (batch_min, batch_max) = min_max(values);
        self.min = self.min.min(batch_min);
        self.max = self.max.max(batch_max);
        let needed = self.min.abs().max(self.max.abs());
        let num_bins = self.counts.len();

        if needed <= self.threshold {
            for (c, n) in self.counts.iter_mut().zip(bin_values(values, num_bins, self.threshold)) {
                *c += n;
            }
            return;
        }

        if self.threshold == 0.0 {
            // Every earlier value was 0: it lands in the centre bin of the wider range.
            let zeros: u64 = self.counts.iter().sum();
            self.threshold = needed;
            self.counts = bin_values(values, num_bins, needed);
            self.counts[num_bins / 2] += zeros;
            return;
        }

        let stride = 2.0 * self.threshold / num_bins as f32;
        let grow = ((needed - self.threshold) / stride).floor() as usize + 1;
        let new_bins = num_bins + 2 * grow;
        let new_threshold = self.threshold + grow as f32 * stride;

        let mut counts = bin_values(values, new_bins, new_threshold);
        for (i, c) in self.counts.iter().enumerate() {
            counts[grow + i] += c;
        }
        self.counts = counts;
        self.threshold = new_threshold;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Bin edges, `counts().len() + 1` of them.
    pub fn edges(&self) -> Vec<f32> {
        let n = self.counts.len();
        let width = 2.0 * self.threshold / n as f32;
        (0..=n).map(|i| -self.threshold + i as f32 * width).collect()
    }

    fn clamp_to_observed(&self, (lo, hi): (f32, f32)) -> (f32, f32) {
        (lo.max(self.min), hi.min(self.max))
    }

    /// Clipping range whose int8-style reconstruction (`num_quantized_bins`
    /// levels) minimizes KL divergence to the observed distribution.
    pub fn entropy_threshold(&self, num_quantized_bins: usize) -> (f32, f32) {
        let num_bins = self.counts.len();
        let edges = self.edges();
        let zero_bin = num_bins / 2;
        let half_quantized = (num_quantized_bins / 2).max(1);

        if self.total() == 0 || half_quantized > zero_bin {
            return self.clamp_to_observed((-self.threshold, self.threshold));
        }

        let mut best = (-self.threshold, self.threshold);
        let mut best_divergence = f64::INFINITY;

        for i in half_quantized..=zero_bin {
            let start = zero_bin - i;
            let end = (zero_bin + i).min(num_bins);
            let sliced = &self.counts[start..end];

            let mut p: Vec<f64> = sliced.iter().map(|&c| c as f64).collect();
            let left: u64 = self.counts[..start].iter().sum();
            let right: u64 = self.counts[end..].iter().sum();
            p[0] += left as f64;
            let last = p.len() - 1;
            p[last] += right as f64;

            let q = quantized_reconstruction(sliced, &p, num_quantized_bins);
            let divergence = match (smooth_distribution(&p), smooth_distribution(&q)) {
                (Some(p), Some(q)) => kl_divergence(&p, &q),
                _ => f64::INFINITY,
            };

            if divergence < best_divergence {
                best_divergence = divergence;
                best = (edges[start], edges[end]);
            }
        }

        self.clamp_to_observed(best)
    }

    /// Range clipped to `percentile` of the cumulative distribution.
    ///
    /// Symmetric: the cut is taken on `|x|` and mirrored. Otherwise
    /// `(100 - percentile) / 2` percent is cut from each tail.
    pub fn percentile_range(&self, percentile: f32, symmetric: bool) -> (f32, f32) {
        let total = self.total();
        if total == 0 {
            return (self.min, self.max);
        }
        let edges = self.edges();

        if symmetric {
            let half = self.counts.len() / 2;
            let folded: Vec<u64> = (0..half)
                .map(|j| self.counts[half + j] + self.counts[half - 1 - j])
                .collect();
            let idx = search_cdf(&folded, total, percentile as f64 / 100.0);
            let t = edges[half + idx + 1];
            return self.clamp_to_observed((-t, t));
        }

        let cut = (100.0 - percentile as f64) / 200.0;
        let left = search_cdf(&self.counts, total, cut);
        let right = search_cdf(&self.counts, total, 1.0 - cut);
        self.clamp_to_observed((edges[left], edges[right + 1]))
    }
}

/// First bin whose cumulative probability reaches `target`.
fn search_cdf(counts: &[u64], total: u64, target: f64) -> usize {
    let mut cumulative = 0u64;
    for (i, &c) in counts.iter().enumerate() {
        cumulative += c;
        if cumulative as f64 / total as f64 >= target {
            return i;
        }
    }
    counts.len() - 1
}

/// Merge `sliced` into `levels` quantized bins, then spread each level evenly
/// back over the bins where `p` is non-zero.
fn quantized_reconstruction(sliced: &[u64], p: &[f64], levels: usize) -> Vec<f64> {
    let levels = levels.min(sliced.len()).max(1);
    let merged = sliced.len() / levels;
    let mut q = vec![0.0f64; sliced.len()];

    for level in 0..levels {
        let start = level * merged;
        let end = if level == levels - 1 { sliced.len() } else { start + merged };
        let mass: u64 = sliced[start..end].iter().sum();
        let nonzero = p[start..end].iter().filter(|&&v| v != 0.0).count();
        if nonzero == 0 {
            continue;
        }
        let avg = mass as f64 / nonzero as f64;
        for j in start..end {
            if p[j] != 0.0 {
                q[j] = avg;
            }
        }
    }
    q
}

/// Move `eps` mass onto every empty bin, taken evenly from the non-empty ones.
/// `None` when the distribution is empty or smoothing would make a bin
/// non-positive.
fn smooth_distribution(p: &[f64]) -> Option<Vec<f64>> {
    let zeros = p.iter().filter(|&&v| v == 0.0).count();
    let nonzeros = p.len() - zeros;
    if nonzeros == 0 {
        return None;
    }
    let eps1 = SMOOTHING_EPS * zeros as f64 / nonzeros as f64;
    let smoothed: Vec<f64> = p
        .iter()
        .map(|&v| if v == 0.0 { SMOOTHING_EPS } else { v - eps1 })
        .collect();
    if smoothed.iter().any(|&v| v <= 0.0) {
        return None;
    }
    Some(smoothed)
}

/// KL(p || q) after normalizing both to probability distributions.
fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    let p_sum: f64 = p.iter().sum();
    let q_sum: f64 = q.iter().sum();
    p.iter()
        .zip(q)
        .map(|(&pi, &qi)| {
            let pn = pi / p_sum;
            let qn = qi / q_sum;
            pn * (pn / qn).ln()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_is_zero_centred() {
        let h = Histogram::from_values(&[-1.0, 0.5, 1.0], 4);
        assert_eq!(h.threshold(), 1.0);
        assert_eq!(h.edges(), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(h.counts(), &[1, 0, 0, 2]);
    }

    #[test]
    fn test_odd_bin_count_rounded_up() {
        let h = Histogram::from_values(&[1.0], 5);
        assert_eq!(h.counts().len(), 6);
    }

    #[test]
    fn test_growth_keeps_stride_and_counts() {
        let mut h = Histogram::from_values(&[-1.0, 1.0], 4);
        h.collect(&[2.0]);
        // stride 0.5: three extra bins per side reach past 2.0
        assert_eq!(h.counts().len(), 10);
        assert!((h.threshold() - 2.5).abs() < 1e-6);
        assert_eq!(h.total(), 3);
        assert_eq!(h.max(), 2.0);
        assert_eq!(h.min(), -1.0);
    }

    #[test]
    fn test_infinite_values_in_later_batch_are_ignored() {
        let mut h = Histogram::from_values(&[-1.0, 1.0], 128);
        h.collect(&[0.5, f32::INFINITY, f32::NEG_INFINITY, f32::NAN]);
        assert_eq!(h.counts().len(), 128);
        assert_eq!(h.threshold(), 1.0);
        assert_eq!(h.total(), 3);
        assert_eq!((h.min(), h.max()), (-1.0, 1.0));
    }

    #[test]
    fn test_infinite_values_in_first_batch_are_ignored() {
        let mut h = Histogram::from_values(&[f32::INFINITY, -2.0, 2.0], 8);
        assert_eq!(h.threshold(), 2.0);
        assert_eq!(h.total(), 2);
        h.collect(&[3.0]);
        assert!(h.threshold().is_finite());
        assert!(h.edges().iter().all(|e| e.is_finite()));
        assert_eq!(h.total(), 3);
    }

    #[test]
    fn test_growth_from_all_zero_histogram() {
        let mut h = Histogram::from_values(&[0.0, 0.0], 4);
        h.collect(&[-3.0, 3.0]);
        assert_eq!(h.threshold(), 3.0);
        assert_eq!(h.total(), 4);
        assert_eq!(h.counts(), &[1, 0, 2, 1]);
    }

    #[test]
    fn test_percentile_clips_outlier() {
        let mut values: Vec<f32> = (0..10_000).map(|i| (i % 100) as f32 / 100.0).collect();
        values.push(100.0);
        let h = Histogram::from_values(&values, 2048);
        let (lo, hi) = h.percentile_range(99.9, false);
        assert!(lo >= 0.0);
        assert!(hi < 2.0, "outlier should be clipped, got {hi}");
    }

    #[test]
    fn test_percentile_symmetric_is_balanced() {
        let values: Vec<f32> = (-100..=100).map(|i| i as f32 / 10.0).collect();
        let h = Histogram::from_values(&values, 128);
        let (lo, hi) = h.percentile_range(100.0, true);
        assert_eq!(lo, -hi);
        assert!((hi - 10.0).abs() < 0.2);
    }

    #[test]
    fn test_entropy_threshold_clips_long_tail() {
        // Dense body in [-1, 1] plus a sparse tail out to 50.
        let mut values: Vec<f32> = (0..20_000).map(|i| ((i % 200) as f32 - 100.0) / 100.0).collect();
        values.extend([50.0, -50.0, 25.0]);
        let h = Histogram::from_values(&values, 1024);
        let (lo, hi) = h.entropy_threshold(128);
        assert!(hi < 50.0 && hi > 0.9, "threshold {hi}");
        assert!(lo > -50.0 && lo < -0.9, "threshold {lo}");
    }

    #[test]
    fn test_entropy_with_too_few_bins_keeps_full_range() {
        let h = Histogram::from_values(&[-2.0, 1.0], 8);
        assert_eq!(h.entropy_threshold(128), (-2.0, 1.0));
    }

    #[test]
    fn test_smooth_distribution() {
        assert!(smooth_distribution(&[0.0, 0.0]).is_none());
        let s = smooth_distribution(&[1.0, 0.0]).unwrap();
        assert!((s[1] - SMOOTHING_EPS).abs() < 1e-12);
        assert!((s.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
