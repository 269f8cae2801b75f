//! Per-frame brightness sample storage and aggregation.
//!
//! Samples live in [0, 255]. A frame that failed to decode keeps its
//! zero slot and still counts toward the requested total; the decoded
//! counter lets callers tell "every frame failed" apart from "the scene
//! really is black".

/// Caller contract for capture requests, validated at the RPC boundary
/// before any device is touched.
pub const MAX_CAPTURES: usize = 20;

#[derive(Debug, Clone)]
pub struct SampleSet {
    values: Vec<f64>,
    decoded: usize,
}

impl SampleSet {
    pub fn new(count: usize) -> Self {
        Self {
            values: vec![0.0; count],
            decoded: 0,
        }
    }

    pub fn record(&mut self, index: usize, value: f64) {
        self.values[index] = value;
        self.decoded += 1;
    }

    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Per-frame samples normalized into [0, 1].
    pub fn normalized(&self) -> Vec<f64> {
        self.values.iter().map(|v| v / 255.0).collect()
    }

    /// Trimmed mean, normalized into [0, 1].
    ///
    /// With at least three samples and a nonzero total, the single lowest
    /// and single highest sample are dropped before averaging, which
    /// shrugs off one-frame capture glitches.
    pub fn average(&self) -> f64 {
        let mut total: f64 = self.values.iter().sum();
        let mut count = self.values.len();
        if count == 0 {
            return 0.0;
        }
        if count > 2 && total != 0.0 {
            let lowest = self.values.iter().copied().fold(f64::INFINITY, f64::min);
            let highest = self
                .values
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            total -= lowest + highest;
            count -= 2;
        }
        total / 255.0 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_from(values: &[f64]) -> SampleSet {
        let mut s = SampleSet::new(values.len());
        for (i, v) in values.iter().enumerate() {
            s.record(i, *v);
        }
        s
    }

    #[test]
    fn trimmed_mean_drops_extremes() {
        let s = set_from(&[10.0, 90.0, 50.0, 60.0, 40.0]);
        let expected = (50.0 + 60.0 + 40.0) / 3.0 / 255.0;
        assert!((s.average() - expected).abs() < 1e-12);
    }

    #[test]
    fn no_trimming_below_three_samples() {
        let s = set_from(&[100.0, 200.0]);
        let expected = (100.0 + 200.0) / 2.0 / 255.0;
        assert!((s.average() - expected).abs() < 1e-12);
    }

    #[test]
    fn all_zero_samples_average_to_zero() {
        let s = SampleSet::new(5);
        assert_eq!(s.average(), 0.0);
        assert_eq!(s.decoded(), 0);
    }

    #[test]
    fn failed_frames_keep_their_zero_slot() {
        // Three requested, one failed: the zero still counts toward the
        // denominator and is eligible for trimming.
        let mut s = SampleSet::new(3);
        s.record(0, 120.0);
        s.record(2, 60.0);
        assert_eq!(s.decoded(), 2);
        // Trim drops 120 (highest) and 0 (lowest), leaving 60.
        let expected = 60.0 / 255.0;
        assert!((s.average() - expected).abs() < 1e-12);
    }

    #[test]
    fn normalized_values_are_unit_range() {
        let s = set_from(&[0.0, 127.5, 255.0]);
        let n = s.normalized();
        assert_eq!(n.len(), 3);
        assert!((n[1] - 0.5).abs() < 1e-12);
        assert_eq!(n[2], 1.0);
    }

    #[test]
    fn empty_set_is_zero() {
        let s = SampleSet::new(0);
        assert_eq!(s.average(), 0.0);
    }
}
