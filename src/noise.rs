/// How many standard deviations above the binomial floor a correlation
/// score must sit before it counts as more than coincidence.
pub const NOISE_SIGMA: f64 = 3.0;

/// Binomial model of coincidental string/pointer matches for one modulus.
///
/// A uniformly random residue matches a given string with probability
/// |Y|/n, so the expected score of an arbitrary wrong shift is |X|*|Y|/n.
/// The true base's peak sits above that floor by roughly the number of real
/// pointer-to-string references. Both set sizes are distinct counts, since
/// duplicate pointer values collapse before correlation.
#[derive(Debug, Clone, Copy)]
pub struct NoiseModel {
    floor: f64,
}

impl NoiseModel {
    pub fn new(strings: usize, pointers: usize, modulus: u64) -> NoiseModel {
        NoiseModel {
            floor: strings as f64 * pointers as f64 / modulus as f64,
        }
    }

    /// Expected score of a shift with no real pointer relationships behind it.
    pub fn expected_floor(&self) -> f64 {
        self.floor
    }

    pub fn is_significant(&self, score: i64) -> bool {
        score > 0 && score as f64 > self.floor + NOISE_SIGMA * self.floor.sqrt()
    }
}

/// Default slack factor for a given pointer alignment. Enlarging every
/// modulus by this factor keeps the pointer density per residue bucket at or
/// below 1/16, which keeps the noise floor low for densely sampled images.
pub fn default_slack(align: u32) -> f64 {
    (16.0 / f64::from(align)).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_shrinks_as_the_modulus_grows() {
        let narrow = NoiseModel::new(50, 4000, 10_000);
        let wide = NoiseModel::new(50, 4000, 40_000);
        assert!(wide.expected_floor() < narrow.expected_floor());
        assert!((narrow.expected_floor() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn lone_match_is_significant_when_the_floor_is_negligible() {
        let model = NoiseModel::new(1, 3, 8192);
        assert!(model.is_significant(1));
        assert!(!model.is_significant(0));
    }

    #[test]
    fn floor_level_scores_are_not_significant() {
        let model = NoiseModel::new(100, 1000, 10_000);
        // floor = 10, threshold ~ 19.5
        assert!(!model.is_significant(10));
        assert!(!model.is_significant(19));
        assert!(model.is_significant(20));
    }

    #[test]
    fn peak_to_floor_gap_never_shrinks_with_slack() {
        // Enlarging the moduli by the slack factor spreads the same sets over
        // more residue buckets; the true peak's margin over the floor may only
        // grow with it.
        let (strings, pointers, file_len) = (40usize, 2000usize, 4096u64);
        let true_peak = 12.0;
        let mut last_gap = f64::MIN;
        for slack in [1.0f64, 2.0, 4.0, 8.0, 16.0] {
            let modulus = (file_len as f64 * slack).ceil() as u64;
            let model = NoiseModel::new(strings, pointers, modulus);
            let gap = true_peak - model.expected_floor();
            assert!(gap >= last_gap, "gap shrank at slack {}", slack);
            last_gap = gap;
        }
    }

    #[test]
    fn default_slack_tracks_alignment() {
        assert!((default_slack(1) - 16.0).abs() < 1e-12);
        assert!((default_slack(4) - 4.0).abs() < 1e-12);
        assert!((default_slack(8) - 2.0).abs() < 1e-12);
        assert!((default_slack(16) - 1.0).abs() < 1e-12);
        assert!((default_slack(64) - 1.0).abs() < 1e-12);
    }
}
