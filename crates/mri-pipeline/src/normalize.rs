use mri_core::registry::ModelKind;
use ndarray::Array3;

const DENOMINATOR_EPSILON: f32 = 1e-8;
const PERCENTILE_THRESHOLD: f32 = 10_000.0;
const GRACE_SKIP_THRESHOLD: f32 = 255.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationDecision {
    Percentile,
    Skip,
    Fixed,
}

/// Chooses the normalization branch per the intensity-max policy: a
/// percentile clip for unusually hot volumes, a skip for already-scaled
/// GRACE-family inputs, and a fixed clip otherwise.
pub fn choose_normalization(kind: ModelKind, max_intensity: f32) -> NormalizationDecision {
    if max_intensity > PERCENTILE_THRESHOLD {
        NormalizationDecision::Percentile
    } else if max_intensity <= GRACE_SKIP_THRESHOLD && kind == ModelKind::Grace {
        NormalizationDecision::Skip
    } else {
        NormalizationDecision::Fixed
    }
}

fn percentile(sorted: &[f32], p: f64) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0) * (sorted.len() as f64 - 1.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = (rank - lo as f64) as f32;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Clips to the `[pLow, pHigh]` percentiles of the volume, then rescales to
/// `[0, 1]` with an epsilon-safe denominator.
pub fn percentile_normalize(volume: &Array3<f32>, p_low: f64, p_high: f64) -> Array3<f32> {
    let mut sorted: Vec<f32> = volume.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let lo = percentile(&sorted, p_low);
    let hi = percentile(&sorted, p_high);
    let denom = (hi - lo).max(0.0) + DENOMINATOR_EPSILON;

    volume.mapv(|v| (v.clamp(lo, hi) - lo) / denom)
}

/// Clips to `[a_min, a_max]`, then rescales to `[0, 1]`.
pub fn fixed_scale_normalize(volume: &Array3<f32>, a_min: f32, a_max: f32) -> Array3<f32> {
    let denom = (a_max - a_min) + DENOMINATOR_EPSILON;
    volume.mapv(|v| (v.clamp(a_min, a_max) - a_min) / denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn grace_skips_when_max_is_low() {
        let decision = choose_normalization(ModelKind::Grace, 200.0);
        assert_eq!(decision, NormalizationDecision::Skip);
    }

    #[test]
    fn domino_does_not_skip_even_at_low_max() {
        let decision = choose_normalization(ModelKind::Domino, 200.0);
        assert_eq!(decision, NormalizationDecision::Fixed);
    }

    #[test]
    fn very_hot_volume_uses_percentile() {
        let decision = choose_normalization(ModelKind::Grace, 20_000.0);
        assert_eq!(decision, NormalizationDecision::Percentile);
    }

    #[test]
    fn fixed_normalize_clips_and_rescales_to_unit_range() {
        let vol = Array3::from_elem((2, 2, 2), 3000.0f32);
        let out = fixed_scale_normalize(&vol, 0.0, 255.0);
        assert!(out.iter().all(|&v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn percentile_normalize_output_is_bounded() {
        let mut vol = Array3::<f32>::zeros((4, 4, 4));
        for (i, v) in vol.iter_mut().enumerate() {
            *v = i as f32;
        }
        let out = percentile_normalize(&vol, 20.0, 80.0);
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
