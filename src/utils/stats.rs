// src/utils/stats.rs

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

pub fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return mean(values);
    }
    values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total
}

pub fn weighted_std_dev(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return std_dev(values);
    }
    let m = weighted_mean(values, weights);
    (values.iter().zip(weights).map(|(v, w)| w * (v - m).powi(2)).sum::<f64>() / total).sqrt()
}

/// Empirical quantile with linear interpolation between order statistics
/// (the "type 7" definition). `p` is clamped to [0, 1].
pub fn quantile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let h = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if sorted[lo] == sorted[hi] {
        // also keeps infinite order statistics from turning into NaN
        return sorted[lo];
    }
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Coefficient of determination of `fitted` against `observed`, optionally weighted.
///
/// A constant `observed` has no variance to explain: the score is 1 when the fit
/// reproduces it and 0 otherwise, never NaN.
pub fn r_squared(observed: &[f64], fitted: &[f64], weights: Option<&[f64]>) -> f64 {
    let unit;
    let weights = match weights {
        Some(w) => w,
        None => {
            unit = vec![1.0; observed.len()];
            &unit[..]
        }
    };
    let center = weighted_mean(observed, weights);
    let ss_res: f64 = observed
        .iter()
        .zip(fitted)
        .zip(weights)
        .map(|((y, f), w)| w * (y - f).powi(2))
        .sum();
    let ss_tot: f64 = observed.iter().zip(weights).map(|(y, w)| w * (y - center).powi(2)).sum();

    if ss_tot <= f64::EPSILON * observed.len().max(1) as f64 {
        return if ss_res <= 1e-12 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn quantile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_abs_diff_eq!(quantile(&v, 0.0), 1.0);
        assert_abs_diff_eq!(quantile(&v, 1.0), 4.0);
        assert_abs_diff_eq!(quantile(&v, 0.5), 2.5);
    }

    #[test]
    fn r_squared_handles_constant_target() {
        assert_abs_diff_eq!(r_squared(&[2.0, 2.0], &[2.0, 2.0], None), 1.0);
        assert_abs_diff_eq!(r_squared(&[2.0, 2.0], &[1.0, 3.0], None), 0.0);
        assert_abs_diff_eq!(r_squared(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], None), 1.0);
    }

    #[test]
    fn weighted_moments() {
        let v = [0.0, 10.0];
        assert_abs_diff_eq!(weighted_mean(&v, &[3.0, 1.0]), 2.5);
        assert_abs_diff_eq!(weighted_std_dev(&v, &[1.0, 1.0]), 5.0);
    }
}
