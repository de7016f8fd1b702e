// src/algorithms/local_model.rs

use crate::core::{Dataset, ImlError, Instance, Predictor, Result};
use crate::traits::PredictModel;
use crate::utils::linalg::weighted_least_squares;
use crate::utils::stats::{r_squared, std_dev, weighted_std_dev};
use ndarray::{Array1, Array2, Axis};
use rand::distributions::WeightedIndex;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for the LIME-style local surrogate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelConfig {
    /// Size of the sampled neighborhood, the explained instance included.
    pub n_samples: usize,
    /// Width of the exponential kernel; `0.75 * sqrt(n_features)` when `None`.
    pub kernel_width: Option<f64>,
    /// Keep only the `k` most influential terms; all terms when `None`.
    pub k: Option<usize>,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        LocalModelConfig { n_samples: 1000, kernel_width: None, k: None }
    }
}

impl LocalModelConfig {
    pub fn validate(&self, n_features: usize) -> Result<()> {
        if self.n_samples < 2 {
            return Err(ImlError::InvalidConfig("n_samples must be at least 2.".to_string()));
        }
        if let Some(width) = self.kernel_width {
            if !width.is_finite() || width <= 0.0 {
                return Err(ImlError::InvalidConfig(format!(
                    "kernel_width must be positive and finite, got {}.",
                    width
                )));
            }
        }
        if let Some(k) = self.k {
            if k == 0 || k > n_features {
                return Err(ImlError::InvalidConfig(format!(
                    "k must lie in 1..={}, got {}.",
                    n_features, k
                )));
            }
        }
        Ok(())
    }
}

/// One term of the local linear model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurrogateTerm {
    pub feature: String,
    /// `a` for numeric features, `c=level` for the categorical indicator.
    pub term: String,
    pub coefficient: f64,
    /// Coefficient times the term's value at the explained instance.
    pub effect: f64,
}

#[derive(Debug, Clone)]
pub struct LocalSurrogateResult {
    instance: Instance,
    pub intercept: f64,
    terms: Vec<SurrogateTerm>,
    /// Kernel-weighted R² of the surrogate against the black box on the neighborhood.
    pub fidelity: f64,
    pub black_box_prediction: f64,
    pub local_prediction: f64,
    pub n_samples: usize,
    pub kernel_width: f64,
}

impl LocalSurrogateResult {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn terms(&self) -> &[SurrogateTerm] {
        &self.terms
    }

    pub fn coefficient(&self, feature: &str) -> Option<f64> {
        self.terms.iter().find(|t| t.feature == feature).map(|t| t.coefficient)
    }

    pub fn records(&self) -> &[SurrogateTerm] {
        &self.terms
    }
}

/// Locally weighted linear approximation of the black box around one instance.
pub struct LocalModel<'p, M: PredictModel> {
    predictor: &'p Predictor<M>,
    config: LocalModelConfig,
    kernel_width: f64,
    // per column: reference standard deviation (numeric) or level sampler (categorical)
    spread: Vec<f64>,
    level_samplers: Vec<Option<WeightedIndex<f64>>>,
    kept: Vec<usize>,
    coefficients: Array1<f64>,
    result: LocalSurrogateResult,
}

impl<'p, M: PredictModel> LocalModel<'p, M> {
    pub fn new<R: Rng + ?Sized>(
        predictor: &'p Predictor<M>,
        instance: &Instance,
        config: LocalModelConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let data = predictor.data();
        let n_features = data.ncols();
        config.validate(n_features)?;
        if predictor.n_outputs() != 1 {
            return Err(ImlError::InvalidConfig(
                "The local surrogate explains a single output; select one with with_class.".to_string(),
            ));
        }

        let kernel_width = config.kernel_width.unwrap_or(0.75 * (n_features as f64).sqrt());
        let mut spread = Vec::with_capacity(n_features);
        let mut level_samplers = Vec::with_capacity(n_features);
        for (col, feature) in data.schema().features().iter().enumerate() {
            let column = data.values().column(col);
            match feature.levels() {
                Some(levels) => {
                    let mut counts = vec![0.0; levels.len()];
                    for &code in column.iter() {
                        counts[code as usize] += 1.0;
                    }
                    let sampler = WeightedIndex::new(&counts)
                        .map_err(|e| ImlError::InvalidInput(format!("Level distribution of '{}': {}", feature.name, e)))?;
                    spread.push(0.0);
                    level_samplers.push(Some(sampler));
                }
                None => {
                    spread.push(std_dev(&column.to_vec()));
                    level_samplers.push(None);
                }
            }
        }

        let (kept, coefficients, result) =
            fit(predictor, &config, kernel_width, &spread, &level_samplers, instance, rng)?;
        Ok(LocalModel { predictor, config, kernel_width, spread, level_samplers, kept, coefficients, result })
    }

    pub fn result(&self) -> &LocalSurrogateResult {
        &self.result
    }

    /// Explains a new instance; the neighborhood is drawn again from scratch.
    pub fn explain<R: Rng + ?Sized>(&mut self, instance: &Instance, rng: &mut R) -> Result<()> {
        let (kept, coefficients, result) = fit(
            self.predictor,
            &self.config,
            self.kernel_width,
            &self.spread,
            &self.level_samplers,
            instance,
            rng,
        )?;
        self.kept = kept;
        self.coefficients = coefficients;
        self.result = result;
        Ok(())
    }

    /// Applies the local linear model to other rows.
    pub fn predict(&self, data: &Dataset) -> Result<Array1<f64>> {
        if data.schema() != self.predictor.data().schema() {
            return Err(ImlError::InvalidInput(
                "Data schema differs from the reference data schema.".to_string(),
            ));
        }
        let basis = basis_matrix(data.values(), self.result.instance.values(), data);
        let selected = basis.select(Axis(1), &self.kept);
        Ok(selected.dot(&self.coefficients.slice(ndarray::s![1..])) + self.coefficients[0])
    }
}

type Fit = (Vec<usize>, Array1<f64>, LocalSurrogateResult);

fn fit<M: PredictModel, R: Rng + ?Sized>(
    predictor: &Predictor<M>,
    config: &LocalModelConfig,
    kernel_width: f64,
    spread: &[f64],
    level_samplers: &[Option<WeightedIndex<f64>>],
    instance: &Instance,
    rng: &mut R,
) -> Result<Fit> {
    let data = predictor.data();
    instance.ensure_schema(data.schema())?;
    let x0 = instance.values();
    let n_features = x0.len();
    let n_samples = config.n_samples;

    // 1. neighborhood, the instance itself first
    let mut samples = Array2::zeros((n_samples, n_features));
    samples.row_mut(0).assign(x0);
    for i in 1..n_samples {
        for j in 0..n_features {
            samples[[i, j]] = match &level_samplers[j] {
                Some(sampler) => sampler.sample(rng) as f64,
                None => {
                    let z: f64 = StandardNormal.sample(rng);
                    x0[j] + z * spread[j]
                }
            };
        }
    }
    let neighborhood = data.derive(samples);

    // 2. black-box answers
    let target = predictor.predict_single(&neighborhood)?;

    // 3. kernel weights
    let weights: Array1<f64> = neighborhood
        .values()
        .rows()
        .into_iter()
        .map(|row| {
            let d2: f64 = (0..n_features)
                .map(|j| {
                    if level_samplers[j].is_some() {
                        if row[j] == x0[j] { 0.0 } else { 1.0 }
                    } else if spread[j] > 0.0 {
                        ((row[j] - x0[j]) / spread[j]).powi(2)
                    } else {
                        0.0
                    }
                })
                .sum();
            (-d2 / kernel_width.powi(2)).exp()
        })
        .collect();

    // 4. weighted linear fit, optionally narrowed to the top-k terms
    let basis = basis_matrix(neighborhood.values(), x0, data);
    let all: Vec<usize> = (0..n_features).collect();
    let mut kept = all.clone();
    let mut beta = weighted_least_squares(basis.view(), target.view(), weights.view())?;
    if let Some(k) = config.k.filter(|&k| k < n_features) {
        let w = weights.to_vec();
        let mut scored: Vec<(usize, f64)> = all
            .iter()
            .map(|&j| (j, beta[j + 1].abs() * weighted_std_dev(&basis.column(j).to_vec(), &w)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        kept = scored.into_iter().take(k).map(|(j, _)| j).collect();
        kept.sort_unstable();
        let narrowed = basis.select(Axis(1), &kept);
        beta = weighted_least_squares(narrowed.view(), target.view(), weights.view())?;
    }

    // 5. fidelity and the result table
    let design = basis.select(Axis(1), &kept);
    let fitted = design.dot(&beta.slice(ndarray::s![1..])) + beta[0];
    let fidelity = r_squared(&target.to_vec(), &fitted.to_vec(), Some(weights.to_vec().as_slice()));

    let schema = data.schema();
    let terms: Vec<SurrogateTerm> = kept
        .iter()
        .enumerate()
        .map(|(pos, &j)| {
            let coefficient = beta[pos + 1];
            let feature = schema.feature(j);
            let (term, at_instance) = match feature.levels() {
                Some(_) => (instance.describe(j), 1.0),
                None => (feature.name.clone(), x0[j]),
            };
            SurrogateTerm { feature: feature.name.clone(), term, coefficient, effect: coefficient * at_instance }
        })
        .collect();
    let local_prediction = beta[0] + terms.iter().map(|t| t.effect).sum::<f64>();
    debug!(n_samples, kernel_width, fidelity, terms = terms.len(), "local surrogate fitted");

    let result = LocalSurrogateResult {
        instance: instance.clone(),
        intercept: beta[0],
        terms,
        fidelity,
        black_box_prediction: target[0],
        local_prediction,
        n_samples,
        kernel_width,
    };
    Ok((kept, beta, result))
}

/// Numeric columns as they are, categorical columns as "same level as x0" indicators.
fn basis_matrix(values: &Array2<f64>, x0: &Array1<f64>, data: &Dataset) -> Array2<f64> {
    let schema = data.schema();
    let mut basis = values.clone();
    for (j, feature) in schema.features().iter().enumerate() {
        if feature.is_categorical() {
            basis.column_mut(j).mapv_inplace(|v| if v == x0[j] { 1.0 } else { 0.0 });
        }
    }
    basis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::RegressionFn;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn data() -> Dataset {
        Dataset::builder()
            .numeric("a", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .numeric("b", vec![0.5, -1.0, 2.0, 0.0, 1.5, -0.5])
            .categorical("c", &["x", "y"], &["x", "y", "x", "y", "y", "x"])
            .build()
            .unwrap()
    }

    fn linear(d: &Dataset) -> Result<Array1<f64>> {
        let a = d.column("a")?;
        let b = d.column("b")?;
        Ok(Array1::from_shape_fn(d.nrows(), |i| 1.0 + 2.0 * a[i] - 3.0 * b[i]))
    }

    #[test]
    fn same_seed_same_neighborhood() {
        let data = data();
        let x0 = data.instance(1).unwrap();
        let model = RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.mapv(|a| a * a) + &d.column("b")?));
        let predictor = Predictor::new(model, data).unwrap();
        let config = LocalModelConfig { n_samples: 200, ..Default::default() };

        let first = LocalModel::new(&predictor, &x0, config.clone(), &mut StdRng::seed_from_u64(21)).unwrap();
        let second = LocalModel::new(&predictor, &x0, config, &mut StdRng::seed_from_u64(21)).unwrap();
        assert_eq!(first.result().terms(), second.result().terms());
        assert_eq!(first.result().intercept, second.result().intercept);
        assert_eq!(first.result().fidelity, second.result().fidelity);
    }

    #[test]
    fn linear_black_box_is_recovered_exactly() {
        let data = data();
        let x0 = data.instance(2).unwrap();
        let predictor = Predictor::new(RegressionFn::new(linear), data).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let lime = LocalModel::new(&predictor, &x0, LocalModelConfig::default(), &mut rng).unwrap();
        let result = lime.result();

        assert_abs_diff_eq!(result.coefficient("a").unwrap(), 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.coefficient("b").unwrap(), -3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.coefficient("c").unwrap(), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.intercept, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(result.fidelity, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.local_prediction, result.black_box_prediction, epsilon = 1e-6);
        assert_eq!(result.terms()[2].term, "c=x");
    }

    #[test]
    fn top_k_keeps_the_dominant_term() {
        let data = data();
        let x0 = data.instance(0).unwrap();
        let model = RegressionFn::new(|d: &Dataset| {
            let a = d.column("a")?;
            let b = d.column("b")?;
            Ok(Array1::from_shape_fn(d.nrows(), |i| 10.0 * a[i] + 0.01 * b[i]))
        });
        let predictor = Predictor::new(model, data).unwrap();
        let config = LocalModelConfig { k: Some(1), ..Default::default() };
        let lime = LocalModel::new(&predictor, &x0, config, &mut StdRng::seed_from_u64(5)).unwrap();
        let terms = lime.result().terms();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].feature, "a");
        assert_abs_diff_eq!(terms[0].coefficient, 10.0, epsilon = 1e-2);
    }

    #[test]
    fn explain_refits_for_the_new_instance() {
        let data = data();
        let x0 = data.instance(0).unwrap();
        let x1 = data.instance(5).unwrap();
        let model = RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.mapv(|a| a * a)));
        let predictor = Predictor::new(model, data).unwrap();
        let config = LocalModelConfig { kernel_width: Some(0.3), ..Default::default() };
        let mut rng = StdRng::seed_from_u64(2);
        let mut lime = LocalModel::new(&predictor, &x0, config, &mut rng).unwrap();
        let slope_at_1 = lime.result().coefficient("a").unwrap();

        lime.explain(&x1, &mut rng).unwrap();
        let slope_at_6 = lime.result().coefficient("a").unwrap();
        assert_abs_diff_eq!(lime.result().black_box_prediction, 36.0);
        // the local slope of a^2 grows with a
        assert!(slope_at_6 > slope_at_1 + 5.0);

        let fitted = lime.predict(&predictor.data().select_rows(&[5])).unwrap();
        assert_abs_diff_eq!(fitted[0], lime.result().local_prediction, epsilon = 1e-9);
    }

    #[test]
    fn single_level_categorical_is_degenerate() {
        let data = Dataset::builder()
            .numeric("a", vec![1.0, 2.0, 3.0, 4.0])
            .categorical("c", &["x", "y"], &["x", "x", "x", "x"])
            .build()
            .unwrap();
        let x0 = data.instance(0).unwrap();
        let model = RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.to_owned()));
        let predictor = Predictor::new(model, data).unwrap();
        let outcome = LocalModel::new(&predictor, &x0, LocalModelConfig::default(), &mut StdRng::seed_from_u64(0));
        assert!(matches!(outcome, Err(ImlError::DegenerateFit(_))));
    }

    #[test]
    fn invalid_configurations() {
        for config in [
            LocalModelConfig { kernel_width: Some(-1.0), ..Default::default() },
            LocalModelConfig { kernel_width: Some(f64::INFINITY), ..Default::default() },
            LocalModelConfig { k: Some(0), ..Default::default() },
            LocalModelConfig { k: Some(4), ..Default::default() },
            LocalModelConfig { n_samples: 1, ..Default::default() },
        ] {
            assert!(matches!(config.validate(3), Err(ImlError::InvalidConfig(_))));
        }
    }
}
