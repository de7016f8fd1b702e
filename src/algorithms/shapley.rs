// src/algorithms/shapley.rs

use crate::core::{ImlError, Instance, Predictor, Result};
use crate::traits::PredictModel;
use ndarray::{Array1, Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Residual of the efficiency property above which an exact result is suspicious.
const EXACT_EFFICIENCY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapleyMethod {
    /// Exact enumeration up to `exact_max_features`, sampling above it.
    Auto,
    Exact,
    Sampling,
}

/// Configuration for the Shapley explainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapleyConfig {
    /// Number of sampled (permutation, reference row) pairs.
    pub n_samples: usize,
    pub method: ShapleyMethod,
    pub exact_max_features: usize,
}

impl Default for ShapleyConfig {
    fn default() -> Self {
        ShapleyConfig { n_samples: 100, method: ShapleyMethod::Auto, exact_max_features: 10 }
    }
}

impl ShapleyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_samples == 0 {
            return Err(ImlError::InvalidConfig("n_samples must be at least 1.".to_string()));
        }
        if self.method != ShapleyMethod::Sampling && self.exact_max_features > 20 {
            return Err(ImlError::InvalidConfig(format!(
                "exact_max_features of {} would enumerate more than 2^20 coalitions.",
                self.exact_max_features
            )));
        }
        Ok(())
    }
}

/// Which estimator produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimation {
    Exact,
    Sampling { n_samples: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShapleyRecord {
    pub feature: String,
    /// `name=value` of the explained instance.
    pub feature_value: String,
    pub output: String,
    pub phi: f64,
    pub phi_var: f64,
}

#[derive(Debug, Clone)]
pub struct ShapleyResult {
    instance: Instance,
    features: Vec<String>,
    outputs: Vec<String>,
    /// Contributions, shape (features, outputs).
    pub phi: Array2<f64>,
    /// Variance of the sampled marginal contributions; zero for exact results.
    pub phi_var: Array2<f64>,
    /// Black-box prediction for the instance, one per output.
    pub prediction: Array1<f64>,
    /// Mean black-box prediction over the reference data, one per output.
    pub average_prediction: Array1<f64>,
    pub estimation: Estimation,
}

impl ShapleyResult {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Contribution of `feature` to the first output.
    pub fn contribution(&self, feature: &str) -> Option<f64> {
        self.features.iter().position(|f| f == feature).map(|j| self.phi[[j, 0]])
    }

    /// Σφ + average − prediction per output; zero up to rounding for exact results.
    pub fn efficiency_gap(&self) -> Array1<f64> {
        self.phi.sum_axis(Axis(0)) + &self.average_prediction - &self.prediction
    }

    pub fn records(&self) -> Vec<ShapleyRecord> {
        let mut records = Vec::with_capacity(self.features.len() * self.outputs.len());
        for (j, feature) in self.features.iter().enumerate() {
            for (o, output) in self.outputs.iter().enumerate() {
                records.push(ShapleyRecord {
                    feature: feature.clone(),
                    feature_value: self.instance.describe(j),
                    output: output.clone(),
                    phi: self.phi[[j, o]],
                    phi_var: self.phi_var[[j, o]],
                });
            }
        }
        records
    }
}

impl fmt::Display for ShapleyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Shapley explanation ({:?}):", self.estimation)?;
        for (o, output) in self.outputs.iter().enumerate() {
            writeln!(f, "  Output {}:", output)?;
            writeln!(f, "    Average Prediction: {:.4}", self.average_prediction[o])?;
            writeln!(f, "    Actual Prediction:  {:.4}", self.prediction[o])?;
            for j in 0..self.features.len() {
                writeln!(f, "    {}: {:.4}", self.instance.describe(j), self.phi[[j, o]])?;
            }
        }
        Ok(())
    }
}

/// Shapley value attribution of a single prediction.
pub struct Shapley<'p, M: PredictModel> {
    predictor: &'p Predictor<M>,
    config: ShapleyConfig,
    average_prediction: Array1<f64>,
    result: ShapleyResult,
}

impl<'p, M: PredictModel> Shapley<'p, M> {
    pub fn new<R: Rng + ?Sized>(
        predictor: &'p Predictor<M>,
        instance: &Instance,
        config: ShapleyConfig,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let n_features = predictor.data().ncols();
        if config.method == ShapleyMethod::Exact && n_features > config.exact_max_features {
            return Err(ImlError::InvalidConfig(format!(
                "Exact Shapley values are limited to {} features, the data has {}.",
                config.exact_max_features, n_features
            )));
        }

        let average_prediction = predictor
            .predict(predictor.data())?
            .mean_axis(Axis(0))
            .ok_or_else(|| ImlError::InvalidInput("Reference data is empty.".to_string()))?;
        let result = explain_instance(predictor, &config, &average_prediction, instance, rng)?;
        Ok(Shapley { predictor, config, average_prediction, result })
    }

    pub fn result(&self) -> &ShapleyResult {
        &self.result
    }

    /// Discards the current estimate and explains `instance` from scratch.
    pub fn explain<R: Rng + ?Sized>(&mut self, instance: &Instance, rng: &mut R) -> Result<()> {
        self.result = explain_instance(self.predictor, &self.config, &self.average_prediction, instance, rng)?;
        Ok(())
    }
}

fn explain_instance<M: PredictModel, R: Rng + ?Sized>(
    predictor: &Predictor<M>,
    config: &ShapleyConfig,
    average_prediction: &Array1<f64>,
    instance: &Instance,
    rng: &mut R,
) -> Result<ShapleyResult> {
    let data = predictor.data();
    instance.ensure_schema(data.schema())?;
    let n_features = data.ncols();

    let use_exact = match config.method {
        ShapleyMethod::Exact => true,
        ShapleyMethod::Sampling => false,
        ShapleyMethod::Auto => n_features <= config.exact_max_features,
    };
    let (phi, phi_var, estimation) = if use_exact {
        let phi = exact_values(predictor, instance)?;
        let var = Array2::zeros(phi.raw_dim());
        (phi, var, Estimation::Exact)
    } else {
        let (phi, var) = sampled_values(predictor, instance, config.n_samples, rng)?;
        (phi, var, Estimation::Sampling { n_samples: config.n_samples })
    };

    let prediction = predictor.predict(&instance.to_dataset())?.row(0).to_owned();
    let result = ShapleyResult {
        instance: instance.clone(),
        features: data.schema().names().into_iter().map(String::from).collect(),
        outputs: predictor.output_names(),
        phi,
        phi_var,
        prediction,
        average_prediction: average_prediction.clone(),
        estimation,
    };

    let worst_gap = result.efficiency_gap().iter().fold(0.0_f64, |acc, g| acc.max(g.abs()));
    if estimation == Estimation::Exact && worst_gap > EXACT_EFFICIENCY_TOLERANCE {
        warn!(worst_gap, "exact Shapley values violate efficiency");
    }
    debug!(?estimation, worst_gap, "Shapley values computed");
    Ok(result)
}

/// Enumerates every coalition; a coalition's value is the mean prediction over the
/// reference rows with the coalition's features taken from the instance. Each
/// coalition is its own batch of reference-sized predictions.
fn exact_values<M: PredictModel>(predictor: &Predictor<M>, instance: &Instance) -> Result<Array2<f64>> {
    let data = predictor.data();
    let x0 = instance.values();
    let m = data.ncols();
    let n_outputs = predictor.n_outputs();
    let n_coalitions = 1_usize << m;

    let coalition_values = (0..n_coalitions)
        .into_par_iter()
        .map(|mask| {
            let mut rows = data.values().clone();
            for j in (0..m).filter(|j| (mask >> j) & 1 == 1) {
                rows.column_mut(j).fill(x0[j]);
            }
            predictor
                .predict(&data.derive(rows))?
                .mean_axis(Axis(0))
                .ok_or_else(|| ImlError::InvalidInput("Reference data is empty.".to_string()))
        })
        .collect::<Result<Vec<Array1<f64>>>>()?;

    let mut value = Array2::zeros((n_coalitions, n_outputs));
    for (mask, mean) in coalition_values.iter().enumerate() {
        value.row_mut(mask).assign(mean);
    }

    let mut phi = Array2::zeros((m, n_outputs));
    for j in 0..m {
        let bit = 1_usize << j;
        for mask in (0..n_coalitions).filter(|mask| mask & bit == 0) {
            let weight = 1.0 / (m as f64 * n_choose_k(m - 1, mask.count_ones() as usize));
            for o in 0..n_outputs {
                phi[[j, o]] += weight * (value[[mask | bit, o]] - value[[mask, o]]);
            }
        }
    }
    Ok(phi)
}

/// Monte Carlo over (permutation, reference row) pairs: reveal the instance's
/// features one by one in permutation order and credit each prediction change
/// to the feature just revealed.
fn sampled_values<M: PredictModel, R: Rng + ?Sized>(
    predictor: &Predictor<M>,
    instance: &Instance,
    n_samples: usize,
    rng: &mut R,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let data = predictor.data();
    let background = data.values();
    let x0 = instance.values();
    let m = data.ncols();
    let chain = m + 1;

    let mut orders = Vec::with_capacity(n_samples);
    let mut rows = Array2::zeros((n_samples * chain, m));
    for s in 0..n_samples {
        let mut order: Vec<usize> = (0..m).collect();
        order.shuffle(rng);
        let start = background.row(rng.gen_range(0..data.nrows())).to_owned();

        let base = s * chain;
        rows.row_mut(base).assign(&start);
        for (k, &feature) in order.iter().enumerate() {
            let (prev, mut next) = rows.multi_slice_mut((
                ndarray::s![base + k, ..],
                ndarray::s![base + k + 1, ..],
            ));
            next.assign(&prev);
            next[feature] = x0[feature];
        }
        orders.push(order);
    }

    let predictions = predictor.predict(&data.derive(rows))?;
    let n_outputs = predictions.ncols();

    // deltas[s, feature, output]
    let mut deltas = Array3::zeros((n_samples, m, n_outputs));
    for (s, order) in orders.iter().enumerate() {
        let base = s * chain;
        for (k, &feature) in order.iter().enumerate() {
            for o in 0..n_outputs {
                deltas[[s, feature, o]] = predictions[[base + k + 1, o]] - predictions[[base + k, o]];
            }
        }
    }

    let phi = deltas
        .mean_axis(Axis(0))
        .ok_or_else(|| ImlError::InvalidConfig("n_samples must be at least 1.".to_string()))?;
    let var = deltas.var_axis(Axis(0), 0.0);
    Ok((phi, var))
}

/// Helper for combinations C(n, k) = n! / (k! * (n-k)!)
fn n_choose_k(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    if k == 0 || k == n {
        return 1.0;
    }
    // Exploit symmetry C(n, k) = C(n, n-k) to keep k small for precision
    let eff_k = if k > n / 2 { n - k } else { k };

    let mut res = 1.0;
    for i in 0..eff_k {
        res *= (n - i) as f64;
        res /= (i + 1) as f64;
    }
    res
}
