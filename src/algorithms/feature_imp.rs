// src/algorithms/feature_imp.rs

use crate::core::{ImlError, Predictor, Result};
use crate::traits::PredictModel;
use crate::utils::stats::{mean, quantile};
use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Loss between ground truth and predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loss {
    Mae,
    Mse,
    Rmse,
    /// Mean squared logarithmic error; undefined for values <= -1.
    Msle,
}

impl Loss {
    pub fn evaluate(&self, actual: &Array1<f64>, predicted: &Array1<f64>) -> f64 {
        let n = actual.len().max(1) as f64;
        let pairs = actual.iter().zip(predicted.iter());
        match self {
            Loss::Mae => pairs.map(|(a, p)| (a - p).abs()).sum::<f64>() / n,
            Loss::Mse => pairs.map(|(a, p)| (a - p).powi(2)).sum::<f64>() / n,
            Loss::Rmse => (pairs.map(|(a, p)| (a - p).powi(2)).sum::<f64>() / n).sqrt(),
            Loss::Msle => pairs.map(|(a, p)| (a.ln_1p() - p.ln_1p()).powi(2)).sum::<f64>() / n,
        }
    }
}

/// How the permuted loss is compared with the baseline loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compare {
    /// permuted / baseline; 1 means "no effect".
    Ratio,
    /// permuted - baseline; 0 means "no effect".
    Difference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureImpConfig {
    pub loss: Loss,
    pub compare: Compare,
    pub n_repetitions: usize,
    /// Restrict the computation to these features; all features when `None`.
    pub features: Option<Vec<String>>,
}

impl Default for FeatureImpConfig {
    fn default() -> Self {
        FeatureImpConfig { loss: Loss::Mae, compare: Compare::Ratio, n_repetitions: 5, features: None }
    }
}

impl FeatureImpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_repetitions == 0 {
            return Err(ImlError::InvalidConfig("n_repetitions must be at least 1.".to_string()));
        }
        if matches!(&self.features, Some(f) if f.is_empty()) {
            return Err(ImlError::InvalidConfig("Feature subset cannot be empty.".to_string()));
        }
        Ok(())
    }
}

/// Importance of one feature, aggregated over repetitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub baseline_loss: f64,
    /// Mean loss after permuting this feature.
    pub permuted_loss: f64,
    /// Mean importance over repetitions.
    pub importance: f64,
    pub importance_05: f64,
    pub importance_95: f64,
    pub repetitions: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ImportanceResult {
    pub loss: Loss,
    pub compare: Compare,
    pub baseline_loss: f64,
    /// Set when the model matches the ground truth exactly. Ratios are then
    /// infinite for every feature whose permutation changes the loss.
    pub zero_baseline_loss: bool,
    importances: Vec<FeatureImportance>,
}

impl ImportanceResult {
    /// Features ordered by descending importance.
    pub fn importances(&self) -> &[FeatureImportance] {
        &self.importances
    }

    pub fn get(&self, feature: &str) -> Option<&FeatureImportance> {
        self.importances.iter().find(|imp| imp.feature == feature)
    }

    pub fn ranking(&self) -> Vec<&str> {
        self.importances.iter().map(|imp| imp.feature.as_str()).collect()
    }

    /// Tabular form for a rendering layer.
    pub fn records(&self) -> &[FeatureImportance] {
        &self.importances
    }
}

/// Permutation feature importance.
pub struct FeatureImp<'p, M: PredictModel> {
    predictor: &'p Predictor<M>,
    config: FeatureImpConfig,
    features: Vec<usize>,
}

impl<'p, M: PredictModel> FeatureImp<'p, M> {
    pub fn new(predictor: &'p Predictor<M>, config: FeatureImpConfig) -> Result<Self> {
        config.validate()?;
        if predictor.target().is_none() {
            return Err(ImlError::MissingGroundTruth);
        }
        let schema = predictor.data().schema();
        let features = match &config.features {
            Some(names) => names.iter().map(|n| schema.index_of(n)).collect::<Result<Vec<_>>>()?,
            None => (0..schema.len()).collect(),
        };
        Ok(FeatureImp { predictor, config, features })
    }

    pub fn compute<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ImportanceResult> {
        let target = self.predictor.target().ok_or(ImlError::MissingGroundTruth)?;
        let data = self.predictor.data();
        let n_rows = data.nrows();
        let n_reps = self.config.n_repetitions;

        let baseline_loss = self.loss(target, &self.predictor.predict_single(data)?)?;
        let zero_baseline_loss = baseline_loss == 0.0;
        if zero_baseline_loss && self.config.compare == Compare::Ratio {
            warn!("baseline loss is zero; importance ratios of influential features are infinite");
        }

        // All shuffles are drawn up front so the parallel evaluation stays reproducible.
        let mut jobs = Vec::with_capacity(self.features.len() * n_reps);
        for &feature in &self.features {
            for _ in 0..n_reps {
                let mut order: Vec<usize> = (0..n_rows).collect();
                order.shuffle(rng);
                jobs.push((feature, order));
            }
        }
        debug!(features = self.features.len(), repetitions = n_reps, "computing permutation importance");

        let permuted_losses = jobs
            .par_iter()
            .map(|(feature, order)| {
                let mut values = data.values().clone();
                for (row, &source) in order.iter().enumerate() {
                    values[[row, *feature]] = data.values()[[source, *feature]];
                }
                let predictions = self.predictor.predict_single(&data.derive(values))?;
                self.loss(target, &predictions)
            })
            .collect::<Result<Vec<f64>>>()?;

        let schema = data.schema();
        let mut importances: Vec<FeatureImportance> = self
            .features
            .iter()
            .zip(permuted_losses.chunks(n_reps))
            .map(|(&feature, losses)| {
                let repetitions: Vec<f64> = losses.iter().map(|&l| self.compare(l, baseline_loss)).collect();
                FeatureImportance {
                    feature: schema.feature(feature).name.clone(),
                    baseline_loss,
                    permuted_loss: mean(losses),
                    importance: mean(&repetitions),
                    importance_05: quantile(&repetitions, 0.05),
                    importance_95: quantile(&repetitions, 0.95),
                    repetitions,
                }
            })
            .collect();
        // Infinite ratios compare equal; the permuted loss still orders them.
        importances.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.permuted_loss.partial_cmp(&a.permuted_loss).unwrap_or(Ordering::Equal))
        });

        Ok(ImportanceResult {
            loss: self.config.loss,
            compare: self.config.compare,
            baseline_loss,
            zero_baseline_loss,
            importances,
        })
    }

    fn loss(&self, target: &Array1<f64>, predictions: &Array1<f64>) -> Result<f64> {
        let value = self.config.loss.evaluate(target, predictions);
        if !value.is_finite() {
            return Err(ImlError::InvalidInput(format!(
                "{:?} loss is not finite for these targets and predictions.",
                self.config.loss
            )));
        }
        Ok(value)
    }

    fn compare(&self, permuted: f64, baseline: f64) -> f64 {
        match self.config.compare {
            Compare::Difference => permuted - baseline,
            Compare::Ratio if baseline == 0.0 => {
                if permuted == 0.0 {
                    1.0
                } else {
                    f64::INFINITY
                }
            }
            Compare::Ratio => permuted / baseline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Dataset;
    use crate::traits::RegressionFn;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn data() -> Dataset {
        Dataset::builder()
            .numeric("a", (0..20).map(|i| i as f64).collect())
            .numeric("b", (0..20).map(|i| ((i * 7) % 11) as f64).collect())
            .build()
            .unwrap()
    }

    fn only_a() -> RegressionFn<impl Fn(&Dataset) -> Result<Array1<f64>> + Send + Sync> {
        RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.to_owned()))
    }

    #[test]
    fn ignored_feature_has_no_importance() {
        let data = data();
        let y: Array1<f64> = data.column("a").unwrap().mapv(|v| v + if v as usize % 2 == 0 { 0.5 } else { -0.5 });
        let predictor = Predictor::new(only_a(), data).unwrap().with_target(y).unwrap();

        for loss in [Loss::Mae, Loss::Mse, Loss::Rmse, Loss::Msle] {
            let diff = FeatureImp::new(
                &predictor,
                FeatureImpConfig { loss, compare: Compare::Difference, ..Default::default() },
            )
            .unwrap()
            .compute(&mut StdRng::seed_from_u64(7))
            .unwrap();
            assert_abs_diff_eq!(diff.get("b").unwrap().importance, 0.0, epsilon = 1e-12);
            assert_eq!(diff.ranking(), vec!["a", "b"]);

            let ratio = FeatureImp::new(&predictor, FeatureImpConfig { loss, ..Default::default() })
                .unwrap()
                .compute(&mut StdRng::seed_from_u64(7))
                .unwrap();
            assert_abs_diff_eq!(ratio.get("b").unwrap().importance, 1.0, epsilon = 1e-12);
            assert!(ratio.get("a").unwrap().importance > 1.0);
        }
    }

    #[test]
    fn zero_baseline_is_flagged_not_divided() {
        let data = data();
        let y = data.column("a").unwrap().to_owned();
        let predictor = Predictor::new(only_a(), data).unwrap().with_target(y).unwrap();
        let result = FeatureImp::new(&predictor, FeatureImpConfig::default())
            .unwrap()
            .compute(&mut StdRng::seed_from_u64(1))
            .unwrap();

        assert!(result.zero_baseline_loss);
        assert_eq!(result.get("a").unwrap().importance, f64::INFINITY);
        assert_eq!(result.get("b").unwrap().importance, 1.0);
        assert!(result.records().iter().all(|r| !r.importance.is_nan() && !r.importance_05.is_nan()));
    }

    #[test]
    fn infinite_ratios_rank_by_permuted_loss() {
        let data = data();
        let model = RegressionFn::new(|d: &Dataset| {
            Ok(&d.column("a")?.to_owned() + &d.column("b")?.mapv(|b| 100.0 * b))
        });
        let y = model.predict(&data).unwrap().column(0).to_owned();
        let predictor = Predictor::new(model, data).unwrap().with_target(y).unwrap();
        let result = FeatureImp::new(&predictor, FeatureImpConfig::default())
            .unwrap()
            .compute(&mut StdRng::seed_from_u64(5))
            .unwrap();

        assert!(result.importances().iter().all(|r| r.importance == f64::INFINITY));
        assert_eq!(result.ranking(), vec!["b", "a"]);
        assert!(result.get("b").unwrap().permuted_loss > result.get("a").unwrap().permuted_loss);
    }

    #[test]
    fn same_seed_same_result() {
        let data = data();
        let y = data.column("b").unwrap().to_owned();
        let predictor = Predictor::new(only_a(), data).unwrap().with_target(y).unwrap();
        let engine = FeatureImp::new(&predictor, FeatureImpConfig::default()).unwrap();
        let first = engine.compute(&mut StdRng::seed_from_u64(3)).unwrap();
        let second = engine.compute(&mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(first.records(), second.records());
        assert_eq!(first.records()[0].repetitions.len(), 5);
    }

    #[test]
    fn configuration_errors() {
        let predictor = Predictor::new(only_a(), data()).unwrap();
        assert!(matches!(
            FeatureImp::new(&predictor, FeatureImpConfig::default()),
            Err(ImlError::MissingGroundTruth)
        ));

        let predictor = predictor.with_target(Array1::zeros(20)).unwrap();
        let zero_reps = FeatureImpConfig { n_repetitions: 0, ..Default::default() };
        assert!(matches!(FeatureImp::new(&predictor, zero_reps), Err(ImlError::InvalidConfig(_))));

        let unknown = FeatureImpConfig { features: Some(vec!["zz".into()]), ..Default::default() };
        assert!(matches!(FeatureImp::new(&predictor, unknown), Err(ImlError::UnknownFeature(_))));
    }

    #[test]
    fn msle_rejects_values_below_minus_one() {
        let loss = Loss::Msle.evaluate(&array![-2.0], &array![0.0]);
        assert!(!loss.is_finite());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: FeatureImpConfig = serde_json::from_str(r#"{"loss":"mse","compare":"difference"}"#).unwrap();
        assert_eq!(config.loss, Loss::Mse);
        assert_eq!(config.compare, Compare::Difference);
        assert_eq!(config.n_repetitions, 5);
    }
}
