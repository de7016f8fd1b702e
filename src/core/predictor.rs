// src/core/predictor.rs
use crate::core::{Dataset, ImlError, Result};
use crate::traits::PredictModel;
use ndarray::{Array1, Array2, Axis};
use std::sync::Arc;
use tracing::debug;

/// Wraps a black-box model together with its reference data so that every
/// explainer sees the same uniform contract: rows in, one row of outputs out.
///
/// The adapter never caches; each call goes to the model.
pub struct Predictor<M: PredictModel> {
    model: M,
    data: Dataset,
    target: Option<Array1<f64>>,
    n_outputs: usize,
    output_names: Vec<String>,
    class: Option<usize>,
}

impl<M: PredictModel> Predictor<M> {
    /// Probes the model on the reference data to learn its output arity.
    pub fn new(model: M, data: Dataset) -> Result<Self> {
        if data.nrows() == 0 {
            return Err(ImlError::InvalidInput("Reference data cannot be empty.".to_string()));
        }

        let probe = model.predict(&data)?;
        if probe.nrows() != data.nrows() {
            return Err(ImlError::AdapterShape {
                expected: format!("{} prediction rows", data.nrows()),
                actual: format!("{} prediction rows", probe.nrows()),
            });
        }
        if probe.ncols() == 0 {
            return Err(ImlError::AdapterShape {
                expected: "at least one output column".to_string(),
                actual: "0 output columns".to_string(),
            });
        }
        ensure_finite(&probe)?;

        let n_outputs = probe.ncols();
        let output_names = if n_outputs == 1 {
            vec!["pred".to_string()]
        } else {
            (0..n_outputs).map(|i| format!("output_{}", i)).collect()
        };
        debug!(rows = data.nrows(), features = data.ncols(), n_outputs, "predictor ready");

        Ok(Predictor { model, data, target: None, n_outputs, output_names, class: None })
    }

    /// Attaches ground truth for the reference rows.
    pub fn with_target(mut self, target: Array1<f64>) -> Result<Self> {
        if target.len() != self.data.nrows() {
            return Err(ImlError::InvalidInput(format!(
                "Target has {} values, reference data has {} rows.",
                target.len(),
                self.data.nrows()
            )));
        }
        if target.iter().any(|v| !v.is_finite()) {
            return Err(ImlError::InvalidInput("Target contains non-finite values.".to_string()));
        }
        self.target = Some(target);
        Ok(self)
    }

    /// Restricts every prediction to one output column (e.g. one class probability).
    pub fn with_class(mut self, class: usize) -> Result<Self> {
        if class >= self.n_outputs {
            return Err(ImlError::InvalidConfig(format!(
                "Class {} requested, but the model has {} outputs.",
                class, self.n_outputs
            )));
        }
        self.class = Some(class);
        Ok(self)
    }

    pub fn with_output_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.n_outputs {
            return Err(ImlError::InvalidConfig(format!(
                "{} output names given for {} outputs.",
                names.len(),
                self.n_outputs
            )));
        }
        self.output_names = names;
        Ok(self)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    pub fn target(&self) -> Option<&Array1<f64>> {
        self.target.as_ref()
    }

    /// Number of output columns `predict` returns.
    pub fn n_outputs(&self) -> usize {
        if self.class.is_some() {
            1
        } else {
            self.n_outputs
        }
    }

    /// Names of the output columns `predict` returns.
    pub fn output_names(&self) -> Vec<String> {
        match self.class {
            Some(c) => vec![self.output_names[c].clone()],
            None => self.output_names.clone(),
        }
    }

    pub fn predict(&self, data: &Dataset) -> Result<Array2<f64>> {
        if !Arc::ptr_eq(data.shared_schema(), self.data.shared_schema())
            && data.schema() != self.data.schema()
        {
            return Err(ImlError::InvalidInput(
                "Data schema differs from the reference data schema.".to_string(),
            ));
        }

        let raw = self.model.predict(data)?;
        if raw.nrows() != data.nrows() || raw.ncols() != self.n_outputs {
            return Err(ImlError::AdapterShape {
                expected: format!("{}x{}", data.nrows(), self.n_outputs),
                actual: format!("{}x{}", raw.nrows(), raw.ncols()),
            });
        }
        ensure_finite(&raw)?;

        Ok(match self.class {
            Some(c) => raw.select(Axis(1), &[c]),
            None => raw,
        })
    }

    /// Predictions as a vector; only valid when exactly one output is in play.
    pub fn predict_single(&self, data: &Dataset) -> Result<Array1<f64>> {
        if self.n_outputs() != 1 {
            return Err(ImlError::InvalidConfig(format!(
                "This method explains a single output, but the model has {}; select one with with_class.",
                self.n_outputs()
            )));
        }
        Ok(self.predict(data)?.column(0).to_owned())
    }
}

fn ensure_finite(predictions: &Array2<f64>) -> Result<()> {
    if predictions.iter().any(|v| !v.is_finite()) {
        return Err(ImlError::ModelPrediction("Model returned non-finite predictions.".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FnModel, RegressionFn};
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn data() -> Dataset {
        Dataset::builder()
            .numeric("a", vec![1.0, 2.0, 3.0])
            .categorical("c", &["x", "y"], &["x", "y", "x"])
            .build()
            .unwrap()
    }

    fn two_class(d: &Dataset, _: &()) -> Result<Array2<f64>> {
        let a = d.column("a")?;
        let mut out = Array2::zeros((d.nrows(), 2));
        for (i, &v) in a.iter().enumerate() {
            let p = v / 10.0;
            out[[i, 0]] = p;
            out[[i, 1]] = 1.0 - p;
        }
        Ok(out)
    }

    #[test]
    fn predict_is_deterministic() {
        let predictor =
            Predictor::new(RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.mapv(|v| v * 2.0))), data())
                .unwrap();
        let first = predictor.predict(predictor.data()).unwrap();
        let second = predictor.predict(predictor.data()).unwrap();
        assert_eq!(first, second);
        assert_eq!(predictor.output_names(), vec!["pred".to_string()]);
    }

    #[test]
    fn probe_rejects_row_mismatch() {
        let model = RegressionFn::new(|_: &Dataset| Ok(array![1.0]));
        assert!(matches!(Predictor::new(model, data()), Err(ImlError::AdapterShape { .. })));
    }

    #[test]
    fn column_count_change_between_calls_is_an_error() {
        let calls = AtomicUsize::new(0);
        let model = FnModel::new((), move |d: &Dataset, _: &()| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(Array2::zeros((d.nrows(), 1 + n)))
        });
        let predictor = Predictor::new(model, data()).unwrap();
        assert!(matches!(
            predictor.predict(predictor.data()),
            Err(ImlError::AdapterShape { .. })
        ));
    }

    #[test]
    fn class_selection_narrows_outputs() {
        let predictor = Predictor::new(FnModel::new((), two_class), data()).unwrap();
        assert_eq!(predictor.n_outputs(), 2);
        assert!(predictor.predict_single(predictor.data()).is_err());

        let predictor = predictor
            .with_output_names(vec!["low".into(), "high".into()])
            .unwrap()
            .with_class(1)
            .unwrap();
        assert_eq!(predictor.output_names(), vec!["high".to_string()]);
        let p = predictor.predict_single(predictor.data()).unwrap();
        assert!((p[0] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn target_length_is_checked() {
        let predictor = Predictor::new(FnModel::new((), two_class), data()).unwrap();
        assert!(predictor.with_target(array![1.0, 2.0]).is_err());
    }

    #[test]
    fn non_finite_predictions_are_reported() {
        let model = RegressionFn::new(|d: &Dataset| Ok(Array1::from_elem(d.nrows(), f64::NAN)));
        assert!(matches!(Predictor::new(model, data()), Err(ImlError::ModelPrediction(_))));
    }

    #[test]
    fn foreign_schema_is_rejected() {
        let predictor = Predictor::new(FnModel::new((), two_class), data()).unwrap();
        let renamed = Dataset::builder()
            .numeric("z", vec![1.0, 2.0, 3.0])
            .categorical("c", &["x", "y"], &["x", "y", "x"])
            .build()
            .unwrap();
        assert!(matches!(predictor.predict(&renamed), Err(ImlError::InvalidInput(_))));

        let relevelled = Dataset::builder()
            .numeric("a", vec![1.0, 2.0, 3.0])
            .categorical("c", &["x", "y", "w"], &["x", "y", "x"])
            .build()
            .unwrap();
        assert!(matches!(predictor.predict(&relevelled), Err(ImlError::InvalidInput(_))));

        // an equal schema built independently is accepted
        assert!(predictor.predict(&data()).is_ok());
    }
}
