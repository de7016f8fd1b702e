// src/traits.rs

use crate::core::{Dataset, Result};
use ndarray::{Array1, Array2, Axis};

/// The single capability every black-box model exposes to the explainers:
/// accept a row table, return a prediction table with one row per input row
/// and one column per model output.
///
/// Implementations must be shareable across worker threads; importance and
/// partial dependence evaluate independent batches in parallel.
pub trait PredictModel: Send + Sync {
    fn predict(&self, data: &Dataset) -> Result<Array2<f64>>;
}

impl<M: PredictModel + ?Sized> PredictModel for &M {
    fn predict(&self, data: &Dataset) -> Result<Array2<f64>> {
        (**self).predict(data)
    }
}

impl PredictModel for Box<dyn PredictModel> {
    fn predict(&self, data: &Dataset) -> Result<Array2<f64>> {
        self.as_ref().predict(data)
    }
}

/// Adapter for prediction functions that take fixed auxiliary arguments,
/// e.g. a flag selecting multi-output mode. The arguments are supplied once here
/// and passed to every call.
pub struct FnModel<F, A> {
    func: F,
    args: A,
}

impl<F, A> FnModel<F, A>
where
    F: Fn(&Dataset, &A) -> Result<Array2<f64>> + Send + Sync,
    A: Send + Sync,
{
    pub fn new(args: A, func: F) -> Self {
        FnModel { func, args }
    }

    pub fn args(&self) -> &A {
        &self.args
    }
}

impl<F, A> PredictModel for FnModel<F, A>
where
    F: Fn(&Dataset, &A) -> Result<Array2<f64>> + Send + Sync,
    A: Send + Sync,
{
    fn predict(&self, data: &Dataset) -> Result<Array2<f64>> {
        (self.func)(data, &self.args)
    }
}

/// Adapter for single-output models returning one value per row.
pub struct RegressionFn<F> {
    func: F,
}

impl<F> RegressionFn<F>
where
    F: Fn(&Dataset) -> Result<Array1<f64>> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        RegressionFn { func }
    }
}

impl<F> PredictModel for RegressionFn<F>
where
    F: Fn(&Dataset) -> Result<Array1<f64>> + Send + Sync,
{
    fn predict(&self, data: &Dataset) -> Result<Array2<f64>> {
        let predictions = (self.func)(data)?;
        Ok(predictions.insert_axis(Axis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Dataset {
        Dataset::builder()
            .numeric("a", vec![1.0, 2.0])
            .numeric("b", vec![10.0, 20.0])
            .build()
            .unwrap()
    }

    #[test]
    fn regression_fn_returns_one_column() {
        let model = RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.to_owned()));
        let out = model.predict(&data()).unwrap();
        assert_eq!(out.dim(), (2, 1));
        assert_eq!(out[[1, 0]], 2.0);
    }

    #[test]
    fn fn_model_passes_fixed_arguments() {
        let model = FnModel::new(3.0_f64, |d: &Dataset, scale: &f64| {
            let a = d.column("a")?;
            let b = d.column("b")?;
            let mut out = Array2::zeros((d.nrows(), 2));
            out.column_mut(0).assign(&(&a * *scale));
            out.column_mut(1).assign(&b);
            Ok(out)
        });
        let out = model.predict(&data()).unwrap();
        assert_eq!(out[[0, 0]], 3.0);
        assert_eq!(out[[1, 1]], 20.0);
        assert_eq!(*model.args(), 3.0);
    }
}
