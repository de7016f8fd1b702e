// src/algorithms/partial.rs
//! Partial dependence (PDP) and individual conditional expectation (ICE) curves.

use crate::core::{Dataset, FeatureKind, ImlError, Predictor, Result, Value};
use crate::traits::PredictModel;
use crate::utils::stats::quantile;
use ndarray::{s, Array2, Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialMethod {
    Pdp,
    Ice,
    PdpIce,
}

impl PartialMethod {
    fn wants_pdp(self) -> bool {
        matches!(self, PartialMethod::Pdp | PartialMethod::PdpIce)
    }

    fn wants_ice(self) -> bool {
        matches!(self, PartialMethod::Ice | PartialMethod::PdpIce)
    }
}

/// How grid points are placed along a numeric feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridType {
    /// Evenly spaced between the observed minimum and maximum.
    Equidistant,
    /// Distinct empirical quantiles.
    Quantile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub method: PartialMethod,
    pub grid_size: usize,
    pub grid_type: GridType,
}

impl Default for PartialConfig {
    fn default() -> Self {
        PartialConfig { method: PartialMethod::PdpIce, grid_size: 20, grid_type: GridType::Equidistant }
    }
}

impl PartialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grid_size == 0 {
            return Err(ImlError::InvalidConfig("grid_size must be at least 1.".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    Pdp,
    Ice,
}

/// One point of one curve, the unit a plotting layer consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialRecord {
    pub feature_values: Vec<Value>,
    pub output: String,
    pub curve: Curve,
    /// Reference row of an ICE curve.
    pub id: Option<usize>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct PartialResult {
    features: Vec<String>,
    method: PartialMethod,
    grid: Vec<Vec<Value>>,
    outputs: Vec<String>,
    pdp: Option<Array2<f64>>,
    ice: Option<Array3<f64>>,
    anchor: Option<usize>,
}

impl PartialResult {
    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn method(&self) -> PartialMethod {
        self.method
    }

    /// Grid points; each holds one value per selected feature.
    pub fn grid(&self) -> &[Vec<Value>] {
        &self.grid
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Averaged curve, shape (grid points, outputs).
    pub fn pdp(&self) -> Option<&Array2<f64>> {
        self.pdp.as_ref()
    }

    /// Per-row curves, shape (rows, grid points, outputs).
    pub fn ice(&self) -> Option<&Array3<f64>> {
        self.ice.as_ref()
    }

    /// Grid index the curves are centered on.
    pub fn anchor(&self) -> Option<usize> {
        self.anchor
    }

    pub fn records(&self) -> Vec<PartialRecord> {
        let mut records = Vec::new();
        if let Some(pdp) = &self.pdp {
            for (g, point) in self.grid.iter().enumerate() {
                for (o, output) in self.outputs.iter().enumerate() {
                    records.push(PartialRecord {
                        feature_values: point.clone(),
                        output: output.clone(),
                        curve: Curve::Pdp,
                        id: None,
                        value: pdp[[g, o]],
                    });
                }
            }
        }
        if let Some(ice) = &self.ice {
            for (row, curves) in ice.outer_iter().enumerate() {
                for (g, point) in self.grid.iter().enumerate() {
                    for (o, output) in self.outputs.iter().enumerate() {
                        records.push(PartialRecord {
                            feature_values: point.clone(),
                            output: output.clone(),
                            curve: Curve::Ice,
                            id: Some(row),
                            value: curves[[g, o]],
                        });
                    }
                }
            }
        }
        records
    }
}

/// PDP/ICE engine. Re-targeting or centering recomputes the whole result.
pub struct Partial<'p, M: PredictModel> {
    predictor: &'p Predictor<M>,
    config: PartialConfig,
    columns: Vec<usize>,
    grid: Vec<Vec<f64>>,
    // uncentered curves, (rows, grid points, outputs)
    ice: Array3<f64>,
    result: PartialResult,
}

impl<'p, M: PredictModel> Partial<'p, M> {
    pub fn new(predictor: &'p Predictor<M>, features: &[&str], config: PartialConfig) -> Result<Self> {
        config.validate()?;
        let (columns, grid, ice) = evaluate(predictor, features, &config)?;
        let result = assemble(predictor, &config, &columns, &grid, &ice, None);
        Ok(Partial { predictor, config, columns, grid, ice, result })
    }

    pub fn result(&self) -> &PartialResult {
        &self.result
    }

    /// Points the engine at other feature(s); any centering is dropped.
    pub fn set_feature(&mut self, features: &[&str]) -> Result<()> {
        let (columns, grid, ice) = evaluate(self.predictor, features, &self.config)?;
        self.result = assemble(self.predictor, &self.config, &columns, &grid, &ice, None);
        self.columns = columns;
        self.grid = grid;
        self.ice = ice;
        Ok(())
    }

    /// Shifts every curve so it is 0 at the grid point nearest `anchor`.
    pub fn center(&mut self, anchor: Value) -> Result<()> {
        if self.columns.len() != 1 {
            return Err(ImlError::InvalidConfig("Centering needs exactly one feature.".to_string()));
        }
        let col = self.columns[0];
        let schema = self.predictor.data().schema();
        let target = schema
            .encode(col, &anchor)
            .map_err(|e| ImlError::InvalidConfig(format!("Bad anchor: {}", e)))?;

        let index = match schema.feature(col).kind {
            FeatureKind::Numeric => self
                .grid
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    (a[0] - target)
                        .abs()
                        .partial_cmp(&(b[0] - target).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i),
            FeatureKind::Categorical { .. } => self.grid.iter().position(|p| p[0] == target),
        }
        .ok_or_else(|| ImlError::InvalidConfig(format!("Anchor {} is not on the grid.", anchor)))?;

        self.result = assemble(self.predictor, &self.config, &self.columns, &self.grid, &self.ice, Some(index));
        Ok(())
    }
}

type Evaluation = (Vec<usize>, Vec<Vec<f64>>, Array3<f64>);

fn evaluate<M: PredictModel>(
    predictor: &Predictor<M>,
    features: &[&str],
    config: &PartialConfig,
) -> Result<Evaluation> {
    if features.is_empty() || features.len() > 2 {
        return Err(ImlError::InvalidConfig("Select one or two features.".to_string()));
    }
    if features.len() == 2 && config.method.wants_ice() {
        return Err(ImlError::InvalidConfig("ICE curves need a single feature.".to_string()));
    }

    let data = predictor.data();
    let columns = features
        .iter()
        .map(|name| data.schema().index_of(name))
        .collect::<Result<Vec<usize>>>()?;
    if columns.len() == 2 && columns[0] == columns[1] {
        return Err(ImlError::InvalidConfig("Feature pair must be two distinct features.".to_string()));
    }

    let axes: Vec<Vec<f64>> = columns.iter().map(|&c| feature_grid(data, c, config)).collect();
    let grid: Vec<Vec<f64>> = match axes.as_slice() {
        [single] => single.iter().map(|&v| vec![v]).collect(),
        [first, second] => first
            .iter()
            .flat_map(|&v1| second.iter().map(move |&v2| vec![v1, v2]))
            .collect(),
        _ => unreachable!("one or two features checked above"),
    };
    debug!(?features, grid_points = grid.len(), "computing partial dependence");

    let per_point = grid
        .par_iter()
        .map(|point| {
            let mut values = data.values().clone();
            for (&col, &v) in columns.iter().zip(point) {
                values.column_mut(col).fill(v);
            }
            predictor.predict(&data.derive(values))
        })
        .collect::<Result<Vec<Array2<f64>>>>()?;

    let mut ice = Array3::zeros((data.nrows(), grid.len(), predictor.n_outputs()));
    for (g, predictions) in per_point.iter().enumerate() {
        ice.slice_mut(s![.., g, ..]).assign(predictions);
    }
    Ok((columns, grid, ice))
}

fn assemble<M: PredictModel>(
    predictor: &Predictor<M>,
    config: &PartialConfig,
    columns: &[usize],
    grid: &[Vec<f64>],
    ice: &Array3<f64>,
    anchor: Option<usize>,
) -> PartialResult {
    let schema = predictor.data().schema();

    let curves = match anchor {
        Some(a) => {
            let reference = ice.slice(s![.., a..a + 1, ..]).to_owned();
            ice - &reference
        }
        None => ice.clone(),
    };
    let pdp = if config.method.wants_pdp() {
        curves.mean_axis(Axis(0))
    } else {
        None
    };

    PartialResult {
        features: columns.iter().map(|&c| schema.feature(c).name.clone()).collect(),
        method: config.method,
        grid: grid
            .iter()
            .map(|point| columns.iter().zip(point).map(|(&c, &v)| schema.decode(c, v)).collect())
            .collect(),
        outputs: predictor.output_names(),
        pdp,
        ice: if config.method.wants_ice() { Some(curves) } else { None },
        anchor,
    }
}

fn feature_grid(data: &Dataset, col: usize, config: &PartialConfig) -> Vec<f64> {
    let mut observed: Vec<f64> = data.values().column(col).to_vec();
    observed.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if data.schema().feature(col).is_categorical() {
        observed.dedup();
        return observed;
    }

    let size = config.grid_size;
    let (min, max) = (observed[0], observed[observed.len() - 1]);
    if size == 1 || min == max {
        return vec![min];
    }
    let mut grid: Vec<f64> = match config.grid_type {
        GridType::Equidistant => {
            let step = (max - min) / (size - 1) as f64;
            (0..size).map(|i| min + i as f64 * step).collect()
        }
        GridType::Quantile => (0..size)
            .map(|i| quantile(&observed, i as f64 / (size - 1) as f64))
            .collect(),
    };
    grid.dedup();
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FnModel, RegressionFn};
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn data() -> Dataset {
        Dataset::builder()
            .numeric("a", vec![0.0, 1.0, 2.0, 3.0, 10.0])
            .numeric("b", vec![5.0, 3.0, 1.0, 4.0, 2.0])
            .categorical("c", &["x", "y", "unused"], &["x", "y", "x", "y", "x"])
            .build()
            .unwrap()
    }

    fn interaction_model(d: &Dataset) -> Result<Array1<f64>> {
        let a = d.column("a")?;
        let b = d.column("b")?;
        let c = d.column("c")?;
        Ok(Array1::from_shape_fn(d.nrows(), |i| a[i] * b[i] + 3.0 * c[i]))
    }

    #[test]
    fn pdp_of_linear_effect_has_matching_slope() {
        let model = RegressionFn::new(|d: &Dataset| {
            Ok(&d.column("a")?.to_owned() + &d.column("b")?.mapv(|b| 2.0 * b))
        });
        let predictor = Predictor::new(model, data()).unwrap();
        let partial = Partial::new(&predictor, &["a"], PartialConfig::default()).unwrap();
        let result = partial.result();

        let pdp = result.pdp().unwrap();
        assert_eq!(pdp.dim(), (20, 1));
        for (g, point) in result.grid().iter().enumerate() {
            let Value::Numeric(v) = &point[0] else { panic!("numeric grid expected") };
            // mean(b) = 3
            assert_abs_diff_eq!(pdp[[g, 0]], v + 6.0, epsilon = 1e-9);
        }
        assert_eq!(result.ice().unwrap().dim(), (5, 20, 1));
    }

    #[test]
    fn centering_zeroes_every_curve_at_the_anchor() {
        let predictor = Predictor::new(RegressionFn::new(interaction_model), data()).unwrap();
        let mut partial = Partial::new(&predictor, &["a"], PartialConfig::default()).unwrap();
        partial.center(Value::Numeric(4.2)).unwrap();

        let result = partial.result();
        let anchor = result.anchor().unwrap();
        // grid step is 10/19, 4.2 is nearest to 8 * 10/19
        assert_eq!(anchor, 8);
        let ice = result.ice().unwrap();
        for row in 0..ice.dim().0 {
            assert_eq!(ice[[row, anchor, 0]], 0.0);
        }
        assert_eq!(result.pdp().unwrap()[[anchor, 0]], 0.0);
    }

    #[test]
    fn categorical_grid_uses_observed_levels() {
        let predictor = Predictor::new(RegressionFn::new(interaction_model), data()).unwrap();
        let mut partial = Partial::new(&predictor, &["c"], PartialConfig::default()).unwrap();
        let grid = partial.result().grid().to_vec();
        assert_eq!(grid, vec![vec![Value::from("x")], vec![Value::from("y")]]);

        partial.center(Value::from("y")).unwrap();
        assert_eq!(partial.result().anchor(), Some(1));
        assert!(matches!(partial.center(Value::from("unused")), Err(ImlError::InvalidConfig(_))));
        assert!(matches!(partial.center(Value::Numeric(1.0)), Err(ImlError::InvalidConfig(_))));
    }

    #[test]
    fn set_feature_recomputes_and_clears_centering() {
        let predictor = Predictor::new(RegressionFn::new(interaction_model), data()).unwrap();
        let mut partial = Partial::new(&predictor, &["a"], PartialConfig::default()).unwrap();
        partial.center(Value::Numeric(0.0)).unwrap();
        partial.set_feature(&["b"]).unwrap();

        let result = partial.result();
        assert_eq!(result.features(), &["b".to_string()]);
        assert_eq!(result.anchor(), None);
        assert_eq!(result.grid().len(), 20);

        assert!(matches!(partial.set_feature(&["nope"]), Err(ImlError::UnknownFeature(_))));
        // a failed re-target leaves the previous result intact
        assert_eq!(partial.result().features(), &["b".to_string()]);
    }

    #[test]
    fn feature_pair_gives_product_grid() {
        let predictor = Predictor::new(RegressionFn::new(interaction_model), data()).unwrap();
        let config = PartialConfig { method: PartialMethod::Pdp, grid_size: 3, ..Default::default() };
        let mut partial = Partial::new(&predictor, &["a", "c"], config).unwrap();
        let result = partial.result();
        assert_eq!(result.grid().len(), 6);
        assert!(result.ice().is_none());
        assert_eq!(result.pdp().unwrap().dim(), (6, 1));
        assert!(matches!(partial.center(Value::Numeric(0.0)), Err(ImlError::InvalidConfig(_))));

        let with_ice = PartialConfig { grid_size: 3, ..Default::default() };
        assert!(matches!(Partial::new(&predictor, &["a", "c"], with_ice), Err(ImlError::InvalidConfig(_))));
    }

    #[test]
    fn quantile_grid_is_deduplicated() {
        let predictor = Predictor::new(RegressionFn::new(interaction_model), data()).unwrap();
        let config = PartialConfig { grid_type: GridType::Quantile, grid_size: 50, ..Default::default() };
        let result = Partial::new(&predictor, &["a"], config).unwrap().result().clone();
        let first = &result.grid()[0][0];
        let last = &result.grid()[result.grid().len() - 1][0];
        assert_eq!(first, &Value::Numeric(0.0));
        assert_eq!(last, &Value::Numeric(10.0));
        assert!(result.grid().windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn every_output_gets_a_curve() {
        let model = FnModel::new((), |d: &Dataset, _: &()| {
            let a = d.column("a")?;
            let mut out = Array2::zeros((d.nrows(), 2));
            out.column_mut(0).assign(&a);
            out.column_mut(1).assign(&a.mapv(|v| -v));
            Ok(out)
        });
        let predictor = Predictor::new(model, data()).unwrap();
        let config = PartialConfig { grid_size: 4, ..Default::default() };
        let partial = Partial::new(&predictor, &["a"], config).unwrap();
        let records = partial.result().records();
        // 4 grid points x 2 outputs for the PDP, plus 5 rows of ICE
        assert_eq!(records.len(), 4 * 2 + 5 * 4 * 2);
        assert!(records.iter().any(|r| r.output == "output_1" && r.curve == Curve::Pdp));
        let json = serde_json::to_string(&records[0]).unwrap();
        assert!(json.contains("\"curve\":\"pdp\""));
    }
}
