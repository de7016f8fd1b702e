// src/algorithms/tree_surrogate.rs

//! Global surrogate: a shallow decision tree trained on the black-box predictions
//! of the reference data, with the reference features as inputs.

use crate::core::{Dataset, ImlError, Predictor, Result, Schema};
use crate::traits::PredictModel;
use crate::utils::stats;
use ndarray::{Array1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Gains at or below this are treated as no improvement.
const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeSurrogateConfig {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

impl Default for TreeSurrogateConfig {
    fn default() -> Self {
        TreeSurrogateConfig { max_depth: 2, min_samples_leaf: 1 }
    }
}

impl TreeSurrogateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(ImlError::InvalidConfig("max_depth must be at least 1.".to_string()));
        }
        if self.min_samples_leaf == 0 {
            return Err(ImlError::InvalidConfig("min_samples_leaf must be at least 1.".to_string()));
        }
        Ok(())
    }
}

/// What the tree was trained to reproduce.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SurrogateTask {
    /// The single black-box output, fit with the MSE criterion.
    Regression,
    /// The arg-max over several outputs, fit with Gini impurity.
    Classification { classes: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SplitRule {
    /// Left branch takes `x <= threshold`.
    Threshold(f64),
    /// Left branch takes `x == level` (level code).
    Level(usize),
}

impl SplitRule {
    fn goes_left(&self, x: f64) -> bool {
        match *self {
            SplitRule::Threshold(t) => x <= t,
            SplitRule::Level(code) => x as usize == code,
        }
    }
}

#[derive(Debug, Clone)]
enum TreeNode {
    Leaf {
        value: f64,
        n_samples: usize,
    },
    Split {
        feature_idx: usize,
        rule: SplitRule,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    fn n_leaves(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => left.n_leaves() + right.n_leaves(),
        }
    }

    fn route(&self, row: ndarray::ArrayView1<f64>) -> f64 {
        match self {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split { feature_idx, rule, left, right } => {
                if rule.goes_left(row[*feature_idx]) {
                    left.route(row)
                } else {
                    right.route(row)
                }
            }
        }
    }
}

/// One root-to-leaf path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeRule {
    pub leaf: usize,
    /// Conditions along the path, e.g. `a <= 4.5` or `c != x`.
    pub conditions: Vec<String>,
    /// Mean target (regression) or class index (classification).
    pub prediction: f64,
    /// Class name for classification trees.
    pub label: Option<String>,
    pub n_samples: usize,
}

#[derive(Debug, Clone)]
pub struct TreeSurrogate {
    schema: Arc<Schema>,
    config: TreeSurrogateConfig,
    task: SurrogateTask,
    root: TreeNode,
    fidelity: f64,
}

impl TreeSurrogate {
    pub fn fit<M: PredictModel>(predictor: &Predictor<M>, config: TreeSurrogateConfig) -> Result<Self> {
        config.validate()?;
        let data = predictor.data();
        let predictions = predictor.predict(data)?;

        let (task, target) = if predictions.ncols() == 1 {
            (SurrogateTask::Regression, predictions.column(0).to_vec())
        } else {
            let classes = predictions
                .axis_iter(Axis(0))
                .map(|row| arg_max(row.iter().copied()) as f64)
                .collect();
            (SurrogateTask::Classification { classes: predictor.output_names() }, classes)
        };

        let builder = Builder {
            x: data.values().view(),
            y: &target,
            schema: data.schema(),
            config: &config,
            n_classes: match &task {
                SurrogateTask::Regression => 0,
                SurrogateTask::Classification { classes } => classes.len(),
            },
        };
        let indices: Vec<usize> = (0..target.len()).collect();
        let root = builder.build(&indices, 0);

        let fitted: Vec<f64> = data.values().axis_iter(Axis(0)).map(|row| root.route(row)).collect();
        let fidelity = match task {
            SurrogateTask::Regression => stats::r_squared(&target, &fitted, None),
            SurrogateTask::Classification { .. } => {
                let hits = target.iter().zip(&fitted).filter(|(t, f)| t == f).count();
                hits as f64 / target.len() as f64
            }
        };
        debug!(depth = root.depth(), leaves = root.n_leaves(), fidelity, "surrogate tree fitted");

        Ok(TreeSurrogate { schema: Arc::clone(data.shared_schema()), config, task, root, fidelity })
    }

    pub fn task(&self) -> &SurrogateTask {
        &self.task
    }

    pub fn config(&self) -> &TreeSurrogateConfig {
        &self.config
    }

    /// R² against the black box for regression, accuracy for classification.
    pub fn fidelity(&self) -> f64 {
        self.fidelity
    }

    pub fn depth(&self) -> usize {
        self.root.depth()
    }

    pub fn n_leaves(&self) -> usize {
        self.root.n_leaves()
    }

    /// Routes each row to its leaf. Classification trees return the class index.
    pub fn predict(&self, data: &Dataset) -> Result<Array1<f64>> {
        if data.schema() != self.schema.as_ref() {
            return Err(ImlError::InvalidInput(
                "Data schema differs from the schema the tree was fit on.".to_string(),
            ));
        }
        Ok(data.values().axis_iter(Axis(0)).map(|row| self.root.route(row)).collect())
    }

    pub fn rules(&self) -> Vec<TreeRule> {
        let mut rules = Vec::with_capacity(self.n_leaves());
        self.collect_rules(&self.root, &mut Vec::new(), &mut rules);
        rules
    }

    pub fn records(&self) -> Vec<TreeRule> {
        self.rules()
    }

    fn collect_rules(&self, node: &TreeNode, path: &mut Vec<String>, rules: &mut Vec<TreeRule>) {
        match node {
            TreeNode::Leaf { value, n_samples } => {
                let label = match &self.task {
                    SurrogateTask::Regression => None,
                    SurrogateTask::Classification { classes } => classes.get(*value as usize).cloned(),
                };
                rules.push(TreeRule {
                    leaf: rules.len(),
                    conditions: path.clone(),
                    prediction: *value,
                    label,
                    n_samples: *n_samples,
                });
            }
            TreeNode::Split { feature_idx, rule, left, right } => {
                let (yes, no) = self.describe(*feature_idx, rule);
                path.push(yes);
                self.collect_rules(left, path, rules);
                path.pop();
                path.push(no);
                self.collect_rules(right, path, rules);
                path.pop();
            }
        }
    }

    fn describe(&self, feature_idx: usize, rule: &SplitRule) -> (String, String) {
        let name = &self.schema.feature(feature_idx).name;
        match *rule {
            SplitRule::Threshold(t) => (format!("{} <= {}", name, t), format!("{} > {}", name, t)),
            SplitRule::Level(code) => {
                let level = self.schema.decode(feature_idx, code as f64);
                (format!("{} == {}", name, level), format!("{} != {}", name, level))
            }
        }
    }
}

struct Builder<'a> {
    x: ArrayView2<'a, f64>,
    y: &'a [f64],
    schema: &'a Schema,
    config: &'a TreeSurrogateConfig,
    /// Zero for regression.
    n_classes: usize,
}

impl Builder<'_> {
    fn build(&self, indices: &[usize], depth: usize) -> TreeNode {
        let targets: Vec<f64> = indices.iter().map(|&i| self.y[i]).collect();
        let leaf = || TreeNode::Leaf { value: self.leaf_value(&targets), n_samples: indices.len() };

        if depth >= self.config.max_depth
            || indices.len() < 2 * self.config.min_samples_leaf
            || self.impurity(&targets) <= MIN_GAIN
        {
            return leaf();
        }

        let Some((feature_idx, rule)) = self.best_split(indices, &targets) else {
            return leaf();
        };
        let (left, right): (Vec<usize>, Vec<usize>) =
            indices.iter().partition(|&&i| rule.goes_left(self.x[[i, feature_idx]]));

        TreeNode::Split {
            feature_idx,
            rule,
            left: Box::new(self.build(&left, depth + 1)),
            right: Box::new(self.build(&right, depth + 1)),
        }
    }

    /// Best split over all features, first feature and first candidate on ties.
    fn best_split(&self, indices: &[usize], targets: &[f64]) -> Option<(usize, SplitRule)> {
        let parent = self.impurity(targets);
        let per_feature: Vec<Option<(f64, SplitRule)>> = (0..self.x.ncols())
            .into_par_iter()
            .map(|feature_idx| {
                let column: Vec<f64> = indices.iter().map(|&i| self.x[[i, feature_idx]]).collect();
                let mut best: Option<(f64, SplitRule)> = None;
                for rule in self.candidates(feature_idx, &column) {
                    let (left, right): (Vec<f64>, Vec<f64>) = {
                        let mut left = Vec::new();
                        let mut right = Vec::new();
                        for (&x, &y) in column.iter().zip(targets) {
                            if rule.goes_left(x) {
                                left.push(y);
                            } else {
                                right.push(y);
                            }
                        }
                        (left, right)
                    };
                    if left.len() < self.config.min_samples_leaf || right.len() < self.config.min_samples_leaf {
                        continue;
                    }
                    let n = targets.len() as f64;
                    let child = (left.len() as f64 * self.impurity(&left)
                        + right.len() as f64 * self.impurity(&right))
                        / n;
                    let gain = parent - child;
                    if gain > MIN_GAIN && best.map_or(true, |(g, _)| gain > g) {
                        best = Some((gain, rule));
                    }
                }
                best
            })
            .collect();

        let mut best: Option<(usize, f64, SplitRule)> = None;
        for (feature_idx, candidate) in per_feature.into_iter().enumerate() {
            if let Some((gain, rule)) = candidate {
                if best.map_or(true, |(_, g, _)| gain > g) {
                    best = Some((feature_idx, gain, rule));
                }
            }
        }
        best.map(|(feature_idx, _, rule)| (feature_idx, rule))
    }

    fn candidates(&self, feature_idx: usize, column: &[f64]) -> Vec<SplitRule> {
        let mut values = column.to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        if self.schema.feature(feature_idx).is_categorical() {
            values.into_iter().map(|code| SplitRule::Level(code as usize)).collect()
        } else {
            values.windows(2).map(|w| SplitRule::Threshold((w[0] + w[1]) / 2.0)).collect()
        }
    }

    fn impurity(&self, y: &[f64]) -> f64 {
        if y.is_empty() {
            return 0.0;
        }
        if self.n_classes == 0 {
            return stats::variance(y);
        }
        let n = y.len() as f64;
        let mut counts = vec![0usize; self.n_classes];
        for &class in y {
            counts[class as usize] += 1;
        }
        1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
    }

    fn leaf_value(&self, y: &[f64]) -> f64 {
        if self.n_classes == 0 {
            return stats::mean(y);
        }
        let mut counts = vec![0usize; self.n_classes];
        for &class in y {
            counts[class as usize] += 1;
        }
        arg_max(counts.into_iter().map(|c| c as f64)) as f64
    }
}

/// Index of the largest value, first on ties.
fn arg_max(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}
