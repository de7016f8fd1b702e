// src/core/data.rs
use crate::core::{ImlError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Declared type of a feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeatureKind {
    Numeric,
    /// Cells hold the index of the level in `levels`.
    Categorical { levels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub kind: FeatureKind,
}

impl Feature {
    pub fn numeric(name: impl Into<String>) -> Self {
        Feature { name: name.into(), kind: FeatureKind::Numeric }
    }

    pub fn categorical<S: Into<String>>(name: impl Into<String>, levels: impl IntoIterator<Item = S>) -> Self {
        Feature {
            name: name.into(),
            kind: FeatureKind::Categorical { levels: levels.into_iter().map(Into::into).collect() },
        }
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, FeatureKind::Categorical { .. })
    }

    pub fn levels(&self) -> Option<&[String]> {
        match &self.kind {
            FeatureKind::Categorical { levels } => Some(levels),
            FeatureKind::Numeric => None,
        }
    }
}

/// The fixed column layout shared by a reference dataset and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    features: Vec<Feature>,
}

impl Schema {
    pub fn new(features: Vec<Feature>) -> Result<Self> {
        if features.is_empty() {
            return Err(ImlError::InvalidInput("Schema needs at least one feature.".to_string()));
        }
        let mut seen: HashSet<String> = HashSet::new();
        for feature in &features {
            if !seen.insert(feature.name.clone()) {
                return Err(ImlError::InvalidInput(format!(
                    "Duplicate feature name '{}'.",
                    feature.name
                )));
            }
            if let Some(levels) = feature.levels() {
                if levels.is_empty() {
                    return Err(ImlError::InvalidInput(format!(
                        "Categorical feature '{}' has no levels.",
                        feature.name
                    )));
                }
            }
        }
        Ok(Schema { features })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn feature(&self, idx: usize) -> &Feature {
        &self.features[idx]
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.features
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| ImlError::UnknownFeature(name.to_string()))
    }

    /// Decodes a raw cell into its display value.
    pub fn decode(&self, idx: usize, raw: f64) -> Value {
        match &self.features[idx].kind {
            FeatureKind::Numeric => Value::Numeric(raw),
            FeatureKind::Categorical { levels } => Value::Categorical(levels[raw as usize].clone()),
        }
    }

    /// Encodes a value into the raw cell representation of column `idx`.
    pub fn encode(&self, idx: usize, value: &Value) -> Result<f64> {
        let feature = &self.features[idx];
        match (&feature.kind, value) {
            (FeatureKind::Numeric, Value::Numeric(v)) => Ok(*v),
            (FeatureKind::Categorical { levels }, Value::Categorical(label)) => levels
                .iter()
                .position(|l| l == label)
                .map(|code| code as f64)
                .ok_or_else(|| {
                    ImlError::InvalidInput(format!(
                        "'{}' is not a level of feature '{}'.",
                        label, feature.name
                    ))
                }),
            _ => Err(ImlError::InvalidInput(format!(
                "Value {} does not match the type of feature '{}'.",
                value, feature.name
            ))),
        }
    }
}

/// A single cell as the caller sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Numeric(f64),
    Categorical(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Numeric(v) => write!(f, "{}", v),
            Value::Categorical(label) => write!(f, "{}", label),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Numeric(v)
    }
}

impl From<&str> for Value {
    fn from(label: &str) -> Self {
        Value::Categorical(label.to_string())
    }
}

/// A table of rows with a fixed schema.
/// Categorical cells are stored as level indices so the whole table is one `f64` matrix.
#[derive(Debug, Clone)]
pub struct Dataset {
    schema: Arc<Schema>,
    values: Array2<f64>,
}

impl Dataset {
    pub fn new(schema: Schema, values: Array2<f64>) -> Result<Self> {
        Self::with_schema(Arc::new(schema), values)
    }

    pub fn builder() -> DatasetBuilder {
        DatasetBuilder::default()
    }

    pub(crate) fn with_schema(schema: Arc<Schema>, values: Array2<f64>) -> Result<Self> {
        if values.ncols() != schema.len() {
            return Err(ImlError::InvalidInput(format!(
                "Data has {} columns, but the schema declares {}.",
                values.ncols(),
                schema.len()
            )));
        }
        for (idx, column) in values.axis_iter(Axis(1)).enumerate() {
            let feature = schema.feature(idx);
            for &cell in column.iter() {
                if !cell.is_finite() {
                    return Err(ImlError::InvalidInput(format!(
                        "Feature '{}' contains a non-finite value.",
                        feature.name
                    )));
                }
                if let Some(levels) = feature.levels() {
                    if cell.fract() != 0.0 || cell < 0.0 || cell as usize >= levels.len() {
                        return Err(ImlError::InvalidInput(format!(
                            "Feature '{}' holds level code {} outside 0..{}.",
                            feature.name,
                            cell,
                            levels.len()
                        )));
                    }
                }
            }
        }
        Ok(Dataset { schema, values })
    }

    /// Same schema, new cells. Callers guarantee the cells are valid codes.
    pub(crate) fn derive(&self, values: Array2<f64>) -> Dataset {
        debug_assert_eq!(values.ncols(), self.schema.len());
        Dataset { schema: Arc::clone(&self.schema), values }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn shared_schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        let idx = self.schema.index_of(name)?;
        Ok(self.values.column(idx))
    }

    pub fn value(&self, row: usize, col: usize) -> Value {
        self.schema.decode(col, self.values[[row, col]])
    }

    /// Level label of a categorical cell, `None` for numeric columns.
    pub fn level(&self, row: usize, col: usize) -> Option<&str> {
        self.schema
            .feature(col)
            .levels()
            .map(|levels| levels[self.values[[row, col]] as usize].as_str())
    }

    pub fn instance(&self, row: usize) -> Result<Instance> {
        if row >= self.nrows() {
            return Err(ImlError::InvalidInput(format!(
                "Row {} out of bounds for a dataset with {} rows.",
                row,
                self.nrows()
            )));
        }
        Ok(Instance { schema: Arc::clone(&self.schema), values: self.values.row(row).to_owned() })
    }

    pub fn select_rows(&self, rows: &[usize]) -> Dataset {
        self.derive(self.values.select(Axis(0), rows))
    }
}

/// One row, used as the point being explained.
#[derive(Debug, Clone)]
pub struct Instance {
    schema: Arc<Schema>,
    values: Array1<f64>,
}

impl Instance {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn value(&self, col: usize) -> Value {
        self.schema.decode(col, self.values[col])
    }

    /// `name=value`, the label used in explanation tables.
    pub fn describe(&self, col: usize) -> String {
        format!("{}={}", self.schema.feature(col).name, self.value(col))
    }

    pub fn to_dataset(&self) -> Dataset {
        Dataset {
            schema: Arc::clone(&self.schema),
            values: self.values.clone().insert_axis(Axis(0)),
        }
    }

    pub(crate) fn ensure_schema(&self, schema: &Schema) -> Result<()> {
        if *self.schema != *schema {
            return Err(ImlError::InvalidInput(
                "Instance schema differs from the reference data schema.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Column-wise builder for [`Dataset`].
#[derive(Debug, Default)]
pub struct DatasetBuilder {
    features: Vec<Feature>,
    columns: Vec<Vec<f64>>,
    error: Option<ImlError>,
}

impl DatasetBuilder {
    pub fn numeric(mut self, name: &str, values: Vec<f64>) -> Self {
        self.features.push(Feature::numeric(name));
        self.columns.push(values);
        self
    }

    pub fn categorical(mut self, name: &str, levels: &[&str], labels: &[&str]) -> Self {
        let mut codes = Vec::with_capacity(labels.len());
        for label in labels {
            match levels.iter().position(|l| l == label) {
                Some(code) => codes.push(code as f64),
                None => {
                    self.error.get_or_insert_with(|| {
                        ImlError::InvalidInput(format!("'{}' is not a level of feature '{}'.", label, name))
                    });
                }
            }
        }
        self.features.push(Feature::categorical(name, levels.iter().copied()));
        self.columns.push(codes);
        self
    }

    pub fn build(self) -> Result<Dataset> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let n_rows = self.columns.first().map_or(0, Vec::len);
        if let Some((feature, column)) = self
            .features
            .iter()
            .zip(&self.columns)
            .find(|(_, column)| column.len() != n_rows)
        {
            return Err(ImlError::InvalidInput(format!(
                "Column '{}' has {} values, expected {}.",
                feature.name,
                column.len(),
                n_rows
            )));
        }
        if n_rows == 0 {
            return Err(ImlError::InvalidInput("Dataset cannot be empty.".to_string()));
        }
        let columns = self.columns;
        let values = Array2::from_shape_fn((n_rows, columns.len()), |(i, j)| columns[j][i]);
        Dataset::new(Schema::new(self.features)?, values)
    }
}
