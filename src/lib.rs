// src/lib.rs

//! `iml_rs` explains black-box models through their predictions alone:
//! permutation feature importance, partial dependence and ICE curves,
//! local linear surrogates, Shapley values and global surrogate trees.
//!
//! Every engine borrows a [`Predictor`], which wraps a [`PredictModel`] together
//! with the reference data the explanations are computed against.
//!
//! ```no_run
//! use iml_rs::{Dataset, FeatureImp, FeatureImpConfig, Predictor, RegressionFn};
//! use rand::SeedableRng;
//!
//! # fn main() -> iml_rs::Result<()> {
//! let data = Dataset::builder()
//!     .numeric("a", vec![1.0, 2.0, 3.0, 4.0])
//!     .numeric("b", vec![0.5, 0.1, 0.9, 0.3])
//!     .build()?;
//! let model = RegressionFn::new(|d: &Dataset| Ok(d.column("a")?.mapv(|a| 2.0 * a)));
//! let y = data.column("a")?.mapv(|a| 2.0 * a);
//! let predictor = Predictor::new(model, data)?.with_target(y)?;
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! let importance = FeatureImp::new(&predictor, FeatureImpConfig::default())?.compute(&mut rng)?;
//! for record in importance.records() {
//!     println!("{}: {:.3}", record.feature, record.importance);
//! }
//! # Ok(())
//! # }
//! ```

pub mod algorithms;
pub mod core;
pub mod traits;
pub mod utils;

pub use crate::algorithms::{
    FeatureImp, FeatureImpConfig, LocalModel, LocalModelConfig, Partial, PartialConfig, Shapley,
    ShapleyConfig, TreeSurrogate, TreeSurrogateConfig,
};
pub use crate::core::{
    Dataset, DatasetBuilder, Feature, FeatureKind, ImlError, Instance, Predictor, Result, Schema, Value,
};
pub use crate::traits::{FnModel, PredictModel, RegressionFn};
