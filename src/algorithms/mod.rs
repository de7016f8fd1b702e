// src/algorithms/mod.rs

pub mod feature_imp;
pub mod local_model;
pub mod partial;
pub mod shapley;
pub mod tree_surrogate;

pub use feature_imp::{Compare, FeatureImp, FeatureImpConfig, FeatureImportance, ImportanceResult, Loss};
pub use local_model::{LocalModel, LocalModelConfig, LocalSurrogateResult, SurrogateTerm};
pub use partial::{Curve, GridType, Partial, PartialConfig, PartialMethod, PartialRecord, PartialResult};
pub use shapley::{Estimation, Shapley, ShapleyConfig, ShapleyMethod, ShapleyRecord, ShapleyResult};
pub use tree_surrogate::{SurrogateTask, TreeRule, TreeSurrogate, TreeSurrogateConfig};
