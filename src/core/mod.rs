pub mod data;
pub mod errors;
pub mod predictor;

pub use data::*; // Re-export common data types
pub use errors::*;
pub use predictor::Predictor;
