// src/utils/mod.rs
//! Small numeric helpers shared by the explainers.

pub mod linalg;
pub mod stats;
