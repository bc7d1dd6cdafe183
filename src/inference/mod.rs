//! Numerical building blocks shared by the estimators and diagnostics

pub mod budget;
pub mod enumerate;
pub mod sampler;
pub mod truncation;
