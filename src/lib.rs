//! Budget-matched estimation of sequence-model queries
//!
//! Estimates the probability that an autoregressive model produces one of a
//! set of excluded tokens within a fixed horizon, with importance sampling,
//! beam search, or both, and compares them at matched compute.

pub mod config;
pub mod error;
pub mod estimate;
pub mod harness;
pub mod inference;
pub mod model;
