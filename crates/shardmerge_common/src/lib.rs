//! Shared building blocks for the shardmerge result-merge engine: the scalar
//! value model, error taxonomy, and merge configuration.

pub mod config;
pub mod datum;
pub mod error;
pub mod types;
