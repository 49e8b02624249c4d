//! Surfaces built on top of the pipeline.

pub mod container;
