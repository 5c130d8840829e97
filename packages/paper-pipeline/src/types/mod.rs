//! Data types shared across the pipeline.

pub mod config;
pub mod document;
pub mod extraction;
pub mod outcome;
pub mod registry;
pub mod requirement;
