//! Core trait abstractions for the pipeline.
//!
//! These traits define the seams applications fill in: LLM providers,
//! stage collaborators, and the clock.

pub mod clock;
pub mod provider;
pub mod stages;
