//! chimera-core: Shared types and utilities for the Chimera DSP engines
//!
//! Foundational types used across the Chimera crates: sample definitions,
//! normalized parameter values, and the error taxonomy.

mod error;
mod params;
mod sample;

pub use error::*;
pub use params::*;
pub use sample::*;
