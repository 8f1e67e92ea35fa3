//! Public half of the rtun reverse tunnel: owns the idle pool of data
//! connections that endpoints dial out, and bridges end users onto it.

pub mod public;
pub mod service;
