//! Cyclical stochastic-gradient Langevin dynamics with per-parameter preconditioning,
//! online temperature diagnostics and an optional Metropolis-Hastings correction.

pub mod burn_potential;
pub mod data;
pub mod error;
pub mod estimator;
pub mod io;
pub mod metrics;
pub mod metropolis;
pub mod parameter;
pub mod runner;
pub mod samples;
pub mod schedule;
pub mod sgld;

pub use error::SamplerError;
