//! Error type shared by the sampler and the cycle runner.

use thiserror::Error;

/// Everything that can go wrong while configuring or driving a sampler.
///
/// Configuration problems are reported when a sampler or runner is built, protocol
/// violations when the Metropolis-Hastings calls are made in the wrong order, and
/// non-finite values as soon as they reach the runner.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplerError {
    /// Invalid hyperparameters, epoch split, group layout or data source.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A loss or energy difference became NaN or infinite.
    #[error("non-finite {what} ({value}) at step {step}")]
    NonFinite {
        what: &'static str,
        value: f64,
        step: usize,
    },

    /// A Metropolis-Hastings operation was called out of order.
    #[error("`{operation}` is not allowed while the sampler is {state}")]
    Protocol {
        operation: &'static str,
        state: &'static str,
    },

    /// A proposal was rejected but `initial_step` did not save the state to restore.
    #[error("proposal rejected but no snapshot was saved by `initial_step`")]
    MissingSnapshot,

    /// The energy difference needs one temperature and one data size for all groups.
    #[error("parameter groups disagree on {0}; energy differences need a single value")]
    HeterogeneousGroups(&'static str),

    /// A gradient or value has a different shape than its parameter.
    #[error("shape mismatch for parameter `{name}`: expected {expected:?}, got {got:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

impl SamplerError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SamplerError::Config(msg.into())
    }
}
