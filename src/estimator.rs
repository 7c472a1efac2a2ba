//! Online temperature diagnostics and the gradient statistics behind the preconditioner.
//!
//! At equilibrium the momentum `m` of a parameter with preconditioner `c` is distributed
//! as `N(0, T c)` and the position satisfies `E[x * dU/dx] = T`. Both quantities are
//! therefore estimators of the temperature `T`:
//!
//! - kinetic temperature: `mean(m^2 / c)`
//! - configurational temperature: `N * mean(x * g)`, with `g` the gradient of the
//!   data-averaged potential and `N` the number of data points.
//!
//! For a `d`-dimensional Gaussian target each of them is distributed as `T/d * chi^2(d)`.

use ndarray::{Array1, ArrayD, Zip};
use ndarray_stats::QuantileExt;

/// Instantaneous kinetic temperature of one parameter.
pub fn kinetic_temperature(momentum: &ArrayD<f64>, preconditioner: f64) -> f64 {
    if momentum.is_empty() {
        return 0.0;
    }
    momentum.iter().map(|m| m * m).sum::<f64>() / (preconditioner * momentum.len() as f64)
}

/// Kinetic energy `0.5 * sum(m^2 / c)` of one parameter.
pub fn kinetic_energy(momentum: &ArrayD<f64>, preconditioner: f64) -> f64 {
    0.5 * momentum.iter().map(|m| m * m).sum::<f64>() / preconditioner
}

/// Instantaneous configurational temperature of one parameter.
pub fn config_temperature(value: &ArrayD<f64>, grad: &ArrayD<f64>, num_data: f64) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    let dot = Zip::from(value)
        .and(grad)
        .fold(0.0, |acc, &x, &g| acc + x * g);
    num_data * dot / value.len() as f64
}

/// Exponential moving average `decay * current + (1 - decay) * observation`.
///
/// The first observation is taken as is so the estimate does not start biased
/// towards zero.
pub fn ema(current: f64, observation: f64, decay: f64, first: bool) -> f64 {
    if first {
        observation
    } else {
        decay * current + (1.0 - decay) * observation
    }
}

/// Running mean of `mean(g^2)` over repeated gradient evaluations (the RMSProp second
/// moment of one parameter).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GradSecondMoment {
    sum: f64,
    count: usize,
}

impl GradSecondMoment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, grad: &ArrayD<f64>) {
        let mean_sq = if grad.is_empty() {
            0.0
        } else {
            grad.iter().map(|g| g * g).sum::<f64>() / grad.len() as f64
        };
        self.sum += mean_sq;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Turns per-parameter second moments `s` into preconditioners `sqrt(s_min / s)`.
///
/// `s_min` is the smallest positive moment, so the parameter with the smallest gradients
/// gets preconditioner 1 and all others less. Parameters whose moment is zero (or not a
/// number) keep 1.
pub fn preconditioners_from_moments(moments: &Array1<f64>) -> Array1<f64> {
    let positive: Array1<f64> = moments.iter().copied().filter(|&s| s > 0.0).collect();
    let s_min = match positive.min() {
        Ok(&s) => s,
        Err(_) => return Array1::ones(moments.len()),
    };
    moments.mapv(|s| if s > 0.0 { (s_min / s).sqrt() } else { 1.0 })
}
