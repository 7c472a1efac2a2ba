//! Preconditioned stochastic-gradient Langevin dynamics with momentum.
//!
//! Every tracked parameter `x` carries a momentum `m` and a scalar preconditioner `c`.
//! With `g` the gradient of the data-averaged potential, `N` the number of data points,
//! learning rate `lr` and temperature `T`, the sampler targets
//!
//! ```text
//! exp(-(N * U(x) + sum(m^2 / (2 c))) / T)
//! ```
//!
//! using three elementary moves (`h = sqrt(lr / N)`, `hn = sqrt(lr * N)`,
//! `a = exp(-momentum_decay)`):
//!
//! - B, kick:    `m <- m - hn * c * g`
//! - A, drift:   `x <- x + h * m`
//! - O, refresh: `m <- a * m + sqrt(T * (1 - a^2) * c) * xi`
//!
//! A full [`Sampler::step`] evaluates the potential once and applies `B B A/2 O A/2`.
//! Chained steps form a BAOAB Langevin integrator whose first half-kick belongs to the
//! previous step. [`Sampler::initial_step`] (`B A/2 O A/2`) and [`Sampler::final_step`] (`B`)
//! split a run of steps into a trajectory whose energy error is used by the
//! Metropolis-Hastings correction in [`crate::metropolis`]. A final step followed by an
//! initial step at the same point is the same update as one full step.
//!
//! Gradients are expected to be clipped already (see [`crate::parameter::GradClip`]).

use crate::error::SamplerError;
use crate::estimator::{self, GradSecondMoment};
use crate::metropolis::{Snapshot, Trajectory};
use crate::parameter::{ParamId, Parameter};
use crate::schedule::StepContext;
use ndarray::{Array1, ArrayD, Zip};
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::StandardNormal;
use std::collections::HashSet;

/// Scalar hyperparameters shared by all parameters of a [`ParamGroup`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparams {
    /// Base learning rate, multiplied by the runner's schedule factor.
    pub lr: f64,
    /// Friction rate `gamma`; the momentum kept per step is `exp(-gamma)`.
    pub momentum_decay: f64,
    /// Posterior temperature, 1 for the exact posterior.
    pub temperature: f64,
    /// Number of (effective) data points the averaged potential is scaled by.
    pub num_data: f64,
    /// Coefficient of an extra `0.5 * weight_decay * |x|^2` term in the averaged potential.
    pub weight_decay: f64,
}

impl Hyperparams {
    /// Hyperparameters without momentum, at temperature 1 and without weight decay.
    pub fn new(lr: f64, num_data: f64) -> Self {
        Self {
            lr,
            momentum_decay: f64::INFINITY,
            temperature: 1.0,
            num_data,
            weight_decay: 0.0,
        }
    }

    /// Sets the fraction of momentum kept per step, `momentum` in `[0, 1]`.
    pub fn set_momentum(mut self, momentum: f64) -> Self {
        self.momentum_decay = -momentum.ln();
        self
    }

    pub fn set_momentum_decay(mut self, momentum_decay: f64) -> Self {
        self.momentum_decay = momentum_decay;
        self
    }

    pub fn set_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn set_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Fraction of momentum kept per step, `exp(-momentum_decay)`.
    pub fn friction(&self) -> f64 {
        (-self.momentum_decay).exp()
    }

    fn validate(&self) -> Result<(), SamplerError> {
        if !(self.lr.is_finite() && self.lr >= 0.0) {
            return Err(SamplerError::config(format!(
                "lr must be finite and non-negative, got {}",
                self.lr
            )));
        }
        if !(self.momentum_decay >= 0.0) {
            return Err(SamplerError::config(format!(
                "momentum_decay must be non-negative, got {}",
                self.momentum_decay
            )));
        }
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            return Err(SamplerError::config(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.num_data.is_finite() && self.num_data > 0.0) {
            return Err(SamplerError::config(format!(
                "num_data must be positive, got {}",
                self.num_data
            )));
        }
        if !self.weight_decay.is_finite() {
            return Err(SamplerError::config("weight_decay must be finite"));
        }
        Ok(())
    }
}

/// A set of parameters sharing one set of hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: Vec<ParamId>,
    pub hyper: Hyperparams,
}

impl ParamGroup {
    pub fn new(params: Vec<ParamId>, hyper: Hyperparams) -> Self {
        Self { params, hyper }
    }
}

/// Per-parameter sampler state, created the first time the sampler touches the parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerState {
    pub momentum_buffer: ArrayD<f64>,
    pub preconditioner: f64,
    /// Running kinetic temperature estimate.
    pub est_temperature: f64,
    /// Running configurational temperature estimate.
    pub est_config_temp: f64,
    /// Number of steps that updated the estimates.
    pub step_count: usize,
    pub(crate) initial_kinetic: f64,
    pub(crate) final_kinetic: f64,
    pub(crate) heat: f64,
    /// Weight-decay energy `N * 0.5 * wd * |x|^2` at the start and end of a trajectory.
    pub(crate) initial_decay_energy: f64,
    pub(crate) final_decay_energy: f64,
}

impl SamplerState {
    pub(crate) fn new(param: &Parameter) -> Self {
        Self {
            momentum_buffer: ArrayD::zeros(param.value.raw_dim()),
            preconditioner: 1.0,
            est_temperature: 0.0,
            est_config_temp: 0.0,
            step_count: 0,
            initial_kinetic: 0.0,
            final_kinetic: 0.0,
            heat: 0.0,
            initial_decay_energy: 0.0,
            final_decay_energy: 0.0,
        }
    }

    /// Kinetic energy `0.5 * sum(m^2 / c)`.
    pub fn kinetic_energy(&self) -> f64 {
        estimator::kinetic_energy(&self.momentum_buffer, self.preconditioner)
    }
}

/// Step sizes and noise scale of one group for one call.
#[derive(Debug, Clone, Copy)]
struct Dynamics {
    h: f64,
    hn: f64,
    friction: f64,
    noise: f64,
    temperature: f64,
    num_data: f64,
    weight_decay: f64,
}

impl Dynamics {
    fn new(hyper: &Hyperparams, ctx: StepContext) -> Self {
        let lr = hyper.lr * ctx.lr_factor;
        let temperature = ctx.phase.temperature(hyper.temperature);
        let friction = hyper.friction();
        Self {
            h: (lr / hyper.num_data).sqrt(),
            hn: (lr * hyper.num_data).sqrt(),
            friction,
            noise: (temperature * (1.0 - friction * friction)).sqrt(),
            temperature,
            num_data: hyper.num_data,
            weight_decay: hyper.weight_decay,
        }
    }
}

fn kick(param: &Parameter, state: &mut SamplerState, dynamics: &Dynamics, scale: f64) {
    let k = scale * dynamics.hn * state.preconditioner;
    let wd = dynamics.weight_decay;
    Zip::from(&mut state.momentum_buffer)
        .and(&param.grad)
        .and(&param.value)
        .for_each(|m, &g, &x| *m -= k * (g + wd * x));
}

fn drift(param: &mut Parameter, state: &SamplerState, dynamics: &Dynamics, scale: f64) {
    let k = scale * dynamics.h;
    Zip::from(&mut param.value)
        .and(&state.momentum_buffer)
        .for_each(|x, &m| *x += k * m);
}

/// Energy of the weight-decay term, in the same units as `N * U`.
fn decay_energy(param: &Parameter, dynamics: &Dynamics) -> f64 {
    if dynamics.weight_decay == 0.0 {
        return 0.0;
    }
    let sq: f64 = param.value.iter().map(|x| x * x).sum();
    0.5 * dynamics.num_data * dynamics.weight_decay * sq
}

/// Friction and noise. Returns the kinetic energy change when `track_heat` is set.
fn refresh(
    state: &mut SamplerState,
    dynamics: &Dynamics,
    rng: &mut SmallRng,
    track_heat: bool,
) -> f64 {
    let before = if track_heat { state.kinetic_energy() } else { 0.0 };
    let a = dynamics.friction;
    if dynamics.temperature > 0.0 {
        let scale = dynamics.noise * state.preconditioner.sqrt();
        state.momentum_buffer.mapv_inplace(|m| {
            let xi: f64 = rng.sample(StandardNormal);
            a * m + scale * xi
        });
    } else {
        state.momentum_buffer.mapv_inplace(|m| a * m);
    }
    if track_heat {
        state.kinetic_energy() - before
    } else {
        0.0
    }
}

/// Folds the current kinetic and configurational temperature into the running estimates.
fn observe(param: &Parameter, state: &mut SamplerState, dynamics: &Dynamics, decay: f64) {
    let first = state.step_count == 0;
    let kinetic = estimator::kinetic_temperature(&state.momentum_buffer, state.preconditioner);
    let mut config = estimator::config_temperature(&param.value, &param.grad, dynamics.num_data);
    if dynamics.weight_decay != 0.0 && !param.is_empty() {
        let mean_sq = param.value.iter().map(|x| x * x).sum::<f64>() / param.len() as f64;
        config += dynamics.num_data * dynamics.weight_decay * mean_sq;
    }
    state.est_temperature = estimator::ema(state.est_temperature, kinetic, decay, first);
    state.est_config_temp = estimator::ema(state.est_config_temp, config, decay, first);
    state.step_count += 1;
}

/// Langevin sampler over a fixed set of named parameters.
///
/// The sampler owns the parameters and one [`SamplerState`] per parameter, both addressed
/// by [`ParamId`]. Potentials are passed as closures `FnMut(&mut [Parameter]) -> f64` that
/// read `value`, write `grad` and return the data-averaged potential.
///
/// # Examples
///
/// ```rust
/// use mini_sgld::parameter::Parameter;
/// use mini_sgld::sgld::{Hyperparams, Sampler};
///
/// // U(x) = 0.5 * |x|^2
/// let params = vec![Parameter::from_vec("x", vec![1.0, -1.0])];
/// let hyper = Hyperparams::new(0.01, 1.0).set_momentum(0.9);
/// let mut sampler = Sampler::single_group(params, hyper).unwrap().set_seed(42);
/// let loss = sampler
///     .step(|params| {
///         let p = &mut params[0];
///         p.grad.assign(&p.value);
///         0.5 * p.value.iter().map(|x| x * x).sum::<f64>()
///     })
///     .unwrap();
/// assert_eq!(loss, 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct Sampler {
    params: Vec<Parameter>,
    groups: Vec<ParamGroup>,
    states: Vec<Option<SamplerState>>,
    estimator_decay: f64,
    num_evaluations: usize,
    pub(crate) trajectory: Trajectory,
    pub(crate) rng: SmallRng,
    /// Seed of the random number generator.
    pub seed: u64,
}

impl Sampler {
    /// Builds a sampler over `params` split into `groups`.
    ///
    /// Every parameter must belong to exactly one group and parameter names must be
    /// unique.
    pub fn new(params: Vec<Parameter>, groups: Vec<ParamGroup>) -> Result<Self, SamplerError> {
        let mut names = HashSet::new();
        for p in &params {
            if !names.insert(p.name.as_str()) {
                return Err(SamplerError::config(format!(
                    "duplicate parameter name `{}`",
                    p.name
                )));
            }
        }
        let mut owner: Vec<Option<usize>> = vec![None; params.len()];
        for (gi, group) in groups.iter().enumerate() {
            group.hyper.validate()?;
            for id in &group.params {
                let slot = owner.get_mut(id.index()).ok_or_else(|| {
                    SamplerError::config(format!(
                        "group {gi} refers to parameter {} but only {} exist",
                        id.index(),
                        params.len()
                    ))
                })?;
                if let Some(other) = slot.replace(gi) {
                    return Err(SamplerError::config(format!(
                        "parameter `{}` is in groups {other} and {gi}",
                        params[id.index()].name
                    )));
                }
            }
        }
        if let Some(i) = owner.iter().position(Option::is_none) {
            return Err(SamplerError::config(format!(
                "parameter `{}` is not in any group",
                params[i].name
            )));
        }

        let seed = thread_rng().gen::<u64>();
        let states = vec![None; params.len()];
        Ok(Self {
            params,
            groups,
            states,
            estimator_decay: 0.0,
            num_evaluations: 0,
            trajectory: Trajectory::Idle,
            rng: SmallRng::seed_from_u64(seed),
            seed,
        })
    }

    /// Builds a sampler with all parameters in one group.
    pub fn single_group(params: Vec<Parameter>, hyper: Hyperparams) -> Result<Self, SamplerError> {
        let ids = (0..params.len()).map(ParamId).collect();
        Self::new(params, vec![ParamGroup::new(ids, hyper)])
    }

    /// Sets a new random seed.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Sets the decay of the exponential moving averages behind `est_temperature` and
    /// `est_config_temp`. 0 (the default) keeps only the latest value; `decay` must lie
    /// in `[0, 1]`.
    pub fn set_estimator_decay(mut self, decay: f64) -> Result<Self, SamplerError> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(SamplerError::config(format!(
                "estimator_decay must be in [0, 1], got {decay}"
            )));
        }
        self.estimator_decay = decay;
        Ok(self)
    }

    pub fn estimator_decay(&self) -> f64 {
        self.estimator_decay
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Mutable access to parameter values, e.g. to initialize them.
    pub fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    pub fn param(&self, id: ParamId) -> &Parameter {
        &self.params[id.index()]
    }

    /// Looks a parameter up by name.
    pub fn param_id(&self, name: &str) -> Option<ParamId> {
        self.params.iter().position(|p| p.name == name).map(ParamId)
    }

    pub fn into_params(self) -> Vec<Parameter> {
        self.params
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Replaces the hyperparameters of group `index`.
    pub fn set_group_hyper(&mut self, index: usize, hyper: Hyperparams) -> Result<(), SamplerError> {
        hyper.validate()?;
        let group = self
            .groups
            .get_mut(index)
            .ok_or_else(|| SamplerError::config(format!("no parameter group {index}")))?;
        group.hyper = hyper;
        Ok(())
    }

    /// State of a parameter, `None` until the sampler first touched it.
    pub fn state(&self, id: ParamId) -> Option<&SamplerState> {
        self.states[id.index()].as_ref()
    }

    /// Preconditioner of a parameter (1 before its state exists).
    pub fn preconditioner(&self, id: ParamId) -> f64 {
        self.state(id).map_or(1.0, |s| s.preconditioner)
    }

    /// Overrides the preconditioner of a parameter without touching its momentum.
    pub fn set_preconditioner(&mut self, id: ParamId, preconditioner: f64) -> Result<(), SamplerError> {
        if !(preconditioner.is_finite() && preconditioner > 0.0) {
            return Err(SamplerError::config(format!(
                "preconditioner must be positive, got {preconditioner}"
            )));
        }
        let param = &self.params[id.index()];
        self.states[id.index()]
            .get_or_insert_with(|| SamplerState::new(param))
            .preconditioner = preconditioner;
        Ok(())
    }

    /// Number of potential evaluations so far.
    pub fn num_evaluations(&self) -> usize {
        self.num_evaluations
    }

    pub(crate) fn state_slots(&self) -> impl Iterator<Item = &SamplerState> {
        self.states.iter().flatten()
    }

    pub(crate) fn params_and_states_mut(
        &mut self,
    ) -> impl Iterator<Item = (&mut Parameter, &mut Option<SamplerState>)> {
        self.params.iter_mut().zip(self.states.iter_mut())
    }

    /// Calls `update` for every parameter, group by group, creating missing states.
    fn for_each_param<G>(&mut self, ctx: StepContext, mut update: G)
    where
        G: FnMut(&mut Parameter, &mut SamplerState, &Dynamics, &mut SmallRng),
    {
        let Self {
            params,
            groups,
            states,
            rng,
            ..
        } = self;
        for group in groups.iter() {
            let dynamics = Dynamics::new(&group.hyper, ctx);
            for id in &group.params {
                let i = id.index();
                let state = states[i].get_or_insert_with(|| SamplerState::new(&params[i]));
                update(&mut params[i], state, &dynamics, rng);
            }
        }
    }

    fn evaluate<F>(&mut self, potential_fn: &mut F) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        let loss = potential_fn(&mut self.params);
        self.params
            .iter()
            .try_for_each(Parameter::check_grad_shape)?;
        self.num_evaluations += 1;
        Ok(loss)
    }

    /// One full Langevin step at the groups' own learning rate and temperature.
    ///
    /// Returns the potential at the parameters before the update.
    pub fn step<F>(&mut self, potential_fn: F) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        self.step_with(StepContext::default(), potential_fn)
    }

    /// One full Langevin step with the learning-rate factor and phase given by `ctx`.
    pub fn step_with<F>(&mut self, ctx: StepContext, mut potential_fn: F) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        self.trajectory.check("step", Trajectory::allows_step)?;
        let loss = self.evaluate(&mut potential_fn)?;
        let decay = self.estimator_decay;
        let track_heat = self.trajectory.is_running();
        self.for_each_param(ctx, |param, state, dynamics, rng| {
            observe(param, state, dynamics, decay);
            kick(param, state, dynamics, 1.0);
            drift(param, state, dynamics, 0.5);
            let heat = refresh(state, dynamics, rng, track_heat);
            state.heat += heat;
            drift(param, state, dynamics, 0.5);
        });
        Ok(loss)
    }

    /// Starts a trajectory: the second half of a full step.
    ///
    /// With `save_state`, parameter values and momenta are copied first so that
    /// [`Sampler::maybe_reject`] can restore them.
    pub fn initial_step<F>(&mut self, potential_fn: F, save_state: bool) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        self.initial_step_with(StepContext::default(), potential_fn, save_state)
    }

    pub fn initial_step_with<F>(
        &mut self,
        ctx: StepContext,
        mut potential_fn: F,
        save_state: bool,
    ) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        self.trajectory
            .check("initial_step", Trajectory::allows_initial_step)?;
        let loss = self.evaluate(&mut potential_fn)?;
        let snapshot = if save_state {
            Some(Snapshot::capture(self))
        } else {
            None
        };
        let decay = self.estimator_decay;
        self.for_each_param(ctx, |param, state, dynamics, rng| {
            observe(param, state, dynamics, decay);
            state.initial_kinetic = state.kinetic_energy();
            state.initial_decay_energy = decay_energy(param, dynamics);
            state.heat = 0.0;
            kick(param, state, dynamics, 0.5);
            drift(param, state, dynamics, 0.5);
            let heat = refresh(state, dynamics, rng, true);
            state.heat += heat;
            drift(param, state, dynamics, 0.5);
        });
        self.trajectory = Trajectory::Running { snapshot };
        Ok(loss)
    }

    /// Ends a trajectory with the half-kick at the new point.
    pub fn final_step<F>(&mut self, potential_fn: F) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        self.final_step_with(StepContext::default(), potential_fn)
    }

    pub fn final_step_with<F>(&mut self, ctx: StepContext, mut potential_fn: F) -> Result<f64, SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        self.trajectory.check("final_step", Trajectory::is_running)?;
        let loss = self.evaluate(&mut potential_fn)?;
        self.for_each_param(ctx, |param, state, dynamics, _| {
            kick(param, state, dynamics, 0.5);
            state.final_kinetic = state.kinetic_energy();
            state.final_decay_energy = decay_energy(param, dynamics);
        });
        self.trajectory.finish();
        Ok(loss)
    }

    /// Draws every momentum from its stationary law `N(0, T c)` at the group temperature.
    pub fn sample_momentum(&mut self) -> Result<(), SamplerError> {
        self.trajectory
            .check("sample_momentum", Trajectory::is_idle)?;
        self.for_each_param(StepContext::default(), |_, state, dynamics, rng| {
            let scale = (dynamics.temperature * state.preconditioner).sqrt();
            state.momentum_buffer.mapv_inplace(|_| {
                let xi: f64 = rng.sample(StandardNormal);
                scale * xi
            });
        });
        Ok(())
    }

    /// Re-estimates every preconditioner from `k` evaluations of `closure`.
    ///
    /// The mean squared gradient `s` of each parameter is averaged over the evaluations
    /// and the preconditioner becomes `sqrt(s_min / s)`. Momenta are rescaled so their
    /// kinetic energy is unchanged. The result depends only on the gradients, so repeating
    /// the call with the same gradients gives the same preconditioners.
    pub fn estimate_preconditioner<F>(&mut self, mut closure: F, k: usize) -> Result<(), SamplerError>
    where
        F: FnMut(&mut [Parameter]) -> f64,
    {
        if k == 0 {
            return Err(SamplerError::config(
                "estimate_preconditioner needs at least one gradient sample",
            ));
        }
        self.trajectory
            .check("estimate_preconditioner", Trajectory::is_idle)?;
        let mut moments = vec![GradSecondMoment::new(); self.params.len()];
        for _ in 0..k {
            self.evaluate(&mut closure)?;
            for (acc, p) in moments.iter_mut().zip(&self.params) {
                acc.observe(&p.grad);
            }
        }
        let moments: Array1<f64> = moments.iter().map(GradSecondMoment::mean).collect();
        let preconditioners = estimator::preconditioners_from_moments(&moments);
        for (i, (param, slot)) in self.params_and_states_mut().enumerate() {
            let state = slot.get_or_insert_with(|| SamplerState::new(param));
            let new = preconditioners[i];
            let ratio = (new / state.preconditioner).sqrt();
            state.momentum_buffer.mapv_inplace(|m| m * ratio);
            state.preconditioner = new;
            log::debug!("preconditioner of `{}` set to {new:.4e}", param.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Phase;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    /// Averaged potential `0.5 * sum((x - mean)^2) / var` over all parameters.
    fn gaussian(mean: f64, var: f64) -> impl FnMut(&mut [Parameter]) -> f64 {
        move |params: &mut [Parameter]| {
            let mut u = 0.0;
            for p in params.iter_mut() {
                Zip::from(&mut p.grad)
                    .and(&p.value)
                    .for_each(|g, &x| *g = (x - mean) / var);
                u += p.value.iter().map(|x| 0.5 * (x - mean).powi(2) / var).sum::<f64>();
            }
            u
        }
    }

    fn two_params() -> Vec<Parameter> {
        vec![
            Parameter::from_vec("a", vec![1.0, -2.0, 0.5]),
            Parameter::from_vec("b", vec![3.0, 0.25]),
        ]
    }

    #[test]
    fn test_group_membership_is_validated() {
        let hyper = Hyperparams::new(0.1, 1.0);
        let missing = Sampler::new(two_params(), vec![ParamGroup::new(vec![ParamId(0)], hyper)]);
        assert!(matches!(missing, Err(SamplerError::Config(_))));

        let twice = Sampler::new(
            two_params(),
            vec![
                ParamGroup::new(vec![ParamId(0), ParamId(1)], hyper),
                ParamGroup::new(vec![ParamId(1)], hyper),
            ],
        );
        assert!(matches!(twice, Err(SamplerError::Config(_))));

        let out_of_range = Sampler::new(
            two_params(),
            vec![ParamGroup::new(vec![ParamId(0), ParamId(1), ParamId(2)], hyper)],
        );
        assert!(matches!(out_of_range, Err(SamplerError::Config(_))));

        let dup = vec![Parameter::zeros("w", &[1]), Parameter::zeros("w", &[1])];
        assert!(matches!(
            Sampler::single_group(dup, hyper),
            Err(SamplerError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_hyperparams_rejected() {
        let bad = [
            Hyperparams::new(-1.0, 1.0),
            Hyperparams::new(0.1, 0.0),
            Hyperparams::new(0.1, 1.0).set_temperature(-1.0),
            Hyperparams::new(0.1, 1.0).set_momentum(-0.5),
        ];
        for hyper in bad {
            assert!(Sampler::single_group(two_params(), hyper).is_err(), "{hyper:?}");
        }
    }

    #[test]
    fn test_state_created_lazily() {
        let mut sampler =
            Sampler::single_group(two_params(), Hyperparams::new(0.01, 1.0)).unwrap().set_seed(1);
        assert!(sampler.state(ParamId(0)).is_none());
        sampler.step(gaussian(0.0, 1.0)).unwrap();
        let state = sampler.state(ParamId(0)).unwrap();
        assert_eq!(state.step_count, 1);
        assert_eq!(state.momentum_buffer.shape(), &[3]);
        assert_eq!(state.preconditioner, 1.0);
    }

    #[test]
    fn test_descent_step_matches_hand_computation() {
        // T = 0: no noise, m starts at 0, a = 0.5.
        let params = vec![Parameter::from_vec("x", vec![2.0])];
        let hyper = Hyperparams::new(0.04, 4.0).set_momentum(0.5);
        let mut sampler = Sampler::single_group(params, hyper).unwrap();
        let ctx = StepContext::new(1.0, Phase::Descent);
        let loss = sampler.step_with(ctx, gaussian(0.0, 1.0)).unwrap();
        assert_abs_diff_eq!(loss, 2.0);

        // h = sqrt(0.04 / 4) = 0.1, hn = sqrt(0.04 * 4) = 0.4
        // kick: m = -0.4 * 2 = -0.8; drift: x = 2 - 0.04 = 1.96
        // refresh: m = -0.4; drift: x = 1.96 - 0.02 = 1.94
        let state = sampler.state(ParamId(0)).unwrap();
        assert_abs_diff_eq!(state.momentum_buffer, arr1(&[-0.4]).into_dyn(), epsilon = 1e-12);
        assert_abs_diff_eq!(sampler.param(ParamId(0)).value, arr1(&[1.94]).into_dyn(), epsilon = 1e-12);
    }

    #[test]
    fn test_descent_decreases_convex_loss() {
        let hyper = Hyperparams::new(0.01, 1.0).set_momentum(0.5);
        let mut sampler = Sampler::single_group(two_params(), hyper).unwrap();
        let ctx = StepContext::new(1.0, Phase::Descent);
        let mut losses = Vec::new();
        for _ in 0..50 {
            losses.push(sampler.step_with(ctx, gaussian(0.0, 1.0)).unwrap());
        }
        assert!(losses[49] < 0.5 * losses[0], "{losses:?}");
    }

    #[test]
    fn test_lr_factor_zero_freezes_parameters() {
        let hyper = Hyperparams::new(0.1, 1.0).set_momentum(0.9);
        let mut sampler = Sampler::single_group(two_params(), hyper).unwrap().set_seed(3);
        let before = sampler.params().to_vec();
        sampler
            .step_with(StepContext::new(0.0, Phase::Sampling), gaussian(0.0, 1.0))
            .unwrap();
        for (b, a) in before.iter().zip(sampler.params()) {
            assert_eq!(b.value, a.value);
        }
    }

    #[test]
    fn test_weight_decay_adds_to_gradient() {
        let hyper = Hyperparams::new(0.04, 4.0)
            .set_momentum(0.5)
            .set_weight_decay(1.0);
        let params = vec![Parameter::from_vec("x", vec![2.0])];
        let mut sampler = Sampler::single_group(params, hyper).unwrap();
        // Zero potential: only the weight decay pulls.
        sampler
            .step_with(StepContext::new(1.0, Phase::Descent), |params: &mut [Parameter]| {
                params[0].zero_grad();
                0.0
            })
            .unwrap();
        let state = sampler.state(ParamId(0)).unwrap();
        assert_abs_diff_eq!(state.momentum_buffer, arr1(&[-0.4]).into_dyn(), epsilon = 1e-12);
    }

    #[test]
    fn test_gradient_shape_mismatch_is_error() {
        let mut sampler =
            Sampler::single_group(two_params(), Hyperparams::new(0.01, 1.0)).unwrap();
        let res = sampler.step(|params: &mut [Parameter]| {
            params[0].grad = ArrayD::zeros(ndarray::IxDyn(&[7]));
            0.0
        });
        assert!(matches!(res, Err(SamplerError::Shape { .. })));
    }

    #[test]
    fn test_sample_momentum_scale() {
        let params = vec![Parameter::zeros("w", &[20_000])];
        let hyper = Hyperparams::new(0.01, 1.0).set_temperature(2.0);
        let mut sampler = Sampler::single_group(params, hyper).unwrap().set_seed(11);
        sampler.set_preconditioner(ParamId(0), 0.5).unwrap();
        sampler.sample_momentum().unwrap();
        let m = &sampler.state(ParamId(0)).unwrap().momentum_buffer;
        let var = m.iter().map(|v| v * v).sum::<f64>() / m.len() as f64;
        assert_abs_diff_eq!(var, 1.0, epsilon = 0.05);
    }

    #[test]
    fn test_estimate_preconditioner_is_idempotent() {
        // Gradients that do not depend on the state: x * scale per parameter.
        let fixed = |params: &mut [Parameter]| {
            params[0].grad.fill(2.0);
            params[1].grad.fill(0.5);
            0.0
        };
        let hyper = Hyperparams::new(0.01, 1.0).set_momentum(0.9);
        let mut sampler = Sampler::single_group(two_params(), hyper).unwrap().set_seed(5);
        sampler.sample_momentum().unwrap();
        sampler.estimate_preconditioner(fixed, 1).unwrap();
        let first = (sampler.preconditioner(ParamId(0)), sampler.preconditioner(ParamId(1)));
        let kinetic: Vec<f64> = sampler.state_slots().map(SamplerState::kinetic_energy).collect();
        sampler.estimate_preconditioner(fixed, 1).unwrap();
        let second = (sampler.preconditioner(ParamId(0)), sampler.preconditioner(ParamId(1)));
        assert_eq!(first, second);
        assert_abs_diff_eq!(first.0, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(first.1, 1.0, epsilon = 1e-12);
        let kinetic_after: Vec<f64> = sampler.state_slots().map(SamplerState::kinetic_energy).collect();
        for (a, b) in kinetic.iter().zip(&kinetic_after) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_estimate_preconditioner_needs_samples() {
        let mut sampler =
            Sampler::single_group(two_params(), Hyperparams::new(0.01, 1.0)).unwrap();
        assert!(matches!(
            sampler.estimate_preconditioner(gaussian(0.0, 1.0), 0),
            Err(SamplerError::Config(_))
        ));
    }

    #[test]
    fn test_estimator_decay_smooths_estimates() {
        let params = vec![Parameter::from_vec("x", vec![1.0])];
        let hyper = Hyperparams::new(0.0, 1.0);
        let mut sampler = Sampler::single_group(params, hyper)
            .unwrap()
            .set_estimator_decay(0.5)
            .unwrap();
        // lr = 0 keeps x = 1, gradient 1 => instantaneous config temperature 1, then 3.
        sampler.step(gaussian(0.0, 1.0)).unwrap();
        assert_abs_diff_eq!(sampler.state(ParamId(0)).unwrap().est_config_temp, 1.0);
        sampler.step(gaussian(0.0, 1.0 / 3.0)).unwrap();
        assert_abs_diff_eq!(sampler.state(ParamId(0)).unwrap().est_config_temp, 2.0);
    }

    #[test]
    fn test_estimator_decay_out_of_range_is_rejected() {
        for decay in [-0.1, 1.5, f64::NAN] {
            let sampler =
                Sampler::single_group(two_params(), Hyperparams::new(0.01, 1.0)).unwrap();
            assert!(matches!(
                sampler.set_estimator_decay(decay),
                Err(SamplerError::Config(_))
            ));
        }
        let sampler = Sampler::single_group(two_params(), Hyperparams::new(0.01, 1.0))
            .unwrap()
            .set_estimator_decay(1.0)
            .unwrap();
        assert_eq!(sampler.estimator_decay(), 1.0);
    }
}
