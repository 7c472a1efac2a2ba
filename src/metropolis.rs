//! Metropolis-Hastings correction of Langevin trajectories.
//!
//! A trajectory is driven as
//!
//! ```text
//! initial_step(save_state = true) -> step ... step -> final_step -> delta_energy -> maybe_reject
//! ```
//!
//! The energy difference combines the change of the total potential with the kinetic
//! energy change that the deterministic moves produced. The heat exchanged by the
//! friction and noise moves is subtracted, so for an exact integrator the difference is
//! zero and every proposal is accepted.

use crate::error::SamplerError;
use crate::sgld::{Hyperparams, Sampler, SamplerState};
use ndarray::ArrayD;
use rand::Rng;

/// Saved parameter values and momenta, restored on rejection.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    values: Vec<ArrayD<f64>>,
    momenta: Vec<ArrayD<f64>>,
}

impl Snapshot {
    /// Copies every value and momentum, creating missing sampler states.
    pub(crate) fn capture(sampler: &mut Sampler) -> Self {
        let mut values = Vec::new();
        let mut momenta = Vec::new();
        for (param, slot) in sampler.params_and_states_mut() {
            let state = slot.get_or_insert_with(|| SamplerState::new(param));
            values.push(param.value.clone());
            momenta.push(state.momentum_buffer.clone());
        }
        Self { values, momenta }
    }

    fn restore(&self, sampler: &mut Sampler) {
        let saved = self.values.iter().zip(&self.momenta);
        for ((param, slot), (value, momentum)) in sampler.params_and_states_mut().zip(saved) {
            param.value.assign(value);
            if let Some(state) = slot.as_mut() {
                state.momentum_buffer.assign(momentum);
            }
        }
    }
}

/// Where the sampler is in the trajectory protocol.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) enum Trajectory {
    #[default]
    Idle,
    Running {
        snapshot: Option<Snapshot>,
    },
    Finished {
        snapshot: Option<Snapshot>,
    },
}

impl Trajectory {
    pub(crate) fn name(&self) -> &'static str {
        self.state().name()
    }

    pub(crate) fn state(&self) -> TrajectoryState {
        match self {
            Trajectory::Idle => TrajectoryState::Idle,
            Trajectory::Running { .. } => TrajectoryState::Running,
            Trajectory::Finished { .. } => TrajectoryState::Finished,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, Trajectory::Idle)
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self, Trajectory::Running { .. })
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self, Trajectory::Finished { .. })
    }

    pub(crate) fn allows_step(&self) -> bool {
        !self.is_finished()
    }

    /// A new trajectory may start after a finished one; the old proposal is then kept.
    pub(crate) fn allows_initial_step(&self) -> bool {
        !self.is_running()
    }

    pub(crate) fn check(
        &self,
        operation: &'static str,
        allowed: fn(&Self) -> bool,
    ) -> Result<(), SamplerError> {
        if allowed(self) {
            Ok(())
        } else {
            Err(SamplerError::Protocol {
                operation,
                state: self.name(),
            })
        }
    }

    pub(crate) fn finish(&mut self) {
        if let Trajectory::Running { snapshot } = std::mem::take(self) {
            *self = Trajectory::Finished { snapshot };
        }
    }
}

/// Public view of the trajectory protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrajectoryState {
    /// No trajectory in progress.
    Idle,
    /// Between `initial_step` and `final_step`.
    Running,
    /// After `final_step`, waiting for `maybe_reject`.
    Finished,
}

impl TrajectoryState {
    pub fn name(self) -> &'static str {
        match self {
            TrajectoryState::Idle => "idle",
            TrajectoryState::Running => "in a trajectory",
            TrajectoryState::Finished => "waiting for an accept/reject decision",
        }
    }
}

impl Sampler {
    pub fn trajectory_state(&self) -> TrajectoryState {
        self.trajectory.state()
    }

    /// The single value of `field` shared by every group.
    fn uniform_hyper(
        &self,
        what: &'static str,
        field: fn(&Hyperparams) -> f64,
    ) -> Result<f64, SamplerError> {
        let mut values = self.groups().iter().map(|g| field(&g.hyper));
        let first = values.next().unwrap_or(1.0);
        if values.any(|v| v != first) {
            return Err(SamplerError::HeterogeneousGroups(what));
        }
        Ok(first)
    }

    /// Energy error of the finished trajectory.
    ///
    /// `prev_loss` and `new_loss` are the averaged potentials returned by `initial_step`
    /// and `final_step`. The result is
    /// `N * (new_loss - prev_loss) + sum(KE_final - KE_initial - heat + WD_final - WD_initial)`
    /// over all parameters, where `WD = N * 0.5 * weight_decay * |x|^2` is the energy of the
    /// weight-decay term the kicks include.
    pub fn delta_energy(&self, prev_loss: f64, new_loss: f64) -> Result<f64, SamplerError> {
        self.trajectory
            .check("delta_energy", Trajectory::is_finished)?;
        let num_data = self.uniform_hyper("num_data", |h| h.num_data)?;
        let kinetic: f64 = self
            .state_slots()
            .map(|s| {
                s.final_kinetic - s.initial_kinetic - s.heat + s.final_decay_energy
                    - s.initial_decay_energy
            })
            .sum();
        Ok(num_data * (new_loss - prev_loss) + kinetic)
    }

    /// Probability `min(1, exp(-delta / T))` of accepting a proposal with energy error `delta`.
    pub fn acceptance_probability(&self, delta: f64) -> Result<f64, SamplerError> {
        if delta.is_nan() {
            return Err(SamplerError::NonFinite {
                what: "energy difference",
                value: delta,
                step: self.num_evaluations(),
            });
        }
        let temperature = self.uniform_hyper("temperature", |h| h.temperature)?;
        if temperature > 0.0 {
            Ok((-delta / temperature).exp().min(1.0))
        } else if delta <= 0.0 {
            Ok(1.0)
        } else {
            Ok(0.0)
        }
    }

    /// Accepts or rejects the finished trajectory. Returns `true` if it was rejected, in
    /// which case values and momenta are restored to the snapshot taken by `initial_step`.
    ///
    /// If no acceptance probability can be computed for `delta` (NaN, or groups with
    /// different temperatures) the proposal is discarded: values and momenta are restored
    /// from the snapshot when there is one, the sampler returns to idle and the error is
    /// returned.
    pub fn maybe_reject(&mut self, delta: f64) -> Result<bool, SamplerError> {
        self.trajectory
            .check("maybe_reject", Trajectory::is_finished)?;
        let prob = match self.acceptance_probability(delta) {
            Ok(prob) => prob,
            Err(err) => {
                if let Some(snapshot) = self.take_snapshot() {
                    snapshot.restore(self);
                }
                self.trajectory = Trajectory::Idle;
                return Err(err);
            }
        };
        let rejected = if prob >= 1.0 {
            false
        } else if prob <= 0.0 {
            true
        } else {
            self.rng.gen::<f64>() > prob
        };

        if rejected {
            let snapshot = self.take_snapshot().ok_or(SamplerError::MissingSnapshot)?;
            snapshot.restore(self);
            log::trace!("proposal rejected (delta energy {delta:.4e})");
        }
        self.trajectory = Trajectory::Idle;
        Ok(rejected)
    }

    fn take_snapshot(&mut self) -> Option<Snapshot> {
        match &mut self.trajectory {
            Trajectory::Finished { snapshot } => snapshot.take(),
            _ => None,
        }
    }
}
