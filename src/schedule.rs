//! Phases of a sampling cycle and the cosine learning-rate schedule.
//!
//! A cycle is `epochs_per_cycle` epochs long and split into three consecutive phases:
//!
//! ```text
//! | descent (T = 0) | warmup (T, not recorded) | sampling (T, recorded every `skip`) |
//! ```
//!
//! The learning rate follows `lr * (1 + cos(pi * i / n)) / 2` within a cycle, where `i`
//! counts steps since the cycle began and `n` is the number of steps in a cycle.

use crate::error::SamplerError;
use std::f64::consts::PI;

/// Which part of a cycle an update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// Noise-free gradient descent towards a mode.
    Descent,
    /// Langevin dynamics at the configured temperature, samples discarded.
    Warmup,
    /// Langevin dynamics at the configured temperature, samples recorded.
    #[default]
    Sampling,
}

impl Phase {
    /// Temperature the dynamics run at for a group configured with `temperature`.
    pub fn temperature(self, temperature: f64) -> f64 {
        match self {
            Phase::Descent => 0.0,
            Phase::Warmup | Phase::Sampling => temperature,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Descent => "descent",
            Phase::Warmup => "warmup",
            Phase::Sampling => "sampling",
        }
    }
}

/// Per-call inputs threaded from the runner into the sampler.
///
/// The sampler never mutates its groups' learning rate or temperature; instead the
/// effective values are `group.lr * lr_factor` and `phase.temperature(group.temperature)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    pub lr_factor: f64,
    pub phase: Phase,
}

impl Default for StepContext {
    fn default() -> Self {
        Self {
            lr_factor: 1.0,
            phase: Phase::Sampling,
        }
    }
}

impl StepContext {
    pub fn new(lr_factor: f64, phase: Phase) -> Self {
        Self { lr_factor, phase }
    }
}

/// How the epochs of one cycle are divided between the three phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSplit {
    pub epochs_per_cycle: usize,
    pub descent_epochs: usize,
    pub warmup_epochs: usize,
    pub sample_epochs: usize,
    pub skip: usize,
}

impl EpochSplit {
    /// Validates the split. Descent gets whatever warmup and sampling leave over, which
    /// may be zero but never negative.
    pub fn new(
        epochs_per_cycle: usize,
        warmup_epochs: usize,
        sample_epochs: usize,
        skip: usize,
    ) -> Result<Self, SamplerError> {
        let descent_epochs = epochs_per_cycle
            .checked_sub(warmup_epochs + sample_epochs)
            .ok_or_else(|| {
                SamplerError::config(format!(
                    "epochs_per_cycle ({epochs_per_cycle}) must be at least \
                     warmup_epochs + sample_epochs ({})",
                    warmup_epochs + sample_epochs
                ))
            })?;
        if skip == 0 {
            return Err(SamplerError::config("skip must be at least 1"));
        }
        if sample_epochs == 0 {
            return Err(SamplerError::config(
                "sample_epochs must be at least 1, otherwise no samples are collected",
            ));
        }
        Ok(Self {
            epochs_per_cycle,
            descent_epochs,
            warmup_epochs,
            sample_epochs,
            skip,
        })
    }

    /// Number of recorded samples per cycle: sampling epochs whose offset is a multiple of `skip`.
    pub fn samples_per_cycle(&self) -> usize {
        self.sample_epochs.div_ceil(self.skip)
    }

    pub fn phase(&self, epoch: usize) -> Phase {
        if epoch < self.descent_epochs {
            Phase::Descent
        } else if epoch < self.descent_epochs + self.warmup_epochs {
            Phase::Warmup
        } else {
            Phase::Sampling
        }
    }

    /// Slot of the sample recorded at `epoch` within its cycle, if one is recorded.
    pub fn sample_slot(&self, epoch: usize) -> Option<usize> {
        let offset = epoch.checked_sub(self.descent_epochs + self.warmup_epochs)?;
        (offset < self.sample_epochs && offset % self.skip == 0).then_some(offset / self.skip)
    }
}

/// Cosine decay from 1 to 0 over one cycle, restarted every cycle.
///
/// With `sampling_decay == false` the factor stops decaying once the sampling phase begins
/// and keeps the value it had on entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CosineSchedule {
    steps_per_cycle: usize,
    sampling_decay: bool,
    step: usize,
    frozen: Option<f64>,
}

impl CosineSchedule {
    pub fn new(steps_per_cycle: usize, sampling_decay: bool) -> Self {
        Self {
            steps_per_cycle,
            sampling_decay,
            step: 0,
            frozen: None,
        }
    }

    /// The raw cosine factor for step `i` of a cycle.
    pub fn cosine(&self, i: usize) -> f64 {
        if self.steps_per_cycle == 0 {
            return 1.0;
        }
        (1.0 + (PI * i as f64 / self.steps_per_cycle as f64).cos()) / 2.0
    }

    /// Factor for the next step.
    pub fn factor(&self) -> f64 {
        self.frozen.unwrap_or_else(|| self.cosine(self.step))
    }

    /// Steps taken since the cycle began.
    pub fn step_in_cycle(&self) -> usize {
        self.step
    }

    /// Moves to the next step.
    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Restarts the cosine curve for a new cycle.
    pub fn reset(&mut self) {
        self.step = 0;
        self.frozen = None;
    }

    /// Informs the schedule of the phase of the epoch about to run.
    pub fn enter_phase(&mut self, phase: Phase) {
        match phase {
            Phase::Sampling if !self.sampling_decay => {
                if self.frozen.is_none() {
                    self.frozen = Some(self.cosine(self.step));
                }
            }
            _ => self.frozen = None,
        }
    }
}
