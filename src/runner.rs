//! Cyclical SG-MCMC: descent, warmup and sampling epochs under a cosine learning rate.
//!
//! [`SGLDRunner`] owns a [`Sampler`], a [`GradientProvider`] and a [`DataSource`]. Each
//! cycle runs `epochs_per_cycle` epochs, each epoch one sampler step per batch. Epochs
//! are split into descent (temperature 0), warmup and sampling phases (see
//! [`EpochSplit`]); parameter snapshots are recorded every `skip`-th sampling epoch.
//!
//! With `metropolis_hastings` enabled, every warmup and sampling epoch is one trajectory
//! that is accepted or rejected as a whole.

use crate::data::DataSource;
use crate::error::SamplerError;
use crate::metrics::{MetricLog, MetricsSink};
use crate::parameter::{GradClip, ParamId, Parameter};
use crate::samples::SampleBuffer;
use crate::schedule::{CosineSchedule, EpochSplit, Phase, StepContext};
use crate::sgld::Sampler;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array1;
use ndarray_stats::QuantileExt;

/// Computes the data-averaged potential of a batch and writes its gradient into `params`.
pub trait GradientProvider<Batch> {
    /// Reads `params[i].value`, overwrites `params[i].grad` and returns the potential.
    fn potential(
        &mut self,
        params: &mut [Parameter],
        batch: &Batch,
        temperature: f64,
        data_mult: f64,
    ) -> f64;
}

impl<Batch, F> GradientProvider<Batch> for F
where
    F: FnMut(&mut [Parameter], &Batch, f64, f64) -> f64,
{
    fn potential(
        &mut self,
        params: &mut [Parameter],
        batch: &Batch,
        temperature: f64,
        data_mult: f64,
    ) -> f64 {
        self(params, batch, temperature, data_mult)
    }
}

/// Settings of a [`SGLDRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub epochs_per_cycle: usize,
    pub warmup_epochs: usize,
    pub sample_epochs: usize,
    /// Record a sample every `skip` sampling epochs.
    pub skip: usize,
    pub cycles: usize,
    /// Posterior temperature, applied to every parameter group.
    pub temperature: f64,
    /// Effective replication of each data point; `num_data = len * data_mult`.
    pub data_mult: f64,
    /// Keep decaying the learning rate during sampling.
    pub sampling_decay: bool,
    pub grad_clip: GradClip,
    /// Re-estimate the preconditioner after every epoch divisible by this.
    pub precond_update: Option<usize>,
    /// Number of batches the preconditioner estimate averages over.
    pub precond_samples: usize,
    pub metropolis_hastings: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            epochs_per_cycle: 1,
            warmup_epochs: 0,
            sample_epochs: 1,
            skip: 1,
            cycles: 1,
            temperature: 1.0,
            data_mult: 1.0,
            sampling_decay: true,
            grad_clip: GradClip::default(),
            precond_update: None,
            precond_samples: 1,
            metropolis_hastings: false,
        }
    }
}

impl RunnerConfig {
    pub fn new(epochs_per_cycle: usize, warmup_epochs: usize, sample_epochs: usize) -> Self {
        Self {
            epochs_per_cycle,
            warmup_epochs,
            sample_epochs,
            ..Self::default()
        }
    }

    pub fn set_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn set_cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn set_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn set_data_mult(mut self, data_mult: f64) -> Self {
        self.data_mult = data_mult;
        self
    }

    pub fn set_sampling_decay(mut self, sampling_decay: bool) -> Self {
        self.sampling_decay = sampling_decay;
        self
    }

    pub fn set_grad_clip(mut self, grad_clip: GradClip) -> Self {
        self.grad_clip = grad_clip;
        self
    }

    pub fn set_precond_update(mut self, precond_update: Option<usize>) -> Self {
        self.precond_update = precond_update;
        self
    }

    pub fn set_precond_samples(mut self, precond_samples: usize) -> Self {
        self.precond_samples = precond_samples;
        self
    }

    pub fn set_metropolis_hastings(mut self, metropolis_hastings: bool) -> Self {
        self.metropolis_hastings = metropolis_hastings;
        self
    }

    fn validate(&self) -> Result<EpochSplit, SamplerError> {
        let split = EpochSplit::new(
            self.epochs_per_cycle,
            self.warmup_epochs,
            self.sample_epochs,
            self.skip,
        )?;
        if self.cycles == 0 {
            return Err(SamplerError::config("cycles must be at least 1"));
        }
        if self.precond_update == Some(0) {
            return Err(SamplerError::config("precond_update must be at least 1"));
        }
        if self.precond_samples == 0 {
            return Err(SamplerError::config("precond_samples must be at least 1"));
        }
        if !(self.data_mult.is_finite() && self.data_mult > 0.0) {
            return Err(SamplerError::config(format!(
                "data_mult must be positive, got {}",
                self.data_mult
            )));
        }
        if let Some(bound) = self.grad_clip.bound() {
            if !(bound > 0.0) {
                return Err(SamplerError::config(format!(
                    "gradient clipping bound must be positive, got {bound}"
                )));
            }
        }
        Ok(split)
    }
}

/// Everything updated after a step, kept apart from the data so both can be borrowed.
struct Bookkeeping {
    metrics: MetricLog,
    sink: Option<Box<dyn MetricsSink>>,
    schedule: CosineSchedule,
    base_lr: f64,
    global_step: usize,
    prev_loss: Option<f64>,
}

impl Bookkeeping {
    fn scalar(&mut self, name: &str, value: f64, step: usize) {
        self.metrics.push(name, value);
        if let Some(sink) = self.sink.as_mut() {
            sink.add_scalar(name, value, step);
        }
    }

    fn current_lr(&self) -> f64 {
        self.base_lr * self.schedule.factor()
    }

    fn after_step(&mut self, sampler: &Sampler, loss: f64) -> Result<(), SamplerError> {
        let step = self.global_step;
        if !loss.is_finite() {
            return Err(SamplerError::NonFinite {
                what: "loss",
                value: loss,
                step,
            });
        }
        self.schedule.advance();
        self.global_step += 1;

        for (i, p) in sampler.params().iter().enumerate() {
            if let Some(state) = sampler.state(ParamId(i)) {
                self.scalar(&format!("preconditioner/{}", p.name), state.preconditioner, step);
                self.scalar(&format!("est_temperature/{}", p.name), state.est_temperature, step);
                self.scalar(&format!("est_config_temp/{}", p.name), state.est_config_temp, step);
            }
        }
        let lr = self.current_lr();
        self.scalar("lr", lr, step);
        self.scalar("loss", loss, step);
        if let Some(prev) = self.prev_loss {
            self.scalar("log_prob_accept", prev - loss, step.saturating_sub(1));
        }
        self.prev_loss = Some(loss);
        Ok(())
    }
}

/// Wraps a provider into the closure the sampler evaluates.
fn potential_fn<'a, B, P>(
    provider: &'a mut P,
    batch: &'a B,
    temperature: f64,
    data_mult: f64,
    clip: GradClip,
) -> impl FnMut(&mut [Parameter]) -> f64 + 'a
where
    P: GradientProvider<B>,
{
    move |params: &mut [Parameter]| {
        let loss = provider.potential(params, batch, temperature, data_mult);
        clip.apply(params);
        loss
    }
}

/// Runs cyclical SGLD over a data source and collects posterior samples.
///
/// # Examples
///
/// ```rust
/// use mini_sgld::data::MiniBatches;
/// use mini_sgld::parameter::Parameter;
/// use mini_sgld::runner::{RunnerConfig, SGLDRunner};
/// use mini_sgld::sgld::{Hyperparams, Sampler};
///
/// // Gaussian likelihood with unknown mean.
/// let data = MiniBatches::from_items(&[0.9, 1.1, 1.0, 0.8, 1.2, 1.0], 2);
/// let sampler = Sampler::single_group(
///     vec![Parameter::from_vec("mu", vec![0.0])],
///     Hyperparams::new(0.01, 1.0).set_momentum(0.9),
/// )
/// .unwrap()
/// .set_seed(42);
/// let potential = |params: &mut [Parameter], batch: &Vec<f64>, _t: f64, _m: f64| {
///     let mu = params[0].value[[0]];
///     let n = batch.len() as f64;
///     params[0].grad[[0]] = batch.iter().map(|y| mu - y).sum::<f64>() / n;
///     batch.iter().map(|y| 0.5 * (y - mu).powi(2)).sum::<f64>() / n
/// };
/// let config = RunnerConfig::new(6, 2, 3);
/// let mut runner = SGLDRunner::new(config, sampler, potential, data, None).unwrap();
/// runner.run().unwrap();
/// assert_eq!(runner.get_samples().num_filled(), 3);
/// ```
pub struct SGLDRunner<D, P>
where
    D: DataSource,
    P: GradientProvider<D::Batch>,
{
    config: RunnerConfig,
    split: EpochSplit,
    sampler: Sampler,
    provider: P,
    data: D,
    samples: SampleBuffer,
    book: Bookkeeping,
}

impl<D, P> SGLDRunner<D, P>
where
    D: DataSource,
    P: GradientProvider<D::Batch>,
{
    /// Validates the configuration against the sampler and data.
    ///
    /// Every parameter group is set to the configured temperature and to
    /// `num_data = data.len() * data_mult`.
    pub fn new(
        config: RunnerConfig,
        mut sampler: Sampler,
        provider: P,
        data: D,
        sink: Option<Box<dyn MetricsSink>>,
    ) -> Result<Self, SamplerError> {
        let split = config.validate()?;
        if data.is_empty() || data.num_batches() == 0 {
            return Err(SamplerError::config("the data source has no data"));
        }
        if config.metropolis_hastings && data.num_batches() < 2 {
            return Err(SamplerError::config(
                "Metropolis-Hastings needs at least two batches per epoch",
            ));
        }
        if sampler.param_id("lr").is_some() {
            return Err(SamplerError::config(
                "a parameter may not be named `lr`, the name is used for learning rates",
            ));
        }

        let num_data = data.len() as f64 * config.data_mult;
        for i in 0..sampler.groups().len() {
            let mut hyper = sampler.groups()[i].hyper;
            hyper.num_data = num_data;
            hyper.temperature = config.temperature;
            sampler.set_group_hyper(i, hyper)?;
        }
        if let Some(k) = config.precond_update {
            let decay = 1.0 - 1.0 / (k * data.num_batches()) as f64;
            sampler = sampler.set_estimator_decay(decay)?;
        }

        let base_lr = sampler.groups().first().map_or(0.0, |g| g.hyper.lr);
        let samples = SampleBuffer::new(sampler.params(), split.samples_per_cycle(), config.cycles);
        let schedule = CosineSchedule::new(
            config.epochs_per_cycle * data.num_batches(),
            config.sampling_decay,
        );
        Ok(Self {
            config,
            split,
            sampler,
            provider,
            data,
            samples,
            book: Bookkeeping {
                metrics: MetricLog::new(),
                sink,
                schedule,
                base_lr,
                global_step: 0,
                prev_loss: None,
            },
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn split(&self) -> &EpochSplit {
        &self.split
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// The recorded samples, see [`SampleBuffer`].
    pub fn get_samples(&self) -> &SampleBuffer {
        &self.samples
    }

    pub fn metrics(&self) -> &MetricLog {
        &self.book.metrics
    }

    /// Hands back the sampler, the samples and the metrics.
    pub fn into_parts(self) -> (Sampler, SampleBuffer, MetricLog) {
        (self.sampler, self.samples, self.book.metrics)
    }

    /// Runs all cycles.
    pub fn run(&mut self) -> Result<(), SamplerError> {
        self.run_inner(None)
    }

    /// Runs all cycles while showing a progress bar with one tick per epoch.
    pub fn run_progress(&mut self) -> Result<(), SamplerError> {
        let total = self.config.cycles * self.config.epochs_per_cycle;
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        pb.set_prefix("SGLD");
        self.run_inner(Some(&pb))?;
        pb.finish_with_message("Done!");
        Ok(())
    }

    fn run_inner(&mut self, pb: Option<&ProgressBar>) -> Result<(), SamplerError> {
        let cycles = self.config.cycles;
        for cycle in 0..cycles {
            self.book.schedule.reset();
            log::info!("starting cycle {}/{cycles}", cycle + 1);
            for epoch in 0..self.config.epochs_per_cycle {
                let phase = self.split.phase(epoch);
                let entering = epoch == 0 || self.split.phase(epoch - 1) != phase;
                if entering {
                    log::info!("cycle {cycle}, epoch {epoch}: entering {} phase", phase.name());
                }
                if self.config.metropolis_hastings
                    && phase != Phase::Descent
                    && (epoch == 0 || self.split.phase(epoch - 1) == Phase::Descent)
                {
                    self.sampler.sample_momentum()?;
                }
                self.book.schedule.enter_phase(phase);

                if self.config.metropolis_hastings && phase != Phase::Descent {
                    self.run_trajectory(phase)?;
                } else {
                    self.run_epoch(phase)?;
                }

                if let Some(k) = self.config.precond_update {
                    if epoch % k == 0 {
                        self.update_preconditioner()?;
                    }
                }
                if let Some(offset) = self.split.sample_slot(epoch) {
                    let slot = self.samples.index(cycle, offset);
                    let lr = self.book.current_lr();
                    self.samples.record(slot, self.sampler.params(), lr)?;
                    log::debug!("recorded sample {slot} (cycle {cycle}, epoch {epoch}, lr {lr:.3e})");
                }

                if let Some(pb) = pb {
                    pb.inc(1);
                    pb.set_message(self.progress_message(cycle, phase));
                }
            }
        }
        Ok(())
    }

    fn progress_message(&self, cycle: usize, phase: Phase) -> String {
        let temps: Array1<f64> = (0..self.sampler.params().len())
            .filter_map(|i| self.sampler.state(ParamId(i)))
            .map(|s| s.est_temperature)
            .collect();
        let max_temp = temps.max().map_or(f64::NAN, |&t| t);
        format!(
            "cycle {cycle} {:8} loss≈{:.4} max(T_kin)≈{:.2}",
            phase.name(),
            self.book.prev_loss.unwrap_or(f64::NAN),
            max_temp
        )
    }

    /// One plain step per batch.
    fn run_epoch(&mut self, phase: Phase) -> Result<(), SamplerError> {
        let Self {
            config,
            sampler,
            provider,
            data,
            book,
            ..
        } = self;
        for batch in data.batches() {
            let ctx = StepContext::new(book.schedule.factor(), phase);
            let f = potential_fn(
                provider,
                batch,
                config.temperature,
                config.data_mult,
                config.grad_clip,
            );
            let loss = sampler.step_with(ctx, f)?;
            book.after_step(sampler, loss)?;
        }
        Ok(())
    }

    /// One Metropolis-Hastings trajectory spanning the epoch.
    ///
    /// Every batch drives one move. The closing half-kick is evaluated on the first batch
    /// again, so both ends of the energy difference see the same potential.
    fn run_trajectory(&mut self, phase: Phase) -> Result<(), SamplerError> {
        let Self {
            config,
            sampler,
            provider,
            data,
            book,
            ..
        } = self;
        let (temperature, data_mult, clip) =
            (config.temperature, config.data_mult, config.grad_clip);
        let mut batches = data.batches();
        let first = batches
            .next()
            .ok_or_else(|| SamplerError::config("the data source has no data"))?;

        let mut ctx = StepContext::new(book.schedule.factor(), phase);
        let f = potential_fn(provider, first, temperature, data_mult, clip);
        let start_loss = sampler.initial_step_with(ctx, f, true)?;
        book.after_step(sampler, start_loss)?;
        for batch in batches {
            ctx = StepContext::new(book.schedule.factor(), phase);
            let f = potential_fn(provider, batch, temperature, data_mult, clip);
            let loss = sampler.step_with(ctx, f)?;
            book.after_step(sampler, loss)?;
        }
        let f = potential_fn(provider, first, temperature, data_mult, clip);
        let end_loss = sampler.final_step_with(ctx, f)?;

        let delta = sampler.delta_energy(start_loss, end_loss)?;
        let rejected = sampler.maybe_reject(delta)?;
        let accept_prob = sampler.acceptance_probability(delta)?;
        log::debug!(
            "trajectory {}: delta energy {delta:.4e}, acceptance probability {accept_prob:.3}",
            if rejected { "rejected" } else { "accepted" }
        );
        let step = book.global_step.saturating_sub(1);
        book.scalar("mh/delta_energy", delta, step);
        book.scalar("mh/acceptance_prob", accept_prob, step);
        book.scalar("mh/rejected", if rejected { 1.0 } else { 0.0 }, step);
        Ok(())
    }

    fn update_preconditioner(&mut self) -> Result<(), SamplerError> {
        let Self {
            config,
            sampler,
            provider,
            data,
            ..
        } = self;
        let batches: Vec<&D::Batch> = data.batches().take(config.precond_samples).collect();
        let mut next = 0;
        let (temperature, data_mult, clip) =
            (config.temperature, config.data_mult, config.grad_clip);
        sampler.estimate_preconditioner(
            |params: &mut [Parameter]| {
                let batch = batches[next % batches.len()];
                next += 1;
                let loss = provider.potential(params, batch, temperature, data_mult);
                clip.apply(params);
                loss
            },
            config.precond_samples,
        )
    }
}
