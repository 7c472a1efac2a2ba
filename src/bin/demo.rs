//! Bayesian linear regression with cyclical SGLD: gradients from `burn` autodiff,
//! preconditioner updates, progress bar and logging.
//!
//! Run with `RUST_LOG=debug` to see recorded samples and preconditioner updates.

use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, TensorData};
use mini_sgld::burn_potential::{BurnModel, BurnPotential};
use mini_sgld::data::MiniBatches;
use mini_sgld::metrics::LogSink;
use mini_sgld::parameter::{GradClip, Parameter};
use mini_sgld::runner::{RunnerConfig, SGLDRunner};
use mini_sgld::sgld::{Hyperparams, Sampler};
use ndarray::Axis;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::error::Error;

type DemoBackend = Autodiff<NdArray<f64>>;

/// `y = w * x + b + noise` with a standard normal prior on `w` and `b`.
struct LinearRegression {
    noise_std: f64,
    len: usize,
}

impl<B: AutodiffBackend> BurnModel<B, Vec<(f64, f64)>> for LinearRegression {
    fn potential(
        &self,
        params: &[Tensor<B, 1>],
        batch: &Vec<(f64, f64)>,
        _temperature: f64,
        data_mult: f64,
    ) -> Tensor<B, 1> {
        let device = params[0].device();
        let n = batch.len();
        let column = |f: fn(&(f64, f64)) -> f64| {
            let values: Vec<B::FloatElem> = batch.iter().map(|p| f(p).elem()).collect();
            Tensor::<B, 1>::from_data(TensorData::new(values, [n]), &device)
        };
        let (x, y) = (column(|p| p.0), column(|p| p.1));
        let (w, b) = (params[0].clone(), params[1].clone());

        let pred = x.mul(w.clone().expand([n])).add(b.clone().expand([n]));
        let nll = y
            .sub(pred)
            .powf_scalar(2.0)
            .sum()
            .mul_scalar(0.5 / (self.noise_std * self.noise_std * n as f64));
        let num_data = self.len as f64 * data_mult;
        let prior = w
            .powf_scalar(2.0)
            .sum()
            .add(b.powf_scalar(2.0).sum())
            .mul_scalar(0.5 / num_data);
        nll.add(prior)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    const SEED: u64 = 42;
    const N: usize = 512;
    const BATCH_SIZE: usize = 64;
    const TRUE_W: f64 = 2.0;
    const TRUE_B: f64 = -1.0;
    const NOISE_STD: f64 = 0.5;

    let mut rng = SmallRng::seed_from_u64(SEED);
    let points: Vec<(f64, f64)> = (0..N)
        .map(|_| {
            let x: f64 = rng.gen_range(-2.0..2.0);
            let eps: f64 = rng.sample(StandardNormal);
            (x, TRUE_W * x + TRUE_B + NOISE_STD * eps)
        })
        .collect();
    let data = MiniBatches::from_items(&points, BATCH_SIZE);

    let provider = BurnPotential::<DemoBackend, _>::new(LinearRegression {
        noise_std: NOISE_STD,
        len: N,
    });
    let sampler = Sampler::single_group(
        vec![
            Parameter::from_vec("w", vec![0.0]),
            Parameter::from_vec("b", vec![0.0]),
        ],
        Hyperparams::new(0.01, N as f64).set_momentum(0.9),
    )?
    .set_seed(SEED);

    let config = RunnerConfig::new(20, 5, 10)
        .set_skip(2)
        .set_cycles(3)
        .set_grad_clip(GradClip::Value(1e3))
        .set_precond_update(Some(2))
        .set_precond_samples(4);
    let mut runner = SGLDRunner::new(config, sampler, provider, data, Some(Box::new(LogSink)))?;
    runner.run_progress()?;

    let samples = runner.get_samples();
    println!(
        "Collected {} of {} samples",
        samples.num_filled(),
        samples.capacity()
    );
    for name in ["w", "b"] {
        if let Some(values) = samples.get(name) {
            let draws: Vec<f64> = samples
                .filled_slots()
                .map(|slot| values.index_axis(Axis(0), slot)[[0]])
                .collect();
            let mean = draws.iter().sum::<f64>() / draws.len() as f64;
            let var = draws.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / draws.len() as f64;
            println!("{name}: posterior mean {mean:.3}, std {:.3}", var.sqrt());
        }
    }
    if let Some(loss) = runner.metrics().last("loss") {
        println!("Final loss: {loss:.4}");
    }

    #[cfg(feature = "csv")]
    {
        mini_sgld::io::csv::save_samples_csv(samples, "/tmp/sgld_samples.csv")?;
        println!("Saved samples to /tmp/sgld_samples.csv");
    }

    Ok(())
}
