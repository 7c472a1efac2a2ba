//! End-to-end runs of the cycle runner on a conjugate Gaussian model.

use mini_sgld::data::MiniBatches;
use mini_sgld::parameter::Parameter;
use mini_sgld::runner::{RunnerConfig, SGLDRunner};
use mini_sgld::sgld::{Hyperparams, Sampler};

const BASE_LR: f64 = 0.1;
const BATCHES: usize = 4;

/// Unit-variance Gaussian likelihood for the mean `mu`, averaged over the batch.
fn gaussian_mean(params: &mut [Parameter], batch: &Vec<f64>, _t: f64, _m: f64) -> f64 {
    let mu = params[0].value[[0]];
    let n = batch.len() as f64;
    params[0].grad[[0]] = batch.iter().map(|y| mu - y).sum::<f64>() / n;
    batch.iter().map(|y| 0.5 * (y - mu).powi(2)).sum::<f64>() / n
}

type Potential = fn(&mut [Parameter], &Vec<f64>, f64, f64) -> f64;

/// Every batch holds the full data set, so the loss of each step is the full potential.
fn full_batches() -> MiniBatches<Vec<f64>> {
    let ys = vec![0.8, 1.2, 1.0, 0.9, 1.1, 1.0];
    let len = ys.len();
    MiniBatches::new(vec![ys; BATCHES], len)
}

fn runner(config: RunnerConfig) -> SGLDRunner<MiniBatches<Vec<f64>>, Potential> {
    let sampler = Sampler::single_group(
        vec![Parameter::from_vec("mu", vec![5.0])],
        Hyperparams::new(BASE_LR, 1.0),
    )
    .unwrap()
    .set_seed(42);
    SGLDRunner::new(config, sampler, gaussian_mean as Potential, full_batches(), None).unwrap()
}

#[test]
fn test_single_cycle_scenario() {
    let mut r = runner(RunnerConfig::new(10, 3, 5));
    assert_eq!(r.split().descent_epochs, 2);
    r.run().unwrap();

    let samples = r.get_samples();
    assert_eq!(samples.capacity(), 5);
    assert_eq!(samples.num_filled(), 5);
    assert_eq!(samples.get("mu").unwrap().shape(), &[5, 1]);
    assert_eq!(samples.lr().len(), 5);
    // Recorded rates are those of the following step; the last one ends the cosine at 0.
    assert!(samples.lr().iter().all(|&lr| (0.0..BASE_LR).contains(&lr)));
    assert!(samples.lr()[4].abs() < 1e-12);

    // Descent: noise-free gradient descent on a convex potential.
    let loss = r.metrics().get("loss").unwrap();
    assert_eq!(loss.len(), 10 * BATCHES);
    let descent = &loss[..2 * BATCHES];
    assert!(
        descent.windows(2).all(|w| w[1] <= w[0]),
        "descent loss increased: {descent:?}"
    );
}

#[test]
fn test_learning_rate_decays_into_sampling() {
    let mut r = runner(RunnerConfig::new(10, 3, 5).set_sampling_decay(true));
    r.run().unwrap();
    let lr = r.metrics().get("lr").unwrap();
    assert!(lr.windows(2).all(|w| w[1] < w[0]));
    let first_sampling_epoch = 5 * BATCHES;
    assert!(lr[first_sampling_epoch] < lr[0]);
    let recorded = r.get_samples().lr();
    assert!(recorded.windows(2).into_iter().all(|w| w[1] < w[0]));
}

#[test]
fn test_learning_rate_frozen_without_sampling_decay() {
    let mut r = runner(RunnerConfig::new(10, 3, 5).set_sampling_decay(false));
    r.run().unwrap();
    let recorded = r.get_samples().lr();
    assert!(recorded.iter().all(|&lr| lr == recorded[0]));
    let lr = r.metrics().get("lr").unwrap();
    let sampling = &lr[5 * BATCHES..];
    assert!(sampling.iter().all(|&v| v == sampling[0]));
    assert!(sampling[0] < lr[0]);
}

#[test]
fn test_schedule_restarts_every_cycle() {
    let mut r = runner(RunnerConfig::new(4, 1, 2).set_skip(2).set_cycles(3));
    r.run().unwrap();
    let samples = r.get_samples();
    assert_eq!(samples.samples_per_cycle(), 1);
    assert_eq!(samples.num_filled(), 3);

    let lr = r.metrics().get("lr").unwrap();
    let per_cycle = 4 * BATCHES;
    assert_eq!(lr.len(), 3 * per_cycle);
    for cycle in 1..3 {
        let start = cycle * per_cycle;
        assert!(lr[start] > lr[start - 1]);
        assert_eq!(lr[start], lr[0]);
    }
    // Same epoch of every cycle records the same learning rate.
    assert!(samples.lr().iter().all(|&v| v == samples.lr()[0]));
}

#[test]
fn test_samples_concentrate_near_posterior_mean() {
    let mut r = runner(RunnerConfig::new(20, 5, 10).set_cycles(2));
    r.run().unwrap();
    let (sampler, samples, metrics) = r.into_parts();
    assert_eq!(samples.num_filled(), 20);
    assert!(!metrics.is_empty());
    // Posterior N(1.0, 1/6): every draw within 6 standard deviations.
    let draws = samples.get("mu").unwrap();
    assert!(draws.iter().all(|&mu| (mu - 1.0).abs() < 6.0 / 6f64.sqrt()), "{draws:?}");
    assert_eq!(sampler.groups()[0].hyper.num_data, 6.0);
}
