//! Gradients through `burn` autodiff.
//!
//! A [`BurnModel`] maps one flat 1-D tensor per parameter (in the sampler's parameter
//! order) to a scalar potential. [`BurnPotential`] turns such a model into a
//! [`GradientProvider`]: it uploads the current values, runs the backward pass and copies
//! the gradients back into the parameters.

use crate::parameter::Parameter;
use crate::runner::GradientProvider;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use burn::tensor::{ElementConversion, TensorData};
use std::marker::PhantomData;

/// A differentiable data-averaged potential written with `burn` tensors.
pub trait BurnModel<B: AutodiffBackend, Batch> {
    /// Returns a one-element tensor holding the potential of `batch` at `params`.
    fn potential(
        &self,
        params: &[Tensor<B, 1>],
        batch: &Batch,
        temperature: f64,
        data_mult: f64,
    ) -> Tensor<B, 1>;
}

/// [`GradientProvider`] over a [`BurnModel`].
#[derive(Debug, Clone)]
pub struct BurnPotential<B: AutodiffBackend, M> {
    model: M,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, M> BurnPotential<B, M> {
    /// Evaluates `model` on the backend's default device.
    pub fn new(model: M) -> Self {
        Self {
            model,
            device: B::Device::default(),
            _backend: PhantomData,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn upload(&self, p: &Parameter) -> Tensor<B, 1> {
        let values: Vec<B::FloatElem> = p.value.iter().map(|&x| B::FloatElem::from_elem(x)).collect();
        let td = TensorData::new(values, [p.len()]);
        Tensor::<B, 1>::from_data(td, &self.device).require_grad()
    }
}

impl<B, M, Batch> GradientProvider<Batch> for BurnPotential<B, M>
where
    B: AutodiffBackend,
    M: BurnModel<B, Batch>,
{
    fn potential(
        &mut self,
        params: &mut [Parameter],
        batch: &Batch,
        temperature: f64,
        data_mult: f64,
    ) -> f64 {
        let tensors: Vec<Tensor<B, 1>> = params.iter().map(|p| self.upload(p)).collect();
        let u = self
            .model
            .potential(&tensors, batch, temperature, data_mult);
        let grads = u.backward();
        let value = u.into_scalar().to_f64();

        for (p, t) in params.iter_mut().zip(&tensors) {
            match t.grad(&grads) {
                Some(g) => {
                    let data = g.into_data();
                    for (dst, src) in p.grad.iter_mut().zip(data.iter::<f64>()) {
                        *dst = src;
                    }
                }
                // Parameters the potential does not depend on.
                None => p.zero_grad(),
            }
        }
        value
    }
}
