//! Named parameter tensors and the gradient clipping applied before each update.

use crate::error::SamplerError;
use ndarray::{Array1, ArrayD, IxDyn};

/// Stable handle to a parameter: its position in the sampler's parameter arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(pub usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A named tensor with its current value and the gradient written by the potential.
///
/// The gradient always has the same shape as the value. A [`crate::runner::GradientProvider`]
/// overwrites it on every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: ArrayD<f64>,
    pub grad: ArrayD<f64>,
}

impl Parameter {
    /// Wraps `value` with a zero gradient of the same shape.
    pub fn new(name: impl Into<String>, value: ArrayD<f64>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    /// A 1-D parameter from a flat vector.
    pub fn from_vec(name: impl Into<String>, value: Vec<f64>) -> Self {
        Self::new(name, Array1::from(value).into_dyn())
    }

    /// A parameter of the given shape filled with zeros.
    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Self {
        Self::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Number of scalar elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub(crate) fn check_grad_shape(&self) -> Result<(), SamplerError> {
        if self.grad.shape() != self.value.shape() {
            return Err(SamplerError::Shape {
                name: self.name.clone(),
                expected: self.value.shape().to_vec(),
                got: self.grad.shape().to_vec(),
            });
        }
        Ok(())
    }
}

/// How raw gradients are bounded before the sampler sees them.
///
/// Clipping keeps NaN values: a NaN gradient survives every policy and shows up in the
/// parameters and the next loss instead of being hidden.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradClip {
    /// Leave gradients untouched.
    None,
    /// Clamp every element to `[-max, max]`.
    Value(f64),
    /// Rescale each parameter's gradient so its L2 norm is at most `max`.
    Norm(f64),
}

impl Default for GradClip {
    fn default() -> Self {
        GradClip::Value(1e6)
    }
}

impl GradClip {
    /// The bound carried by the policy, if any.
    pub fn bound(&self) -> Option<f64> {
        match *self {
            GradClip::None => None,
            GradClip::Value(max) | GradClip::Norm(max) => Some(max),
        }
    }

    /// Applies the policy in place to every parameter's gradient.
    pub fn apply(&self, params: &mut [Parameter]) {
        match *self {
            GradClip::None => {}
            GradClip::Value(max) => {
                for p in params.iter_mut() {
                    p.grad.mapv_inplace(|g| g.clamp(-max, max));
                }
            }
            GradClip::Norm(max) => {
                for p in params.iter_mut() {
                    let norm = p.grad.iter().map(|g| g * g).sum::<f64>().sqrt();
                    if norm > max {
                        let scale = max / norm;
                        p.grad.mapv_inplace(|g| g * scale);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn test_new_parameter_has_zero_grad() {
        let p = Parameter::zeros("w", &[2, 3]);
        assert_eq!(p.shape(), &[2, 3]);
        assert_eq!(p.grad.shape(), &[2, 3]);
        assert_eq!(p.len(), 6);
        assert!(p.grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_value_clip_clamps_elements() {
        let mut params = vec![Parameter::from_vec("w", vec![0.0; 3])];
        params[0].grad = arr1(&[-5.0, 0.5, 7.0]).into_dyn();
        GradClip::Value(1.0).apply(&mut params);
        assert_eq!(params[0].grad, arr1(&[-1.0, 0.5, 1.0]).into_dyn());
    }

    #[test]
    fn test_value_clip_keeps_nan() {
        let mut params = vec![Parameter::from_vec("w", vec![0.0; 2])];
        params[0].grad = arr1(&[f64::NAN, 3.0]).into_dyn();
        GradClip::Value(1.0).apply(&mut params);
        assert!(params[0].grad[[0]].is_nan());
        assert_eq!(params[0].grad[[1]], 1.0);
    }

    #[test]
    fn test_norm_clip_rescales_per_parameter() {
        let mut params = vec![
            Parameter::from_vec("a", vec![0.0; 2]),
            Parameter::from_vec("b", vec![0.0; 2]),
        ];
        params[0].grad = arr1(&[3.0, 4.0]).into_dyn();
        params[1].grad = arr1(&[0.3, 0.4]).into_dyn();
        GradClip::Norm(1.0).apply(&mut params);
        assert_abs_diff_eq!(params[0].grad, arr1(&[0.6, 0.8]).into_dyn(), epsilon = 1e-12);
        assert_abs_diff_eq!(params[1].grad, arr1(&[0.3, 0.4]).into_dyn(), epsilon = 1e-12);
    }

    #[test]
    fn test_grad_shape_check() {
        let mut p = Parameter::zeros("w", &[2]);
        assert!(p.check_grad_shape().is_ok());
        p.grad = ArrayD::zeros(IxDyn(&[3]));
        assert!(matches!(
            p.check_grad_shape(),
            Err(SamplerError::Shape { .. })
        ));
    }
}
