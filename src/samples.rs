//! Preallocated storage for the snapshots recorded during sampling epochs.

use crate::error::SamplerError;
use crate::parameter::Parameter;
use ndarray::{Array1, ArrayD, Axis, IxDyn};
use std::collections::BTreeMap;

/// Fixed-size store of parameter snapshots and the learning rate they were taken at.
///
/// For every parameter the buffer holds an array of shape `[capacity, ...param_shape]`.
/// Slot `cycle * samples_per_cycle + offset` holds the `offset`-th sample of `cycle`.
/// Slots that were never written stay at `0.0`; [`SampleBuffer::is_filled`] tells them
/// apart from recorded zeros.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    names: Vec<String>,
    values: BTreeMap<String, ArrayD<f64>>,
    lr: Array1<f64>,
    filled: Vec<bool>,
    samples_per_cycle: usize,
}

impl SampleBuffer {
    /// Allocates room for `samples_per_cycle * cycles` snapshots of `params`.
    pub fn new(params: &[Parameter], samples_per_cycle: usize, cycles: usize) -> Self {
        let capacity = samples_per_cycle * cycles;
        let mut names = Vec::with_capacity(params.len());
        let mut values = BTreeMap::new();
        for p in params {
            let mut shape = vec![capacity];
            shape.extend_from_slice(p.shape());
            names.push(p.name.clone());
            values.insert(p.name.clone(), ArrayD::zeros(IxDyn(&shape)));
        }
        Self {
            names,
            values,
            lr: Array1::zeros(capacity),
            filled: vec![false; capacity],
            samples_per_cycle,
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.filled.len()
    }

    pub fn samples_per_cycle(&self) -> usize {
        self.samples_per_cycle
    }

    /// Slot index of sample `offset` of `cycle`.
    pub fn index(&self, cycle: usize, offset: usize) -> usize {
        cycle * self.samples_per_cycle + offset
    }

    /// Copies every parameter value and the learning rate into `slot`.
    pub fn record(&mut self, slot: usize, params: &[Parameter], lr: f64) -> Result<(), SamplerError> {
        if slot >= self.capacity() {
            return Err(SamplerError::config(format!(
                "sample slot {slot} out of range for a buffer of {}",
                self.capacity()
            )));
        }
        for p in params {
            let store = self.values.get_mut(&p.name).ok_or_else(|| {
                SamplerError::config(format!("parameter `{}` has no sample storage", p.name))
            })?;
            let mut row = store.index_axis_mut(Axis(0), slot);
            if row.shape() != p.shape() {
                return Err(SamplerError::Shape {
                    name: p.name.clone(),
                    expected: row.shape().to_vec(),
                    got: p.shape().to_vec(),
                });
            }
            row.assign(&p.value);
        }
        self.lr[slot] = lr;
        self.filled[slot] = true;
        Ok(())
    }

    pub fn is_filled(&self, slot: usize) -> bool {
        self.filled.get(slot).copied().unwrap_or(false)
    }

    /// Number of slots written so far.
    pub fn num_filled(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }

    /// Indices of the written slots in increasing order.
    pub fn filled_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.filled
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| f.then_some(i))
    }

    /// Parameter names in the order the parameters were given.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// All snapshots of one parameter, `[capacity, ...shape]`.
    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.values.get(name)
    }

    /// Learning rate of every slot.
    pub fn lr(&self) -> &Array1<f64> {
        &self.lr
    }

    /// Looks up a parameter's snapshots, with `"lr"` mapping to the learning rates.
    pub fn get_with_lr(&self, name: &str) -> Option<ArrayD<f64>> {
        if name == "lr" {
            Some(self.lr.clone().into_dyn())
        } else {
            self.values.get(name).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn params() -> Vec<Parameter> {
        vec![
            Parameter::zeros("w", &[2, 3]),
            Parameter::from_vec("b", vec![1.0, 2.0]),
        ]
    }

    #[test]
    fn test_layout_and_fill_value() {
        let buf = SampleBuffer::new(&params(), 3, 2);
        assert_eq!(buf.capacity(), 6);
        assert_eq!(buf.get("w").unwrap().shape(), &[6, 2, 3]);
        assert_eq!(buf.get("b").unwrap().shape(), &[6, 2]);
        assert_eq!(buf.lr().len(), 6);
        assert_eq!(buf.num_filled(), 0);
        assert!(buf.get("b").unwrap().iter().all(|&v| v == 0.0));
        assert_eq!(buf.names(), &["w".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_record_writes_slot() {
        let mut ps = params();
        let mut buf = SampleBuffer::new(&ps, 3, 2);
        ps[1].value = arr1(&[5.0, -1.0]).into_dyn();
        let slot = buf.index(1, 2);
        assert_eq!(slot, 5);
        buf.record(slot, &ps, 0.25).unwrap();
        assert!(buf.is_filled(5));
        assert!(!buf.is_filled(4));
        assert_eq!(buf.filled_slots().collect::<Vec<_>>(), vec![5]);
        let b = buf.get("b").unwrap();
        assert_eq!(b.index_axis(Axis(0), 5), arr1(&[5.0, -1.0]).into_dyn());
        assert_eq!(buf.lr()[5], 0.25);
        assert_eq!(buf.get_with_lr("lr").unwrap()[[5]], 0.25);
    }

    #[test]
    fn test_record_out_of_range() {
        let ps = params();
        let mut buf = SampleBuffer::new(&ps, 1, 1);
        assert!(matches!(
            buf.record(1, &ps, 0.1),
            Err(SamplerError::Config(_))
        ));
    }

    #[test]
    fn test_record_shape_mismatch() {
        let ps = params();
        let mut buf = SampleBuffer::new(&ps, 1, 1);
        let other = vec![Parameter::zeros("b", &[3])];
        assert!(matches!(
            buf.record(0, &other, 0.1),
            Err(SamplerError::Shape { .. })
        ));
    }
}
