//! Scalar metrics recorded by the cycle runner.

use std::collections::BTreeMap;

/// Receives every scalar the runner records, e.g. to forward it to a dashboard.
pub trait MetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize);
}

/// Forwards scalars to the `log` facade at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        log::trace!("step {step}: {name} = {value:.6e}");
    }
}

/// Append-only table of named scalar series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricLog {
    series: BTreeMap<String, Vec<f64>>,
}

impl MetricLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: f64) {
        match self.series.get_mut(name) {
            Some(values) => values.push(value),
            None => {
                self.series.insert(name.to_string(), vec![value]);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series.get(name).map(Vec::as_slice)
    }

    /// Most recent value of a series.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.last().copied())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
