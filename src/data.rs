//! Mini-batch data sources.

/// A finite dataset traversed once per epoch in batches.
pub trait DataSource {
    type Batch;

    /// Number of data points.
    fn len(&self) -> usize;

    fn num_batches(&self) -> usize;

    /// Every batch exactly once, in a fixed order.
    fn batches(&self) -> impl Iterator<Item = &Self::Batch>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pre-split in-memory batches.
#[derive(Debug, Clone, PartialEq)]
pub struct MiniBatches<T> {
    batches: Vec<T>,
    len: usize,
}

impl<T> MiniBatches<T> {
    /// Wraps batches that together hold `len` data points.
    pub fn new(batches: Vec<T>, len: usize) -> Self {
        Self { batches, len }
    }
}

impl<T: Clone> MiniBatches<Vec<T>> {
    /// Splits `items` into consecutive batches of at most `batch_size`.
    pub fn from_items(items: &[T], batch_size: usize) -> Self {
        let batches = items
            .chunks(batch_size.max(1))
            .map(<[T]>::to_vec)
            .collect();
        Self::new(batches, items.len())
    }
}

impl<T> DataSource for MiniBatches<T> {
    type Batch = T;

    fn len(&self) -> usize {
        self.len
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn batches(&self) -> impl Iterator<Item = &T> {
        self.batches.iter()
    }
}
