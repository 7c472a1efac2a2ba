//! Export of recorded samples.

#[cfg(feature = "csv")]
pub mod csv;
