/*!
# Saving Recorded Samples to CSV

Writes the filled slots of a [`SampleBuffer`] to a CSV file. Enable via the `csv` feature.
*/

use crate::samples::SampleBuffer;
use csv::Writer;
use ndarray::Axis;
use std::error::Error;
use std::fs::File;

/**
Saves every filled slot of `samples` as one CSV row.

The header row contains `"cycle"`, `"sample"`, `"lr"` and then one column per scalar of
every parameter, named `"<name>[<flat index>]"` in row-major order. Unfilled slots are
skipped.

# Arguments

* `samples` - The buffer returned by [`crate::runner::SGLDRunner::get_samples`].
* `filename` - The file path where the CSV data will be written.

# Returns

Returns `Ok(())` if successful, or an error if any I/O or CSV formatting
issue occurs.

# Examples

```rust
use mini_sgld::io::csv::save_samples_csv;
use mini_sgld::parameter::Parameter;
use mini_sgld::samples::SampleBuffer;

let params = vec![Parameter::from_vec("w", vec![1.0, 2.0])];
let mut samples = SampleBuffer::new(&params, 2, 1);
samples.record(0, &params, 0.1)?;

save_samples_csv(&samples, "/tmp/samples.csv")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_samples_csv(samples: &SampleBuffer, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header = vec!["cycle".to_string(), "sample".to_string(), "lr".to_string()];
    for name in samples.names() {
        let width: usize = samples.get(name).map_or(0, |a| a.shape()[1..].iter().product());
        header.extend((0..width).map(|i| format!("{name}[{i}]")));
    }
    wtr.write_record(&header)?;

    let per_cycle = samples.samples_per_cycle().max(1);
    for slot in samples.filled_slots() {
        let mut row = vec![
            (slot / per_cycle).to_string(),
            (slot % per_cycle).to_string(),
            samples.lr()[slot].to_string(),
        ];
        for name in samples.names() {
            if let Some(values) = samples.get(name) {
                row.extend(values.index_axis(Axis(0), slot).iter().map(|v| v.to_string()));
            }
        }
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Parameter;
    use csv::Reader;
    use ndarray::arr2;
    use tempfile::NamedTempFile;

    #[test]
    fn test_header_and_rows() {
        let mut params = vec![
            Parameter::new("w", arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn()),
            Parameter::from_vec("b", vec![0.5]),
        ];
        let mut samples = SampleBuffer::new(&params, 2, 2);
        samples.record(1, &params, 0.25).unwrap();
        params[1].value[[0]] = -0.5;
        samples.record(2, &params, 0.125).unwrap();

        let file = NamedTempFile::new().expect("Could not create temp file");
        let filename = file.path().to_str().unwrap();
        save_samples_csv(&samples, filename).unwrap();

        let mut rdr = Reader::from_path(filename).unwrap();
        let header: Vec<String> = rdr.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            header,
            vec!["cycle", "sample", "lr", "w[0]", "w[1]", "w[2]", "w[3]", "b[0]"]
        );
        let rows: Vec<Vec<String>> = rdr
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["0", "1", "0.25", "1", "2", "3", "4", "0.5"]);
        assert_eq!(rows[1], vec!["1", "0", "0.125", "1", "2", "3", "4", "-0.5"]);
    }

    #[test]
    fn test_empty_buffer_writes_header_only() {
        let params = vec![Parameter::from_vec("x", vec![0.0])];
        let samples = SampleBuffer::new(&params, 3, 1);
        let file = NamedTempFile::new().expect("Could not create temp file");
        let filename = file.path().to_str().unwrap();
        save_samples_csv(&samples, filename).unwrap();
        let contents = std::fs::read_to_string(filename).unwrap();
        assert_eq!(contents.trim(), "cycle,sample,lr,x[0]");
    }
}
