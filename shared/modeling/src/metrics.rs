//! Scalar metric recording for training runs.
//!
//! One JSONL stream per run, owned exclusively by the coordinator rank.
//! Each line is a tagged scalar at a step, which downstream tooling can
//! pivot into per-tag time series.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One scalar observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Metric name, e.g. `loss/step` or `timings/epoch_s`.
    pub tag: String,
    pub value: f64,
    /// Step for step-level tags, epoch index for epoch-level tags.
    pub step: u64,
    /// Milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
}

/// Append-only JSONL writer under the run's `tb/` directory.
#[derive(Debug)]
pub struct MetricsWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsWriter {
    pub fn create(tb_dir: &Path) -> std::io::Result<Self> {
        let path = tb_dir.join("scalars.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> std::io::Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        let json = serde_json::to_string(&record)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for MetricsWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read a scalar stream back; used by tests and offline tooling.
pub fn load_scalars(path: &Path) -> std::io::Result<Vec<ScalarRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}
