use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::chain::TraceSample;

pub fn default_trace_path(prefix: &Path) -> PathBuf {
    prefix.with_extension("trace.tsv")
}

pub fn default_summary_path(prefix: &Path) -> PathBuf {
    prefix.with_extension("summary.json")
}

pub fn default_config_path(prefix: &Path) -> PathBuf {
    prefix.with_extension("config.json")
}

/// Streams the cold chain's sampled columns to a TSV trace. The header is
/// fixed by the first sample; later samples must match it.
pub struct TraceWriter {
    writer: BufWriter<File>,
    header: Option<Vec<String>>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
            header: None,
        })
    }

    pub fn write_sample(&mut self, sample: &TraceSample) -> Result<()> {
        let names: Vec<String> = sample.columns.iter().map(|(n, _)| n.clone()).collect();
        match &self.header {
            None => {
                write!(self.writer, "step")?;
                for name in &names {
                    write!(self.writer, "\t{name}")?;
                }
                writeln!(self.writer)?;
                self.header = Some(names);
            }
            Some(header) => {
                if *header != names {
                    bail!("trace columns changed mid-run");
                }
            }
        }
        write!(self.writer, "{}", sample.step)?;
        for (_, value) in &sample.columns {
            write!(self.writer, "\t{value:.8e}")?;
        }
        writeln!(self.writer)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorRate {
    pub name: String,
    pub acceptance: f64,
    pub tried: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwapRateEntry {
    pub pair: String,
    pub attempts: u64,
    pub accepts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub steps: u64,
    pub n_chains: usize,
    pub temperatures: Vec<f64>,
    pub swap_interval: u64,
    pub seed: u64,
    pub final_posterior: f64,
    pub operators: Vec<OperatorRate>,
    pub swaps: Vec<SwapRateEntry>,
    pub final_tree: String,
    pub final_columns: Vec<(String, f64)>,
}

pub fn write_summary_json(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, summary)
        .with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}
