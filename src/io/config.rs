use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::builder::RunSettings;
use crate::subst::SubstKind;

/// The effective run configuration, written next to the outputs so a run
/// can be reproduced, and loadable in place of command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub seed: u64,
    pub n_steps: u64,
    pub n_chains: usize,
    pub hot_delta: f64,
    /// Explicit ladder; overrides `hot_delta` when present.
    pub temperatures: Option<Vec<f64>>,
    pub swap_interval: u64,
    pub sample_every: u64,
    pub model: String,
    pub gamma_categories: usize,
    pub kappa0: f64,
    pub shape0: f64,
    pub pop_size0: f64,
    pub slide_window: f64,
}

impl RunConfig {
    pub fn subst_kind(&self) -> Result<SubstKind> {
        match self.model.to_ascii_lowercase().as_str() {
            "jc69" => Ok(SubstKind::Jc69),
            "hky85" | "hky" => Ok(SubstKind::Hky85),
            other => bail!("unknown substitution model {other:?} (expected jc69 or hky85)"),
        }
    }

    pub fn settings(&self) -> Result<RunSettings> {
        Ok(RunSettings {
            subst: self.subst_kind()?,
            gamma_categories: self.gamma_categories,
            kappa0: self.kappa0,
            shape0: self.shape0,
            pop_size0: self.pop_size0,
            slide_window: self.slide_window,
        })
    }

    /// The temperature ladder this configuration describes.
    pub fn ladder(&self) -> Result<Vec<f64>> {
        let temps = match &self.temperatures {
            Some(t) => t.clone(),
            None => crate::coupler::ladder(self.n_chains, self.hot_delta),
        };
        if temps.is_empty() {
            bail!("temperature ladder is empty");
        }
        if (temps[0] - 1.0).abs() > 1e-12 {
            bail!("the first temperature must be 1.0, got {}", temps[0]);
        }
        Ok(temps)
    }
}

pub fn save_config(path: &Path, config: &RunConfig) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, config)
        .with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let config =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    Ok(config)
}
