use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::rate::ParameterVector;
use crate::sfs::EmissionModel;

/// Model description shared by the CLI subcommands.
///
/// `hidden_states` lists the finite boundaries only, starting at 0; the
/// final +infinity boundary is implicit. `sample_sizes` has one entry per
/// population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub params: ParameterVector,
    pub rho: f64,
    pub theta: f64,
    pub hidden_states: Vec<f64>,
    pub sample_sizes: Vec<usize>,
    /// Per-hidden-state emission tables, two populations only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<Vec<Vec<f64>>>>,
}

impl ModelFile {
    /// Hidden-state boundaries with the trailing +infinity appended.
    pub fn boundaries(&self) -> Vec<f64> {
        let mut hs = self.hidden_states.clone();
        hs.push(f64::INFINITY);
        hs
    }

    pub fn emission_model(&self) -> Result<EmissionModel> {
        match self.sample_sizes.as_slice() {
            [n] => Ok(EmissionModel::one_pop(*n)),
            [n1, n2] => Ok(EmissionModel::two_pop(*n1, *n2)),
            other => bail!("expected 1 or 2 sample sizes, got {}", other.len()),
        }
    }
}

pub fn save_model(path: &Path, model: &ModelFile) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, model)
        .with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

pub fn load_model(path: &Path) -> Result<ModelFile> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let reader = BufReader::new(file);
    let model: ModelFile =
        serde_json::from_reader(reader).with_context(|| format!("failed to parse {:?}", path))?;
    if model.hidden_states.iter().any(|h| !h.is_finite()) {
        bail!("{:?}: hidden_states must list finite boundaries only", path);
    }
    Ok(model)
}
