//! Persisting the trained model and its optional export.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{ExportConfig, TuneConfig};
use crate::error::{Result, Stage, TuneError};
use crate::model::{save_weights, LoadedModel, CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE};

/// Copy of the configuration that produced the artifact.
pub const RUN_CONFIG_FILE: &str = "run_config.yaml";

/// Where a publish put its files.
#[derive(Debug)]
pub struct PublishReport {
    /// Output directory holding the primary artifact.
    pub dir: PathBuf,
    /// Final weights file.
    pub weights: PathBuf,
    /// Export outcome, `None` when no export is configured.
    pub export: Option<Result<PathBuf>>,
}

impl PublishReport {
    /// Whether a configured export failed.
    #[must_use]
    pub fn export_failed(&self) -> bool {
        matches!(self.export, Some(Err(_)))
    }
}

/// Save the trained model to `config.output_dir`, then run the configured export.
///
/// The primary artifact is a loadable model directory. A failed export is
/// logged and recorded in the report without failing the publish.
///
/// # Errors
///
/// Returns [`crate::TuneError::Publish`] if the primary artifact cannot be written.
pub fn publish(loaded: &LoadedModel, config: &TuneConfig) -> Result<PublishReport> {
    let dir = PathBuf::from(&config.output_dir);
    let weights = write_primary(loaded, config, &dir).map_err(|e| e.within(Stage::Publish))?;
    tracing::info!("Model saved to {}", dir.display());

    let export = config.export.as_ref().map(|export| {
        let result = write_export(loaded, export, &dir).map_err(|e| e.within(Stage::Publish));
        match &result {
            Ok(path) => tracing::info!("Exported weights to {}", path.display()),
            Err(e) => tracing::warn!("Export failed, primary model is unaffected: {}", e),
        }
        result
    });

    Ok(PublishReport {
        dir,
        weights,
        export,
    })
}

fn write_primary(loaded: &LoadedModel, config: &TuneConfig, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let weights = dir.join(WEIGHTS_FILE);
    save_weights(&loaded.varmap, &weights, config.precision.dtype())?;

    fs::write(
        dir.join(CONFIG_FILE),
        serde_json::to_string_pretty(loaded.model.config())?,
    )?;
    loaded.tokenizer.save(dir.join(TOKENIZER_FILE), true)?;
    config.to_file(dir.join(RUN_CONFIG_FILE))?;

    Ok(weights)
}

fn write_export(loaded: &LoadedModel, export: &ExportConfig, dir: &Path) -> Result<PathBuf> {
    let target = dir.join(&export.file_name);
    let staging = dir.join(format!(".{}.partial", export.file_name));

    let written = save_weights(&loaded.varmap, &staging, export.dtype.dtype())
        .and_then(|()| fs::rename(&staging, &target).map_err(TuneError::from));
    if written.is_err() && staging.exists() {
        let _ = fs::remove_file(&staging);
    }
    written.map(|()| target)
}
