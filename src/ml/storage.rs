//! Model Storage and Persistence
//!
//! One bincode blob per model id under the configured directory. Writes go
//! to a temporary file that is synced and then renamed over the final name,
//! so a crash mid-write never leaves a truncated artifact under `<id>.bin`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::matrix::validate_model_id;
use super::training::TrainedModel;
use crate::error::{EngineError, Result};

/// Default model storage directory
pub const MODEL_DIR: &str = "models";

/// Bumped whenever the layout of [`TrainedModel`] or the envelope changes
pub const ARTIFACT_FORMAT_VERSION: u32 = 2;

const ARTIFACT_EXT: &str = "bin";

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one artifact per model id
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Load every artifact into memory at startup
    #[serde(default)]
    pub preload_on_start: bool,
    /// Keep the previous artifact as `<id>.bin.bak` when overwriting
    #[serde(default = "default_true")]
    pub keep_backup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            preload_on_start: false,
            keep_backup: true,
        }
    }
}

fn default_model_dir() -> PathBuf {
    PathBuf::from(MODEL_DIR)
}

fn default_true() -> bool {
    true
}

/// Summary written ahead of the forest so it can be read on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub model_id: String,
    pub row_count: usize,
    pub feature_count: usize,
    pub trained_at: DateTime<Utc>,
}

impl ArtifactHeader {
    fn of(model: &TrainedModel) -> Self {
        Self {
            model_id: model.model_id.clone(),
            row_count: model.row_count,
            feature_count: model.feature_count,
            trained_at: model.trained_at,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    header: ArtifactHeader,
    model: &'a TrainedModel,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    header: ArtifactHeader,
    model: TrainedModel,
}

/// Leading fields of [`Envelope`]; decoding stops before the forest
#[derive(Deserialize)]
struct EnvelopePrefix {
    format_version: u32,
    header: ArtifactHeader,
}

/// Artifact store keyed by model id
#[derive(Debug, Clone)]
pub struct ModelStore {
    config: StorageConfig,
}

impl ModelStore {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Create with custom path and default options
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self::new(StorageConfig {
            model_dir: path.as_ref().to_path_buf(),
            ..StorageConfig::default()
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.config.model_dir
    }

    /// Create the storage directory
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.config.model_dir)?;
        debug!("Model storage ready at {:?}", self.config.model_dir);
        Ok(())
    }

    fn model_path(&self, model_id: &str) -> PathBuf {
        self.config
            .model_dir
            .join(format!("{}.{}", model_id, ARTIFACT_EXT))
    }

    fn backup_path(&self, model_id: &str) -> PathBuf {
        self.config
            .model_dir
            .join(format!("{}.{}.bak", model_id, ARTIFACT_EXT))
    }

    /// Write the artifact for `model.model_id`, replacing any previous one
    pub fn save(&self, model: &TrainedModel) -> Result<PathBuf> {
        validate_model_id(&model.model_id)?;
        self.init()?;

        let path = self.model_path(&model.model_id);
        // Leading dot keeps temp files out of list_models()
        let tmp_path = self.config.model_dir.join(format!(
            ".{}.{}.tmp",
            model.model_id,
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(e) = Self::write_artifact(&tmp_path, model) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        if self.config.keep_backup && path.exists() {
            if let Err(e) = fs::copy(&path, self.backup_path(&model.model_id)) {
                warn!("Failed to back up artifact {:?}: {}", path, e);
            }
        }

        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(EngineError::Persistence(format!(
                "failed to move artifact into place at {:?}: {}",
                path, e
            )));
        }
        self.sync_dir();

        info!("Saved model '{}' to {:?}", model.model_id, path);
        Ok(path)
    }

    fn write_artifact(path: &Path, model: &TrainedModel) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let envelope = EnvelopeRef {
            format_version: ARTIFACT_FORMAT_VERSION,
            header: ArtifactHeader::of(model),
            model,
        };
        bincode::serde::encode_into_std_write(&envelope, &mut writer, bincode::config::standard())?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .sync_all()?;
        Ok(())
    }

    fn sync_dir(&self) {
        // Not every platform can open a directory for syncing
        if let Ok(dir) = File::open(&self.config.model_dir) {
            let _ = dir.sync_all();
        }
    }

    /// Load the artifact for `model_id`; `Ok(None)` when nothing is stored
    pub fn load(&self, model_id: &str) -> Result<Option<TrainedModel>> {
        validate_model_id(model_id)?;
        let path = self.model_path(model_id);
        let backup = self.backup_path(model_id);

        if !path.exists() && !backup.exists() {
            debug!("No artifact for model '{}' at {:?}", model_id, path);
            return Ok(None);
        }

        if path.exists() {
            match Self::read_artifact(&path, model_id) {
                Ok(model) => {
                    info!("Loaded model '{}' from {:?}", model_id, path);
                    return Ok(Some(model));
                }
                Err(e) if backup.exists() => {
                    warn!("Failed to load {:?}: {}, trying backup", path, e);
                }
                Err(e) => return Err(e),
            }
        }

        let model = Self::read_artifact(&backup, model_id)?;
        info!("Restored model '{}' from backup {:?}", model_id, backup);
        Ok(Some(model))
    }

    fn read_artifact(path: &Path, model_id: &str) -> Result<TrainedModel> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let envelope: Envelope =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;

        Self::check_header(path, model_id, envelope.format_version, &envelope.header)?;
        if envelope.model.model_id != model_id {
            return Err(EngineError::Persistence(format!(
                "artifact {:?} belongs to model '{}'",
                path, envelope.model.model_id
            )));
        }
        Ok(envelope.model)
    }

    fn read_header(path: &Path, model_id: &str) -> Result<ArtifactHeader> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let prefix: EnvelopePrefix =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;

        Self::check_header(path, model_id, prefix.format_version, &prefix.header)?;
        Ok(prefix.header)
    }

    fn check_header(path: &Path, model_id: &str, format_version: u32, header: &ArtifactHeader) -> Result<()> {
        if format_version != ARTIFACT_FORMAT_VERSION {
            return Err(EngineError::Persistence(format!(
                "unsupported artifact format {} in {:?}",
                format_version, path
            )));
        }
        if header.model_id != model_id {
            return Err(EngineError::Persistence(format!(
                "artifact {:?} belongs to model '{}'",
                path, header.model_id
            )));
        }
        Ok(())
    }

    /// Read only the artifact header for `model_id`, without decoding the forest
    pub fn peek(&self, model_id: &str) -> Result<Option<ArtifactHeader>> {
        validate_model_id(model_id)?;
        let path = self.model_path(model_id);
        let backup = self.backup_path(model_id);

        if path.exists() {
            match Self::read_header(&path, model_id) {
                Ok(header) => return Ok(Some(header)),
                Err(e) if backup.exists() => {
                    debug!("Header of {:?} unreadable: {}, trying backup", path, e);
                }
                Err(e) => return Err(e),
            }
        } else if !backup.exists() {
            return Ok(None);
        }

        Self::read_header(&backup, model_id).map(Some)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        validate_model_id(model_id).is_ok() && self.model_path(model_id).exists()
    }

    /// Remove the artifact and its backup; returns whether anything existed
    pub fn delete(&self, model_id: &str) -> Result<bool> {
        validate_model_id(model_id)?;
        let mut removed = false;
        for path in [self.model_path(model_id), self.backup_path(model_id)] {
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }
        if removed {
            info!("Deleted artifacts for model '{}'", model_id);
        }
        Ok(removed)
    }

    /// List stored model ids
    pub fn list_models(&self) -> Result<Vec<String>> {
        let mut models = Vec::new();

        if !self.config.model_dir.exists() {
            return Ok(models);
        }

        for entry in fs::read_dir(&self.config.model_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == ARTIFACT_EXT).unwrap_or(false) {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    if validate_model_id(name).is_ok() {
                        models.push(name.to_string());
                    }
                }
            }
        }

        models.sort();
        Ok(models)
    }
}
