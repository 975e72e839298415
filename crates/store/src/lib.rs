//! Write-through persistence for plan documents.
//!
//! [`PlanStore`] owns one plan file and its parsed [`PipelineDocument`].
//! Every status setter updates the in-memory document and then rewrites the
//! whole file before returning, so a crash never loses a completed entity.
//! Writes go to a temporary sibling file that is renamed over the plan.

use std::io::Write;
use std::path::{Path, PathBuf};

use storyloom_core::error::CoreError;
use storyloom_core::plan::{EntityKey, PipelineDocument, PlanVersion, ValidationResult};
use storyloom_core::status::Status;

/// Errors from loading or persisting a plan.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read plan {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write plan {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Plan {path} is not a valid document: {source}")]
    Parse {
        path: String,
        #[source]
        source: CoreError,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// A loaded plan bound to its file.
#[derive(Debug)]
pub struct PlanStore {
    path: PathBuf,
    document: PipelineDocument,
}

impl PlanStore {
    /// Load and classify the plan at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let document =
            PipelineDocument::from_json_str(&text).map_err(|source| StoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        tracing::info!(
            path = %path.display(),
            project = document.project_name(),
            version = %document.version(),
            "Plan loaded",
        );
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory that relative plan paths resolve against.
    pub fn base_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Absolute-or-relative location of a plan path on disk.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.base_dir().join(relative)
    }

    pub fn document(&self) -> &PipelineDocument {
        &self.document
    }

    pub fn version(&self) -> PlanVersion {
        self.document.version()
    }

    pub fn validate(&self) -> ValidationResult {
        self.document.validate()
    }

    // -----------------------------------------------------------------------
    // Status setters (each persists before returning)
    // -----------------------------------------------------------------------

    pub fn set_asset_status(&mut self, id: &str, status: Status) -> Result<(), StoreError> {
        let kind = self
            .document
            .assets
            .find(id)
            .ok_or_else(|| not_found("asset", id))?;
        self.set_status(
            &EntityKey::Asset {
                kind,
                id: id.to_string(),
            },
            status,
        )
    }

    /// Keyframe by its own id; a v2 top-level keyframe also answers to
    /// `first_keyframe`.
    pub fn set_keyframe_status(&mut self, id: &str, status: Status) -> Result<(), StoreError> {
        let key = self
            .document
            .locate_keyframe(id)
            .ok_or_else(|| not_found("keyframe", id))?;
        self.set_status(&key, status)
    }

    pub fn set_video_status(&mut self, id: &str, status: Status) -> Result<(), StoreError> {
        self.set_status(&EntityKey::Video(id.to_string()), status)
    }

    /// Stored scene status. Only v2 scenes store one.
    pub fn set_scene_status(&mut self, id: &str, status: Status) -> Result<(), StoreError> {
        self.set_status(&EntityKey::Scene(id.to_string()), status)
    }

    pub fn set_segment_status(&mut self, id: &str, status: Status) -> Result<(), StoreError> {
        match self.document.locate(id) {
            Some(key @ EntityKey::Segment { .. }) => self.set_status(&key, status),
            _ => Err(not_found("segment", id)),
        }
    }

    pub fn set_final_video_status(&mut self, status: Status) -> Result<(), StoreError> {
        self.set_status(&EntityKey::FinalVideo, status)
    }

    /// Apply a checked transition and persist.
    pub fn set_status(&mut self, key: &EntityKey, status: Status) -> Result<(), StoreError> {
        let previous = self.document.set_status(key, status)?;
        tracing::debug!(entity = %key, from = %previous, to = %status, "Status updated");
        self.save()
    }

    /// Operator reset to `pending` for regeneration, then persist.
    pub fn reset(&mut self, key: &EntityKey) -> Result<(), StoreError> {
        let previous = self.document.reset_status(key)?;
        tracing::info!(entity = %key, from = %previous, "Status reset for regeneration");
        self.save()
    }

    /// Serialize the whole document to a sibling temp file and rename it
    /// over the plan.
    pub fn save(&self) -> Result<(), StoreError> {
        let write_err = |source: std::io::Error| StoreError::Write {
            path: self.path.display().to_string(),
            source,
        };

        let mut text = self.document.to_json_pretty()?;
        text.push('\n');

        let mut tmp = tempfile::Builder::new()
            .prefix(".plan-")
            .suffix(".tmp")
            .tempfile_in(self.base_dir())
            .map_err(write_err)?;
        tmp.write_all(text.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

fn not_found(entity: &'static str, id: &str) -> StoreError {
    StoreError::Core(CoreError::NotFound {
        entity,
        id: id.to_string(),
    })
}
