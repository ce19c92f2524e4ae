//! Publish Records - Catalog Lookup and Registration
//!
//! The pipeline never talks to a tracking service directly. It reads records
//! through [`PublishCatalog`] and records new artifacts through
//! [`PublishRegistrar`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::hashing::compute_registration_hash;
use crate::templates::normalize_separators;

pub type PublishId = u64;

/// Comment attached to every automated registration.
pub const AUTOMATED_COMMENT: &str = "Automated Asset Update";

/// Fields requested when resolving an embedded reference to its publish.
pub const REFERENCE_SEARCH_FIELDS: [&str; 5] = [
    "entity",
    "entity.Asset.sg_asset_type",
    "code",
    "name",
    "version_number",
];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Failed to write registration ledger {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registration rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Shot,
    Asset,
    #[serde(untagged)]
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Shot => "Shot",
            EntityKind::Asset => "Asset",
            EntityKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    /// Asset subtype, only meaningful for assets.
    #[serde(default)]
    pub asset_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
}

/// A published artifact as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub id: PublishId,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    /// Absolute local path of the published file.
    pub path: String,
    pub published_file_type: String,
    pub entity: EntityRef,
    #[serde(default)]
    pub task: Option<TaskRef>,
    /// Thumbnail reference: a local path or a `data:` URI.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub version_number: Option<u64>,
}

/// Read access to published artifacts.
pub trait PublishCatalog {
    /// Fetch a record by id.
    fn fetch(&self, id: PublishId) -> Result<Option<PublishRecord>, CatalogError>;

    /// Find the record published at `path`. `fields` names the attributes
    /// the caller needs populated.
    fn find_by_path(
        &self,
        path: &str,
        fields: &[&str],
    ) -> Result<Option<PublishRecord>, CatalogError>;
}

/// Context the new artifact is registered against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishContext {
    pub entity: EntityRef,
    pub task: Option<TaskRef>,
}

/// Everything needed to register a new published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRegistration {
    pub context: PublishContext,
    pub comment: String,
    /// Destination path with native separators.
    pub path: String,
    pub name: String,
    pub task: Option<TaskRef>,
    pub thumbnail_path: Option<PathBuf>,
    pub version_number: u64,
    pub published_file_type: String,
    /// SHA-256 of the published file contents.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPublish {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
}

/// Write access: records a new published artifact.
pub trait PublishRegistrar {
    fn register(
        &mut self,
        registration: &PublishRegistration,
    ) -> Result<RegisteredPublish, RegistrarError>;
}

/// Catalog backed by a JSON array of records.
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    records: Vec<PublishRecord>,
}

impl JsonCatalog {
    pub fn new(records: Vec<PublishRecord>) -> Self {
        Self { records }
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records = serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(records))
    }
}

impl PublishCatalog for JsonCatalog {
    fn fetch(&self, id: PublishId) -> Result<Option<PublishRecord>, CatalogError> {
        Ok(self.records.iter().find(|r| r.id == id).cloned())
    }

    fn find_by_path(
        &self,
        path: &str,
        _fields: &[&str],
    ) -> Result<Option<PublishRecord>, CatalogError> {
        let wanted = normalize_separators(path);
        Ok(self
            .records
            .iter()
            .find(|r| normalize_separators(&r.path) == wanted)
            .cloned())
    }
}

/// One line of the registration ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub registered: RegisteredPublish,
    pub registration: PublishRegistration,
}

/// Registrar appending each registration to a JSON-lines ledger file.
#[derive(Debug, Clone)]
pub struct LedgerRegistrar {
    path: PathBuf,
}

impl LedgerRegistrar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read back every entry written so far.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, RegistrarError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistrarError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(RegistrarError::from))
            .collect()
    }
}

impl PublishRegistrar for LedgerRegistrar {
    fn register(
        &mut self,
        registration: &PublishRegistration,
    ) -> Result<RegisteredPublish, RegistrarError> {
        let registered = RegisteredPublish {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            fingerprint: compute_registration_hash(registration)?,
        };
        let entry = LedgerEntry {
            registered: registered.clone(),
            registration: registration.clone(),
        };

        let io_err = |source| RegistrarError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?).map_err(io_err)?;

        Ok(registered)
    }
}
