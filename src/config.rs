//! Configuration System - Updater Settings
//!
//! Loaded from a JSON file. Every field has a default except the storage
//! root, keys and templates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::templates::{normalize_separators, TemplateError, TemplateKey, TemplateRegistry};
use crate::ENGINE_VERSION;

pub const DEFAULT_CONFIG_FILE: &str = "publish-updater.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Config requires engine >= {required}, current is {current}")]
    EngineVersionMismatch { required: String, current: String },

    #[error("Invalid version in config: {0}")]
    InvalidVersion(String),

    #[error("Work template {0} is not defined")]
    MissingWorkTemplate(String),

    #[error("Invalid reference root pattern: {0}")]
    ReferencePattern(#[from] regex::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// What happens when rewriting, registering or copying fails for a record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and continue with the next record.
    #[default]
    SkipRecord,
    /// Stop the batch and return the error.
    AbortBatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub engine_min_version: String,
    /// Storage root every template is relative to.
    pub primary_root: String,
    /// Directory embedded references must start with. Defaults to the parent of `primary_root`.
    pub reference_root: Option<String>,
    pub keys: BTreeMap<String, TemplateKey>,
    pub templates: BTreeMap<String, String>,
    pub shot_work_template: String,
    pub asset_work_template: String,
    /// The only published type that can be updated.
    pub published_file_type: String,
    /// Extension of that type, without the leading dot.
    pub file_extension: String,
    pub comment: String,
    pub failure_policy: FailurePolicy,
    pub deny_permissions: Vec<String>,
    pub deny_platforms: Vec<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            engine_min_version: crate::MIN_CONFIG_ENGINE_VERSION.to_string(),
            primary_root: String::new(),
            reference_root: None,
            keys: BTreeMap::new(),
            templates: BTreeMap::new(),
            shot_work_template: "template_shot_work".to_string(),
            asset_work_template: "template_asset_work".to_string(),
            published_file_type: "Maya Scene".to_string(),
            file_extension: "ma".to_string(),
            comment: crate::publish::AUTOMATED_COMMENT.to_string(),
            failure_policy: FailurePolicy::default(),
            deny_permissions: Vec::new(),
            deny_platforms: Vec::new(),
        }
    }
}

impl UpdaterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.check_engine_version()?;
        Ok(config)
    }

    /// Load `path`, or `publish-updater.json` in the working directory.
    pub fn load_or_default_location(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::load(Path::new(DEFAULT_CONFIG_FILE)),
        }
    }

    pub fn check_engine_version(&self) -> Result<(), ConfigError> {
        let engine = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| ConfigError::InvalidVersion(ENGINE_VERSION.to_string()))?;
        let required = semver::Version::parse(&self.engine_min_version)
            .map_err(|_| ConfigError::InvalidVersion(self.engine_min_version.clone()))?;

        if engine < required {
            return Err(ConfigError::EngineVersionMismatch {
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            });
        }
        Ok(())
    }

    /// Root that embedded references are matched against, with forward slashes.
    pub fn reference_root(&self) -> String {
        if let Some(root) = &self.reference_root {
            return normalize_separators(root).trim_end_matches('/').to_string();
        }
        let primary = normalize_separators(&self.primary_root);
        let primary = primary.trim_end_matches('/');
        match primary.rfind('/') {
            Some(0) => "/".to_string(),
            Some(index) => primary[..index].to_string(),
            None => primary.to_string(),
        }
    }

    /// Compile every configured template and check the work templates exist.
    pub fn build_registry(&self) -> Result<TemplateRegistry, ConfigError> {
        let mut registry = TemplateRegistry::new(&self.primary_root, self.keys.clone());
        for (name, definition) in &self.templates {
            registry.register(name, definition)?;
        }
        for work in [&self.shot_work_template, &self.asset_work_template] {
            if registry.get(work).is_none() {
                return Err(ConfigError::MissingWorkTemplate(work.clone()));
            }
        }
        Ok(registry)
    }

    /// Descriptor the host uses to expose the update command.
    pub fn command(&self) -> CommandDescriptor {
        CommandDescriptor {
            name: "update_publish".to_string(),
            title: "Update the assets in this file".to_string(),
            entity_types: vec!["PublishedFile".to_string()],
            deny_permissions: self.deny_permissions.clone(),
            deny_platforms: self.deny_platforms.clone(),
            supports_multiple_selection: true,
        }
    }
}

/// How the update command is offered to users. Permissions are passed
/// through untouched; the host enforces them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    pub title: String,
    pub entity_types: Vec<String>,
    pub deny_permissions: Vec<String>,
    pub deny_platforms: Vec<String>,
    pub supports_multiple_selection: bool,
}
