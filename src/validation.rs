//! Precondition System - Record Gatekeeping
//!
//! Rules inspect a publish record before anything is written. The first
//! failing rule decides why the record is skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::publish::{EntityKind, PublishRecord};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionKind {
    UnsupportedEntity,
    MissingSourceFile,
    UnsupportedPublishedType,
    UnsupportedExtension,
    MissingTemplate,
    MissingVersionField,
    DestinationExists,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreconditionViolation {
    pub kind: PreconditionKind,
    pub rule: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl PreconditionViolation {
    pub fn unsupported_entity(kind: &str) -> Self {
        Self {
            kind: PreconditionKind::UnsupportedEntity,
            rule: "entity_kind".to_string(),
            message: "This file is not associated with a shot or an asset!".to_string(),
            expected: Some("Shot or Asset".to_string()),
            actual: Some(kind.to_string()),
        }
    }

    pub fn missing_template(path: &str) -> Self {
        Self {
            kind: PreconditionKind::MissingTemplate,
            rule: "template".to_string(),
            message: format!("The file associated with this publish, {}, has no template", path),
            expected: None,
            actual: Some(path.to_string()),
        }
    }

    pub fn missing_version(path: &str, template: &str) -> Self {
        Self {
            kind: PreconditionKind::MissingVersionField,
            rule: "version_field".to_string(),
            message: format!(
                "The file associated with this publish, {}, has no version number",
                path
            ),
            expected: Some(format!("version field in template {}", template)),
            actual: Some(path.to_string()),
        }
    }

    pub fn destination_exists(path: &str) -> Self {
        Self {
            kind: PreconditionKind::DestinationExists,
            rule: "destination".to_string(),
            message: format!("Publish file {} already exists!", path),
            expected: None,
            actual: Some(path.to_string()),
        }
    }
}

impl fmt::Display for PreconditionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Precondition rule trait - yields a violation or nothing
pub trait PreconditionRule {
    fn name(&self) -> &'static str;
    fn check(&self, record: &PublishRecord) -> Option<PreconditionViolation>;
}

// --- Concrete Rules ---

pub struct EntityKindRule;

impl PreconditionRule for EntityKindRule {
    fn name(&self) -> &'static str { "entity_kind" }

    fn check(&self, record: &PublishRecord) -> Option<PreconditionViolation> {
        match record.entity.kind {
            EntityKind::Shot | EntityKind::Asset => None,
            EntityKind::Other(ref kind) => Some(PreconditionViolation::unsupported_entity(kind)),
        }
    }
}

pub struct SourceExistsRule;

impl PreconditionRule for SourceExistsRule {
    fn name(&self) -> &'static str { "source_exists" }

    fn check(&self, record: &PublishRecord) -> Option<PreconditionViolation> {
        if Path::new(&record.path).exists() {
            return None;
        }
        Some(PreconditionViolation {
            kind: PreconditionKind::MissingSourceFile,
            rule: self.name().to_string(),
            message: format!(
                "The file associated with this publish, {}, cannot be found on disk!",
                record.path
            ),
            expected: None,
            actual: Some(record.path.clone()),
        })
    }
}

pub struct PublishedTypeRule {
    pub supported: String,
}

impl PreconditionRule for PublishedTypeRule {
    fn name(&self) -> &'static str { "published_type" }

    fn check(&self, record: &PublishRecord) -> Option<PreconditionViolation> {
        if record.published_file_type == self.supported {
            return None;
        }
        Some(PreconditionViolation {
            kind: PreconditionKind::UnsupportedPublishedType,
            rule: self.name().to_string(),
            message: format!(
                "The type file associated with this publish, {}, cannot be updated!",
                record.published_file_type
            ),
            expected: Some(self.supported.clone()),
            actual: Some(record.published_file_type.clone()),
        })
    }
}

pub struct ExtensionRule {
    /// Extension without the leading dot.
    pub extension: String,
}

impl PreconditionRule for ExtensionRule {
    fn name(&self) -> &'static str { "extension" }

    fn check(&self, record: &PublishRecord) -> Option<PreconditionViolation> {
        let actual = Path::new(&record.path)
            .extension()
            .map(|e| e.to_string_lossy().into_owned());
        if actual.as_deref() == Some(self.extension.as_str()) {
            return None;
        }
        Some(PreconditionViolation {
            kind: PreconditionKind::UnsupportedExtension,
            rule: self.name().to_string(),
            message: format!("Only {} files can be updated!", self.extension),
            expected: Some(format!(".{}", self.extension)),
            actual: actual.map(|e| format!(".{}", e)),
        })
    }
}

/// Validator runs rules in order and stops at the first violation
pub struct Validator {
    rules: Vec<Box<dyn PreconditionRule>>,
}

impl Validator {
    pub fn new(published_file_type: &str, file_extension: &str) -> Self {
        Self {
            rules: vec![
                Box::new(EntityKindRule),
                Box::new(SourceExistsRule),
                Box::new(PublishedTypeRule {
                    supported: published_file_type.to_string(),
                }),
                Box::new(ExtensionRule {
                    extension: file_extension.trim_start_matches('.').to_string(),
                }),
            ],
        }
    }

    pub fn validate(&self, record: &PublishRecord) -> Result<(), PreconditionViolation> {
        match self.rules.iter().find_map(|rule| rule.check(record)) {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new("Maya Scene", "ma")
    }
}
