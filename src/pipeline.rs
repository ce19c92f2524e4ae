//! Update Pipeline - Single Entry Point
//!
//! Every record goes through the same steps: validate, plan the next version,
//! rewrite references into the publish path, register, copy to the work path.
//! Nothing is written for a record until every precondition has passed.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, FailurePolicy, UpdaterConfig};
use crate::hashing::sha256_file;
use crate::publish::{
    CatalogError, EntityKind, PublishCatalog, PublishContext, PublishId, PublishRecord,
    PublishRegistrar, PublishRegistration, RegisteredPublish, RegistrarError,
};
use crate::rewrite::{QuotedPathMatcher, ReferenceMatcher, ReferenceRewriter, RewriteError, RewriteReport};
use crate::templates::{
    normalize_separators, to_native_separators, FieldSet, FieldValue, KeyKind, PathTemplate,
    TemplateError, TemplateRegistry, SKIP_KEYS, VERSION_KEY,
};
use crate::thumbnail;
use crate::validation::{PreconditionKind, PreconditionViolation, Validator};
use crate::versions::{DiskVersionLookup, VersionLookup};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Publish record {0} not found")]
    RecordNotFound(PublishId),

    #[error("{0}")]
    Precondition(PreconditionViolation),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Rewrite failed: {0}")]
    Rewrite(RewriteError),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrarError),

    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Errors raised before anything is written. The record is skipped.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            PipelineError::RecordNotFound(_)
                | PipelineError::Precondition(_)
                | PipelineError::Template(_)
                | PipelineError::Catalog(_)
        )
    }

    pub fn precondition_kind(&self) -> Option<PreconditionKind> {
        match self {
            PipelineError::Precondition(violation) => Some(violation.kind),
            _ => None,
        }
    }
}

impl From<RewriteError> for PipelineError {
    fn from(err: RewriteError) -> Self {
        match err {
            RewriteError::DestinationExists(path) => PipelineError::Precondition(
                PreconditionViolation::destination_exists(&normalize_separators(
                    &path.to_string_lossy(),
                )),
            ),
            other => PipelineError::Rewrite(other),
        }
    }
}

/// Where a record's update will be written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatePlan {
    pub source_path: String,
    pub template: String,
    /// Publish path for the new version, forward slashes.
    pub destination_path: String,
    /// Next work file version the result is copied to.
    pub work_path: String,
    pub version_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedPublish {
    pub plan: UpdatePlan,
    pub registered: RegisteredPublish,
    pub rewrite: RewriteReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Updated(UpdatedPublish),
    Skipped {
        reason: String,
        precondition: Option<PreconditionKind>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordReport {
    pub id: PublishId,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    pub fn updated(&self) -> impl Iterator<Item = &UpdatedPublish> {
        self.records.iter().filter_map(|r| match &r.outcome {
            RecordOutcome::Updated(updated) => Some(updated),
            _ => None,
        })
    }

    pub fn all_updated(&self) -> bool {
        self.records
            .iter()
            .all(|r| matches!(r.outcome, RecordOutcome::Updated(_)))
    }
}

/// Template, fields and latest version resolved for one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathInspection {
    pub path: String,
    pub template: String,
    pub fields: FieldSet,
    pub latest_version: u64,
}

/// The update pipeline - single entry point for republishing records
pub struct UpdatePipeline {
    registry: TemplateRegistry,
    validator: Validator,
    versions: Box<dyn VersionLookup>,
    matcher: Box<dyn ReferenceMatcher>,
    shot_work_template: String,
    asset_work_template: String,
    comment: String,
    failure_policy: FailurePolicy,
}

impl UpdatePipeline {
    /// Pipeline scanning the real filesystem and matching quoted paths
    /// under the configured reference root.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, ConfigError> {
        let registry = config.build_registry()?;
        let matcher = QuotedPathMatcher::new(&config.reference_root())?;
        Ok(Self {
            registry,
            validator: Validator::new(&config.published_file_type, &config.file_extension),
            versions: Box::new(DiskVersionLookup::new()),
            matcher: Box::new(matcher),
            shot_work_template: config.shot_work_template.clone(),
            asset_work_template: config.asset_work_template.clone(),
            comment: config.comment.clone(),
            failure_policy: config.failure_policy,
        })
    }

    pub fn with_version_lookup(mut self, versions: Box<dyn VersionLookup>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_matcher(mut self, matcher: Box<dyn ReferenceMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Rewriter sharing this pipeline's templates, lookup and matcher.
    pub fn rewriter<'a>(&'a self, catalog: &'a dyn PublishCatalog) -> ReferenceRewriter<'a> {
        ReferenceRewriter::new(
            &self.registry,
            self.versions.as_ref(),
            self.matcher.as_ref(),
            catalog,
        )
    }

    /// Resolve the template of `path` and the latest version of its family.
    pub fn inspect_path(&self, path: &str) -> Result<PathInspection, PipelineError> {
        let path = normalize_separators(path);
        let (template, fields) = self.template_fields(&path)?;
        let latest_version = self.versions.latest_version(template, &fields, &SKIP_KEYS)?;
        Ok(PathInspection {
            template: template.name().to_string(),
            path,
            fields,
            latest_version,
        })
    }

    /// Update every record in `ids`, one after another.
    ///
    /// Precondition failures skip the record. Failures while rewriting,
    /// registering or copying follow the configured [`FailurePolicy`].
    pub fn update_publish(
        &self,
        ids: &[PublishId],
        catalog: &dyn PublishCatalog,
        registrar: &mut dyn PublishRegistrar,
    ) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport::default();

        for &id in ids {
            let outcome = match self.update_record(id, catalog, registrar) {
                Ok(updated) => RecordOutcome::Updated(updated),
                Err(err) if err.is_precondition() => {
                    error!(publish_id = id, "{}", err);
                    RecordOutcome::Skipped {
                        reason: err.to_string(),
                        precondition: err.precondition_kind(),
                    }
                }
                Err(err) => match self.failure_policy {
                    FailurePolicy::SkipRecord => {
                        error!(publish_id = id, "Failed to update publish: {}", err);
                        RecordOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                    FailurePolicy::AbortBatch => {
                        error!(publish_id = id, "Aborting batch: {}", err);
                        return Err(err);
                    }
                },
            };
            report.records.push(RecordReport { id, outcome });
        }

        info!("done");
        Ok(report)
    }

    /// Update a single record.
    pub fn update_record(
        &self,
        id: PublishId,
        catalog: &dyn PublishCatalog,
        registrar: &mut dyn PublishRegistrar,
    ) -> Result<UpdatedPublish, PipelineError> {
        let record = catalog
            .fetch(id)?
            .ok_or(PipelineError::RecordNotFound(id))?;
        self.validator
            .validate(&record)
            .map_err(PipelineError::Precondition)?;
        let plan = self.plan(&record)?;

        // Removed from disk when this function returns, whatever the outcome.
        let thumbnail = match thumbnail::stage(record.image.as_deref()) {
            Ok(staged) => staged,
            Err(err) => {
                warn!(publish_id = id, "Could not stage thumbnail: {}", err);
                None
            }
        };

        let destination = PathBuf::from(&plan.destination_path);
        let rewrite = self
            .rewriter(catalog)
            .rewrite_file(Path::new(&plan.source_path), &destination)?;

        let registration = PublishRegistration {
            context: PublishContext {
                entity: record.entity.clone(),
                task: record.task.clone(),
            },
            comment: self.comment.clone(),
            path: to_native_separators(&plan.destination_path),
            name: record.name.clone(),
            task: record.task.clone(),
            thumbnail_path: thumbnail.as_ref().map(|t| t.path().to_path_buf()),
            version_number: plan.version_number,
            published_file_type: record.published_file_type.clone(),
            checksum: sha256_file(&destination)?,
        };
        let registered = registrar.register(&registration)?;

        copy_to_work_path(&destination, Path::new(&plan.work_path))?;

        info!(
            publish_id = id,
            version = plan.version_number,
            updated_references = rewrite.updates.len(),
            "Published {}",
            plan.destination_path
        );
        Ok(UpdatedPublish {
            plan,
            registered,
            rewrite,
        })
    }

    /// Resolve template, versions and output paths for `record` without writing anything.
    pub fn plan(&self, record: &PublishRecord) -> Result<UpdatePlan, PipelineError> {
        let source_path = normalize_separators(&record.path);
        let (template, mut fields) = self.template_fields(&source_path)?;
        let work_template = self.work_template(&record.entity.kind)?;

        let latest = self
            .versions
            .latest_version(work_template, &fields, &SKIP_KEYS)?;

        fields.insert(VERSION_KEY.to_string(), FieldValue::Int(latest));
        let destination_path = normalize_separators(&template.apply_fields(&fields)?);
        if Path::new(&destination_path).exists() {
            return Err(PipelineError::Precondition(
                PreconditionViolation::destination_exists(&destination_path),
            ));
        }

        let next = latest
            .checked_add(1)
            .ok_or_else(|| TemplateError::InvalidValue {
                key: VERSION_KEY.to_string(),
                value: latest.to_string(),
                kind: KeyKind::Int,
            })?;
        fields.insert(VERSION_KEY.to_string(), FieldValue::Int(next));
        let work_path = normalize_separators(&work_template.apply_fields(&fields)?);

        Ok(UpdatePlan {
            source_path,
            template: template.name().to_string(),
            destination_path,
            work_path,
            version_number: latest,
        })
    }

    fn template_fields(&self, path: &str) -> Result<(&PathTemplate, FieldSet), PipelineError> {
        let missing_template =
            || PipelineError::Precondition(PreconditionViolation::missing_template(path));

        let template = self
            .registry
            .template_from_path(path)?
            .ok_or_else(missing_template)?;
        let fields = template.get_fields(path).ok_or_else(missing_template)?;
        if !fields.contains_key(VERSION_KEY) {
            return Err(PipelineError::Precondition(
                PreconditionViolation::missing_version(path, template.name()),
            ));
        }
        Ok((template, fields))
    }

    fn work_template(&self, kind: &EntityKind) -> Result<&PathTemplate, PipelineError> {
        let name = match kind {
            EntityKind::Shot => &self.shot_work_template,
            EntityKind::Asset => &self.asset_work_template,
            EntityKind::Other(kind) => {
                return Err(PipelineError::Precondition(
                    PreconditionViolation::unsupported_entity(kind),
                ))
            }
        };
        self.registry.get(name).ok_or_else(|| {
            PipelineError::Precondition(PreconditionViolation::missing_template(name))
        })
    }
}

fn copy_to_work_path(from: &Path, to: &Path) -> Result<(), PipelineError> {
    let copy_err = |source| PipelineError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(copy_err)?;
    }
    fs::copy(from, to).map_err(copy_err)?;
    Ok(())
}
