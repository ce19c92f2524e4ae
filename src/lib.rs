//! Publish Updater Core - Reference Refresh and Republish
//!
//! # The Five Rules
//! 1. Templates Describe Paths
//! 2. Latest Is Read From Disk, Never Cached
//! 3. Preconditions Before Writes
//! 4. Existing Publishes Are Never Overwritten
//! 5. Lines Without A Stale Reference Pass Through Untouched

pub mod config;
pub mod hashing;
pub mod pipeline;
pub mod publish;
pub mod rewrite;
pub mod templates;
pub mod thumbnail;
pub mod validation;
pub mod versions;

pub use config::{CommandDescriptor, ConfigError, FailurePolicy, UpdaterConfig};
pub use hashing::{canonical_json, compute_registration_hash, sha256_file};
pub use pipeline::{BatchReport, PipelineError, RecordOutcome, UpdatePipeline, UpdatePlan};
pub use publish::{PublishCatalog, PublishRecord, PublishRegistrar, PublishRegistration};
pub use rewrite::{QuotedPathMatcher, ReferenceMatcher, ReferenceRewriter, RewriteError};
pub use templates::{FieldSet, FieldValue, PathTemplate, TemplateError, TemplateRegistry};
pub use validation::{PreconditionKind, PreconditionViolation, Validator};
pub use versions::{DiskVersionLookup, InMemoryVersionLookup, VersionLookup};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_CONFIG_ENGINE_VERSION: &str = "1.0.0";
