//! Contract Invariant Tests
//!
//! These tests verify the guarantees of the update pipeline end to end.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use publish_updater::{
    config::{FailurePolicy, UpdaterConfig},
    pipeline::RecordOutcome,
    publish::{
        EntityKind, EntityRef, JsonCatalog, LedgerRegistrar, PublishRecord, PublishRegistrar,
        PublishRegistration, RegisteredPublish, RegistrarError, TaskRef,
    },
    rewrite::{ReferenceMatch, ReferenceMatcher},
    templates::{normalize_separators, FieldSet, FieldValue, TemplateKey, SKIP_KEYS},
    validation::PreconditionKind,
    versions::{InMemoryVersionLookup, VersionLookup},
    ReferenceRewriter, UpdatePipeline,
};
use tempfile::TempDir;

/// Registrar that remembers every request and can be told to refuse them.
#[derive(Default)]
struct RecordingRegistrar {
    registrations: Vec<PublishRegistration>,
    reject: bool,
}

impl PublishRegistrar for RecordingRegistrar {
    fn register(
        &mut self,
        registration: &PublishRegistration,
    ) -> Result<RegisteredPublish, RegistrarError> {
        if self.reject {
            return Err(RegistrarError::Rejected("service unavailable".to_string()));
        }
        self.registrations.push(registration.clone());
        Ok(RegisteredPublish {
            id: uuid::Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            fingerprint: format!("recorded-{}", self.registrations.len()),
        })
    }
}

/// Finds a single-quoted path, as written by script-style scene formats.
struct SingleQuotedMatcher;

impl ReferenceMatcher for SingleQuotedMatcher {
    fn find<'l>(&self, line: &'l str) -> Option<ReferenceMatch<'l>> {
        let start = line.find('\'')? + 1;
        let end = start + line[start..].find('\'')?;
        Some(ReferenceMatch {
            prefix: &line[..start],
            path: &line[start..end],
            suffix: &line[end..],
        })
    }
}

/// Project laid out on disk:
///
/// ```text
/// <tmp>/show/shots/sh010/work/sh010_v001.ma .. v003
/// <tmp>/show/shots/sh010/publish/sh010_v001.ma   (references hero v001)
/// <tmp>/show/assets/hero/publish/hero_v001.ma, hero_v004.ma
/// ```
struct Project {
    dir: TempDir,
    root: String,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_separators(&dir.path().join("show").to_string_lossy());
        let project = Self { dir, root };

        for version in 1..=3 {
            project.write(&format!("shots/sh010/work/sh010_v{:03}.ma", version), "//work\n");
        }
        project.write("assets/hero/publish/hero_v001.ma", "//hero\n");
        project.write("assets/hero/publish/hero_v004.ma", "//hero\n");
        project.write(
            "shots/sh010/publish/sh010_v001.ma",
            &format!(
                "//Maya ASCII 2020 scene\nrequires maya \"2020\";\nfile -rdi 1 -ns \"hero\" -rfn \"heroRN\" \"{}/assets/hero/publish/hero_v001.ma\";\ncreateNode transform -n \"cam\";\n",
                project.root
            ),
        );
        project
    }

    fn path(&self, relative: &str) -> String {
        format!("{}/{}", self.root, relative)
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        fs::create_dir_all(Path::new(&path).parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn config(&self) -> UpdaterConfig {
        let mut keys = BTreeMap::new();
        keys.insert("Shot".to_string(), TemplateKey::string());
        keys.insert("Asset".to_string(), TemplateKey::string());
        keys.insert("version".to_string(), TemplateKey::int(Some("03")));
        let mut templates = BTreeMap::new();
        for (name, definition) in [
            ("template_shot_work", "shots/{Shot}/work/{Shot}_v{version}.ma"),
            ("template_asset_work", "assets/{Asset}/work/{Asset}_v{version}.ma"),
            ("shot_publish", "shots/{Shot}/publish/{Shot}_v{version}.ma"),
            ("asset_publish", "assets/{Asset}/publish/{Asset}_v{version}.ma"),
            ("shot_notes", "shots/{Shot}/notes/{Shot}_notes.ma"),
        ] {
            templates.insert(name.to_string(), definition.to_string());
        }
        UpdaterConfig {
            primary_root: self.root.clone(),
            keys,
            templates,
            ..UpdaterConfig::default()
        }
    }

    fn record(&self, id: u64, relative: &str, kind: EntityKind) -> PublishRecord {
        PublishRecord {
            id,
            name: format!("record {}", id),
            code: None,
            path: self.path(relative),
            published_file_type: "Maya Scene".to_string(),
            entity: EntityRef {
                kind,
                id: 100 + id,
                name: None,
                asset_type: None,
            },
            task: Some(TaskRef {
                id: 7,
                name: Some("layout".to_string()),
            }),
            image: None,
            version_number: Some(1),
        }
    }

    fn catalog(&self, extra: Vec<PublishRecord>) -> JsonCatalog {
        let mut records = vec![
            self.record(1, "shots/sh010/publish/sh010_v001.ma", EntityKind::Shot),
            self.record(50, "assets/hero/publish/hero_v001.ma", EntityKind::Asset),
        ];
        records.extend(extra);
        JsonCatalog::new(records)
    }

    fn pipeline(&self) -> UpdatePipeline {
        UpdatePipeline::from_config(&self.config()).unwrap()
    }
}

#[test]
fn invariant_latest_version_is_max_or_zero() {
    let project = Project::new();
    let pipeline = project.pipeline();
    let template = pipeline.registry().get("template_shot_work").unwrap();

    let mut fields = FieldSet::new();
    fields.insert("Shot".to_string(), FieldValue::from("sh010"));
    fields.insert("version".to_string(), FieldValue::Int(1));

    let empty = InMemoryVersionLookup::new();
    assert_eq!(empty.latest_version(template, &fields, &SKIP_KEYS).unwrap(), 0);

    let shuffled = InMemoryVersionLookup::with_paths([
        project.path("shots/sh010/work/sh010_v002.ma"),
        project.path("shots/sh010/work/sh010_v010.ma"),
        project.path("shots/sh010/work/sh010_v003.ma"),
    ]);
    assert_eq!(shuffled.latest_version(template, &fields, &SKIP_KEYS).unwrap(), 10);

    // Read from disk on every call.
    let work = project.path("shots/sh010/work/sh010_v001.ma");
    assert_eq!(pipeline.inspect_path(&work).unwrap().latest_version, 3);
    project.write("shots/sh010/work/sh010_v008.ma", "");
    assert_eq!(pipeline.inspect_path(&work).unwrap().latest_version, 8);
}

#[test]
fn invariant_rewrite_points_at_latest_and_is_idempotent() {
    let project = Project::new();
    let pipeline = project.pipeline();
    let latest = project.record(51, "assets/hero/publish/hero_v004.ma", EntityKind::Asset);
    let catalog = project.catalog(vec![latest]);
    let rewriter: ReferenceRewriter = pipeline.rewriter(&catalog);

    let stale = format!("file -r \"{}\";\n", project.path("assets/hero/publish/hero_v001.ma"));
    let (once, report) = rewriter.rewrite_lines([stale.as_str()]).unwrap();
    assert_eq!(
        once[0],
        format!("file -r \"{}\";\n", project.path("assets/hero/publish/hero_v004.ma"))
    );
    assert_eq!(report.updates[0].latest_version, 4);

    let (twice, report) = rewriter.rewrite_lines(once.iter()).unwrap();
    assert_eq!(twice, once);
    assert!(report.updates.is_empty());
}

#[test]
fn invariant_lines_without_references_pass_through() {
    let project = Project::new();
    let pipeline = project.pipeline();
    let catalog = project.catalog(vec![]);
    let rewriter = pipeline.rewriter(&catalog);

    let input = "//Maya ASCII\r\n\nrequires maya \"2020\";\n   trailing   \n\"/elsewhere/x_v001.ma\";";
    let mut output = Vec::new();
    let report = rewriter.rewrite(input.as_bytes(), &mut output).unwrap();
    assert_eq!(output, input.as_bytes());
    assert_eq!(report.lines, 5);
}

#[test]
fn invariant_update_publishes_registers_and_copies() {
    let project = Project::new();
    let pipeline = project.pipeline();
    let catalog = project.catalog(vec![]);
    let mut registrar = RecordingRegistrar::default();

    let report = pipeline.update_publish(&[1], &catalog, &mut registrar).unwrap();
    assert!(report.all_updated());

    // Latest work version is 3: publish at v003, work copy at v004.
    let destination = project.path("shots/sh010/publish/sh010_v003.ma");
    let work = project.path("shots/sh010/work/sh010_v004.ma");
    let published = fs::read_to_string(&destination).unwrap();
    assert!(published.contains("hero_v004.ma"));
    assert!(!published.contains("hero_v001.ma"));
    assert!(published.starts_with("//Maya ASCII 2020 scene\n"));
    assert_eq!(fs::read_to_string(&work).unwrap(), published);

    assert_eq!(registrar.registrations.len(), 1);
    let registration = &registrar.registrations[0];
    assert_eq!(registration.version_number, 3);
    assert_eq!(registration.comment, "Automated Asset Update");
    assert_eq!(registration.published_file_type, "Maya Scene");
    assert_eq!(normalize_separators(&registration.path), destination);
    assert_eq!(registration.context.entity.kind, EntityKind::Shot);
    assert_eq!(registration.checksum.len(), 64);

    let updated: Vec<_> = report.updated().collect();
    assert_eq!(updated[0].rewrite.updates.len(), 1);
    assert_eq!(updated[0].plan.work_path, work);
}

#[test]
fn invariant_unsupported_entity_skips_without_side_effects() {
    let project = Project::new();
    let pipeline = project.pipeline();
    let sequence = project.record(
        2,
        "shots/sh010/publish/sh010_v001.ma",
        EntityKind::Other("Sequence".to_string()),
    );
    let catalog = project.catalog(vec![sequence]);
    let mut registrar = RecordingRegistrar::default();

    let report = pipeline
        .update_publish(&[2, 1], &catalog, &mut registrar)
        .unwrap();

    assert!(matches!(
        report.records[0].outcome,
        RecordOutcome::Skipped {
            precondition: Some(PreconditionKind::UnsupportedEntity),
            ..
        }
    ));
    // The next record is still processed.
    assert!(matches!(report.records[1].outcome, RecordOutcome::Updated(_)));
    assert_eq!(registrar.registrations.len(), 1);
}

#[test]
fn invariant_unsupported_type_and_extension_skip() {
    let project = Project::new();
    project.write("shots/sh010/publish/sh010_v001.abc", "cache");
    let pipeline = project.pipeline();

    let mut alembic = project.record(3, "shots/sh010/publish/sh010_v001.ma", EntityKind::Shot);
    alembic.published_file_type = "Alembic Cache".to_string();
    let binary = project.record(4, "shots/sh010/publish/sh010_v001.abc", EntityKind::Shot);
    let missing = project.record(5, "shots/sh010/publish/sh010_v009.ma", EntityKind::Shot);
    let catalog = project.catalog(vec![alembic, binary, missing]);
    let mut registrar = RecordingRegistrar::default();

    let report = pipeline
        .update_publish(&[3, 4, 5], &catalog, &mut registrar)
        .unwrap();
    let kinds: Vec<_> = report
        .records
        .iter()
        .map(|r| match &r.outcome {
            RecordOutcome::Skipped { precondition, .. } => *precondition,
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            Some(PreconditionKind::UnsupportedPublishedType),
            Some(PreconditionKind::UnsupportedExtension),
            Some(PreconditionKind::MissingSourceFile),
        ]
    );
    assert!(registrar.registrations.is_empty());
    assert!(!Path::new(&project.path("shots/sh010/publish/sh010_v003.ma")).exists());
}

#[test]
fn invariant_existing_destination_is_never_overwritten() {
    let project = Project::new();
    project.write("shots/sh010/publish/sh010_v003.ma", "keep me\n");
    let pipeline = project.pipeline();
    let catalog = project.catalog(vec![]);
    let mut registrar = RecordingRegistrar::default();

    let report = pipeline.update_publish(&[1], &catalog, &mut registrar).unwrap();
    assert!(matches!(
        report.records[0].outcome,
        RecordOutcome::Skipped {
            precondition: Some(PreconditionKind::DestinationExists),
            ..
        }
    ));
    assert_eq!(
        fs::read_to_string(project.path("shots/sh010/publish/sh010_v003.ma")).unwrap(),
        "keep me\n"
    );
    assert!(registrar.registrations.is_empty());
    assert!(!Path::new(&project.path("shots/sh010/work/sh010_v004.ma")).exists());
}

#[test]
fn invariant_registration_failure_follows_policy() {
    let project = Project::new();
    let catalog = project.catalog(vec![]);
    let mut registrar = RecordingRegistrar {
        reject: true,
        ..RecordingRegistrar::default()
    };

    let report = project
        .pipeline()
        .update_publish(&[1], &catalog, &mut registrar)
        .unwrap();
    assert!(matches!(report.records[0].outcome, RecordOutcome::Failed { .. }));
    // The rewritten file stays; nothing is rolled back.
    assert!(Path::new(&project.path("shots/sh010/publish/sh010_v003.ma")).exists());
    assert!(!Path::new(&project.path("shots/sh010/work/sh010_v004.ma")).exists());

    let project = Project::new();
    let catalog = project.catalog(vec![]);
    let result = project
        .pipeline()
        .with_failure_policy(FailurePolicy::AbortBatch)
        .update_publish(&[1, 50], &catalog, &mut registrar);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("service unavailable"));
}

#[test]
fn invariant_ledger_records_each_update() {
    let project = Project::new();
    let catalog = project.catalog(vec![]);
    let mut ledger = LedgerRegistrar::new(project.dir.path().join("ledger.jsonl"));

    project
        .pipeline()
        .update_publish(&[1], &catalog, &mut ledger)
        .unwrap();

    let entries = ledger.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].registration.version_number, 3);
    assert!(!entries[0].registered.fingerprint.is_empty());
}

#[cfg(feature = "test-hooks")]
#[test]
fn invariant_versions_are_enumerated_per_lookup() {
    use publish_updater::versions::{get_enumeration_call_count, reset_enumeration_call_count};

    let project = Project::new();
    let catalog = project.catalog(vec![]);
    let mut registrar = RecordingRegistrar::default();

    reset_enumeration_call_count();
    project
        .pipeline()
        .update_publish(&[1], &catalog, &mut registrar)
        .unwrap();

    // One lookup for the work family, one for the embedded reference.
    // Other tests may run concurrently, so only the lower bound is checked.
    assert!(get_enumeration_call_count() >= 2);
}

#[test]
fn invariant_missing_version_field_skips_record() {
    let project = Project::new();
    project.write("shots/sh010/notes/sh010_notes.ma", "//notes\n");
    let pipeline = project.pipeline();
    let notes = project.record(6, "shots/sh010/notes/sh010_notes.ma", EntityKind::Shot);
    let catalog = project.catalog(vec![notes]);
    let mut registrar = RecordingRegistrar::default();

    let report = pipeline.update_publish(&[6], &catalog, &mut registrar).unwrap();
    assert!(matches!(
        report.records[0].outcome,
        RecordOutcome::Skipped {
            precondition: Some(PreconditionKind::MissingVersionField),
            ..
        }
    ));
    assert!(registrar.registrations.is_empty());
    assert!(!Path::new(&project.path("shots/sh010/work/sh010_v004.ma")).exists());
}

#[test]
fn invariant_reference_matcher_is_replaceable() {
    let project = Project::new();
    let pipeline = project.pipeline().with_matcher(Box::new(SingleQuotedMatcher));
    let catalog = project.catalog(vec![]);
    let rewriter = pipeline.rewriter(&catalog);

    let stale = project.path("assets/hero/publish/hero_v001.ma");
    let (lines, report) = rewriter
        .rewrite_lines([
            format!("source '{}'\n", stale),
            format!("file -r \"{}\";\n", stale),
        ])
        .unwrap();
    assert_eq!(
        lines[0],
        format!("source '{}'\n", project.path("assets/hero/publish/hero_v004.ma"))
    );
    // Double quotes are no longer recognised.
    assert_eq!(lines[1], format!("file -r \"{}\";\n", stale));
    assert_eq!(report.updates.len(), 1);
}
