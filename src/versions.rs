//! Version Resolution - Latest Version Lookup
//!
//! The latest version of a path family is the highest `version` field among
//! the existing paths that share every other fixed field. Nothing is cached:
//! each call reflects the filesystem as it is now.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::debug;
use walkdir::WalkDir;

use crate::templates::{normalize_separators, FieldSet, PathTemplate, TemplateError, VERSION_KEY};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static ENUMERATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_enumeration_call_count() -> u32 {
    ENUMERATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_enumeration_call_count() {
    ENUMERATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Enumerates the existing members of a template family.
pub trait VersionLookup {
    /// Every existing path matching `template` with `fields` held fixed,
    /// except for the keys in `skip_keys` and keys absent from `fields`.
    fn paths_from_template(
        &self,
        template: &PathTemplate,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<Vec<String>, TemplateError>;

    /// Highest version among the family members, or 0 when none exist.
    fn latest_version(
        &self,
        template: &PathTemplate,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<u64, TemplateError> {
        #[cfg(feature = "test-hooks")]
        ENUMERATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        let candidates = self.paths_from_template(template, fields, skip_keys)?;
        Ok(max_version(template, &candidates))
    }
}

/// Maximum `version` field across `paths`; candidates without one are ignored.
pub fn max_version(template: &PathTemplate, paths: &[String]) -> u64 {
    paths
        .iter()
        .filter_map(|path| template.get_fields(path))
        .filter_map(|fields| fields.get(VERSION_KEY).and_then(|v| v.as_int()))
        .max()
        .unwrap_or(0)
}

/// Scans the filesystem below the deepest directory the fixed fields pin down.
#[derive(Debug, Clone, Default)]
pub struct DiskVersionLookup;

impl DiskVersionLookup {
    pub fn new() -> Self {
        Self
    }
}

impl VersionLookup for DiskVersionLookup {
    fn paths_from_template(
        &self,
        template: &PathTemplate,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<Vec<String>, TemplateError> {
        let pattern = template.candidate_regex(fields, skip_keys)?;
        let (search_dir, depth) = template.search_root(fields, skip_keys)?;
        let search_dir = PathBuf::from(search_dir);
        if !search_dir.is_dir() {
            debug!("Search root {:?} does not exist", search_dir);
            return Ok(Vec::new());
        }

        let mut found = BTreeSet::new();
        for entry in WalkDir::new(&search_dir)
            .min_depth(depth)
            .max_depth(depth)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = normalize_separators(&entry.path().to_string_lossy());
            if pattern.is_match(&path) {
                found.insert(path);
            }
        }

        debug!(
            template = template.name(),
            candidates = found.len(),
            "Enumerated {:?}",
            search_dir
        );
        Ok(found.into_iter().collect())
    }
}

/// Fixed list of paths standing in for the filesystem.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVersionLookup {
    paths: Vec<String>,
}

impl InMemoryVersionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|p| normalize_separators(p.as_ref()))
                .collect(),
        }
    }

    pub fn insert(&mut self, path: &str) {
        self.paths.push(normalize_separators(path));
    }
}

impl VersionLookup for InMemoryVersionLookup {
    fn paths_from_template(
        &self,
        template: &PathTemplate,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<Vec<String>, TemplateError> {
        let pattern = template.candidate_regex(fields, skip_keys)?;
        Ok(self
            .paths
            .iter()
            .filter(|path| pattern.is_match(path))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{FieldValue, TemplateKey, SKIP_KEYS};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn template(root: &str) -> PathTemplate {
        let mut keys = BTreeMap::new();
        keys.insert("Asset".to_string(), TemplateKey::string());
        keys.insert("eye".to_string(), TemplateKey::string());
        keys.insert("version".to_string(), TemplateKey::int(Some("03")));
        keys.insert("SEQ".to_string(), TemplateKey::sequence(Some("04")));
        PathTemplate::parse(
            "asset_cache",
            root,
            "assets/{Asset}/v{version}/{Asset}_{eye}.{SEQ}.abc",
            &keys,
        )
        .unwrap()
    }

    fn fields_for(asset: &str) -> FieldSet {
        let mut fields = FieldSet::new();
        fields.insert("Asset".to_string(), FieldValue::from(asset));
        fields.insert("eye".to_string(), FieldValue::from("left"));
        fields.insert("SEQ".to_string(), FieldValue::Int(1));
        fields.insert("version".to_string(), FieldValue::Int(1));
        fields
    }

    #[test]
    fn test_latest_version_is_zero_without_candidates() {
        let lookup = InMemoryVersionLookup::new();
        let template = template("/root");
        let latest = lookup
            .latest_version(&template, &fields_for("hero"), &SKIP_KEYS)
            .unwrap();
        assert_eq!(latest, 0);
    }

    #[test]
    fn test_latest_version_ignores_order_and_variants() {
        let template = template("/root");
        let paths = [
            "/root/assets/hero/v004/hero_right.0001.abc",
            "/root/assets/hero/v012/hero_left.%04d.abc",
            "/root/assets/hero/v002/hero_left.0010.abc",
            "/root/assets/villain/v099/villain_left.0001.abc",
        ];
        let forward = InMemoryVersionLookup::with_paths(paths);
        let backward = InMemoryVersionLookup::with_paths(paths.iter().rev());

        let fields = fields_for("hero");
        assert_eq!(forward.latest_version(&template, &fields, &SKIP_KEYS).unwrap(), 12);
        assert_eq!(backward.latest_version(&template, &fields, &SKIP_KEYS).unwrap(), 12);
    }

    #[test]
    fn test_latest_version_sees_new_paths() {
        let template = template("/root");
        let fields = fields_for("hero");
        let mut lookup = InMemoryVersionLookup::new();
        lookup.insert("/root/assets/hero/v002/hero_left.0001.abc");
        assert_eq!(lookup.latest_version(&template, &fields, &SKIP_KEYS).unwrap(), 2);

        lookup.insert(r"\root\assets\hero\v030\hero_left.0001.abc");
        assert_eq!(lookup.latest_version(&template, &fields, &SKIP_KEYS).unwrap(), 30);
    }

    #[test]
    fn test_disk_lookup_scans_template_family() {
        let dir = tempdir().unwrap();
        let root = normalize_separators(&dir.path().to_string_lossy());
        let template = template(&root);

        for (version, file) in [
            ("v001", "hero_left.0001.abc"),
            ("v003", "hero_right.0002.abc"),
            ("v007", "notes.txt"),
        ] {
            let folder = dir.path().join("assets/hero").join(version);
            fs::create_dir_all(&folder).unwrap();
            fs::write(folder.join(file), b"data").unwrap();
        }

        let lookup = DiskVersionLookup::new();
        let fields = fields_for("hero");
        let found = lookup
            .paths_from_template(&template, &fields, &SKIP_KEYS)
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(lookup.latest_version(&template, &fields, &SKIP_KEYS).unwrap(), 3);
    }

    #[test]
    fn test_disk_lookup_handles_missing_root() {
        let dir = tempdir().unwrap();
        let root = normalize_separators(&dir.path().join("absent").to_string_lossy());
        let lookup = DiskVersionLookup::new();
        let latest = lookup
            .latest_version(&template(&root), &fields_for("hero"), &SKIP_KEYS)
            .unwrap();
        assert_eq!(latest, 0);
    }
}
