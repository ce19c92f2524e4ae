//! Reference Rewriting - Stale Path Substitution
//!
//! Streams a text file line by line. When a line embeds a published path
//! whose version is no longer the latest on disk, the path is replaced by
//! the latest version. Everything else is copied byte for byte.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::publish::{CatalogError, PublishCatalog, REFERENCE_SEARCH_FIELDS};
use crate::templates::{
    normalize_separators, FieldValue, TemplateError, TemplateRegistry, SKIP_KEYS, VERSION_KEY,
};
use crate::versions::VersionLookup;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Destination {0} already exists")]
    DestinationExists(PathBuf),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// A path embedded in a line, with the text on either side of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceMatch<'l> {
    pub prefix: &'l str,
    pub path: &'l str,
    pub suffix: &'l str,
}

/// Strategy locating the embedded path in a line of a host file format.
pub trait ReferenceMatcher {
    /// The first embedded path in `line`, if any. `line` carries no terminator.
    fn find<'l>(&self, line: &'l str) -> Option<ReferenceMatch<'l>>;
}

/// Matches a double-quoted path under a root directory, as written by
/// ASCII scene files: `file -r "/root/asset/v003/asset.ma";`. The path
/// ends at the next quote, and only the first such path on a line counts.
#[derive(Debug, Clone)]
pub struct QuotedPathMatcher {
    pattern: Regex,
}

impl QuotedPathMatcher {
    pub fn new(root: &str) -> Result<Self, regex::Error> {
        let root = normalize_separators(root);
        let pattern = Regex::new(&format!(r#"^(.+?")({}[^"]+)(".+)"#, regex::escape(&root)))?;
        Ok(Self { pattern })
    }
}

impl ReferenceMatcher for QuotedPathMatcher {
    fn find<'l>(&self, line: &'l str) -> Option<ReferenceMatch<'l>> {
        let captures = self.pattern.captures(line)?;
        Some(ReferenceMatch {
            prefix: captures.get(1)?.as_str(),
            path: captures.get(2)?.as_str(),
            suffix: captures.get(3)?.as_str(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceUpdate {
    /// 1-based line number in the source.
    pub line: usize,
    pub stale_path: String,
    pub latest_path: String,
    pub latest_version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteReport {
    pub lines: usize,
    pub updates: Vec<ReferenceUpdate>,
}

/// Line transform replacing stale embedded references.
pub struct ReferenceRewriter<'a> {
    registry: &'a TemplateRegistry,
    versions: &'a dyn VersionLookup,
    matcher: &'a dyn ReferenceMatcher,
    catalog: &'a dyn PublishCatalog,
    search_fields: &'a [&'a str],
}

impl<'a> ReferenceRewriter<'a> {
    pub fn new(
        registry: &'a TemplateRegistry,
        versions: &'a dyn VersionLookup,
        matcher: &'a dyn ReferenceMatcher,
        catalog: &'a dyn PublishCatalog,
    ) -> Self {
        Self {
            registry,
            versions,
            matcher,
            catalog,
            search_fields: &REFERENCE_SEARCH_FIELDS,
        }
    }

    /// Attributes requested from the catalog for each embedded reference.
    pub fn with_search_fields(mut self, fields: &'a [&'a str]) -> Self {
        self.search_fields = fields;
        self
    }

    /// The latest path and version for a stale `path`, or `None` when
    /// `path` is current or cannot be resolved.
    pub fn resolve_reference(&self, path: &str) -> Result<Option<(String, u64)>, RewriteError> {
        if self.catalog.find_by_path(path, self.search_fields)?.is_none() {
            debug!("{} is not a published file", path);
            return Ok(None);
        }

        let template = match self.registry.template_from_path(path) {
            Ok(Some(template)) => template,
            Ok(None) => {
                debug!("{} has no template", path);
                return Ok(None);
            }
            Err(err @ TemplateError::Ambiguous { .. }) => {
                warn!("{}, left unchanged", err);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let Some(mut fields) = template.get_fields(path) else {
            return Ok(None);
        };
        let Some(current) = fields.get(VERSION_KEY).and_then(FieldValue::as_int) else {
            return Ok(None);
        };

        let latest = self.versions.latest_version(template, &fields, &SKIP_KEYS)?;
        if latest == current {
            return Ok(None);
        }

        fields.insert(VERSION_KEY.to_string(), FieldValue::Int(latest));
        let latest_path = normalize_separators(&template.apply_fields(&fields)?);
        info!("{} not up to date, latest is {}", path, latest);
        Ok(Some((latest_path, latest)))
    }

    /// Rewrite one line without its terminator. `None` means copy it unchanged.
    pub fn rewrite_line(
        &self,
        line: &str,
        line_number: usize,
    ) -> Result<Option<(String, ReferenceUpdate)>, RewriteError> {
        let Some(found) = self.matcher.find(line) else {
            return Ok(None);
        };
        let Some((latest_path, latest_version)) = self.resolve_reference(found.path)? else {
            return Ok(None);
        };

        let rewritten = format!("{}{}{}", found.prefix, latest_path, found.suffix);
        let update = ReferenceUpdate {
            line: line_number,
            stale_path: found.path.to_string(),
            latest_path,
            latest_version,
        };
        Ok(Some((rewritten, update)))
    }

    /// Rewrite in-memory lines. Each line keeps whatever terminator it carries.
    pub fn rewrite_lines<I, S>(&self, lines: I) -> Result<(Vec<String>, RewriteReport), RewriteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut output = Vec::new();
        let mut report = RewriteReport::default();
        for line in lines {
            let line = line.as_ref();
            report.lines += 1;
            let (content, terminator) = split_terminator(line.as_bytes());
            // Splitting at an ASCII newline keeps both halves valid UTF-8.
            let content = &line[..content.len()];
            let terminator = &line[line.len() - terminator.len()..];
            match self.rewrite_line(content, report.lines)? {
                Some((rewritten, update)) => {
                    output.push(format!("{}{}", rewritten, terminator));
                    report.updates.push(update);
                }
                None => output.push(line.to_string()),
            }
        }
        Ok((output, report))
    }

    /// Stream `reader` into `writer`, one decision per line.
    pub fn rewrite<R: BufRead, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<RewriteReport, RewriteError> {
        let mut report = RewriteReport::default();
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer)? == 0 {
                break;
            }
            report.lines += 1;

            let (content, terminator) = split_terminator(&buffer);
            let rewritten = match std::str::from_utf8(content) {
                Ok(text) => self.rewrite_line(text, report.lines)?,
                Err(_) => {
                    debug!("Line {} is not UTF-8, copied unchanged", report.lines);
                    None
                }
            };

            match rewritten {
                Some((line, update)) => {
                    writer.write_all(line.as_bytes())?;
                    writer.write_all(terminator)?;
                    report.updates.push(update);
                }
                None => writer.write_all(&buffer)?,
            }
        }
        writer.flush()?;
        Ok(report)
    }

    /// Rewrite `source` into a new file at `destination`. The destination
    /// must not exist; it is closed before this returns.
    pub fn rewrite_file(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<RewriteReport, RewriteError> {
        let reader = BufReader::new(File::open(source)?);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => {
                    RewriteError::DestinationExists(destination.to_path_buf())
                }
                _ => RewriteError::Io(err),
            })?;
        let mut writer = BufWriter::new(file);
        let report = self.rewrite(reader, &mut writer)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(report)
    }
}

fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    match line.last() {
        Some(b'\n') => line.split_at(line.len() - 1),
        _ => (line, &[]),
    }
}
