//! Template System - Path Contracts
//!
//! A template is a path pattern under the storage root made of literal text
//! and `{key}` tokens. Templates extract fields from concrete paths and
//! render concrete paths back from fields.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type TemplateId = String;

/// Field values extracted from, or rendered into, a path.
pub type FieldSet = BTreeMap<String, FieldValue>;

/// Keys that vary between members of one version family.
pub const VERSION_KEY: &str = "version";
pub const SKIP_KEYS: [&str; 3] = [VERSION_KEY, "SEQ", "eye"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template {template} is malformed: {reason}")]
    Malformed { template: String, reason: String },

    #[error("Template {template} uses undefined key {key}")]
    UnknownKey { template: String, key: String },

    #[error("Template {template} is missing field {key}")]
    MissingField { template: String, key: String },

    #[error("Field {key} has value {value} which is not valid for a {kind} key")]
    InvalidValue { key: String, value: String, kind: KeyKind },

    #[error("Path {path} matches more than one template: {}", .templates.join(", "))]
    Ambiguous { path: String, templates: Vec<String> },

    #[error("Template pattern error: {0}")]
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(u64),
    Str(String),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            FieldValue::Str(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(value) => write!(f, "{}", value),
            FieldValue::Str(value) => f.write_str(value),
        }
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Int(u64::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    #[default]
    Str,
    Int,
    Sequence,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Str => f.write_str("str"),
            KeyKind::Int => f.write_str("int"),
            KeyKind::Sequence => f.write_str("sequence"),
        }
    }
}

/// Typed key definition shared by every template that uses the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateKey {
    #[serde(rename = "type", default)]
    pub kind: KeyKind,
    /// Zero padding for numeric keys, e.g. `"03"` renders 7 as `007`.
    #[serde(default)]
    pub format_spec: Option<String>,
}

impl TemplateKey {
    pub fn string() -> Self {
        Self::default()
    }

    pub fn int(format_spec: Option<&str>) -> Self {
        Self {
            kind: KeyKind::Int,
            format_spec: format_spec.map(str::to_string),
        }
    }

    pub fn sequence(format_spec: Option<&str>) -> Self {
        Self {
            kind: KeyKind::Sequence,
            format_spec: format_spec.map(str::to_string),
        }
    }

    fn value_pattern(&self) -> &'static str {
        match self.kind {
            KeyKind::Str => r"[^/]+?",
            KeyKind::Int => r"\d+",
            KeyKind::Sequence => r"\d+|%0\d+d|#+|@+|\$F\d*",
        }
    }

    fn width(&self) -> usize {
        self.format_spec
            .as_deref()
            .and_then(|spec| spec.trim_start_matches('0').parse().ok())
            .unwrap_or(0)
    }

    fn parse_value(&self, raw: &str) -> Option<FieldValue> {
        match self.kind {
            KeyKind::Str => Some(FieldValue::Str(raw.to_string())),
            KeyKind::Int => raw.parse().ok().map(FieldValue::Int),
            KeyKind::Sequence => Some(
                raw.parse()
                    .map(FieldValue::Int)
                    .unwrap_or_else(|_| FieldValue::Str(raw.to_string())),
            ),
        }
    }

    fn render(&self, key: &str, value: &FieldValue) -> Result<String, TemplateError> {
        let invalid = || TemplateError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            kind: self.kind,
        };

        match (self.kind, value) {
            (KeyKind::Str, value) => {
                let text = value.to_string();
                if text.is_empty() || text.contains('/') || text.contains('\\') {
                    return Err(invalid());
                }
                Ok(text)
            }
            (KeyKind::Int, FieldValue::Int(n)) | (KeyKind::Sequence, FieldValue::Int(n)) => {
                Ok(format!("{:0width$}", n, width = self.width()))
            }
            (KeyKind::Int, FieldValue::Str(text)) => text
                .parse::<u64>()
                .map(|n| format!("{:0width$}", n, width = self.width()))
                .map_err(|_| invalid()),
            (KeyKind::Sequence, FieldValue::Str(text)) => Ok(text.clone()),
        }
    }
}

/// Replace native Windows separators with forward slashes.
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Convert a forward-slash path into the platform's native separators.
pub fn to_native_separators(path: &str) -> String {
    path.replace('/', std::path::MAIN_SEPARATOR_STR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Key(String),
}

/// A compiled regex together with the key name of each capture group.
struct FieldMatcher {
    regex: Regex,
    groups: Vec<String>,
}

enum Extraction {
    NoMatch,
    /// A repeated key captured different values; holds the first value of each key.
    Conflict(BTreeMap<String, String>),
    Fields(FieldSet),
}

#[derive(Debug, Clone)]
pub struct PathTemplate {
    name: TemplateId,
    definition: String,
    tokens: Vec<Token>,
    keys: BTreeMap<String, TemplateKey>,
    extractor: Regex,
    groups: Vec<String>,
}

impl PathTemplate {
    /// Parse `definition` (relative to `root`) against the known `keys`.
    pub fn parse(
        name: &str,
        root: &str,
        definition: &str,
        keys: &BTreeMap<String, TemplateKey>,
    ) -> Result<Self, TemplateError> {
        let root = normalize_separators(root);
        let root = root.trim_end_matches('/');
        let relative = normalize_separators(definition);
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return Err(TemplateError::Malformed {
                template: name.to_string(),
                reason: "definition is empty".to_string(),
            });
        }

        let mut tokens = vec![Token::Literal(format!("{}/", root))];
        tokens.extend(tokenize(name, relative)?);

        let mut used_keys = BTreeMap::new();
        for token in &tokens {
            if let Token::Key(key) = token {
                let definition = keys.get(key).ok_or_else(|| TemplateError::UnknownKey {
                    template: name.to_string(),
                    key: key.clone(),
                })?;
                used_keys.insert(key.clone(), definition.clone());
            }
        }

        let matcher = compile_tokens(name, &tokens, &used_keys, &BTreeMap::new())?;
        Ok(Self {
            name: name.to_string(),
            definition: relative.to_string(),
            tokens,
            keys: used_keys,
            extractor: matcher.regex,
            groups: matcher.groups,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Names of the keys referenced by this template.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Whether `path` is fully described by this template.
    pub fn validate(&self, path: &str) -> bool {
        self.get_fields(path).is_some()
    }

    /// Extract fields from a concrete path, or `None` when the path does not match.
    pub fn get_fields(&self, path: &str) -> Option<FieldSet> {
        let path = normalize_separators(path);
        let matcher = FieldMatcher {
            regex: self.extractor.clone(),
            groups: self.groups.clone(),
        };

        match self.extract(&matcher, &path) {
            Extraction::NoMatch => None,
            Extraction::Fields(fields) => Some(fields),
            Extraction::Conflict(first_values) => {
                // Pin repeated keys to their first captured value and try again.
                let pinned: BTreeMap<String, String> = first_values
                    .into_iter()
                    .filter(|(key, _)| self.occurrences(key) > 1)
                    .collect();
                let matcher = self.compile(&pinned).ok()?;
                match self.extract(&matcher, &path) {
                    Extraction::Fields(mut fields) => {
                        for (key, raw) in pinned {
                            let value = self.keys.get(&key)?.parse_value(&raw)?;
                            fields.insert(key, value);
                        }
                        Some(fields)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Render a concrete forward-slash path from `fields`.
    pub fn apply_fields(&self, fields: &FieldSet) -> Result<String, TemplateError> {
        let mut path = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => path.push_str(text),
                Token::Key(key) => {
                    let value = fields.get(key).ok_or_else(|| TemplateError::MissingField {
                        template: self.name.clone(),
                        key: key.clone(),
                    })?;
                    path.push_str(&self.key(key)?.render(key, value)?);
                }
            }
        }
        Ok(path)
    }

    /// Regex matching every path of this template where the keys in
    /// `skip_keys`, and any key absent from `fields`, may take any value.
    pub fn candidate_regex(
        &self,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<Regex, TemplateError> {
        let fixed = self.fixed_values(fields, skip_keys)?;
        Ok(self.compile(&fixed)?.regex)
    }

    /// Deepest directory fixed by `fields`, and how many path segments lie below it.
    pub fn search_root(
        &self,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<(String, usize), TemplateError> {
        const VARIABLE: char = '\u{0}';

        let fixed = self.fixed_values(fields, skip_keys)?;
        let mut shape = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => shape.push_str(text),
                Token::Key(key) => match fixed.get(key) {
                    Some(value) => shape.push_str(value),
                    None => shape.push(VARIABLE),
                },
            }
        }

        let fixed_prefix = match shape.find(VARIABLE) {
            Some(index) => &shape[..index],
            None => shape.as_str(),
        };
        let dir_end = fixed_prefix.rfind('/').unwrap_or(0);
        let dir = if dir_end == 0 {
            "/".to_string()
        } else {
            shape[..dir_end].to_string()
        };
        let depth = shape[dir_end..].matches('/').count().max(1);
        Ok((dir, depth))
    }

    fn key(&self, key: &str) -> Result<&TemplateKey, TemplateError> {
        self.keys.get(key).ok_or_else(|| TemplateError::UnknownKey {
            template: self.name.clone(),
            key: key.to_string(),
        })
    }

    fn occurrences(&self, key: &str) -> usize {
        self.tokens
            .iter()
            .filter(|token| matches!(token, Token::Key(name) if name == key))
            .count()
    }

    fn fixed_values(
        &self,
        fields: &FieldSet,
        skip_keys: &[&str],
    ) -> Result<BTreeMap<String, String>, TemplateError> {
        let mut fixed = BTreeMap::new();
        for (key, definition) in &self.keys {
            if skip_keys.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = fields.get(key) {
                fixed.insert(key.clone(), definition.render(key, value)?);
            }
        }
        Ok(fixed)
    }

    fn compile(&self, fixed: &BTreeMap<String, String>) -> Result<FieldMatcher, TemplateError> {
        compile_tokens(&self.name, &self.tokens, &self.keys, fixed)
    }

    fn extract(&self, matcher: &FieldMatcher, path: &str) -> Extraction {
        let Some(captures) = matcher.regex.captures(path) else {
            return Extraction::NoMatch;
        };

        let mut raw_values: BTreeMap<String, String> = BTreeMap::new();
        let mut conflict = false;
        for (index, key) in matcher.groups.iter().enumerate() {
            let Some(raw) = captures.get(index + 1).map(|m| m.as_str()) else {
                return Extraction::NoMatch;
            };
            match raw_values.get(key) {
                Some(existing) if existing != raw => conflict = true,
                Some(_) => {}
                None => {
                    raw_values.insert(key.clone(), raw.to_string());
                }
            }
        }

        if conflict {
            return Extraction::Conflict(raw_values);
        }

        let mut fields = FieldSet::new();
        for (key, raw) in raw_values {
            let Some(value) = self.keys.get(&key).and_then(|k| k.parse_value(&raw)) else {
                return Extraction::NoMatch;
            };
            fields.insert(key, value);
        }
        Extraction::Fields(fields)
    }
}

fn compile_tokens(
    name: &str,
    tokens: &[Token],
    keys: &BTreeMap<String, TemplateKey>,
    fixed: &BTreeMap<String, String>,
) -> Result<FieldMatcher, TemplateError> {
    let mut pattern = String::from("^");
    let mut groups = Vec::new();
    for token in tokens {
        match token {
            Token::Literal(text) => pattern.push_str(&regex::escape(text)),
            Token::Key(key) => match fixed.get(key) {
                Some(value) => pattern.push_str(&regex::escape(value)),
                None => {
                    let definition = keys.get(key).ok_or_else(|| TemplateError::UnknownKey {
                        template: name.to_string(),
                        key: key.clone(),
                    })?;
                    pattern.push('(');
                    pattern.push_str(definition.value_pattern());
                    pattern.push(')');
                    groups.push(key.clone());
                }
            },
        }
    }
    pattern.push('$');

    let regex = Regex::new(&pattern).map_err(|e| TemplateError::Pattern(e.to_string()))?;
    Ok(FieldMatcher { regex, groups })
}

fn tokenize(name: &str, definition: &str) -> Result<Vec<Token>, TemplateError> {
    let malformed = |reason: &str| TemplateError::Malformed {
        template: name.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = Vec::new();
    let mut rest = definition;
    while !rest.is_empty() {
        match rest.find(['{', '}']) {
            Some(index) if rest[index..].starts_with('}') => {
                return Err(malformed("unexpected '}'"));
            }
            Some(index) => {
                if index > 0 {
                    tokens.push(Token::Literal(rest[..index].to_string()));
                }
                let after = &rest[index + 1..];
                let close = after.find('}').ok_or_else(|| malformed("unclosed '{'"))?;
                let key = &after[..close];
                if key.is_empty() || key.contains(['{', '/']) {
                    return Err(malformed("invalid key name"));
                }
                tokens.push(Token::Key(key.to_string()));
                rest = &after[close + 1..];
            }
            None => {
                tokens.push(Token::Literal(rest.to_string()));
                rest = "";
            }
        }
    }
    Ok(tokens)
}

/// Template registry - every template known under one storage root
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    root: String,
    keys: BTreeMap<String, TemplateKey>,
    templates: BTreeMap<TemplateId, PathTemplate>,
}

impl TemplateRegistry {
    pub fn new(root: &str, keys: BTreeMap<String, TemplateKey>) -> Self {
        Self {
            root: normalize_separators(root).trim_end_matches('/').to_string(),
            keys,
            templates: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, id: &str) -> Option<&PathTemplate> {
        self.templates.get(id)
    }

    pub fn list(&self) -> Vec<&PathTemplate> {
        self.templates.values().collect()
    }

    /// Parse and register a template definition under `name`.
    pub fn register(&mut self, name: &str, definition: &str) -> Result<(), TemplateError> {
        let template = PathTemplate::parse(name, &self.root, definition, &self.keys)?;
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Find the single template describing `path`.
    pub fn template_from_path(&self, path: &str) -> Result<Option<&PathTemplate>, TemplateError> {
        let matches: Vec<&PathTemplate> = self
            .templates
            .values()
            .filter(|template| template.validate(path))
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [template] => Ok(Some(template)),
            _ => Err(TemplateError::Ambiguous {
                path: path.to_string(),
                templates: matches.iter().map(|t| t.name.clone()).collect(),
            }),
        }
    }
}
