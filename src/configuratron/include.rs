//! `!include` tags and `include:` merge directives.
//!
//! A tagged value `key: !include <pattern>` is replaced by the loaded fragment.
//! A mapping holding an `include:` key (a pattern or a list of patterns) is
//! built from the named fragments first, then its own keys are applied on top.
//! Patterns are relative to the directory of the document that names them.

use crate::error::{Dn3Error, Result};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

const INCLUDE_TAG: &str = "include";
const MERGE_KEY: &str = "include";

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Files currently being loaded, innermost last.
#[derive(Default)]
struct Resolver {
    stack: Vec<PathBuf>,
}

/// Parse the YAML document at `path` with every include resolved.
pub fn load_document(path: &Path) -> Result<Value> {
    Resolver::default().load_file(path)
}

/// Resolve includes inside an already parsed document rooted at `base`.
pub fn resolve_value(value: Value, base: &Path) -> Result<Value> {
    Resolver::default().resolve(value, base)
}

impl Resolver {
    fn load_file(&mut self, path: &Path) -> Result<Value> {
        let canonical = fs::canonicalize(path)
            .map_err(|_| Dn3Error::IncludeNotFound(path.to_path_buf()))?;
        if self.stack.contains(&canonical) {
            return Err(Dn3Error::IncludeCycle(canonical));
        }
        let text = fs::read_to_string(&canonical)?;
        let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();

        let extension = canonical
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("yml" | "yaml") => {
                log::debug!("Including {}", canonical.display());
                let parsed: Value = serde_yaml::from_str(&text)?;
                self.stack.push(canonical);
                let resolved = self.resolve(parsed, &base);
                self.stack.pop();
                resolved
            }
            Some("json") => {
                let parsed: serde_json::Value = serde_json::from_str(&text)?;
                Ok(serde_yaml::to_value(parsed)?)
            }
            _ => Ok(Value::String(text)),
        }
    }

    /// A single path loads one fragment; a glob loads a sequence in sorted path order.
    fn load_pattern(&mut self, pattern: &str, base: &Path) -> Result<Value> {
        let joined = base.join(pattern);
        if !is_glob(pattern) {
            if !joined.exists() {
                return Err(Dn3Error::IncludeNotFound(joined));
            }
            return self.load_file(&joined);
        }

        // Only the user's pattern is glob syntax; the directory is matched literally.
        let escaped = Path::new(&glob::Pattern::escape(&base.to_string_lossy())).join(pattern);
        let mut matches = glob::glob(&escaped.to_string_lossy())?.collect::<Vec<_>>();
        matches.sort_by(|a, b| match (a, b) {
            (Ok(a), Ok(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        });
        let mut fragments = Vec::with_capacity(matches.len());
        for entry in matches {
            let path = entry?;
            if path.is_file() {
                fragments.push(self.load_file(&path)?);
            }
        }
        if fragments.is_empty() {
            log::warn!("Include pattern `{pattern}` matched no files");
        }
        Ok(Value::Sequence(fragments))
    }

    fn resolve(&mut self, value: Value, base: &Path) -> Result<Value> {
        match value {
            Value::Tagged(tagged) if tagged.tag == INCLUDE_TAG => match tagged.value {
                Value::String(pattern) => self.load_pattern(&pattern, base),
                other => Err(Dn3Error::invalid(
                    "!include",
                    format!("expected a path or pattern, found {other:?}"),
                )),
            },
            Value::Tagged(mut tagged) => {
                tagged.value = self.resolve(tagged.value, base)?;
                Ok(Value::Tagged(tagged))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.resolve(item, base))
                .collect::<Result<Vec<_>>>()
                .map(Value::Sequence),
            Value::Mapping(mapping) => self.resolve_mapping(mapping, base).map(Value::Mapping),
            scalar => Ok(scalar),
        }
    }

    fn resolve_mapping(&mut self, mut mapping: Mapping, base: &Path) -> Result<Mapping> {
        let mut merged = Mapping::new();
        if let Some(directive) = mapping.remove(MERGE_KEY) {
            for pattern in merge_patterns(directive)? {
                for fragment in flatten_fragments(self.load_pattern(&pattern, base)?) {
                    match fragment {
                        Value::Mapping(fields) => merged.extend(fields),
                        Value::Null => {}
                        other => {
                            return Err(Dn3Error::invalid(
                                MERGE_KEY,
                                format!("`{pattern}` must hold a mapping, found {other:?}"),
                            ));
                        }
                    }
                }
            }
        }
        for (key, value) in mapping {
            merged.insert(key, self.resolve(value, base)?);
        }
        Ok(merged)
    }
}

fn merge_patterns(directive: Value) -> Result<Vec<String>> {
    match directive {
        Value::String(pattern) => Ok(vec![pattern]),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(pattern) => Ok(pattern),
                other => Err(Dn3Error::invalid(
                    MERGE_KEY,
                    format!("expected a pattern, found {other:?}"),
                )),
            })
            .collect(),
        other => Err(Dn3Error::invalid(
            MERGE_KEY,
            format!("expected a pattern or list of patterns, found {other:?}"),
        )),
    }
}

/// Glob patterns load as sequences; merging treats each element as a fragment.
fn flatten_fragments(loaded: Value) -> Vec<Value> {
    match loaded {
        Value::Sequence(items) => items,
        single => vec![single],
    }
}
