//! # JSON Patching
//!
//! Tolerant dot-path assignment into staged JSON files. Values decode with
//! JSON type inference: bare `true`/`false`/numbers/JSON literals become
//! their native type, anything else is stored as a string.

use super::{PatchHook, SyncError};
use globset::{Glob, GlobMatcher};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Decode a raw patch value with JSON type inference
#[must_use]
pub fn infer_json_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Set `dot_path` in `value` to the inferred form of `raw`, creating
/// intermediate objects as needed. Non-object intermediates are replaced.
pub fn set_dot_path(value: &mut Value, dot_path: &str, raw: &str) {
    let mut cursor = value;
    let segments: Vec<&str> = dot_path.split('.').collect();
    for (index, segment) in segments.iter().enumerate() {
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        let map = cursor.as_object_mut().expect("cursor coerced to object");
        if index == segments.len() - 1 {
            map.insert((*segment).to_string(), infer_json_value(raw));
            return;
        }
        cursor = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// One compiled patch: a file matcher plus ordered assignments
#[derive(Debug, Clone)]
pub struct CompiledPatch {
    matcher: Option<GlobMatcher>,
    /// Assignments with template values already rendered
    set: Vec<(String, String)>,
}

/// All patches of one mapping, compiled into a hook
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    patches: Vec<CompiledPatch>,
}

impl PatchSet {
    /// Compile patch specs into matchers.
    ///
    /// `default_file` is the base filename used when a patch omits its
    /// `file` glob (set for file mappings, `None` for dir mappings where an
    /// omitted glob matches nothing).
    pub fn compile(
        patches: &[(Option<String>, Vec<(String, String)>)],
        default_file: Option<&str>,
    ) -> Result<Self, SyncError> {
        let mut compiled = Vec::with_capacity(patches.len());
        for (file, set) in patches {
            let pattern = file.as_deref().or(default_file);
            let matcher = match pattern {
                Some(pattern) => Some(
                    Glob::new(pattern)
                        .map_err(|e| SyncError::PatchGlobInvalid {
                            pattern: pattern.to_string(),
                            message: e.to_string(),
                        })?
                        .compile_matcher(),
                ),
                None => None,
            };
            compiled.push(CompiledPatch {
                matcher,
                set: set.clone(),
            });
        }
        Ok(Self { patches: compiled })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Apply every matching patch to one staged file
    pub fn apply(&self, abs: &Path, rel: &Path) -> Result<(), SyncError> {
        let mut document: Option<Value> = None;
        for patch in &self.patches {
            let matches = patch
                .matcher
                .as_ref()
                .is_some_and(|matcher| matcher.is_match(rel));
            if !matches {
                continue;
            }
            let doc = match &mut document {
                Some(doc) => doc,
                None => {
                    let bytes = fs::read(abs).map_err(|e| SyncError::io(abs, e))?;
                    let parsed: Value = serde_json::from_slice(&bytes).map_err(|e| {
                        SyncError::InvalidPatchJson {
                            path: abs.to_path_buf(),
                            message: e.to_string(),
                        }
                    })?;
                    document.insert(parsed)
                }
            };
            for (dot_path, raw) in &patch.set {
                set_dot_path(doc, dot_path, raw);
            }
        }
        if let Some(doc) = document {
            let rendered = serde_json::to_string_pretty(&doc).map_err(|e| {
                SyncError::InvalidPatchJson {
                    path: abs.to_path_buf(),
                    message: e.to_string(),
                }
            })?;
            fs::write(abs, rendered).map_err(|e| SyncError::io(abs, e))?;
        }
        Ok(())
    }

    /// Wrap into the engine's hook shape
    #[must_use]
    pub fn into_hook(self) -> PatchHook {
        Arc::new(move |abs: &Path, rel: &Path| self.apply(abs, rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn infers_native_json_types() {
        assert_eq!(infer_json_value("true"), json!(true));
        assert_eq!(infer_json_value("false"), json!(false));
        assert_eq!(infer_json_value("42"), json!(42));
        assert_eq!(infer_json_value("4.5"), json!(4.5));
        assert_eq!(infer_json_value("\"quoted\""), json!("quoted"));
        assert_eq!(infer_json_value("[1,2]"), json!([1, 2]));
        assert_eq!(infer_json_value("plain text"), json!("plain text"));
        assert_eq!(infer_json_value("edge-01"), json!("edge-01"));
    }

    #[test]
    fn sets_nested_paths_creating_objects() {
        let mut doc = json!({"existing": 1});
        set_dot_path(&mut doc, "a.b.c", "true");
        assert_eq!(doc, json!({"existing": 1, "a": {"b": {"c": true}}}));
    }

    #[test]
    fn replaces_non_object_intermediates() {
        let mut doc = json!({"a": "scalar"});
        set_dot_path(&mut doc, "a.b", "1");
        assert_eq!(doc, json!({"a": {"b": 1}}));
    }

    #[test]
    fn later_assignments_win() {
        let mut doc = json!({});
        set_dot_path(&mut doc, "SystemName", "first");
        set_dot_path(&mut doc, "SystemName", "second");
        assert_eq!(doc, json!({"SystemName": "second"}));
    }

    #[test]
    fn patch_set_applies_only_to_matching_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("config.json");
        fs::write(&file, "{\"SystemName\": \"old\"}").expect("write");

        let patches = vec![(
            Some("system-properties/config.json".to_string()),
            vec![("SystemName".to_string(), "edge-01".to_string())],
        )];
        let set = PatchSet::compile(&patches, None).expect("compiles");

        // Non-matching relative path leaves the file alone
        set.apply(&file, Path::new("other/config.json")).expect("apply");
        let unchanged: Value =
            serde_json::from_str(&fs::read_to_string(&file).expect("read")).expect("json");
        assert_eq!(unchanged["SystemName"], "old");

        // Matching path rewrites
        set.apply(&file, Path::new("system-properties/config.json"))
            .expect("apply");
        let changed: Value =
            serde_json::from_str(&fs::read_to_string(&file).expect("read")).expect("json");
        assert_eq!(changed["SystemName"], "edge-01");
    }

    #[test]
    fn invalid_json_under_matching_patch_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("broken.json");
        fs::write(&file, "not json at all").expect("write");

        let patches = vec![(
            Some("*.json".to_string()),
            vec![("k".to_string(), "v".to_string())],
        )];
        let set = PatchSet::compile(&patches, None).expect("compiles");
        let err = set
            .apply(&file, Path::new("broken.json"))
            .expect_err("must fail");
        assert!(matches!(err, SyncError::InvalidPatchJson { .. }));
    }

    #[test]
    fn omitted_glob_defaults_to_base_filename_for_file_mappings() {
        let patches = vec![(None, vec![("k".to_string(), "v".to_string())])];
        let set = PatchSet::compile(&patches, Some("config.json")).expect("compiles");

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("config.json");
        fs::write(&file, "{}").expect("write");
        set.apply(&file, Path::new("config.json")).expect("apply");
        let doc: Value =
            serde_json::from_str(&fs::read_to_string(&file).expect("read")).expect("json");
        assert_eq!(doc["k"], "v");
    }

    #[test]
    fn bad_glob_is_reported() {
        let patches = vec![(
            Some("[invalid".to_string()),
            vec![("k".to_string(), "v".to_string())],
        )];
        assert!(matches!(
            PatchSet::compile(&patches, None),
            Err(SyncError::PatchGlobInvalid { .. })
        ));
    }
}
