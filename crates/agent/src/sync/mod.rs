//! # Sync Engine
//!
//! Pure filesystem transform: render ordered mappings into a staging tree,
//! merge the staging tree into the live tree, detect the diff, and clean
//! orphans inside managed roots only.
//!
//! The engine knows nothing about Kubernetes, gateways, or Git. Template
//! rendering and JSON patching are injected as hooks so the engine can be
//! exercised in isolation.

mod engine;
mod patch;

pub use engine::execute;
pub use patch::{infer_json_value, set_dot_path, PatchSet};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Exclusion enforced by the engine regardless of configuration
pub const ALWAYS_EXCLUDE: &str = "**/.resources/**";

/// Name of the staging directory created under the live dir
pub const STAGING_DIR_NAME: &str = ".stoker-staging";

/// Hook rendering one staged file in place
pub type TemplateHook = Arc<dyn Fn(&Path) -> Result<(), SyncError> + Send + Sync>;

/// Hook patching one staged file in place; receives the absolute staged path
/// and its path relative to the mapping root
pub type PatchHook = Arc<dyn Fn(&Path, &Path) -> Result<(), SyncError> + Send + Sync>;

/// One fully-resolved source-to-destination rule
#[derive(Clone)]
pub struct ResolvedMapping {
    /// Absolute path inside the repository checkout
    pub source: PathBuf,
    /// Path relative to the live dir; templates already rendered
    pub destination: String,
    /// Optional dir/file hint, validated against the filesystem
    pub type_hint: Option<MappingKind>,
    /// Fail the plan when the source does not exist
    pub required: bool,
    /// Run the template hook over regular files staged by this mapping
    pub template: bool,
    /// Patch hook for files staged by this mapping
    pub apply_patches: Option<PatchHook>,
}

impl std::fmt::Debug for ResolvedMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedMapping")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("type_hint", &self.type_hint)
            .field("required", &self.required)
            .field("template", &self.template)
            .field("has_patches", &self.apply_patches.is_some())
            .finish()
    }
}

/// Source kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Dir,
    File,
}

/// Everything the engine needs for one run
#[derive(Clone)]
pub struct SyncPlan {
    /// Ordered mappings; later mappings overlay earlier ones
    pub mappings: Vec<ResolvedMapping>,
    /// Doublestar exclude globs matched against destination-relative paths
    pub exclude_patterns: Vec<String>,
    /// Scratch tree, removed and recreated on every run
    pub staging_dir: PathBuf,
    /// Gateway data directory
    pub live_dir: PathBuf,
    /// Report the diff without touching the live tree
    pub dry_run: bool,
    /// Shared template hook, called for files under `template: true` mappings
    pub apply_template: Option<TemplateHook>,
}

impl std::fmt::Debug for SyncPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPlan")
            .field("mappings", &self.mappings)
            .field("exclude_patterns", &self.exclude_patterns)
            .field("staging_dir", &self.staging_dir)
            .field("live_dir", &self.live_dir)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// Paths that changed (or would change, under dry-run), relative to the
/// live dir
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl DiffReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Outcome of one engine run
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    /// Top-level directory names staged under a "projects" destination
    pub projects_synced: Vec<String>,
    pub duration: Duration,
    /// Populated only under dry-run
    pub dry_run_diff: Option<DiffReport>,
}

impl SyncResult {
    #[must_use]
    pub fn files_changed(&self) -> usize {
        self.files_added + self.files_modified + self.files_deleted
    }
}

/// Engine failure; the plan aborts on the first error and never partially
/// applies to the live tree
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("required source '{source_path}' for destination '{destination}' does not exist")]
    RequiredSourceMissing {
        source_path: PathBuf,
        destination: String,
    },

    #[error("mapping '{destination}' is declared {expected:?} but source '{source_path}' is not")]
    TypeHintMismatch {
        source_path: PathBuf,
        destination: String,
        expected: MappingKind,
    },

    #[error("file '{path}' contains binary data and cannot be templated")]
    BinaryTemplateInput { path: PathBuf },

    #[error("template rendering failed for '{path}': {message}")]
    Template { path: PathBuf, message: String },

    #[error("file '{path}' selected by a patch is not valid JSON: {message}")]
    InvalidPatchJson { path: PathBuf, message: String },

    #[error("invalid patch file glob '{pattern}': {message}")]
    PatchGlobInvalid { pattern: String, message: String },

    #[error("invalid exclude glob '{pattern}': {message}")]
    ExcludeGlobInvalid { pattern: String, message: String },

    #[error("i/o error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
