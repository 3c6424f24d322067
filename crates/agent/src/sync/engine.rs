//! # Engine Execution
//!
//! Staging build, template/patch passes, managed-root merge, orphan cleanup.

use super::{
    DiffReport, MappingKind, ResolvedMapping, SyncError, SyncPlan, SyncResult, ALWAYS_EXCLUDE,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Execute a plan: stage, transform, diff, and (unless dry-run) merge.
///
/// The live tree is never touched before every mapping has staged and
/// transformed cleanly; the first error aborts the run with staging
/// discarded on the next attempt.
pub fn execute(plan: &SyncPlan) -> Result<SyncResult, SyncError> {
    let start = Instant::now();
    let excludes = build_exclude_set(&plan.exclude_patterns)?;

    reset_staging(&plan.staging_dir)?;

    for mapping in &plan.mappings {
        let staged = stage_mapping(plan, mapping, &excludes)?;
        debug!(
            destination = mapping.destination.as_str(),
            files = staged.len(),
            "mapping staged"
        );
        if mapping.template {
            template_pass(plan, &staged)?;
        }
        if let Some(hook) = &mapping.apply_patches {
            for (abs, rel) in &staged {
                hook(abs, rel)?;
            }
        }
    }

    let projects_synced = list_projects(&plan.staging_dir, &plan.mappings)?;

    let roots = managed_roots(&plan.mappings);
    let mut report = DiffReport::default();
    for root in &roots {
        diff_root(plan, root, &excludes, &mut report)?;
    }
    report.added.sort();
    report.modified.sort();
    report.deleted.sort();

    if !plan.dry_run {
        apply_report(plan, &report)?;
        for root in &roots {
            prune_empty_dirs(&plan.live_dir.join(root))?;
        }
    }

    let result = SyncResult {
        files_added: report.added.len(),
        files_modified: report.modified.len(),
        files_deleted: report.deleted.len(),
        projects_synced,
        duration: start.elapsed(),
        dry_run_diff: plan.dry_run.then_some(report),
    };

    // Staging content has served its purpose either way
    if plan.staging_dir.exists() {
        fs::remove_dir_all(&plan.staging_dir)
            .map_err(|e| SyncError::io(&plan.staging_dir, e))?;
    }

    Ok(result)
}

/// Compile the exclude set, always folding in the engine-enforced pattern
fn build_exclude_set(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns.iter().map(String::as_str).chain([ALWAYS_EXCLUDE]) {
        let glob = Glob::new(pattern).map_err(|e| SyncError::ExcludeGlobInvalid {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| SyncError::ExcludeGlobInvalid {
        pattern: patterns.join(","),
        message: e.to_string(),
    })
}

fn reset_staging(staging_dir: &Path) -> Result<(), SyncError> {
    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir).map_err(|e| SyncError::io(staging_dir, e))?;
    }
    fs::create_dir_all(staging_dir).map_err(|e| SyncError::io(staging_dir, e))?;
    Ok(())
}

/// Stage one mapping; returns (absolute staged path, path relative to the
/// mapping root) for every file written
fn stage_mapping(
    plan: &SyncPlan,
    mapping: &ResolvedMapping,
    excludes: &GlobSet,
) -> Result<Vec<(PathBuf, PathBuf)>, SyncError> {
    let meta = match fs::symlink_metadata(&mapping.source) {
        Ok(meta) => meta,
        Err(_) if !mapping.required => {
            debug!(
                source = %mapping.source.display(),
                "optional source missing, skipping mapping"
            );
            return Ok(Vec::new());
        }
        Err(_) => {
            return Err(SyncError::RequiredSourceMissing {
                source_path: mapping.source.clone(),
                destination: mapping.destination.clone(),
            })
        }
    };

    match mapping.type_hint {
        Some(MappingKind::Dir) if !meta.is_dir() => {
            return Err(SyncError::TypeHintMismatch {
                source_path: mapping.source.clone(),
                destination: mapping.destination.clone(),
                expected: MappingKind::Dir,
            })
        }
        Some(MappingKind::File) if meta.is_dir() => {
            return Err(SyncError::TypeHintMismatch {
                source_path: mapping.source.clone(),
                destination: mapping.destination.clone(),
                expected: MappingKind::File,
            })
        }
        _ => {}
    }

    let mut staged = Vec::new();

    if meta.is_dir() {
        for entry in WalkDir::new(&mapping.source).follow_links(false) {
            let entry = entry.map_err(|e| SyncError::Io {
                path: mapping.source.clone(),
                source: e.into(),
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&mapping.source)
                .expect("walked entries live under the walk root");
            let dest_rel = join_rel(&mapping.destination, rel);
            if excludes.is_match(&dest_rel) {
                trace!(path = dest_rel.as_str(), "excluded from staging");
                continue;
            }
            let target = plan.staging_dir.join(&dest_rel);
            copy_entry(entry.path(), &target)?;
            staged.push((target, rel.to_path_buf()));
        }
    } else {
        let dest_rel = mapping.destination.clone();
        if excludes.is_match(&dest_rel) {
            return Ok(staged);
        }
        let target = plan.staging_dir.join(&dest_rel);
        copy_entry(&mapping.source, &target)?;
        let rel = Path::new(&mapping.destination)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        staged.push((target, rel));
    }

    Ok(staged)
}

/// Join a destination prefix and a source-relative path with forward slashes
fn join_rel(destination: &str, rel: &Path) -> String {
    let mut joined = destination.trim_matches('/').to_string();
    for component in rel.components() {
        if !joined.is_empty() {
            joined.push('/');
        }
        joined.push_str(&component.as_os_str().to_string_lossy());
    }
    joined
}

/// Copy one file or symlink, preserving mode, creating parent directories.
/// Whatever sits at the target (file, link, or directory) is replaced.
fn copy_entry(source: &Path, target: &Path) -> Result<(), SyncError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
    }
    if let Ok(existing) = fs::symlink_metadata(target) {
        if existing.is_dir() {
            fs::remove_dir_all(target).map_err(|e| SyncError::io(target, e))?;
        } else {
            fs::remove_file(target).map_err(|e| SyncError::io(target, e))?;
        }
    }
    let meta = fs::symlink_metadata(source).map_err(|e| SyncError::io(source, e))?;
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source).map_err(|e| SyncError::io(source, e))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link, target).map_err(|e| SyncError::io(target, e))?;
        #[cfg(not(unix))]
        return Err(SyncError::io(
            target,
            std::io::Error::other("symlinks unsupported on this platform"),
        ));
    } else {
        fs::copy(source, target).map_err(|e| SyncError::io(target, e))?;
    }
    Ok(())
}

/// Template pass over the regular files staged by one mapping
fn template_pass(plan: &SyncPlan, staged: &[(PathBuf, PathBuf)]) -> Result<(), SyncError> {
    let Some(hook) = &plan.apply_template else {
        return Ok(());
    };
    for (abs, _) in staged {
        let meta = fs::symlink_metadata(abs).map_err(|e| SyncError::io(abs, e))?;
        if !meta.is_file() {
            continue;
        }
        let bytes = fs::read(abs).map_err(|e| SyncError::io(abs, e))?;
        if bytes.contains(&0) {
            return Err(SyncError::BinaryTemplateInput { path: abs.clone() });
        }
        if !bytes.windows(2).any(|pair| pair == b"{{") {
            continue;
        }
        hook(abs)?;
    }
    Ok(())
}

/// Distinct destination prefixes, with subpaths of other entries removed
fn managed_roots(mappings: &[ResolvedMapping]) -> Vec<String> {
    let mut roots: Vec<String> = Vec::new();
    for mapping in mappings {
        let candidate = mapping.destination.trim_matches('/').to_string();
        if candidate.is_empty() {
            continue;
        }
        if roots
            .iter()
            .any(|root| candidate == *root || candidate.starts_with(&format!("{root}/")))
        {
            continue;
        }
        roots.retain(|root| !root.starts_with(&format!("{candidate}/")));
        roots.push(candidate);
    }
    roots.sort();
    roots.dedup();
    roots
}

#[derive(Debug, PartialEq, Eq)]
enum TreeEntry {
    File { bytes: u64 },
    Symlink { target: PathBuf },
}

/// Collect files and symlinks under `root`, keyed by forward-slash relative
/// path. `skip` excludes a nested subtree (the staging dir during live
/// walks).
fn collect_tree(
    root: &Path,
    skip: Option<&Path>,
) -> Result<BTreeMap<String, TreeEntry>, SyncError> {
    let mut entries = BTreeMap::new();
    if fs::symlink_metadata(root).is_err() {
        return Ok(entries);
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| SyncError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if entry.path() == root {
            continue;
        }
        if skip.is_some_and(|skip| entry.path().starts_with(skip)) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked entries live under the walk root");
        let key = join_rel("", rel);
        if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| SyncError::io(entry.path(), e))?;
            entries.insert(key, TreeEntry::Symlink { target });
        } else if entry.file_type().is_file() {
            entries.insert(
                key,
                TreeEntry::File {
                    bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
                },
            );
        }
    }
    Ok(entries)
}

/// Diff staging vs live under one managed root, appending to the report.
///
/// A root with no staged content is left alone entirely, so a skipped
/// optional mapping never wipes live state.
fn diff_root(
    plan: &SyncPlan,
    root: &str,
    excludes: &GlobSet,
    report: &mut DiffReport,
) -> Result<(), SyncError> {
    let staging_root = plan.staging_dir.join(root);
    if fs::symlink_metadata(&staging_root).is_err() {
        debug!(root, "no staged content, leaving live tree untouched");
        return Ok(());
    }
    let live_root = plan.live_dir.join(root);

    let staged = collect_tree(&staging_root, None)?;
    let live = collect_tree(&live_root, Some(&plan.staging_dir))?;

    // Single-file root: the root itself is the entry
    if staged.is_empty() && staging_root.is_file() {
        let live_path = &live_root;
        if fs::symlink_metadata(live_path).is_err() {
            report.added.push(root.to_string());
        } else if !contents_equal(&staging_root, live_path)? {
            report.modified.push(root.to_string());
        }
        return Ok(());
    }

    for (rel, staged_entry) in &staged {
        let full = join_rel(root, Path::new(rel));
        match live.get(rel) {
            None => report.added.push(full),
            Some(live_entry) => {
                let changed = match (staged_entry, live_entry) {
                    (TreeEntry::Symlink { target: a }, TreeEntry::Symlink { target: b }) => a != b,
                    (TreeEntry::File { .. }, TreeEntry::File { .. }) => {
                        !contents_equal(&staging_root.join(rel), &live_root.join(rel))?
                    }
                    _ => true,
                };
                if changed {
                    report.modified.push(full);
                }
            }
        }
    }

    for rel in live.keys() {
        if staged.contains_key(rel) {
            continue;
        }
        let full = join_rel(root, Path::new(rel));
        if excludes.is_match(&full) {
            trace!(path = full.as_str(), "excluded from orphan cleanup");
            continue;
        }
        report.deleted.push(full);
    }

    Ok(())
}

fn contents_equal(a: &Path, b: &Path) -> Result<bool, SyncError> {
    let meta_a = fs::metadata(a).map_err(|e| SyncError::io(a, e))?;
    let meta_b = fs::metadata(b).map_err(|e| SyncError::io(b, e))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let bytes_a = fs::read(a).map_err(|e| SyncError::io(a, e))?;
    let bytes_b = fs::read(b).map_err(|e| SyncError::io(b, e))?;
    Ok(bytes_a == bytes_b)
}

/// Delete orphans, then copy adds and modifications from staging to live.
/// Deletions go first so a path can flip between file and directory shapes
/// in one merge.
fn apply_report(plan: &SyncPlan, report: &DiffReport) -> Result<(), SyncError> {
    for rel in &report.deleted {
        let target = plan.live_dir.join(rel);
        if fs::symlink_metadata(&target).is_ok() {
            fs::remove_file(&target).map_err(|e| SyncError::io(&target, e))?;
        }
    }
    for rel in report.added.iter().chain(&report.modified) {
        let source = plan.staging_dir.join(rel);
        let target = plan.live_dir.join(rel);
        copy_entry(&source, &target)?;
    }
    Ok(())
}

/// Remove directories left empty by orphan cleanup, bottom-up, keeping the
/// root itself
fn prune_empty_dirs(root: &Path) -> Result<(), SyncError> {
    if fs::symlink_metadata(root).is_err() {
        return Ok(());
    }
    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| SyncError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if entry.path() == root || !entry.file_type().is_dir() {
            continue;
        }
        if fs::read_dir(entry.path())
            .map(|mut dir| dir.next().is_none())
            .unwrap_or(false)
        {
            fs::remove_dir(entry.path()).map_err(|e| SyncError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

/// Top-level directory names staged under any "projects" destination
fn list_projects(
    staging_dir: &Path,
    mappings: &[ResolvedMapping],
) -> Result<Vec<String>, SyncError> {
    let mut projects = Vec::new();
    if !mappings
        .iter()
        .any(|m| m.destination.trim_matches('/') == "projects")
    {
        return Ok(projects);
    }
    let projects_dir = staging_dir.join("projects");
    if let Ok(read) = fs::read_dir(&projects_dir) {
        for entry in read.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                projects.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    projects.sort();
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_roots_dedup_subpaths() {
        let mapping = |dest: &str| ResolvedMapping {
            source: PathBuf::from("/src"),
            destination: dest.to_string(),
            type_hint: None,
            required: true,
            template: false,
            apply_patches: None,
        };
        let roots = managed_roots(&[
            mapping("projects/sub"),
            mapping("projects"),
            mapping("configs"),
            mapping("projects/other"),
        ]);
        assert_eq!(roots, vec!["configs".to_string(), "projects".to_string()]);
    }

    #[test]
    fn join_rel_normalizes_slashes() {
        assert_eq!(join_rel("projects", Path::new("a/b.json")), "projects/a/b.json");
        assert_eq!(join_rel("", Path::new("a/b.json")), "a/b.json");
        assert_eq!(join_rel("x/", Path::new("y")), "x/y");
    }
}
