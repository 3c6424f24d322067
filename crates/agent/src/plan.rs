//! # Plan Building
//!
//! Turns a resolved profile from the metadata record into an executable
//! [`SyncPlan`]: renders mapping paths and patch values against the var
//! scope, re-checks path safety, and wires the template/patch hooks.

use crate::sync::{
    MappingKind, PatchSet, ResolvedMapping, SyncError, SyncPlan, TemplateHook, STAGING_DIR_NAME,
};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::Arc;
use stoker_api::crd::MappingType;
use stoker_api::template::TemplateEngine;
use stoker_api::ResolvedProfile;

/// Variable scope for one sync run: profile vars plus the built-ins bound
/// by the agent
#[must_use]
pub fn build_vars(
    profile_vars: &BTreeMap<String, String>,
    gateway_name: &str,
    pod_name: &str,
    namespace: &str,
    cr_name: &str,
    profile: &str,
    commit: &str,
    reference: &str,
) -> BTreeMap<String, String> {
    use stoker_api::template::builtin_vars as vars;
    let mut scope = profile_vars.clone();
    scope.insert(vars::GATEWAY_NAME.to_string(), gateway_name.to_string());
    scope.insert(vars::POD_NAME.to_string(), pod_name.to_string());
    scope.insert(vars::NAMESPACE.to_string(), namespace.to_string());
    scope.insert(vars::CR_NAME.to_string(), cr_name.to_string());
    scope.insert(vars::PROFILE.to_string(), profile.to_string());
    scope.insert(vars::COMMIT.to_string(), commit.to_string());
    scope.insert(
        vars::COMMIT_SHORT.to_string(),
        commit.chars().take(7).collect(),
    );
    scope.insert(vars::REF.to_string(), reference.to_string());
    scope
}

/// Clean a rendered mapping path: reject absolutes and `..`, normalize
/// separators, drop `.` components
pub fn clean_relative_path(raw: &str) -> Result<String> {
    let path = Path::new(raw.trim());
    if raw.trim().is_empty() {
        bail!("path is empty");
    }
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => bail!("path '{raw}' contains '..'"),
            Component::RootDir | Component::Prefix(_) => bail!("path '{raw}' is absolute"),
        }
    }
    if parts.is_empty() {
        bail!("path '{raw}' resolves to nothing");
    }
    if parts[0] == STAGING_DIR_NAME {
        bail!("path '{raw}' collides with the staging directory");
    }
    Ok(parts.join("/"))
}

/// Build the executable plan for one profile against one checkout
pub fn build_plan(
    profile: &ResolvedProfile,
    vars: &BTreeMap<String, String>,
    repo_path: &Path,
    live_dir: &Path,
) -> Result<SyncPlan> {
    let engine = TemplateEngine::new();
    let mut mappings = Vec::with_capacity(profile.mappings.len());

    for spec in &profile.mappings {
        let source_rel = clean_relative_path(
            &engine
                .render(&spec.source, vars)
                .with_context(|| format!("rendering source '{}'", spec.source))?,
        )
        .with_context(|| format!("mapping source '{}'", spec.source))?;
        let destination = clean_relative_path(
            &engine
                .render(&spec.destination, vars)
                .with_context(|| format!("rendering destination '{}'", spec.destination))?,
        )
        .with_context(|| format!("mapping destination '{}'", spec.destination))?;

        let type_hint = spec.r#type.map(|hint| match hint {
            MappingType::Dir => MappingKind::Dir,
            MappingType::File => MappingKind::File,
        });

        let apply_patches = if spec.patches.is_empty() {
            None
        } else {
            let mut rendered = Vec::with_capacity(spec.patches.len());
            for patch in &spec.patches {
                let mut set = Vec::with_capacity(patch.set.len());
                for (dot_path, value) in &patch.set {
                    let value = engine
                        .render(value, vars)
                        .with_context(|| format!("rendering patch value for '{dot_path}'"))?;
                    set.push((dot_path.clone(), value));
                }
                rendered.push((patch.file.clone(), set));
            }
            let default_file = match type_hint {
                Some(MappingKind::File) => Path::new(&destination)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
                _ => infer_file_default(repo_path.join(&source_rel).as_path(), &destination),
            };
            let compiled = PatchSet::compile(&rendered, default_file.as_deref())
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            Some(compiled.into_hook())
        };

        mappings.push(ResolvedMapping {
            source: repo_path.join(&source_rel),
            destination,
            type_hint,
            required: spec.required,
            template: spec.template,
            apply_patches,
        });
    }

    let apply_template = Some(template_hook(vars.clone()));

    Ok(SyncPlan {
        mappings,
        exclude_patterns: profile.exclude_patterns.clone(),
        staging_dir: live_dir.join(STAGING_DIR_NAME),
        live_dir: live_dir.to_path_buf(),
        dry_run: profile.dry_run,
        apply_template,
    })
}

/// For an untyped mapping whose source turns out to be a file, patches with
/// no glob default to the destination base filename
fn infer_file_default(source: &Path, destination: &str) -> Option<String> {
    if source.is_file() {
        Path::new(destination)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    } else {
        None
    }
}

/// Hook rendering one staged file through the shared engine
fn template_hook(vars: BTreeMap<String, String>) -> TemplateHook {
    let engine = Arc::new(TemplateEngine::new());
    Arc::new(move |path: &Path| {
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        let rendered = engine
            .render(&content, &vars)
            .map_err(|e| SyncError::Template {
                path: path.to_path_buf(),
                message: format!("{e:#}"),
            })?;
        std::fs::write(path, rendered).map_err(|e| SyncError::io(path, e))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_accepts_simple_relatives() {
        assert_eq!(clean_relative_path("projects").unwrap(), "projects");
        assert_eq!(
            clean_relative_path("./configs/db/").unwrap(),
            "configs/db"
        );
        assert_eq!(clean_relative_path("a/./b").unwrap(), "a/b");
    }

    #[test]
    fn clean_path_rejects_escapes() {
        assert!(clean_relative_path("/etc/passwd").is_err());
        assert!(clean_relative_path("../outside").is_err());
        assert!(clean_relative_path("projects/../../outside").is_err());
        assert!(clean_relative_path("").is_err());
        assert!(clean_relative_path(".").is_err());
        assert!(clean_relative_path(".stoker-staging/x").is_err());
    }

    #[test]
    fn vars_include_builtins_and_profile_vars() {
        let profile_vars = BTreeMap::from([("Tier".to_string(), "prod".to_string())]);
        let vars = build_vars(
            &profile_vars,
            "edge-01",
            "edge-01-0",
            "ignition",
            "plant",
            "default",
            "0123456789abcdef0123456789abcdef01234567",
            "main",
        );
        assert_eq!(vars.get("Tier").map(String::as_str), Some("prod"));
        assert_eq!(vars.get("GatewayName").map(String::as_str), Some("edge-01"));
        assert_eq!(vars.get("CommitShort").map(String::as_str), Some("0123456"));
    }
}
