//! # Profile Validation
//!
//! Work-unit step 1: template-parse every mapping path and patch value,
//! check var keys, path safety, and sync-period bounds. Failures are user
//! configuration errors: they set `ProfilesValid=False` and are not
//! retried until the spec changes.

use std::path::Component;
use stoker_api::crd::{
    GatewaySyncSpec, ProfileSpec, SyncDefaults, MAX_SYNC_PERIOD_SECS, MIN_SYNC_PERIOD_SECS,
};
use stoker_api::template::{is_valid_var_key, TemplateEngine};
use thiserror::Error;

/// A validation failure, naming the offending profile
#[derive(Debug, Error)]
#[error("profile '{profile}': {message}")]
pub struct ValidationError {
    pub profile: String,
    /// Stable condition reason
    pub reason: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(profile: &str, reason: &'static str, message: String) -> Self {
        Self {
            profile: profile.to_string(),
            reason,
            message,
        }
    }
}

/// Validate the whole sync section of a spec
pub fn validate_profiles(spec: &GatewaySyncSpec) -> Result<(), ValidationError> {
    let engine = TemplateEngine::new();

    if spec.sync.profiles.is_empty() {
        return Err(ValidationError::new(
            "",
            "InvalidProfile",
            "at least one profile is required".to_string(),
        ));
    }

    validate_defaults(&spec.sync.defaults)?;

    for (name, profile) in &spec.sync.profiles {
        validate_profile(&engine, name, profile)?;
    }
    Ok(())
}

fn validate_defaults(defaults: &SyncDefaults) -> Result<(), ValidationError> {
    check_sync_period("", defaults.sync_period)?;
    for key in defaults.vars.keys() {
        if !is_valid_var_key(key) {
            return Err(ValidationError::new(
                "",
                "InvalidVarKey",
                format!("defaults var key '{key}' is not a simple identifier"),
            ));
        }
    }
    Ok(())
}

fn validate_profile(
    engine: &TemplateEngine,
    name: &str,
    profile: &ProfileSpec,
) -> Result<(), ValidationError> {
    if profile.mappings.is_empty() {
        return Err(ValidationError::new(
            name,
            "InvalidProfile",
            "profile has no mappings".to_string(),
        ));
    }
    if let Some(period) = profile.sync_period {
        check_sync_period(name, period)?;
    }
    for key in profile.vars.keys() {
        if !is_valid_var_key(key) {
            return Err(ValidationError::new(
                name,
                "InvalidVarKey",
                format!("var key '{key}' is not a simple identifier"),
            ));
        }
    }

    for (index, mapping) in profile.mappings.iter().enumerate() {
        for (field, value) in [("source", &mapping.source), ("destination", &mapping.destination)]
        {
            engine.check(value).map_err(|e| {
                ValidationError::new(
                    name,
                    "InvalidProfile",
                    format!("mapping {index} {field}: {e:#}"),
                )
            })?;
            check_path_safety(name, field, value, index)?;
        }
        for patch in &mapping.patches {
            if patch.set.is_empty() {
                return Err(ValidationError::new(
                    name,
                    "InvalidProfile",
                    format!("mapping {index} has a patch with an empty set"),
                ));
            }
            for value in patch.set.values() {
                engine.check(value).map_err(|e| {
                    ValidationError::new(
                        name,
                        "InvalidProfile",
                        format!("mapping {index} patch value: {e:#}"),
                    )
                })?;
            }
        }
    }
    Ok(())
}

fn check_sync_period(profile: &str, period: u64) -> Result<(), ValidationError> {
    if !(MIN_SYNC_PERIOD_SECS..=MAX_SYNC_PERIOD_SECS).contains(&period) {
        return Err(ValidationError::new(
            profile,
            "InvalidProfile",
            format!(
                "syncPeriod {period} outside [{MIN_SYNC_PERIOD_SECS}, {MAX_SYNC_PERIOD_SECS}]"
            ),
        ));
    }
    Ok(())
}

/// Static path safety: even before template rendering, the literal parts
/// must not introduce absolutes or parent escapes
fn check_path_safety(
    profile: &str,
    field: &str,
    value: &str,
    index: usize,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(
            profile,
            "InvalidProfile",
            format!("mapping {index} {field} is empty"),
        ));
    }
    let path = std::path::Path::new(value);
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ValidationError::new(
                    profile,
                    "PathTraversal",
                    format!("mapping {index} {field} '{value}' contains '..'"),
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ValidationError::new(
                    profile,
                    "PathTraversal",
                    format!("mapping {index} {field} '{value}' is absolute"),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stoker_api::crd::{MappingSpec, PatchSpec};

    fn spec_with(profile: ProfileSpec) -> GatewaySyncSpec {
        serde_json::from_value(serde_json::json!({
            "git": {"repo": "https://example.com/config.git"},
            "gateway": {"api": {"secretName": "gateway-api-key"}},
            "sync": {"profiles": {"default": serde_json::to_value(&profile).expect("profile")}},
        }))
        .expect("spec")
    }

    fn mapping(source: &str, destination: &str) -> MappingSpec {
        MappingSpec {
            source: source.to_string(),
            destination: destination.to_string(),
            r#type: None,
            required: true,
            template: false,
            patches: Vec::new(),
        }
    }

    fn profile(mappings: Vec<MappingSpec>) -> ProfileSpec {
        ProfileSpec {
            mappings,
            exclude_patterns: Vec::new(),
            vars: BTreeMap::new(),
            sync_period: None,
            dry_run: None,
            designer_session_policy: None,
            paused: None,
        }
    }

    #[test]
    fn a_clean_profile_passes() {
        let spec = spec_with(profile(vec![mapping("projects", "projects")]));
        assert!(validate_profiles(&spec).is_ok());
    }

    #[test]
    fn templated_paths_parse() {
        let spec = spec_with(profile(vec![mapping(
            "gateways/{{GatewayName}}",
            "config/{{GatewayName}}",
        )]));
        assert!(validate_profiles(&spec).is_ok());
    }

    #[test]
    fn broken_template_syntax_is_invalid() {
        let spec = spec_with(profile(vec![mapping("gateways/{{Gateway", "config")]));
        let err = validate_profiles(&spec).expect_err("must fail");
        assert_eq!(err.reason, "InvalidProfile");
        assert_eq!(err.profile, "default");
    }

    #[test]
    fn path_traversal_is_rejected() {
        for bad in ["../outside", "a/../../b", "/absolute"] {
            let spec = spec_with(profile(vec![mapping(bad, "dest")]));
            let err = validate_profiles(&spec).expect_err("must fail");
            assert_eq!(err.reason, "PathTraversal", "{bad} should be a traversal");
        }
    }

    #[test]
    fn bad_var_keys_are_rejected() {
        let mut bad = profile(vec![mapping("projects", "projects")]);
        bad.vars.insert("kebab-case".to_string(), "x".to_string());
        let spec = spec_with(bad);
        let err = validate_profiles(&spec).expect_err("must fail");
        assert_eq!(err.reason, "InvalidVarKey");
    }

    #[test]
    fn sync_period_bounds_are_enforced() {
        for (period, ok) in [(5, true), (3600, true), (4, false), (3601, false)] {
            let mut p = profile(vec![mapping("projects", "projects")]);
            p.sync_period = Some(period);
            let spec = spec_with(p);
            assert_eq!(validate_profiles(&spec).is_ok(), ok, "period {period}");
        }
    }

    #[test]
    fn empty_patch_sets_are_invalid() {
        let mut m = mapping("projects", "projects");
        m.patches.push(PatchSpec {
            file: None,
            set: BTreeMap::new(),
        });
        let spec = spec_with(profile(vec![m]));
        let err = validate_profiles(&spec).expect_err("must fail");
        assert!(err.message.contains("empty set"));
    }

    #[test]
    fn patch_values_are_template_checked() {
        let mut m = mapping("projects", "projects");
        m.patches.push(PatchSpec {
            file: Some("config.json".to_string()),
            set: BTreeMap::from([("SystemName".to_string(), "{{Broken".to_string())]),
        });
        let spec = spec_with(profile(vec![m]));
        assert!(validate_profiles(&spec).is_err());
    }

    #[test]
    fn profile_without_mappings_is_invalid() {
        let spec = spec_with(profile(vec![]));
        let err = validate_profiles(&spec).expect_err("must fail");
        assert!(err.message.contains("no mappings"));
    }
}
