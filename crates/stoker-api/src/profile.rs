//! # Profile Resolution
//!
//! Flattens `sync.defaults` into each named profile. The controller embeds
//! the resolved set in the metadata record; the agent picks its profile out
//! of the blob by name and never re-reads the CRD spec.
//!
//! Inheritance rules:
//! - `excludePatterns` and `vars` merge (defaults first, profile on top;
//!   profile wins on var key conflict)
//! - `syncPeriod`, `dryRun`, `designerSessionPolicy`, `paused` override
//!   when the profile sets them

use crate::crd::{DesignerSessionPolicy, GatewaySyncSpec, MappingSpec, ProfileSpec, SyncDefaults};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A profile with every inheritable field flattened in
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedProfile {
    /// Ordered mappings, verbatim from the profile spec
    pub mappings: Vec<MappingSpec>,
    /// Merged exclude globs (defaults then profile, deduplicated)
    pub exclude_patterns: Vec<String>,
    /// Merged template vars
    pub vars: BTreeMap<String, String>,
    /// Effective sync period in seconds
    pub sync_period: u64,
    /// Effective designer session policy
    pub designer_session_policy: DesignerSessionPolicy,
    /// Effective dry-run flag
    pub dry_run: bool,
    /// Effective pause flag (profile- or defaults-level; spec.paused is
    /// carried separately in the metadata record)
    pub paused: bool,
}

/// All profiles of a resource, resolved
pub type ResolvedProfileSet = BTreeMap<String, ResolvedProfile>;

/// Resolve one profile against the defaults
#[must_use]
pub fn resolve_profile(defaults: &SyncDefaults, profile: &ProfileSpec) -> ResolvedProfile {
    let mut exclude_patterns = defaults.exclude_patterns.clone();
    for pattern in &profile.exclude_patterns {
        if !exclude_patterns.contains(pattern) {
            exclude_patterns.push(pattern.clone());
        }
    }

    let mut vars = defaults.vars.clone();
    vars.extend(
        profile
            .vars
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );

    ResolvedProfile {
        mappings: profile.mappings.clone(),
        exclude_patterns,
        vars,
        sync_period: profile.sync_period.unwrap_or(defaults.sync_period),
        designer_session_policy: profile
            .designer_session_policy
            .unwrap_or(defaults.designer_session_policy),
        dry_run: profile.dry_run.unwrap_or(defaults.dry_run),
        paused: profile.paused.unwrap_or(defaults.paused),
    }
}

/// Resolve every profile of a spec
#[must_use]
pub fn resolve_profiles(spec: &GatewaySyncSpec) -> ResolvedProfileSet {
    spec.sync
        .profiles
        .iter()
        .map(|(name, profile)| (name.clone(), resolve_profile(&spec.sync.defaults, profile)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SyncDefaults {
        SyncDefaults {
            exclude_patterns: vec!["**/*.bak".to_string()],
            vars: BTreeMap::from([
                ("Region".to_string(), "emea".to_string()),
                ("Tier".to_string(), "prod".to_string()),
            ]),
            sync_period: 120,
            designer_session_policy: DesignerSessionPolicy::Wait,
            dry_run: false,
            paused: false,
        }
    }

    fn profile() -> ProfileSpec {
        ProfileSpec {
            mappings: vec![MappingSpec {
                source: "projects".to_string(),
                destination: "projects".to_string(),
                r#type: None,
                required: true,
                template: false,
                patches: Vec::new(),
            }],
            exclude_patterns: vec!["**/*.tmp".to_string(), "**/*.bak".to_string()],
            vars: BTreeMap::from([("Tier".to_string(), "staging".to_string())]),
            sync_period: Some(30),
            dry_run: None,
            designer_session_policy: None,
            paused: None,
        }
    }

    #[test]
    fn scalars_override_only_when_set() {
        let resolved = resolve_profile(&defaults(), &profile());
        assert_eq!(resolved.sync_period, 30);
        assert!(!resolved.dry_run);
        assert_eq!(
            resolved.designer_session_policy,
            DesignerSessionPolicy::Wait
        );
        assert!(!resolved.paused);
    }

    #[test]
    fn excludes_merge_without_duplicates() {
        let resolved = resolve_profile(&defaults(), &profile());
        assert_eq!(
            resolved.exclude_patterns,
            vec!["**/*.bak".to_string(), "**/*.tmp".to_string()]
        );
    }

    #[test]
    fn profile_vars_win_on_conflict() {
        let resolved = resolve_profile(&defaults(), &profile());
        assert_eq!(resolved.vars.get("Region").map(String::as_str), Some("emea"));
        assert_eq!(resolved.vars.get("Tier").map(String::as_str), Some("staging"));
    }
}
