//! # Annotation Vocabulary
//!
//! The stable annotation names shared between the admission mutator, the
//! reconciler, the push receiver, and the agent. Everything lives under the
//! single `stoker.dev/` prefix.

/// Annotation and label prefix
pub const PREFIX: &str = "stoker.dev";

/// Pod: opt the pod in to agent injection (`"true"`)
pub const INJECT: &str = "stoker.dev/inject";
/// Pod: name of the owning GatewaySync when more than one exists in the namespace
pub const CR_NAME: &str = "stoker.dev/cr-name";
/// Pod: profile selected for this gateway (must exist in sync.profiles)
pub const PROFILE: &str = "stoker.dev/profile";
/// Pod: explicit gateway name (wins over the app.kubernetes.io/name label)
pub const GATEWAY_NAME: &str = "stoker.dev/gateway-name";
/// Pod: agent image override (wins over spec.agent.image)
pub const AGENT_IMAGE: &str = "stoker.dev/agent-image";
/// Pod: sync a different ref than the resource; surfaces RefSkew on the resource
pub const REF_OVERRIDE: &str = "stoker.dev/ref-override";
/// Pod: stamped by the mutator after injection
pub const INJECTED: &str = "stoker.dev/injected";

/// Resource: ref requested by the push receiver (overrides spec.git.ref)
pub const REQUESTED_REF: &str = "stoker.dev/requested-ref";
/// Resource: RFC 3339 UTC time the ref was requested
pub const REQUESTED_AT: &str = "stoker.dev/requested-at";
/// Resource: payload source that requested the ref (github, argocd, kargo, generic)
pub const REQUESTED_BY: &str = "stoker.dev/requested-by";

/// Namespace label required in strict injection mode
pub const INJECTION_LABEL: &str = "stoker.dev/injection";
/// Value of [`INJECTION_LABEL`] that enables injection
pub const INJECTION_ENABLED: &str = "enabled";

/// Label stamped on derived records pointing back at the owning resource
pub const OWNED_BY_LABEL: &str = "stoker.dev/gateway-sync";
/// managed-by label value on derived records
pub const MANAGED_BY: &str = "stoker";

/// Finalizer guarding derived-artifact cleanup
pub const FINALIZER: &str = "stoker.dev/finalizer";

/// Name of the injected agent init container
pub const AGENT_CONTAINER_NAME: &str = "stoker-agent";

/// Read an annotation from any object metadata map
#[must_use]
pub fn get<'a>(
    annotations: Option<&'a std::collections::BTreeMap<String, String>>,
    key: &str,
) -> Option<&'a str> {
    annotations.and_then(|map| map.get(key)).map(String::as_str)
}

/// Whether the inject annotation is present and set to "true"
#[must_use]
pub fn inject_requested(
    annotations: Option<&std::collections::BTreeMap<String, String>>,
) -> bool {
    get(annotations, INJECT) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn inject_requires_literal_true() {
        let mut map = BTreeMap::new();
        assert!(!inject_requested(Some(&map)));
        map.insert(INJECT.to_string(), "false".to_string());
        assert!(!inject_requested(Some(&map)));
        map.insert(INJECT.to_string(), "True".to_string());
        assert!(!inject_requested(Some(&map)));
        map.insert(INJECT.to_string(), "true".to_string());
        assert!(inject_requested(Some(&map)));
        assert!(!inject_requested(None));
    }

    #[test]
    fn all_names_share_the_prefix() {
        for name in [
            INJECT,
            CR_NAME,
            PROFILE,
            GATEWAY_NAME,
            AGENT_IMAGE,
            REF_OVERRIDE,
            INJECTED,
            REQUESTED_REF,
            REQUESTED_AT,
            REQUESTED_BY,
            INJECTION_LABEL,
            OWNED_BY_LABEL,
            FINALIZER,
        ] {
            assert!(name.starts_with(PREFIX), "{name} missing prefix");
        }
    }
}
