//! # Templating Contract
//!
//! Mapping paths, templated files, and patch values all render through one
//! handlebars engine so the controller's validation pass and the agent's
//! rendering pass agree on what is legal.
//!
//! Contract:
//! - strings without a `{{` marker are returned untouched (fast path)
//! - unknown variables are an error (strict mode), not silent empty output
//! - var keys are simple identifiers: letters, digits, underscores

use anyhow::{Context, Result};
use handlebars::Handlebars;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VAR_KEY: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("var key regex is valid")
});

/// Whether a string contains template markers at all
#[must_use]
pub fn has_markers(input: &str) -> bool {
    input.contains("{{")
}

/// Whether a var key is a legal identifier
#[must_use]
pub fn is_valid_var_key(key: &str) -> bool {
    VAR_KEY.is_match(key)
}

/// Shared template engine
///
/// Variables resolve against a flat string map; rendering a template that
/// references an unbound variable fails rather than producing empty output.
#[derive(Debug)]
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        Self { registry }
    }

    /// Syntax-check a template without rendering it
    pub fn check(&self, template: &str) -> Result<()> {
        if !has_markers(template) {
            return Ok(());
        }
        handlebars::Template::compile(template)
            .map(|_| ())
            .with_context(|| format!("invalid template '{template}'"))
    }

    /// Render a template against the var map; fast path when no markers
    pub fn render(&self, template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
        if !has_markers(template) {
            return Ok(template.to_string());
        }
        self.registry
            .render_template(template, vars)
            .with_context(|| format!("rendering template '{template}'"))
    }
}

/// Built-in variable names always bound by the agent before rendering
pub mod builtin_vars {
    pub const GATEWAY_NAME: &str = "GatewayName";
    pub const POD_NAME: &str = "PodName";
    pub const NAMESPACE: &str = "Namespace";
    pub const CR_NAME: &str = "CrName";
    pub const PROFILE: &str = "Profile";
    pub const COMMIT: &str = "Commit";
    pub const COMMIT_SHORT: &str = "CommitShort";
    pub const REF: &str = "Ref";
}
