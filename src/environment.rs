//! Environment variables shared by every external invocation of a run.

use std::collections::BTreeMap;

use crate::config::{RunConfig, RunParameters};

/// Read-only variable bindings assembled once per run.
///
/// Per-invocation overlays are applied by the process runner and never
/// mutate these bindings. Secrets are never stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentBindings {
    vars: BTreeMap<String, String>,
}

impl EnvironmentBindings {
    /// Builds the bindings the kitchen tooling expects.
    pub fn from_config(config: &RunConfig, params: &RunParameters) -> Self {
        let kitchen = &config.kitchen;
        let job = &config.job;

        let mut vars = BTreeMap::new();
        let mut bind = |name: &str, value: String| {
            vars.insert(name.to_string(), value);
        };

        bind(
            "SALT_KITCHEN_PLATFORMS",
            kitchen.platforms_config.display().to_string(),
        );
        bind(
            "SALT_KITCHEN_VERIFIER",
            kitchen.verifier_config.display().to_string(),
        );
        bind(
            "SALT_KITCHEN_DRIVER",
            kitchen.driver_config.display().to_string(),
        );
        bind("NOX_ENV_NAME", kitchen.nox_env_name.clone());
        bind(
            "NOX_ENABLE_FROM_FILENAMES",
            kitchen.nox_enable_from_filenames.to_string(),
        );
        bind("NOX_PASSTHROUGH_OPTS", kitchen.nox_passthrough_opts.clone());
        bind("SALT_TARGET_BRANCH", job.target_branch.clone());
        bind("GOLDEN_IMAGES_CI_BRANCH", job.golden_images_branch.clone());
        bind("CODECOV_FLAGS", config.coverage_flags());
        bind("RBENV_VERSION", kitchen.rbenv_version.clone());
        bind("TEST_SUITE", job.python_version.clone());
        bind("TEST_PLATFORM", config.test_platform());
        bind("FORCE_FULL", params.run_full.to_string());

        Self { vars }
    }

    /// Returns the value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Iterates bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
