//! Scoped credential bindings for external invocations.
//!
//! A [`SecretScope`] resolves named credential handles into environment
//! variables for exactly one block of work. Values never enter the shared
//! environment bindings and are redacted from every logged line.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named credential handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Environment variable the value is bound to inside the scope.
    pub name: String,
    /// Where the execution environment keeps the value.
    pub source: SecretSource,
}

impl SecretRef {
    /// Handle read from an environment variable of the same name.
    pub fn env(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: SecretSource::EnvVar(name.clone()),
            name,
        }
    }

    /// Handle bound to `name`, read from another environment variable.
    pub fn env_as(name: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SecretSource::EnvVar(var.into()),
        }
    }
}

/// Source from which to retrieve a secret value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// Read from an environment variable.
    EnvVar(String),
    /// Read from a file, trimming surrounding whitespace.
    File(PathBuf),
    /// Provided directly (for testing only).
    Direct(String),
}

/// Error type for secret operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// Secret source could not be found or read.
    #[error("secret not found: {0}")]
    NotFound(String),
}

/// Secrets resolved for a single block of work.
///
/// Values are wiped when the scope is dropped.
#[derive(Default)]
pub struct SecretScope {
    /// Resolved secrets (name -> value).
    secrets: HashMap<String, String>,
    /// Values sorted by length descending so longer values are replaced first.
    redaction_order: Vec<(String, String)>,
}

impl SecretScope {
    /// A scope with no secrets bound.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolves every handle, failing on the first one that cannot be read.
    pub fn resolve(refs: &[SecretRef]) -> Result<Self, SecretError> {
        let mut scope = Self::empty();
        for secret_ref in refs {
            scope.bind(secret_ref)?;
        }
        Ok(scope)
    }

    fn bind(&mut self, secret_ref: &SecretRef) -> Result<(), SecretError> {
        let value = match &secret_ref.source {
            SecretSource::EnvVar(var_name) => env::var(var_name).map_err(|_| {
                SecretError::NotFound(format!(
                    "environment variable '{}' not set for handle '{}'",
                    var_name, secret_ref.name
                ))
            })?,
            SecretSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| {
                    SecretError::NotFound(format!(
                        "cannot read file '{}' for handle '{}': {}",
                        path.display(),
                        secret_ref.name,
                        e
                    ))
                })?
                .trim()
                .to_string(),
            SecretSource::Direct(value) => value.clone(),
        };

        if !value.is_empty() {
            self.redaction_order
                .retain(|(name, _)| name != &secret_ref.name);
            self.redaction_order
                .push((secret_ref.name.clone(), value.clone()));
            self.redaction_order
                .sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        }
        self.secrets.insert(secret_ref.name.clone(), value);

        Ok(())
    }

    /// Returns the variables to inject into a spawned process.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.secrets
    }

    /// Returns the value bound to `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    /// Replaces every bound value in `text` with `[REDACTED:<name>]`.
    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (name, value) in &self.redaction_order {
            result = result.replace(value.as_str(), &format!("[REDACTED:{}]", name));
        }
        result
    }

    /// Returns true if no secrets are bound.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Returns the number of bound secrets.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }
}

impl Drop for SecretScope {
    fn drop(&mut self) {
        self.secrets.clear();
        self.redaction_order.clear();
    }
}

impl std::fmt::Debug for SecretScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.secrets.keys().collect();
        names.sort();
        f.debug_struct("SecretScope").field("names", &names).finish()
    }
}
