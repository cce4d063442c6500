//! Per-phase kitchen log rotation.
//!
//! Kitchen appends every action to `{key}.log` and `kitchen.log`. After each
//! phase the current files are moved aside as `{key}-{phase}.log` and
//! `kitchen-{phase}.log` so the archive keeps one log per phase.

use std::path::{Path, PathBuf};

use super::{KitchenPhase, VmKey};

/// Kitchen log directory of a workspace.
#[derive(Debug, Clone)]
pub struct KitchenLogs {
    dir: PathBuf,
}

impl KitchenLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Moves non-empty logs aside for `phase`, returning the new paths.
    pub fn rotate(&self, key: &VmKey, phase: KitchenPhase) -> std::io::Result<Vec<PathBuf>> {
        let suffix = phase.log_suffix();
        let moves = [
            (format!("{}.log", key), format!("{}-{}.log", key, suffix)),
            ("kitchen.log".to_string(), format!("kitchen-{}.log", suffix)),
        ];

        let mut rotated = Vec::new();
        for (from, to) in moves {
            let from = self.dir.join(from);
            let non_empty = std::fs::metadata(&from)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false);
            if non_empty {
                let to = self.dir.join(to);
                std::fs::rename(&from, &to)?;
                tracing::debug!(from = %from.display(), to = %to.display(), "rotated kitchen log");
                rotated.push(to);
            }
        }
        Ok(rotated)
    }
}
