//! Artifact archiving and test result publishing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Totals read from JUnit XML result files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JUnitSummary {
    pub files: usize,
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
}

impl JUnitSummary {
    /// Whether any test failed or errored.
    pub fn has_failures(&self) -> bool {
        self.failures > 0 || self.errors > 0
    }
}

/// Where run artifacts are kept once the VM is gone.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Archives every file matching one of `patterns`; returns the archived paths.
    ///
    /// Patterns matching nothing are not an error.
    async fn archive(&self, patterns: &[String]) -> Result<Vec<PathBuf>>;

    /// Reads JUnit XML files matching `pattern` and totals their results.
    async fn publish_test_results(&self, pattern: &str) -> Result<JUnitSummary>;
}

/// Copies artifacts into a directory of the workspace.
pub struct LocalArtifactStore {
    root: PathBuf,
    archive_dir: PathBuf,
}

impl LocalArtifactStore {
    /// `archive_dir` is resolved against `root` when relative.
    pub fn new(root: impl Into<PathBuf>, archive_dir: impl AsRef<Path>) -> Self {
        let root = root.into();
        let archive_dir = root.join(archive_dir);
        Self { root, archive_dir }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Workspace files, relative to the root, excluding the archive and `.git`.
    fn workspace_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path == self.archive_dir || path.file_name().is_some_and(|n| n == ".git") {
                    continue;
                }
                // Symlinks are never descended into.
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_symlink() && path.is_dir() {
                    tracing::debug!(path = %path.display(), "skipping directory symlink");
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push(relative.to_path_buf());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn matching(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .workspace_files()?
            .into_iter()
            .filter(|p| glob_match(pattern, p))
            .collect())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn archive(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let files = self.workspace_files()?;
        let mut archived = Vec::new();

        for file in files
            .iter()
            .filter(|f| patterns.iter().any(|p| glob_match(p, f)))
        {
            let target = self.archive_dir.join(file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(self.root.join(file), &target).map_err(|e| {
                Error::Artifact(format!("cannot archive {}: {}", file.display(), e))
            })?;
            archived.push(target);
        }

        tracing::info!(
            count = archived.len(),
            dir = %self.archive_dir.display(),
            "archived artifacts"
        );
        Ok(archived)
    }

    async fn publish_test_results(&self, pattern: &str) -> Result<JUnitSummary> {
        let files = self.matching(pattern)?;
        if files.is_empty() {
            return Err(Error::Artifact(format!(
                "no test result files match {}",
                pattern
            )));
        }

        let mut summary = JUnitSummary::default();
        for file in &files {
            let xml = std::fs::read_to_string(self.root.join(file)).map_err(|e| {
                Error::Artifact(format!("cannot read {}: {}", file.display(), e))
            })?;
            let counts = count_junit(&xml);
            summary.files += 1;
            summary.tests += counts.tests;
            summary.failures += counts.failures;
            summary.errors += counts.errors;
        }

        tracing::info!(
            files = summary.files,
            tests = summary.tests,
            failures = summary.failures,
            errors = summary.errors,
            "published test results"
        );
        Ok(summary)
    }
}

/// Counts test cases and their failure/error elements in one JUnit document.
///
/// Captured output in CDATA sections and comments is not markup.
fn count_junit(xml: &str) -> JUnitSummary {
    let xml = strip_section(&strip_section(xml, "<![CDATA[", "]]>"), "<!--", "-->");
    let count = |tag: &str| {
        xml.match_indices(tag)
            .filter(|(i, _)| {
                xml[i + tag.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c == '>' || c == '/' || c.is_whitespace())
            })
            .count() as u64
    };
    JUnitSummary {
        files: 1,
        tests: count("<testcase"),
        failures: count("<failure"),
        errors: count("<error"),
    }
}

/// Removes every `open`..`close` section; an unterminated one runs to the end.
fn strip_section(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let body = &rest[start + open.len()..];
        match body.find(close) {
            Some(end) => rest = &body[end + close.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Matches a workspace-relative path against a glob.
///
/// `*` and `?` match within one path segment, `**` matches any number of
/// whole segments.
pub fn glob_match(pattern: &str, path: &Path) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let path: Vec<&str> = path.iter().map(String::as_str).collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((segment, rest)) => match path.split_first() {
            Some((name, tail)) => match_segment(segment, name) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn match_segment(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((sp, sn)) = star {
            p = sp + 1;
            n = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn glob_matches_segments() {
        assert!(glob_match("artifacts/*", Path::new("artifacts/salt.log")));
        assert!(!glob_match("artifacts/*", Path::new("artifacts/logs/salt.log")));
        assert!(glob_match("artifacts/**/*", Path::new("artifacts/logs/minion/salt.log")));
        assert!(glob_match(".kitchen/logs/*-create.log", Path::new(".kitchen/logs/py2-ubuntu-1604-create.log")));
        assert!(!glob_match(".kitchen/logs/*-create.log", Path::new(".kitchen/logs/kitchen.log")));
        assert!(glob_match("report-?.xml", Path::new("report-1.xml")));
        assert!(!glob_match("report-?.xml", Path::new("report-10.xml")));
    }

    #[test]
    fn junit_counts_ignore_plural_tags() {
        let xml = r#"<testsuites errors="0"><testsuite name="unit" errors="1" failures="1">
            <testcase name="a"/>
            <testcase name="b"><failure message="nope">trace</failure></testcase>
            <testcase name="c"><error message="boom"/></testcase>
        </testsuite></testsuites>"#;
        let counts = count_junit(xml);
        assert_eq!(counts.tests, 3);
        assert_eq!(counts.failures, 1);
        assert_eq!(counts.errors, 1);
    }

    #[test]
    fn junit_counts_skip_captured_output() {
        let xml = r#"<testsuite>
            <testcase name="a"><system-out><![CDATA[expected <failure> in log
<error code="1"/> too]]></system-out></testcase>
            <!-- <failure message="old"/> -->
            <testcase name="b"/>
        </testsuite>"#;
        let counts = count_junit(xml);
        assert_eq!(counts.tests, 2);
        assert_eq!(counts.failures, 0);
        assert_eq!(counts.errors, 0);
    }

    #[test]
    fn strip_section_handles_unterminated_sections() {
        assert_eq!(strip_section("a<!--b-->c<!--d", "<!--", "-->"), "ac");
        assert_eq!(strip_section("plain", "<!--", "-->"), "plain");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_loops_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "artifacts/salt.log", "log");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("artifacts/loop")).unwrap();
        let store = LocalArtifactStore::new(dir.path(), "build-archive");

        let archived = store.archive(&["artifacts/**/*.log".to_string()]).await.unwrap();

        assert_eq!(archived, vec![dir.path().join("build-archive/artifacts/salt.log")]);
    }

    #[tokio::test]
    async fn archives_matching_files_preserving_layout() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "artifacts/logs/minion", "log");
        touch(dir.path(), ".kitchen/logs/py2-ubuntu-1604-verify.log", "verify");
        touch(dir.path(), ".kitchen/logs/kitchen.log", "unrotated");
        touch(dir.path(), "setup.py", "source");

        let store = LocalArtifactStore::new(dir.path(), "build-archive");
        let archived = store
            .archive(&[
                "artifacts/**/*".to_string(),
                ".kitchen/logs/*-verify.log".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(archived.len(), 2);
        assert!(store.archive_dir().join("artifacts/logs/minion").exists());
        assert!(store
            .archive_dir()
            .join(".kitchen/logs/py2-ubuntu-1604-verify.log")
            .exists());
        assert!(!store.archive_dir().join("setup.py").exists());
    }

    #[tokio::test]
    async fn archive_with_no_matches_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "build-archive");
        let archived = store.archive(&["artifacts/*".to_string()]).await.unwrap();
        assert!(archived.is_empty());
    }

    #[tokio::test]
    async fn archive_does_not_recurse_into_itself() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "artifacts/a.txt", "a");
        let store = LocalArtifactStore::new(dir.path(), "build-archive");

        store.archive(&["**/*".to_string()]).await.unwrap();
        let second = store.archive(&["**/*".to_string()]).await.unwrap();

        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn publishes_junit_totals() {
        let dir = tempfile::tempdir().unwrap();
        touch(
            dir.path(),
            "artifacts/xml-unittests-output/a.xml",
            r#"<testsuite><testcase name="x"/><testcase name="y"><failure/></testcase></testsuite>"#,
        );
        touch(
            dir.path(),
            "artifacts/xml-unittests-output/b.xml",
            r#"<testsuite><testcase name="z"/></testsuite>"#,
        );

        let store = LocalArtifactStore::new(dir.path(), "build-archive");
        let summary = store
            .publish_test_results("artifacts/xml-unittests-output/*.xml")
            .await
            .unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.tests, 3);
        assert_eq!(summary.failures, 1);
        assert!(summary.has_failures());
    }

    #[tokio::test]
    async fn missing_test_results_are_an_artifact_fault() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "build-archive");
        let err = store
            .publish_test_results("artifacts/xml-unittests-output/*.xml")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }
}
