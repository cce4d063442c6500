//! External process execution.
//!
//! Every stage shells out through a [`CommandRunner`]. The production
//! [`ProcessRunner`] applies the run's [`EnvironmentBindings`], any
//! per-invocation overlay and the caller's [`SecretScope`], streams output to
//! the log with secrets redacted, and kills the child if the future is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::environment::EnvironmentBindings;
use crate::error::{Error, Result};
use crate::secrets::SecretScope;

/// A command line plus its per-invocation environment overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables layered on top of the shared bindings.
    pub env: Vec<(String, String)>,
    /// Working directory, relative paths resolve against the runner's root.
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Builds a spec from a full argv, e.g. `["bundle", "exec", "kitchen"]`.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("command line cannot be empty".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// The command line as a single string, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of an external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub program: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout, secrets redacted.
    pub stdout: String,
    /// Captured stderr, secrets redacted.
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turns a non-zero exit into [`Error::Command`].
    pub fn into_result(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Command {
                program: self.program,
                code: self.code,
                stderr: tail(&self.stderr, 20),
            })
        }
    }
}

/// Last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// One output line with invalid UTF-8 replaced and the line ending removed.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion with `secrets` bound for this invocation only.
    ///
    /// A non-zero exit is returned as `Ok`; only failing to start is an error.
    async fn run(&self, spec: &CommandSpec, secrets: &SecretScope) -> Result<CommandOutput>;
}

/// Runs commands as child processes of this one.
pub struct ProcessRunner {
    bindings: Arc<EnvironmentBindings>,
    root: PathBuf,
}

impl ProcessRunner {
    /// Creates a runner executing in `root` with `bindings` applied.
    pub fn new(bindings: Arc<EnvironmentBindings>, root: impl Into<PathBuf>) -> Self {
        Self {
            bindings,
            root: root.into(),
        }
    }

    fn working_dir(&self, spec: &CommandSpec) -> PathBuf {
        match &spec.current_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.clone(),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, secrets: &SecretScope) -> Result<CommandOutput> {
        let start = Instant::now();
        let working_dir = self.working_dir(spec);

        tracing::info!(
            command = %secrets.redact(&spec.display()),
            cwd = %working_dir.display(),
            secrets = secrets.len(),
            "running command"
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(self.bindings.iter())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(secrets.environment())
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
            program: spec.program.clone(),
            reason: "stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| Error::Spawn {
            program: spec.program.clone(),
            reason: "stderr was not captured".to_string(),
        })?;

        let mut stdout_reader = BufReader::new(stdout).split(b'\n');
        let mut stderr_reader = BufReader::new(stderr).split(b'\n');
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                segment = stdout_reader.next_segment(), if stdout_open => match segment {
                    Ok(Some(bytes)) => {
                        let line = secrets.redact(&decode_line(&bytes));
                        tracing::debug!(program = %spec.program, line = %line, "stdout");
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading stdout");
                        stdout_open = false;
                    }
                },
                segment = stderr_reader.next_segment(), if stderr_open => match segment {
                    Ok(Some(bytes)) => {
                        let line = secrets.redact(&decode_line(&bytes));
                        tracing::debug!(program = %spec.program, line = %line, "stderr");
                        stderr_buf.push_str(&line);
                        stderr_buf.push('\n');
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading stderr");
                        stderr_open = false;
                    }
                },
            }
        }

        // Unread pipes would block the child on write.
        drop(stdout_reader);
        drop(stderr_reader);

        let status = child.wait().await?;
        let output = CommandOutput {
            program: spec.program.clone(),
            code: status.code(),
            stdout: stdout_buf,
            stderr: stderr_buf,
            duration: start.elapsed(),
        };

        tracing::info!(
            program = %spec.program,
            exit_code = ?output.code,
            duration_ms = output.duration.as_millis() as u64,
            "command finished"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunConfig, RunParameters};
    use crate::secrets::{SecretRef, SecretSource};

    fn runner(root: &std::path::Path) -> ProcessRunner {
        let bindings =
            EnvironmentBindings::from_config(&RunConfig::default(), &RunParameters::default());
        ProcessRunner::new(Arc::new(bindings), root)
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[test]
    fn spec_builds_display_string() {
        let spec = CommandSpec::from_argv(&["bundle".to_string(), "exec".to_string()])
            .unwrap()
            .arg("kitchen")
            .arg("create");
        assert_eq!(spec.display(), "bundle exec kitchen create");
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(CommandSpec::from_argv(&[]).is_err());
    }

    #[test]
    fn non_zero_output_converts_to_command_error() {
        let output = CommandOutput {
            program: "kitchen".to_string(),
            code: Some(1),
            stdout: String::new(),
            stderr: "converge failed\n".to_string(),
            duration: Duration::ZERO,
        };
        assert!(!output.success());
        match output.into_result() {
            Err(Error::Command { code, stderr, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "converge failed");
            }
            other => panic!("expected command error, got {:?}", other),
        }
    }

    #[test]
    fn decode_line_replaces_invalid_bytes() {
        assert_eq!(decode_line(b"bad \xff byte\r"), "bad \u{fffd} byte");
        assert_eq!(decode_line(b"plain"), "plain");
    }

    #[tokio::test]
    async fn keeps_draining_after_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let r = runner(dir.path());
        let spec = sh("printf 'bad \\377 byte\\n'; head -c 300000 /dev/zero | tr '\\0' a; echo; echo done >&2");
        let scope = SecretScope::empty();

        let output = tokio::time::timeout(Duration::from_secs(30), r.run(&spec, &scope))
            .await
            .expect("runner stalled on non-UTF-8 output")
            .unwrap();

        assert!(output.success());
        assert!(output.stdout.starts_with("bad \u{fffd} byte\n"));
        assert!(output.stdout.len() > 300_000);
        assert_eq!(output.stderr.trim(), "done");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("", 5), "");
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let output = runner(dir.path())
            .run(&sh("echo hello; exit 3"), &SecretScope::empty())
            .await
            .unwrap();

        assert_eq!(output.code, Some(3));
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn applies_bindings_and_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo $TEST_SUITE-$TEST_PLATFORM $DONT_DOWNLOAD_ARTEFACTS")
            .env("DONT_DOWNLOAD_ARTEFACTS", "1");
        let output = runner(dir.path())
            .run(&spec, &SecretScope::empty())
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "py2-ubuntu-1604 1");
    }

    #[tokio::test]
    async fn secrets_are_injected_but_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let scope = SecretScope::resolve(&[SecretRef {
            name: "CODECOV_TOKEN".to_string(),
            source: SecretSource::Direct("tok-abc-123".to_string()),
        }])
        .unwrap();

        let output = runner(dir.path())
            .run(&sh("echo token=$CODECOV_TOKEN; echo $CODECOV_TOKEN >&2"), &scope)
            .await
            .unwrap();

        assert!(output.stdout.contains("token=[REDACTED:CODECOV_TOKEN]"));
        assert!(!output.stdout.contains("tok-abc-123"));
        assert!(!output.stderr.contains("tok-abc-123"));
    }

    #[tokio::test]
    async fn runs_in_relative_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let output = runner(dir.path())
            .run(&sh("pwd").current_dir("sub"), &SecretScope::empty())
            .await
            .unwrap();
        assert!(output.stdout.trim().ends_with("sub"));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path())
            .run(
                &CommandSpec::new("kp-definitely-not-a-real-binary"),
                &SecretScope::empty(),
            )
            .await;
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[tokio::test]
    async fn dropping_the_future_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 2; touch {}", marker.display());
        let r = runner(dir.path());
        let spec = sh(&script);
        let scope = SecretScope::empty();

        let result =
            tokio::time::timeout(Duration::from_millis(200), r.run(&spec, &scope)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }
}
