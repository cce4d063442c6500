//! Run configuration and validation.
//!
//! [`RunConfig`] holds the static parameters of a job and is loaded from TOML,
//! then overridden from `KITCHEN_PIPELINE_*` environment variables.
//! [`RunParameters`] carries what the trigger supplies for one run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kitchen::VmKey;
use crate::retry::RetryPolicy;
use crate::secrets::SecretRef;

/// Time reserved after the converge/test phase for artifact download.
pub const ARTIFACT_GRACE: Duration = Duration::from_secs(3600);

/// Prefix of environment variables that override the config file.
pub const ENV_PREFIX: &str = "KITCHEN_PIPELINE_";

/// Job identity and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Distribution name, e.g. `ubuntu`.
    #[serde(default = "default_distro_name")]
    pub distro_name: String,
    /// Distribution version, e.g. `1604`.
    #[serde(default = "default_distro_version")]
    pub distro_version: String,
    /// Test-suite tag, e.g. `py2`.
    #[serde(default = "default_python_version")]
    pub python_version: String,
    /// Branch the change targets.
    #[serde(default = "default_branch")]
    pub target_branch: String,
    /// Branch of the golden images to boot from.
    #[serde(default = "default_branch")]
    pub golden_images_branch: String,
    /// Converge + test budget in hours.
    #[serde(default = "default_testrun_timeout_hours")]
    pub testrun_timeout_hours: u64,
    /// Bound on each cleanup, coverage and notification call, in seconds.
    #[serde(default = "default_finalizer_timeout_secs")]
    pub finalizer_timeout_secs: u64,
}

fn default_distro_name() -> String {
    "ubuntu".to_string()
}

fn default_distro_version() -> String {
    "1604".to_string()
}

fn default_python_version() -> String {
    "py2".to_string()
}

fn default_branch() -> String {
    "2019.2".to_string()
}

fn default_testrun_timeout_hours() -> u64 {
    6
}

fn default_finalizer_timeout_secs() -> u64 {
    600
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            distro_name: default_distro_name(),
            distro_version: default_distro_version(),
            python_version: default_python_version(),
            target_branch: default_branch(),
            golden_images_branch: default_branch(),
            testrun_timeout_hours: default_testrun_timeout_hours(),
            finalizer_timeout_secs: default_finalizer_timeout_secs(),
        }
    }
}

/// Settings consumed by the VM lifecycle driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitchenConfig {
    /// Command prefix; the action and instance name are appended.
    #[serde(default = "default_kitchen_command")]
    pub command: Vec<String>,
    #[serde(default = "default_driver_config")]
    pub driver_config: PathBuf,
    #[serde(default = "default_platforms_config")]
    pub platforms_config: PathBuf,
    #[serde(default = "default_verifier_config")]
    pub verifier_config: PathBuf,
    #[serde(default = "default_nox_env_name")]
    pub nox_env_name: String,
    #[serde(default = "default_true")]
    pub nox_enable_from_filenames: bool,
    #[serde(default = "default_nox_passthrough_opts")]
    pub nox_passthrough_opts: String,
    #[serde(default = "default_rbenv_version")]
    pub rbenv_version: String,
    /// Kitchen log directory, relative to the workspace.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Bound on a single destroy invocation, in seconds.
    #[serde(default = "default_destroy_timeout_secs")]
    pub destroy_timeout_secs: u64,
    #[serde(default = "default_bundle_with")]
    pub bundle_with: Vec<String>,
    #[serde(default = "default_bundle_without")]
    pub bundle_without: Vec<String>,
}

fn default_kitchen_command() -> Vec<String> {
    vec!["bundle".to_string(), "exec".to_string(), "kitchen".to_string()]
}

fn default_driver_config() -> PathBuf {
    PathBuf::from("/var/jenkins/workspace/driver.yml")
}

fn default_platforms_config() -> PathBuf {
    PathBuf::from("/var/jenkins/workspace/nox-platforms.yml")
}

fn default_verifier_config() -> PathBuf {
    PathBuf::from("/var/jenkins/workspace/nox-verifier.yml")
}

fn default_nox_env_name() -> String {
    "runtests-zeromq".to_string()
}

fn default_true() -> bool {
    true
}

fn default_nox_passthrough_opts() -> String {
    "--ssh-tests".to_string()
}

fn default_rbenv_version() -> String {
    "2.4.2".to_string()
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from(".kitchen/logs")
}

fn default_destroy_timeout_secs() -> u64 {
    1800
}

fn default_bundle_with() -> Vec<String> {
    vec!["ec2".to_string(), "windows".to_string()]
}

fn default_bundle_without() -> Vec<String> {
    ["docker", "macos", "opennebula", "vagrant"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for KitchenConfig {
    fn default() -> Self {
        Self {
            command: default_kitchen_command(),
            driver_config: default_driver_config(),
            platforms_config: default_platforms_config(),
            verifier_config: default_verifier_config(),
            nox_env_name: default_nox_env_name(),
            nox_enable_from_filenames: true,
            nox_passthrough_opts: default_nox_passthrough_opts(),
            rbenv_version: default_rbenv_version(),
            logs_dir: default_logs_dir(),
            destroy_timeout_secs: default_destroy_timeout_secs(),
            bundle_with: default_bundle_with(),
            bundle_without: default_bundle_without(),
        }
    }
}

/// Retry policy for VM creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_jitter_min_secs")]
    pub jitter_min_secs: u64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_jitter_min_secs() -> u64 {
    1
}

fn default_jitter_max_secs() -> u64 {
    15
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            jitter_min_secs: default_jitter_min_secs(),
            jitter_max_secs: default_jitter_max_secs(),
        }
    }
}

/// Artifact collection, coverage and report locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Glob patterns, relative to the workspace, of files to archive.
    #[serde(default = "default_artifact_patterns")]
    pub patterns: Vec<String>,
    /// Glob pattern of JUnit XML result files.
    #[serde(default = "default_junit_pattern")]
    pub junit_pattern: String,
    /// Directory archived files are copied into.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Coverage report produced by the test run.
    #[serde(default = "default_coverage_report")]
    pub coverage_report: PathBuf,
    /// When set, archive/publish faults fail the build.
    #[serde(default)]
    pub fail_on_publish_error: bool,
    /// Where the JSON run report is written.
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
}

fn default_artifact_patterns() -> Vec<String> {
    [
        "artifacts/*",
        "artifacts/**/*",
        ".kitchen/logs/*-create.log",
        ".kitchen/logs/*-converge.log",
        ".kitchen/logs/*-verify.log",
        ".kitchen/logs/*-download.log",
        "artifacts/xml-unittests-output/*.xml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_junit_pattern() -> String {
    "artifacts/xml-unittests-output/*.xml".to_string()
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("build-archive")
}

fn default_coverage_report() -> PathBuf {
    PathBuf::from("artifacts/coverage/coverage.xml")
}

fn default_report_path() -> PathBuf {
    PathBuf::from("build-archive/pipeline-report.json")
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            patterns: default_artifact_patterns(),
            junit_pattern: default_junit_pattern(),
            archive_dir: default_archive_dir(),
            coverage_report: default_coverage_report(),
            fail_on_publish_error: false,
            report_path: default_report_path(),
        }
    }
}

/// Where and how results are announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Node names with this prefix are PR runners.
    #[serde(default = "default_pr_node_prefix")]
    pub pr_node_prefix: String,
    /// `owner/name` of the repository receiving commit statuses.
    #[serde(default = "default_github_repo")]
    pub github_repo: String,
    #[serde(default = "default_chat_channel")]
    pub chat_channel: String,
    #[serde(default = "default_chat_color")]
    pub chat_color: String,
    #[serde(default = "default_gh_program")]
    pub gh_program: String,
}

fn default_pr_node_prefix() -> String {
    "jenkins-pr-".to_string()
}

fn default_github_repo() -> String {
    "saltstack/salt".to_string()
}

fn default_chat_channel() -> String {
    "#jenkins-prod-pr".to_string()
}

fn default_chat_color() -> String {
    "#FF0000".to_string()
}

fn default_gh_program() -> String {
    "gh".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            pr_node_prefix: default_pr_node_prefix(),
            github_repo: default_github_repo(),
            chat_channel: default_chat_channel(),
            chat_color: default_chat_color(),
            gh_program: default_gh_program(),
        }
    }
}

/// Workspace preparation and cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Remote the target branch is fetched from.
    #[serde(default = "default_git_remote")]
    pub git_remote: String,
    /// Directories removed before checkout and after the run.
    #[serde(default = "default_scratch_dirs")]
    pub scratch_dirs: Vec<PathBuf>,
}

fn default_git_remote() -> String {
    "https://github.com/saltstack/salt.git".to_string()
}

fn default_scratch_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from(".kitchen"), PathBuf::from("artifacts")]
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            git_remote: default_git_remote(),
            scratch_dirs: default_scratch_dirs(),
        }
    }
}

/// Credential handles, each resolved only inside the block that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Private key loaded into the SSH agent before converge.
    #[serde(default = "default_ssh_key")]
    pub ssh_key: PathBuf,
    /// Cloud credentials bound to every kitchen invocation.
    #[serde(default)]
    pub cloud: Vec<SecretRef>,
    #[serde(default = "default_codecov_token")]
    pub codecov_token: SecretRef,
    #[serde(default = "default_github_token")]
    pub github_token: SecretRef,
    #[serde(default = "default_chat_webhook")]
    pub chat_webhook: SecretRef,
}

fn default_ssh_key() -> PathBuf {
    PathBuf::from("~/.ssh/kitchen.pem")
}

fn default_codecov_token() -> SecretRef {
    SecretRef::env("CODECOV_TOKEN")
}

fn default_github_token() -> SecretRef {
    SecretRef::env_as("GH_TOKEN", "GITHUB_TOKEN")
}

fn default_chat_webhook() -> SecretRef {
    SecretRef::env("SLACK_WEBHOOK_URL")
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            ssh_key: default_ssh_key(),
            cloud: Vec::new(),
            codecov_token: default_codecov_token(),
            github_token: default_github_token(),
            chat_webhook: default_chat_webhook(),
        }
    }
}

/// Static parameters of a run, fixed before execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub kitchen: KitchenConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl RunConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads the config file (if any) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `KITCHEN_PIPELINE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(v) = var("TARGET_BRANCH") {
            self.job.target_branch = v;
        }
        if let Some(v) = var("GOLDEN_IMAGES_BRANCH") {
            self.job.golden_images_branch = v;
        }
        if let Some(v) = var("TEST_SUITE") {
            self.job.python_version = v;
        }
        if let Some(v) = var("DISTRO_NAME") {
            self.job.distro_name = v;
        }
        if let Some(v) = var("DISTRO_VERSION") {
            self.job.distro_version = v;
        }
        if let Some(v) = var("TESTRUN_TIMEOUT_HOURS") {
            self.job.testrun_timeout_hours = v.parse().map_err(|_| {
                Error::Config(format!("{}TESTRUN_TIMEOUT_HOURS is not a number: {}", ENV_PREFIX, v))
            })?;
        }
        if let Some(v) = var("DRIVER_CONFIG") {
            self.kitchen.driver_config = PathBuf::from(v);
        }
        if let Some(v) = var("PLATFORMS_CONFIG") {
            self.kitchen.platforms_config = PathBuf::from(v);
        }
        if let Some(v) = var("VERIFIER_CONFIG") {
            self.kitchen.verifier_config = PathBuf::from(v);
        }
        Ok(())
    }

    /// Budget for converge + test.
    pub fn testrun_timeout(&self) -> Duration {
        Duration::from_secs(self.job.testrun_timeout_hours * 3600)
    }

    /// Budget for the whole run: the test budget plus the artifact grace hour.
    pub fn global_timeout(&self) -> Duration {
        self.testrun_timeout() + ARTIFACT_GRACE
    }

    /// Bound on a single destroy invocation.
    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.kitchen.destroy_timeout_secs)
    }

    /// Bound on each step that runs after the global deadline: identity
    /// removal, coverage upload, cleanup and every notification call.
    pub fn finalizer_timeout(&self) -> Duration {
        Duration::from_secs(self.job.finalizer_timeout_secs)
    }

    /// Platform tag, e.g. `ubuntu-1604`.
    pub fn test_platform(&self) -> String {
        format!("{}-{}", self.job.distro_name, self.job.distro_version)
    }

    /// Kitchen instance name shared by every VM lifecycle call.
    pub fn vm_key(&self) -> VmKey {
        VmKey::new(&self.job.python_version, self.test_platform())
    }

    /// Coverage flag label, e.g. `ubuntu1604,py2`.
    pub fn coverage_flags(&self) -> String {
        format!(
            "{}{},{}",
            self.job.distro_name, self.job.distro_version, self.job.python_version
        )
    }

    /// Retry policy applied to VM creation.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.attempts).with_jitter_secs(
            self.retry.jitter_min_secs,
            self.retry.jitter_max_secs,
        )
    }
}

/// Parameters supplied by whatever triggered the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Run the full suite; also gates coverage upload.
    pub run_full: bool,
    /// Name of the executor node.
    pub node_name: String,
    pub job_name: String,
    pub build_number: String,
    pub build_url: String,
    /// Commit receiving GitHub statuses.
    pub commit_sha: Option<String>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            run_full: true,
            node_name: String::new(),
            job_name: String::new(),
            build_number: String::new(),
            build_url: String::new(),
            commit_sha: None,
        }
    }
}

impl RunParameters {
    /// Returns true if the executor node follows the PR runner naming scheme.
    pub fn is_pr_runner(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.node_name.starts_with(prefix)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for JobConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.testrun_timeout_hours == 0 {
            result.add_error("testrun_timeout_hours must be at least 1");
        }
        if self.finalizer_timeout_secs == 0 {
            result.add_error("finalizer_timeout_secs must be greater than 0");
        }
        if self.testrun_timeout_hours > 12 {
            result.add_warning("testrun_timeout_hours over 12 may indicate a misconfiguration");
        }
        for (field, value) in [
            ("distro_name", &self.distro_name),
            ("distro_version", &self.distro_version),
            ("python_version", &self.python_version),
            ("target_branch", &self.target_branch),
        ] {
            if value.trim().is_empty() {
                result.add_error(format!("{} cannot be empty", field));
            }
        }

        result
    }
}

impl Validate for KitchenConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.command.is_empty() {
            result.add_error("kitchen command cannot be empty");
        }
        if self.destroy_timeout_secs == 0 {
            result.add_error("destroy_timeout_secs must be greater than 0");
        }

        result
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.attempts == 0 {
            result.add_error("retry attempts must be at least 1");
        }
        if self.jitter_min_secs > self.jitter_max_secs {
            result.add_error("jitter_min_secs must not exceed jitter_max_secs");
        }
        if self.jitter_max_secs > 300 {
            result.add_warning("jitter over 5 minutes delays every VM creation attempt");
        }

        result
    }
}

impl Validate for ArtifactsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.patterns.is_empty() {
            result.add_warning("no artifact patterns configured, nothing will be archived");
        }
        if self.archive_dir.as_os_str().is_empty() {
            result.add_error("archive_dir cannot be empty");
        }

        result
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.job.validate());
        result.merge(self.kitchen.validate());
        result.merge(self.retry.validate());
        result.merge(self.artifacts.validate());
        if self.notify.github_repo.split('/').count() != 2 {
            result.add_warning(format!(
                "github_repo '{}' is not in owner/name form",
                self.notify.github_repo
            ));
        }
        result
    }
}
