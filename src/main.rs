//! Kitchen Pipeline CLI
//!
//! Runs one kitchen job on the current executor.
//!
//! ## Commands
//!
//! - `run`: execute the pipeline and write the run report
//! - `config`: print the resolved configuration and environment bindings
//!
//! Exit status is 0 when the build succeeded, 1 when it failed and 2 when
//! the configuration was rejected before anything ran.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kitchen_pipeline::{
    Collaborators, EnvironmentBindings, Pipeline, RunConfig, RunParameters, Validate,
};

const CONFIG_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "kitchen-pipeline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CI pipeline executor for test-kitchen VM jobs", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, env = "KITCHEN_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Job workspace (default: current directory)
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run(TriggerArgs),

    /// Print the resolved configuration and environment bindings
    Config(TriggerArgs),
}

/// What the trigger supplies, plus per-run overrides of the config file.
#[derive(Args)]
struct TriggerArgs {
    /// Run the full test suite (also gates coverage upload)
    #[arg(long, env = "KITCHEN_PIPELINE_RUN_FULL", default_value_t = true, action = ArgAction::Set)]
    run_full: bool,

    /// Executor node name
    #[arg(long, env = "NODE_NAME", default_value = "")]
    node_name: String,

    /// Job name used in chat messages
    #[arg(long, env = "JOB_NAME", default_value = "")]
    job_name: String,

    /// Build number used in chat messages
    #[arg(long, env = "BUILD_NUMBER", default_value = "")]
    build_number: String,

    /// Build URL used in chat messages
    #[arg(long, env = "BUILD_URL", default_value = "")]
    build_url: String,

    /// Commit receiving GitHub statuses
    #[arg(long, env = "GIT_COMMIT")]
    commit: Option<String>,

    /// Override the target branch
    #[arg(long)]
    target_branch: Option<String>,

    /// Override the converge + test budget, in hours
    #[arg(long)]
    testrun_timeout_hours: Option<u64>,
}

impl TriggerArgs {
    fn parameters(&self) -> RunParameters {
        RunParameters {
            run_full: self.run_full,
            node_name: self.node_name.clone(),
            job_name: self.job_name.clone(),
            build_number: self.build_number.clone(),
            build_url: self.build_url.clone(),
            commit_sha: self.commit.clone(),
        }
    }

    fn apply(&self, config: &mut RunConfig) {
        if let Some(branch) = &self.target_branch {
            config.job.target_branch = branch.clone();
        }
        if let Some(hours) = self.testrun_timeout_hours {
            config.job.testrun_timeout_hours = hours;
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Loads, overrides and validates the config; logs warnings.
fn resolve_config(cli: &Cli, trigger: &TriggerArgs) -> kitchen_pipeline::Result<RunConfig> {
    let mut config = RunConfig::load(cli.config.as_deref())?;
    trigger.apply(&mut config);
    for warning in config.validate().into_result()? {
        tracing::warn!(warning = %warning, "config warning");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let trigger = match &cli.command {
        Commands::Run(args) | Commands::Config(args) => args,
    };

    let config = match resolve_config(&cli, trigger) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(CONFIG_ERROR);
        }
    };
    let params = trigger.parameters();

    let root = match &cli.workspace {
        Some(path) => path.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, "cannot determine the workspace directory");
                return ExitCode::from(CONFIG_ERROR);
            }
        },
    };

    match cli.command {
        Commands::Config(_) => {
            match toml::to_string_pretty(&config) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    tracing::error!(error = %e, "cannot render configuration");
                    return ExitCode::from(CONFIG_ERROR);
                }
            }
            println!("# environment bindings");
            for (name, value) in EnvironmentBindings::from_config(&config, &params).iter() {
                println!("# {}={}", name, value);
            }
            ExitCode::SUCCESS
        }
        Commands::Run(_) => {
            let parts = match Collaborators::production(&config, &params, &root) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::error!(error = %e, "cannot set up collaborators");
                    return ExitCode::from(CONFIG_ERROR);
                }
            };

            let report_path = root.join(&config.artifacts.report_path);
            let pipeline = Pipeline::new(config, params, &root, parts);
            tracing::info!(key = %pipeline.key(), workspace = %root.display(), "starting run");

            let report = pipeline.run().await;
            if let Err(e) = report.write_to(&report_path) {
                tracing::warn!(path = %report_path.display(), error = %e, "failed to write run report");
            }

            println!("{} {:?} in {:?}", report.vm_key, report.result, report.duration);
            ExitCode::from(report.result.exit_code() as u8)
        }
    }
}
