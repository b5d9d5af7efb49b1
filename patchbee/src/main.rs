//! patchbee command-line interface.
//!
//! `auto` runs the generate/apply/verify loop against a test command,
//! `assist` makes a single request and writes the files it returns,
//! `accumulate` prints the code context the model would see, and `config`
//! manages the TOML configuration.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use patchbee::assist::{AssistRequest, run_assist};
use patchbee::core::context::CodeContext;
use patchbee::core::types::{ApplyMode, Iteration, IterationFailure};
use patchbee::exit_codes;
use patchbee::io::accumulator::{AccumulateOptions, accumulate};
use patchbee::io::backend::ChatCompletionsBackend;
use patchbee::io::config::{Config, default_config_path, load_config, write_config};
use patchbee::io::decoder::Decoder;
use patchbee::io::files::project_root;
use patchbee::io::prompt::{Prompts, TaskDescription};
use patchbee::io::verify::{CommandVerifier, display_command, read_script};
use patchbee::logging;
use patchbee::workflow::{Collaborators, WorkflowConfig, WorkflowRequest, run_workflow};

#[derive(Parser)]
#[command(
    name = "patchbee",
    version,
    about = "Test-driven code modification agent"
)]
struct Cli {
    /// Config file (defaults to <config dir>/patchbee/config.toml).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Log progress to stderr (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the code context that would be sent to the model.
    Accumulate {
        #[command(flatten)]
        context: ContextArgs,
        /// Write the context to this file instead of stdout.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Make a single request and write the returned files into a directory.
    Assist {
        /// What to build or change.
        instructions: String,
        /// Directory the generated files are written into.
        #[arg(short, long, default_value = ".beecode.d", value_name = "DIR")]
        output: PathBuf,
        #[command(flatten)]
        context: ContextArgs,
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Iterate until the verification command passes.
    ///
    /// `--test` consumes every following argument, so pass it last.
    Auto {
        /// Extra instructions for the model.
        #[arg(long)]
        instructions: Option<String>,
        /// Maximum generate/apply/verify attempts.
        #[arg(long, value_name = "N")]
        max_iterations: Option<u32>,
        /// How proposals are applied.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[command(flatten)]
        context: ContextArgs,
        #[command(flatten)]
        backend: BackendArgs,
        /// Verification command and its arguments; exit code 0 means success.
        #[arg(
            long = "test",
            value_name = "CMD",
            required = true,
            num_args = 1..,
            allow_hyphen_values = true
        )]
        test: Vec<String>,
    },
    /// Inspect or edit the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with the API key masked.
    Show,
    /// Set a dotted key such as `backend.model` or `workflow.max_iterations`.
    Set { key: String, value: String },
    /// Print the configuration file path.
    Path,
}

#[derive(Args)]
struct ContextArgs {
    /// Only accumulate files under this path.
    #[arg(long, value_name = "PATH")]
    path: Option<PathBuf>,
    /// Keep comments in the accumulated code.
    #[arg(long)]
    no_scrub: bool,
}

#[derive(Args)]
struct BackendArgs {
    /// API key; overrides `backend.api_key`.
    #[arg(long, env = "PATCHBEE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Model name; overrides `backend.model`.
    #[arg(long)]
    model: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Unified diff applied with `git apply`.
    Patch,
    /// Whole-file JSON edits written directly.
    Direct,
}

impl From<ModeArg> for ApplyMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Patch => ApplyMode::Patch,
            ModeArg::Direct => ApplyMode::Direct,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    match cli.command {
        Command::Accumulate { context, out } => cmd_accumulate(&config_path, &context, out),
        Command::Assist {
            instructions,
            output,
            context,
            backend,
        } => cmd_assist(&config_path, &instructions, &output, &context, &backend),
        Command::Auto {
            instructions,
            max_iterations,
            mode,
            context,
            backend,
            test,
        } => {
            let mut config = load_config(&config_path)?;
            apply_backend_overrides(&mut config, &backend);
            if let Some(max) = max_iterations {
                config.workflow.max_iterations = max;
            }
            if let Some(mode) = mode {
                config.workflow.mode = mode.into();
            }
            cmd_auto(&config, instructions, &context, test)
        }
        Command::Config { action } => cmd_config(&config_path, action),
    }
}

fn cmd_accumulate(config_path: &Path, args: &ContextArgs, out: Option<PathBuf>) -> Result<i32> {
    let config = load_config(config_path)?;
    let (_, context) = build_context(&config, args)?;
    let rendered = context.render();
    match out {
        Some(path) => {
            fs::write(&path, &rendered).with_context(|| format!("write {}", path.display()))?;
            eprintln!("wrote {} files to {}", context.len(), path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(exit_codes::OK)
}

fn cmd_assist(
    config_path: &Path,
    instructions: &str,
    output: &Path,
    args: &ContextArgs,
    backend_args: &BackendArgs,
) -> Result<i32> {
    let mut config = load_config(config_path)?;
    apply_backend_overrides(&mut config, backend_args);
    config.backend.ensure_complete()?;
    if instructions.trim().is_empty() {
        bail!("instructions must not be empty");
    }
    let (root, context) = build_context(&config, args)?;
    let output_dir = absolute(output)?;

    let prompts = Prompts::new()?;
    let backend = ChatCompletionsBackend::new(config.backend.clone())?;
    let fixer = ChatCompletionsBackend::new(config.backend.for_fixer())?;
    let decoder = Decoder::new(&fixer, &prompts)?;

    let outcome = run_assist(
        &AssistRequest {
            root: &root,
            output_dir: &output_dir,
            context: &context,
            instructions,
        },
        &prompts,
        &backend,
        &decoder,
    )?;

    if outcome.repaired {
        eprintln!("note: the response was malformed and repaired by the fixer model");
    }
    for path in &outcome.report.written {
        println!("{}", outcome.output_dir.join(path).display());
    }
    for violation in &outcome.report.rejected {
        eprintln!("skipped: {violation}");
    }
    Ok(exit_codes::OK)
}

fn cmd_auto(
    config: &Config,
    instructions: Option<String>,
    args: &ContextArgs,
    test: Vec<String>,
) -> Result<i32> {
    config.validate()?;
    config.backend.ensure_complete()?;
    let (root, context) = build_context(config, args)?;

    let task = TaskDescription {
        instructions,
        command: display_command(&test),
        script: read_script(&root, &test),
    };
    let workflow = WorkflowConfig {
        mode: config.workflow.mode,
        max_iterations: config.workflow.max_iterations,
    };
    let verifier = CommandVerifier::new(
        test.clone(),
        Duration::from_secs(config.workflow.verify_timeout_secs),
        config.workflow.output_limit_bytes,
    );
    let prompts = Prompts::new()?;
    let backend = ChatCompletionsBackend::new(config.backend.clone())?;
    let fixer = ChatCompletionsBackend::new(config.backend.for_fixer())?;
    let decoder = Decoder::new(&fixer, &prompts)?;

    eprintln!(
        "patchbee: {} files in context, mode {}, model {}, up to {} iterations",
        context.len(),
        workflow.mode.as_str(),
        backend.model(),
        workflow.max_iterations
    );
    let outcome = run_workflow(
        &WorkflowRequest {
            root: &root,
            config: workflow,
            context: &context,
            task: &task,
            command: &test,
        },
        &Collaborators {
            prompts: &prompts,
            backend: &backend,
            decoder: &decoder,
            verifier: &verifier,
        },
        |iteration| eprintln!("{}", describe_iteration(iteration, workflow.max_iterations)),
    )?;

    println!("run: {}", outcome.run_id);
    println!("report: {}", outcome.report_path.display());
    if outcome.succeeded() {
        println!(
            "verification passed after {} iteration(s)",
            outcome.state.iterations.len()
        );
        Ok(exit_codes::OK)
    } else {
        println!(
            "verification still failing after {} iteration(s); working tree reverted",
            outcome.state.iterations.len()
        );
        Ok(exit_codes::EXHAUSTED)
    }
}

fn cmd_config(config_path: &Path, action: ConfigAction) -> Result<i32> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path)?;
            println!("# {}", config_path.display());
            print!("{}", config.render_masked()?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = load_config(config_path)?;
            config.set_value(&key, &value)?;
            write_config(config_path, &config)?;
            eprintln!("updated {key} in {}", config_path.display());
        }
        ConfigAction::Path => println!("{}", config_path.display()),
    }
    Ok(exit_codes::OK)
}

fn apply_backend_overrides(config: &mut Config, args: &BackendArgs) {
    if let Some(key) = &args.api_key {
        config.backend.api_key = key.clone();
    }
    if let Some(model) = &args.model {
        config.backend.model = model.clone();
    }
}

/// Resolve the project root from the current directory and accumulate its files.
fn build_context(config: &Config, args: &ContextArgs) -> Result<(PathBuf, CodeContext)> {
    let cwd = env::current_dir().context("read current directory")?;
    let root = project_root(&cwd)?;
    let scope = match &args.path {
        Some(path) => Some(scope_relative_to(&root, &cwd.join(path))?),
        None => None,
    };
    let context = accumulate(
        &root,
        &AccumulateOptions {
            scope,
            scrub_comments: config.workflow.scrub_comments && !args.no_scrub,
        },
    )?;
    if context.is_empty() {
        bail!("no readable text files found in {}", root.display());
    }
    Ok((root, context))
}

fn scope_relative_to(root: &Path, path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("path {} does not exist", path.display()))?;
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("resolve {}", root.display()))?;
    match canonical.strip_prefix(&canonical_root) {
        Ok(rel) => Ok(rel.to_path_buf()),
        Err(_) => bail!(
            "path {} is outside the project root {}",
            path.display(),
            root.display()
        ),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(env::current_dir()
        .context("read current directory")?
        .join(path))
}

fn describe_iteration(iteration: &Iteration, max_iterations: u32) -> String {
    let status = match &iteration.failure {
        None => "verification passed".to_string(),
        Some(IterationFailure::Decode { reason, .. }) => format!("unusable response ({reason})"),
        Some(IterationFailure::Apply { reason }) => format!("apply failed ({reason})"),
        Some(IterationFailure::Verification(result)) if result.timed_out => {
            "verification timed out".to_string()
        }
        Some(IterationFailure::Verification(result)) => {
            format!("verification failed (exit {})", result.exit_code)
        }
    };
    format!(
        "iteration {}/{}: {status}",
        iteration.index, max_iterations
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbee::core::types::{IterationOutcome, VerificationResult};

    #[test]
    fn parse_auto_takes_trailing_test_command() {
        let cli = Cli::parse_from([
            "patchbee",
            "auto",
            "--max-iterations",
            "3",
            "--mode",
            "direct",
            "--test",
            "sh",
            "-c",
            "exit 1",
        ]);
        match cli.command {
            Command::Auto {
                test,
                max_iterations,
                mode,
                ..
            } => {
                assert_eq!(test, vec!["sh", "-c", "exit 1"]);
                assert_eq!(max_iterations, Some(3));
                assert_eq!(mode, Some(ModeArg::Direct));
            }
            _ => panic!("expected auto"),
        }
    }

    #[test]
    fn parse_auto_requires_test() {
        assert!(Cli::try_parse_from(["patchbee", "auto"]).is_err());
    }

    #[test]
    fn parse_assist_defaults_output_dir() {
        let cli = Cli::parse_from(["patchbee", "assist", "add a CLI flag"]);
        match cli.command {
            Command::Assist {
                output,
                instructions,
                ..
            } => {
                assert_eq!(output, PathBuf::from(".beecode.d"));
                assert_eq!(instructions, "add a CLI flag");
            }
            _ => panic!("expected assist"),
        }
    }

    #[test]
    fn parse_config_set() {
        let cli = Cli::parse_from(["patchbee", "config", "set", "backend.model", "gpt-x"]);
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::Set { .. }
            }
        ));
    }

    #[test]
    fn describes_failed_verification() {
        let iteration = Iteration {
            index: 2,
            proposal: None,
            failure: Some(IterationFailure::Verification(VerificationResult {
                exit_code: 3,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            })),
            verification: None,
            outcome: IterationOutcome::Retry,
        };
        assert_eq!(
            describe_iteration(&iteration, 5),
            "iteration 2/5: verification failed (exit 3)"
        );
    }
}
