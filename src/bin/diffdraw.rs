//! Command-line front end.
//!
//! `run` drives simulated motors; the log shows every pen change and move.
//! Set `RUST_LOG=debug` for per-motion detail.

use clap::{Parser, Subcommand};
use diffdraw::{
    CancelToken, ExecutionError, LoggingPen, Plotter, ProgramBuilder, ProgramDocument,
    RobotConfig, SimulatedOutput, load_curves_file, load_program_file, save_program_file,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relative-frame drawing programs for a two-wheeled pen plotter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Robot config JSON; omitted fields keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a relative program from absolute curves
    Build {
        /// Curve file, `{"curves": [...]}`
        curves: PathBuf,

        /// Where to write the program document
        output: PathBuf,
    },

    /// Run a program against simulated motors
    Run {
        /// Run id to fetch from the drawing backend
        run_id: Option<String>,

        /// Read the program from a file instead of the backend
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Drawing backend base URL
        #[arg(long, default_value = "http://localhost:8000")]
        backend_url: String,
    },
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match RobotConfig::from_json_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, path = %path.display(), "cannot use config");
                return ExitCode::FAILURE;
            }
        },
        None => RobotConfig::default(),
    };

    match &cli.command {
        Command::Build { curves, output } => build(curves, output, &config),
        Command::Run {
            run_id,
            file,
            backend_url,
        } => run(run_id.as_deref(), file.as_deref(), backend_url, &config),
    }
}

fn build(input: &Path, output: &Path, config: &RobotConfig) -> ExitCode {
    let curves = match load_curves_file(input) {
        Ok(set) => set.curves,
        Err(err) => {
            error!(%err, path = %input.display(), "cannot read curves");
            return ExitCode::FAILURE;
        }
    };

    let program = ProgramBuilder::new(config.builder.clone()).build(&curves);
    if program.is_empty() {
        warn!("no usable curves, writing an empty program");
    }
    match save_program_file(&ProgramDocument::new(program), output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, path = %output.display(), "cannot write program");
            ExitCode::FAILURE
        }
    }
}

fn run(
    run_id: Option<&str>,
    file: Option<&Path>,
    backend_url: &str,
    config: &RobotConfig,
) -> ExitCode {
    let doc = match load(run_id, file, backend_url) {
        Ok(doc) => doc,
        Err(msg) => {
            error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let mut plotter = match Plotter::new(SimulatedOutput::new(), LoggingPen, config) {
        Ok(plotter) => plotter,
        Err(err) => {
            error!(%err, "cannot set up motors");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone());

    let result = plotter.run(&doc.relative_program, &cancel);
    if let Err(err) = plotter.shutdown() {
        error!(%err, "motor shutdown failed");
    }

    match result {
        Ok(summary) => {
            info!(
                motions = summary.motions,
                left_steps = summary.left_steps,
                right_steps = summary.right_steps,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(ExecutionError::Interrupted) => ExitCode::from(130),
        Err(_) => ExitCode::FAILURE,
    }
}

/// A file wins over the backend. Without either a run id is required.
fn load(
    run_id: Option<&str>,
    file: Option<&Path>,
    backend_url: &str,
) -> Result<ProgramDocument, String> {
    if let Some(path) = file {
        return load_program_file(path)
            .map_err(|err| format!("cannot load {}: {err}", path.display()));
    }
    let Some(run_id) = run_id else {
        return Err("a RUN_ID or --file is required".into());
    };
    fetch(backend_url, run_id)
}

#[cfg(feature = "fetch")]
fn fetch(base_url: &str, run_id: &str) -> Result<ProgramDocument, String> {
    diffdraw::fetch_program(base_url, run_id)
        .map_err(|err| format!("cannot fetch run {run_id}: {err}"))
}

#[cfg(not(feature = "fetch"))]
fn fetch(_: &str, run_id: &str) -> Result<ProgramDocument, String> {
    Err(format!(
        "cannot fetch run {run_id}: built without the `fetch` feature, use --file"
    ))
}

/// Cancels `token` on Ctrl-C. The run notices before its next pen move or
/// motion.
fn watch_ctrl_c(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(%err, "no Ctrl-C handling");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current motion");
                    token.cancel();
                }
            });
        });
    if let Err(err) = spawned {
        warn!(%err, "no Ctrl-C handling");
    }
}
