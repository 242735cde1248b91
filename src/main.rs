//! vgrun - run a program under Valgrind
//!
//! A CLI tool that launches Valgrind against a program, streams its
//! output to the terminal and reports how the run ended.
//!
//! Exit codes:
//!   <n> - Valgrind finished; its own exit code is passed through
//!   1   - Valgrind could not be started, or a configuration error
//!   2   - Valgrind crashed
//!   130 - The run was stopped with Ctrl-C

mod cli;
mod config;
mod control;
mod error;
mod models;
mod progress;
mod runner;
mod sink;
mod tools;

use anyhow::{Context, Result};
use cli::Args;
use config::{Config, CONFIG_FILE_NAME};
use control::RunControl;
use models::RunRequest;
use progress::TaskProgress;
use sink::ConsoleSink;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("vgrun v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .vgrun.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to choose the valgrind executable, tool and options.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run Valgrind once. Returns the process exit code.
async fn run(args: Args) -> Result<i32> {
    // Load configuration
    let mut global_settings = load_config(&args)?;
    global_settings.merge_with_args(&args);

    let run_settings = load_run_settings(&args)?;
    let tool = run_settings
        .as_ref()
        .unwrap_or(&global_settings)
        .valgrind
        .tool;

    let request = RunRequest {
        debuggee: args.debuggee.clone().unwrap_or_default(),
        debuggee_args: args.debuggee_args.clone(),
        working_directory: args.cwd.clone(),
        environment: args.environment(),
        clear_environment: args.clean_env,
        tool,
        extra_arguments: args.valgrind_args.clone(),
    };

    let expected = Duration::from_secs(
        run_settings
            .as_ref()
            .unwrap_or(&global_settings)
            .general
            .expected_duration_seconds,
    );
    let progress = if args.quiet || args.no_progress || args.dry_run {
        TaskProgress::hidden(tool.progress_title(), expected)
    } else {
        TaskProgress::new(tool.progress_title(), expected)
    };
    let sink = ConsoleSink::new(progress.bar());

    let mut control = RunControl::new(request, sink, progress)
        .with_global_settings(global_settings)
        .with_settings(run_settings);

    // Handle --dry-run: print the command line and exit
    if args.dry_run {
        println!("{}", control.process_spec().command_line());
        return Ok(0);
    }

    if !control.start() {
        return Ok(control.status().exit_code());
    }

    let status = control.drive(ctrl_c()).await;
    info!("Run {}: {}", control.executable().display(), status);

    Ok(status.exit_code())
}

/// Resolves when the user presses Ctrl-C.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE_NAME);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

/// Load settings specific to this run from its working directory.
///
/// Returns `Ok(None)` when the run has no working directory of its own or
/// the directory has no settings file.
fn load_run_settings(args: &Args) -> Result<Option<Config>> {
    let Some(ref cwd) = args.cwd else {
        return Ok(None);
    };

    let same_dir = match (cwd.canonicalize(), Path::new(".").canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same_dir {
        return Ok(None);
    }

    let settings = Config::load_from_dir(cwd)?.map(|mut config| {
        info!("Found {} in {}", CONFIG_FILE_NAME, cwd.display());
        config.merge_with_args(args);
        config
    });
    Ok(settings)
}
