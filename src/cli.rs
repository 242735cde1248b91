//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::SelfModifyingCodeDetection;
use crate::tools::ValgrindTool;

/// vgrun - run a program under Valgrind
///
/// Launches Valgrind against a program, streams its output to the
/// terminal and shows a progress bar. Ctrl-C stops the run.
///
/// Examples:
///   vgrun ./my-app --input data.txt
///   vgrun --tool callgrind ./my-app
///   vgrun --smc-check all --env LD_LIBRARY_PATH=./lib ./my-app
///   vgrun --dry-run ./my-app
///   vgrun --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Program to analyze
    #[arg(value_name = "PROGRAM", required_unless_present = "init_config")]
    pub debuggee: Option<PathBuf>,

    /// Arguments passed to the program
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub debuggee_args: Vec<String>,

    /// Valgrind tool to run
    ///
    /// Defaults to the tool set in .vgrun.toml, or memcheck.
    #[arg(short, long, value_name = "TOOL")]
    pub tool: Option<ToolArg>,

    /// Path to the valgrind executable
    #[arg(long, value_name = "PATH", env = "VGRUN_VALGRIND")]
    pub valgrind: Option<String>,

    /// Self-modifying code detection mode
    #[arg(long, value_name = "MODE")]
    pub smc_check: Option<SmcCheckArg>,

    /// Working directory for the program
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Environment variable for the program (repeatable)
    ///
    /// Example: --env LD_LIBRARY_PATH=./lib
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Start the program with an empty environment
    #[arg(long)]
    pub clean_env: bool,

    /// Extra argument passed to valgrind (repeatable)
    ///
    /// Example: --valgrind-arg=--trace-children=yes
    #[arg(long = "valgrind-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub valgrind_args: Vec<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .vgrun.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the valgrind options and working directory before running
    #[arg(long)]
    pub debug_output: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Print the command line that would be run and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .vgrun.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Valgrind tool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ToolArg {
    Memcheck,
    Callgrind,
}

impl From<ToolArg> for ValgrindTool {
    fn from(tool: ToolArg) -> Self {
        match tool {
            ToolArg::Memcheck => ValgrindTool::Memcheck,
            ToolArg::Callgrind => ValgrindTool::Callgrind,
        }
    }
}

/// Values accepted by --smc-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SmcCheckArg {
    #[value(name = "none")]
    Disabled,
    Stack,
    All,
    AllNonFile,
}

impl From<SmcCheckArg> for SelfModifyingCodeDetection {
    fn from(mode: SmcCheckArg) -> Self {
        match mode {
            SmcCheckArg::Disabled => SelfModifyingCodeDetection::No,
            SmcCheckArg::Stack => SelfModifyingCodeDetection::StackOnly,
            SmcCheckArg::All => SelfModifyingCodeDetection::Everywhere,
            SmcCheckArg::AllNonFile => SelfModifyingCodeDetection::EverywhereButFile,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("missing variable name in '{}'", s)),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        match self.debuggee {
            Some(ref debuggee) if !debuggee.as_os_str().is_empty() => {}
            _ => return Err("A program to analyze is required".to_string()),
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        // Validate working directory if provided
        if let Some(ref cwd) = self.cwd {
            if !cwd.exists() {
                return Err(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                ));
            }
            if !cwd.is_dir() {
                return Err(format!(
                    "Working directory is not a directory: {}",
                    cwd.display()
                ));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Environment overrides as a map; later values win.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.env.iter().cloned().collect()
    }
}
