//! Configuration file handling.
//!
//! This module handles loading and merging Valgrind settings from
//! `.vgrun.toml` files. A run uses the settings found in its working
//! directory when there are any, and the global settings otherwise.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::tools::ValgrindTool;

/// Name of the settings file looked up in the current and working directories.
pub const CONFIG_FILE_NAME: &str = ".vgrun.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Settings shared by every Valgrind tool.
    #[serde(default)]
    pub valgrind: ValgrindConfig,

    /// Memcheck settings.
    #[serde(default)]
    pub memcheck: MemcheckConfig,

    /// Callgrind settings.
    #[serde(default)]
    pub callgrind: CallgrindConfig,
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Print the Valgrind options and working directory before the run.
    #[serde(default)]
    pub debug_output: bool,

    /// Expected run time used to advance the progress bar.
    #[serde(default = "default_expected_duration")]
    pub expected_duration_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug_output: false,
            expected_duration_seconds: default_expected_duration(),
        }
    }
}

fn default_expected_duration() -> u64 {
    100
}

/// Settings shared by every Valgrind tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValgrindConfig {
    /// Path to the valgrind executable. Empty means "not configured".
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Self-modifying code detection (`--smc-check`).
    #[serde(default)]
    pub smc_check: SelfModifyingCodeDetection,

    /// Tool to run when the command line does not pick one.
    #[serde(default)]
    pub tool: ValgrindTool,

    /// Extra arguments appended after the generated ones.
    #[serde(default)]
    pub extra_arguments: Vec<String>,
}

impl Default for ValgrindConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            smc_check: SelfModifyingCodeDetection::default(),
            tool: ValgrindTool::default(),
            extra_arguments: Vec::new(),
        }
    }
}

fn default_executable() -> String {
    "valgrind".to_string()
}

/// How aggressively Valgrind looks for self-modifying code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RawSmcCheck", into = "String")]
pub enum SelfModifyingCodeDetection {
    /// Never check.
    No,
    /// Only check code on the stack.
    #[default]
    StackOnly,
    /// Check all code.
    Everywhere,
    /// Check all code that does not come from file-backed mappings.
    EverywhereButFile,
}

impl SelfModifyingCodeDetection {
    /// Value passed to `--smc-check=`.
    pub fn token(&self) -> &'static str {
        match self {
            SelfModifyingCodeDetection::No => "none",
            SelfModifyingCodeDetection::Everywhere => "all",
            SelfModifyingCodeDetection::EverywhereButFile => "all-non-file",
            SelfModifyingCodeDetection::StackOnly => "stack",
        }
    }

    /// Parse a configured value. Unknown values fall back to `StackOnly`.
    pub fn from_config_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "no" => SelfModifyingCodeDetection::No,
            "all" | "everywhere" => SelfModifyingCodeDetection::Everywhere,
            "all-non-file" | "everywhere-but-file" => {
                SelfModifyingCodeDetection::EverywhereButFile
            }
            "stack" | "stack-only" => SelfModifyingCodeDetection::StackOnly,
            other => {
                warn!("Unknown smc_check value '{}', using 'stack'", other);
                SelfModifyingCodeDetection::StackOnly
            }
        }
    }

    /// Map the numeric setting used by older settings files.
    pub fn from_index(index: i64) -> Self {
        match index {
            0 => SelfModifyingCodeDetection::No,
            2 => SelfModifyingCodeDetection::Everywhere,
            3 => SelfModifyingCodeDetection::EverywhereButFile,
            _ => SelfModifyingCodeDetection::StackOnly,
        }
    }
}

impl fmt::Display for SelfModifyingCodeDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl From<SelfModifyingCodeDetection> for String {
    fn from(mode: SelfModifyingCodeDetection) -> Self {
        mode.token().to_string()
    }
}

/// On-disk representation of `smc_check`: either a name or an index.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSmcCheck {
    Name(String),
    Index(i64),
}

impl From<RawSmcCheck> for SelfModifyingCodeDetection {
    fn from(raw: RawSmcCheck) -> Self {
        match raw {
            RawSmcCheck::Name(name) => Self::from_config_value(&name),
            RawSmcCheck::Index(index) => Self::from_index(index),
        }
    }
}

/// Memcheck leak checking mode (`--leak-check`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakCheckMode {
    No,
    Summary,
    #[default]
    Full,
}

impl LeakCheckMode {
    pub fn token(&self) -> &'static str {
        match self {
            LeakCheckMode::No => "no",
            LeakCheckMode::Summary => "summary",
            LeakCheckMode::Full => "full",
        }
    }
}

/// Memcheck settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemcheckConfig {
    #[serde(default)]
    pub leak_check: LeakCheckMode,

    /// Stack depth recorded for each error.
    #[serde(default = "default_num_callers")]
    pub num_callers: u32,

    #[serde(default = "default_true")]
    pub track_origins: bool,

    #[serde(default)]
    pub show_reachable: bool,

    /// Suppression files passed with `--suppressions=`.
    #[serde(default)]
    pub suppression_files: Vec<PathBuf>,
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        Self {
            leak_check: LeakCheckMode::default(),
            num_callers: default_num_callers(),
            track_origins: true,
            show_reachable: false,
            suppression_files: Vec::new(),
        }
    }
}

fn default_num_callers() -> u32 {
    25
}

fn default_true() -> bool {
    true
}

/// Callgrind settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallgrindConfig {
    #[serde(default)]
    pub dump_instructions: bool,

    #[serde(default)]
    pub collect_systime: bool,

    #[serde(default)]
    pub collect_bus: bool,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the current directory.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        Self::load_from_dir(Path::new("."))
    }

    /// Try to load configuration from a directory (e.g. the run's working directory).
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            Ok(Some(Self::load(&config_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref valgrind) = args.valgrind {
            self.valgrind.executable = valgrind.clone();
        }
        if let Some(smc_check) = args.smc_check {
            self.valgrind.smc_check = smc_check.into();
        }
        if let Some(tool) = args.tool {
            self.valgrind.tool = tool.into();
        }

        if args.debug_output {
            self.general.debug_output = true;
        }
    }

    /// Path to the valgrind executable; empty when not configured.
    pub fn executable_path(&self) -> &str {
        self.valgrind.executable.trim()
    }

    /// Configured self-modifying code detection mode.
    pub fn self_modifying_code_detection(&self) -> SelfModifyingCodeDetection {
        self.valgrind.smc_check
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.executable_path(), "valgrind");
        assert_eq!(
            config.self_modifying_code_detection(),
            SelfModifyingCodeDetection::StackOnly
        );
        assert_eq!(config.valgrind.tool, ValgrindTool::Memcheck);
        assert_eq!(config.memcheck.num_callers, 25);
        assert_eq!(config.general.expected_duration_seconds, 100);
    }

    #[test]
    fn test_smc_tokens() {
        assert_eq!(SelfModifyingCodeDetection::No.token(), "none");
        assert_eq!(SelfModifyingCodeDetection::Everywhere.token(), "all");
        assert_eq!(
            SelfModifyingCodeDetection::EverywhereButFile.token(),
            "all-non-file"
        );
        assert_eq!(SelfModifyingCodeDetection::StackOnly.token(), "stack");
    }

    #[test]
    fn test_unknown_smc_value_falls_back_to_stack() {
        assert_eq!(
            SelfModifyingCodeDetection::from_config_value("bogus"),
            SelfModifyingCodeDetection::StackOnly
        );
        assert_eq!(
            SelfModifyingCodeDetection::from_index(42),
            SelfModifyingCodeDetection::StackOnly
        );
        assert_eq!(
            SelfModifyingCodeDetection::from_index(-1),
            SelfModifyingCodeDetection::StackOnly
        );
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
debug_output = true

[valgrind]
executable = "/opt/valgrind/bin/valgrind"
smc_check = "all-non-file"
tool = "callgrind"
extra_arguments = ["--trace-children=yes"]

[memcheck]
leak_check = "summary"
num_callers = 12
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.general.debug_output);
        assert_eq!(config.executable_path(), "/opt/valgrind/bin/valgrind");
        assert_eq!(
            config.self_modifying_code_detection(),
            SelfModifyingCodeDetection::EverywhereButFile
        );
        assert_eq!(config.valgrind.tool, ValgrindTool::Callgrind);
        assert_eq!(config.valgrind.extra_arguments, vec!["--trace-children=yes"]);
        assert_eq!(config.memcheck.leak_check, LeakCheckMode::Summary);
        assert_eq!(config.memcheck.num_callers, 12);
        assert!(config.memcheck.track_origins);
    }

    #[test]
    fn test_parse_config_numeric_and_unknown_smc() {
        let config: Config = toml::from_str("[valgrind]\nsmc_check = 2\n").unwrap();
        assert_eq!(
            config.self_modifying_code_detection(),
            SelfModifyingCodeDetection::Everywhere
        );

        let config: Config = toml::from_str("[valgrind]\nsmc_check = \"sometimes\"\n").unwrap();
        assert_eq!(
            config.self_modifying_code_detection(),
            SelfModifyingCodeDetection::StackOnly
        );
    }

    #[test]
    fn test_empty_executable_is_not_configured() {
        let config: Config = toml::from_str("[valgrind]\nexecutable = \"  \"\n").unwrap();
        assert!(config.executable_path().is_empty());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[valgrind]"));
        assert!(toml_str.contains("smc_check = \"stack\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from_dir(dir.path()).unwrap().is_none());

        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[valgrind]\nsmc_check = \"none\"\n",
        )
        .unwrap();
        let config = Config::load_from_dir(dir.path()).unwrap().unwrap();
        assert_eq!(
            config.self_modifying_code_detection(),
            SelfModifyingCodeDetection::No
        );
    }

    #[test]
    fn test_load_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[valgrind\n").unwrap();
        assert!(Config::load_from_dir(dir.path()).is_err());
    }
}
