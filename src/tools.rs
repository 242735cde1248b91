//! Valgrind tool selection and argument generation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Config;

/// Valgrind tools this runner knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValgrindTool {
    /// Memory error detector
    #[default]
    Memcheck,
    /// Call-graph profiler
    Callgrind,
}

impl ValgrindTool {
    /// Title shown next to the progress bar.
    pub fn progress_title(&self) -> &'static str {
        match self {
            ValgrindTool::Memcheck => "Analyzing Memory",
            ValgrindTool::Callgrind => "Profiling",
        }
    }

    /// Arguments specific to this tool.
    pub fn arguments(&self, config: &Config) -> Vec<String> {
        match self {
            ValgrindTool::Memcheck => memcheck_arguments(config),
            ValgrindTool::Callgrind => callgrind_arguments(config),
        }
    }
}

impl fmt::Display for ValgrindTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValgrindTool::Memcheck => write!(f, "memcheck"),
            ValgrindTool::Callgrind => write!(f, "callgrind"),
        }
    }
}

/// Arguments shared by every tool.
pub fn generic_tool_arguments(config: &Config) -> Vec<String> {
    vec![format!(
        "--smc-check={}",
        config.self_modifying_code_detection().token()
    )]
}

fn memcheck_arguments(config: &Config) -> Vec<String> {
    let memcheck = &config.memcheck;
    let mut args = vec![
        "--tool=memcheck".to_string(),
        format!("--leak-check={}", memcheck.leak_check.token()),
        format!("--num-callers={}", memcheck.num_callers),
    ];

    if memcheck.track_origins {
        args.push("--track-origins=yes".to_string());
    }
    if memcheck.show_reachable {
        args.push("--show-reachable=yes".to_string());
    }
    for file in &memcheck.suppression_files {
        args.push(format!("--suppressions={}", file.display()));
    }

    args
}

fn callgrind_arguments(config: &Config) -> Vec<String> {
    let callgrind = &config.callgrind;
    let mut args = vec!["--tool=callgrind".to_string()];

    if callgrind.dump_instructions {
        args.push("--dump-instr=yes".to_string());
    }
    if callgrind.collect_systime {
        args.push("--collect-systime=yes".to_string());
    }
    if callgrind.collect_bus {
        args.push("--collect-bus=yes".to_string());
    }

    args
}
