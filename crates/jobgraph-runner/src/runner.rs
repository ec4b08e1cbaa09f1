//! Types shared by step executors.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Variable naming the file a step appends `key=value` output lines to.
pub const OUTPUT_FILE_VAR: &str = "JOBGRAPH_OUTPUT";

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub step: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for host step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Pass the orchestrator's own environment through to steps. `PATH` is
    /// passed either way.
    pub inherit_env: bool,
    /// Stdout kept for `steps.<name>.stdout`; the rest is only streamed.
    pub max_captured_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            inherit_env: true,
            max_captured_bytes: 1024 * 1024,
        }
    }
}

/// Parse the contents of an output file.
///
/// Each non-blank line is `key=value`; later lines win. Lines without `=` or
/// with an empty key are ignored.
pub fn parse_outputs(content: &str) -> IndexMap<String, String> {
    let mut outputs = IndexMap::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                outputs.insert(key.to_string(), value.to_string());
            }
        }
    }
    outputs
}
