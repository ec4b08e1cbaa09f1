//! Step execution on the host for jobgraph.

pub mod runner;
pub mod shell;

pub use runner::{OUTPUT_FILE_VAR, OutputLine, OutputStream, RunnerConfig, parse_outputs};
pub use shell::ShellExecutor;
