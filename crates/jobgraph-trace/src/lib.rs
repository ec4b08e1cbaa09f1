//! Tracing for jobgraph.
//!
//! Provides subscriber initialisation with `RUST_LOG` filtering and
//! span helpers carrying run, instance and step attributes.

pub mod spans;
pub mod tracer;

pub use spans::{RunAttributes, artifact_span, instance_span, run_span, step_span};
pub use tracer::{LogFormat, TracerError, TracingConfig, init_tracing};
