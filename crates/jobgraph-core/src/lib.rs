//! jobgraph core
//!
//! Domain types, the gate-expression evaluator, and the port traits shared by
//! every other jobgraph crate. This crate performs no I/O of its own; the
//! scheduler, artifact store and executors build on the vocabulary defined
//! here.

pub mod artifact;
pub mod context;
pub mod error;
pub mod events;
pub mod expression;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod value;

pub use error::{ConfigurationError, Error, Result};
pub use ids::*;
