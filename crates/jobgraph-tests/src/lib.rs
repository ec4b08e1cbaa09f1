//! Integration test infrastructure for jobgraph.
//!
//! Scenario tests drive the real scheduler against a [`ScriptedExecutor`]
//! whose behaviour is set per command, so no process is ever spawned.
//!
//! # Usage
//!
//! ```ignore
//! use jobgraph_tests::{ContextFixture, DefinitionFixture, Script, ScriptedExecutor, TestContext};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new(ScriptedExecutor::new().on("make build", Script::fail(2)));
//!     let result = ctx.run(&DefinitionFixture::build_test_deploy(), ContextFixture::push("main")).await;
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,jobgraph_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
