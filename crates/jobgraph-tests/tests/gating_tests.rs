//! Dependency gating and condition scenarios.

use jobgraph_core::pipeline::{JobSpec, RunDefinition, StepSpec};
use jobgraph_core::run::{FailureKind, JobResult, JobStatus, RunStatus};
use jobgraph_tests::{ContextFixture, DefinitionFixture, Script, ScriptedExecutor, TestContext};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_main_branch_deploys() {
    let ctx = TestContext::new(ScriptedExecutor::new());
    let result = ctx
        .run(&DefinitionFixture::build_test_deploy(), ContextFixture::push("main"))
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.status_of("deploy"), Some(JobStatus::Succeeded));
    assert_eq!(
        ctx.executor.commands(),
        vec!["make build", "make test", "make deploy"]
    );
    assert_eq!(
        ctx.events.transitions("deploy"),
        vec![JobStatus::Ready, JobStatus::Running, JobStatus::Succeeded]
    );
}

#[tokio::test]
async fn test_feature_branch_skips_deploy() {
    let ctx = TestContext::new(ScriptedExecutor::new());
    let result = ctx
        .run(&DefinitionFixture::build_test_deploy(), ContextFixture::push("feature"))
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.status_of("test"), Some(JobStatus::Succeeded));
    assert_eq!(result.status_of("deploy"), Some(JobStatus::Skipped));
    assert_eq!(ctx.executor.call_count("make deploy"), 0);
    assert_eq!(ctx.events.transitions("deploy"), vec![JobStatus::Skipped]);
}

#[tokio::test]
async fn test_failed_build_skips_dependents() {
    let ctx = TestContext::new(ScriptedExecutor::new().on("make build", Script::fail(2)));
    let result = ctx
        .run(&DefinitionFixture::build_test_deploy(), ContextFixture::push("main"))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("build"), Some(JobStatus::Failed));
    assert_eq!(result.status_of("test"), Some(JobStatus::Skipped));
    assert_eq!(result.status_of("deploy"), Some(JobStatus::Skipped));
    assert_eq!(ctx.executor.commands(), vec!["make build"]);

    let failure = result.instance("build").unwrap().failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::StepExecution);
    assert_eq!(failure.step.as_deref(), Some("compile"));
    assert!(result.instance("build").unwrap().outputs.is_empty());
}

fn with_followups() -> RunDefinition {
    RunDefinition::new("followups")
        .job(
            JobSpec::new("build")
                .step(StepSpec::run("compile", "make build"))
                .output("artifact", "${{ steps.compile.stdout }}"),
        )
        .job(
            JobSpec::new("notify")
                .needs(&["build"])
                .when("always()")
                .step(StepSpec::run("post", "notify ${{ needs.build.result }}")),
        )
        .job(
            JobSpec::new("rollback")
                .needs(&["build"])
                .when("failure()")
                .step(StepSpec::run("revert", "rollback")),
        )
        .job(
            JobSpec::new("publish")
                .needs(&["build"])
                .step(StepSpec::run("push", "publish '${{ needs.build.outputs.artifact }}'")),
        )
}

#[tokio::test]
async fn test_status_functions_after_failure() {
    let ctx = TestContext::new(ScriptedExecutor::new().on("make build", Script::fail(1)));
    let result = ctx.run(&with_followups(), ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.status_of("notify"), Some(JobStatus::Succeeded));
    assert_eq!(result.status_of("rollback"), Some(JobStatus::Succeeded));
    assert_eq!(result.status_of("publish"), Some(JobStatus::Skipped));
    assert_eq!(result.job_result("build"), Some(JobResult::Failure));
    assert_eq!(ctx.executor.call_count("notify failure"), 1);
}

#[tokio::test]
async fn test_status_functions_after_success() {
    let ctx = TestContext::new(
        ScriptedExecutor::new().on("make build", Script::succeed().stdout("app-1.0.tar")),
    );
    let result = ctx.run(&with_followups(), ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.status_of("notify"), Some(JobStatus::Succeeded));
    assert_eq!(result.status_of("rollback"), Some(JobStatus::Skipped));
    assert_eq!(result.outputs_of("build")["artifact"], "app-1.0.tar");
    assert_eq!(ctx.executor.call_count("notify success"), 1);
    assert_eq!(ctx.executor.call_count("publish 'app-1.0.tar'"), 1);
}

#[tokio::test]
async fn test_skip_propagates_through_chain() {
    let def = RunDefinition::new("chain")
        .job(JobSpec::new("a").when("ctx.event == 'tag'").step(StepSpec::run("s", "a")))
        .job(JobSpec::new("b").needs(&["a"]).step(StepSpec::run("s", "b")))
        .job(JobSpec::new("c").needs(&["b"]).step(StepSpec::run("s", "c")))
        .job(
            JobSpec::new("report")
                .needs(&["c"])
                .when("needs.c.result == 'skipped'")
                .step(StepSpec::run("s", "report")),
        );

    let ctx = TestContext::new(ScriptedExecutor::new());
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    for job in ["a", "b", "c"] {
        assert_eq!(result.status_of(job), Some(JobStatus::Skipped), "job {}", job);
    }
    // An explicit `needs` check is not a status function, so success() still applies.
    assert_eq!(result.status_of("report"), Some(JobStatus::Skipped));
    assert!(ctx.executor.commands().is_empty());
}

#[tokio::test]
async fn test_step_conditions_inside_always_job() {
    let def = RunDefinition::new("report")
        .job(JobSpec::new("build").step(StepSpec::run("compile", "make build")))
        .job(
            JobSpec::new("notify")
                .needs(&["build"])
                .when("always()")
                .step(StepSpec::run("post", "post ${{ needs.build.result }}").when("ctx.branch == 'main'"))
                .step(StepSpec::run("clean", "make clean").when("always()")),
        );

    let ctx = TestContext::new(ScriptedExecutor::new().on("make build", Script::fail(1)));
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    assert_eq!(result.status_of("notify"), Some(JobStatus::Succeeded));
    assert_eq!(
        ctx.executor.commands(),
        vec!["make build", "post failure", "make clean"]
    );
}

#[tokio::test]
async fn test_cleanup_step_runs_after_failed_step() {
    let def = RunDefinition::new("cleanup").job(
        JobSpec::new("build")
            .step(StepSpec::run("compile", "make build"))
            .step(StepSpec::run("package", "make package"))
            .step(StepSpec::run("clean", "make clean").when("always()")),
    );

    let ctx = TestContext::new(ScriptedExecutor::new().on("make build", Script::fail(2)));
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(ctx.executor.commands(), vec!["make build", "make clean"]);
    let build = result.instance("build").unwrap();
    assert_eq!(build.failure.as_ref().unwrap().step.as_deref(), Some("compile"));
}
