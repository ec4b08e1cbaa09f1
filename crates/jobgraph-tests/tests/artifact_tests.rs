//! Artifact hand-off between jobs.

use jobgraph_artifacts::ArtifactStore;
use jobgraph_core::Error;
use jobgraph_core::pipeline::{ArtifactDownload, ArtifactUpload, JobSpec, RunDefinition, StepSpec};
use jobgraph_core::run::{FailureKind, JobStatus, RunStatus};
use jobgraph_tests::{ContextFixture, DefinitionFixture, Script, ScriptedExecutor, TestContext};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_artifact_handoff() {
    let ctx = TestContext::new(
        ScriptedExecutor::new().on("make dist", Script::succeed().stdout("app-1.2.0.tar")),
    );
    let result = ctx
        .run(&DefinitionFixture::artifact_handoff(), ContextFixture::push("main"))
        .await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(ctx.executor.call_count("ship app-1.2.0.tar"), 1);

    let build = result.instance("build").unwrap();
    assert_eq!(build.artifacts.len(), 1);
    assert_eq!(ctx.store.read(&build.artifacts[0]).await.unwrap(), b"app-1.2.0.tar");

    let metadata = ctx.store.metadata("dist").await.unwrap();
    assert_eq!(metadata.producer.to_string(), "build");
    assert_eq!(metadata.size_bytes, 13);
}

#[tokio::test]
async fn test_overwrite_invalidates_earlier_reference() {
    let def = RunDefinition::new("overwrite")
        .job(JobSpec::new("first").step(StepSpec::upload(
            "publish",
            ArtifactUpload::from_content("report", "v1"),
        )))
        .job(JobSpec::new("second").needs(&["first"]).step(StepSpec::upload(
            "publish",
            ArtifactUpload::from_content("report", "v2"),
        )));

    let ctx = TestContext::new(ScriptedExecutor::new());
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    let first = &result.instance("first").unwrap().artifacts[0];
    let second = &result.instance("second").unwrap().artifacts[0];
    assert!(matches!(
        ctx.store.read(first).await,
        Err(Error::ArtifactNotFound(_))
    ));
    assert_eq!(ctx.store.read(second).await.unwrap(), b"v2");
    assert_eq!(ctx.store.get("report").await.unwrap(), b"v2");
}

#[tokio::test]
async fn test_missing_artifact_fails_download() {
    let def = RunDefinition::new("missing")
        .job(JobSpec::new("deploy").step(StepSpec::download("fetch", ArtifactDownload::named("dist"))))
        .job(
            JobSpec::new("docs").step(StepSpec::download(
                "fetch",
                ArtifactDownload {
                    optional: true,
                    ..ArtifactDownload::named("manual")
                },
            )),
        );

    let ctx = TestContext::new(ScriptedExecutor::new());
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Failed);
    let deploy = result.instance("deploy").unwrap();
    assert_eq!(deploy.status, JobStatus::Failed);
    assert_eq!(
        deploy.failure.as_ref().map(|f| f.kind),
        Some(FailureKind::ArtifactNotFound)
    );
    assert_eq!(result.status_of("docs"), Some(JobStatus::Succeeded));
}

#[tokio::test]
async fn test_download_into_workspace() {
    let def = DefinitionFixture::artifact_handoff().job(
        JobSpec::new("archive").needs(&["build"]).step(StepSpec::download(
            "fetch",
            ArtifactDownload {
                path: Some("out/dist.tar".into()),
                ..ArtifactDownload::named("dist")
            },
        )),
    );
    let ctx = TestContext::new(ScriptedExecutor::new().on("make dist", Script::succeed().stdout("tarball")));
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        std::fs::read_to_string(ctx.workspace().join("out/dist.tar")).unwrap(),
        "tarball"
    );
}

#[tokio::test]
async fn test_expired_artifacts_evicted_at_run_end() {
    let mut kept = ArtifactUpload::from_content("kept", "long-lived");
    kept.retention_days = Some(7);
    let def = RunDefinition::new("retention").job(
        JobSpec::new("build")
            .step(StepSpec::upload("scratch", ArtifactUpload::from_content("scratch", "tmp")))
            .step(StepSpec::upload("kept", kept)),
    );

    let store = ArtifactStore::in_memory().with_default_retention(chrono::Duration::zero());
    let ctx = TestContext::with_store(ScriptedExecutor::new(), store);
    let result = ctx.run(&def, ContextFixture::push("main")).await;

    assert_eq!(result.status, RunStatus::Succeeded);
    let names: Vec<String> = ctx.store.list().await.into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["kept"]);
}
