//! Run definitions and contexts shared by the scenario tests.

use jobgraph_core::context::RunContext;
use jobgraph_core::pipeline::{
    ArtifactDownload, ArtifactUpload, JobSpec, MatrixSpec, RunDefinition, StepSpec,
};
use jobgraph_core::value::Value;

/// A definition exercising most of the document format.
pub const CI_YAML: &str = r#"version: "1"
name: ci
description: Build, test and ship
max_workers: 3
env:
  PROFILE: release
jobs:
  build:
    steps:
      - name: compile
        run: cargo build --profile ${{ env.PROFILE }}
        retry:
          max_attempts: 2
          delay_seconds: 5
      - name: publish
        upload:
          name: dist
          content: ${{ steps.compile.stdout }}
          retention_days: 3
    outputs:
      binary: ${{ steps.compile.stdout }}
  test:
    needs: [build]
    matrix:
      axes:
        os: [linux, macos]
        toolchain: [stable, nightly]
      exclude:
        - os: macos
          toolchain: nightly
      include:
        - os: windows
          toolchain: stable
      max_parallel: 2
      fail_fast: true
    timeout_seconds: 600
    steps:
      - name: unit
        run: cargo test --target ${{ matrix.os }}
        env:
          TOOLCHAIN: ${{ matrix.toolchain }}
      - name: coverage
        if: matrix.os == 'linux'
        continue_on_error: true
        run: cargo llvm-cov
  docs:
    needs: [build]
    continue_on_error: true
    steps:
      - name: render
        shell: sh
        run: mdbook build
  deploy:
    needs: [build, test, docs]
    if: success() && ctx.branch == 'main'
    steps:
      - name: fetch
        download:
          name: dist
          path: out/dist.bin
      - name: ship
        run: ship ${{ needs.build.outputs.binary }}
        timeout_seconds: 120
"#;

/// Factory for test run definitions.
pub struct DefinitionFixture;

impl DefinitionFixture {
    /// `build` → `test` → `deploy`, with deploy gated on the main branch.
    pub fn build_test_deploy() -> RunDefinition {
        RunDefinition::new("build-test-deploy")
            .job(JobSpec::new("build").step(StepSpec::run("compile", "make build")))
            .job(
                JobSpec::new("test")
                    .needs(&["build"])
                    .step(StepSpec::run("unit", "make test")),
            )
            .job(
                JobSpec::new("deploy")
                    .needs(&["test"])
                    .when("ctx.branch == 'main'")
                    .step(StepSpec::run("ship", "make deploy")),
            )
    }

    /// `{os: [a, b], node: [18, 20]}` excluding `{os: b, node: 18}`.
    pub fn matrix_example() -> RunDefinition {
        RunDefinition::new("matrix").job(
            JobSpec::new("test")
                .matrix(
                    MatrixSpec::new()
                        .axis("os", vec!["a", "b"])
                        .axis("node", vec![18, 20])
                        .exclude(vec![("os", Value::from("b")), ("node", Value::from(18))]),
                )
                .step(StepSpec::run(
                    "unit",
                    "test ${{ matrix.os }} ${{ matrix.node }}",
                )),
        )
    }

    /// `build` uploads its stdout as `dist`; `deploy` downloads and ships it.
    pub fn artifact_handoff() -> RunDefinition {
        RunDefinition::new("handoff")
            .job(
                JobSpec::new("build")
                    .step(StepSpec::run("compile", "make dist"))
                    .step(StepSpec::upload(
                        "publish",
                        ArtifactUpload::from_content("dist", "${{ steps.compile.stdout }}"),
                    )),
            )
            .job(
                JobSpec::new("deploy")
                    .needs(&["build"])
                    .step(StepSpec::download("fetch", ArtifactDownload::named("dist")))
                    .step(StepSpec::run("ship", "ship ${{ steps.fetch.stdout }}")),
            )
    }

    /// `count` independent single-step jobs named `job-<n>` running `work <n>`.
    pub fn independent(count: usize) -> RunDefinition {
        (1..=count).fold(RunDefinition::new("fan-out"), |def, n| {
            def.job(JobSpec::new(format!("job-{}", n)).step(StepSpec::run("work", format!("work {}", n))))
        })
    }
}

/// Factory for run contexts.
pub struct ContextFixture;

impl ContextFixture {
    pub fn push(branch: &str) -> RunContext {
        RunContext::builder()
            .set("event", "push")
            .set("branch", branch)
            .set("ref", format!("refs/heads/{}", branch))
            .build()
    }
}
