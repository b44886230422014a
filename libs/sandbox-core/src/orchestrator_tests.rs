// End-to-end orchestration tests against the in-memory runtime

#[cfg(test)]
mod orchestration_tests {
    use crate::error::{ContainerStage, SandboxError};
    use crate::lifecycle::KEEP_ALIVE_CMD;
    use crate::orchestrator::Sandbox;
    use crate::testing::{parse_script, FakeExec, FakeRuntime};
    use sandbox_common::config::SandboxConfig;
    use sandbox_common::types::{
        ExecutionRequest, ExecutionResult, FailureKind, Mode, TestCase, TestReport,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(runtime: FakeRuntime) -> (Sandbox, Arc<FakeRuntime>, TempDir) {
        setup_with(runtime, |_| {})
    }

    fn setup_with(
        runtime: FakeRuntime,
        tweak: impl FnOnce(&mut SandboxConfig),
    ) -> (Sandbox, Arc<FakeRuntime>, TempDir) {
        let runs = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig {
            runs_root: runs.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        tweak(&mut config);
        let runtime = Arc::new(runtime);
        let sandbox = Sandbox::new(runtime.clone(), config);
        (sandbox, runtime, runs)
    }

    fn workspaces_left(runs: &TempDir) -> usize {
        std::fs::read_dir(runs.path()).unwrap().count()
    }

    fn test_report(result: ExecutionResult) -> TestReport {
        match result {
            ExecutionResult::Test(report) => report,
            other => panic!("expected TEST result, got {:?}", other),
        }
    }

    /// `node square.js`: reads a number from the fixture, prints its square
    fn square_runtime() -> FakeRuntime {
        FakeRuntime::new(|script, files| {
            let (_, stdin) = parse_script(script);
            let input = files.get(stdin).cloned().unwrap_or_default();
            match input.trim().parse::<i64>() {
                Ok(n) => FakeExec::stdout(format!("{}\n", n * n)),
                Err(_) => FakeExec::stderr("SyntaxError: not a number\n", 1),
            }
        })
    }

    #[tokio::test]
    async fn test_outcomes_follow_declared_order() {
        let (sandbox, runtime, runs) = setup(square_runtime());
        let request = ExecutionRequest::new("node:latest")
            .with_file("square.js", "/* ... */")
            .with_test(TestCase::new("node square.js", "2", "4\n"))
            .with_test(TestCase::new("node square.js", "3", "10\n"))
            .with_test(TestCase::new("node square.js", "4", "16\n"));

        let report = sandbox.execute(&request).await.unwrap();
        assert_eq!(report.id, request.id);
        assert_eq!(report.failure_kind(), Some(FailureKind::Functional));

        let report = test_report(report.result);
        let outputs: Vec<_> = report.outcomes.iter().map(|o| o.output.as_str()).collect();
        let passed: Vec<_> = report.outcomes.iter().map(|o| o.passed).collect();
        assert_eq!(outputs, vec!["4\n", "9\n", "16\n"]);
        assert_eq!(passed, vec![true, false, true]);
        assert!(!report.timed_out);

        let scripts = runtime.scripts();
        assert_eq!(scripts.len(), 3);
        assert!(scripts[0].ends_with("< /workspace/tests/test0.txt"));
        assert!(scripts[2].ends_with("< /workspace/tests/test2.txt"));

        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_pass_requires_exact_output() {
        let (sandbox, _runtime, _runs) = setup(FakeRuntime::echo());
        let request = ExecutionRequest::new("alpine:latest")
            .with_test(TestCase::new("cat", "A\n", "A"))
            .with_test(TestCase::new("cat", "A\n", "A\n"))
            .with_test(TestCase::new("cat", "", ""));

        let report = test_report(sandbox.execute(&request).await.unwrap().result);

        assert!(!report.outcomes[0].passed);
        assert!(report.outcomes[1].passed);
        assert!(report.outcomes[2].passed);
        assert_eq!(report.outcomes[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_data() {
        let (sandbox, _runtime, _runs) = setup(square_runtime());
        let request = ExecutionRequest::new("node:latest")
            .with_test(TestCase::new("node square.js", "abc", ""));

        let report = test_report(sandbox.execute(&request).await.unwrap().result);

        assert_eq!(report.outcomes[0].exit_code, Some(1));
        assert_eq!(report.outcomes[0].output, "SyntaxError: not a number\n");
        assert!(!report.outcomes[0].passed);
    }

    #[tokio::test]
    async fn test_files_are_visible_in_workspace() {
        let runtime = FakeRuntime::new(|_, files| {
            FakeExec::stdout(
                files
                    .get("/workspace/src/lib/util.js")
                    .cloned()
                    .unwrap_or_else(|| "missing".to_string()),
            )
        });
        let (sandbox, runtime, _runs) = setup(runtime);
        let request = ExecutionRequest::new("node:latest")
            .with_file("src/lib/util.js", "module.exports = 42")
            .with_test(TestCase::new("node src/lib/util.js", "", "module.exports = 42"));

        let report = test_report(sandbox.execute(&request).await.unwrap().result);

        assert!(report.success());

        let spec = &runtime.created()[0];
        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.cmd, KEEP_ALIVE_CMD.to_vec());
    }

    #[tokio::test]
    async fn test_container_spec_carries_limits() {
        let (sandbox, runtime, _runs) = setup(FakeRuntime::echo());
        let request =
            ExecutionRequest::new("python:latest").with_test(TestCase::new("cat", "", ""));

        sandbox.execute(&request).await.unwrap();

        let spec = &runtime.created()[0];
        assert!(spec.name.starts_with(&format!("sandbox-{}-", request.id)));
        assert_eq!(spec.image, "python:latest");
        assert_eq!(spec.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(spec.nano_cpus, 300_000_000);
        assert!(spec.auto_remove);
        assert_eq!(spec.env.get("NODE_NO_WARNINGS").map(String::as_str), Some("1"));
        assert_eq!(runtime.pulled(), vec!["python:latest".to_string()]);
    }

    #[tokio::test]
    async fn test_run_mode_concatenates_outputs() {
        let (sandbox, _runtime, _runs) = setup(FakeRuntime::echo());
        let request = ExecutionRequest::new("alpine:latest")
            .with_mode(Mode::Run)
            .with_test(TestCase::new("cat", "one\n", ""))
            .with_test(TestCase::new("cat", "two\n", ""));

        let report = sandbox.execute(&request).await.unwrap();

        assert_eq!(
            report.result,
            ExecutionResult::Run {
                output: "one\ntwo\n".to_string()
            }
        );
        assert_eq!(report.failure_kind(), None);
    }

    #[tokio::test]
    async fn test_run_mode_without_tests_uses_language_command() {
        let runtime = FakeRuntime::new(|script, _| {
            let (exec, stdin) = parse_script(script);
            FakeExec::stdout(format!("{} <{}>", exec, stdin))
        });
        let (sandbox, _runtime, _runs) = setup(runtime);
        let request = ExecutionRequest::new("node:latest").with_file("main.js", "console.log(1)");

        let report = sandbox.execute(&request).await.unwrap();

        assert_eq!(
            report.result,
            ExecutionResult::Run {
                output: "node main.js </dev/null>".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failing_before_all_is_data() {
        let runtime = FakeRuntime::new(|script, _| {
            if script.ends_with("2>&1") {
                FakeExec::stderr("Main.java:1: error: ';' expected\n", 1)
            } else {
                FakeExec::stderr("Error: Could not find or load main class Main\n", 1)
            }
        });
        let (sandbox, runtime, runs) = setup(runtime);
        let request = ExecutionRequest::new("openjdk:latest")
            .with_file("Main.java", "class Main {")
            .with_before_all("javac Main.java")
            .with_test(TestCase::new("java Main", "", "ok\n"));

        let report = sandbox.execute(&request).await.unwrap();

        assert_eq!(
            report.before_all_output.as_deref(),
            Some("Main.java:1: error: ';' expected\n")
        );
        let report = test_report(report.result);
        assert_eq!(report.outcomes.len(), 1);
        assert!(!report.success());

        assert_eq!(runtime.scripts()[0], "javac Main.java 2>&1");
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_deadline_keeps_completed_outcomes() {
        let runtime = FakeRuntime::new(|script, files| {
            let (exec, stdin) = parse_script(script);
            let out = FakeExec::stdout(files.get(stdin).cloned().unwrap_or_default());
            if exec == "loop" {
                out.delayed(Duration::from_secs(30))
            } else {
                out
            }
        });
        let (sandbox, runtime, runs) =
            setup_with(runtime, |c| c.execution_timeout_ms = 200);
        let request = ExecutionRequest::new("node:latest")
            .with_test(TestCase::new("cat", "fast", "fast"))
            .with_test(TestCase::new("loop", "slow", "slow"))
            .with_test(TestCase::new("cat", "never", "never"));

        let started = std::time::Instant::now();
        let report = sandbox.execute(&request).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.failure_kind(), Some(FailureKind::Timeout));

        let report = test_report(report.result);
        assert!(report.timed_out);
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].passed);
        assert_eq!(report.summary().result, "Timeout");

        // The third test never started
        assert_eq!(runtime.scripts().len(), 2);
        assert_eq!(runtime.stopped()[0].1, Duration::ZERO);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_run_mode_deadline_is_an_error() {
        let runtime =
            FakeRuntime::new(|_, _| FakeExec::stdout("tick").delayed(Duration::from_secs(30)));
        let (sandbox, runtime, runs) =
            setup_with(runtime, |c| c.execution_timeout_ms = 100);
        let request = ExecutionRequest::new("node:latest").with_run_command("node loop.js");

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Execution timed out");
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_setup_deadline_reports_timeout() {
        let runtime = FakeRuntime::new(|script, _| {
            if script.ends_with("2>&1") {
                FakeExec::stdout("installing").delayed(Duration::from_secs(30))
            } else {
                FakeExec::stdout("")
            }
        });
        let (sandbox, runtime, runs) = setup_with(runtime, |c| c.setup_timeout_ms = 100);
        let request = ExecutionRequest::new("node:latest")
            .with_before_all("npm ci")
            .with_test(TestCase::new("node main.js", "", ""));

        let report = test_report(sandbox.execute(&request).await.unwrap().result);

        assert!(report.timed_out);
        assert!(report.outcomes.is_empty());
        assert_eq!(runtime.scripts().len(), 1);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_exec_failure_aborts_and_cleans_up() {
        let runtime = FakeRuntime::new(|script, _| {
            if script.contains("test1") {
                FakeExec::failing("connection reset by peer")
            } else {
                FakeExec::stdout("ok")
            }
        });
        let (sandbox, runtime, runs) = setup(runtime);
        let request = ExecutionRequest::new("node:latest")
            .with_test(TestCase::new("node a.js", "", "ok"))
            .with_test(TestCase::new("node a.js", "", "ok"))
            .with_test(TestCase::new("node a.js", "", "ok"));

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(matches!(err, SandboxError::Exec { .. }));
        assert_eq!(err.kind(), FailureKind::Operational);
        assert_eq!(runtime.scripts().len(), 2);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_create_failure_cleans_workspace() {
        let mut runtime = FakeRuntime::echo();
        runtime.fail_create = true;
        let (sandbox, runtime, runs) = setup(runtime);
        let request = ExecutionRequest::new("node:latest").with_test(TestCase::new("cat", "", ""));

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(matches!(
            err,
            SandboxError::Container {
                stage: ContainerStage::Create,
                ..
            }
        ));
        assert!(runtime.created().is_empty());
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_start_failure_removes_container() {
        let mut runtime = FakeRuntime::echo();
        runtime.fail_start = true;
        let (sandbox, runtime, runs) = setup(runtime);
        let request = ExecutionRequest::new("node:latest").with_test(TestCase::new("cat", "", ""));

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(matches!(
            err,
            SandboxError::Container {
                stage: ContainerStage::Start,
                ..
            }
        ));
        assert_eq!(runtime.created().len(), 1);
        assert_eq!(runtime.removed().len(), 1);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_missing_image_creates_nothing() {
        let mut runtime = FakeRuntime::echo();
        runtime.missing_images = vec!["ghost:latest".to_string()];
        let (sandbox, runtime, runs) = setup(runtime);
        let request = ExecutionRequest::new("ghost:latest").with_test(TestCase::new("cat", "", ""));

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(matches!(err, SandboxError::Image { ref image, .. } if image == "ghost:latest"));
        assert!(runtime.created().is_empty());
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_touches_nothing() {
        let (sandbox, runtime, runs) = setup(FakeRuntime::echo());
        let request = ExecutionRequest::new("node:latest")
            .with_file("../escape.js", "x")
            .with_test(TestCase::new("cat", "", ""));

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert!(runtime.pulled().is_empty());
        assert!(runtime.created().is_empty());
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_file_under_fixture_path_is_invalid() {
        let (sandbox, runtime, runs) = setup(FakeRuntime::echo());
        let request = ExecutionRequest::new("node:latest")
            .with_file("tests/test0.txt/a.js", "x")
            .with_test(TestCase::new("cat", "", ""));

        let err = sandbox.execute(&request).await.unwrap_err();

        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert_eq!(err.kind(), FailureKind::Operational);
        assert!(runtime.created().is_empty());
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_output_cap_sets_truncated() {
        let runtime = FakeRuntime::new(|_, _| FakeExec::stdout("x".repeat(100)));
        let (sandbox, _runtime, _runs) = setup_with(runtime, |c| c.max_output_bytes = 10);
        let request =
            ExecutionRequest::new("alpine:latest").with_test(TestCase::new("yes", "", ""));

        let report = test_report(sandbox.execute(&request).await.unwrap().result);

        assert!(report.outcomes[0].truncated);
        assert_eq!(report.outcomes[0].output, "x".repeat(10));
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_isolated() {
        let runtime = FakeRuntime::new(|_, files| {
            FakeExec::stdout(files.get("/workspace/main.js").cloned().unwrap_or_default())
        });
        let (sandbox, runtime, runs) = setup(runtime);

        let requests: Vec<_> = (0..8)
            .map(|i| {
                ExecutionRequest::new("node:latest")
                    .with_file("main.js", format!("program {}", i))
                    .with_test(TestCase::new("node main.js", "", format!("program {}", i)))
            })
            .collect();

        let reports =
            futures_util::future::join_all(requests.iter().map(|r| sandbox.execute(r))).await;

        for (request, report) in requests.iter().zip(reports) {
            let report = report.unwrap();
            assert_eq!(report.id, request.id);
            assert!(test_report(report.result).success());
        }

        let names: std::collections::HashSet<_> =
            runtime.created().into_iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 8);
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_same_request_twice_gets_two_containers() {
        let runtime = FakeRuntime::echo();
        let (sandbox, runtime, runs) = setup(runtime);
        let request = ExecutionRequest::new("node:latest")
            .with_test(TestCase::new("cat", "same", "same"));

        let (first, second) =
            tokio::join!(sandbox.execute(&request), sandbox.execute(&request));

        assert!(test_report(first.unwrap().result).success());
        assert!(test_report(second.unwrap().result).success());

        let names: Vec<_> = runtime.created().into_iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(names
            .iter()
            .all(|name| name.starts_with(&format!("sandbox-{}-", request.id))));
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(workspaces_left(&runs), 0);
    }

    #[tokio::test]
    async fn test_cancelled_execution_releases_everything() {
        let runtime =
            FakeRuntime::new(|_, _| FakeExec::stdout("slow").delayed(Duration::from_secs(30)));
        let (sandbox, runtime, runs) = setup(runtime);
        let request =
            ExecutionRequest::new("node:latest").with_test(TestCase::new("node main.js", "", ""));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), sandbox.execute(&request)).await;
        assert!(cancelled.is_err());

        // Drop guards: workspace removed synchronously, container removal spawned
        assert_eq!(workspaces_left(&runs), 0);
        sandbox.reap().await;
        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(runtime.removed().len(), 1);
    }
}
