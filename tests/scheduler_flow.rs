//! End-to-end runs through the public API: queue, retries, run log, plans.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use labqueue::collab::Collaborators;
use labqueue::dispatch::Dispatcher;
use labqueue::item::{TestItem, TestKind, TestStatus};
use labqueue::retry::RetryPolicy;
use labqueue::scheduler::Scheduler;
use labqueue::script::{ScriptFault, ScriptRegistry};
use labqueue::session::{RunLog, SessionReport};

fn bench_registry(flaky_calls: Arc<AtomicU32>) -> Arc<ScriptRegistry> {
    let registry = ScriptRegistry::new();
    registry.register_fn("power_on", |_| Ok(json!(true)));
    registry.register_fn("measure", |params| {
        let min = params.get("min_voltage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if 12.1 >= min {
            Ok(json!({ "voltage": 12.1 }))
        } else {
            Err(ScriptFault::validation(format!("12.1 V below {}", min)))
        }
    });
    registry.register_fn("flaky", move |_| {
        if flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ScriptFault::fault("relay did not switch"))
        } else {
            Ok(json!("relay ok"))
        }
    });
    Arc::new(registry)
}

#[tokio::test]
async fn test_session_with_run_log() {
    let tmp = tempfile::tempdir().unwrap();
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let dispatcher = Dispatcher::new(Collaborators::new(bench_registry(flaky_calls.clone())));

    let run_log = Arc::new(RunLog::new(tmp.path()));
    run_log.start("flow").unwrap();

    let scheduler = Scheduler::builder(dispatcher)
        .retry_policy(RetryPolicy::new(0))
        .sink(run_log.clone())
        .poll_interval(Duration::from_millis(10))
        .build();

    scheduler.enqueue(TestItem::new("power on", TestKind::ScriptedRun, "power_on")).unwrap();
    scheduler
        .enqueue(TestItem::new("measure low", TestKind::ScriptedRun, "measure").with_parameter("min_voltage", 11.5))
        .unwrap();
    scheduler
        .enqueue(TestItem::new("measure high", TestKind::ScriptedRun, "measure").with_parameter("min_voltage", 13.0))
        .unwrap();
    scheduler
        .enqueue(TestItem::new("relay", TestKind::ScriptedRun, "flaky").with_retry_budget(1))
        .unwrap();
    let skipped = scheduler.enqueue(TestItem::new("unused", TestKind::ScriptedRun, "power_on")).unwrap();
    scheduler.enqueue(TestItem::new("flash", TestKind::DebuggerMacro, "/nonexistent/flash.cmm")).unwrap();
    assert!(scheduler.skip_when_reached(skipped));

    scheduler.start(None);
    scheduler.stop_when_idle();
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait()).await.unwrap();
    assert!(!scheduler.is_running());

    let results = scheduler.results();
    let names: Vec<_> = results.iter().map(|r| r.item.name.as_str()).collect();
    assert_eq!(names, vec!["power on", "measure low", "measure high", "relay", "unused", "flash"]);

    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            TestStatus::Success,
            TestStatus::Success,
            TestStatus::Failed,
            TestStatus::Success,
            TestStatus::Skipped,
            TestStatus::Error,
        ]
    );
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
    assert!(results[5].message.contains("not found"));

    let summary = scheduler.summary();
    assert_eq!((summary.passed, summary.failed, summary.errored, summary.skipped), (3, 1, 1, 1));
    assert!(!summary.all_passed());

    let path = run_log.end().unwrap().unwrap();
    let report = SessionReport::load(&path).unwrap();
    assert_eq!(report.total, 6);
    assert_eq!(report.passed, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.results[1].test, "measure low");
    assert_eq!(report.results[1].details["voltage"], 12.1);
    assert!(report.results[2].details["message"].as_str().unwrap().contains("below 13"));
    assert_eq!(report.results[3].details["attempts"], 2);
    assert_eq!(report.results[4].status, TestStatus::Skipped);
}

#[tokio::test]
async fn test_subscribers_see_every_result() {
    let dispatcher = Dispatcher::new(Collaborators::new(bench_registry(Arc::new(AtomicU32::new(0)))));
    let scheduler = Scheduler::builder(dispatcher)
        .poll_interval(Duration::from_millis(10))
        .build();
    let mut events = scheduler.log().subscribe();

    for _ in 0..3 {
        scheduler.enqueue(TestItem::new("power on", TestKind::ScriptedRun, "power_on")).unwrap();
    }
    scheduler.start(None);
    scheduler.stop_when_idle();

    for _ in 0..3 {
        let result = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(result.status, TestStatus::Success);
    }
    scheduler.wait().await;
}

#[cfg(unix)]
mod plans {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use labqueue::config::RunnerConfig;
    use labqueue::plan::TestPlan;
    use tokio_util::sync::CancellationToken;

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn config(dir: &Path) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.runner.retry_count = 0;
        config.runner.poll_interval_ms = 10;
        config.logging.log_dir = dir.join("logs");
        config
    }

    #[tokio::test]
    async fn test_run_plan_persists_results() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "echo_params.sh", "cat\necho\n");
        let plan_path = tmp.path().join("plan.toml");
        std::fs::write(
            &plan_path,
            "[[test]]\nname = \"params\"\ntarget = \"echo_params.sh\"\n[test.parameters]\nchannel = 3\n",
        )
        .unwrap();
        let plan = TestPlan::load(&plan_path).unwrap();

        let outcome = labqueue::run_plan(&config(tmp.path()), plan, Some("nightly"), None, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.interrupted);
        assert!(outcome.summary.all_passed());
        assert_eq!(outcome.results[0].telemetry["channel"], 3);

        let path = outcome.results_file.unwrap();
        assert!(path.parent().unwrap().to_string_lossy().ends_with("_nightly"));
        let report = SessionReport::load(&path).unwrap();
        assert_eq!(report.total, 1);
    }

    #[tokio::test]
    async fn test_disabled_tests_stay_in_plan_order() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "ok.sh", "echo true\n");
        let plan_path = tmp.path().join("ordered.toml");
        std::fs::write(
            &plan_path,
            "[[test]]\nname = \"a\"\ntarget = \"ok.sh\"\n\n[[test]]\nname = \"b\"\ntarget = \"missing.sh\"\nenabled = false\n\n[[test]]\nname = \"c\"\ntarget = \"ok.sh\"\n",
        )
        .unwrap();
        let plan = TestPlan::load(&plan_path).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: labqueue::notify::Observer = Arc::new(move |r: &labqueue::item::TestResult| -> anyhow::Result<()> {
            sink.lock().unwrap().push(format!("{}:{}", r.item.name, r.status));
            Ok(())
        });

        let outcome = labqueue::run_plan(&config(tmp.path()), plan, None, Some(observer), CancellationToken::new())
            .await
            .unwrap();

        let order: Vec<_> = outcome.results.iter().map(|r| r.item.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(*seen.lock().unwrap(), vec!["a:SUCCESS", "b:SKIPPED", "c:SUCCESS"]);

        let report = SessionReport::load(&outcome.results_file.unwrap()).unwrap();
        let logged: Vec<_> = report.results.iter().map(|r| r.test.as_str()).collect();
        assert_eq!(logged, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight_item() {
        let tmp = tempfile::tempdir().unwrap();
        script(tmp.path(), "soak.sh", "sleep 30\n");
        script(tmp.path(), "after.sh", "echo true\n");
        let plan_path = tmp.path().join("soak.toml");
        std::fs::write(&plan_path, "[[test]]\ntarget = \"soak.sh\"\n\n[[test]]\ntarget = \"after.sh\"\n").unwrap();
        let plan = TestPlan::load(&plan_path).unwrap();

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = labqueue::run_plan(&config(tmp.path()), plan, None, None, shutdown)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.interrupted);
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].aborted);
        assert_eq!(outcome.results[0].status, TestStatus::Error);

        let report = SessionReport::load(&outcome.results_file.unwrap()).unwrap();
        assert_eq!(report.errored, 1);
    }
}
