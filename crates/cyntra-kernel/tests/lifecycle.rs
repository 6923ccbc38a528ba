mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{adapter, Harness, ScriptedAdapter, Step};
use cyntra_kernel::adapters::ToolchainAdapter;
use cyntra_kernel::config::GateCommand;
use cyntra_kernel::kernel::{IssueOutcome, Verdict};
use cyntra_kernel::state::{Issue, IssueStatus};
use cyntra_kernel::workcell::{
    FailureReason, LaunchSpec, Sandbox, Workcell, WorkcellId, WorkcellStatus,
};
use cyntra_kernel::{KernelConfig, KernelError};

const DRAIN: Duration = Duration::from_secs(10);

fn spec(issue_id: &str, step: Step) -> LaunchSpec {
    LaunchSpec {
        issue: Issue::new(issue_id, "Add auth"),
        adapter: adapter(step),
        reserved_tokens: 5_000,
        speculative: false,
    }
}

fn transitions_to(h: &Harness, id: &WorkcellId, status: &str) -> usize {
    h.events
        .read_recent(1_000)
        .iter()
        .filter(|e| e.event_type == "workcell.transition")
        .filter(|e| e.workcell_id.as_deref() == Some(id.as_str()))
        .filter(|e| e.to.as_deref() == Some(status))
        .count()
}

#[tokio::test]
async fn workcell_runs_to_completion() {
    let h = Harness::new(KernelConfig::default(), vec![]);

    let id = h.manager.create(spec("42", Step::ok().tokens(1_234))).unwrap();
    assert_eq!(id.as_str(), "wc-42-000001");
    assert_eq!(h.manager.usage().active_workcells, 1);
    assert_eq!(h.manager.usage().active_tokens, 5_000);

    assert!(h.manager.drain(DRAIN).await);

    let workcell = h.manager.get(&id).unwrap();
    assert_eq!(workcell.status, WorkcellStatus::Completed);
    assert_eq!(workcell.verdict, Some(Verdict::Pass));
    assert_eq!(workcell.tokens_used, 1_234);
    assert!(workcell.finished_at.is_some());
    assert!(workcell.sandbox_released);
    assert_eq!(h.sandboxes.releases(), vec![(id.to_string(), true)]);
    assert_eq!(h.manager.usage().active_workcells, 0);

    let stored = h.store().load(&id).unwrap().unwrap();
    assert_eq!(stored.status, WorkcellStatus::Completed);

    for status in ["created", "running", "gating", "completed"] {
        assert_eq!(transitions_to(&h, &id, status), 1, "{status}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workcell_completes_on_multi_threaded_runtime() {
    let h = Harness::new(KernelConfig::default(), vec![]);

    let id = h.manager.create(spec("42", Step::ok())).unwrap();
    assert!(h.manager.drain(DRAIN).await);

    assert_eq!(h.manager.get(&id).unwrap().status, WorkcellStatus::Completed);
    assert_eq!(h.sandboxes.releases(), vec![(id.to_string(), true)]);
}

#[tokio::test]
async fn toolchain_error_fails_workcell_and_releases_sandbox() {
    let h = Harness::new(KernelConfig::default(), vec![]);

    let id = h.manager.create(spec("42", Step::fail())).unwrap();
    assert!(h.manager.drain(DRAIN).await);

    let workcell = h.manager.get(&id).unwrap();
    assert_eq!(workcell.status, WorkcellStatus::Failed);
    assert!(matches!(
        workcell.failure,
        Some(FailureReason::AdapterError { ref adapter, .. }) if adapter == "scripted"
    ));
    assert!(workcell.gate_results.is_empty());
    assert_eq!(h.sandboxes.releases(), vec![(id.to_string(), false)]);
}

#[tokio::test]
async fn toolchain_timeout_is_recorded() {
    let h = Harness::new(KernelConfig::default(), vec![]);
    let slow = ScriptedAdapter::new("slow", Step::ok().after(Duration::from_secs(30)))
        .with_timeout(Duration::from_millis(100));
    let launch = LaunchSpec {
        issue: Issue::new("42", "Slow"),
        adapter: Arc::new(slow),
        reserved_tokens: 5_000,
        speculative: false,
    };

    let id = h.manager.create(launch).unwrap();
    assert!(h.manager.drain(DRAIN).await);

    let workcell = h.manager.get(&id).unwrap();
    assert_eq!(workcell.status, WorkcellStatus::Failed);
    assert!(matches!(
        workcell.error(),
        Some(KernelError::AdapterTimeout { ref adapter, .. }) if adapter == "slow"
    ));
}

#[tokio::test]
async fn panicking_toolchain_fails_workcell_and_frees_its_slot() {
    let h = Harness::new(KernelConfig::default(), vec![Issue::new("42", "Crashes")]);
    let crashing: Arc<dyn ToolchainAdapter> =
        Arc::new(ScriptedAdapter::new("scripted", Step::ok()).then(Step::panic()));
    let mut runner = h.runner(vec![crashing]);

    let reports = runner.run_once(DRAIN).await;

    let id = &reports[0].launched[0];
    let stored = h.store().load(id).unwrap().unwrap();
    assert_eq!(stored.status, WorkcellStatus::Failed);
    assert!(matches!(
        stored.failure,
        Some(FailureReason::AdapterError { ref detail, .. }) if detail.contains("scripted adapter crashed")
    ));
    assert!(stored.sandbox_released);
    assert_eq!(h.sandboxes.releases(), vec![(id.to_string(), false)]);
    assert_eq!(
        reports[1].collected,
        vec![("42".to_string(), IssueOutcome::Retrying { attempts: 1 })]
    );
    assert_eq!(runner.manager().usage().active_workcells, 0);

    // The issue goes straight back into admission
    let report = runner.run_cycle().await;
    assert_eq!(report.launched.len(), 1);
    assert!(runner.manager().drain(DRAIN).await);
    runner.collect_cycle().await;
    assert_eq!(h.issue("42").status, IssueStatus::Done);
}

#[tokio::test]
async fn gate_failure_keeps_results_on_the_record() {
    let mut config = KernelConfig::default();
    config.gates.commands = vec![GateCommand::new("test", "test -f DONE")];

    let h = Harness::new(config, vec![]);
    let passing = h.manager.create(spec("1", Step::ok().writes("DONE"))).unwrap();
    let failing = h.manager.create(spec("2", Step::ok())).unwrap();
    assert!(h.manager.drain(DRAIN).await);

    let passed = h.manager.get(&passing).unwrap();
    assert_eq!(passed.status, WorkcellStatus::Completed);
    assert_eq!(passed.gate_results.len(), 1);

    let failed = h.manager.get(&failing).unwrap();
    assert_eq!(failed.status, WorkcellStatus::Failed);
    assert_eq!(failed.verdict, Some(Verdict::Fail));
    assert_eq!(
        failed.failure,
        Some(FailureReason::GateFailed {
            gate: "test".to_string(),
            exit_code: Some(1),
        })
    );
    assert!(failed.gate_results[0].output_path.exists());
}

#[tokio::test]
async fn eviction_is_idempotent() {
    let h = Harness::new(KernelConfig::default(), vec![]);
    let id = h
        .manager
        .create(spec("42", Step::ok().after(Duration::from_secs(30))))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(h.manager.evict(&id));
    assert!(!h.manager.evict(&id));

    let workcell = h.manager.get(&id).unwrap();
    assert_eq!(workcell.status, WorkcellStatus::Evicted);
    assert_eq!(h.sandboxes.release_count(id.as_str()), 1);
    assert_eq!(transitions_to(&h, &id, "evicted"), 1);
    assert!(!h.manager.release_sandbox(&id, false));
    assert!(h.manager.drain(Duration::from_millis(100)).await);

    // The aborted task never reports back
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.get(&id).unwrap().status, WorkcellStatus::Evicted);
}

#[tokio::test]
async fn evicting_a_terminal_workcell_does_nothing() {
    let h = Harness::new(KernelConfig::default(), vec![]);
    let id = h.manager.create(spec("42", Step::ok())).unwrap();
    assert!(h.manager.drain(DRAIN).await);

    assert!(!h.manager.evict(&id));
    assert_eq!(h.manager.get(&id).unwrap().status, WorkcellStatus::Completed);
    assert_eq!(h.sandboxes.release_count(id.as_str()), 1);
}

#[tokio::test]
async fn sandbox_failure_creates_no_workcell() {
    let h = Harness::new(KernelConfig::default(), vec![]);
    h.sandboxes.fail_acquire(true);

    let err = tokio_test::assert_err!(h.manager.create(spec("42", Step::ok())));

    assert!(matches!(err, KernelError::SandboxAcquisitionFailed { ref issue_id, .. } if issue_id == "42"));
    assert!(h.manager.snapshot().is_empty());
    assert!(h.store().load_all().unwrap().is_empty());
}

#[tokio::test]
async fn evicted_workcell_reopens_its_issue() {
    let issues = vec![Issue::new("42", "Long running")];
    let h = Harness::new(KernelConfig::default(), issues);
    let mut runner = h.runner(vec![adapter(Step::ok().after(Duration::from_secs(30)))]);

    let report = runner.run_cycle().await;
    assert_eq!(h.issue("42").status, IssueStatus::InProgress);

    assert!(runner.manager().evict(&report.launched[0]));
    let report = runner.collect_cycle().await;

    assert_eq!(report.collected, vec![("42".to_string(), IssueOutcome::Reopened)]);
    assert_eq!(h.issue("42").status, IssueStatus::Ready);
    assert_eq!(h.issue("42").attempts, 0);
}

#[tokio::test]
async fn shutdown_evicts_and_hands_issues_back() {
    let issues = vec![Issue::new("1", "One"), Issue::new("2", "Two")];
    let h = Harness::new(KernelConfig::default(), issues);
    let mut runner = h.runner(vec![adapter(Step::ok().after(Duration::from_secs(30)))]);

    let report = runner.run_cycle().await;
    assert_eq!(report.launched.len(), 2);

    runner.shutdown().await;

    assert!(!runner.manager().has_active());
    assert!(runner.manager().snapshot().is_empty());
    assert_eq!(h.issue("1").status, IssueStatus::Open);
    assert_eq!(h.issue("2").status, IssueStatus::Open);
    assert_eq!(h.sandboxes.releases().len(), 2);
}

#[tokio::test]
async fn restart_fails_in_flight_workcells_as_interrupted() {
    let issues = vec![Issue::new("42", "Interrupted work").with_status(IssueStatus::InProgress)];
    let h = Harness::new(KernelConfig::default(), issues);

    // A record left behind by a kernel that died mid-run
    let id = WorkcellId::new("42", 7);
    let path = h.config.workcells_dir.join(id.as_str());
    std::fs::create_dir_all(&path).unwrap();
    let orphan = Workcell {
        sandbox: Sandbox {
            name: id.to_string(),
            path,
            branch: format!("wc/42/{id}"),
        },
        id: id.clone(),
        seq: 7,
        issue_id: "42".to_string(),
        toolchain: "scripted".to_string(),
        status: WorkcellStatus::Running,
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        finished_at: None,
        reserved_tokens: 5_000,
        tokens_used: 0,
        gate_results: Vec::new(),
        verdict: None,
        failure: None,
        speculative: false,
        sandbox_released: false,
        collected: false,
        merge_ready: false,
        discarded: false,
    };
    h.store().save(&orphan).unwrap();

    let mut runner = h.runner(vec![adapter(Step::ok())]);
    let recovery = tokio_test::assert_ok!(runner.startup());

    assert_eq!(recovery.interrupted, vec![id.clone()]);
    let recovered = runner.manager().get(&id).unwrap();
    assert_eq!(recovered.status, WorkcellStatus::Failed);
    assert_eq!(recovered.failure, Some(FailureReason::Interrupted));
    assert_eq!(h.sandboxes.release_count(id.as_str()), 1);

    // The interrupted attempt counts against the retry budget
    let report = runner.collect_cycle().await;
    assert_eq!(
        report.collected,
        vec![("42".to_string(), IssueOutcome::Retrying { attempts: 1 })]
    );
    assert_eq!(h.issue("42").status, IssueStatus::Ready);

    // New workcells continue the sequence
    let report = runner.run_cycle().await;
    assert_eq!(report.launched[0].as_str(), "wc-42-000008");
    assert!(runner.manager().drain(DRAIN).await);
}

#[tokio::test]
async fn terminal_records_survive_restart_until_collected() {
    let h = Harness::new(KernelConfig::default(), vec![Issue::new("42", "Finish me")]);
    let mut runner = h.runner(vec![adapter(Step::ok())]);
    runner.run_cycle().await;
    assert!(runner.manager().drain(DRAIN).await);

    // Restart before the verdict was applied
    let manager = h.restarted_manager();
    let recovery = manager.recover().unwrap();
    assert!(recovery.interrupted.is_empty());
    assert_eq!(recovery.uncollected, 1);
    assert_eq!(manager.take_finished().len(), 1);

    let history = h.store().history(Some("42"), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, WorkcellStatus::Completed);
}
