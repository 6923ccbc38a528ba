mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{adapter, Harness, ScriptedAdapter, Step};
use cyntra_kernel::adapters::ToolchainAdapter;
use cyntra_kernel::config::{FixIssuePolicy, GateCommand};
use cyntra_kernel::kernel::IssueOutcome;
use cyntra_kernel::state::{Issue, IssueStatus, Priority};
use cyntra_kernel::KernelConfig;

const DRAIN: Duration = Duration::from_secs(10);

fn chain() -> Vec<Issue> {
    vec![
        Issue::new("A", "Add schema"),
        Issue::new("B", "Add API").depends_on("A"),
        Issue::new("C", "Add UI").depends_on("A"),
    ]
}

#[tokio::test]
async fn dependents_become_ready_after_blocker_completes() {
    let h = Harness::new(KernelConfig::default(), chain());
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    let reports = runner.run_once(DRAIN).await;

    let first = &reports[0];
    assert_eq!(first.schedule.ready_issues, vec!["A".to_string()]);
    assert_eq!(first.launched.len(), 1);
    assert_eq!(first.launched[0].as_str(), "wc-A-000001");

    let second = &reports[1];
    assert!(matches!(
        second.collected.as_slice(),
        [(issue, IssueOutcome::Done { .. })] if issue == "A"
    ));
    assert_eq!(h.issue("A").status, IssueStatus::Done);
    assert_eq!(h.issue("B").status, IssueStatus::Ready);
    assert_eq!(h.issue("C").status, IssueStatus::Ready);
    assert!(h.issue("B").ready_since.is_some());
    assert!(second.launched.is_empty());
}

#[tokio::test]
async fn blocked_issues_stay_open_while_blocker_runs() {
    let h = Harness::new(KernelConfig::default(), chain());
    let mut runner = h.runner(vec![adapter(Step::ok().after(Duration::from_millis(300)))]);

    let report = runner.run_cycle().await;

    assert_eq!(report.launched.len(), 1);
    assert_eq!(h.issue("A").status, IssueStatus::InProgress);
    assert_eq!(h.issue("B").status, IssueStatus::Open);
    assert_eq!(h.issue("C").status, IssueStatus::Open);

    // A busy issue is never admitted twice
    let again = runner.run_cycle().await;
    assert!(again.launched.is_empty());
    assert_eq!(runner.manager().usage().active_workcells, 1);

    assert!(runner.manager().drain(DRAIN).await);
    runner.collect_cycle().await;
}

#[tokio::test]
async fn missing_blocker_keeps_issue_out_of_the_ready_set() {
    let issues = vec![
        Issue::new("orphan", "Depends on nothing real").depends_on("ghost"),
        Issue::new("free", "No blockers"),
    ];
    let h = Harness::new(KernelConfig::default(), issues);
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    let reports = runner.run_once(DRAIN).await;

    assert_eq!(reports[0].schedule.ready_issues, vec!["free".to_string()]);
    assert_eq!(h.issue("orphan").status, IssueStatus::Open);
    assert_eq!(h.issue("free").status, IssueStatus::Done);
}

#[tokio::test]
async fn starved_issue_gets_the_only_slot() {
    let now = Utc::now();
    let issues = vec![
        Issue::new("fresh", "Recently ready")
            .with_priority(Priority::P2)
            .with_status(IssueStatus::Ready)
            .ready_since(now - chrono::Duration::hours(1)),
        Issue::new("starved", "Waiting forever")
            .with_priority(Priority::P3)
            .with_status(IssueStatus::Ready)
            .ready_since(now - chrono::Duration::hours(10)),
    ];
    let mut config = KernelConfig::default();
    config.scheduling.max_concurrent_workcells = 1;
    let h = Harness::new(config, issues);
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    let report = runner.run_cycle().await;

    assert_eq!(report.schedule.boosted, vec!["starved".to_string()]);
    assert_eq!(report.schedule.admitted.len(), 1);
    assert_eq!(report.schedule.admitted[0].issue_id, "starved");
    assert_eq!(h.issue("fresh").status, IssueStatus::Ready);

    assert!(runner.manager().drain(DRAIN).await);
    runner.collect_cycle().await;
}

#[tokio::test]
async fn previously_attempted_issue_is_not_boosted() {
    let now = Utc::now();
    let mut retried = Issue::new("retried", "Failed once")
        .with_priority(Priority::P3)
        .with_status(IssueStatus::Ready)
        .ready_since(now - chrono::Duration::hours(10));
    retried.attempts = 1;
    let h = Harness::new(KernelConfig::default(), vec![retried]);
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    let report = runner.run_cycle().await;

    assert!(report.schedule.boosted.is_empty());
    assert!(runner.manager().drain(DRAIN).await);
    runner.collect_cycle().await;
}

#[tokio::test]
async fn issue_admitted_before_is_not_boosted_after_gate_failure() {
    let mut config = KernelConfig::default();
    config.gates.commands = vec![GateCommand::new("test", "exit 1")];
    let issue = Issue::new("x", "Fails its gates").with_priority(Priority::P3);
    let h = Harness::new(config, vec![issue]);
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    let reports = runner.run_once(DRAIN).await;
    let (_, outcome) = &reports[1].collected[0];
    let IssueOutcome::FixIssue { fix_id } = outcome else {
        panic!("expected a fix issue, got {outcome:?}");
    };
    let x = h.issue("x");
    assert_eq!(x.status, IssueStatus::Open);
    assert_eq!(x.attempts, 0);
    assert!(x.admitted_at.is_some());

    // The fix lands and the original has waited well past the threshold
    let mut fix = h.issue(fix_id);
    fix.status = IssueStatus::Done;
    h.tracker.upsert(fix);
    let mut x = h.issue("x");
    x.status = IssueStatus::Ready;
    x.ready_since = Some(Utc::now() - chrono::Duration::hours(10));
    h.tracker.upsert(x);

    let report = runner.run_cycle().await;

    assert!(report.schedule.boosted.is_empty());
    assert_eq!(report.schedule.admitted[0].issue_id, "x");
    assert!(runner.manager().drain(DRAIN).await);
    runner.collect_cycle().await;
}

#[tokio::test]
async fn tracker_outage_is_reported_and_recovered() {
    let h = Harness::new(KernelConfig::default(), chain());
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    h.tracker.set_unavailable(true);
    let report = runner.run_cycle().await;
    assert!(report.tracker_error.is_some());
    assert!(report.launched.is_empty());
    assert_eq!(runner.manager().usage().active_workcells, 0);

    h.tracker.set_unavailable(false);
    let reports = runner.run_once(DRAIN).await;
    assert!(reports[0].tracker_error.is_none());
    assert_eq!(reports[0].launched.len(), 1);
    assert_eq!(h.issue("A").status, IssueStatus::Done);
}

#[tokio::test]
async fn adapter_failure_is_retried_until_budget_runs_out() {
    let mut config = KernelConfig::default();
    config.scheduling.max_attempts = 2;
    let h = Harness::new(config, vec![Issue::new("flaky", "Keeps failing")]);
    let mut runner = h.runner(vec![adapter(Step::fail())]);

    let reports = runner.run_once(DRAIN).await;
    assert_eq!(
        reports[1].collected,
        vec![("flaky".to_string(), IssueOutcome::Retrying { attempts: 1 })]
    );
    // Reopened, then made ready again by the same collection cycle
    assert_eq!(h.issue("flaky").status, IssueStatus::Ready);
    assert_eq!(h.issue("flaky").attempts, 1);

    let reports = runner.run_once(DRAIN).await;
    let (issue, outcome) = &reports[1].collected[0];
    assert_eq!(issue, "flaky");
    let IssueOutcome::FixIssue { fix_id } = outcome else {
        panic!("expected a fix issue, got {outcome:?}");
    };

    let fix = h.issue(fix_id);
    assert!(fix.title.starts_with("[FIX]"));
    assert_eq!(fix.parent.as_deref(), Some("flaky"));
    assert!(fix.body.contains("scripted failure"));

    let original = h.issue("flaky");
    assert_eq!(original.status, IssueStatus::Open);
    assert!(original.depends_on.contains(fix_id));
}

#[tokio::test]
async fn gate_failure_files_fix_issue_immediately() {
    let mut config = KernelConfig::default();
    config.gates.commands = vec![GateCommand::new("test", "echo 'assertion failed' && exit 1")];
    config.failure.fix_issue_policy = FixIssuePolicy::MarkFailed;
    let h = Harness::new(config, vec![Issue::new("7", "Broken change")]);
    let mut runner = h.runner(vec![adapter(Step::ok())]);

    let reports = runner.run_once(DRAIN).await;

    let (_, outcome) = &reports[1].collected[0];
    let IssueOutcome::FixIssue { fix_id } = outcome else {
        panic!("expected a fix issue, got {outcome:?}");
    };
    assert_eq!(h.issue("7").status, IssueStatus::BlockedFailed);
    assert_eq!(h.issue("7").attempts, 0);

    let fix = h.issue(fix_id);
    assert!(fix.body.contains("Gate `test`"));
    assert!(fix.body.contains("assertion failed"));
    assert!(fix.labels.contains(&"fix".to_string()));
}

#[tokio::test]
async fn target_restricts_admission() {
    let issues = vec![Issue::new("1", "One"), Issue::new("2", "Two")];
    let h = Harness::new(KernelConfig::default(), issues);
    let mut runner = h.runner(vec![adapter(Step::ok())]);
    runner.set_target(Some("2".to_string()));

    let reports = runner.run_once(DRAIN).await;

    assert_eq!(reports[0].schedule.ready_issues, vec!["2".to_string()]);
    assert_eq!(h.issue("1").status, IssueStatus::Ready);
    assert_eq!(h.issue("2").status, IssueStatus::Done);
}

#[tokio::test]
async fn in_progress_issue_without_workcell_is_reopened() {
    let issues = vec![Issue::new("stale", "Left behind").with_status(IssueStatus::InProgress)];
    let h = Harness::new(KernelConfig::default(), issues);
    let mut runner = h.runner(vec![adapter(Step::ok().after(Duration::from_millis(200)))]);

    let report = runner.run_cycle().await;

    assert_eq!(report.reopened, vec!["stale".to_string()]);
    // Reopened, made ready and admitted in the same cycle
    assert_eq!(report.launched.len(), 1);
    assert_eq!(h.issue("stale").status, IssueStatus::InProgress);

    assert!(runner.manager().drain(DRAIN).await);
    runner.collect_cycle().await;
    assert_eq!(h.issue("stale").status, IssueStatus::Done);
}

#[tokio::test]
async fn tool_hint_selects_adapter() {
    let alpha = Arc::new(ScriptedAdapter::new("alpha", Step::ok()));
    let beta = Arc::new(ScriptedAdapter::new("beta", Step::ok()));
    let mut issue = Issue::new("1", "Prefers beta");
    issue.tool_hint = Some("beta".to_string());
    let h = Harness::new(KernelConfig::default(), vec![issue]);
    let adapters: Vec<Arc<dyn ToolchainAdapter>> = vec![alpha.clone(), beta.clone()];
    let mut runner = h.runner(adapters);

    runner.run_once(DRAIN).await;

    assert_eq!(alpha.calls(), 0);
    assert_eq!(beta.calls(), 1);
}

#[tokio::test]
async fn reload_rebuilds_toolchains_but_keeps_paths() {
    let h = Harness::new(KernelConfig::default(), vec![Issue::new("1", "One")]);
    let path = KernelConfig::project_config_path(h.dir.path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "toolchain_priority: []\nstate_dir: .elsewhere\n").unwrap();
    let mut runner = h
        .runner(vec![adapter(Step::ok())])
        .with_config_path(path);

    runner.reload_config();

    assert!(runner.config().toolchain_priority.is_empty());
    assert_eq!(runner.config().state_dir, h.config.state_dir);

    // No toolchain is configured any more, so admission cannot launch
    let report = runner.run_cycle().await;
    assert!(report.launched.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(h.issue("1").status, IssueStatus::Ready);
}
