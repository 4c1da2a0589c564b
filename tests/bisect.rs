mod common;

use common::{CapturingDelivery, FakeBuilder, FakeLab, Fixture, linear_history};
use kpatch_ci::bisect::{
    BisectEngine, BisectRecord, BisectSeries, BisectStatus, Classification, Conclusion,
    PipelineOracle,
};
use kpatch_ci::error::{PipelineError, Result};
use kpatch_ci::observability::MetricsCollector;
use kpatch_ci::pipeline::{StageKind, StageStatus, build_pipeline};
use kpatch_ci::stages::default_registry;
use kpatch_ci::state::WorkflowState;
use kpatch_ci::results::Verdict;
use kpatch_ci::tools::{CommandLab, CommitGraph, CopyPublisher, Toolbox};

struct Bisection {
    result: Result<Conclusion>,
    record: BisectRecord,
    metrics: MetricsCollector,
}

fn bisect(fixture: &Fixture, history: &[String], builder: FakeBuilder, lab: FakeLab) -> Bisection {
    bisect_with(fixture, history, fixture.toolbox(fixture.vcs(history), builder, lab))
}

fn bisect_with(fixture: &Fixture, history: &[String], mut tools: Toolbox) -> Bisection {
    let registry = default_registry();
    let metrics = MetricsCollector::new();
    let settings = &fixture.config.bisect;
    let engine = BisectEngine::new(
        settings,
        settings.record_path(&fixture.config.workdir()),
        &metrics,
    );

    let good = &history[0];
    let bad = &history[history.len() - 1];
    let candidates = tools.vcs.candidates(bad, std::slice::from_ref(good)).unwrap();
    let mut record = match engine.open(&BisectSeries::from_config(&fixture.config), good, bad, &candidates) {
        Ok(record) => record,
        Err(err) => {
            return Bisection {
                result: Err(err),
                record: BisectRecord::load(&settings.record_path(&fixture.config.workdir()))
                    .unwrap()
                    .unwrap(),
                metrics,
            };
        }
    };
    let mut oracle = PipelineOracle::new(&registry, &fixture.config, &mut tools, &metrics);
    let result = engine.run(&mut record, &mut oracle);
    Bisection {
        result,
        record,
        metrics,
    }
}

fn ceil_log2(n: usize) -> usize {
    (usize::BITS - n.max(1).saturating_sub(1).leading_zeros()) as usize
}

#[test]
fn linear_history_converges_within_log2_probes() {
    let history = linear_history(16);
    for first_bad in 1..history.len() {
        let mut fixture = Fixture::new();
        fixture.config.bisect.verify_bounds = false;
        let lab = FakeLab::new(history.clone(), Some(first_bad));

        let run = bisect(&fixture, &history, FakeBuilder::new(), lab);
        assert_eq!(
            run.result.unwrap(),
            Conclusion::Culprit(history[first_bad].clone()),
            "first bad {first_bad}"
        );
        let range = history.len() - 1;
        assert!(
            run.record.probes.len() <= ceil_log2(range),
            "{} probes for culprit {first_bad}",
            run.record.probes.len()
        );
    }
}

#[test]
fn only_unbuildable_commits_between_bounds_is_inconclusive() {
    let fixture = Fixture::new();
    let history = linear_history(5);
    let lab = FakeLab::new(history.clone(), Some(4));
    let builder = FakeBuilder::broken(["c01", "c02", "c03"]);

    let run = bisect(&fixture, &history, builder, lab);
    match run.result.unwrap() {
        Conclusion::Inconclusive {
            good,
            bad,
            untestable,
        } => {
            assert_eq!(good, "c00");
            assert_eq!(bad, "c04");
            assert_eq!(untestable, vec!["c01", "c02", "c03"]);
        }
        other => panic!("expected inconclusive, got {other:?}"),
    }
    assert_eq!(run.record.status, BisectStatus::Inconclusive);
    assert_eq!(run.record.culprit, None);
}

#[test]
fn exhausted_infra_errors_are_skipped_never_bad() {
    let mut fixture = Fixture::new();
    fixture.config.bisect.verify_bounds = false;
    fixture.config.bisect.infra_retries = 2;
    let history = linear_history(3);
    let lab = FakeLab::new(history.clone(), Some(2)).flaky("c01", 10);
    let lab_log = lab.log.clone();

    let run = bisect(&fixture, &history, FakeBuilder::new(), lab);
    assert!(!run.result.unwrap().is_culprit());
    assert_eq!(
        run.record.classification("c01"),
        Some(Classification::InfraExhausted)
    );
    assert_eq!(run.record.bad, "c02");

    let snapshot = run.metrics.snapshot();
    assert_eq!(snapshot.bisect_probes, 3);
    assert_eq!(snapshot.infra_retries, 2);
    assert_eq!(lab_log.borrow().completed, vec!["c01", "c01", "c01"]);
}

#[test]
fn transient_infra_error_is_retried_on_the_same_build() {
    let mut fixture = Fixture::new();
    fixture.config.bisect.verify_bounds = false;
    fixture.config.bisect.pin_host = false;
    let history = linear_history(3);
    let lab = FakeLab::new(history.clone(), Some(2)).flaky("c01", 1);
    let lab_log = lab.log.clone();

    let run = bisect(&fixture, &history, FakeBuilder::new(), lab);
    assert_eq!(run.result.unwrap(), Conclusion::Culprit("c02".into()));
    assert_eq!(run.record.classification("c01"), Some(Classification::Good));
    assert_eq!(run.record.probes.len(), 2);

    let log = lab_log.borrow();
    assert_eq!(log.submitted.len(), 2);
    assert_eq!(
        log.submitted[0].document, log.submitted[1].document,
        "the retry should test the same published kernel"
    );
}

#[test]
fn resumed_bisection_probes_what_a_fresh_one_would() {
    let history = linear_history(12);

    let fresh = Fixture::new();
    let lab = FakeLab::new(history.clone(), Some(7));
    let fresh_log = lab.log.clone();
    let expected = bisect(&fresh, &history, FakeBuilder::new(), lab);
    assert_eq!(expected.result.unwrap(), Conclusion::Culprit("c07".into()));

    let fixture = Fixture::new();
    let interrupted_lab = FakeLab::new(history.clone(), Some(7)).outage_after(3);
    let interrupted_log = interrupted_lab.log.clone();
    let interrupted = bisect(&fixture, &history, FakeBuilder::new(), interrupted_lab);
    assert!(matches!(
        interrupted.result,
        Err(PipelineError::Environment { stage: StageKind::Run, .. })
    ));

    let record_path = fixture.config.bisect.record_path(&fixture.config.workdir());
    let saved = BisectRecord::load(&record_path).unwrap().unwrap();
    assert_eq!(saved.probes.len(), 3);
    assert_eq!(saved.status, BisectStatus::Running);

    let lab = FakeLab::new(history.clone(), Some(7));
    let resumed_log = lab.log.clone();
    let resumed = bisect(&fixture, &history, FakeBuilder::new(), lab);
    assert_eq!(resumed.result.unwrap(), Conclusion::Culprit("c07".into()));

    let mut probed = interrupted_log.borrow().completed.clone();
    probed.extend(resumed_log.borrow().completed.iter().cloned());
    assert_eq!(probed, fresh_log.borrow().completed);
}

#[test]
fn interrupted_bisection_of_other_patches_is_not_resumed() {
    let history = linear_history(12);
    let mut fixture = Fixture::new();
    fixture.config.bisect.patches = vec!["0001-a.patch".into()];
    let lab = FakeLab::new(history.clone(), Some(7)).outage_after(2);
    let interrupted = bisect(&fixture, &history, FakeBuilder::new(), lab);
    assert!(interrupted.result.is_err());
    assert_eq!(interrupted.record.series.patches, vec!["0001-a.patch"]);

    fixture.config.bisect.patches = vec!["0002-b.patch".into()];
    let lab = FakeLab::new(history.clone(), Some(7));
    let lab_log = lab.log.clone();
    let refused = bisect(&fixture, &history, FakeBuilder::new(), lab);
    assert!(matches!(refused.result, Err(PipelineError::StateInUse { .. })));
    assert!(lab_log.borrow().completed.is_empty());
    assert_eq!(refused.record.probes.len(), 2);
}

/// The lab commands use the tested commit as job id and report a kernel
/// panic from `c04` on.
#[cfg(unix)]
#[test]
fn panicking_kernels_are_bad_commits() {
    let mut fixture = Fixture::new();
    fixture.config.run.poll_interval_secs = 0;
    fixture.config.run.submit_command = vec![
        "sh".into(),
        "-c".into(),
        r#"sed -n 's/.*kver="6\.1\.0-\([^"+]*\)".*/\1/p'"#.into(),
    ];
    fixture.config.run.status_command = vec![
        "sh".into(),
        "-c".into(),
        r#"case "$0" in c0[4-7]) printf 'state: completed\nresult: PANIC\n' ;; *) printf 'state: completed\nresult: PASS\n' ;; esac"#.into(),
    ];
    let history = linear_history(8);
    let tools = Toolbox::new(
        Box::new(fixture.vcs(&history)),
        Box::new(FakeBuilder::new()),
        Box::new(CopyPublisher),
        Box::new(CommandLab::new(&fixture.config.run)),
        Box::new(CapturingDelivery::default()),
    );

    let run = bisect_with(&fixture, &history, tools);
    assert_eq!(run.result.unwrap(), Conclusion::Culprit("c04".into()));
    assert_eq!(run.record.classification("c04"), Some(Classification::Bad));
    assert!(run.record.probes.iter().all(|probe| probe.verdict != Some(Verdict::Error)));
}

#[test]
fn good_bound_that_fails_aborts_the_search() {
    let fixture = Fixture::new();
    let history = linear_history(6);
    let lab = FakeLab::new(history.clone(), Some(0));

    let run = bisect(&fixture, &history, FakeBuilder::new(), lab);
    match run.result {
        Err(PipelineError::InconsistentBounds { commit, .. }) => assert_eq!(commit, "c00"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn probes_stay_on_the_host_that_passed_the_good_bound() {
    let fixture = Fixture::new();
    let history = linear_history(6);
    let lab = FakeLab::new(history.clone(), Some(3));
    let lab_log = lab.log.clone();

    let run = bisect(&fixture, &history, FakeBuilder::new(), lab);
    assert_eq!(run.result.unwrap(), Conclusion::Culprit("c03".into()));
    assert_eq!(run.record.pinned_host.as_deref(), Some("lab-01.example.org"));

    let log = lab_log.borrow();
    assert!(log.submitted[0].host.is_none());
    for job in &log.submitted[1..] {
        assert_eq!(job.host.as_deref(), Some("lab-01.example.org"));
        assert!(job.document.contains("<hostname op=\"=\" value=\"lab-01.example.org\"/>"));
    }
}

#[test]
fn bisect_stage_records_the_culprit() {
    let mut fixture = Fixture::new();
    fixture.config.bisect.good_ref = "c00".into();
    fixture.config.bisect.bad_ref = Some("c09".into());
    let history = linear_history(10);
    let mut tools = fixture.toolbox(
        fixture.vcs(&history),
        FakeBuilder::new(),
        FakeLab::new(history.clone(), Some(5)),
    );
    let executor = build_pipeline(
        &default_registry(),
        &[StageKind::Bisect],
        &fixture.config,
        MetricsCollector::new(),
    )
    .unwrap();

    let mut state = WorkflowState::new();
    let outcome = executor
        .execute(&mut state, Some(&fixture.state_path()), &fixture.config, &mut tools)
        .unwrap();
    assert_eq!(outcome.status, StageStatus::Passed);
    assert_eq!(
        state.text_opt(StageKind::Bisect, "culprit").as_deref(),
        Some("c05")
    );
    assert_eq!(
        state.text_opt(StageKind::Bisect, "status").as_deref(),
        Some("found")
    );
}
