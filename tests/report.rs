use std::path::PathBuf;

use kpatch_ci::config::ReportTemplate;
use kpatch_ci::error::PipelineError;
use kpatch_ci::identity::Uid;
use kpatch_ci::report::{ReportEntry, ReportStatus, aggregate};
use kpatch_ci::results::{BuildResult, MergeConflict, MergeResult, RunResult, TaskOutcome, Verdict};
use kpatch_ci::state::WorkflowState;

const REPO: &str = "git://git.kernel.org/pub/scm/linux/kernel/git/stable/linux-stable.git";

fn merged(patches: &[&str]) -> MergeResult {
    let patches: Vec<String> = patches.iter().map(|p| p.to_string()).collect();
    MergeResult {
        base_repo: REPO.into(),
        reference: "linux-6.1.y".into(),
        commit: "a1b2c3d".into(),
        commit_date: Some(1_700_000_000),
        uid: Uid::compute(REPO, "a1b2c3d", &patches),
        patches,
        head: "e4f5a6b".into(),
        tree: PathBuf::from("work/source"),
    }
}

fn tested(merge: &MergeResult, host: &str, job: &str, verdict: Verdict) -> WorkflowState {
    let mut state = WorkflowState::new();
    merge.to_state(&mut state);
    BuildResult {
        commit: merge.head.clone(),
        succeeded: true,
        artifact: Some(PathBuf::from("work/build/e4f5a6b.tar.gz")),
        config: Some(PathBuf::from("work/build/e4f5a6b.config")),
        kernel_release: Some("6.1.58-kpatch".into()),
        arch: "x86_64".into(),
        log: PathBuf::from("work/build/build.log"),
    }
    .to_state(&mut state);
    RunResult {
        jobs: vec![job.into()],
        host: Some(host.into()),
        arch: Some("x86_64".into()),
        tasks: vec![
            TaskOutcome {
                name: "Boot test".into(),
                result: Verdict::Pass,
                log: None,
            },
            TaskOutcome {
                name: "LTP lite".into(),
                result: verdict,
                log: (verdict != Verdict::Pass)
                    .then(|| format!("https://lab.example.org/{job}/ltp.log")),
            },
        ],
        console: Some(format!("https://lab.example.org/{job}/console.log")),
        ..RunResult::completed(verdict)
    }
    .to_state(&mut state);
    state
}

#[test]
fn different_series_cannot_share_a_report() {
    let one = tested(&merged(&["0001-a.patch"]), "lab-01", "J:1", Verdict::Pass);
    let two = tested(&merged(&["0002-b.patch"]), "lab-02", "J:2", Verdict::Pass);

    let entries = vec![
        ReportEntry::from_state(&one, "one.yaml").unwrap(),
        ReportEntry::from_state(&two, "two.yaml").unwrap(),
    ];
    match aggregate(entries, ReportTemplate::Full) {
        Err(PipelineError::MismatchedSeries { source_label, .. }) => {
            assert_eq!(source_label, "two.yaml")
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn two_hosts_are_listed_in_host_order() {
    let merge = merged(&["0001-a.patch"]);
    let zulu = tested(&merge, "zulu.lab.example.org", "J:20", Verdict::Pass);
    let alpha = tested(&merge, "alpha.lab.example.org", "J:10", Verdict::Fail);

    let entries = vec![
        ReportEntry::from_state(&zulu, "zulu.yaml").unwrap(),
        ReportEntry::from_state(&alpha, "alpha.yaml").unwrap(),
    ];
    let report = aggregate(entries, ReportTemplate::Full).unwrap();

    assert_eq!(report.status, ReportStatus::TestFailed);
    assert_eq!(
        report.subject,
        "FAIL: Test report for kernel 6.1.58-kpatch (linux-stable)"
    );
    assert_eq!(report.job_ids, vec!["J:10".to_string(), "J:20".to_string()]);

    let alpha_at = report.body.find("alpha.lab.example.org").unwrap();
    let zulu_at = report.body.find("zulu.lab.example.org").unwrap();
    assert!(alpha_at < zulu_at, "{}", report.body);
    assert!(report.body.contains("LTP lite"), "{}", report.body);
    assert!(
        report.body.contains("log: https://lab.example.org/J:10/ltp.log"),
        "{}",
        report.body
    );
    assert!(!report.body.contains("J:20/ltp.log"), "{}", report.body);
    assert!(
        report
            .body
            .contains("Console log: https://lab.example.org/J:20/console.log"),
        "{}",
        report.body
    );
}

#[test]
fn call_traces_are_quoted_in_the_full_report() {
    let merge = merged(&["0001-a.patch"]);
    let mut state = tested(&merge, "lab-01", "J:1", Verdict::Pass);
    let mut run = RunResult::from_state(&state).unwrap();
    run.traces = vec!["[ 1.0] BUG: soft lockup\n[ 1.1] Call Trace:".into()];
    run.to_state(&mut state);

    let report = aggregate(
        vec![ReportEntry::from_state(&state, "state.yaml").unwrap()],
        ReportTemplate::Full,
    )
    .unwrap();
    assert!(
        report.body.contains("Call traces found in the console log:"),
        "{}",
        report.body
    );
    assert!(report.body.contains("    [ 1.1] Call Trace:"), "{}", report.body);
}

#[test]
fn merge_failure_outranks_everything() {
    let merge = merged(&["0001-a.patch"]);
    let mut conflicted = WorkflowState::new();
    MergeConflict {
        base_repo: merge.base_repo.clone(),
        commit: merge.commit.clone(),
        patches: merge.patches.clone(),
        uid: merge.uid.clone(),
        failed_patch: "0001-a.patch".into(),
        log: None,
    }
    .to_state(&mut conflicted);
    let passed = tested(&merge, "lab-01", "J:1", Verdict::Pass);

    let report = aggregate(
        vec![
            ReportEntry::from_state(&passed, "passed.yaml").unwrap(),
            ReportEntry::from_state(&conflicted, "conflict.yaml").unwrap(),
        ],
        ReportTemplate::Full,
    )
    .unwrap();
    assert_eq!(report.status, ReportStatus::MergeFailed);
    assert!(
        report.subject.starts_with("FAIL: Patch application failed"),
        "{}",
        report.subject
    );
    assert!(
        report.body.contains("Patch 0001-a.patch does not apply."),
        "{}",
        report.body
    );
}
