//! Job lifecycle against the in-process transport: transaction, failure,
//! resume and watermark advance across runs.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use remote_file_input::pipeline::MemorySink;
use remote_file_input::sources::{
    Coordinator, JobError, MemoryTransport, RunState, StateError, Target,
};

mod util;
use util::{TestTracing, job};

const PATH: &str = "/mount/data/sample_01.csv";

fn fleet() -> MemoryTransport {
    MemoryTransport::new()
        .with_file("localhost:10022", PATH, "1,user1\n")
        .with_file("localhost:10023", PATH, "2,user2\n")
}

#[test]
fn transaction_commits_every_unit_and_advances_watermark() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    let sink = MemorySink::new();
    let config = job(&["localhost:10023", "localhost:10022"], PATH);

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    let report = coordinator.transaction(None).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.task_count, 2);
    assert_eq!(report.total_bytes(), 16);
    assert_eq!(
        report.diff.unwrap().last_target,
        Some(Target::new("localhost:10023", PATH))
    );
    assert!(!state_path.exists(), "state is removed after full success");

    // Unit indices follow resolver order.
    assert_eq!(sink.get(0).unwrap(), b"2,user2\n");
    assert_eq!(sink.get(1).unwrap(), b"1,user1\n");
}

#[test]
fn failed_unit_keeps_watermark_and_resume_redrives_only_it() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    transport.set_reachable("localhost:10023", false);
    let sink = MemorySink::new();
    let config = job(&["localhost:10022", "localhost:10023"], PATH);

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    let report = coordinator.transaction(None).unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.pending, vec![1]);
    assert!(report.diff.is_none(), "watermark must not move on failure");
    assert_eq!(report.failed_units().count(), 1);

    let saved = RunState::load(&state_path).unwrap();
    assert_eq!(saved.committed.iter().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(saved.targets.len(), 2);

    // Host list changes must not affect a resume.
    transport.set_reachable("localhost:10023", true);
    transport.add_file("localhost:10024", PATH, "3,user3\n");
    let downloads_before = transport.downloads().len();

    let report = coordinator.resume_saved().unwrap();
    assert!(report.succeeded());
    assert_eq!(report.units.len(), 1);
    assert_eq!(report.units[0].index, 1);
    assert_eq!(transport.downloads().len(), downloads_before + 1);
    assert_eq!(
        report.diff.unwrap().last_target,
        Some(Target::new("localhost:10023", PATH)),
        "watermark is the maximum of the whole task set"
    );
    assert_eq!(sink.len(), 2);
    assert!(!state_path.exists());
}

#[test]
fn resume_after_success_has_nothing_to_resume() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    let sink = MemorySink::new();
    let config = job(&["localhost:10022"], PATH);

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    assert!(coordinator.transaction(None).unwrap().succeeded());

    let err = coordinator.resume_saved().unwrap_err();
    assert!(matches!(err, JobError::State(StateError::Read { .. })));
}

#[test]
fn resuming_a_complete_state_is_a_no_op() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    let sink = MemorySink::new();
    let config = job(&["localhost:10022"], PATH);

    let mut state = RunState::new(vec![Target::new("localhost:10022", PATH)]);
    state.commit(0);
    state.save(&state_path).unwrap();

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    let report = coordinator.resume_saved().unwrap();

    assert!(report.succeeded());
    assert!(report.units.is_empty());
    assert_eq!(transport.connect_count(), 0);
    assert_eq!(
        report.diff.unwrap().last_target,
        Some(Target::new("localhost:10022", PATH))
    );
}

#[test]
fn successive_runs_fetch_only_new_hosts() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    let sink = MemorySink::new();

    let first = job(&["localhost:10022", "localhost:10023"], PATH);
    let coordinator = Coordinator::new(&first, &transport, &sink, &state_path).unwrap();
    let watermark = coordinator.transaction(None).unwrap().diff.unwrap();

    transport.add_file("localhost:10024", PATH, "3,user3\n");
    transport.add_file("localhost:10021", PATH, "0,user0\n");
    let second = job(
        &["localhost:10021", "localhost:10022", "localhost:10023", "localhost:10024"],
        PATH,
    );
    let sink = MemorySink::new();
    let coordinator = Coordinator::new(&second, &transport, &sink, &state_path).unwrap();
    let report = coordinator
        .transaction(watermark.last_target.as_ref())
        .unwrap();

    assert_eq!(report.task_count, 1);
    assert_eq!(sink.get(0).unwrap(), b"3,user3\n");
    assert_eq!(
        report.diff.unwrap().last_target,
        Some(Target::new("localhost:10024", PATH))
    );
}

#[test]
fn empty_task_set_succeeds_without_diff() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    let sink = MemorySink::new();
    let config = job(&["localhost:10022"], PATH);
    let mark = Target::new("localhost:10022", PATH);

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    let report = coordinator.transaction(Some(&mark)).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.task_count, 0);
    assert!(report.diff.is_none());
    assert!(sink.is_empty());
    assert!(!state_path.exists());
}

#[test]
fn missing_hosts_are_dropped_when_ignoring_not_found() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet().with_file("localhost:10024", "/elsewhere.csv", "x");
    let sink = MemorySink::new();
    let mut config = job(
        &["localhost:10022", "localhost:10024", "localhost:10023"],
        PATH,
    );
    config.ignore_not_found_hosts = true;

    let tracing = TestTracing::new();
    let _guard = tracing.install();

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    let report = coordinator.transaction(None).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.task_count, 2);
    tracing.assert_contains("Remote file not found");
    tracing.assert_contains("Loading targets");
}

#[test]
fn without_probes_a_missing_file_fails_its_unit() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet().with_file("localhost:10024", "/elsewhere.csv", "x");
    let sink = MemorySink::new();
    let config = job(&["localhost:10022", "localhost:10024"], PATH);

    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path).unwrap();
    let report = coordinator.transaction(None).unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.pending, vec![1]);
    assert!(report.units[1].error.as_deref().unwrap().contains("not found"));
}

#[test]
fn cancelled_job_starts_no_units() {
    let tmp = tempfile::TempDir::new().unwrap();
    let state_path = tmp.path().join("run.state.json");
    let transport = fleet();
    let sink = MemorySink::new();
    let config = job(&["localhost:10022", "localhost:10023"], PATH);

    let cancel = Arc::new(AtomicBool::new(true));
    let coordinator = Coordinator::new(&config, &transport, &sink, &state_path)
        .unwrap()
        .with_cancel_flag(cancel);
    let report = coordinator.transaction(None).unwrap();

    assert!(report.cancelled);
    assert_eq!(report.pending, vec![0, 1]);
    assert!(report.diff.is_none());
    assert_eq!(transport.connect_count(), 0);
    assert!(state_path.exists());
}

#[test]
fn invalid_auth_fails_before_connecting() {
    let transport = fleet();
    let sink = MemorySink::new();
    let mut config = job(&["localhost:10022"], PATH);
    config.auth.kind = Some("password".into());

    let err = Coordinator::new(&config, &transport, &sink, "unused.json")
        .err()
        .unwrap();
    assert!(matches!(err, JobError::Config(_)));
    assert_eq!(transport.connect_count(), 0);
}
