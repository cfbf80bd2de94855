//! End-to-end `TaskManager` behavior (spec.md §8 property scenarios),
//! exercised without a live session bus — `ipc` is a thin adapter over
//! this, so the interesting invariants live here.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskd::follower::FollowerTransport;
use taskd::manager::{StateChangeNotifier, TaskManager};
use taskd::task::TaskState;
use tempfile::TempDir;

#[derive(Default)]
struct NullTransport;

impl FollowerTransport for NullTransport {
    fn write(&self, _bus_name: &str, _line: &str) {}
    fn quit(&self, _bus_name: &str, _returncode: i32) {}
}

#[derive(Default)]
struct RecordingNotifier {
    states: Mutex<Vec<i32>>,
}

impl StateChangeNotifier for RecordingNotifier {
    fn task_state_changed(
        &self,
        new_state: i32,
        _task_id: u64,
        _task_pwd: &str,
        _task_cmd: &str,
        _duration: i64,
    ) {
        self.states.lock().unwrap().push(new_state);
    }
}

// This binary links taskd's normal (non-test) build, so it has no access to
// `config::test_support` (that module is `#[cfg(test)]`-gated inside the
// lib's own test build). Redirect `Config`'s `lazy_static` log directory the
// same way, just local to this file: a `lazy_static`-held `TempDir`, whose
// `Once` makes the one-time env var setup race-free across every test in
// this binary.
lazy_static::lazy_static! {
    static ref TEST_LOG_DIR: TempDir = {
        let dir = TempDir::new().expect("failed to create temp log dir for tests");
        std::env::set_var("TASKD_LOG_DIR", dir.path());
        dir
    };
}

fn new_manager() -> (Arc<TaskManager>, Arc<RecordingNotifier>) {
    lazy_static::initialize(&TEST_LOG_DIR);
    let transport = Arc::new(NullTransport);
    let notifier = Arc::new(RecordingNotifier::default());
    (TaskManager::new(transport, notifier.clone()), notifier)
}

fn wait_for(manager: &TaskManager, id: u64, state: i32) {
    for _ in 0..200 {
        if manager.task(id).map(|s| s.state) == Some(state) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("task {id} never reached state {state}");
}

#[test]
fn p1_single_foreground_task_runs_to_completion() {
    let (manager, _notifier) = new_manager();
    let id = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "exit 0".into()],
        false,
    );
    assert!(id >= 0);
    wait_for(&manager, id as u64, TaskState::Done as i32);
}

#[test]
fn p2_second_foreground_task_waits_behind_the_first() {
    let (manager, _notifier) = new_manager();
    let first = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "sleep 0.2".into()],
        false,
    );
    let second = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "exit 0".into()],
        false,
    );
    assert_eq!(
        manager.task(second as u64).unwrap().state,
        TaskState::Created as i32
    );
    wait_for(&manager, first as u64, TaskState::Done as i32);
    wait_for(&manager, second as u64, TaskState::Done as i32);
}

#[test]
fn p3_background_tasks_do_not_queue_behind_foreground() {
    let (manager, _notifier) = new_manager();
    let fg = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "sleep 0.2".into()],
        false,
    );
    let bg = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "exit 0".into()],
        true,
    );
    wait_for(&manager, bg as u64, TaskState::Done as i32);
    // The foreground task is still running; the background one finished
    // independently of it.
    assert_ne!(
        manager.task(fg as u64).unwrap().state,
        TaskState::Done as i32
    );
    wait_for(&manager, fg as u64, TaskState::Done as i32);
}

#[test]
fn p4_cancel_all_stops_everything_and_joins() {
    let (manager, _notifier) = new_manager();
    manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "sleep 5".into()],
        false,
    );
    manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "sleep 5".into()],
        true,
    );
    manager.cancel_all(false);
    for snapshot in manager.tasks() {
        assert!(TaskState::Done as i32 == snapshot.state
            || TaskState::Fail as i32 == snapshot.state
            || TaskState::Cancel as i32 == snapshot.state);
    }
}

#[test]
fn p5_history_is_bounded_and_evicts_oldest_terminal_entry() {
    let (manager, _notifier) = new_manager();
    let bound = 50; // Config default; see config.rs DEFAULT_TASK_HISTORY_LENGTH.
    let mut last_id = -1;
    for _ in 0..(bound + 5) {
        last_id = manager.add_task(
            "/tmp".into(),
            vec!["sh".into(), "-c".into(), "exit 0".into()],
            true,
        );
        wait_for(&manager, last_id as u64, TaskState::Done as i32);
    }
    assert!(manager.tasks().len() <= bound);
    assert!(manager.task(0).is_none());
    assert!(manager.task(last_id as u64).is_some());
}

#[test]
fn p6_repeat_reruns_last_invocation_with_its_background_flag() {
    let (manager, _notifier) = new_manager();
    let first = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "exit 0".into()],
        true,
    );
    wait_for(&manager, first as u64, TaskState::Done as i32);
    let repeated = manager.repeat_task();
    assert!(repeated >= 0);
    let snapshot = manager.task(repeated as u64).unwrap();
    assert!(snapshot.cmdline.contains("exit 0"));
}

#[test]
fn p7_reset_requires_every_task_terminal_first() {
    let (manager, _notifier) = new_manager();
    manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "sleep 0.2".into()],
        false,
    );
    assert!(!manager.reset_task_ids());
    manager.cancel_all(true);
    assert!(manager.reset_task_ids());
    assert!(manager.tasks().is_empty());
    let id = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "exit 0".into()],
        false,
    );
    assert_eq!(id, 1);
}

#[test]
fn cancel_of_a_running_foreground_task_unblocks_the_queue() {
    let (manager, _notifier) = new_manager();
    let running = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "sleep 5".into()],
        false,
    );
    let queued = manager.add_task(
        "/tmp".into(),
        vec!["sh".into(), "-c".into(), "exit 0".into()],
        false,
    );
    wait_for(&manager, running as u64, TaskState::Running as i32);
    manager.cancel_task(running as u64);
    wait_for(&manager, running as u64, TaskState::Cancel as i32);
    wait_for(&manager, queued as u64, TaskState::Done as i32);
}
