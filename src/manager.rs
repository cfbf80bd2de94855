//! §4.3 `TaskManager`: the registry, the single-foreground-task rule, the
//! bounded history ring, and the dispatch of task state transitions to the
//! console, the IPC signal, and the scheduler.

use crate::config::{banner, Config};
use crate::error::TaskdError;
use crate::follower::FollowerTransport;
use crate::printer::LinePrinter;
use crate::task::{ManagerEvent, Task, TaskState};
use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Sink for the IPC `TaskStateChanged` signal. Implemented against a real
/// `zbus::Connection` in `ipc`; tests use a recording fake. Field order and
/// arity match spec.md §4.4 exactly:
/// `TaskStateChanged(new_state, task_id, task_pwd, task_cmd, duration)`.
pub trait StateChangeNotifier: Send + Sync {
    fn task_state_changed(&self, new_state: i32, task_id: u64, task_pwd: &str, task_cmd: &str, duration: i64);
}

/// One entry of `Tasks`/`Task` (§4.4): a point-in-time view, not a live
/// handle — callers that want live output must `FollowTask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: u64,
    pub state: i32,
    pub pwd: String,
    pub cmdline: String,
    pub returncode: i32,
    pub time: i64,
}

#[derive(Clone)]
struct LastInvocation {
    pwd: String,
    argv: Vec<String>,
    background: bool,
}

pub struct TaskManager {
    tasks: Mutex<Vec<Arc<Task>>>,
    next_id: Mutex<u64>,
    printer: Arc<LinePrinter>,
    transport: Arc<dyn FollowerTransport>,
    notifier: Arc<dyn StateChangeNotifier>,
    events_tx: Sender<ManagerEvent>,
    running_threads: Mutex<HashMap<u64, JoinHandle<()>>>,
    last_invocation: Mutex<Option<LastInvocation>>,
}

impl TaskManager {
    pub fn new(
        transport: Arc<dyn FollowerTransport>,
        notifier: Arc<dyn StateChangeNotifier>,
    ) -> Arc<TaskManager> {
        install_sigint_handler();

        let (events_tx, events_rx) = mpsc::channel();
        let manager = Arc::new(TaskManager {
            tasks: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
            printer: Arc::new(LinePrinter::new(false)),
            transport,
            notifier,
            events_tx,
            running_threads: Mutex::new(HashMap::new()),
            last_invocation: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        thread::Builder::new()
            .name("taskd-dispatch".into())
            .spawn(move || {
                for event in events_rx {
                    match weak.upgrade() {
                        Some(manager) => manager.handle_event(event),
                        None => break,
                    }
                }
            })
            .expect("failed to spawn dispatch thread");

        manager
    }

    fn find(&self, id: u64) -> Option<Arc<Task>> {
        self.tasks.lock().unwrap().iter().find(|t| t.id() == id).cloned()
    }

    fn handle_event(&self, event: ManagerEvent) {
        let ManagerEvent::StateChanged(id) = event;
        let Some(task) = self.find(id) else { return };

        match task.state() {
            TaskState::Starting => {
                self.printer.println(&task.state_pretty_str());
            }
            TaskState::Cancel => {
                self.print_terminal_banner(&task, Config::colorize(banner::CANCEL, "CANCEL"));
                if !task.background() {
                    self.run_next_foreground_task();
                }
            }
            TaskState::Done => {
                self.print_terminal_banner(&task, Config::colorize(banner::SUCCESS, "SUCCESS"));
                if !task.background() {
                    self.run_next_foreground_task();
                }
            }
            TaskState::Fail => {
                let suffix = Config::colorize(banner::FAIL, &format!("FAIL ({})", task.returncode()));
                self.print_terminal_banner(&task, suffix);
                if !task.background() {
                    self.run_next_foreground_task();
                }
            }
            TaskState::Created | TaskState::Running => {}
        }

        self.notify(&task);
    }

    fn print_terminal_banner(&self, task: &Arc<Task>, suffix: String) {
        self.printer.println(&format!("{} {}", task.state_pretty_str(), suffix));
    }

    fn notify(&self, task: &Arc<Task>) {
        self.notifier
            .task_state_changed(task.state() as i32, task.id(), task.pwd(), &task.cmdline(), task.time());
    }

    fn run_next_foreground_task(&self) {
        let next = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| !t.background() && t.state() == TaskState::Created)
            .cloned();
        if let Some(task) = next {
            self.spawn_task_thread(task);
        }
    }

    fn spawn_task_thread(&self, task: Arc<Task>) -> bool {
        let id = task.id();
        let cmdline = task.cmdline();
        match thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || task.run())
        {
            Ok(handle) => {
                self.running_threads.lock().unwrap().insert(id, handle);
                true
            }
            Err(source) => {
                log::error!("{}", TaskdError::ThreadSpawn { cmdline, source });
                false
            }
        }
    }

    /// §4.3 `add_task`. Returns the new task's id, or -1 if its thread
    /// failed to start — per SPEC_FULL.md, a thread-spawn failure is never
    /// inserted into history.
    ///
    /// The "is a foreground task already running?" check, the decision to
    /// start this one immediately, and its insertion into the registry all
    /// happen under one `tasks` lock acquisition (matching `server-sdk.py`'s
    /// `TaskManager.add_task`, which holds `_tasks_lock` across the same
    /// span) — otherwise two concurrent `add_task` calls could each see an
    /// empty/no-foreground-running registry and both start immediately,
    /// violating invariant I1.
    pub fn add_task(&self, pwd: String, argv: Vec<String>, background: bool) -> i32 {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };

        let task = Arc::new(Task::new(
            id,
            pwd.clone(),
            argv.clone(),
            background,
            self.events_tx.clone(),
            self.transport.clone(),
            self.printer.clone(),
        ));

        {
            let mut tasks = self.tasks.lock().unwrap();
            let should_start_now = background
                || !tasks.iter().any(|t| {
                    !t.background() && matches!(t.state(), TaskState::Starting | TaskState::Running)
                });
            if should_start_now && !self.spawn_task_thread(task.clone()) {
                return -1;
            }
            evict_oldest_terminal_if_full(&mut tasks);
            tasks.push(task.clone());
        }

        *self.last_invocation.lock().unwrap() = Some(LastInvocation { pwd, argv, background });
        self.notify(&task);
        id as i32
    }

    /// §4.3 `repeat_task`. -1 if no prior `add_task` was ever recorded.
    pub fn repeat_task(&self) -> i32 {
        let last = self.last_invocation.lock().unwrap().clone();
        match last {
            Some(inv) => self.add_task(inv.pwd, inv.argv, inv.background),
            None => -1,
        }
    }

    pub fn cancel_task(&self, id: u64) {
        if let Some(task) = self.find(id) {
            task.cancel();
        }
    }

    /// §4.3 `cancel_all`. Joins every thread we hold a handle for — a
    /// terminal task's thread has already returned by the time its
    /// `StateChanged` event was dispatched, so this never blocks longer
    /// than it takes the still-running foreground task to unwind.
    pub fn cancel_all(&self, clear_history: bool) {
        let snapshot = self.tasks.lock().unwrap().clone();
        for task in &snapshot {
            if !task.state().is_terminal() {
                task.cancel();
            }
        }

        let handles: Vec<_> = self.running_threads.lock().unwrap().drain().collect();
        for (_, handle) in handles {
            let _ = handle.join();
        }

        if clear_history {
            self.tasks.lock().unwrap().clear();
        }
    }

    /// §4.3 `reset_task_ids`. Only succeeds when no task is non-terminal.
    pub fn reset_task_ids(&self) -> bool {
        if self.tasks.lock().unwrap().iter().any(|t| !t.state().is_terminal()) {
            return false;
        }
        *self.next_id.lock().unwrap() = 1;
        true
    }

    pub fn task(&self, id: u64) -> Option<TaskSnapshot> {
        self.find(id).as_ref().map(snapshot)
    }

    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.tasks.lock().unwrap().iter().map(snapshot).collect()
    }

    pub fn follow_task(&self, id: u64, bus_name: String) -> bool {
        match self.find(id) {
            Some(task) => {
                task.register_follower(bus_name);
                true
            }
            None => false,
        }
    }

    pub fn unfollow_task(&self, id: u64, bus_name: &str) {
        if let Some(task) = self.find(id) {
            task.unregister_follower(bus_name);
        }
    }

    pub fn task_log(&self, id: u64) -> (bool, String) {
        match self.find(id) {
            Some(task) => (true, task.log()),
            None => (false, String::new()),
        }
    }

    pub fn set_debug(&self, enabled: bool) {
        self.printer.set_debug(enabled);
    }

    /// §4.4 `Quit`: cancel every non-terminal task and let the console
    /// drain flush. Stopping the IPC event loop itself is the binary's job.
    pub fn quit(&self) {
        self.cancel_all(false);
        self.printer.done();
    }
}

fn snapshot(task: &Arc<Task>) -> TaskSnapshot {
    TaskSnapshot {
        id: task.id(),
        state: task.state() as i32,
        pwd: task.pwd().to_string(),
        cmdline: task.cmdline(),
        returncode: task.returncode(),
        time: task.time(),
    }
}

fn evict_oldest_terminal_if_full(tasks: &mut Vec<Arc<Task>>) {
    if tasks.len() < Config::get().task_history_length {
        return;
    }
    if let Some(idx) = tasks.iter().position(|t| t.state().is_terminal()) {
        tasks.remove(idx);
    }
}

/// §4.3 "SIGINT": ignored at the server process so Ctrl-C at the
/// controlling terminal isn't fatal here, but still reaches any foreground
/// child sharing that terminal's process group.
fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}
