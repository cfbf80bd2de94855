//! One shell subprocess plus the thread that reads its merged output
//! stream (§4.2). Owns the state machine, the captured log, the follower
//! list and the per-task log file.

use crate::config::{banner, Config};
use crate::error::TaskdError;
use crate::follower::{FollowerSet, FollowerTransport};
use crate::logstore::LogFile;
use crate::printer::LinePrinter;
use std::io::{BufRead, BufReader};
use std::os::unix::io::FromRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// §3 "Task state machine". Numeric values match the IPC wire values the
/// original assigned them (`sdk.py`'s `STATE_*` constants), since clients
/// switch on these integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TaskState {
    Created = 0,
    Starting = 1,
    Cancel = 2,
    Running = 3,
    Done = 4,
    Fail = 5,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Fail | TaskState::Cancel)
    }
}

/// Events a [`Task`] reports to its owning manager. Carrying only the task
/// id (rather than a back-reference to the `Task` itself) keeps `Task` from
/// needing a self-pointer: the manager already holds every task behind its
/// own registry lock and looks the id up there. This is the "manager-side
/// handler queue" the design notes in spec.md §9 call for, in place of the
/// original's `lock=False` re-entrancy parameter. Per-line fan-out (§4.2.1)
/// is not an event: `Task` holds the printer directly and drives it inline,
/// the same as the in-memory buffer, the log file and the follower set.
pub enum ManagerEvent {
    StateChanged(u64),
}

struct Inner {
    state: TaskState,
    child: Option<Child>,
    /// Set by `cancel()` while `RUNNING`; consulted by the task thread at
    /// EOF to decide whether the terminal state is `CANCEL` rather than
    /// whatever the exit code would otherwise imply. This is what makes
    /// CANCEL sticky (spec.md §9 resolves the source's ambiguity this way)
    /// while keeping every state transition on the task's own thread.
    cancel_requested: bool,
    /// Set whenever `cancel()` observes `STARTING`, where there is no child
    /// yet to kill: "kill this the moment it exists" without promising the
    /// `CANCEL` terminal state, since spec.md's state diagram has a kill
    /// delivered before the process is actually running fall through to
    /// `FAIL` via its exit code rather than `CANCEL`.
    kill_pending: bool,
    returncode: i32,
    start: Option<Instant>,
    start_epoch: i64,
    duration: Duration,
    output: Vec<String>,
    followers: FollowerSet,
    log_file: Option<LogFile>,
}

pub struct Task {
    id: u64,
    pwd: String,
    argv: Vec<String>,
    background: bool,
    events: Sender<ManagerEvent>,
    transport: Arc<dyn FollowerTransport>,
    printer: Arc<LinePrinter>,
    inner: Mutex<Inner>,
}

impl Task {
    pub fn new(
        id: u64,
        pwd: String,
        argv: Vec<String>,
        background: bool,
        events: Sender<ManagerEvent>,
        transport: Arc<dyn FollowerTransport>,
        printer: Arc<LinePrinter>,
    ) -> Task {
        Task {
            id,
            pwd,
            argv,
            background,
            events,
            transport,
            printer,
            inner: Mutex::new(Inner {
                state: TaskState::Created,
                child: None,
                cancel_requested: false,
                kill_pending: false,
                returncode: -1,
                start: None,
                start_epoch: 0,
                duration: Duration::ZERO,
                output: Vec::new(),
                followers: FollowerSet::new(),
                log_file: None,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pwd(&self) -> &str {
        &self.pwd
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn cmdline(&self) -> String {
        self.argv.join(" ")
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    pub fn returncode(&self) -> i32 {
        self.inner.lock().unwrap().returncode
    }

    /// Wall-clock seconds since start for a non-terminal task, total
    /// duration once terminal, 0 if the task never started.
    pub fn time(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            inner.duration.as_secs() as i64
        } else if let Some(start) = inner.start {
            start.elapsed().as_secs() as i64
        } else {
            0
        }
    }

    pub fn log(&self) -> String {
        self.inner.lock().unwrap().output.concat()
    }

    /// The colorized one-line console banner printed on `STARTING` and
    /// appended to on every terminal transition.
    pub fn state_pretty_str(&self) -> String {
        let mut s = format!(
            "{y}({id:>3}){reset} [{g}{pwd}{reset}] {cmd}",
            y = banner::STATE_ID,
            reset = banner::RESET_SEQ,
            id = self.id,
            g = banner::STATE_PWD,
            pwd = self.pwd,
            cmd = self.cmdline(),
        );
        if !matches!(self.state(), TaskState::Created | TaskState::Starting) {
            let secs = self.time();
            let h = secs / 3600;
            let m = (secs % 3600) / 60;
            let sec = secs % 60;
            s.push_str(&format!(" ({h:02}:{m:02}:{sec:02})"));
        }
        s
    }

    /// §4.2 `register_follower`: add the follower if the task hasn't
    /// finished; otherwise it only ever gets a terminal `Quit`, never any
    /// lines (invariant I4).
    pub fn register_follower(&self, bus_name: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            let returncode = inner.returncode;
            drop(inner);
            self.transport.quit(&bus_name, returncode);
        } else {
            inner.followers.add(bus_name);
        }
    }

    pub fn unregister_follower(&self, bus_name: &str) {
        self.inner.lock().unwrap().followers.remove(bus_name);
    }

    /// §4.2 `cancel()`: idempotent, synchronous with respect to delivering
    /// the kill, asynchronous with respect to the `CANCEL` transition
    /// (which the task thread performs at EOF — see `Inner::cancel_requested`).
    /// A never-started task has no thread to defer to, so it is
    /// transitioned here directly (spec.md §9 open question).
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            TaskState::Created => {
                inner.state = TaskState::Cancel;
                drop(inner);
                let _ = self.events.send(ManagerEvent::StateChanged(self.id));
            }
            TaskState::Starting => {
                // No child exists yet; the moment `run()` spawns one it must
                // be killed immediately, but that kill lands before the task
                // ever reaches RUNNING, so the terminal state is whatever the
                // exit code says (ordinarily FAIL), not CANCEL.
                inner.kill_pending = true;
            }
            TaskState::Running => {
                if let Some(child) = inner.child.as_mut() {
                    let _ = child.kill();
                }
                inner.cancel_requested = true;
            }
            TaskState::Cancel | TaskState::Done | TaskState::Fail => {}
        }
    }

    fn set_state(&self, state: TaskState) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != state {
            inner.state = state;
            drop(inner);
            let _ = self.events.send(ManagerEvent::StateChanged(self.id));
        }
    }

    /// §4.2 execution algorithm. Runs exactly once; a no-op if the task
    /// isn't `CREATED`.
    pub fn run(&self) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != TaskState::Created {
                return;
            }
        }

        let start = Instant::now();
        let start_epoch = chrono::Utc::now().timestamp();

        let log_file = if Config::get().build_logs_enabled {
            match LogFile::create(start_epoch, &self.pwd, &self.cmdline()) {
                Ok(f) => Some(f),
                Err(err) => {
                    log::warn!("{}", err);
                    None
                }
            }
        } else {
            None
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.start = Some(start);
            inner.start_epoch = start_epoch;
            inner.log_file = log_file;
            inner.state = TaskState::Starting;
        }
        self.printer.reset();
        let _ = self.events.send(ManagerEvent::StateChanged(self.id));

        let (read_end, stdout_stdio, stderr_stdio) = match merged_output_pipe() {
            Ok(pipes) => pipes,
            Err(err) => {
                log::error!("failed to create output pipe for task {}: {}", self.id, err);
                self.set_state(TaskState::Fail);
                return;
            }
        };

        let spawn_result = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .current_dir(&self.pwd)
            .stdin(Stdio::null())
            .stdout(stdout_stdio)
            .stderr(stderr_stdio)
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(source) => {
                log::error!(
                    "{}",
                    TaskdError::Spawn {
                        cmdline: self.cmdline(),
                        source,
                    }
                );
                self.set_state(TaskState::Fail);
                return;
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            // cancel() may have already fired while we were still spawning.
            if inner.kill_pending {
                let _ = child.kill();
            }
            inner.child = Some(child);
            inner.state = TaskState::Running;
        }
        let _ = self.events.send(ManagerEvent::StateChanged(self.id));

        let mut reader = BufReader::new(read_end);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_line_lossy(&mut reader, &mut buf) {
                Some(line) => self.on_output_line(&line),
                None => break,
            }
        }

        let exit_status = {
            let mut inner = self.inner.lock().unwrap();
            let status = inner
                .child
                .as_mut()
                .and_then(|c| c.wait().ok());
            inner.child = None;
            status
        };

        let returncode = exit_status
            .map(|status| status.code().unwrap_or_else(|| -status.signal().unwrap_or(0)))
            .unwrap_or(-1);

        let duration = start.elapsed();

        let final_state = {
            let mut inner = self.inner.lock().unwrap();
            inner.returncode = returncode;
            inner.duration = duration;
            inner.log_file = None;
            if inner.cancel_requested {
                TaskState::Cancel
            } else if returncode == 0 {
                TaskState::Done
            } else {
                TaskState::Fail
            }
        };
        self.set_state(final_state);
        // §4.1 `end()`: only a FAIL replays the collected error tail — DONE
        // and CANCEL never did, in the original this is the one case the
        // caller passes `last=True`.
        if final_state == TaskState::Fail {
            self.printer.end();
        }

        let mut inner = self.inner.lock().unwrap();
        inner.followers.broadcast_quit_and_clear(&self.transport, returncode);
    }

    /// §4.2.1 output fan-out, in order: buffer, log file, followers, printer.
    fn on_output_line(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.output.push(line.to_string());
        if let Some(log_file) = inner.log_file.as_mut() {
            log_file.write_line(line);
        }
        inner.followers.broadcast_line(&self.transport, line);
        self.printer.process(line);
    }
}

/// Reads one line (including its trailing `\n`, if any) from `reader`,
/// decoding undecodable bytes with lossy UTF-8 replacement per spec.md
/// §4.2 step 4. Returns `None` at EOF.
fn read_line_lossy<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String> {
    match reader.read_until(b'\n', buf) {
        Ok(0) => None,
        Ok(_) => Some(String::from_utf8_lossy(buf).into_owned()),
        Err(_) => None,
    }
}

/// Creates a single OS pipe and wires its write end to both stdout and
/// stderr `Stdio` handles, so the child's two streams land in one
/// kernel-ordered buffer exactly like Python's `stderr=subprocess.STDOUT`.
/// `std::process::Command` has no direct equivalent, so we build the pipe
/// ourselves with `libc::pipe` + `dup`.
fn merged_output_pipe() -> std::io::Result<(std::fs::File, Stdio, Stdio)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let dup_fd = unsafe { libc::dup(write_fd) };
    if dup_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let stdout_stdio = unsafe { Stdio::from_raw_fd(write_fd) };
    let stderr_stdio = unsafe { Stdio::from_raw_fd(dup_fd) };
    Ok((read_file, stdout_stdio, stderr_stdio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follower::test_support::RecordingTransport;
    use std::sync::mpsc;

    fn new_task(argv: Vec<&str>, background: bool) -> (Task, mpsc::Receiver<ManagerEvent>) {
        crate::config::test_support::ensure_test_log_dir();
        let (tx, rx) = mpsc::channel();
        let transport = Arc::new(RecordingTransport::default());
        let printer = Arc::new(LinePrinter::new(false));
        let task = Task::new(
            1,
            "/tmp".into(),
            argv.into_iter().map(String::from).collect(),
            background,
            tx,
            transport,
            printer,
        );
        (task, rx)
    }

    #[test]
    fn successful_command_reaches_done_with_captured_log() {
        let (task, rx) = new_task(vec!["sh", "-c", "echo hi; exit 0"], false);
        task.run();
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.returncode(), 0);
        assert_eq!(task.log(), "hi\n");

        let mut state_changes = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ManagerEvent::StateChanged(id) => {
                    assert_eq!(id, 1);
                    state_changes += 1;
                }
            }
        }
        // STARTING, RUNNING, DONE.
        assert_eq!(state_changes, 3);
    }

    #[test]
    fn failing_command_reaches_fail_with_exit_code() {
        let (task, _rx) = new_task(vec!["sh", "-c", "exit 7"], false);
        task.run();
        assert_eq!(task.state(), TaskState::Fail);
        assert_eq!(task.returncode(), 7);
    }

    #[test]
    fn spawn_failure_reaches_fail() {
        let (task, _rx) = new_task(vec!["/no/such/executable-taskd-test"], false);
        task.run();
        assert_eq!(task.state(), TaskState::Fail);
    }

    #[test]
    fn run_is_noop_unless_created() {
        let (task, _rx) = new_task(vec!["sh", "-c", "exit 0"], false);
        task.run();
        let log_before = task.log();
        task.run(); // already Done, must refuse
        assert_eq!(task.log(), log_before);
    }

    #[test]
    fn cancel_of_created_task_is_direct_and_synchronous() {
        // Never starts a subprocess, so no log file is ever opened; no need
        // for ensure_test_log_dir() here.
        let (task, rx) = new_task(vec!["sh", "-c", "exit 0"], false);
        task.cancel();
        assert_eq!(task.state(), TaskState::Cancel);
        assert!(matches!(rx.try_recv(), Ok(ManagerEvent::StateChanged(1))));
    }

    #[test]
    fn cancel_of_running_task_is_sticky_even_on_zero_exit() {
        let (task, _rx) = new_task(vec!["sh", "-c", "sleep 5; exit 0"], false);
        let task = Arc::new(task);
        let runner = {
            let task = task.clone();
            std::thread::spawn(move || task.run())
        };
        // Give the process a moment to actually start.
        while task.state() == TaskState::Created {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(50));
        task.cancel();
        runner.join().unwrap();
        assert_eq!(task.state(), TaskState::Cancel);
    }

    #[test]
    fn follower_registered_after_terminal_gets_only_quit() {
        crate::config::test_support::ensure_test_log_dir();
        let recorder = Arc::new(RecordingTransport::default());
        let printer = Arc::new(LinePrinter::new(false));
        let task = Task::new(
            2,
            "/tmp".into(),
            vec!["sh".into(), "-c".into(), "echo hi".into()],
            false,
            mpsc::channel().0,
            recorder.clone(),
            printer,
        );
        task.run();
        task.register_follower("late-follower".into());
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
    }
}
