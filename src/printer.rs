//! Single-consumer console drain (§4.1 `LinePrinter`). Every console write
//! in the process goes through here so that output from concurrent task
//! threads never interleaves mid-line.

use crate::config::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;

enum Msg {
    Line(String),
    Done,
}

#[derive(Default)]
struct Window {
    lines: usize,
    errors: Vec<String>,
}

pub struct LinePrinter {
    tx: Sender<Msg>,
    handle: Mutex<Option<JoinHandle<()>>>,
    window: Mutex<Window>,
    debug_enabled: AtomicBool,
}

impl LinePrinter {
    pub fn new(debug: bool) -> LinePrinter {
        let (tx, rx) = mpsc::channel::<Msg>();
        let handle = std::thread::Builder::new()
            .name("taskd-printer".into())
            .spawn(move || {
                use std::io::Write;
                let mut stdout = std::io::stdout();
                for msg in rx {
                    match msg {
                        Msg::Line(line) => {
                            let _ = stdout.write_all(line.as_bytes());
                            let _ = stdout.flush();
                        }
                        Msg::Done => break,
                    }
                }
            })
            .expect("failed to spawn printer drain thread");

        LinePrinter {
            tx,
            handle: Mutex::new(Some(handle)),
            window: Mutex::new(Window::default()),
            debug_enabled: AtomicBool::new(debug),
        }
    }

    fn enqueue(&self, line: String) {
        // The consumer may already be gone (after `done()`); a broken
        // stdout, or a printer that's shutting down, is never fatal here.
        let _ = self.tx.send(Msg::Line(line));
    }

    /// Classify one line of task output, colorize it if a rule matched,
    /// and enqueue it for the console. Remembers error lines for `end()`.
    pub fn process(&self, line: &str) {
        let cfg = Config::get();
        let mut printed = None;
        for rule in &cfg.classify_rules {
            if rule.regex.is_match(line) {
                printed = Some((Config::colorize(rule.color, line), rule.is_error));
                break;
            }
        }

        let (out, is_error) = printed.unwrap_or_else(|| (line.to_string(), false));
        self.enqueue(out);

        let mut window = self.window.lock().unwrap();
        window.lines += 1;
        if is_error {
            window.errors.push(line.to_string());
        }
    }

    /// Zero the per-task-window counters. Called at the `STARTING` transition.
    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap();
        window.lines = 0;
        window.errors.clear();
    }

    /// If the task emitted more than `min_lines_for_error` lines and at
    /// least one was classified as an error, replay every collected error
    /// line as a red "error tail" before resetting the window.
    pub fn end(&self) {
        let cfg = Config::get();
        let mut window = self.window.lock().unwrap();
        if !window.errors.is_empty() && window.lines > cfg.min_lines_for_error {
            for line in &window.errors {
                self.enqueue(Config::colorize(crate::config::banner::FAIL, line));
            }
        }
        window.lines = 0;
        window.errors.clear();
    }

    pub fn println(&self, line: &str) {
        self.enqueue(format!("{line}\n"));
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn debug(&self, line: &str) {
        if self.debug_enabled() {
            self.println(&format!("DEBUG: {line}"));
        }
    }

    /// Signal the consumer to stop after draining whatever is already
    /// queued, and join it. Idempotent.
    pub fn done(&self) {
        let _ = self.tx.send(Msg::Done);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinePrinter {
    fn drop(&mut self) {
        self.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_tail_replayed_only_past_threshold() {
        let printer = LinePrinter::new(false);
        for _ in 0..5 {
            printer.process("just some build output");
        }
        printer.process("foo.c:10:2: error: bad thing");
        printer.end();
        let window = printer.window.lock().unwrap();
        assert_eq!(window.lines, 0, "end() always resets the window");

        let printer = LinePrinter::new(false);
        for i in 0..25 {
            if i == 24 {
                printer.process("foo.c:10:2: error: bad thing");
            } else {
                printer.process("line");
            }
        }
        assert_eq!(printer.window.lock().unwrap().errors.len(), 1);
    }

    #[test]
    fn warning_lines_are_not_errors() {
        let printer = LinePrinter::new(false);
        printer.process("foo.c:1:1: warning: unused variable");
        assert!(printer.window.lock().unwrap().errors.is_empty());
        assert_eq!(printer.window.lock().unwrap().lines, 1);
    }

    #[test]
    fn debug_suppressed_unless_enabled() {
        let printer = LinePrinter::new(false);
        assert!(!printer.debug_enabled());
        printer.set_debug(true);
        assert!(printer.debug_enabled());
    }
}
