//! Per-task set of live subscribers (§4.2 `register_follower` /
//! `unregister_follower`, §4.2.1, invariant I4). A follower is identified
//! only by its bus name; the actual `Write`/`Quit` calls are delegated to
//! a [`FollowerTransport`] so the state machine in `task.rs` doesn't need
//! to know anything about the IPC binding.

use std::sync::Arc;

/// The reverse interface a follower implements (§4.4 "Follower contract").
/// Implemented against the real session bus in `ipc`; a recording fake is
/// used in tests.
pub trait FollowerTransport: Send + Sync {
    fn write(&self, bus_name: &str, line: &str);
    fn quit(&self, bus_name: &str, returncode: i32);
}

#[derive(Default)]
pub struct FollowerSet {
    names: Vec<String>,
}

impl FollowerSet {
    pub fn new() -> FollowerSet {
        FollowerSet { names: Vec::new() }
    }

    pub fn add(&mut self, bus_name: String) {
        if !self.names.contains(&bus_name) {
            self.names.push(bus_name);
        }
    }

    pub fn remove(&mut self, bus_name: &str) {
        self.names.retain(|n| n != bus_name);
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// §4.2.1: deliver one line to every follower. A delivery failure is
    /// swallowed by the transport and the follower is left registered —
    /// the registrar unregisters it later, we never guess.
    pub fn broadcast_line(&self, transport: &Arc<dyn FollowerTransport>, line: &str) {
        for name in &self.names {
            transport.write(name, line);
        }
    }

    /// §4.2 step 7: notify every follower with the terminal return code
    /// and clear the set.
    pub fn broadcast_quit_and_clear(&mut self, transport: &Arc<dyn FollowerTransport>, returncode: i32) {
        for name in &self.names {
            transport.quit(name, returncode);
        }
        self.names.clear();
    }
}

#[cfg(test)]
pub mod test_support {
    use super::FollowerTransport;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Write(String, String),
        Quit(String, i32),
    }

    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<Call>>,
    }

    impl FollowerTransport for RecordingTransport {
        fn write(&self, bus_name: &str, line: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Write(bus_name.to_string(), line.to_string()));
        }

        fn quit(&self, bus_name: &str, returncode: i32) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Quit(bus_name.to_string(), returncode));
        }
    }
}
