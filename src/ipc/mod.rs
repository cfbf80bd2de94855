//! §4.4 "IPC Service": the session-bus surface over [`TaskManager`], plus
//! the production [`FollowerTransport`]/[`StateChangeNotifier`]
//! implementations that call back out over the same bus.
//!
//! `TaskManager`/`Task` are plain OS-thread-and-mutex code with no async
//! awareness (§4 "concurrency: one writer thread per running task"); zbus's
//! object server, on the other hand, only dispatches async methods. The
//! glue here is a stored `tokio::runtime::Handle`: callbacks arriving on a
//! task's own thread or the manager's dispatch thread `block_on` the
//! handful of async zbus calls they need to make.

use crate::config::{FOLLOWER_INTERFACE, FOLLOWER_PATH, SERVICE_PATH};
use crate::follower::FollowerTransport;
use crate::manager::{StateChangeNotifier, TaskManager, TaskSnapshot};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use zbus::{Connection, SignalContext};

fn to_tuple(snapshot: &TaskSnapshot) -> (i32, i32, String, String, i32, i64) {
    (
        snapshot.id as i32,
        snapshot.state,
        snapshot.pwd.clone(),
        snapshot.cmdline.clone(),
        snapshot.returncode,
        snapshot.time,
    )
}

fn missing_task_tuple() -> (i32, i32, String, String, i32, i64) {
    (-1, -1, String::new(), String::new(), -1, -1)
}

/// The object served at [`crate::config::SERVICE_PATH`]. One instance per
/// process; `manager` is the only state it actually owns.
pub struct Service {
    manager: Arc<TaskManager>,
    shutdown: Arc<Notify>,
}

impl Service {
    pub fn new(manager: Arc<TaskManager>, shutdown: Arc<Notify>) -> Service {
        Service { manager, shutdown }
    }
}

#[zbus::interface(name = "org.sailfish.sdkrun")]
impl Service {
    async fn tasks(&self) -> Vec<(i32, i32, String, String, i32, i64)> {
        self.manager.tasks().iter().map(to_tuple).collect()
    }

    async fn task(&self, id: i32) -> (i32, i32, String, String, i32, i64) {
        match self.manager.task(id as u64) {
            Some(snapshot) => to_tuple(&snapshot),
            None => missing_task_tuple(),
        }
    }

    #[zbus(name = "AddTask")]
    async fn add_task(&self, pwd: String, argv: Vec<String>, background: bool) -> i32 {
        self.manager.add_task(pwd, argv, background)
    }

    #[zbus(name = "Repeat")]
    async fn repeat(&self) -> i32 {
        self.manager.repeat_task()
    }

    #[zbus(name = "CancelTask")]
    async fn cancel_task(&self, id: i32) {
        self.manager.cancel_task(id as u64);
    }

    #[zbus(name = "CancelAll")]
    async fn cancel_all(&self) {
        let manager = self.manager.clone();
        // cancel_all() joins a killed foreground task's thread; never block
        // the zbus dispatch executor on that.
        let _ = tokio::task::spawn_blocking(move || manager.cancel_all(false)).await;
    }

    #[zbus(name = "Reset")]
    async fn reset(&self, #[zbus(signal_context)] ctxt: SignalContext<'_>) -> zbus::fdo::Result<()> {
        let manager = self.manager.clone();
        let _ = tokio::task::spawn_blocking(move || {
            manager.cancel_all(true);
            manager.reset_task_ids();
        })
        .await;
        Self::task_state_changed(&ctxt, 4, 0, String::new(), String::new(), 0).await?;
        Ok(())
    }

    #[zbus(name = "FollowTask")]
    async fn follow_task(&self, id: i32, bus_name: String) -> bool {
        self.manager.follow_task(id as u64, bus_name)
    }

    #[zbus(name = "UnfollowTask")]
    async fn unfollow_task(&self, id: i32, bus_name: String) {
        self.manager.unfollow_task(id as u64, &bus_name);
    }

    #[zbus(name = "Log")]
    async fn log(&self, id: i32) -> (bool, String) {
        self.manager.task_log(id as u64)
    }

    async fn quit(&self) {
        let manager = self.manager.clone();
        let _ = tokio::task::spawn_blocking(move || manager.quit()).await;
        self.shutdown.notify_one();
    }

    async fn debug(&self, enabled: bool) {
        self.manager.set_debug(enabled);
    }

    /// Field order and arity match spec.md §4.4 exactly: `TaskStateChanged(new_state, task_id, task_pwd, task_cmd, duration)`.
    #[zbus(signal)]
    async fn task_state_changed(
        ctxt: &SignalContext<'_>,
        new_state: i32,
        task_id: i32,
        task_pwd: String,
        task_cmd: String,
        duration: i64,
    ) -> zbus::Result<()>;
}

/// Fires `TaskStateChanged` for every ordinary task transition (the `Reset`
/// synthetic signal is emitted directly by the `Reset` method above, which
/// already has a `SignalContext` to hand).
pub struct ZbusNotifier {
    connection: Connection,
    runtime: Handle,
}

impl ZbusNotifier {
    pub fn new(connection: Connection, runtime: Handle) -> ZbusNotifier {
        ZbusNotifier { connection, runtime }
    }
}

impl StateChangeNotifier for ZbusNotifier {
    fn task_state_changed(&self, new_state: i32, task_id: u64, task_pwd: &str, task_cmd: &str, duration: i64) {
        let connection = self.connection.clone();
        let task_pwd = task_pwd.to_string();
        let task_cmd = task_cmd.to_string();
        self.runtime.block_on(async move {
            let ctxt = match SignalContext::new(&connection, SERVICE_PATH) {
                Ok(ctxt) => ctxt,
                Err(err) => {
                    log::warn!("failed to build signal context: {err}");
                    return;
                }
            };
            if let Err(err) =
                Service::task_state_changed(&ctxt, new_state, task_id as i32, task_pwd, task_cmd, duration).await
            {
                log::warn!("failed to emit TaskStateChanged: {err}");
            }
        });
    }
}

/// Delivers `Write`/`Quit` to a follower by calling back into its bus name
/// at the fixed `org.sailfish.sdk.client` interface/path (§4.4 "Follower
/// contract"). A delivery failure is swallowed, per §4.2.1 — the follower
/// may simply have gone away.
pub struct ZbusFollowerTransport {
    connection: Connection,
    runtime: Handle,
}

impl ZbusFollowerTransport {
    pub fn new(connection: Connection, runtime: Handle) -> ZbusFollowerTransport {
        ZbusFollowerTransport { connection, runtime }
    }

    async fn call(&self, bus_name: &str, method: &str, body: impl zbus::zvariant::DynamicType + serde::Serialize) {
        let proxy = match zbus::Proxy::new(&self.connection, bus_name.to_string(), FOLLOWER_PATH, FOLLOWER_INTERFACE).await {
            Ok(proxy) => proxy,
            Err(err) => {
                log::warn!("follower {bus_name} unreachable: {err}");
                return;
            }
        };
        if let Err(err) = proxy.call_method(method, &body).await {
            log::warn!("follower {bus_name} rejected {method}: {err}");
        }
    }
}

impl FollowerTransport for ZbusFollowerTransport {
    fn write(&self, bus_name: &str, line: &str) {
        let bus_name = bus_name.to_string();
        let line = line.to_string();
        self.runtime
            .block_on(async move { self.call(&bus_name, "Write", (line,)).await });
    }

    fn quit(&self, bus_name: &str, returncode: i32) {
        let bus_name = bus_name.to_string();
        self.runtime
            .block_on(async move { self.call(&bus_name, "Quit", (returncode,)).await });
    }
}
