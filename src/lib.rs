//! Per-user background task server: runs shell commands as tracked
//! [`Task`](task::Task)s, mutually excludes foreground tasks, and exposes
//! the whole thing over the session bus (`ipc`).

pub mod config;
pub mod error;
pub mod follower;
pub mod ipc;
pub mod logstore;
pub mod manager;
pub mod printer;
pub mod task;

pub use error::{Result, TaskdError};
pub use manager::TaskManager;
