//! Server-wide constants, modeled on the teacher's `flags.rs`:
//! a `lazy_static!` global built once from defaults with environment
//! overrides, plus an accessor returning a `'static` reference.

use regex::Regex;
use std::env;
use std::path::PathBuf;

pub const SERVICE_NAME: &str = "org.sailfish.sdkrun";
pub const SERVICE_PATH: &str = "/org/sailfish/sdkrun";

pub const FOLLOWER_INTERFACE: &str = "org.sailfish.sdk.client";
pub const FOLLOWER_PATH: &str = "/org/sailfish/sdk/client";

const DEFAULT_TASK_HISTORY_LENGTH: usize = 50;
const DEFAULT_MIN_LINES_FOR_ERROR: usize = 20;
const DEFAULT_BUILD_LOGS_PATH: &str = ".build_logs";

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const GREEN: &str = "\x1b[32m";
const BLUE: &str = "\x1b[94m";
const RESET: &str = "\x1b[39m";

/// One entry of the printer's classification table: a compiled regex,
/// whether a match is an error line, and the color to wrap it in.
pub struct ClassifyRule {
    pub regex: Regex,
    pub is_error: bool,
    pub color: &'static str,
}

pub struct Config {
    pub task_history_length: usize,
    pub min_lines_for_error: usize,
    pub build_logs_enabled: bool,
    pub build_logs_path: PathBuf,
    pub classify_rules: Vec<ClassifyRule>,
}

impl Config {
    pub fn get() -> &'static Config {
        &CONFIG
    }

    pub fn colorize(color: &str, line: &str) -> String {
        format!("{color}{line}{RESET}")
    }
}

fn load_config() -> Config {
    let task_history_length = env::var("TASKD_HISTORY_LENGTH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TASK_HISTORY_LENGTH);

    let min_lines_for_error = env::var("TASKD_MIN_LINES_FOR_ERROR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MIN_LINES_FOR_ERROR);

    let build_logs_enabled = env::var("TASKD_BUILD_LOGS")
        .ok()
        .and_then(|v| match v.as_str() {
            "0" | "false" => Some(false),
            "1" | "true" => Some(true),
            _ => None,
        })
        .unwrap_or(true);

    let build_logs_path = env::var("TASKD_LOG_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DEFAULT_BUILD_LOGS_PATH)
        });

    // Matched in order, first hit wins; unmatched lines pass through uncolored.
    let classify_rules = vec![
        ClassifyRule {
            regex: Regex::new(r"^.*:\d+:\d+: error:").unwrap(),
            is_error: true,
            color: RED,
        },
        ClassifyRule {
            regex: Regex::new(r"^.*:\d+:\d+: fatal error:").unwrap(),
            is_error: true,
            color: RED,
        },
        ClassifyRule {
            regex: Regex::new(r"^.*No rule to make target.*Stop\.").unwrap(),
            is_error: true,
            color: RED,
        },
        ClassifyRule {
            regex: Regex::new(r"^.*:\d+: error:").unwrap(),
            is_error: true,
            color: RED,
        },
        ClassifyRule {
            regex: Regex::new(r"^.*:\d+:\d+: warning:").unwrap(),
            is_error: false,
            color: YELLOW,
        },
    ];

    Config {
        task_history_length,
        min_lines_for_error,
        build_logs_enabled,
        build_logs_path,
        classify_rules,
    }
}

lazy_static::lazy_static! {
    static ref CONFIG: Config = load_config();
}


/// Colors used for the manager's state-change banners (§"Colorized terminal
/// summary lines" in SPEC_FULL.md); kept separate from the printer's
/// classification colors above since they decorate whole summary lines,
/// not classified build output.
pub mod banner {
    use super::{BLUE, GREEN, RED, RESET, YELLOW};

    pub const STATE_ID: &str = YELLOW;
    pub const STATE_PWD: &str = GREEN;
    pub const RUNNING: &str = BLUE;
    pub const SUCCESS: &str = GREEN;
    pub const CANCEL: &str = YELLOW;
    pub const FAIL: &str = RED;
    pub const RESET_SEQ: &str = RESET;
}
