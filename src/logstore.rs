//! Filesystem sink for per-task logs (§3 "Log store entries", §6
//! "Persisted state"). Files live under `Config::get().build_logs_path`,
//! named `{startEpochSeconds}-{slug}.log`.

use crate::config::Config;
use crate::error::{Result, TaskdError};
use regex::Regex;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

const MAX_SLUG_LEN: usize = 160;

/// ASCII-normalized, lower-cased slug of `{pwd}-{cmdline}`: non-word
/// characters become `_`, runs of whitespace/dashes collapse to a single
/// `-`, truncated to 160 characters. Mirrors the original's
/// `unicodedata.normalize('NFKD', ...).encode('ascii', 'ignore')` followed
/// by `re.sub` — non-ASCII characters are dropped rather than
/// transliterated, which is what `encode('ascii', 'ignore')` does.
pub fn slugify(pwd: &str, cmdline: &str) -> String {
    lazy_static::lazy_static! {
        static ref NON_WORD: Regex = Regex::new(r"[^\w\s-]").unwrap();
        static ref COLLAPSE: Regex = Regex::new(r"[-\s]+").unwrap();
    }

    let raw = format!("{pwd}-{cmdline}");
    let ascii: String = raw.chars().filter(|c| c.is_ascii()).collect();
    let lowered = ascii.to_lowercase();
    let underscored = NON_WORD.replace_all(&lowered, "_");
    let collapsed = COLLAPSE.replace_all(underscored.trim(), "-");
    let mut slug = collapsed.into_owned();
    slug.truncate(MAX_SLUG_LEN);
    slug
}

pub fn log_file_name(start_epoch: i64, pwd: &str, cmdline: &str) -> String {
    format!("{start_epoch}-{}.log", slugify(pwd, cmdline))
}

/// An open per-task log file: header already written, ready for append.
pub struct LogFile {
    file: File,
    pub path: PathBuf,
}

impl LogFile {
    /// Creates the log directory if absent and opens a fresh log file for
    /// one task, writing the header line and separator.
    pub fn create(start_epoch: i64, pwd: &str, cmdline: &str) -> Result<LogFile> {
        let dir = &Config::get().build_logs_path;
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|source| TaskdError::LogDirCreate {
                path: dir.clone(),
                source,
            })?;
        }

        let path = dir.join(log_file_name(start_epoch, pwd, cmdline));
        let mut file = File::create(&path).map_err(|source| TaskdError::LogFileOpen {
            path: path.clone(),
            source,
        })?;

        file.write_all(format!("{pwd} $ {cmdline}\n").as_bytes())
            .and_then(|_| file.write_all(b"================log================\n"))
            .map_err(|source| TaskdError::LogFileOpen {
                path: path.clone(),
                source,
            })?;

        Ok(LogFile { file, path })
    }

    pub fn write_line(&mut self, line: &str) {
        // A failing write to the log file is not propagated (§4.1 "Fails
        // with: never" applies to the whole output pipeline, not just the
        // printer); the in-memory buffer and followers still get the line.
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            log::warn!("failed to write to log file {:?}: {}", self.path, err);
        }
    }
}
