use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::Result;
use crate::protocol::Rank;

/// Append-only per-participant record of received messages and transfer
/// outcomes. Never rewritten; the coordinator tail-reads it for coarse
/// status.
#[derive(Clone)]
pub struct ActivityLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

pub fn log_path(dir: &Path, rank: Rank) -> PathBuf {
    dir.join(format!("member_{rank}.log"))
}

impl ActivityLog {
    /// Open this member's log (truncating any previous run) and write the
    /// opening entry.
    pub fn create(dir: &Path, rank: Rank) -> Result<Self> {
        let path = log_path(dir, rank);
        let file = File::create(&path)?;
        let log = Self {
            path,
            file: Arc::new(Mutex::new(file)),
        };
        log.append(&format!("member {rank} started"));
        Ok(log)
    }

    /// Append one timestamped, newline-terminated entry. A failed write is a
    /// diagnostic, not an error to the caller: the event loop must not die
    /// because the log disk filled up.
    pub fn append(&self, entry: &str) {
        let line = format!(
            "{} {}\n",
            humantime::format_rfc3339_seconds(SystemTime::now()),
            entry
        );
        let mut file = self.file.lock().expect("log lock poisoned");
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, "activity log write failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Best-effort read of a log's most recent non-empty line. Eventually
/// consistent: a concurrent append may show up as a partial line, which is
/// fine for status display.
pub fn tail_line(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        match line {
            Ok(l) if !l.trim().is_empty() => last = Some(l),
            _ => {}
        }
    }
    last
}
