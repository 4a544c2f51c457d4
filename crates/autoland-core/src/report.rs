//! Logging seam for the long-running subsystems.
//!
//! The orchestrator, pusher, and classifier narrate what they do through a
//! `Reporter` instead of a global logger; the CLI decides where the lines
//! go (stderr, a file) and tests collect them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Discards everything.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Appends timestamped lines to a log file (`--log-file`).
pub struct FileReporter {
    file: File,
}

impl FileReporter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self { file })
    }

    fn write(&mut self, level: &str, msg: &str) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let _ = writeln!(self.file, "{now} [{level}] {msg}");
    }
}

impl Reporter for FileReporter {
    fn info(&mut self, msg: &str) {
        self.write("info", msg);
    }

    fn warn(&mut self, msg: &str) {
        self.write("warn", msg);
    }

    fn error(&mut self, msg: &str) {
        self.write("error", msg);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn file_reporter_appends_lines() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("autoland.log");

        let mut reporter = FileReporter::open(&path).expect("open");
        reporter.info("starting up");
        reporter.warn("tree closed");
        reporter.error("push failed");
        drop(reporter);

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("[info] starting up"));
        assert!(lines[1].contains("[warn] tree closed"));
        assert!(lines[2].contains("[error] push failed"));
    }

    #[test]
    fn null_reporter_is_callable() {
        let mut reporter = NullReporter;
        reporter.info("i");
        reporter.warn("w");
        reporter.error("e");
    }
}
