//! Durable comment outbox.
//!
//! Every user-visible outcome ends in a bug comment, and the tracker is
//! allowed to be down when it happens. Posting goes through this outbox:
//! an immediate attempt, a durable row on failure, a sweep that retries
//! the oldest pending comments each tick, and a dead-letter log once the
//! attempt ceiling is reached. Posting is idempotent per (bug, body):
//! a comment already present on the bug is never posted again.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use autoland_bugzilla::Tracker;
use autoland_store::Store;

use crate::report::Reporter;

/// How many posting attempts a comment gets before the dead-letter log.
pub const DEFAULT_COMMENT_ATTEMPTS: u32 = 5;

/// How many pending comments one sweep retries.
const SWEEP_BATCH: u32 = 5;

/// Post a comment now, or queue it for the sweep when the tracker is
/// unreachable.
pub fn post_or_queue(
    store: &Store,
    tracker: &dyn Tracker,
    dead_letter_log: &Path,
    bug_id: u64,
    body: &str,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    if tracker.has_comment(bug_id, body).unwrap_or(false) {
        reporter.info(&format!("bug {bug_id} already carries this comment, skipping"));
        return Ok(());
    }

    match tracker.post_comment(bug_id, body) {
        Ok(()) => {
            reporter.info(&format!("posted comment to bug {bug_id}"));
            Ok(())
        }
        Err(e) => {
            reporter.warn(&format!(
                "could not post comment to bug {bug_id} ({e}); queuing for retry"
            ));
            if store.queue_comment(bug_id, body).is_err() {
                // Can't even queue it; the log is the last stop.
                reporter.error(&format!(
                    "unable to queue comment for bug {bug_id}; dead-lettering"
                ));
                dead_letter(dead_letter_log, bug_id, body)?;
            }
            Ok(())
        }
    }
}

/// Retry the oldest pending comments. Comments post at most once per
/// (bug, body); a comment that exhausts `max_attempts` goes to the
/// dead-letter log and is dropped.
pub fn sweep(
    store: &Store,
    tracker: &dyn Tracker,
    dead_letter_log: &Path,
    max_attempts: u32,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    for comment in store.next_comments(SWEEP_BATCH)? {
        if tracker.has_comment(comment.bug, &comment.body).unwrap_or(false) {
            store.delete_comment(comment.id)?;
            continue;
        }

        match tracker.post_comment(comment.bug, &comment.body) {
            Ok(()) => {
                reporter.info(&format!("posted queued comment to bug {}", comment.bug));
                store.delete_comment(comment.id)?;
            }
            Err(e) => {
                let attempts = comment.attempts + 1;
                if attempts >= max_attempts {
                    reporter.error(&format!(
                        "could not post comment to bug {} after {attempts} attempts; \
                         dropping: {}",
                        comment.bug, comment.body
                    ));
                    dead_letter(dead_letter_log, comment.bug, &comment.body)?;
                    store.delete_comment(comment.id)?;
                } else {
                    reporter.warn(&format!(
                        "comment for bug {} still unpostable ({e}); attempt {attempts}",
                        comment.bug
                    ));
                    store.bump_comment_attempts(comment.id)?;
                }
            }
        }
    }
    Ok(())
}

fn dead_letter(path: &Path, bug_id: u64, body: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening dead-letter log {}", path.display()))?;
    writeln!(file, "{bug_id}\n\t{body}")
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}
