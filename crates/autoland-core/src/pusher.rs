//! The pusher: clone / import / rewrite / push for one (patchset, branch).
//!
//! A pusher instance holds an exclusive lock on a numbered working
//! directory and owns two subtrees under it: `clean/<branch>`, a pristine
//! cache refreshed from the branch URL, and `active/<branch>`, the
//! checkout patches are applied to. Each job gets up to three attempts
//! with escalating cleanup between them; retryable trouble (apply
//! conflicts, transport) climbs the ladder, fatal trouble (permissions,
//! bad headers on branch landings, invalid attachments) aborts at once.
//! Whatever happens, exactly one reply goes back on the bus.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use autoland_bugzilla::Tracker;
use autoland_bus::Bus;
use autoland_directory::Directory;
use autoland_retry::{RetryBudget, RetryExecutor};
use autoland_types::{
    AutolandError, AutolandResult, JobMessage, PatchsetJob, ResultAction, ResultKind,
    ResultMessage, join_ids,
};

use crate::lock::LockFile;
use crate::orchestrator::{JOB_ROUTING_KEY, RESULT_ROUTING_KEY};
use crate::report::Reporter;
use crate::rewrite;
use crate::services::Services;

/// Highest working-directory index probed before giving up.
const MAX_WORK_DIRS: u32 = 100;

/// An exclusively held `pusher.N` working directory.
pub struct WorkDir {
    path: PathBuf,
    index: u32,
    _lock: LockFile,
}

impl WorkDir {
    /// Probe `pusher.0`, `pusher.1`, … under `base` until a lock is
    /// obtained. Parallel pusher processes on one host each end up with
    /// their own directory.
    pub fn acquire(base: &Path) -> Result<Self> {
        for index in 0..MAX_WORK_DIRS {
            let path = base.join(format!("pusher.{index}"));
            fs::create_dir_all(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            match LockFile::acquire(&path) {
                Ok(lock) => {
                    // a fresh holder starts from a clean active tree
                    let _ = fs::remove_dir_all(path.join("active"));
                    fs::create_dir_all(path.join("active"))
                        .with_context(|| format!("creating {}", path.display()))?;
                    return Ok(Self {
                        path,
                        index,
                        _lock: lock,
                    });
                }
                Err(_) => continue,
            }
        }
        anyhow::bail!("no unlocked working directory under {}", base.display());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn clean_repo(&self, branch: &str) -> PathBuf {
        self.path.join("clean").join(branch)
    }

    fn active_repo(&self, branch: &str) -> PathBuf {
        self.path.join("active").join(branch)
    }

    fn patches_dir(&self) -> PathBuf {
        self.path.join("patches")
    }
}

/// Consume apply jobs forever, one at a time (prefetch is effectively 1:
/// a delivery is acknowledged only after its reply is published).
pub fn run(services: &Services, reporter: &mut dyn Reporter) -> Result<()> {
    let config = &services.config;
    services.bus.bind(&config.bus.pusher_queue, JOB_ROUTING_KEY)?;

    let workdir = WorkDir::acquire(&config.pusher.work_dir)?;
    reporter.info(&format!(
        "pusher started in {} (index {})",
        workdir.path().display(),
        workdir.index()
    ));

    loop {
        match services.bus.receive(&config.bus.pusher_queue)? {
            Some(delivery) => {
                handle_job_payload(
                    services,
                    &workdir,
                    delivery.envelope.payload.clone(),
                    reporter,
                );
                services.bus.ack(&delivery)?;
            }
            None => std::thread::sleep(std::time::Duration::from_secs(5)),
        }
    }
}

/// Validate one job payload and process it; schema failures are logged
/// and dropped, everything else produces exactly one reply on `db`.
pub fn handle_job_payload(
    services: &Services,
    workdir: &WorkDir,
    payload: serde_json::Value,
    reporter: &mut dyn Reporter,
) {
    let job = match serde_json::from_value::<JobMessage>(payload) {
        Ok(JobMessage::Patchset(job)) => job,
        Err(e) => {
            reporter.error(&format!("invalid job message: {e}"));
            return;
        }
    };

    let reply = process_job(services, workdir, &job, reporter);
    match serde_json::to_value(&reply) {
        Ok(value) => {
            if let Err(e) = services.bus.publish(RESULT_ROUTING_KEY, value) {
                reporter.error(&format!("cannot publish reply: {e:#}"));
            }
        }
        Err(e) => reporter.error(&format!("cannot serialize reply: {e}")),
    }
}

/// Process one job to exactly one reply.
pub fn process_job(
    services: &Services,
    workdir: &WorkDir,
    job: &PatchsetJob,
    reporter: &mut dyn Reporter,
) -> ResultMessage {
    let mut comments = vec![format!(
        "Autoland Patchset:\n\tPatches: {}\n\tBranch: {}",
        join_ids(&job.patches.iter().map(|p| p.id).collect::<Vec<_>>()),
        if job.try_run { "try" } else { job.branch.as_str() },
    )];

    // Permission check first; failure is non-retryable.
    if let Err(reason) = check_push_permission(services, job) {
        reporter.error(&format!("bug {}: {reason}", job.bug_id));
        comments.push(reason);
        return error_reply(job, comments);
    }

    let attempts = services.config.pusher.attempts.max(1);
    for attempt in 1..=attempts {
        match attempt_job(services, workdir, job, reporter) {
            Ok(revision) => {
                reporter.info(&format!(
                    "bug {}: pushed patchset {} as {revision}",
                    job.bug_id, job.patchsetid
                ));
                return success_reply(services, job, &revision);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                reporter.warn(&format!(
                    "bug {}: attempt {attempt} failed ({e}); escalating cleanup",
                    job.bug_id
                ));
                match attempt {
                    1 => soft_clean(workdir, &job.branch, reporter),
                    _ => hard_clean(workdir, &job.branch, reporter),
                }
            }
            Err(e) => {
                reporter.error(&format!("bug {}: {e}", job.bug_id));
                comments.push(format!("Patchset could not be applied and pushed.\n{e}"));
                return error_reply(job, comments);
            }
        }
    }

    // attempts >= 1, so the loop always returns; keep the compiler honest
    comments.push("Patchset could not be applied and pushed.".to_string());
    error_reply(job, comments)
}

/// The landing user must hold the directory group for the outgoing
/// destination: the try branch for try runs, the real branch otherwise.
fn check_push_permission(services: &Services, job: &PatchsetJob) -> std::result::Result<(), String> {
    let outgoing = if job.try_run { "try" } else { job.branch.as_str() };
    let denied = || format!("Insufficient permissions to push to {outgoing}.");

    let group = services
        .directory
        .branch_group(outgoing)
        .map_err(|_| denied())?;
    match services.directory.in_group(&job.user, &group) {
        Ok(true) => Ok(()),
        // directory trouble reads as permission denied for the caller
        Ok(false) | Err(_) => Err(denied()),
    }
}

fn attempt_job(
    services: &Services,
    workdir: &WorkDir,
    job: &PatchsetJob,
    reporter: &mut dyn Reporter,
) -> AutolandResult<String> {
    let clean = workdir.clean_repo(&job.branch);
    let active = workdir.active_repo(&job.branch);
    let patches_dir = workdir.patches_dir();

    // Refresh the pristine cache, then clone it to the active checkout.
    RetryExecutor::from_budget(RetryBudget::Clone).run_if(
        |_| autoland_hg::ensure_clone(&job.branch_url, &clean),
        AutolandError::is_retryable,
    )?;
    if active.exists() {
        fs::remove_dir_all(&active)
            .map_err(|e| AutolandError::Internal(format!("removing {}: {e}", active.display())))?;
    }
    let clean_url = clean
        .to_str()
        .ok_or_else(|| AutolandError::Internal("non-utf8 work dir".into()))?;
    autoland_hg::clone(clean_url, &active)?;

    for patch in &job.patches {
        let file = services.tracker.download_patch(patch.id, &patches_dir)?;
        let header = autoland_hg::parse_header_file(&file)?;

        let mut user_override = None;
        if !header.is_complete() {
            if job.to_branch {
                // hg diff output instead of hg export; landing this on a
                // branch would lose authorship, so it is a hard failure
                return Err(AutolandError::InvalidInput(format!(
                    "Patch {} doesn't have a properly formatted header. To land to \
                     branches, patches must contain a header with a commit message \
                     and user field.",
                    patch.id
                )));
            }
            user_override = Some(job.user.clone());
        }

        autoland_hg::qimport(&active, &file)?;
        autoland_hg::qpush(&active)?;

        let current = autoland_hg::qheader(&active)?;
        let base = if current.is_empty() {
            let summary = services.tracker.bug(job.bug_id)?.summary;
            reporter.info(&format!(
                "patch {}: no commit message, falling back to the bug summary",
                patch.id
            ));
            rewrite::fallback_message(job.bug_id, &summary)
        } else {
            current
        };
        let message = rewrite::rewrite_message(
            &base,
            patch,
            &job.branch,
            &job.user,
            job.bug_id,
            job.try_run,
        );
        autoland_hg::qrefresh(&active, user_override.as_deref(), Some(&message))?;
    }

    if job.try_run && branch_adds_try_commit(services, &job.branch) {
        let syntax = job
            .try_syntax
            .clone()
            .unwrap_or_else(|| services.config.hg.try_syntax.clone());
        let message = rewrite::try_commit_message(
            &syntax,
            job.bug_id,
            job.to_branch,
            services.config.hg.staging,
        );
        autoland_hg::qnew(&active, "try_syntax", &message, Some(&job.user))?;
    }

    autoland_hg::qfinish_all(&active)?;

    let ssh = services.config.hg.ssh_identity();
    // force is permitted on try pushes only; a branch push creating a new
    // remote head must fail
    autoland_hg::push(&active, &job.push_url, ssh.as_ref(), job.try_run)?;
    let revision = autoland_hg::tip_revision(&active)?;

    // success: the checkout and the downloaded patches are disposable
    let _ = fs::remove_dir_all(&active);
    for patch in &job.patches {
        let _ = fs::remove_file(patches_dir.join(format!("{}.patch", patch.id)));
    }

    Ok(revision)
}

/// Between attempts 1 and 2: pop the queue, drop the queue directory,
/// and force-update the working copy.
fn soft_clean(workdir: &WorkDir, branch: &str, reporter: &mut dyn Reporter) {
    let active = workdir.active_repo(branch);
    if !active.exists() {
        return;
    }
    for step in [
        autoland_hg::qpop_all(&active),
        autoland_hg::remove_patch_queue(&active),
        autoland_hg::update_clean(&active),
        autoland_hg::purge(&active),
    ] {
        if let Err(e) = step {
            reporter.warn(&format!("soft clean: {e}"));
        }
    }
}

/// Between attempts 2 and 3: delete both trees so the next attempt
/// re-clones from the branch URL.
fn hard_clean(workdir: &WorkDir, branch: &str, reporter: &mut dyn Reporter) {
    for path in [workdir.clean_repo(branch), workdir.active_repo(branch)] {
        if path.exists() {
            if let Err(e) = fs::remove_dir_all(&path) {
                reporter.warn(&format!("hard clean of {}: {e}", path.display()));
            }
        }
    }
}

fn branch_adds_try_commit(services: &Services, branch: &str) -> bool {
    services
        .store
        .branch(branch)
        .ok()
        .flatten()
        .map(|b| b.add_try_commit)
        .unwrap_or(false)
}

fn success_reply(services: &Services, job: &PatchsetJob, revision: &str) -> ResultMessage {
    let display = services
        .store
        .branch(if job.try_run { "try" } else { &job.branch })
        .ok()
        .flatten()
        .and_then(|b| b.display_name)
        .unwrap_or_else(|| if job.try_run { "try".into() } else { job.branch.clone() });
    let monitor = format!(
        "To monitor the commit, see: {}?tree={display}&rev={revision}",
        services.config.pusher.results_url
    );

    let comment = if job.try_run {
        format!(
            "Autoland Patchset:\n\tPatches: {}\n\tBranch: try\n\
             Try run started, revision {revision}.\n{monitor}",
            join_ids(&job.patches.iter().map(|p| p.id).collect::<Vec<_>>()),
        )
    } else {
        format!(
            "Autoland Patchset:\n\tPatches: {}\n\tBranch: {}\n\
             Successfully applied and pushed patchset.\n\tRevision: {revision}\n{monitor}",
            join_ids(&job.patches.iter().map(|p| p.id).collect::<Vec<_>>()),
            job.branch,
        )
    };

    ResultMessage {
        kind: ResultKind::Success,
        action: if job.try_run {
            ResultAction::TryPush
        } else {
            ResultAction::BranchPush
        },
        bug_id: job.bug_id,
        patchsetid: Some(job.patchsetid),
        revision: Some(revision.to_string()),
        comment: Some(comment),
    }
}

fn error_reply(job: &PatchsetJob, comments: Vec<String>) -> ResultMessage {
    ResultMessage {
        kind: ResultKind::Error,
        action: ResultAction::PatchsetApply,
        bug_id: job.bug_id,
        patchsetid: Some(job.patchsetid),
        revision: None,
        comment: Some(comments.join("\n")),
    }
}

/// Drain the job queue after operator confirmation (`--purge-queue`).
pub fn purge_queue(services: &Services) -> Result<usize> {
    let queue = &services.config.bus.pusher_queue;
    services.bus.bind(queue, JOB_ROUTING_KEY)?;
    services.bus.purge(queue).context("purging job queue")
}

/// Pending depth of the job queue (for the purge prompt).
pub fn queue_depth(services: &Services) -> Result<usize> {
    let queue = &services.config.bus.pusher_queue;
    services.bus.bind(queue, JOB_ROUTING_KEY)?;
    services.bus.depth(queue)
}
