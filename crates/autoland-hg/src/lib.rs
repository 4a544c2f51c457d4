//! Mercurial operations for the autoland pipeline.
//!
//! The pusher drives an external `hg` binary: pristine clones are kept
//! per branch, patches are imported through the mq extension as a queued
//! series, and finished queues are pushed over SSH. This crate wraps the
//! subcommands the pipeline needs and classifies their failures into the
//! shared error taxonomy (local apply trouble is a [`Conflict`] the
//! escalation ladder can clean up after; remote trouble is [`Transient`]).
//!
//! [`Conflict`]: AutolandError::Conflict
//! [`Transient`]: AutolandError::Transient

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use autoland_process::{CommandResult, run_command};
use autoland_types::{AutolandError, AutolandResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// SSH identity used for pushes, supplied by configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshIdentity {
    pub user: Option<String>,
    pub key: Option<PathBuf>,
}

impl SshIdentity {
    /// The value handed to `hg push --ssh`.
    pub fn ssh_command(&self) -> String {
        let mut cmd = String::from("ssh");
        if let Some(user) = &self.user {
            cmd.push_str(&format!(" -l {user}"));
        }
        if let Some(key) = &self.key {
            cmd.push_str(&format!(" -i {}", key.display()));
        }
        cmd
    }
}

fn run_hg(args: &[&str]) -> AutolandResult<CommandResult> {
    run_command("hg", args).map_err(|e| AutolandError::Internal(format!("hg invocation: {e:#}")))
}

fn repo_str(repo: &Path) -> AutolandResult<&str> {
    repo.to_str()
        .ok_or_else(|| AutolandError::InvalidInput(format!("non-utf8 repo path: {repo:?}")))
}

fn conflict_on_failure(result: CommandResult, what: &str) -> AutolandResult<CommandResult> {
    if result.success {
        Ok(result)
    } else {
        Err(AutolandError::Conflict(format!(
            "{what} failed: {}",
            result.stderr.trim()
        )))
    }
}

fn transient_on_failure(result: CommandResult, what: &str) -> AutolandResult<CommandResult> {
    if result.success {
        Ok(result)
    } else {
        Err(AutolandError::Transient(format!(
            "{what} failed: {}",
            result.stderr.trim()
        )))
    }
}

/// Clone `source` into `dest`.
pub fn clone(source: &str, dest: &Path) -> AutolandResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AutolandError::Internal(format!("creating {}: {e}", parent.display())))?;
    }
    let result = run_hg(&["clone", source, repo_str(dest)?])?;
    transient_on_failure(result, "clone").map(|_| ())
}

/// Pull new changesets from `source` into an existing repository.
pub fn pull(repo: &Path, source: &str) -> AutolandResult<()> {
    let result = run_hg(&["pull", "-R", repo_str(repo)?, source])?;
    transient_on_failure(result, "pull").map(|_| ())
}

/// Make sure `dest` is an up-to-date clone of `source`: pull when the
/// repository already exists, clone otherwise.
pub fn ensure_clone(source: &str, dest: &Path) -> AutolandResult<()> {
    if dest.join(".hg").is_dir() {
        pull(dest, source)
    } else {
        clone(source, dest)
    }
}

/// `hg update -C`: discard uncommitted changes and sync the working copy.
pub fn update_clean(repo: &Path) -> AutolandResult<()> {
    let result = run_hg(&["update", "-C", "-R", repo_str(repo)?])?;
    conflict_on_failure(result, "update -C").map(|_| ())
}

/// `hg purge`: delete untracked files left behind by failed applies.
pub fn purge(repo: &Path) -> AutolandResult<()> {
    let result = run_hg(&[
        "--config",
        "extensions.purge=",
        "purge",
        "--all",
        "-R",
        repo_str(repo)?,
    ])?;
    conflict_on_failure(result, "purge").map(|_| ())
}

fn run_mq(repo: &Path, args: &[&str]) -> AutolandResult<CommandResult> {
    let repo = repo_str(repo)?;
    let mut cmd = vec!["--config", "extensions.mq=", "-R", repo];
    cmd.extend_from_slice(args);
    run_hg(&cmd)
}

/// Import a patch file into the repository's patch queue.
pub fn qimport(repo: &Path, patch_file: &Path) -> AutolandResult<()> {
    let patch = patch_file
        .to_str()
        .ok_or_else(|| AutolandError::InvalidInput(format!("non-utf8 patch path: {patch_file:?}")))?;
    let result = run_mq(repo, &["qimport", patch])?;
    conflict_on_failure(result, "qimport").map(|_| ())
}

/// Apply the next queued patch.
pub fn qpush(repo: &Path) -> AutolandResult<()> {
    let result = run_mq(repo, &["qpush"])?;
    conflict_on_failure(result, "qpush").map(|_| ())
}

/// Pop every applied patch off the queue. Missing queue state is fine.
pub fn qpop_all(repo: &Path) -> AutolandResult<()> {
    // qpop exits non-zero when no patches are applied; that is not a failure
    // for cleanup purposes.
    let _ = run_mq(repo, &["qpop", "-a"])?;
    Ok(())
}

/// Rewrite the topmost queued patch, optionally replacing its user and
/// commit message.
pub fn qrefresh(repo: &Path, user: Option<&str>, message: Option<&str>) -> AutolandResult<()> {
    let mut args = vec!["qrefresh"];
    if let Some(user) = user {
        args.extend_from_slice(&["-u", user]);
    }
    if let Some(message) = message {
        args.extend_from_slice(&["-m", message]);
    }
    let result = run_mq(repo, &args)?;
    conflict_on_failure(result, "qrefresh").map(|_| ())
}

/// Commit message of the topmost queued patch.
pub fn qheader(repo: &Path) -> AutolandResult<String> {
    let result = run_mq(repo, &["qheader"])?;
    let result = conflict_on_failure(result, "qheader")?;
    Ok(result.stdout.trim().to_string())
}

/// Create a new (empty) queue entry with the given message.
pub fn qnew(repo: &Path, name: &str, message: &str, user: Option<&str>) -> AutolandResult<()> {
    let mut args = vec!["qnew", "-m", message];
    if let Some(user) = user {
        args.extend_from_slice(&["-u", user]);
    }
    args.push(name);
    let result = run_mq(repo, &args)?;
    conflict_on_failure(result, "qnew").map(|_| ())
}

/// Convert every applied queue entry into an ordinary commit.
pub fn qfinish_all(repo: &Path) -> AutolandResult<()> {
    let result = run_mq(repo, &["qfinish", "-a"])?;
    conflict_on_failure(result, "qfinish").map(|_| ())
}

/// Remove the mq queue directory outright (soft-clean step).
pub fn remove_patch_queue(repo: &Path) -> AutolandResult<()> {
    let queue = repo.join(".hg").join("patches");
    if queue.is_dir() {
        fs::remove_dir_all(&queue)
            .map_err(|e| AutolandError::Internal(format!("removing {}: {e}", queue.display())))?;
    }
    Ok(())
}

/// Push the repository to `dest`. Force is only ever passed for try-bound
/// pushes; branch pushes must not create new remote heads.
pub fn push(repo: &Path, dest: &str, ssh: Option<&SshIdentity>, force: bool) -> AutolandResult<()> {
    let repo = repo_str(repo)?;
    let mut args = vec!["push", "-R", repo];
    let ssh_cmd;
    if let Some(identity) = ssh {
        ssh_cmd = identity.ssh_command();
        args.extend_from_slice(&["--ssh", &ssh_cmd]);
    }
    if force {
        args.push("-f");
    }
    args.push(dest);
    let result = run_hg(&args)?;
    transient_on_failure(result, "push").map(|_| ())
}

/// Short node hash of the working directory parent.
pub fn tip_revision(repo: &Path) -> AutolandResult<String> {
    let result = run_hg(&[
        "log",
        "-r",
        ".",
        "--template",
        "{node|short}",
        "-R",
        repo_str(repo)?,
    ])?;
    let result = conflict_on_failure(result, "log")?;
    let rev = result.stdout.trim().to_string();
    if rev.is_empty() {
        return Err(AutolandError::Internal("empty revision from hg log".into()));
    }
    Ok(rev)
}

/// Parsed `# User` header and commit message of an exported patch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchHeader {
    pub user: Option<String>,
    pub message: Option<String>,
}

impl PatchHeader {
    /// A patch destined for a branch needs a well-formed user line and a
    /// non-blank commit message. Developers exporting with `hg diff`
    /// instead of `hg export` fail this check.
    pub fn is_complete(&self) -> bool {
        self.user.is_some() && self.message.is_some()
    }
}

fn userline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^# User (.+ <[\w.%+-]+@[\w.-]+\.[A-Za-z]{2,6}>)\s*$")
            .expect("userline regex")
    })
}

/// Parse the header of an exported patch: the `# User Name <email>` line
/// and the first non-blank commit-message line before the diff starts.
pub fn parse_header(text: &str) -> PatchHeader {
    let mut header = PatchHeader::default();
    for line in text.lines() {
        if line.starts_with("diff ") || line.starts_with("--- ") || line.starts_with("Index:") {
            break;
        }
        if line.starts_with("# User ") {
            // A malformed user line is as bad as a missing one.
            header.user = userline_re()
                .captures(line)
                .map(|c| c[1].trim().to_string());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if !line.trim().is_empty() && header.message.is_none() {
            header.message = Some(line.trim().to_string());
        }
    }
    header
}

/// Read and parse a patch file's header.
pub fn parse_header_file(path: &Path) -> AutolandResult<PatchHeader> {
    let text = fs::read_to_string(path)
        .map_err(|e| AutolandError::Internal(format!("reading {}: {e}", path.display())))?;
    Ok(parse_header(&text))
}
