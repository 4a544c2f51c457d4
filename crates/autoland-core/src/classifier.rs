//! The outcome classifier.
//!
//! Downstream builds run against every pushed revision; this poller
//! correlates the build records for each revision, decides whether the
//! set is complete, tolerates a bounded number of intermittent warnings
//! ("oranges"), optionally retriggers them through the self-serve API,
//! and emits a single terminal verdict per revision: a bug comment plus a
//! completion message on the bus. Incomplete revisions are tracked in a
//! per-revision cache file until they finish or hit the wall-clock
//! timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use autoland_bugzilla::{Tracker, bugs_from_comments};
use autoland_bus::Bus;
use autoland_types::{
    AutolandError, AutolandResult, BuildRecord, BuildResult, ResultAction, ResultKind,
    ResultMessage,
};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::lock::LockFile;
use crate::report::Reporter;
use crate::services::Services;

/// The downstream rebuild endpoint; tests substitute fakes.
pub trait RebuildEndpoint {
    fn rebuild(&self, branch: &str, build_id: i64) -> AutolandResult<()>;
}

/// Self-serve API client (`POST <url>/<branch>/build`).
pub struct SelfServeClient {
    url: String,
    user: String,
    password: String,
    client: reqwest::blocking::Client,
}

impl SelfServeClient {
    pub fn new(url: &str, user: &str, password: &str) -> AutolandResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            // the API answers a successful trigger with a redirect
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AutolandError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            client,
        })
    }
}

impl RebuildEndpoint for SelfServeClient {
    fn rebuild(&self, branch: &str, build_id: i64) -> AutolandResult<()> {
        let url = format!("{}/{branch}/build", self.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .header("Accepts", "application/json")
            .form(&[("build_id", build_id.to_string())])
            .send()
            .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(AutolandError::Transient(format!("{url}: {status}")))
        }
    }
}

/// Terminal (or pending) verdict for one revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
    Retrying,
    TimedOut,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "SUCCESS",
            Verdict::Failure => "FAILURE",
            Verdict::Retrying => "RETRYING",
            Verdict::TimedOut => "TIMED_OUT",
        }
    }

    fn result_kind(&self) -> Option<ResultKind> {
        match self {
            Verdict::Success => Some(ResultKind::Success),
            Verdict::Failure => Some(ResultKind::Failure),
            Verdict::TimedOut => Some(ResultKind::TimedOut),
            Verdict::Retrying => None,
        }
    }
}

/// Push type parsed from the records' `try:` comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    /// `--post-to-bugzilla`: report back to the bug.
    Try,
    /// `--retry-oranges [N]`: report back, retriggering oranges first.
    Retry,
    /// Not an autoland push; discard silently on completion.
    None,
}

/// Result tallies for a record set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub success: u32,
    pub warnings: u32,
    pub failure: u32,
    pub skipped: u32,
    pub exception: u32,
    pub other: u32,
    pub total: u32,
}

pub fn tally(records: &[BuildRecord]) -> Counts {
    let mut counts = Counts::default();
    for record in records {
        match record.result {
            BuildResult::Success => counts.success += 1,
            BuildResult::Warnings => counts.warnings += 1,
            BuildResult::Failure => counts.failure += 1,
            BuildResult::Skipped => counts.skipped += 1,
            BuildResult::Exception => counts.exception += 1,
            BuildResult::Other => counts.other += 1,
        }
        counts.total += 1;
    }
    counts
}

/// Detect the push type and the per-push orange tolerance. With
/// `flag_check`, a try push only counts when `--post-to-bugzilla` is in
/// the comments; `--retry-oranges N` overrides `max_orange` when N parses
/// as a non-negative integer.
pub fn push_type(records: &[BuildRecord], flag_check: bool, default_max_orange: u32) -> (PushType, u32) {
    let mut push_type = PushType::None;
    let mut max_orange = default_max_orange;

    for record in records {
        let comments = &record.comments;
        if !comments.contains("try: ") {
            continue;
        }
        if !flag_check || comments.contains("--post-to-bugzilla") {
            if push_type == PushType::None {
                push_type = PushType::Try;
            }
        }
        if let Some(rest) = comments.split("--retry-oranges").nth(1) {
            push_type = PushType::Retry;
            if let Some(token) = rest.split_whitespace().next() {
                match token.parse::<i64>() {
                    Ok(n) if n >= 0 => max_orange = n as u32,
                    // negative or unparseable keeps the default
                    _ => max_orange = default_max_orange,
                }
            }
        }
    }
    (push_type, max_orange)
}

/// Classify a complete record set. `retrigger` is called once per
/// `warnings` record when the oranges outnumber what retries can account
/// for; a failed retrigger flips the verdict to FAILURE.
pub fn classify_records(
    records: &[BuildRecord],
    max_orange: u32,
    retrigger: &mut dyn FnMut(&BuildRecord) -> AutolandResult<()>,
) -> Verdict {
    let counts = tally(records);
    if counts.total == 0 {
        return Verdict::Failure;
    }

    if counts.failure + counts.other + counts.skipped + counts.exception > 0 {
        return Verdict::Failure;
    }
    if counts.success == counts.total {
        return Verdict::Success;
    }
    if counts.warnings <= max_orange {
        // tolerated intermittents
        return Verdict::Success;
    }
    if counts.success + counts.warnings == counts.total {
        // retried builds show up as duplicate builder names
        let mut by_builder: BTreeMap<&str, u32> = BTreeMap::new();
        for record in records {
            *by_builder.entry(record.buildername.as_str()).or_default() += 1;
        }
        let retry_count = by_builder.values().filter(|&&n| n > 1).count() as u32;

        if 2 * retry_count >= counts.warnings {
            // the retries have resolved; discount one orange per pair
            if counts.warnings.saturating_sub(retry_count) <= max_orange {
                return Verdict::Success;
            }
            return Verdict::Failure;
        }

        for record in records {
            if record.result == BuildResult::Warnings && retrigger(record).is_err() {
                return Verdict::Failure;
            }
        }
        return Verdict::Retrying;
    }

    // pending/running shapes should never reach classification
    Verdict::Failure
}

/// A record set is complete only when every record finished longer than
/// `threshold` ago; the grace window covers delayed follow-on tests.
pub fn is_complete(records: &[BuildRecord], now: DateTime<Utc>, threshold: Duration) -> bool {
    if records.is_empty() {
        return false;
    }
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
    records.iter().all(|record| {
        record
            .finish_time
            .map(|finished| now - finished > threshold)
            .unwrap_or(false)
    })
}

/// Per-revision cache files: `<cache>/<revision>` accumulates
/// `timestamp|status` lines while a revision is incomplete; terminal
/// classification renames the file to `<revision>.done`.
pub struct RevisionCache {
    dir: PathBuf,
}

impl RevisionCache {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn file(&self, revision: &str) -> Result<PathBuf> {
        if revision.is_empty() || revision.contains('/') || revision.contains("..") {
            bail!("bad revision name: {revision:?}");
        }
        Ok(self.dir.join(revision))
    }

    /// (incomplete revisions, completed revisions) currently on disk.
    pub fn load(&self) -> Result<(Vec<String>, Vec<String>)> {
        let mut incomplete = Vec::new();
        let mut done = Vec::new();
        if !self.dir.is_dir() {
            return Ok((incomplete, done));
        }
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("reading cache dir {}", self.dir.display()))?
        {
            let name = entry?.file_name().to_string_lossy().to_string();
            match name.strip_suffix(".done") {
                Some(revision) => done.push(revision.to_string()),
                None => incomplete.push(name),
            }
        }
        incomplete.sort();
        done.sort();
        Ok((incomplete, done))
    }

    pub fn append(&self, revision: &str, status: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;
        let path = self.file(revision)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening cache file {}", path.display()))?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writeln!(file, "{now}|{status}")
            .with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }

    /// Timestamp of the first cache entry for a revision, if tracked.
    pub fn first_seen(&self, revision: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.file(revision)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading cache file {}", path.display()))?;
        let Some(first) = content.lines().next() else {
            return Ok(None);
        };
        let stamp = first.split('|').next().unwrap_or("");
        Ok(DateTime::parse_from_rfc3339(stamp)
            .ok()
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Seal a revision: further ticks ignore it.
    pub fn mark_done(&self, revision: &str) -> Result<()> {
        let path = self.file(revision)?;
        let done = self.dir.join(format!("{revision}.done"));
        if path.exists() {
            fs::rename(&path, &done)
                .with_context(|| format!("renaming {} to done", path.display()))?;
        } else {
            fs::create_dir_all(&self.dir)?;
            fs::write(&done, b"").with_context(|| format!("writing {}", done.display()))?;
        }
        Ok(())
    }

    pub fn is_done(&self, revision: &str) -> bool {
        self.dir.join(format!("{revision}.done")).exists()
    }
}

/// Per-invocation knobs (CLI flags layered over configuration).
#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    pub branch: String,
    pub cache_dir: PathBuf,
    pub dry_run: bool,
    /// Send completion messages on the bus.
    pub messages: bool,
    /// Require `--post-to-bugzilla` before treating a push as a try push.
    pub flag_check: bool,
}

impl ClassifierOptions {
    pub fn from_config(config: &crate::config::ClassifierConfig) -> Self {
        Self {
            branch: config.branch.clone(),
            cache_dir: config.cache_dir.clone(),
            dry_run: false,
            messages: true,
            flag_check: false,
        }
    }
}

/// What one revision poll concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionOutcome {
    pub verdict: Option<Verdict>,
    pub complete: bool,
    pub posted: bool,
    pub discarded: bool,
    pub message: Option<String>,
}

fn bug_numbers(records: &[BuildRecord]) -> Vec<u64> {
    let mut bugs = BTreeSet::new();
    for record in records {
        if let Some(idx) = record.comments.find("try: ") {
            bugs.extend(bugs_from_comments(&record.comments[idx..]));
        }
    }
    bugs.into_iter().collect()
}

fn tree_name(branch: &str) -> String {
    let mut chars = branch.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// The summary comment for a classified revision: a link to the detailed
/// results plus the per-status breakdown.
pub fn report_message(revision: &str, records: &[BuildRecord], branch: &str, results_url: &str) -> String {
    let counts = tally(records);
    let mut message = format!(
        "Try run for {revision} is complete.\n\
         Detailed breakdown of the results available here:\n\
         \t{results_url}?tree={}&rev={revision}\n\
         Results (out of {} total builds):\n",
        tree_name(branch),
        counts.total,
    );
    for (key, value) in [
        ("success", counts.success),
        ("warnings", counts.warnings),
        ("failure", counts.failure),
        ("skipped", counts.skipped),
        ("exception", counts.exception),
        ("other", counts.other),
    ] {
        if value > 0 {
            message.push_str(&format!("    {key}: {value}\n"));
        }
    }
    if let Some(author) = records.iter().find_map(|r| r.author.clone()) {
        message.push_str(&format!("Submitted by: {author}\n"));
    }
    message
}

/// Run one revision through the polling process.
pub fn poll_revision(
    services: &Services,
    opts: &ClassifierOptions,
    revision: &str,
    reporter: &mut dyn Reporter,
) -> Result<RevisionOutcome> {
    let config = &services.config.classifier;
    let cache = RevisionCache::new(&opts.cache_dir);

    let records = services
        .build_store
        .records_for_revision(&opts.branch, revision)?;
    let (push_type, max_orange) = push_type(&records, opts.flag_check, config.max_orange);
    let bugs = bug_numbers(&records);

    let now = Utc::now();
    let complete = is_complete(&records, now, config.completion_threshold);
    let timeout = chrono::Duration::from_std(config.timeout).unwrap_or(chrono::Duration::zero());
    let timed_out = cache
        .first_seen(revision)?
        .map(|first| now - first > timeout)
        .unwrap_or(false);

    let mut outcome = RevisionOutcome {
        verdict: None,
        complete: complete || timed_out,
        posted: false,
        discarded: false,
        message: None,
    };

    let verdict = if timed_out {
        reporter.warn(&format!("revision {revision} timed out without completing"));
        Some(Verdict::TimedOut)
    } else if complete {
        let mut retrigger = |record: &BuildRecord| {
            if opts.dry_run {
                reporter.info(&format!(
                    "dry run: would retrigger build {} on {}",
                    record.build_id, opts.branch
                ));
                return Ok(());
            }
            reporter.info(&format!(
                "retriggering build {} ({}) on {}",
                record.build_id, record.buildername, opts.branch
            ));
            services.rebuild.rebuild(&opts.branch, record.build_id)
        };
        match classify_records(&records, max_orange, &mut retrigger) {
            Verdict::Retrying => {
                reporter.info(&format!("revision {revision}: oranges retriggered, waiting"));
                if !opts.dry_run {
                    cache.append(revision, "RETRYING")?;
                }
                outcome.complete = false;
                None
            }
            verdict => Some(verdict),
        }
    } else {
        None
    };

    let Some(verdict) = verdict else {
        if !complete && !timed_out {
            if bugs.is_empty() {
                outcome.discarded = true;
            } else if !opts.dry_run {
                let counts = tally(&records);
                cache.append(revision, &format!("incomplete total={}", counts.total))?;
            }
        }
        return Ok(outcome);
    };

    outcome.verdict = Some(verdict);

    if push_type == PushType::None || bugs.is_empty() {
        // nobody asked for a report on this push
        reporter.info(&format!("revision {revision}: nothing to do, discarding"));
        outcome.discarded = true;
        if !opts.dry_run {
            cache.mark_done(revision)?;
        }
        return Ok(outcome);
    }

    let mut message = report_message(revision, &records, &opts.branch, &config.results_url);
    if verdict == Verdict::TimedOut {
        message.push_str(&format!(
            "Timed out after {} without completing.\n",
            humantime::format_duration(config.timeout)
        ));
    }
    outcome.message = Some(message.clone());

    for &bug in &bugs {
        if services.tracker.has_comment(bug, &message).unwrap_or(false) {
            reporter.info(&format!("bug {bug}: already posted, not reposting"));
            if !opts.dry_run {
                cache.mark_done(revision)?;
            }
            continue;
        }
        if opts.dry_run {
            reporter.info(&format!("dry run: would post results for {revision} to bug {bug}"));
            continue;
        }
        match services.tracker.post_comment(bug, &message) {
            Ok(()) => {
                outcome.posted = true;
                append_posted_log(&config.posted_bugs, bug, revision)?;
                cache.mark_done(revision)?;
                if opts.messages {
                    if let Some(kind) = verdict.result_kind() {
                        let msg = ResultMessage {
                            kind,
                            action: ResultAction::TryRun,
                            bug_id: bug,
                            patchsetid: None,
                            revision: Some(revision.to_string()),
                            comment: None,
                        };
                        services
                            .bus
                            .publish(crate::orchestrator::RESULT_ROUTING_KEY, serde_json::to_value(&msg)?)?;
                    }
                }
            }
            Err(e) => {
                reporter.warn(&format!(
                    "bug {bug}: could not post results for {revision} ({e}); will retry"
                ));
                if verdict == Verdict::TimedOut {
                    // timed out and unreportable; stop tracking it
                    cache.mark_done(revision)?;
                } else {
                    cache.append(revision, "POST_FAILED")?;
                }
            }
        }
    }
    Ok(outcome)
}

/// Poll every revision with activity in `[start, end)` plus everything
/// still incomplete in the cache. Returns the revisions left incomplete.
pub fn poll_range(
    services: &Services,
    opts: &ClassifierOptions,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    reporter: &mut dyn Reporter,
) -> Result<Vec<String>> {
    let cache = RevisionCache::new(&opts.cache_dir);

    let mut revisions: BTreeSet<String> = services
        .build_store
        .revisions_between(&opts.branch, &start, &end)?
        .into_iter()
        .collect();
    let (incomplete, done) = cache.load()?;
    revisions.extend(incomplete);
    for revision in done {
        revisions.remove(&revision);
    }

    let mut still_incomplete = Vec::new();
    for revision in revisions {
        let outcome = poll_revision(services, opts, &revision, reporter)?;
        if !outcome.complete && !outcome.discarded {
            still_incomplete.push(revision);
        }
    }
    Ok(still_incomplete)
}

/// One classifier tick under the single-instance lock: a single revision
/// when given, a time range otherwise.
pub fn run_once(
    services: &Services,
    opts: &ClassifierOptions,
    revision: Option<&str>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let config = &services.config.classifier;
    let _lock = LockFile::acquire(&config.lock_dir)
        .context("another classifier instance appears to be running")?;

    if let Some(revision) = revision {
        let outcome = poll_revision(services, opts, revision, reporter)?;
        reporter.info(&format!(
            "revision {revision}: verdict {:?}, posted {}",
            outcome.verdict, outcome.posted
        ));
        return Ok(());
    }

    let end = end.unwrap_or_else(Utc::now);
    let window =
        chrono::Duration::from_std(config.poll_window).unwrap_or(chrono::Duration::hours(4));
    let start = start.unwrap_or(end - window);
    if start > Utc::now() {
        bail!("start time {start} is in the future");
    }
    if end < start {
        bail!("end time {end} is earlier than start time {start}");
    }
    let max_window =
        chrono::Duration::from_std(config.max_poll_window).unwrap_or(chrono::Duration::hours(48));
    if end - start > max_window {
        bail!("polling interval too large; maximum is {max_window}");
    }

    let incomplete = poll_range(services, opts, start, end, reporter)?;
    reporter.info(&format!(
        "tick complete; {} revision(s) still incomplete",
        incomplete.len()
    ));
    Ok(())
}

fn append_posted_log(path: &Path, bug: u64, revision: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening posted-bugs log {}", path.display()))?;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    writeln!(file, "{bug}|{revision}|{now}")
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use autoland_types::BuildStatus;
    use chrono::Duration as ChronoDuration;

    use crate::report::NullReporter;
    use crate::testutil::{Harness, harness};

    use super::*;

    fn record(
        revision: &str,
        builder: &str,
        result: BuildResult,
        comments: &str,
        finished_ago: Option<ChronoDuration>,
    ) -> BuildRecord {
        BuildRecord {
            build_id: 0,
            branch: "try".into(),
            revision: revision.into(),
            buildername: builder.into(),
            result,
            status: BuildStatus::Complete,
            comments: comments.into(),
            author: Some("alice@example.org".into()),
            finish_time: finished_ago.map(|ago| Utc::now() - ago),
        }
    }

    const TRY_COMMENT: &str = "try: -b do -p all --post-to-bugzilla bug 1001";

    fn old() -> Option<ChronoDuration> {
        Some(ChronoDuration::hours(1))
    }

    fn no_retrigger(_: &BuildRecord) -> AutolandResult<()> {
        panic!("retrigger not expected");
    }

    #[test]
    fn tally_counts_by_result() {
        let records = vec![
            record("r", "a", BuildResult::Success, "", old()),
            record("r", "b", BuildResult::Warnings, "", old()),
            record("r", "c", BuildResult::Failure, "", old()),
            record("r", "d", BuildResult::Other, "", old()),
        ];
        let counts = tally(&records);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.warnings, 1);
        assert_eq!(counts.failure, 1);
        assert_eq!(counts.other, 1);
        assert_eq!(counts.total, 4);
    }

    #[test]
    fn push_type_detection() {
        let try_records = vec![record("r", "a", BuildResult::Success, TRY_COMMENT, old())];
        assert_eq!(push_type(&try_records, true, 10), (PushType::Try, 10));
        assert_eq!(push_type(&try_records, false, 10), (PushType::Try, 10));

        // without the flag, flag_check discards the push
        let bare = vec![record("r", "a", BuildResult::Success, "try: -b do bug 1", old())];
        assert_eq!(push_type(&bare, true, 10).0, PushType::None);
        assert_eq!(push_type(&bare, false, 10).0, PushType::Try);

        let none = vec![record("r", "a", BuildResult::Success, "routine landing", old())];
        assert_eq!(push_type(&none, false, 10).0, PushType::None);
    }

    #[test]
    fn retry_oranges_parses_max_orange() {
        let with_n = vec![record(
            "r",
            "a",
            BuildResult::Success,
            "try: -b do --post-to-bugzilla bug 1 --retry-oranges 3",
            old(),
        )];
        assert_eq!(push_type(&with_n, false, 10), (PushType::Retry, 3));

        let with_zero = vec![record(
            "r", "a", BuildResult::Success,
            "try: -b do --retry-oranges 0 extra", old(),
        )];
        assert_eq!(push_type(&with_zero, false, 10), (PushType::Retry, 0));

        // bare flag, junk value, and negative value all keep the default
        for comments in [
            "try: -b do --retry-oranges",
            "try: -b do --retry-oranges lots",
            "try: -b do --retry-oranges -4",
        ] {
            let records = vec![record("r", "a", BuildResult::Success, comments, old())];
            assert_eq!(push_type(&records, false, 10), (PushType::Retry, 10));
        }
    }

    #[test]
    fn any_hard_failure_classifies_as_failure() {
        let records = vec![
            record("r", "a", BuildResult::Success, "", old()),
            record("r", "b", BuildResult::Success, "", old()),
            record("r", "c", BuildResult::Failure, "", old()),
        ];
        assert_eq!(
            classify_records(&records, 10, &mut no_retrigger),
            Verdict::Failure
        );
    }

    #[test]
    fn all_success_classifies_as_success() {
        let records = vec![
            record("r", "a", BuildResult::Success, "", old()),
            record("r", "b", BuildResult::Success, "", old()),
        ];
        assert_eq!(
            classify_records(&records, 0, &mut no_retrigger),
            Verdict::Success
        );
    }

    #[test]
    fn warnings_within_tolerance_classify_as_success() {
        let mut records = vec![record("r", "w1", BuildResult::Warnings, "", old())];
        for i in 0..10 {
            records.push(record("r", &format!("b{i}"), BuildResult::Success, "", old()));
        }
        assert_eq!(
            classify_records(&records, 2, &mut no_retrigger),
            Verdict::Success
        );
        // max_orange of zero tolerates nothing; unique name, no retries
        let mut calls = 0;
        let verdict = classify_records(&records, 0, &mut |_| {
            calls += 1;
            Ok(())
        });
        assert_eq!(verdict, Verdict::Retrying);
        assert_eq!(calls, 1);
    }

    #[test]
    fn oranges_above_tolerance_retrigger_then_retry_pairs_resolve() {
        // first observation: 4 success + 5 warnings over unique builders
        let mut records = vec![];
        for i in 0..4 {
            records.push(record("r", &format!("s{i}"), BuildResult::Success, "", old()));
        }
        for i in 0..5 {
            records.push(record("r", &format!("w{i}"), BuildResult::Warnings, "", old()));
        }
        let mut retriggered = Vec::new();
        let verdict = classify_records(&records, 2, &mut |record| {
            retriggered.push(record.buildername.clone());
            Ok(())
        });
        assert_eq!(verdict, Verdict::Retrying);
        assert_eq!(retriggered.len(), 5);

        // second observation: each orange builder ran twice and went green
        let mut second = vec![];
        for i in 0..5 {
            second.push(record("r", &format!("w{i}"), BuildResult::Warnings, "", old()));
            second.push(record("r", &format!("w{i}"), BuildResult::Success, "", old()));
        }
        assert_eq!(
            classify_records(&second, 2, &mut no_retrigger),
            Verdict::Success
        );
    }

    #[test]
    fn retry_pairs_still_orange_classify_as_failure() {
        // every retried builder stayed orange
        let mut records = vec![];
        for i in 0..3 {
            records.push(record("r", &format!("w{i}"), BuildResult::Warnings, "", old()));
            records.push(record("r", &format!("w{i}"), BuildResult::Warnings, "", old()));
        }
        // warnings=6, retry_count=3, 6-3=3 > max_orange=1
        assert_eq!(
            classify_records(&records, 1, &mut no_retrigger),
            Verdict::Failure
        );
    }

    #[test]
    fn failed_retrigger_classifies_as_failure() {
        let mut records = vec![record("r", "s", BuildResult::Success, "", old())];
        for i in 0..3 {
            records.push(record("r", &format!("w{i}"), BuildResult::Warnings, "", old()));
        }
        let verdict = classify_records(&records, 1, &mut |_| {
            Err(AutolandError::Transient("self-serve down".into()))
        });
        assert_eq!(verdict, Verdict::Failure);
    }

    #[test]
    fn empty_record_set_is_defensively_failure() {
        assert_eq!(classify_records(&[], 10, &mut no_retrigger), Verdict::Failure);
    }

    #[test]
    fn completeness_needs_old_finish_times() {
        let threshold = Duration::from_secs(600);
        let now = Utc::now();

        assert!(!is_complete(&[], now, threshold));

        let fresh = vec![record("r", "a", BuildResult::Success, "", Some(ChronoDuration::seconds(30)))];
        assert!(!is_complete(&fresh, now, threshold));

        let unfinished = vec![record("r", "a", BuildResult::Success, "", None)];
        assert!(!is_complete(&unfinished, now, threshold));

        let settled = vec![
            record("r", "a", BuildResult::Success, "", old()),
            record("r", "b", BuildResult::Success, "", old()),
        ];
        assert!(is_complete(&settled, now, threshold));
    }

    #[test]
    fn cache_lifecycle() {
        let td = tempfile::tempdir().expect("tempdir");
        let cache = RevisionCache::new(&td.path().join("cache"));

        assert_eq!(cache.load().expect("load"), (vec![], vec![]));
        assert!(cache.first_seen("8dc05498d708").expect("first seen").is_none());

        cache.append("8dc05498d708", "incomplete").expect("append");
        cache.append("8dc05498d708", "RETRYING").expect("append");
        let (incomplete, done) = cache.load().expect("load");
        assert_eq!(incomplete, vec!["8dc05498d708".to_string()]);
        assert!(done.is_empty());
        assert!(cache.first_seen("8dc05498d708").expect("first seen").is_some());

        cache.mark_done("8dc05498d708").expect("done");
        let (incomplete, done) = cache.load().expect("load");
        assert!(incomplete.is_empty());
        assert_eq!(done, vec!["8dc05498d708".to_string()]);
        assert!(cache.is_done("8dc05498d708"));

        assert!(cache.append("../evil", "x").is_err());
    }

    fn seed(h: &Harness, records: &[BuildRecord]) {
        let when = Utc::now() - ChronoDuration::hours(2);
        for record in records {
            h.services.build_store.insert_record(record, &when).expect("insert");
        }
    }

    fn opts(h: &Harness) -> ClassifierOptions {
        let mut opts = ClassifierOptions::from_config(&h.services.config.classifier);
        opts.branch = "try".into();
        opts
    }

    fn bind_result_queue(h: &Harness) {
        h.services
            .bus
            .bind(
                &h.services.config.bus.orchestrator_queue,
                crate::orchestrator::RESULT_ROUTING_KEY,
            )
            .expect("bind");
    }

    #[test]
    fn tolerated_warnings_post_success_and_seal_the_cache() {
        let h = harness();
        bind_result_queue(&h);
        let mut records = vec![record("8dc05498d708", "w", BuildResult::Warnings, TRY_COMMENT, old())];
        for i in 0..10 {
            records.push(record(
                "8dc05498d708",
                &format!("b{i}"),
                BuildResult::Success,
                TRY_COMMENT,
                old(),
            ));
        }
        seed(&h, &records);
        let mut o = opts(&h);
        o.flag_check = true;

        let outcome =
            poll_revision(&h.services, &o, "8dc05498d708", &mut NullReporter).expect("poll");

        assert_eq!(outcome.verdict, Some(Verdict::Success));
        assert!(outcome.posted);

        let cache = RevisionCache::new(&o.cache_dir);
        assert!(cache.is_done("8dc05498d708"));

        let posted = h.tracker.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, 1001);
        assert!(posted[0].1.contains("Try run for 8dc05498d708 is complete."));
        assert!(posted[0].1.contains("warnings: 1"));

        // completion message on the bus
        let queue = &h.services.config.bus.orchestrator_queue;
        assert_eq!(h.services.bus.depth(queue).expect("depth"), 1);
        let delivery = h.services.bus.receive(queue).expect("receive").expect("msg");
        assert_eq!(delivery.envelope.payload["type"], "SUCCESS");
        assert_eq!(delivery.envelope.payload["action"], "TRY.RUN");
        assert_eq!(delivery.envelope.payload["revision"], "8dc05498d708");
    }

    #[test]
    fn push_without_try_syntax_is_discarded_on_completion() {
        let h = harness();
        seed(
            &h,
            &[record("aaaa0000bbbb", "b", BuildResult::Success, "routine landing", old())],
        );

        let outcome =
            poll_revision(&h.services, &opts(&h), "aaaa0000bbbb", &mut NullReporter).expect("poll");
        assert!(outcome.discarded);
        assert!(h.tracker.posted().is_empty());
        assert!(RevisionCache::new(&opts(&h).cache_dir).is_done("aaaa0000bbbb"));
    }

    #[test]
    fn incomplete_revision_is_cached_for_the_next_tick() {
        let h = harness();
        seed(
            &h,
            &[record(
                "cccc0000dddd",
                "b",
                BuildResult::Success,
                TRY_COMMENT,
                Some(ChronoDuration::seconds(10)),
            )],
        );

        let outcome =
            poll_revision(&h.services, &opts(&h), "cccc0000dddd", &mut NullReporter).expect("poll");
        assert!(!outcome.complete);
        assert!(outcome.verdict.is_none());
        assert!(h.tracker.posted().is_empty());

        let cache = RevisionCache::new(&opts(&h).cache_dir);
        let (incomplete, _) = cache.load().expect("load");
        assert_eq!(incomplete, vec!["cccc0000dddd".to_string()]);
    }

    #[test]
    fn oranges_above_tolerance_retrigger_and_stay_cached() {
        let h = harness();
        // the push carries --retry-oranges 2: tolerance below the count
        let retry_comment = "try: -b do -p all --post-to-bugzilla bug 1001 --retry-oranges 2";
        let mut records = vec![];
        for i in 0..4 {
            records.push(record("eeee0000ffff", &format!("s{i}"), BuildResult::Success, retry_comment, old()));
        }
        for i in 0..5 {
            records.push(record("eeee0000ffff", &format!("w{i}"), BuildResult::Warnings, retry_comment, old()));
        }
        seed(&h, &records);

        let o = opts(&h);
        let outcome =
            poll_revision(&h.services, &o, "eeee0000ffff", &mut NullReporter).expect("poll");

        assert_eq!(outcome.verdict, None);
        assert!(!outcome.complete);
        assert_eq!(h.rebuild.calls().len(), 5);
        let cache = RevisionCache::new(&o.cache_dir);
        assert!(!cache.is_done("eeee0000ffff"));
        let (incomplete, _) = cache.load().expect("load");
        assert_eq!(incomplete, vec!["eeee0000ffff".to_string()]);
    }

    #[test]
    fn timed_out_revision_is_forced_terminal() {
        let h = harness();
        bind_result_queue(&h);
        // still-running record; the revision has been tracked too long
        seed(
            &h,
            &[record("feed0000beef", "b", BuildResult::Success, TRY_COMMENT, None)],
        );
        let o = opts(&h);
        let cache = RevisionCache::new(&o.cache_dir);
        // backdate the first-seen entry past the 12h ceiling
        fs::create_dir_all(&o.cache_dir).expect("mkdir");
        let first = (Utc::now() - ChronoDuration::hours(13))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        fs::write(o.cache_dir.join("feed0000beef"), format!("{first}|incomplete\n"))
            .expect("write");

        let outcome =
            poll_revision(&h.services, &o, "feed0000beef", &mut NullReporter).expect("poll");

        assert_eq!(outcome.verdict, Some(Verdict::TimedOut));
        assert!(outcome.posted);
        assert!(cache.is_done("feed0000beef"));
        let posted = h.tracker.posted();
        assert!(posted[0].1.contains("Timed out after"));

        let queue = &h.services.config.bus.orchestrator_queue;
        let delivery = h.services.bus.receive(queue).expect("receive").expect("msg");
        assert_eq!(delivery.envelope.payload["type"], "TIMED_OUT");
    }

    #[test]
    fn failed_post_keeps_the_revision_pending() {
        let h = harness();
        seed(
            &h,
            &[record("0123456789ab", "b", BuildResult::Success, TRY_COMMENT, old())],
        );
        h.tracker.fail_next_posts(1);

        let o = opts(&h);
        let outcome =
            poll_revision(&h.services, &o, "0123456789ab", &mut NullReporter).expect("poll");

        assert_eq!(outcome.verdict, Some(Verdict::Success));
        assert!(!outcome.posted);
        let cache = RevisionCache::new(&o.cache_dir);
        assert!(!cache.is_done("0123456789ab"));

        // next tick: the tracker is back and the comment goes out
        let outcome =
            poll_revision(&h.services, &o, "0123456789ab", &mut NullReporter).expect("poll");
        assert!(outcome.posted);
        assert!(cache.is_done("0123456789ab"));
    }

    #[test]
    fn duplicate_report_is_not_reposted() {
        let h = harness();
        seed(
            &h,
            &[record("0123456789ab", "b", BuildResult::Success, TRY_COMMENT, old())],
        );
        let o = opts(&h);
        let message = report_message(
            "0123456789ab",
            &h.services
                .build_store
                .records_for_revision("try", "0123456789ab")
                .expect("records"),
            "try",
            &h.services.config.classifier.results_url,
        );
        h.tracker.record_existing_comment(1001, &message);

        let outcome =
            poll_revision(&h.services, &o, "0123456789ab", &mut NullReporter).expect("poll");
        assert!(!outcome.posted);
        assert!(h.tracker.posted().is_empty());
        assert!(RevisionCache::new(&o.cache_dir).is_done("0123456789ab"));
    }

    #[test]
    fn dry_run_posts_and_writes_nothing() {
        let h = harness();
        seed(
            &h,
            &[record("0123456789ab", "b", BuildResult::Success, TRY_COMMENT, old())],
        );
        let mut o = opts(&h);
        o.dry_run = true;

        let outcome =
            poll_revision(&h.services, &o, "0123456789ab", &mut NullReporter).expect("poll");
        assert_eq!(outcome.verdict, Some(Verdict::Success));
        assert!(!outcome.posted);
        assert!(h.tracker.posted().is_empty());
        assert!(!RevisionCache::new(&o.cache_dir).is_done("0123456789ab"));
    }

    #[test]
    fn poll_range_unions_window_and_cache_and_skips_done() {
        let h = harness();
        let o = opts(&h);
        // in the window, complete, try-flagged
        seed(
            &h,
            &[record("1111aaaa2222", "b", BuildResult::Success, TRY_COMMENT, old())],
        );
        // not in the window, but tracked incomplete in the cache
        let cache = RevisionCache::new(&o.cache_dir);
        cache.append("3333bbbb4444", "incomplete").expect("append");
        seed(
            &h,
            &[record(
                "3333bbbb4444",
                "b",
                BuildResult::Success,
                TRY_COMMENT,
                Some(ChronoDuration::seconds(5)),
            )],
        );
        // sealed long ago; must not be polled again
        cache.mark_done("5555cccc6666").expect("done");

        let start = Utc::now() - ChronoDuration::hours(4);
        let end = Utc::now();
        let incomplete =
            poll_range(&h.services, &o, start, end, &mut NullReporter).expect("range");

        assert_eq!(incomplete, vec!["3333bbbb4444".to_string()]);
        assert!(cache.is_done("1111aaaa2222"));
        assert_eq!(h.tracker.posted().len(), 1);
    }

    #[test]
    fn run_once_takes_the_instance_lock() {
        let h = harness();
        let o = opts(&h);
        let _held = LockFile::acquire(&h.services.config.classifier.lock_dir).expect("lock");

        let err = run_once(&h.services, &o, None, None, None, &mut NullReporter).unwrap_err();
        assert!(err.to_string().contains("classifier instance"));
    }

    #[test]
    fn run_once_rejects_oversized_windows() {
        let h = harness();
        let o = opts(&h);
        let start = Utc::now() - ChronoDuration::hours(72);
        let err = run_once(
            &h.services,
            &o,
            None,
            Some(start),
            Some(Utc::now()),
            &mut NullReporter,
        )
        .unwrap_err();
        assert!(err.to_string().contains("polling interval too large"));
    }

    #[test]
    fn self_serve_client_accepts_redirect_responses() {
        use tiny_http::{Response, Server};
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let response = Response::from_string("").with_status_code(302);
                let _ = request.respond(response);
            }
        });

        let client =
            SelfServeClient::new(&format!("http://{addr}/self-serve"), "u", "p").expect("client");
        client.rebuild("try", 42).expect("rebuild");
    }
}
