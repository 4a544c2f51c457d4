//! Domain types for the autoland pipeline.
//!
//! This crate holds the records shared by the orchestrator, pusher, and
//! outcome classifier: branches, landing requests, patchsets, patches with
//! their review/approval flags, downstream build records, the bus payload
//! shapes, and the error taxonomy.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A person as known to the bug tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Result glyph on a review or approval flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagResult {
    #[serde(rename = "+")]
    Granted,
    #[serde(rename = "-")]
    Denied,
    #[serde(rename = "?")]
    Requested,
}

/// The review flavors the tracker knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewKind {
    #[serde(rename = "review")]
    Review,
    #[serde(rename = "superreview")]
    Super,
    #[serde(rename = "ui-review")]
    Ui,
}

impl ReviewKind {
    /// The commit-message credit tag for this review kind.
    pub fn credit_tag(&self) -> &'static str {
        match self {
            ReviewKind::Review => "r",
            ReviewKind::Super => "sr",
            ReviewKind::Ui => "ui-r",
        }
    }
}

/// One review flag on a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    #[serde(rename = "type")]
    pub kind: ReviewKind,
    pub reviewer: Person,
    pub result: FlagResult,
}

/// One approval flag on a patch. Approvals are tagged with the branch they
/// apply to (the `approval-<branch>` flag name, with the prefix stripped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    #[serde(rename = "type")]
    pub branch: String,
    pub approver: Person,
    pub result: FlagResult,
}

/// A concrete, non-obsolete patch attachment with its flags resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub id: u64,
    pub author: Person,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub approvals: Vec<Approval>,
}

impl Patch {
    /// Approvals tagged for `branch` that were granted.
    pub fn granted_approvals_for(&self, branch: &str) -> Vec<&Approval> {
        self.approvals
            .iter()
            .filter(|a| a.branch.trim().eq_ignore_ascii_case(branch) && a.result == FlagResult::Granted)
            .collect()
    }
}

/// A landing target. Branch rows are administered out of band and are
/// read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: i64,
    pub name: String,
    pub pull_url: String,
    pub push_url: String,
    pub display_name: Option<String>,
    pub enabled: bool,
    pub approval_required: bool,
    pub review_required: bool,
    pub add_try_commit: bool,
    pub use_tree_status: bool,
    /// Maximum number of in-flight patchsets before dispatch defers.
    pub threshold: u32,
}

/// Lifecycle of a landing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Preprocessed,
    Verified,
    Dispatched,
    Success,
    PushFailure,
    NotVerified,
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Preprocessed => "preprocessed",
            RequestStatus::Verified => "verified",
            RequestStatus::Dispatched => "dispatched",
            RequestStatus::Success => "success",
            RequestStatus::PushFailure => "push-failure",
            RequestStatus::NotVerified => "not-verified",
            RequestStatus::TimedOut => "timed-out",
        }
    }

    pub fn parse(s: &str) -> AutolandResult<Self> {
        match s {
            "preprocessed" => Ok(RequestStatus::Preprocessed),
            "verified" => Ok(RequestStatus::Verified),
            "dispatched" => Ok(RequestStatus::Dispatched),
            "success" => Ok(RequestStatus::Success),
            "push-failure" => Ok(RequestStatus::PushFailure),
            "not-verified" => Ok(RequestStatus::NotVerified),
            "timed-out" => Ok(RequestStatus::TimedOut),
            other => Err(AutolandError::InvalidInput(format!(
                "unknown request status: {other}"
            ))),
        }
    }

    /// A request reaches a terminal status exactly once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Success
                | RequestStatus::PushFailure
                | RequestStatus::NotVerified
                | RequestStatus::TimedOut
        )
    }
}

/// A developer's flagged intent to land one or more attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub bug_id: u64,
    pub branches: Vec<String>,
    pub patches: Vec<u64>,
    /// Source timestamp from the tracker; (bug_id, status_when) identifies
    /// a request across re-discovery.
    pub status_when: DateTime<Utc>,
    pub try_syntax: Option<String>,
    pub status: RequestStatus,
    pub dispatch_id: Option<String>,
}

/// Lifecycle of one (request, branch) unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchsetStatus {
    Queued,
    InProgress,
    Pushed,
    PushFailed,
}

impl PatchsetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchsetStatus::Queued => "queued",
            PatchsetStatus::InProgress => "in-progress",
            PatchsetStatus::Pushed => "pushed",
            PatchsetStatus::PushFailed => "push-failed",
        }
    }

    pub fn parse(s: &str) -> AutolandResult<Self> {
        match s {
            "queued" => Ok(PatchsetStatus::Queued),
            "in-progress" => Ok(PatchsetStatus::InProgress),
            "pushed" => Ok(PatchsetStatus::Pushed),
            "push-failed" => Ok(PatchsetStatus::PushFailed),
            other => Err(AutolandError::InvalidInput(format!(
                "unknown patchset status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PatchsetStatus::Pushed | PatchsetStatus::PushFailed)
    }
}

/// The unit of work for a single (request, branch): an ordered list of
/// patches destined for that branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patchset {
    pub id: i64,
    pub request_id: i64,
    pub bug_id: u64,
    pub branch: String,
    pub patches: Vec<u64>,
    pub status_when: DateTime<Utc>,
    pub try_syntax: Option<String>,
    pub try_run: bool,
    /// The landing user: who flagged the request, and the identity the
    /// push is performed under.
    pub author: String,
    pub status: PatchsetStatus,
    pub revision: Option<String>,
    pub push_time: Option<DateTime<Utc>>,
}

/// Result bucket of a downstream build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Other,
}

impl BuildResult {
    /// Lossy mapping from the build store's result strings; anything
    /// unrecognized lands in `Other`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "success" => BuildResult::Success,
            "warnings" => BuildResult::Warnings,
            "failure" => BuildResult::Failure,
            "skipped" => BuildResult::Skipped,
            "exception" => BuildResult::Exception,
            _ => BuildResult::Other,
        }
    }
}

/// Scheduling state of a downstream build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Complete,
    Cancelled,
    Interrupted,
    Misc,
}

impl BuildStatus {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" => BuildStatus::Pending,
            "running" => BuildStatus::Running,
            "complete" => BuildStatus::Complete,
            "cancelled" => BuildStatus::Cancelled,
            "interrupted" => BuildStatus::Interrupted,
            _ => BuildStatus::Misc,
        }
    }
}

/// One row from the downstream build store, keyed by revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: i64,
    pub branch: String,
    pub revision: String,
    pub buildername: String,
    pub result: BuildResult,
    pub status: BuildStatus,
    /// Push comments; the classifier scans these for a `try:` line.
    pub comments: String,
    pub author: Option<String>,
    pub finish_time: Option<DateTime<Utc>>,
}

/// Job payload consumed by the pusher (routing key `hgpusher`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobMessage {
    Patchset(PatchsetJob),
}

/// One (patchset, branch) unit of push work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchsetJob {
    pub bug_id: u64,
    pub branch: String,
    pub branch_url: String,
    pub push_url: String,
    pub try_run: bool,
    #[serde(default)]
    pub try_syntax: Option<String>,
    pub patchsetid: i64,
    /// The landing user: the identity the push is performed under.
    pub user: String,
    /// Whether the final destination is a real branch (as opposed to a
    /// throwaway try push). Controls header strictness, force-push, and the
    /// retry-oranges flag on the try commit.
    #[serde(default)]
    pub to_branch: bool,
    pub patches: Vec<Patch>,
}

/// Reply / completion message consumed by the orchestrator (routing key `db`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub action: ResultAction,
    pub bug_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchsetid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "TIMED_OUT")]
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultAction {
    #[serde(rename = "TRY.PUSH")]
    TryPush,
    #[serde(rename = "BRANCH.PUSH")]
    BranchPush,
    #[serde(rename = "PATCHSET.APPLY")]
    PatchsetApply,
    #[serde(rename = "TRY.RUN")]
    TryRun,
}

/// The error taxonomy shared across the pipeline.
///
/// `Transient`, `Conflict`, and `TreeClosed` are retried within configured
/// budgets; everything else aborts the affected unit immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutolandError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("tree closed: {0}")]
    TreeClosed(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AutolandError {
    /// Whether the pusher's escalation ladder (or a transport retry budget)
    /// should take another attempt at the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AutolandError::Transient(_) | AutolandError::Conflict(_) | AutolandError::TreeClosed(_)
        )
    }
}

pub type AutolandResult<T> = Result<T, AutolandError>;

/// Parse the free-form branches field of a landing request: split on
/// whitespace and commas, drop empties, de-duplicate, and sort for
/// reproducibility.
pub fn parse_branches(line: &str) -> Vec<String> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Join an id list the way the store persists it.
pub fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Inverse of [`join_ids`]. The list is ordered and total: a malformed
/// token is a hard error, not a partial result.
pub fn parse_ids(s: &str) -> AutolandResult<Vec<u64>> {
    s.split(',')
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.trim()
                .parse::<u64>()
                .map_err(|_| AutolandError::InvalidInput(format!("bad id in list: {t:?}")))
        })
        .collect()
}

/// Join a branch list the way the store persists it.
pub fn join_branches(branches: &[String]) -> String {
    branches.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_result_uses_glyphs_on_the_wire() {
        assert_eq!(serde_json::to_string(&FlagResult::Granted).unwrap(), "\"+\"");
        assert_eq!(serde_json::to_string(&FlagResult::Denied).unwrap(), "\"-\"");
        assert_eq!(serde_json::to_string(&FlagResult::Requested).unwrap(), "\"?\"");

        let parsed: FlagResult = serde_json::from_str("\"+\"").unwrap();
        assert_eq!(parsed, FlagResult::Granted);
    }

    #[test]
    fn unknown_flag_glyph_is_rejected() {
        let parsed: Result<FlagResult, _> = serde_json::from_str("\"!\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn review_kind_credit_tags() {
        assert_eq!(ReviewKind::Review.credit_tag(), "r");
        assert_eq!(ReviewKind::Super.credit_tag(), "sr");
        assert_eq!(ReviewKind::Ui.credit_tag(), "ui-r");
    }

    #[test]
    fn parse_branches_cleans_and_sorts() {
        assert_eq!(
            parse_branches("beta, central  try,beta"),
            vec!["beta".to_string(), "central".to_string(), "try".to_string()]
        );
    }

    #[test]
    fn parse_branches_empty_and_whitespace() {
        assert!(parse_branches("").is_empty());
        assert!(parse_branches("  \t ,, ").is_empty());
    }

    #[test]
    fn request_status_round_trips() {
        for status in [
            RequestStatus::Preprocessed,
            RequestStatus::Verified,
            RequestStatus::Dispatched,
            RequestStatus::Success,
            RequestStatus::PushFailure,
            RequestStatus::NotVerified,
            RequestStatus::TimedOut,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RequestStatus::parse("bogus").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RequestStatus::Preprocessed.is_terminal());
        assert!(!RequestStatus::Dispatched.is_terminal());
        assert!(RequestStatus::Success.is_terminal());
        assert!(RequestStatus::NotVerified.is_terminal());
        assert!(RequestStatus::TimedOut.is_terminal());

        assert!(!PatchsetStatus::Queued.is_terminal());
        assert!(!PatchsetStatus::InProgress.is_terminal());
        assert!(PatchsetStatus::Pushed.is_terminal());
        assert!(PatchsetStatus::PushFailed.is_terminal());
    }

    #[test]
    fn id_lists_round_trip() {
        let ids = vec![500, 42, 7];
        assert_eq!(join_ids(&ids), "500,42,7");
        assert_eq!(parse_ids("500,42,7").unwrap(), ids);
        assert!(parse_ids("").unwrap().is_empty());
        assert!(parse_ids("1,x,3").is_err());
    }

    #[test]
    fn job_message_round_trips_and_tolerates_unknown_keys() {
        let raw = r#"{
            "job_type": "patchset",
            "bug_id": 12345,
            "branch": "central",
            "branch_url": "https://hg.example.org/central",
            "push_url": "ssh://hg.example.org/central",
            "try_run": false,
            "try_syntax": null,
            "patchsetid": 42,
            "user": "dev@example.org",
            "to_branch": true,
            "some_future_field": 1,
            "patches": [{
                "id": 54321,
                "author": {"name": "Name", "email": "me@example.org"},
                "reviews": [{
                    "type": "superreview",
                    "reviewer": {"name": "Rev", "email": "rev@example.org"},
                    "result": "+"
                }],
                "approvals": [{
                    "type": "beta",
                    "approver": {"name": "App", "email": "app@example.org"},
                    "result": "+"
                }]
            }]
        }"#;
        let JobMessage::Patchset(job) = serde_json::from_str(raw).unwrap();
        assert_eq!(job.bug_id, 12345);
        assert_eq!(job.patches.len(), 1);
        assert_eq!(job.patches[0].reviews[0].kind, ReviewKind::Super);
        assert!(job.to_branch);

        let encoded = serde_json::to_value(JobMessage::Patchset(job)).unwrap();
        assert_eq!(encoded["job_type"], "patchset");
    }

    #[test]
    fn job_message_missing_required_key_fails() {
        let raw = r#"{"job_type": "patchset", "bug_id": 1}"#;
        let parsed: Result<JobMessage, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn result_message_wire_shape() {
        let msg = ResultMessage {
            kind: ResultKind::Success,
            action: ResultAction::TryPush,
            bug_id: 1001,
            patchsetid: Some(7),
            revision: Some("8dc05498d708".to_string()),
            comment: None,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "SUCCESS");
        assert_eq!(v["action"], "TRY.PUSH");
        assert!(v.get("comment").is_none());

        let back: ResultMessage = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn timed_out_result_kind_spelling() {
        assert_eq!(
            serde_json::to_string(&ResultKind::TimedOut).unwrap(),
            "\"TIMED_OUT\""
        );
        assert_eq!(
            serde_json::to_string(&ResultAction::PatchsetApply).unwrap(),
            "\"PATCHSET.APPLY\""
        );
    }

    #[test]
    fn build_result_lossy_parse() {
        assert_eq!(BuildResult::from_str_lossy("Success"), BuildResult::Success);
        assert_eq!(BuildResult::from_str_lossy("warnings"), BuildResult::Warnings);
        assert_eq!(BuildResult::from_str_lossy("weird"), BuildResult::Other);
        assert_eq!(BuildStatus::from_str_lossy("COMPLETE"), BuildStatus::Complete);
        assert_eq!(BuildStatus::from_str_lossy("??"), BuildStatus::Misc);
    }

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(AutolandError::Transient("net".into()).is_retryable());
        assert!(AutolandError::Conflict("apply".into()).is_retryable());
        assert!(AutolandError::TreeClosed("central".into()).is_retryable());
        assert!(!AutolandError::PermissionDenied("who".into()).is_retryable());
        assert!(!AutolandError::InvalidInput("hdr".into()).is_retryable());
        assert!(!AutolandError::NotFound("branch".into()).is_retryable());
    }

    #[test]
    fn granted_approvals_filter_by_branch_tag() {
        let approve = |branch: &str, result| Approval {
            branch: branch.to_string(),
            approver: Person {
                name: "App".into(),
                email: "app@example.org".into(),
            },
            result,
        };
        let patch = Patch {
            id: 1,
            author: Person {
                name: "Dev".into(),
                email: "dev@example.org".into(),
            },
            reviews: vec![],
            approvals: vec![
                approve("beta", FlagResult::Granted),
                approve("release", FlagResult::Granted),
                approve("beta", FlagResult::Denied),
            ],
        };
        let granted = patch.granted_approvals_for("beta");
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].branch, "beta");
    }
}
