//! Bug tracker client for the autoland pipeline.
//!
//! Talks to the tracker's REST API (bug bodies, attachments, comments) and
//! to the private autoland RPC endpoint that lists waiting landing requests
//! and mutates per-attachment queue status. All transport goes through a
//! bounded retry budget; callers see the shared error taxonomy instead of
//! raw HTTP failures.
//!
//! The [`Tracker`] trait is the seam the orchestrator, pusher, and
//! classifier are written against; tests substitute fakes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use autoland_retry::{RetryExecutor, RetryStrategyConfig};
use autoland_types::{
    Approval, AutolandError, AutolandResult, FlagResult, Patch, Person, Review, ReviewKind,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A bug body as the pipeline needs it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BugData {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentData>,
}

/// One attachment row from a bug body. Unknown keys are tolerated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentData {
    pub id: u64,
    #[serde(default)]
    pub is_patch: bool,
    #[serde(default)]
    pub is_obsolete: bool,
    #[serde(default)]
    pub attacher: Option<FlagSetter>,
    #[serde(default)]
    pub flags: Vec<FlagData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub setter: Option<FlagSetter>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagSetter {
    #[serde(default)]
    pub name: String,
}

/// One waiting attachment inside an autoland RPC row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaitingAttachment {
    pub id: u64,
    #[serde(default)]
    pub who: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_when: String,
}

/// One waiting landing request from the autoland RPC.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaitingRequest {
    pub bug_id: u64,
    #[serde(default)]
    pub branches: String,
    #[serde(default)]
    pub try_syntax: Option<String>,
    #[serde(default)]
    pub status_when: String,
    #[serde(default)]
    pub attachments: Vec<WaitingAttachment>,
}

impl WaitingRequest {
    /// Ids of the attachments the developer actually flagged.
    pub fn waiting_patch_ids(&self) -> Vec<u64> {
        self.attachments
            .iter()
            .filter(|a| a.status == "waiting")
            .map(|a| a.id)
            .collect()
    }

    /// The landing user: whoever flagged the first waiting attachment.
    pub fn landing_user(&self) -> Option<&str> {
        self.attachments
            .iter()
            .find(|a| a.status == "waiting")
            .map(|a| a.who.as_str())
    }
}

/// Parse the tracker's `%Y-%m-%dT%H:%M:%SZ` timestamps.
pub fn parse_tracker_time(s: &str) -> AutolandResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .map(|naive| naive.and_utc())
        .map_err(|_| AutolandError::InvalidInput(format!("bad tracker timestamp: {s:?}")))
}

/// Find things that look like bug references in comment text and return
/// the bug numbers. Supported: `Bug NNN`, `Bugs NNN, NNN`, `bNNN`.
pub fn bugs_from_comments(comments: &str) -> Vec<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\bb(?:ug(?:s)?)?\s*((?:\d+[, ]*)+)").expect("bug regex")
    });
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").expect("digits regex"));

    let mut bugs = Vec::new();
    if let Some(caps) = re.captures(comments) {
        for m in digits.find_iter(&caps[1]) {
            if let Ok(n) = m.as_str().parse() {
                bugs.push(n);
            }
        }
    }
    bugs
}

/// The tracker operations the pipeline depends on.
pub trait Tracker {
    fn bug(&self, bug_id: u64) -> AutolandResult<BugData>;

    /// Resolve the requested patch ids on a bug to concrete, non-obsolete
    /// patches with their review and approval flags. The returned list
    /// preserves the requested order; partial retrieval is a hard failure.
    fn patches(&self, bug_id: u64, patch_ids: &[u64]) -> AutolandResult<Vec<Patch>>;

    /// Download a patch body to `<dir>/<id>.patch`.
    fn download_patch(&self, patch_id: u64, dir: &Path) -> AutolandResult<PathBuf>;

    fn post_comment(&self, bug_id: u64, text: &str) -> AutolandResult<()>;

    /// Whether the bug already carries a comment with exactly this text.
    fn has_comment(&self, bug_id: u64, text: &str) -> AutolandResult<bool>;

    /// Landing requests currently flagged "waiting".
    fn waiting_requests(&self) -> AutolandResult<Vec<WaitingRequest>>;

    /// Set the autoland queue status of the given attachments.
    fn update_status(&self, status: &str, patch_ids: &[u64]) -> AutolandResult<()>;

    /// Drop the given attachments from the autoland queue.
    fn remove_from_queue(&self, patch_ids: &[u64]) -> AutolandResult<()>;
}

/// Connection settings for [`BugzillaClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BugzillaConfig {
    pub api_url: String,
    pub attachment_url: String,
    pub webui_url: String,
    pub username: String,
    pub password: String,
    pub webui_login: String,
    pub webui_password: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BugzillaConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            attachment_url: String::new(),
            webui_url: String::new(),
            username: String::new(),
            password: String::new(),
            webui_login: String::new(),
            webui_password: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Blocking tracker client with a transport retry budget.
pub struct BugzillaClient {
    config: BugzillaConfig,
    client: reqwest::blocking::Client,
    retry: RetryStrategyConfig,
}

impl BugzillaClient {
    pub fn new(config: BugzillaConfig) -> AutolandResult<Self> {
        Self::with_retry(config, autoland_retry::RetryBudget::Transport.to_config())
    }

    /// Like [`new`](Self::new) with an explicit retry budget (tests use an
    /// immediate one).
    pub fn with_retry(config: BugzillaConfig, retry: RetryStrategyConfig) -> AutolandResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AutolandError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            config,
            client,
            retry,
        })
    }

    fn retrying<T>(
        &self,
        mut op: impl FnMut() -> AutolandResult<T>,
    ) -> AutolandResult<T> {
        RetryExecutor::new(self.retry.clone()).run_if(|_| op(), AutolandError::is_retryable)
    }

    fn classify_status(status: reqwest::StatusCode, url: &str) -> AutolandError {
        if status == reqwest::StatusCode::NOT_FOUND {
            AutolandError::NotFound(format!("{url}: {status}"))
        } else if status.is_client_error() {
            AutolandError::InvalidInput(format!("{url}: {status}"))
        } else {
            AutolandError::Transient(format!("{url}: {status}"))
        }
    }

    fn get_json(&self, url: &str) -> AutolandResult<serde_json::Value> {
        self.retrying(|| {
            let response = self
                .client
                .get(url)
                .query(&[
                    ("username", self.config.username.as_str()),
                    ("password", self.config.password.as_str()),
                ])
                .header("Accept", "application/json")
                .send()
                .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Self::classify_status(status, url));
            }
            response
                .json()
                .map_err(|e| AutolandError::InvalidInput(format!("{url}: bad json: {e}")))
        })
    }

    fn post_json(&self, url: &str, body: &serde_json::Value) -> AutolandResult<serde_json::Value> {
        self.retrying(|| {
            let response = self
                .client
                .post(url)
                .query(&[
                    ("username", self.config.username.as_str()),
                    ("password", self.config.password.as_str()),
                ])
                .json(body)
                .send()
                .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Self::classify_status(status, url));
            }
            response
                .json()
                .or_else(|_| Ok(serde_json::Value::Null))
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// Resolve a tracker login to a person. Logins without a profile keep
    /// the login as both name and email.
    pub fn user(&self, login: &str) -> AutolandResult<Person> {
        let value = self.get_json(&self.api(&format!("/user/{login}")))?;
        let name = value
            .get("real_name")
            .and_then(|v| v.as_str())
            // drop any "[:ircnick]" tail off the real name
            .map(|n| n.split(" [").next().unwrap_or(n).trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| login.to_string());
        let email = value
            .get("email")
            .and_then(|v| v.as_str())
            .unwrap_or(login)
            .to_string();
        Ok(Person { name, email })
    }

    fn glyph(&self, status: &str, what: &str) -> AutolandResult<FlagResult> {
        match status {
            "+" => Ok(FlagResult::Granted),
            "-" => Ok(FlagResult::Denied),
            "?" => Ok(FlagResult::Requested),
            other => Err(AutolandError::InvalidInput(format!(
                "unknown {what} status glyph: {other:?}"
            ))),
        }
    }

    fn reviews(&self, attachment: &AttachmentData) -> AutolandResult<Vec<Review>> {
        let mut reviews = Vec::new();
        for flag in &attachment.flags {
            let kind = match flag.name.as_str() {
                "review" => ReviewKind::Review,
                "superreview" => ReviewKind::Super,
                "ui-review" => ReviewKind::Ui,
                _ => continue,
            };
            let setter = flag
                .setter
                .as_ref()
                .ok_or_else(|| AutolandError::InvalidInput("review flag without setter".into()))?;
            reviews.push(Review {
                kind,
                reviewer: self.user(&setter.name)?,
                result: self.glyph(&flag.status, "review")?,
            });
        }
        Ok(reviews)
    }

    fn approvals(&self, attachment: &AttachmentData) -> AutolandResult<Vec<Approval>> {
        let mut approvals = Vec::new();
        for flag in &attachment.flags {
            let Some(branch) = flag.name.strip_prefix("approval-") else {
                continue;
            };
            let setter = flag
                .setter
                .as_ref()
                .ok_or_else(|| AutolandError::InvalidInput("approval flag without setter".into()))?;
            approvals.push(Approval {
                branch: branch.to_string(),
                approver: self.user(&setter.name)?,
                result: self.glyph(&flag.status, "approval")?,
            });
        }
        Ok(approvals)
    }

    fn rpc(&self, body: serde_json::Value) -> AutolandResult<serde_json::Value> {
        let value = self.post_json(&self.config.webui_url, &body)?;
        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            return Err(AutolandError::Transient(format!("autoland rpc error: {err}")));
        }
        Ok(value)
    }

    fn update_attachment(&self, params: serde_json::Value) -> AutolandResult<()> {
        let mut params = params;
        params["Bugzilla_login"] = self.config.webui_login.clone().into();
        params["Bugzilla_password"] = self.config.webui_password.clone().into();
        self.rpc(serde_json::json!({
            "method": "TryAutoLand.update",
            "version": 1.1,
            "params": params,
        }))
        .map(|_| ())
    }
}

impl Tracker for BugzillaClient {
    fn bug(&self, bug_id: u64) -> AutolandResult<BugData> {
        let value = self.get_json(&self.api(&format!("/bug/{bug_id}")))?;
        serde_json::from_value(value)
            .map_err(|e| AutolandError::InvalidInput(format!("bug {bug_id}: bad body: {e}")))
    }

    fn patches(&self, bug_id: u64, patch_ids: &[u64]) -> AutolandResult<Vec<Patch>> {
        let bug = self.bug(bug_id)?;
        let mut patches = Vec::with_capacity(patch_ids.len());
        let mut missing = Vec::new();

        for &patch_id in patch_ids {
            let found = bug
                .attachments
                .iter()
                .find(|a| a.id == patch_id && a.is_patch && !a.is_obsolete);
            let Some(attachment) = found else {
                missing.push(patch_id);
                continue;
            };
            let attacher = attachment
                .attacher
                .as_ref()
                .ok_or_else(|| AutolandError::InvalidInput("attachment without attacher".into()))?;
            patches.push(Patch {
                id: attachment.id,
                author: self.user(&attacher.name)?,
                reviews: self.reviews(attachment)?,
                approvals: self.approvals(attachment)?,
            });
        }

        if !missing.is_empty() {
            // Landing a subset the developer did not ask for is worse than
            // landing nothing.
            return Err(AutolandError::InvalidInput(format!(
                "patches {missing:?} do not exist on bug {bug_id}, or are not valid patches"
            )));
        }
        Ok(patches)
    }

    fn download_patch(&self, patch_id: u64, dir: &Path) -> AutolandResult<PathBuf> {
        let url = format!("{}{patch_id}", self.config.attachment_url);
        let body = self.retrying(|| {
            let response = self
                .client
                .get(&url)
                .send()
                .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Self::classify_status(status, &url));
            }
            response
                .text()
                .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))
        })?;

        if body.contains(&format!("The attachment id {patch_id} is invalid")) {
            return Err(AutolandError::InvalidInput(format!(
                "invalid attachment {patch_id}"
            )));
        }

        fs::create_dir_all(dir)
            .map_err(|e| AutolandError::Internal(format!("creating {}: {e}", dir.display())))?;
        let path = dir.join(format!("{patch_id}.patch"));
        fs::write(&path, body)
            .map_err(|e| AutolandError::Internal(format!("writing {}: {e}", path.display())))?;
        Ok(path)
    }

    fn post_comment(&self, bug_id: u64, text: &str) -> AutolandResult<()> {
        self.post_json(
            &self.api(&format!("/bug/{bug_id}/comment")),
            &serde_json::json!({ "text": text, "is_private": false }),
        )
        .map(|_| ())
    }

    fn has_comment(&self, bug_id: u64, text: &str) -> AutolandResult<bool> {
        let value = self.get_json(&self.api(&format!("/bug/{bug_id}/comment")))?;
        let comments = value
            .get("comments")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(comments
            .iter()
            .any(|c| c.get("text").and_then(|t| t.as_str()) == Some(text)))
    }

    fn waiting_requests(&self) -> AutolandResult<Vec<WaitingRequest>> {
        let value = self.rpc(serde_json::json!({
            "method": "TryAutoLand.getBugs",
            "Bugzilla_login": self.config.webui_login,
            "Bugzilla_password": self.config.webui_password,
        }))?;
        let result = value.get("result").cloned().unwrap_or_default();
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| AutolandError::InvalidInput(format!("bad getBugs result: {e}")))
    }

    fn update_status(&self, status: &str, patch_ids: &[u64]) -> AutolandResult<()> {
        for &patch_id in patch_ids {
            self.update_attachment(serde_json::json!({
                "action": "status",
                "status": status,
                "attach_id": patch_id,
            }))?;
        }
        Ok(())
    }

    fn remove_from_queue(&self, patch_ids: &[u64]) -> AutolandResult<()> {
        for &patch_id in patch_ids {
            self.update_attachment(serde_json::json!({
                "action": "remove",
                "attach_id": patch_id,
            }))?;
        }
        Ok(())
    }
}
