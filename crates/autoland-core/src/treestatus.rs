//! Tree-status gate.
//!
//! Branches can opt into an external tree-status flag; a closed tree
//! refuses landings. Dispatch polls the status endpoint and retries a
//! closed tree on a configured interval up to a configured attempt count;
//! exhaustion is a terminal failure for the unit being dispatched.

use std::time::Duration;

use autoland_retry::{RetryExecutor, RetryStrategyConfig};
use autoland_types::{AutolandError, AutolandResult};

use crate::config::TreeStatusConfig;
use crate::report::Reporter;

/// State of a branch's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Open,
    Closed,
    ApprovalRequired,
}

impl TreeState {
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "closed" => TreeState::Closed,
            "approval required" => TreeState::ApprovalRequired,
            _ => TreeState::Open,
        }
    }

    /// Only a closed tree refuses landings.
    pub fn is_closed(&self) -> bool {
        matches!(self, TreeState::Closed)
    }
}

/// Where tree status comes from; tests substitute fakes.
pub trait TreeStatusSource {
    fn status(&self, branch: &str) -> AutolandResult<TreeState>;
}

/// The production HTTP source (`<url><branch>?format=json`).
pub struct HttpTreeStatus {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpTreeStatus {
    pub fn new(url: &str) -> AutolandResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AutolandError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

impl TreeStatusSource for HttpTreeStatus {
    fn status(&self, branch: &str) -> AutolandResult<TreeState> {
        let url = format!("{}{branch}?format=json", self.url);
        let value: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?
            .error_for_status()
            .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?
            .json()
            .map_err(|e| AutolandError::InvalidInput(format!("{url}: bad json: {e}")))?;
        let status = value
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("open");
        Ok(TreeState::from_status(status))
    }
}

/// Block until the tree opens, retrying a closed tree on the configured
/// interval. Exhaustion (and any status-endpoint failure) is an error.
pub fn wait_for_open(
    source: &dyn TreeStatusSource,
    branch: &str,
    config: &TreeStatusConfig,
    reporter: &mut dyn Reporter,
) -> AutolandResult<()> {
    let budget = RetryStrategyConfig::constant(config.max_attempts.max(1), config.retry_interval);
    RetryExecutor::new(budget).run_if(
        |attempt| match source.status(branch)? {
            state if state.is_closed() => {
                reporter.warn(&format!(
                    "tree {branch} is closed (attempt {attempt}/{})",
                    config.max_attempts
                ));
                Err(AutolandError::TreeClosed(format!(
                    "branch {branch} is closed"
                )))
            }
            _ => Ok(()),
        },
        |e| matches!(e, AutolandError::TreeClosed(_)),
    )
}
