//! Configuration for the autoland pipeline (`autoland.toml`).
//!
//! Every process accepts `--config-file` one or more times; files are
//! merged in order, later values overriding earlier ones, and the merged
//! table is deserialized with defaults for anything left unset. Durations
//! are written human-readable (`4h`, `10m`, `5s`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use autoland_bugzilla::BugzillaConfig;
use autoland_directory::DirectoryConfig;
use autoland_hg::SshIdentity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: BugzillaConfig,
    pub directory: DirectoryConfig,
    pub treestatus: TreeStatusConfig,
    pub hg: HgConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub orchestrator: OrchestratorConfig,
    pub pusher: PusherConfig,
    pub classifier: ClassifierConfig,
}

/// Tree-status endpoint and the closure retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeStatusConfig {
    pub url: String,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl Default for TreeStatusConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            retry_interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HgConfig {
    pub ssh_user: Option<String>,
    pub ssh_key: Option<PathBuf>,
    /// Default try syntax when a request carries none.
    pub try_syntax: String,
    /// Staging deployments keep results off the production tracker.
    pub staging: bool,
}

impl Default for HgConfig {
    fn default() -> Self {
        Self {
            ssh_user: None,
            ssh_key: None,
            try_syntax: "-b do -p all -u all -t none".into(),
            staging: false,
        }
    }
}

impl HgConfig {
    pub fn ssh_identity(&self) -> Option<SshIdentity> {
        if self.ssh_user.is_none() && self.ssh_key.is_none() {
            return None;
        }
        Some(SshIdentity {
            user: self.ssh_user.clone(),
            key: self.ssh_key.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub root: PathBuf,
    pub exchange: String,
    /// Queue bound to routing key `db`.
    pub orchestrator_queue: String,
    /// Queue bound to routing key `hgpusher`.
    pub pusher_queue: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".autoland/bus"),
            exchange: "autoland".into(),
            orchestrator_queue: "autoland".into(),
            pusher_queue: "hgpusher".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// The downstream build store (read-only).
    pub build_db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".autoland/autoland.db"),
            build_db_path: PathBuf::from(".autoland/scheduler.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Comment posting gives up after this many failed attempts.
    pub comment_attempts: u32,
    pub failed_comments_log: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            comment_attempts: 5,
            failed_comments_log: PathBuf::from("failed_comments.log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PusherConfig {
    /// Numbered working directories (`pusher.N`) live under here.
    pub work_dir: PathBuf,
    /// Attempts per job, with escalating cleanup between them.
    pub attempts: u32,
    /// Results dashboard base URL for monitor links in comments.
    pub results_url: String,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".autoland/work"),
            attempts: 3,
            results_url: "https://tbpl.mozilla.org/".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub branch: String,
    pub cache_dir: PathBuf,
    /// Lock directory guarding the single classifier instance.
    pub lock_dir: PathBuf,
    /// Default polling window when no explicit time range is given.
    #[serde(with = "humantime_serde")]
    pub poll_window: Duration,
    /// Largest allowed explicit time range.
    #[serde(with = "humantime_serde")]
    pub max_poll_window: Duration,
    /// Wall-clock ceiling before a tracked revision is forced TIMED_OUT.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Records younger than this may still grow late follow-on tests.
    #[serde(with = "humantime_serde")]
    pub completion_threshold: Duration,
    /// Tolerated unresolved warnings per push.
    pub max_orange: u32,
    /// Downstream self-serve API for retriggers.
    pub self_serve_url: String,
    pub self_serve_user: String,
    pub self_serve_password: String,
    /// Append-only log of (bug, revision) pairs already reported.
    pub posted_bugs: PathBuf,
    pub results_url: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            branch: "try".into(),
            cache_dir: PathBuf::from("cache"),
            lock_dir: PathBuf::from(".autoland/classifier"),
            poll_window: Duration::from_secs(4 * 3600),
            max_poll_window: Duration::from_secs(48 * 3600),
            timeout: Duration::from_secs(12 * 3600),
            completion_threshold: Duration::from_secs(600),
            max_orange: 10,
            self_serve_url: String::new(),
            self_serve_user: String::new(),
            self_serve_password: String::new(),
            posted_bugs: PathBuf::from("postedbugs.log"),
            results_url: "https://tbpl.mozilla.org/".into(),
        }
    }
}

impl Config {
    /// Load and merge one or more config files, later files winning. With
    /// no files, everything takes its default.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in paths {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let value: toml::Value = text
                .parse()
                .with_context(|| format!("parsing config {}", path.display()))?;
            merge(&mut merged, value);
        }
        merged
            .try_into()
            .context("deserializing merged configuration")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        Self::load(&[path.to_path_buf()])
    }
}

/// Recursive table merge; scalar and array values in `overlay` replace
/// those in `base`.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn defaults_match_the_documented_intervals() {
        let config = Config::load(&[]).expect("load");
        assert_eq!(config.orchestrator.poll_interval, Duration::from_secs(60));
        assert_eq!(config.orchestrator.comment_attempts, 5);
        assert_eq!(config.pusher.attempts, 3);
        assert_eq!(config.classifier.poll_window, Duration::from_secs(14400));
        assert_eq!(config.classifier.timeout, Duration::from_secs(43200));
        assert_eq!(
            config.classifier.completion_threshold,
            Duration::from_secs(600)
        );
        assert_eq!(config.classifier.max_orange, 10);
        assert_eq!(config.directory.search_timeout, Duration::from_secs(10));
        assert_eq!(config.bus.pusher_queue, "hgpusher");
    }

    #[test]
    fn load_parses_sections_and_durations() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("autoland.toml");
        fs::write(
            &path,
            r#"
            [tracker]
            api_url = "https://tracker.example.org/api"
            username = "autoland@example.org"

            [classifier]
            branch = "central"
            timeout = "6h"
            max_orange = 2

            [hg]
            ssh_user = "autoland"
            ssh_key = "/etc/autoland/id_rsa"
            "#,
        )
        .expect("write");

        let config = Config::load_file(&path).expect("load");
        assert_eq!(config.tracker.api_url, "https://tracker.example.org/api");
        assert_eq!(config.classifier.branch, "central");
        assert_eq!(config.classifier.timeout, Duration::from_secs(6 * 3600));
        assert_eq!(config.classifier.max_orange, 2);

        let ssh = config.hg.ssh_identity().expect("identity");
        assert_eq!(ssh.user.as_deref(), Some("autoland"));
        // untouched sections keep their defaults
        assert_eq!(config.pusher.attempts, 3);
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let td = tempdir().expect("tempdir");
        let base = td.path().join("base.toml");
        let site = td.path().join("site.toml");
        fs::write(
            &base,
            "[classifier]\nbranch = \"try\"\nmax_orange = 10\n[tracker]\nusername = \"a\"\n",
        )
        .expect("write");
        fs::write(&site, "[classifier]\nmax_orange = 0\n").expect("write");

        let config = Config::load(&[base, site]).expect("load");
        // overridden
        assert_eq!(config.classifier.max_orange, 0);
        // untouched keys from the earlier file survive
        assert_eq!(config.classifier.branch, "try");
        assert_eq!(config.tracker.username, "a");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load_file(Path::new("/nonexistent/autoland.toml")).is_err());
    }

    #[test]
    fn no_ssh_identity_when_unset() {
        assert!(HgConfig::default().ssh_identity().is_none());
    }
}
