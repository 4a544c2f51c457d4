//! Shared fakes for subsystem tests: the `Services` bundle wired to
//! in-memory stores, a scripted tracker, a map-backed directory, and
//! scripted tree-status / rebuild endpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autoland_bugzilla::{BugData, Tracker, WaitingAttachment, WaitingRequest};
use autoland_bus::DirBus;
use autoland_directory::Directory;
use autoland_store::{BuildStore, Store};
use autoland_types::{AutolandError, AutolandResult, Patch};
use tempfile::TempDir;

use crate::classifier::RebuildEndpoint;
use crate::config::Config;
use crate::services::Services;
use crate::treestatus::{TreeState, TreeStatusSource};

#[derive(Default)]
pub(crate) struct FakeTracker {
    summaries: Mutex<HashMap<u64, String>>,
    patches: Mutex<HashMap<u64, Vec<Patch>>>,
    patch_bodies: Mutex<HashMap<u64, String>>,
    waiting: Mutex<Vec<WaitingRequest>>,
    posted: Mutex<Vec<(u64, String)>>,
    existing: Mutex<Vec<(u64, String)>>,
    removed: Mutex<Vec<u64>>,
    statuses: Mutex<Vec<(String, Vec<u64>)>>,
    fail_posts: AtomicU32,
    patches_error: Mutex<Option<AutolandError>>,
}

impl FakeTracker {
    pub fn set_summary(&self, bug_id: u64, summary: &str) {
        self.summaries
            .lock()
            .expect("lock")
            .insert(bug_id, summary.to_string());
    }

    pub fn set_patches(&self, bug_id: u64, patches: Vec<Patch>) {
        self.patches.lock().expect("lock").insert(bug_id, patches);
    }

    pub fn set_patch_body(&self, patch_id: u64, body: &str) {
        self.patch_bodies
            .lock()
            .expect("lock")
            .insert(patch_id, body.to_string());
    }

    pub fn set_patches_error(&self, error: AutolandError) {
        *self.patches_error.lock().expect("lock") = Some(error);
    }

    pub fn add_waiting(&self, request: WaitingRequest) {
        self.waiting.lock().expect("lock").push(request);
    }

    pub fn posted(&self) -> Vec<(u64, String)> {
        self.posted.lock().expect("lock").clone()
    }

    pub fn record_existing_comment(&self, bug_id: u64, body: &str) {
        self.existing
            .lock()
            .expect("lock")
            .push((bug_id, body.to_string()));
    }

    pub fn fail_next_posts(&self, count: u32) {
        self.fail_posts.store(count, Ordering::SeqCst);
    }

    pub fn removed(&self) -> Vec<u64> {
        self.removed.lock().expect("lock").clone()
    }

    pub fn statuses(&self) -> Vec<(String, Vec<u64>)> {
        self.statuses.lock().expect("lock").clone()
    }
}

impl Tracker for FakeTracker {
    fn bug(&self, bug_id: u64) -> AutolandResult<BugData> {
        Ok(BugData {
            id: bug_id,
            summary: self
                .summaries
                .lock()
                .expect("lock")
                .get(&bug_id)
                .cloned()
                .unwrap_or_default(),
            attachments: Vec::new(),
        })
    }

    fn patches(&self, bug_id: u64, patch_ids: &[u64]) -> AutolandResult<Vec<Patch>> {
        if let Some(error) = self.patches_error.lock().expect("lock").clone() {
            return Err(error);
        }
        let by_bug = self.patches.lock().expect("lock");
        let known = by_bug.get(&bug_id).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for &id in patch_ids {
            match known.iter().find(|p| p.id == id) {
                Some(patch) => out.push(patch.clone()),
                None => {
                    return Err(AutolandError::InvalidInput(format!(
                        "patches [{id}] do not exist on bug {bug_id}"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn download_patch(&self, patch_id: u64, dir: &Path) -> AutolandResult<PathBuf> {
        let bodies = self.patch_bodies.lock().expect("lock");
        let Some(body) = bodies.get(&patch_id) else {
            return Err(AutolandError::InvalidInput(format!(
                "invalid attachment {patch_id}"
            )));
        };
        std::fs::create_dir_all(dir)
            .map_err(|e| AutolandError::Internal(format!("creating {}: {e}", dir.display())))?;
        let path = dir.join(format!("{patch_id}.patch"));
        std::fs::write(&path, body)
            .map_err(|e| AutolandError::Internal(format!("writing {}: {e}", path.display())))?;
        Ok(path)
    }

    fn post_comment(&self, bug_id: u64, text: &str) -> AutolandResult<()> {
        let failing = self.fail_posts.load(Ordering::SeqCst);
        if failing > 0 {
            if failing != u32::MAX {
                self.fail_posts.store(failing - 1, Ordering::SeqCst);
            }
            return Err(AutolandError::Transient("tracker is down".into()));
        }
        self.posted
            .lock()
            .expect("lock")
            .push((bug_id, text.to_string()));
        self.existing
            .lock()
            .expect("lock")
            .push((bug_id, text.to_string()));
        Ok(())
    }

    fn has_comment(&self, bug_id: u64, text: &str) -> AutolandResult<bool> {
        Ok(self
            .existing
            .lock()
            .expect("lock")
            .iter()
            .any(|(bug, body)| *bug == bug_id && body == text))
    }

    fn waiting_requests(&self) -> AutolandResult<Vec<WaitingRequest>> {
        Ok(self.waiting.lock().expect("lock").clone())
    }

    fn update_status(&self, status: &str, patch_ids: &[u64]) -> AutolandResult<()> {
        self.statuses
            .lock()
            .expect("lock")
            .push((status.to_string(), patch_ids.to_vec()));
        Ok(())
    }

    fn remove_from_queue(&self, patch_ids: &[u64]) -> AutolandResult<()> {
        self.removed.lock().expect("lock").extend_from_slice(patch_ids);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeDirectory {
    groups: Mutex<HashMap<String, Vec<String>>>,
    mapped: Mutex<HashMap<String, String>>,
    branch_groups: Mutex<HashMap<String, String>>,
}

impl FakeDirectory {
    pub fn add_member(&self, group: &str, email: &str) {
        self.groups
            .lock()
            .expect("lock")
            .entry(group.to_string())
            .or_default()
            .push(email.to_string());
    }

    pub fn map_email(&self, tracker_email: &str, directory_email: &str) {
        self.mapped
            .lock()
            .expect("lock")
            .insert(tracker_email.to_string(), directory_email.to_string());
    }

    pub fn set_branch_group(&self, branch: &str, group: &str) {
        self.branch_groups
            .lock()
            .expect("lock")
            .insert(branch.to_string(), group.to_string());
    }
}

impl Directory for FakeDirectory {
    fn group_members(&self, group: &str) -> AutolandResult<Vec<String>> {
        Ok(self
            .groups
            .lock()
            .expect("lock")
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    fn tracker_email(&self, email: &str) -> AutolandResult<Option<String>> {
        Ok(self.mapped.lock().expect("lock").get(email).cloned())
    }

    fn branch_group(&self, branch: &str) -> AutolandResult<String> {
        self.branch_groups
            .lock()
            .expect("lock")
            .get(branch)
            .cloned()
            .ok_or_else(|| AutolandError::NotFound(format!("branch {branch} unknown")))
    }
}

#[derive(Default)]
pub(crate) struct FakeTreeStatus {
    states: Mutex<HashMap<String, TreeState>>,
}

impl FakeTreeStatus {
    pub fn set_state(&self, branch: &str, state: TreeState) {
        self.states
            .lock()
            .expect("lock")
            .insert(branch.to_string(), state);
    }
}

impl TreeStatusSource for FakeTreeStatus {
    fn status(&self, branch: &str) -> AutolandResult<TreeState> {
        Ok(self
            .states
            .lock()
            .expect("lock")
            .get(branch)
            .copied()
            .unwrap_or(TreeState::Open))
    }
}

#[derive(Default)]
pub(crate) struct FakeRebuild {
    calls: Mutex<Vec<i64>>,
    fail: AtomicBool,
}

impl FakeRebuild {
    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl RebuildEndpoint for FakeRebuild {
    fn rebuild(&self, _branch: &str, build_id: i64) -> AutolandResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AutolandError::Transient("self-serve is down".into()));
        }
        self.calls.lock().expect("lock").push(build_id);
        Ok(())
    }
}

pub(crate) struct Harness {
    pub dir: TempDir,
    pub tracker: Arc<FakeTracker>,
    pub directory: Arc<FakeDirectory>,
    pub tree: Arc<FakeTreeStatus>,
    pub rebuild: Arc<FakeRebuild>,
    pub services: Services,
}

pub(crate) fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = Config::default();
    config.bus.root = dir.path().join("bus");
    config.orchestrator.failed_comments_log = dir.path().join("failed_comments.log");
    config.classifier.cache_dir = dir.path().join("cache");
    config.classifier.posted_bugs = dir.path().join("postedbugs.log");
    config.classifier.lock_dir = dir.path().join("classifier");
    config.pusher.work_dir = dir.path().join("work");
    config.treestatus.retry_interval = Duration::ZERO;
    config.treestatus.max_attempts = 2;

    let tracker = Arc::new(FakeTracker::default());
    let directory = Arc::new(FakeDirectory::default());
    let tree = Arc::new(FakeTreeStatus::default());
    let rebuild = Arc::new(FakeRebuild::default());

    let bus = DirBus::open(&config.bus.root, &config.bus.exchange).expect("bus");

    let services = Services {
        config,
        tracker: tracker.clone(),
        directory: directory.clone(),
        tree_status: tree.clone(),
        rebuild: rebuild.clone(),
        store: Store::open_in_memory().expect("store"),
        build_store: BuildStore::open_in_memory().expect("build store"),
        bus: Box::new(bus),
    };

    Harness {
        dir,
        tracker,
        directory,
        tree,
        rebuild,
        services,
    }
}
