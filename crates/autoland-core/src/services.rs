//! The `Services` bundle.
//!
//! Every external collaborator the pipeline talks to (tracker, directory,
//! tree status, the self-serve rebuild endpoint, the store, the bus) is
//! constructed once at process start and threaded through the subsystems
//! behind its trait. Tests supply a bundle of fakes.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};

use autoland_bugzilla::{BugzillaClient, Tracker};
use autoland_bus::{Bus, DirBus};
use autoland_directory::{Directory, LdapDirectory};
use autoland_store::{BuildStore, Store};

use crate::classifier::{RebuildEndpoint, SelfServeClient};
use crate::config::Config;
use crate::treestatus::{HttpTreeStatus, TreeStatusSource};

pub struct Services {
    pub config: Config,
    pub tracker: Arc<dyn Tracker>,
    pub directory: Arc<dyn Directory>,
    pub tree_status: Arc<dyn TreeStatusSource>,
    pub rebuild: Arc<dyn RebuildEndpoint>,
    pub store: Store,
    pub build_store: BuildStore,
    pub bus: Box<dyn Bus>,
}

impl Services {
    /// Build the production bundle: real clients, the on-disk store, and
    /// the spool-directory bus.
    pub fn from_config(config: Config) -> Result<Self> {
        for path in [&config.store.db_path, &config.store.build_db_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let tracker = BugzillaClient::new(config.tracker.clone())?;
        let directory = LdapDirectory::new(config.directory.clone())?;
        let tree_status = HttpTreeStatus::new(&config.treestatus.url)?;
        let rebuild = SelfServeClient::new(
            &config.classifier.self_serve_url,
            &config.classifier.self_serve_user,
            &config.classifier.self_serve_password,
        )?;
        let store = Store::open(&config.store.db_path)?;
        let build_store = BuildStore::open(&config.store.build_db_path)?;
        let bus = DirBus::open(&config.bus.root, &config.bus.exchange)?;

        Ok(Self {
            config,
            tracker: Arc::new(tracker),
            directory: Arc::new(directory),
            tree_status: Arc::new(tree_status),
            rebuild: Arc::new(rebuild),
            store,
            build_store,
            bus: Box::new(bus),
        })
    }
}
