//! Durable message bus for the autoland pipeline.
//!
//! The pipeline's processes exchange work through a direct-routing
//! exchange with two routing keys: `db` (results and completions, to the
//! orchestrator) and `hgpusher` (apply jobs, to the pusher). This crate
//! defines the JSON envelope and the [`Bus`] seam, plus [`DirBus`], a
//! spool-directory implementation: each queue is a directory, each message
//! a JSON file, consumed oldest-first and deleted only on acknowledgement.
//! A consumer that dies mid-message leaves the file behind, so delivery is
//! at-least-once; duplicate suppression belongs to the database layer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Delivery metadata attached to every message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Meta {
    #[serde(default)]
    pub sent_time: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_time: Option<String>,
}

/// The wire envelope: `{_meta: {...}, payload: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "_meta", default)]
    pub meta: Meta,
    pub payload: serde_json::Value,
}

/// A message pulled off a queue but not yet acknowledged.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    path: PathBuf,
}

/// The bus operations the pipeline depends on. Consumers acknowledge only
/// after successful processing; an unacknowledged message is redelivered.
pub trait Bus {
    /// Declare `queue` and bind it to `routing_key`. Idempotent.
    fn bind(&self, queue: &str, routing_key: &str) -> Result<()>;

    /// Publish `payload` to every queue bound to `routing_key`. With no
    /// binding the message is dropped, like any direct exchange.
    fn publish(&self, routing_key: &str, payload: serde_json::Value) -> Result<()>;

    /// Oldest pending message on `queue`, if any.
    fn receive(&self, queue: &str) -> Result<Option<Delivery>>;

    fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Drop every pending message; returns how many were dropped.
    fn purge(&self, queue: &str) -> Result<usize>;

    /// Number of pending messages.
    fn depth(&self, queue: &str) -> Result<usize>;
}

static SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Bindings {
    /// routing key -> queues
    routes: Vec<(String, Vec<String>)>,
}

impl Bindings {
    fn queues_for(&self, routing_key: &str) -> &[String] {
        self.routes
            .iter()
            .find(|(key, _)| key == routing_key)
            .map(|(_, queues)| queues.as_slice())
            .unwrap_or(&[])
    }

    fn add(&mut self, routing_key: &str, queue: &str) {
        match self.routes.iter_mut().find(|(key, _)| key == routing_key) {
            Some((_, queues)) => {
                if !queues.iter().any(|q| q == queue) {
                    queues.push(queue.to_string());
                }
            }
            None => self
                .routes
                .push((routing_key.to_string(), vec![queue.to_string()])),
        }
    }
}

/// Spool-directory bus. Safe for multiple processes on one host: writers
/// publish atomically (tmp + rename) and acknowledgement is file removal.
pub struct DirBus {
    root: PathBuf,
    exchange: String,
}

impl DirBus {
    pub fn open(root: &Path, exchange: &str) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating bus root {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            exchange: exchange.to_string(),
        })
    }

    fn bindings_path(&self) -> PathBuf {
        self.root.join("bindings.json")
    }

    fn load_bindings(&self) -> Result<Bindings> {
        let path = self.bindings_path();
        if !path.exists() {
            return Ok(Bindings::default());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn save_bindings(&self, bindings: &Bindings) -> Result<()> {
        let path = self.bindings_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(bindings)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    fn queue_dir(&self, queue: &str) -> Result<PathBuf> {
        if queue.is_empty() || queue.contains('/') || queue.contains("..") {
            bail!("bad queue name: {queue:?}");
        }
        Ok(self.root.join(queue))
    }

    fn pending_files(&self, queue: &str) -> Result<Vec<PathBuf>> {
        let dir = self.queue_dir(queue)?;
        if !dir.is_dir() {
            bail!("queue {queue:?} is not declared");
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|e| e == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl Bus for DirBus {
    fn bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        let dir = self.queue_dir(queue)?;
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let mut bindings = self.load_bindings()?;
        bindings.add(routing_key, queue);
        self.save_bindings(&bindings)
    }

    fn publish(&self, routing_key: &str, payload: serde_json::Value) -> Result<()> {
        let envelope = Envelope {
            meta: Meta {
                sent_time: Self::now(),
                routing_key: routing_key.to_string(),
                exchange: self.exchange.clone(),
                received_time: None,
            },
            payload,
        };
        let body = serde_json::to_string(&envelope).context("serializing envelope")?;

        let bindings = self.load_bindings()?;
        for queue in bindings.queues_for(routing_key) {
            let dir = self.queue_dir(queue)?;
            let seq = SEQ.fetch_add(1, Ordering::SeqCst);
            let name = format!(
                "{:020}-{:06}-{:06}.json",
                Utc::now().timestamp_micros(),
                std::process::id(),
                seq
            );
            let path = dir.join(&name);
            let tmp = dir.join(format!("{name}.tmp"));
            fs::write(&tmp, &body).with_context(|| format!("writing {}", tmp.display()))?;
            fs::rename(&tmp, &path)
                .with_context(|| format!("renaming to {}", path.display()))?;
        }
        Ok(())
    }

    fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        for path in self.pending_files(queue)? {
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let parsed: Result<serde_json::Value, _> = serde_json::from_str(&text);
            let Ok(value) = parsed else {
                // Unparseable bodies cannot be processed; drop them rather
                // than wedging the queue head.
                let _ = fs::remove_file(&path);
                continue;
            };
            // Tolerate bare payloads without an envelope.
            let mut envelope: Envelope = if value.get("payload").is_some() {
                serde_json::from_value(value).context("parsing envelope")?
            } else {
                Envelope {
                    meta: Meta::default(),
                    payload: value,
                }
            };
            envelope.meta.received_time = Some(Self::now());
            return Ok(Some(Delivery { envelope, path }));
        }
        Ok(None)
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        if delivery.path.exists() {
            fs::remove_file(&delivery.path)
                .with_context(|| format!("removing {}", delivery.path.display()))?;
        }
        Ok(())
    }

    fn purge(&self, queue: &str) -> Result<usize> {
        let files = self.pending_files(queue)?;
        let count = files.len();
        for path in files {
            fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(count)
    }

    fn depth(&self, queue: &str) -> Result<usize> {
        Ok(self.pending_files(queue)?.len())
    }
}
