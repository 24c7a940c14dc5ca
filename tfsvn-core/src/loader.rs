//! Bounded content prefetch for gateway responses
//!
//! One worker thread walks a [`ContentItem`] tree depth first, downloads each
//! file through a [`ContentSource`], encodes it into a base64 svndiff payload,
//! and publishes it on the item. Before each download the worker waits until
//! the aggregate of loaded-but-unconsumed payload bytes leaves room under the
//! configured budget. Consumers pull payloads with
//! [`PrefetchLoader::try_take`], which frees budget and wakes the worker.
//!
//! The aggregate counter and the completion condvar form a single monitor:
//! `try_take` holds the counter lock across its check-and-wait, and the
//! worker publishes and notifies under the same lock, so a completion signal
//! cannot slot between a consumer's check and its wait.

use anyhow::{Context, Result as AnyhowResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::item::{ContentItem, EncodedPayload, ItemKind};
use crate::svndiff;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Fatal prefetch failures. Cancellation and consumer timeouts are not
/// errors and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The worker waited past the ceiling for budget to free up. Either the
    /// consumer stopped taking items or the budget is far too small.
    #[error("waited {waited:?} for prefetch budget (ceiling {ceiling:?}) on '{path}'")]
    CapacityTimeout {
        path: String,
        waited: Duration,
        ceiling: Duration,
    },

    /// The external content source failed; not retried here.
    #[error("content fetch failed for '{path}'")]
    Fetch {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Blocking download capability supplied by the gateway's TFS client layer.
/// Credentials, retries, and URL construction are its concern.
pub trait ContentSource: Send + Sync {
    /// Download the raw bytes for a file item.
    fn fetch(&self, item: &ContentItem) -> AnyhowResult<Bytes>;
}

/// Prefetch tuning, loadable from `prefetch-config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Maximum total bytes of loaded-but-unconsumed payloads.
    pub cache_total_size_limit: u64,
    /// Length of one capacity-wait slice in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub capacity_poll_interval_ms: u64,
    /// Fatal ceiling on a single capacity wait, in seconds.
    #[serde(default = "default_wait_ceiling_secs")]
    pub capacity_wait_ceiling_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_wait_ceiling_secs() -> u64 {
    2 * 60 * 60
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_total_size_limit: 100 * 1024 * 1024,
            capacity_poll_interval_ms: default_poll_interval_ms(),
            capacity_wait_ceiling_secs: default_wait_ceiling_secs(),
        }
    }
}

impl LoaderConfig {
    /// Load config from a JSON file, falling back to defaults if absent.
    pub fn load(path: &Path) -> AnyhowResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read prefetch config from {:?}", path))?;
        let config: LoaderConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse prefetch config JSON")?;
        Ok(config)
    }

    /// Save config as JSON (write-then-rename).
    pub fn save(&self, path: &Path) -> AnyhowResult<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_poll_interval_ms)
    }

    pub fn wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.capacity_wait_ceiling_secs)
    }
}

/// Outcome of one walk frame: keep going, or unwind because of cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Continue,
    Stopped,
}

struct Shared {
    /// Aggregate bytes of loaded-but-unconsumed payloads across the tree.
    loaded_bytes: Mutex<u64>,
    /// Signaled on publish, on take, and on cancel.
    completed: Condvar,
    cancelled: AtomicBool,
}

/// Walks a request's content tree on a dedicated worker thread, keeping the
/// loaded-but-unconsumed total under the configured budget.
pub struct PrefetchLoader {
    root: Arc<ContentItem>,
    source: Arc<dyn ContentSource>,
    config: LoaderConfig,
    shared: Shared,
}

impl PrefetchLoader {
    pub fn new(root: Arc<ContentItem>, source: Arc<dyn ContentSource>, config: LoaderConfig) -> Self {
        Self {
            root,
            source,
            config,
            shared: Shared {
                loaded_bytes: Mutex::new(0),
                completed: Condvar::new(),
                cancelled: AtomicBool::new(false),
            },
        }
    }

    /// Walk the tree and prefetch every file, blocking until the walk
    /// finishes, is cancelled, or fails.
    ///
    /// Cancellation returns `Ok(())`; a capacity ceiling breach or a fetch
    /// failure aborts the walk with an error.
    pub fn start(&self) -> Result<()> {
        match self.walk(&self.root)? {
            Walk::Stopped => debug!("prefetch walk cancelled"),
            Walk::Continue => debug!("prefetch walk complete"),
        }
        Ok(())
    }

    /// Request a cooperative stop. Observed at every walk and wait
    /// checkpoint; idempotent.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            debug!("prefetch cancellation requested");
        }
        self.shared.completed.notify_all();
    }

    /// Block until `item`'s payload is available and take it, or give up
    /// after `timeout`.
    ///
    /// Returns `None` on timeout; the caller is expected to retry once more
    /// content has been consumed upstream. Taking the payload frees its
    /// bytes from the budget and wakes the worker.
    pub fn try_take(&self, item: &ContentItem, timeout: Duration) -> Option<EncodedPayload> {
        let deadline = Instant::now() + timeout;
        let mut loaded = self.shared.loaded_bytes.lock().unwrap();
        loop {
            if let Some(payload) = item.rob() {
                *loaded -= payload.len() as u64;
                trace!(item = item.name(), freed = payload.len(), total = *loaded, "payload taken");
                self.shared.completed.notify_all();
                return Some(payload);
            }
            // Recompute the remaining wait from the fixed deadline so
            // repeated wakeups do not accumulate drift.
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .completed
                .wait_timeout(loaded, deadline - now)
                .unwrap();
            loaded = guard;
        }
    }

    /// Current loaded-but-unconsumed total, for diagnostics.
    pub fn loaded_bytes(&self) -> u64 {
        *self.shared.loaded_bytes.lock().unwrap()
    }

    fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    fn walk(&self, item: &Arc<ContentItem>) -> Result<Walk> {
        if self.is_cancelled() {
            return Ok(Walk::Stopped);
        }
        match item.kind() {
            // Deletion markers carry no content.
            ItemKind::Tombstone => Ok(Walk::Continue),
            ItemKind::Folder => {
                for child in item.children() {
                    if self.walk(child)? == Walk::Stopped {
                        return Ok(Walk::Stopped);
                    }
                }
                Ok(Walk::Continue)
            }
            ItemKind::File => self.load_file(item),
        }
    }

    fn load_file(&self, item: &Arc<ContentItem>) -> Result<Walk> {
        if self.wait_for_capacity(item)? == Walk::Stopped {
            return Ok(Walk::Stopped);
        }

        let raw = self.source.fetch(item).map_err(|source| LoaderError::Fetch {
            path: item.name().to_string(),
            source,
        })?;
        let payload = EncodedPayload::encode(&raw);

        {
            // Publish and account under the counter lock as one step: a
            // consumer robbing between the two would decrement a size that
            // was never added.
            let mut loaded = self.shared.loaded_bytes.lock().unwrap();
            let size = item.publish(payload) as u64;
            *loaded += size;
            debug!(item = item.name(), bytes = size, total = *loaded, "item loaded");
        }
        self.shared.completed.notify_all();
        Ok(Walk::Continue)
    }

    /// Wait until `item`'s encoded payload fits under the budget.
    ///
    /// An item always proceeds when nothing is loaded, so a single file
    /// larger than the whole budget still goes through (transient overshoot
    /// instead of deadlock).
    fn wait_for_capacity(&self, item: &ContentItem) -> Result<Walk> {
        let budget = self.config.cache_total_size_limit;
        let incoming = svndiff::encoded_len_hint(item.size());
        let started = Instant::now();
        let ceiling = self.config.wait_ceiling();
        let deadline = started + ceiling;

        let mut loaded = self.shared.loaded_bytes.lock().unwrap();
        loop {
            if self.is_cancelled() {
                return Ok(Walk::Stopped);
            }
            if *loaded == 0 || loaded.saturating_add(incoming) <= budget {
                return Ok(Walk::Continue);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    item = item.name(),
                    loaded = *loaded,
                    incoming,
                    budget,
                    "prefetch budget never freed up"
                );
                return Err(LoaderError::CapacityTimeout {
                    path: item.name().to_string(),
                    waited: now - started,
                    ceiling,
                });
            }
            trace!(item = item.name(), loaded = *loaded, incoming, budget, "waiting for budget");
            let slice = self.config.poll_interval().min(deadline - now);
            let (guard, _) = self.shared.completed.wait_timeout(loaded, slice).unwrap();
            loaded = guard;
            if self.is_cancelled() {
                return Ok(Walk::Stopped);
            }
        }
    }
}
