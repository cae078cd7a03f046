//! Small file-backed key/value store
//!
//! The decision engine is stateless across restarts apart from this blob:
//! per-task cumulative daily run-time, last-known priorities for warm-up,
//! and PV model parameters. Values are opaque JSON; flushing happens at the
//! end of a tick so device calls never wait on the filesystem.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::domain::Priority;

pub struct Store {
    path: PathBuf,
    map: RwLock<BTreeMap<String, Value>>,
    dirty: AtomicBool,
}

impl Store {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>> {
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading store {}", path.display())),
        };
        Ok(Arc::new(Self {
            path,
            map: RwLock::new(map),
            dirty: AtomicBool::new(false),
        }))
    }

    /// In-memory store for tests
    pub fn ephemeral() -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::new(),
            map: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let map = self.map.read();
        let value = map.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "discarding malformed store value");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.map.write().insert(key.to_string(), v);
                self.dirty.store(true, Ordering::Relaxed);
            }
            Err(e) => warn!(key, error = %e, "failed to serialize store value"),
        }
    }

    /// Write back to disk when anything changed since the last flush
    pub async fn flush(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() || !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let raw = {
            let map = self.map.read();
            serde_json::to_string_pretty(&*map).context("serializing store")?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("writing store {}", self.path.display()))?;
        Ok(())
    }

    /// Cumulative run time for a task on a calendar day, minutes
    pub fn runtime_minutes(&self, task_id: &str, date: NaiveDate) -> f64 {
        self.get(&format!("runtime.{task_id}.{date}")).unwrap_or(0.0)
    }

    pub fn add_runtime_minutes(&self, task_id: &str, date: NaiveDate, minutes: f64) {
        let key = format!("runtime.{task_id}.{date}");
        let total = self.runtime_minutes(task_id, date) + minutes;
        self.set(&key, &total);
    }

    /// Last-known priority, used to warm up a freshly registered task
    pub fn last_priority(&self, task_id: &str) -> Option<Priority> {
        self.get(&format!("priority.{task_id}"))
    }

    pub fn set_last_priority(&self, task_id: &str, priority: Priority) {
        self.set(&format!("priority.{task_id}"), &priority);
    }
}
