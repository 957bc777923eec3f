//! Hierarchical parameter store
//!
//! The frontend publishes into a key/value tree addressed by `/`-separated
//! paths, e.g. `/Equipment/SGEN-33250A-00/Settings/pulse/width`. The
//! [`ParameterStore`] trait is the boundary to whatever hosts that tree;
//! [`MemoryStore`] is the in-process implementation, optionally persisted to
//! a JSON snapshot file.
//!
//! Writes merge: setting an object only touches the keys it contains, so
//! keys already present in the store and absent from the written value are
//! preserved.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Message shown to the operator (the host's message log)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorMessage {
    /// When the message was posted
    pub timestamp: DateTime<Utc>,
    /// Message text
    pub text: String,
    /// Error messages are highlighted to the operator
    pub is_error: bool,
}

impl OperatorMessage {
    /// Informational message
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
            is_error: false,
        }
    }

    /// Error message
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            text: text.into(),
            is_error: true,
        }
    }
}

/// Notification that an operator edited a value
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    /// Full store path of the edited value
    pub path: String,
    /// New value
    pub value: Value,
}

/// Boundary to the external key/value tree
pub trait ParameterStore: Send + Sync {
    /// Value at `path` (subtrees come back as objects)
    fn get(&self, path: &str) -> AppResult<Option<Value>>;

    /// Merge `value` into the tree at `path` without removing other keys
    fn set(&self, path: &str, value: Value) -> AppResult<()>;

    /// Whether anything exists at `path`
    fn exists(&self, path: &str) -> AppResult<bool> {
        Ok(self.get(path)?.is_some())
    }

    /// Post a message to the operator
    fn post_message(&self, message: OperatorMessage) -> AppResult<()>;

    /// Receive operator edits at or below `prefix`
    fn watch(&self, prefix: &str) -> AppResult<mpsc::UnboundedReceiver<SettingChange>>;
}

/// Join a base path and a flattened key (`pulse.width` -> `base/pulse/width`)
pub fn join_path(base: &str, key: &str) -> String {
    let key = key.replace(crate::schema::KEY_SEPARATOR, "/");
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn is_under(path: &str, prefix: &str) -> bool {
    let path: Vec<&str> = segments(path).collect();
    let prefix: Vec<&str> = segments(prefix).collect();
    path.starts_with(&prefix)
}

/// Recursively merge `incoming` into `target`
fn merge(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<SettingChange>,
}

/// In-process parameter store
pub struct MemoryStore {
    root: RwLock<Value>,
    messages: Mutex<Vec<OperatorMessage>>,
    watchers: Mutex<Vec<Watcher>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Value::Object(Map::new())),
            messages: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Load a store from a JSON snapshot; a missing file yields an empty store
    pub fn load(path: &Path) -> AppResult<Self> {
        let store = Self::new();
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let value: Value = serde_json::from_str(&text)?;
            if !value.is_object() {
                return Err(DaqError::Store(format!(
                    "snapshot '{}' must contain a JSON object",
                    path.display()
                )));
            }
            *store.write_root()? = value;
            info!(path = %path.display(), "parameter store loaded");
        }
        Ok(store)
    }

    /// Write the whole tree to a JSON snapshot
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&*self.read_root()?)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Operator edit: set the value and notify watchers
    pub fn edit(&self, path: &str, value: Value) -> AppResult<()> {
        self.set(path, value.clone())?;
        let mut watchers = self.lock_watchers();
        watchers.retain(|w| {
            if is_under(path, &w.prefix) {
                w.tx.send(SettingChange {
                    path: path.to_string(),
                    value: value.clone(),
                })
                .is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
        Ok(())
    }

    /// Messages posted so far
    pub fn messages(&self) -> Vec<OperatorMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn read_root(&self) -> AppResult<std::sync::RwLockReadGuard<'_, Value>> {
        self.root
            .read()
            .map_err(|_| DaqError::Store("store lock poisoned".to_string()))
    }

    fn write_root(&self) -> AppResult<std::sync::RwLockWriteGuard<'_, Value>> {
        self.root
            .write()
            .map_err(|_| DaqError::Store("store lock poisoned".to_string()))
    }

    fn lock_watchers(&self) -> MutexGuard<'_, Vec<Watcher>> {
        self.watchers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ParameterStore for MemoryStore {
    fn get(&self, path: &str) -> AppResult<Option<Value>> {
        let root = self.read_root()?;
        let mut node = &*root;
        for part in segments(path) {
            match node.get(part) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node.clone()))
    }

    fn set(&self, path: &str, value: Value) -> AppResult<()> {
        let mut root = self.write_root()?;
        let mut node = &mut *root;
        for part in segments(path) {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return Err(DaqError::Store(format!("cannot descend into '{}'", path)));
            };
            node = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let fresh = node.as_object().map(Map::is_empty).unwrap_or(false);
        if fresh {
            *node = value;
        } else {
            merge(node, value);
        }
        Ok(())
    }

    fn post_message(&self, message: OperatorMessage) -> AppResult<()> {
        if message.is_error {
            error!(operator_message = %message.text, "operator error");
        } else {
            info!(operator_message = %message.text, "operator message");
        }
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message);
        Ok(())
    }

    fn watch(&self, prefix: &str) -> AppResult<mpsc::UnboundedReceiver<SettingChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_watchers().push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
