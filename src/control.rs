//! Operator edits from outside the process
//!
//! Two ways in, both ending in [`MemoryStore::edit`] so the running
//! equipment sees a [`SettingChange`](crate::store::SettingChange):
//!
//! - [`SnapshotWatcher`] watches the store snapshot file. Settings leaves
//!   that differ from the last version seen on disk are applied as edits.
//! - [`run_console`] reads `set <path> <value>` lines, e.g. from stdin.
//!
//! ```text
//! set frequency 2500
//! set pulse/width 0.002
//! set /Equipment/SGEN-33250A-00/Settings/output ON
//! ```

use crate::equipment::settings_path;
use crate::error::{AppResult, DaqError};
use crate::schema::changed_entries;
use crate::store::{join_path, MemoryStore};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings leaves of `current` that differ from `previous`
///
/// Only `/Equipment/<name>/Settings` subtrees are considered. Returns full
/// store paths.
pub fn settings_edits(previous: &Value, current: &Value) -> Vec<(String, Value)> {
    let Some(equipment) = current.get("Equipment").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut edits = Vec::new();
    for (name, tree) in equipment {
        let Some(settings) = tree.get("Settings") else {
            continue;
        };
        let before = previous
            .get("Equipment")
            .and_then(|e| e.get(name))
            .and_then(|t| t.get("Settings"))
            .cloned()
            .unwrap_or(Value::Null);
        let base = settings_path(name);
        edits.extend(
            changed_entries(settings, &before)
                .into_iter()
                .map(|(key, value)| (join_path(&base, &key), value)),
        );
    }
    edits
}

async fn read_snapshot(path: &Path) -> AppResult<Option<Value>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Turns edits of the snapshot file into store edits
///
/// The parent directory is watched rather than the file itself, so editors
/// that save by renaming a temporary file are picked up. Dropping the
/// watcher stops it.
pub struct SnapshotWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl SnapshotWatcher {
    /// Start watching `path`; its current contents are the baseline
    pub async fn spawn(store: Arc<MemoryStore>, path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| DaqError::Configuration(format!("'{}' is not a file path", path.display())))?;
        tokio::fs::create_dir_all(&dir).await?;

        let mut last = read_snapshot(&path).await?.unwrap_or(Value::Null);

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // callback runs on the notify thread
            let _ = tx.send(res);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching store snapshot for edits");

        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "snapshot watcher error");
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                if !event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                    continue;
                }
                match read_snapshot(&path).await {
                    Ok(Some(current)) => {
                        let edits = settings_edits(&last, &current);
                        for (key, value) in &edits {
                            debug!(path = %key, %value, "snapshot edit");
                            if let Err(e) = store.edit(key, value.clone()) {
                                warn!(path = %key, error = %e, "snapshot edit failed");
                            }
                        }
                        if !edits.is_empty() {
                            info!(edits = edits.len(), "snapshot edits applied");
                        }
                        last = current;
                    }
                    Ok(None) => {}
                    // partially written; the next event retries
                    Err(e) => debug!(error = %e, "snapshot not readable yet"),
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for SnapshotWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// `set <path> <value>`; relative paths are resolved by [`run_console`]
    Set {
        /// Store path as typed
        path: String,
        /// JSON value, or the raw text when it is not valid JSON
        value: Value,
    },
}

/// Parse one console line; blank lines and `#` comments yield `None`
pub fn parse_command(line: &str) -> AppResult<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim_start();
    match (command, rest.split_once(char::is_whitespace)) {
        ("set", Some((path, raw))) if !raw.trim().is_empty() => {
            let raw = raw.trim();
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok(Some(ConsoleCommand::Set {
                path: path.to_string(),
                value,
            }))
        }
        _ => Err(DaqError::Configuration(format!(
            "cannot parse '{}', expected: set <path> <value>",
            line
        ))),
    }
}

/// Apply `set` lines from `reader` as edits until end of input
///
/// Paths without a leading `/` are relative to `base`. Bad lines are logged
/// and skipped. Returns the number of edits applied.
pub async fn run_console<R>(reader: R, store: Arc<MemoryStore>, base: &str) -> AppResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut applied = 0;
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(ConsoleCommand::Set { path, value })) => {
                let path = if path.starts_with('/') {
                    path
                } else {
                    join_path(base, &path)
                };
                store.edit(&path, value)?;
                debug!(path = %path, "console edit");
                applied += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "console line ignored"),
        }
    }
    Ok(applied)
}
