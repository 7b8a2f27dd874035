//! Persistent per-source page-cursor stacks.
//!
//! The crawl engine records which listing pages are in flight as a stack of
//! page numbers per source, persisted as YAML so crawls survive restarts.
//! Every mutation flushes to disk; SIGHUP triggers an extra flush through
//! [`CursorStore::save`].

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const FORMAT_VERSION: &str = "v1";

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: String,
    #[serde(rename = "lastFetchPageStack")]
    last_fetch_page_stack: HashMap<String, Vec<i64>>,
}

/// In-memory stacks with flush-on-mutation persistence.
///
/// Stack mutations take the write lock; serialization happens under a
/// separate save mutex so a slow disk never blocks readers longer than the
/// snapshot copy.
pub struct CursorStore {
    path: PathBuf,
    stacks: RwLock<HashMap<String, Vec<i64>>>,
    save_lock: Mutex<()>,
}

impl CursorStore {
    /// Load from `path`. A missing file, undecodable content, or an unknown
    /// format version all start an empty store at the current version; the
    /// old file is overwritten on the next save.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stacks = match File::open(&path) {
            Err(_) => {
                info!(path = %path.display(), "no runtime config yet, starting empty");
                HashMap::new()
            }
            Ok(reader) => match serde_yaml::from_reader::<_, StoreFile>(reader) {
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "runtime config undecodable, starting empty");
                    HashMap::new()
                }
                Ok(file) if file.version != FORMAT_VERSION => {
                    warn!(version = %file.version, "unsupported runtime config version, starting empty");
                    HashMap::new()
                }
                Ok(file) => file.last_fetch_page_stack,
            },
        };
        Self {
            path,
            stacks: RwLock::new(stacks),
            save_lock: Mutex::new(()),
        }
    }

    /// Copy of the top of the source's stack, or `None` when empty.
    pub fn stack_top(&self, source: &str) -> Option<i64> {
        let stacks = self.stacks.read().unwrap_or_else(|e| e.into_inner());
        stacks.get(source).and_then(|stack| stack.last().copied())
    }

    /// Push `value` unless it already sits on top.
    pub fn append_stack(&self, source: &str, value: i64) {
        {
            let mut stacks = self.stacks.write().unwrap_or_else(|e| e.into_inner());
            let stack = stacks.entry(source.to_string()).or_default();
            if stack.last() == Some(&value) {
                return;
            }
            stack.push(value);
        }
        self.flush();
    }

    /// Overwrite the top with `value`, creating a single-element stack when
    /// empty. Returns the prior top.
    pub fn replace_stack_top(&self, source: &str, value: i64) -> Option<i64> {
        let prior = {
            let mut stacks = self.stacks.write().unwrap_or_else(|e| e.into_inner());
            let stack = stacks.entry(source.to_string()).or_default();
            let prior = stack.last().copied();
            match stack.last_mut() {
                Some(top) => *top = value,
                None => stack.push(value),
            }
            prior
        };
        self.flush();
        prior
    }

    /// Pop and return the top; `None` when the stack is already empty.
    pub fn stack_pop(&self, source: &str) -> Option<i64> {
        let popped = {
            let mut stacks = self.stacks.write().unwrap_or_else(|e| e.into_inner());
            match stacks.get_mut(source) {
                Some(stack) => stack.pop(),
                None => None,
            }
        };
        if popped.is_some() {
            self.flush();
        }
        popped
    }

    /// Serialize the current stacks to disk, creating parent directories as
    /// needed. Called on every mutation and on SIGHUP.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let stacks = self.stacks.read().unwrap_or_else(|e| e.into_inner());
            stacks.clone()
        };
        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create runtime config dir {}", dir.display()))?;
        }
        let writer = File::create(&self.path)
            .with_context(|| format!("create runtime config {}", self.path.display()))?;
        serde_yaml::to_writer(
            writer,
            &StoreFile {
                version: FORMAT_VERSION.to_string(),
                last_fetch_page_stack: snapshot,
            },
        )
        .context("encode runtime config")
    }

    fn flush(&self) {
        if let Err(err) = self.save() {
            error!(error = %err, "flush runtime config failed");
        }
    }
}
