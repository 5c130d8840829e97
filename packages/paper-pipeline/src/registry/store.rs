//! File-backed registry store.
//!
//! Readers take the last committed snapshot lock-free via `ArcSwap`. Writers
//! are serialized through a single async mutex: each `upsert` merges its
//! delta into a copy of the current snapshot, persists the copy with a
//! temp-file + rename, and only then publishes it. A failed write leaves
//! both the file and the published snapshot at the previous commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::persist::{discard_stray_temp, write_atomic};
use crate::registry::snapshot::RegistrySnapshot;
use crate::types::config::PipelineConfig;
use crate::types::document::normalize_kind;
use crate::types::registry::{RegistryDelta, RegistryEntry};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct RegistryFileRef<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<&'a RegistryEntry>,
}

#[derive(Deserialize)]
struct RegistryFile {
    #[allow(dead_code)]
    version: u32,
    entries: Vec<RegistryEntry>,
}

/// The single persisted source of truth for canonical papers.
pub struct RegistryStore {
    /// None = in-memory only (tests, dry runs)
    path: Option<PathBuf>,
    primary_kind: String,
    current: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
}

impl RegistryStore {
    /// Load the registry from `path`.
    ///
    /// A stray temporary file from an interrupted write is discarded and the
    /// canonical file is loaded as-is. A missing file is an empty registry.
    pub async fn load(
        path: impl Into<PathBuf>,
        primary_kind: impl Into<String>,
    ) -> RegistryResult<Self> {
        let path = path.into();

        match discard_stray_temp(&path).await {
            Ok(true) => warn!(path = %path.display(), "Discarded interrupted registry write"),
            Ok(false) => {}
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.clone(),
                    source,
                })
            }
        }

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: RegistryFile =
                    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                RegistrySnapshot::from_entries(file.entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistrySnapshot::default(),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        info!(path = %path.display(), entries = snapshot.len(), "Loaded registry");

        Ok(Self {
            path: Some(path),
            primary_kind: normalize_kind(&primary_kind.into()),
            current: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
        })
    }

    /// Load the registry named by `config`, keyed on the resolver's primary
    /// identifier kind.
    pub async fn open(config: &PipelineConfig) -> RegistryResult<Self> {
        Self::load(&config.registry.path, &config.resolver.primary_identifier).await
    }

    /// A store that never touches disk.
    pub fn in_memory(primary_kind: impl Into<String>) -> Self {
        Self {
            path: None,
            primary_kind: normalize_kind(&primary_kind.into()),
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// The last committed snapshot. Never blocks on writers.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn primary_kind(&self) -> &str {
        &self.primary_kind
    }

    /// Merge a delta and commit it.
    ///
    /// Returns the entry as committed. Concurrent calls are applied one at a
    /// time against the latest state, so no accepted delta is lost.
    pub async fn upsert(&self, delta: RegistryDelta) -> RegistryResult<RegistryEntry> {
        let _guard = self.writer.lock().await;

        let mut next = RegistrySnapshot::clone(&self.current.load());
        let entry = next.apply(delta, &self.primary_kind, Utc::now());

        if let Some(path) = &self.path {
            let file = RegistryFileRef {
                version: FORMAT_VERSION,
                saved_at: Utc::now(),
                entries: next.entries().collect(),
            };
            let bytes = serde_json::to_vec_pretty(&file)?;
            write_atomic(path, &bytes)
                .await
                .map_err(|source| RegistryError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        self.current.store(Arc::new(next));

        debug!(paper_id = %entry.paper_id, topics = entry.topic_affiliations.len(), "Committed registry entry");
        Ok(entry)
    }
}
