//! In-memory registry state and delta merging.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::identity::normalize_title;
use crate::types::{
    document::DocumentRecord,
    registry::{PaperId, RegistryDelta, RegistryEntry},
    requirement::TopicId,
};

/// A complete, internally consistent view of the registry.
///
/// Snapshots are immutable once published; the store builds a new one for
/// every committed change.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: BTreeMap<PaperId, RegistryEntry>,
    /// (kind, value) -> owning paper
    identifier_index: HashMap<(String, String), PaperId>,
}

impl RegistrySnapshot {
    /// Build a snapshot from persisted entries, rebuilding the identifier index.
    ///
    /// If two entries claim the same (kind, value) pair, the most recently
    /// processed one keeps it.
    pub fn from_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        let mut sorted: Vec<RegistryEntry> = entries.into_iter().collect();
        sorted.sort_by_key(|e| e.processed_at);

        let mut snapshot = Self::default();
        for entry in sorted {
            for (kind, value) in &entry.identifiers {
                let key = (kind.clone(), value.clone());
                if let Some(previous) = snapshot.identifier_index.insert(key, entry.paper_id) {
                    warn!(
                        kind = %kind,
                        value = %value,
                        kept = %entry.paper_id,
                        dropped = %previous,
                        "Duplicate identifier in persisted registry"
                    );
                    if let Some(prev) = snapshot.entries.get_mut(&previous) {
                        prev.identifiers.remove(kind);
                    }
                }
            }
            snapshot.entries.insert(entry.paper_id, entry);
        }
        snapshot
    }

    pub fn get(&self, paper_id: &PaperId) -> Option<&RegistryEntry> {
        self.entries.get(paper_id)
    }

    /// Exact identifier lookup.
    pub fn find_by_identifier(&self, kind: &str, value: &str) -> Option<&RegistryEntry> {
        self.identifier_index
            .get(&(kind.to_string(), value.to_string()))
            .and_then(|id| self.entries.get(id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Entries affiliated with a topic.
    pub fn entries_for_topic<'a>(
        &'a self,
        topic: &'a TopicId,
    ) -> impl Iterator<Item = &'a RegistryEntry> + 'a {
        self.entries.values().filter(move |e| e.is_affiliated(topic))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a delta, returning the entry it landed on.
    ///
    /// Target selection: the delta's explicit id if it exists, else the entry
    /// owning the delta's primary identifier, else any other identifier,
    /// else a new entry.
    pub(crate) fn apply(
        &mut self,
        delta: RegistryDelta,
        primary_kind: &str,
        now: DateTime<Utc>,
    ) -> RegistryEntry {
        let paper_id = self
            .target_for(&delta, primary_kind)
            .or(delta.paper_id)
            .unwrap_or_else(PaperId::new);

        let mut entry = self.entries.remove(&paper_id).unwrap_or_else(|| RegistryEntry {
            paper_id,
            identifiers: BTreeMap::new(),
            title_normalized: String::new(),
            extraction_target_hash: None,
            topic_affiliations: Default::default(),
            processed_at: delta.processed_at.unwrap_or(now),
            metadata: DocumentRecord::new(""),
        });

        for (kind, value) in delta.identifiers {
            let key = (kind.clone(), value.clone());
            if let Some(owner) = self.identifier_index.get(&key).copied() {
                if owner != paper_id {
                    // Last write wins: the pair moves to this entry.
                    warn!(
                        kind = %kind,
                        value = %value,
                        from = %owner,
                        to = %paper_id,
                        "Identifier reassigned between registry entries"
                    );
                    if let Some(other) = self.entries.get_mut(&owner) {
                        other.identifiers.remove(&kind);
                    }
                }
            }
            if let Some(old) = entry.identifiers.insert(kind.clone(), value.clone()) {
                if old != value {
                    self.identifier_index.remove(&(kind, old));
                }
            }
            self.identifier_index.insert(key, paper_id);
        }

        entry.topic_affiliations.extend(delta.topics);

        if let Some(metadata) = delta.metadata {
            entry.title_normalized = normalize_title(&metadata.title);
            entry.metadata = metadata;
        }
        if let Some(hash) = delta.extraction_target_hash {
            entry.extraction_target_hash = Some(hash);
        }
        if let Some(at) = delta.processed_at {
            entry.processed_at = at;
        }

        self.entries.insert(paper_id, entry.clone());
        entry
    }

    fn target_for(&self, delta: &RegistryDelta, primary_kind: &str) -> Option<PaperId> {
        if let Some(id) = delta.paper_id.filter(|id| self.entries.contains_key(id)) {
            return Some(id);
        }

        let primary = delta
            .identifiers
            .get_key_value(primary_kind)
            .into_iter();
        let others = delta
            .identifiers
            .iter()
            .filter(|(kind, _)| kind.as_str() != primary_kind);

        primary.chain(others).find_map(|(kind, value)| {
            self.identifier_index
                .get(&(kind.clone(), value.clone()))
                .copied()
        })
    }
}
