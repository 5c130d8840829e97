//! Registry types - canonical papers and the deltas that mutate them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::document::{normalize_identifier, normalize_kind, DocumentRecord};
use crate::types::requirement::{RequirementHash, TopicId};

/// Canonical paper identifier. Assigned once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaperId(Uuid);

impl PaperId {
    /// Mint a fresh, time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PaperId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One canonical paper in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub paper_id: PaperId,

    /// Identifier kind -> value. Each pair resolves to exactly this entry.
    pub identifiers: BTreeMap<String, String>,

    /// Lower-cased, alphanumeric-collapsed title used for fuzzy matching
    pub title_normalized: String,

    /// Hash of the requirement set satisfied by the last committed extraction
    pub extraction_target_hash: Option<RequirementHash>,

    /// Topics this paper is relevant to. Only grows.
    pub topic_affiliations: BTreeSet<TopicId>,

    /// Last successful processing
    pub processed_at: DateTime<Utc>,

    /// Most recent record fields, for reads without re-fetching
    pub metadata: DocumentRecord,
}

impl RegistryEntry {
    pub fn is_affiliated(&self, topic: &TopicId) -> bool {
        self.topic_affiliations.contains(topic)
    }
}

/// A change to merge into the registry.
///
/// Only supplied fields are applied. Identifiers and topics are unioned.
#[derive(Debug, Clone, Default)]
pub struct RegistryDelta {
    /// Target entry; when absent the store resolves by identifier or mints one
    pub paper_id: Option<PaperId>,
    pub identifiers: BTreeMap<String, String>,
    pub topics: BTreeSet<TopicId>,
    pub metadata: Option<DocumentRecord>,
    pub extraction_target_hash: Option<RequirementHash>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RegistryDelta {
    /// Delta for a completed extraction (full process or backfill).
    pub fn extracted(
        paper_id: Option<PaperId>,
        record: &DocumentRecord,
        topic: &TopicId,
        hash: &RequirementHash,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            paper_id,
            identifiers: record.normalized_identifiers().collect(),
            topics: BTreeSet::from([topic.clone()]),
            metadata: Some(record.clone()),
            extraction_target_hash: Some(hash.clone()),
            processed_at: Some(at),
        }
    }

    /// Delta that only adds a topic affiliation.
    pub fn affiliation(paper_id: PaperId, topic: &TopicId) -> Self {
        Self {
            paper_id: Some(paper_id),
            topics: BTreeSet::from([topic.clone()]),
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<TopicId>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    pub fn with_identifier(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        let kind = normalize_kind(&kind.into());
        let value = normalize_identifier(&kind, &value.into());
        self.identifiers.insert(kind, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_ids_are_unique() {
        let a = PaperId::new();
        let b = PaperId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_extracted_delta_carries_record_identifiers() {
        let record = DocumentRecord::new("Title")
            .with_doi("10.1/a")
            .with_scoped_id("arxiv:1");
        let delta = RegistryDelta::extracted(
            None,
            &record,
            &TopicId::from("alpha"),
            &RequirementHash::from("h1"),
            Utc::now(),
        );

        assert_eq!(delta.identifiers.get("doi").map(String::as_str), Some("10.1/a"));
        assert_eq!(delta.identifiers.get("arxiv").map(String::as_str), Some("1"));
        assert!(delta.topics.contains(&TopicId::from("alpha")));
        assert!(delta.metadata.is_some());
    }

    #[test]
    fn test_affiliation_delta_is_minimal() {
        let id = PaperId::new();
        let delta = RegistryDelta::affiliation(id, &TopicId::from("beta"));
        assert_eq!(delta.paper_id, Some(id));
        assert!(delta.identifiers.is_empty());
        assert!(delta.metadata.is_none());
        assert!(delta.extraction_target_hash.is_none());
        assert!(delta.processed_at.is_none());
    }
}
