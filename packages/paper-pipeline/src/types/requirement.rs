//! Extraction requirements and topics.
//!
//! The pipeline never interprets what a target means. It only needs a stable
//! fingerprint of the requirement set so the backfill engine can tell when a
//! topic's requirements changed since a paper was last extracted.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A named piece of information the extraction stage must produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionTarget {
    pub name: String,
    pub description: String,

    /// Output-format tag (`text`, `list`, `number`, ...)
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub required: bool,
}

fn default_format() -> String {
    "text".to_string()
}

impl ExtractionTarget {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            format: default_format(),
            required: false,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// The tuple that participates in the fingerprint.
    fn fingerprint_tuple(&self) -> (String, String, String) {
        (
            collapse_whitespace(&self.name).to_lowercase(),
            collapse_whitespace(&self.description),
            collapse_whitespace(&self.format).to_lowercase(),
        )
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable hash of a requirement set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementHash(String);

impl RequirementHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequirementHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequirementHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The ordered set of targets a topic asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionRequirement {
    targets: Vec<ExtractionTarget>,
}

impl ExtractionRequirement {
    pub fn new(targets: impl IntoIterator<Item = ExtractionTarget>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
        }
    }

    pub fn with_target(mut self, target: ExtractionTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(&self) -> &[ExtractionTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// SHA-256 over the sorted, normalized (name, description, format) tuples.
    ///
    /// Independent of target order and of the `required` flag; identical
    /// across process restarts.
    pub fn fingerprint(&self) -> RequirementHash {
        let tuples: BTreeSet<(String, String, String)> = self
            .targets
            .iter()
            .map(ExtractionTarget::fingerprint_tuple)
            .collect();

        let mut hasher = Sha256::new();
        for (name, description, format) in &tuples {
            // Length-prefix each field so ("ab","c") and ("a","bc") differ.
            for field in [name, description, format] {
                hasher.update((field.len() as u64).to_be_bytes());
                hasher.update(field.as_bytes());
            }
        }
        RequirementHash(format!("{:x}", hasher.finalize()))
    }
}

/// Identifier of a research topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A topic with its extraction requirements.
///
/// The requirement hash is computed once at construction.
#[derive(Debug, Clone)]
pub struct Topic {
    id: TopicId,
    requirements: ExtractionRequirement,
    requirement_hash: RequirementHash,
}

impl Topic {
    pub fn new(id: impl Into<TopicId>, requirements: ExtractionRequirement) -> Self {
        let requirement_hash = requirements.fingerprint();
        Self {
            id: id.into(),
            requirements,
            requirement_hash,
        }
    }

    pub fn id(&self) -> &TopicId {
        &self.id
    }

    pub fn requirements(&self) -> &ExtractionRequirement {
        &self.requirements
    }

    pub fn requirement_hash(&self) -> &RequirementHash {
        &self.requirement_hash
    }
}
