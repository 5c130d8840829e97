//! Identity resolution against a registry snapshot.

use std::cmp::Ordering;

use tracing::warn;

use super::normalize::{normalize_title, similarity_bound, title_similarity};
use crate::registry::RegistrySnapshot;
use crate::types::config::ResolverConfig;
use crate::types::document::{normalize_kind, DocumentRecord};
use crate::types::registry::{PaperId, RegistryEntry};

/// How a record was matched to a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchBasis {
    /// Exact match on the configured primary identifier kind
    PrimaryIdentifier { kind: String },
    /// Exact match on some other identifier kind
    SecondaryIdentifier { kind: String },
    /// Normalized title similarity at or above the threshold
    FuzzyTitle { score: f64 },
    Unmatched,
}

/// Two resolution paths pointed at different registry entries.
///
/// The chosen entry is always the one in the [`Resolution`]; this records
/// the one that was discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityConflict {
    pub kept: PaperId,
    pub discarded: PaperId,
    pub discarded_basis: MatchBasis,
}

/// Result of resolving one record.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub entry: Option<RegistryEntry>,
    pub basis: MatchBasis,
    pub conflict: Option<IdentityConflict>,
}

impl Resolution {
    pub fn unmatched() -> Self {
        Self {
            entry: None,
            basis: MatchBasis::Unmatched,
            conflict: None,
        }
    }

    pub fn matched(&self) -> bool {
        self.entry.is_some()
    }

    pub fn paper_id(&self) -> Option<PaperId> {
        self.entry.as_ref().map(|e| e.paper_id)
    }
}

/// Decides whether an incoming record denotes an already-registered paper.
///
/// Read-only with respect to the registry.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve a record: primary identifier, then other identifiers, then
    /// fuzzy title. An identifier match always beats a fuzzy one.
    pub fn resolve(&self, record: &DocumentRecord, registry: &RegistrySnapshot) -> Resolution {
        let mut conflict = None;
        let by_identifier = self.match_identifier(record, registry, &mut conflict);

        let fuzzy = match &by_identifier {
            Some(_) if !self.config.detect_conflicts => None,
            _ => self.match_title(record, registry),
        };

        match (by_identifier, fuzzy) {
            (Some((entry, basis)), fuzzy) => {
                if let Some((other, score)) = fuzzy.filter(|(f, _)| f.paper_id != entry.paper_id) {
                    warn!(
                        title = %record.title,
                        kept = %entry.paper_id,
                        discarded = %other.paper_id,
                        score,
                        "Identifier and title matches disagree, keeping identifier match"
                    );
                    if conflict.is_none() {
                        conflict = Some(IdentityConflict {
                            kept: entry.paper_id,
                            discarded: other.paper_id,
                            discarded_basis: MatchBasis::FuzzyTitle { score },
                        });
                    }
                }
                Resolution {
                    entry: Some(entry.clone()),
                    basis,
                    conflict,
                }
            }
            (None, Some((entry, score))) => Resolution {
                entry: Some(entry.clone()),
                basis: MatchBasis::FuzzyTitle { score },
                conflict: None,
            },
            (None, None) => Resolution::unmatched(),
        }
    }

    /// First identifier match wins: the primary kind, then the others in
    /// record order. Any later match on a different entry is a conflict.
    fn match_identifier<'a>(
        &self,
        record: &DocumentRecord,
        registry: &'a RegistrySnapshot,
        conflict: &mut Option<IdentityConflict>,
    ) -> Option<(&'a RegistryEntry, MatchBasis)> {
        let primary_kind = normalize_kind(&self.config.primary_identifier);
        let identifiers: Vec<(String, String)> = record.normalized_identifiers().collect();

        let primary = identifiers.iter().filter(|(kind, _)| *kind == primary_kind);
        let others = identifiers.iter().filter(|(kind, _)| *kind != primary_kind);
        let mut matches = primary.chain(others).filter_map(|(kind, value)| {
            let entry = registry.find_by_identifier(kind, value)?;
            let basis = if *kind == primary_kind {
                MatchBasis::PrimaryIdentifier { kind: kind.clone() }
            } else {
                MatchBasis::SecondaryIdentifier { kind: kind.clone() }
            };
            Some((entry, basis))
        });

        let (kept, basis) = matches.next()?;
        if let Some((other, other_basis)) = matches.find(|(e, _)| e.paper_id != kept.paper_id) {
            warn!(
                title = %record.title,
                kept = %kept.paper_id,
                kept_basis = ?basis,
                discarded = %other.paper_id,
                discarded_basis = ?other_basis,
                "Record identifiers resolve to different registry entries"
            );
            *conflict = Some(IdentityConflict {
                kept: kept.paper_id,
                discarded: other.paper_id,
                discarded_basis: other_basis,
            });
        }
        Some((kept, basis))
    }

    fn match_title<'a>(
        &self,
        record: &DocumentRecord,
        registry: &'a RegistrySnapshot,
    ) -> Option<(&'a RegistryEntry, f64)> {
        let title = normalize_title(&record.title);
        if title.is_empty() {
            return None;
        }
        let threshold = self.config.similarity_threshold;
        let title_len = title.chars().count();

        let mut best: Option<(&RegistryEntry, f64)> = None;
        for entry in registry.entries() {
            if entry.title_normalized.is_empty() {
                continue;
            }
            let bound = similarity_bound(title_len, entry.title_normalized.chars().count());
            if bound < threshold {
                continue;
            }
            let score = title_similarity(&title, &entry.title_normalized);
            if score < threshold {
                continue;
            }
            best = match best {
                Some(current) if !outranks((entry, score), current) => Some(current),
                _ => Some((entry, score)),
            };
        }
        best
    }
}

/// Higher score wins; ties go to the earliest `processed_at`, then the
/// smallest id so the choice never depends on iteration order.
fn outranks(candidate: (&RegistryEntry, f64), current: (&RegistryEntry, f64)) -> bool {
    match candidate.1.partial_cmp(&current.1) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Less) => false,
        _ => {
            (candidate.0.processed_at, candidate.0.paper_id)
                < (current.0.processed_at, current.0.paper_id)
        }
    }
}
