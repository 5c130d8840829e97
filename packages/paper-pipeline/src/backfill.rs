//! Backfill decision engine.
//!
//! Maps (document, topic, resolution) to the work still owed. Pure and
//! deterministic: re-running it over the same registry state always gives
//! the same answer, which is what makes resumed runs safe.

use tracing::debug;

use crate::identity::Resolution;
use crate::types::document::DocumentRecord;
use crate::types::outcome::ProcessingAction;
use crate::types::requirement::Topic;

/// Decide what a discovered document needs for `topic`.
///
/// 1. Unknown paper: full process.
/// 2. Known, but last extracted against a different requirement set:
///    backfill, even if already affiliated with this topic.
/// 3. Known, current, affiliated: skip.
/// 4. Known, current, not affiliated: map only.
pub fn determine_action(
    record: &DocumentRecord,
    topic: &Topic,
    resolution: &Resolution,
) -> ProcessingAction {
    let Some(entry) = &resolution.entry else {
        debug!(title = %record.title, topic = %topic.id(), "Unregistered paper");
        return ProcessingAction::FullProcess;
    };

    let current = topic.requirement_hash();
    if entry.extraction_target_hash.as_ref() != Some(current) {
        debug!(
            paper_id = %entry.paper_id,
            topic = %topic.id(),
            stored = ?entry.extraction_target_hash,
            current = %current,
            "Requirement set changed"
        );
        return ProcessingAction::Backfill;
    }

    if entry.is_affiliated(topic.id()) {
        ProcessingAction::Skip
    } else {
        ProcessingAction::MapOnly
    }
}
