//! Processing actions, per-document outcomes, and run reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LlmError, StageError};
use crate::types::document::DocumentRecord;
use crate::types::extraction::ExtractionResult;
use crate::types::registry::RegistryEntry;
use crate::types::requirement::TopicId;

/// What the pipeline must do for one (document, topic) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingAction {
    /// Unknown paper: acquire, convert, extract, register
    FullProcess,
    /// Known paper whose extraction is stale for this topic's requirements
    Backfill,
    /// Known, up to date, not yet affiliated with this topic
    MapOnly,
    /// Nothing to do
    Skip,
}

impl ProcessingAction {
    /// Acquisition and conversion run only for unknown papers.
    pub fn runs_acquisition(self) -> bool {
        match self {
            Self::FullProcess => true,
            Self::Backfill | Self::MapOnly | Self::Skip => false,
        }
    }

    pub fn runs_extraction(self) -> bool {
        match self {
            Self::FullProcess | Self::Backfill => true,
            Self::MapOnly | Self::Skip => false,
        }
    }

    pub fn writes_registry(self) -> bool {
        match self {
            Self::FullProcess | Self::Backfill | Self::MapOnly => true,
            Self::Skip => false,
        }
    }

    /// Status reported downstream when the action completes.
    pub fn success_status(self) -> DocumentStatus {
        match self {
            Self::FullProcess => DocumentStatus::New,
            Self::Backfill => DocumentStatus::Backfilled,
            Self::MapOnly => DocumentStatus::Mapped,
            Self::Skip => DocumentStatus::Skipped,
        }
    }
}

/// Pipeline stages with their own worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquisition,
    Conversion,
    Extraction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Acquisition => f.write_str("acquisition"),
            Stage::Conversion => f.write_str("conversion"),
            Stage::Extraction => f.write_str("extraction"),
        }
    }
}

/// Per-document status handed to downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    New,
    Backfilled,
    Mapped,
    Skipped,
    Failed,
}

/// Why a document failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Stage,
    CostLimit,
    ProvidersUnavailable,
    Halted,
    Cancelled,
    Registry,
    UnknownTopic,
}

/// A recorded per-document failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub stage: Option<Stage>,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }

    /// Classify a stage error raised while running `stage`.
    pub fn from_stage_error(stage: Stage, error: &StageError) -> Self {
        let kind = match error {
            StageError::Timeout { .. } => FailureKind::Timeout,
            StageError::Failed { .. } => FailureKind::Stage,
            StageError::Llm(LlmError::CostLimitExceeded { .. }) => FailureKind::CostLimit,
            StageError::Llm(LlmError::AllProvidersUnavailable { .. } | LlmError::NoProviders) => {
                FailureKind::ProvidersUnavailable
            }
            StageError::Halted { .. } => FailureKind::Halted,
            StageError::Cancelled => FailureKind::Cancelled,
        };
        Self::new(kind, Some(stage), error.to_string())
    }
}

/// Result of processing one discovered document in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub record: DocumentRecord,
    pub topic: TopicId,
    /// None when the document failed before classification
    pub action: Option<ProcessingAction>,
    pub status: DocumentStatus,
    /// The registry entry after the commit (or as resolved, for skips)
    pub entry: Option<RegistryEntry>,
    /// Fresh extraction output, for new and backfilled documents
    pub extraction: Option<ExtractionResult>,
    pub failure: Option<FailureReason>,
}

impl DocumentOutcome {
    pub fn succeeded(
        record: DocumentRecord,
        topic: TopicId,
        action: ProcessingAction,
        entry: Option<RegistryEntry>,
        extraction: Option<ExtractionResult>,
    ) -> Self {
        Self {
            record,
            topic,
            action: Some(action),
            status: action.success_status(),
            entry,
            extraction,
            failure: None,
        }
    }

    pub fn failed(
        record: DocumentRecord,
        topic: TopicId,
        action: Option<ProcessingAction>,
        reason: FailureReason,
    ) -> Self {
        Self {
            record,
            topic,
            action,
            status: DocumentStatus::Failed,
            entry: None,
            extraction: None,
            failure: Some(reason),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == DocumentStatus::Failed
    }
}

/// Everything that happened in one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<DocumentOutcome>,
    /// Reason LLM work was halted mid-run, if it was
    pub llm_halted: Option<String>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn count(&self, status: DocumentStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Documents eligible for downstream synthesis.
    pub fn succeeded(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| !o.is_failed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DocumentOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    /// Check if every document succeeded.
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}
