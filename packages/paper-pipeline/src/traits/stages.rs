//! Stage collaborators - acquisition and conversion.
//!
//! Fetching binaries and turning them into text are ordinary jobs that live
//! outside the core. The orchestrator only decides *whether* and *when* to
//! call them, under its pool limits and timeouts.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CollaboratorError;
use crate::types::document::DocumentRecord;
use crate::types::registry::RegistryEntry;

/// Pipeline stage implementations supplied by the application.
#[async_trait]
pub trait DocumentStages: Send + Sync {
    /// Fetch the document's binary content (usually a PDF).
    async fn acquire(&self, record: &DocumentRecord) -> Result<Bytes, CollaboratorError>;

    /// Convert fetched content to text.
    ///
    /// Implementations that want backfills to see full text should keep the
    /// converted output and return it from [`stored_text`](Self::stored_text).
    async fn convert(
        &self,
        record: &DocumentRecord,
        content: Bytes,
    ) -> Result<String, CollaboratorError>;

    /// Previously converted text for a registered paper.
    ///
    /// Backfills never re-acquire; when this returns `None` extraction falls
    /// back to the stored abstract.
    async fn stored_text(&self, _entry: &RegistryEntry) -> Result<Option<String>, CollaboratorError> {
        Ok(None)
    }
}

#[async_trait]
impl<S: DocumentStages + ?Sized> DocumentStages for std::sync::Arc<S> {
    async fn acquire(&self, record: &DocumentRecord) -> Result<Bytes, CollaboratorError> {
        (**self).acquire(record).await
    }

    async fn convert(
        &self,
        record: &DocumentRecord,
        content: Bytes,
    ) -> Result<String, CollaboratorError> {
        (**self).convert(record, content).await
    }

    async fn stored_text(&self, entry: &RegistryEntry) -> Result<Option<String>, CollaboratorError> {
        (**self).stored_text(entry).await
    }
}
