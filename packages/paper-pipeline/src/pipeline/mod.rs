//! Run orchestration: stage queues and worker pools.

mod orchestrator;
pub mod queue;

pub use orchestrator::{DiscoveredDocument, Orchestrator};
pub use queue::{stage_queue, QueueReceiver, QueueSender};
