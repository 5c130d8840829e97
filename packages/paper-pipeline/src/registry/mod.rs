//! Registry of canonical papers: snapshot state plus the persisted store.

mod snapshot;
mod store;

pub use snapshot::RegistrySnapshot;
pub use store::RegistryStore;
