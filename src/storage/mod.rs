//! Storage contracts and in-memory backends.
//!
//! The traits describe what the resolution core needs from the entity,
//! household and review stores. Production deployments implement them over
//! their own database; the in-memory backends serve tests and embedded use.

mod lock;
mod memory;
mod traits;

pub use lock::EditLock;
pub use memory::{InMemoryEntityStore, InMemoryHouseholdStore, InMemoryReviewStore, InMemoryStores};
pub use traits::{EntityStore, HouseholdStore, ReviewStore, StorageError, UpsertOutcome};
