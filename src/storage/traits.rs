//! Abstract storage traits for the resolution core.
//!
//! The entity store, household store and review store are external systems in
//! production. These traits are the contract the resolver needs from them;
//! `memory` provides thread-safe reference implementations.

use thiserror::Error;

use crate::decision::MatchDecision;
use crate::dedup::DedupCandidate;
use crate::entity::{CandidateEntity, EntityId, EntityPair};
use crate::household::{Household, HouseholdId, PlaceId};
use crate::record::RecordId;
use crate::review::{ReviewFilter, ReviewItem, ReviewItemId, ReviewOutcome};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Household not found.
    #[error("Household not found: {0}")]
    HouseholdNotFound(HouseholdId),

    /// Review item not found.
    #[error("Review item not found: {0}")]
    ReviewItemNotFound(ReviewItemId),

    /// Terminal transition attempted on a resolved item.
    #[error("Review item already resolved: {0}")]
    AlreadyResolved(ReviewItemId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Version check failed on update.
    #[error("Stale write for {id}: expected version above {current}, got {attempted}")]
    StaleVersion {
        /// Entity being written.
        id: EntityId,
        /// Version currently stored.
        current: u64,
        /// Version the caller tried to write.
        attempted: u64,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The backend did not answer in time.
    #[error("Storage timeout: {0}")]
    Timeout(String),
}

/// Storage trait for resolved person identities.
///
/// # Merge semantics
/// After `merge(primary, secondary)`, every lookup of `secondary` returns the
/// merged primary. Ids are never reused.
pub trait EntityStore: Send + Sync {
    /// Insert a new entity. Returns error if ID already exists.
    fn insert(&self, entity: CandidateEntity) -> Result<(), StorageError>;

    /// Get an entity by ID, following merge redirects.
    fn get(&self, id: EntityId) -> Result<Option<CandidateEntity>, StorageError>;

    /// Replace an entity. `entity.version` must exceed the stored version.
    fn update(&self, entity: CandidateEntity) -> Result<(), StorageError>;

    /// Entities holding this canonical email.
    fn find_by_email(&self, email: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError>;

    /// Entities holding this canonical phone.
    fn find_by_phone(&self, phone: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError>;

    /// Entities whose name key shares trigrams with `name_key`, best overlap first.
    fn find_by_name_fuzzy(&self, name_key: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError>;

    /// Entities at this canonical address.
    fn find_by_address(&self, address: &str, limit: usize) -> Result<Vec<CandidateEntity>, StorageError>;

    /// Every live (unmerged) entity.
    fn list_all(&self) -> Result<Vec<CandidateEntity>, StorageError>;

    /// The live id `id` resolves to.
    ///
    /// # Errors
    /// `EntityNotFound` if the id was never stored.
    fn canonical_id(&self, id: EntityId) -> Result<EntityId, StorageError>;

    /// Merge `secondary` into `primary`, returning the merged entity.
    ///
    /// # Errors
    /// - `EntityNotFound`: if either side does not exist
    /// - `BackendError`: if both ids resolve to the same entity
    fn merge(&self, primary: EntityId, secondary: EntityId) -> Result<CandidateEntity, StorageError>;

    /// Try to take the edit lock on both entities of `pair`.
    ///
    /// Returns false, taking nothing, if another holder has either entity
    /// locked. Locks are per entity, so `(a, b)` excludes `(a, a)` and `(b, c)`.
    fn try_lock(&self, pair: EntityPair, holder: &str) -> Result<bool, StorageError>;

    /// Release an edit lock taken by `holder`.
    fn unlock(&self, pair: EntityPair, holder: &str) -> Result<(), StorageError>;
}

/// Storage trait for households.
pub trait HouseholdStore: Send + Sync {
    /// Insert a new household.
    fn insert(&self, household: Household) -> Result<(), StorageError>;

    /// Get a household by ID.
    fn get(&self, id: HouseholdId) -> Result<Option<Household>, StorageError>;

    /// Replace a household. Returns error if not found.
    fn update(&self, household: Household) -> Result<(), StorageError>;

    /// Households whose primary place is `place`.
    fn find_by_place(&self, place: &PlaceId) -> Result<Vec<Household>, StorageError>;
}

/// Result of upserting a dedup candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New pending row.
    Inserted,
    /// Pending row whose similarity changed.
    Updated,
    /// Pending row with the same similarity, or a resolved row left alone.
    Unchanged,
}

/// Durable review queue.
///
/// Terminal transitions go through `complete`, which must be an atomic
/// compare-and-set on the item's status.
pub trait ReviewStore: Send + Sync {
    /// Persist a decision. Fails with `DuplicateKey` if the record already has one.
    fn insert_decision(&self, decision: MatchDecision) -> Result<(), StorageError>;

    /// Get a decision by ID.
    fn get_decision(&self, id: ReviewItemId) -> Result<Option<MatchDecision>, StorageError>;

    /// The decision made for `record`, if any.
    fn decision_for_record(&self, record: RecordId) -> Result<Option<MatchDecision>, StorageError>;

    /// Insert or refresh a dedup candidate keyed by pair and tier.
    ///
    /// Resolved rows are never reopened.
    fn upsert_duplicate(&self, candidate: DedupCandidate) -> Result<UpsertOutcome, StorageError>;

    /// Get a dedup candidate by ID.
    fn get_duplicate(&self, id: ReviewItemId) -> Result<Option<DedupCandidate>, StorageError>;

    /// Get a queue item (a `review_pending` decision or a dedup candidate).
    fn get_item(&self, id: ReviewItemId) -> Result<Option<ReviewItem>, StorageError>;

    /// Queue items matching `filter`, in no particular order.
    fn query(&self, filter: &ReviewFilter) -> Result<Vec<ReviewItem>, StorageError>;

    /// Pending queue items pointing at `entity`.
    fn pending_referencing(&self, entity: EntityId) -> Result<Vec<ReviewItem>, StorageError>;

    /// Atomically move a pending item to its terminal state.
    ///
    /// # Errors
    /// - `ReviewItemNotFound` if no queue item has this id
    /// - `AlreadyResolved` if the item is already terminal
    fn complete(&self, id: ReviewItemId, outcome: &ReviewOutcome) -> Result<ReviewItem, StorageError>;

    /// Record that a pair must never be paired again.
    fn suppress(&self, pair: EntityPair) -> Result<(), StorageError>;

    /// Returns true if the pair was suppressed.
    fn is_suppressed(&self, pair: EntityPair) -> Result<bool, StorageError>;
}
