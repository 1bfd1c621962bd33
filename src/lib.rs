//! # contact-resolver - Identity resolution for contact records
//!
//! Decides whether an incoming contact record (a form submission, a clinic
//! appointment, a legacy import row) refers to a person already known, a new
//! person, or someone who needs human review.
//!
//! ## Core Concepts
//!
//! - **Signals**: email, phone, name and address, canonicalized before any comparison
//! - **Candidate**: an existing entity that shares at least one signal with a record
//! - **Decision**: the persisted classification of one record against its best candidate
//! - **Household**: co-residents sharing a phone or address who must never be merged
//! - **Dedup candidate**: a suspected pair of existing entities, graded by match tier
//! - **Review queue**: pending decisions and dedup candidates awaiting a human
//!
//! ## Usage
//!
//! ```rust,ignore
//! use contact_resolver::{IncomingRecord, ResolutionConfig, Resolver, SourceSystem};
//! use contact_resolver::storage::InMemoryStores;
//!
//! let stores = InMemoryStores::new();
//! let resolver = Resolver::in_memory(ResolutionConfig::default(), &stores)?;
//!
//! let record = IncomingRecord::builder(SourceSystem::JotForm)
//!     .email("jane@example.com")
//!     .phone("(707) 555-0134")
//!     .name("Jane Doe")
//!     .build();
//! let decision = resolver.resolve(&record)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod entity;
pub mod error;
pub mod household;
pub mod record;

// Matching pipeline
pub mod candidates;
pub mod decision;
pub mod normalize;
pub mod resolver;
pub mod scoring;

// Dedup, review and storage
pub mod dedup;
pub mod review;
pub mod runtime;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use candidates::CandidateFinder;
pub use config::{DedupPolicy, HouseholdPolicy, ResolutionConfig, SignalWeights, Thresholds};
pub use decision::{Classifier, DecisionType, MatchDecision};
pub use dedup::{DedupCandidate, DedupScanner, MatchTier, ScanReport};
pub use entity::{CandidateEntity, EntityId, EntityPair};
pub use error::{ResolutionError, ResolverError, ResolverResult, SignalKind, ValidationError};
pub use household::{Household, HouseholdId, HouseholdRole, InferredFrom, PlaceId};
pub use normalize::{AddressNormalizer, NormalizedSignals, SignalNormalizer};
pub use record::{IncomingRecord, RecordId, SourceSystem};
pub use resolver::Resolver;
pub use review::{
    BatchOutcome, ReviewAction, ReviewFilter, ReviewItem, ReviewItemId, ReviewPage, ReviewQueue, ReviewResolution,
    ReviewStatus,
};
pub use runtime::{Lane, ResolutionHandle, ResolutionRuntime, ResolutionRuntimeConfig};
pub use scoring::{ScoredCandidate, Scorer, SignalScores};
pub use storage::{EntityStore, HouseholdStore, ReviewStore, StorageError};
