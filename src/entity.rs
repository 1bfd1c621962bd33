//! Resolved identities.
//!
//! A `CandidateEntity` is a person the store already knows about. Incoming
//! records either corroborate one of these, create a new one, or wait in the
//! review queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::household::HouseholdId;
use crate::normalize::{name_key, NormalizedSignals};
use crate::record::{RecordId, SourceSystem};

const RECORD_ENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x2b9e_41c7_58d0_4f6a_9c13_e7a4_06d5_b812);

/// Globally unique, stable entity identifier.
///
/// # Examples
///
/// ```
/// use contact_resolver::EntityId;
///
/// let id = EntityId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The id of the entity created on behalf of `record`.
    ///
    /// Every attempt to resolve the same record derives the same id, so a
    /// retried creation finds the entity from the earlier attempt instead of
    /// making a second one.
    #[must_use]
    pub fn for_record(record: RecordId) -> Self {
        Self(Uuid::new_v5(&RECORD_ENTITY_NAMESPACE, record.as_uuid().as_bytes()))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// An unordered pair of entity ids.
///
/// Construction sorts the ids, so `(a, b)` and `(b, a)` compare equal and hash
/// identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityPair {
    low: EntityId,
    high: EntityId,
}

impl EntityPair {
    /// Creates the pair in canonical order.
    #[must_use]
    pub fn new(a: EntityId, b: EntityId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// The smaller id.
    #[must_use]
    pub const fn low(&self) -> EntityId {
        self.low
    }

    /// The larger id.
    #[must_use]
    pub const fn high(&self) -> EntityId {
        self.high
    }

    /// Returns true if `id` is one side of the pair.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.low == id || self.high == id
    }
}

/// A known person identity.
///
/// Signal fields hold canonical (normalized) forms; `display_name` keeps the
/// original spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    /// Stable identifier.
    pub entity_id: EntityId,

    /// Canonical emails.
    #[serde(default)]
    pub emails: Vec<String>,

    /// Canonical 10-digit phones.
    #[serde(default)]
    pub phones: Vec<String>,

    /// Name as first seen, for display. Empty if no record has named this
    /// entity yet.
    #[serde(default)]
    pub display_name: String,

    /// Canonical address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Household membership edge (person → household).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub household_id: Option<HouseholdId>,

    /// Systems that contributed evidence.
    #[serde(default)]
    pub sources: Vec<SourceSystem>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last time an incoming record corroborated this entity.
    pub last_seen_at: DateTime<Utc>,

    /// Monotonic version, starting at 1.
    #[serde(default = "default_version")]
    pub version: u64,
}

const fn default_version() -> u64 {
    1
}

impl CandidateEntity {
    /// Creates an entity with the given display name and no signals.
    #[must_use]
    pub fn new(display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id: EntityId::new(),
            emails: Vec::new(),
            phones: Vec::new(),
            display_name: display_name.into(),
            address: None,
            household_id: None,
            sources: Vec::new(),
            created_at: now,
            last_seen_at: now,
            version: 1,
        }
    }

    /// Creates an entity from normalized record signals.
    ///
    /// A record without a usable name leaves `display_name` empty.
    #[must_use]
    pub fn from_signals(signals: &NormalizedSignals, source: &SourceSystem) -> Self {
        let mut entity = Self::new(String::new());
        entity.absorb(signals, source);
        entity.last_seen_at = entity.created_at;
        entity
    }

    /// Comparison key of the display name, `None` for an unnamed entity.
    #[must_use]
    pub fn name_key(&self) -> Option<String> {
        let key = name_key(&self.display_name);
        (!key.is_empty()).then_some(key)
    }

    /// Returns true if the entity carries a comparable name.
    #[must_use]
    pub fn has_name(&self) -> bool {
        self.name_key().is_some()
    }

    /// Adds a canonical email if not already present.
    pub fn add_email(&mut self, email: impl Into<String>) {
        let email = email.into();
        if !email.is_empty() && !self.emails.iter().any(|e| *e == email) {
            self.emails.push(email);
        }
    }

    /// Adds a canonical phone if not already present.
    pub fn add_phone(&mut self, phone: impl Into<String>) {
        let phone = phone.into();
        if !phone.is_empty() && !self.phones.iter().any(|p| *p == phone) {
            self.phones.push(phone);
        }
    }

    /// Builder-style email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.add_email(email);
        self
    }

    /// Builder-style phone.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.add_phone(phone);
        self
    }

    /// Builder-style address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Folds a record's signals in as corroborating evidence.
    ///
    /// New emails and phones are appended; an existing address or name is
    /// never overwritten.
    pub fn absorb(&mut self, signals: &NormalizedSignals, source: &SourceSystem) {
        if let Some(email) = &signals.email {
            self.add_email(email.clone());
        }
        if let Some(phone) = &signals.phone {
            self.add_phone(phone.clone());
        }
        if self.address.is_none() {
            self.address.clone_from(&signals.address);
        }
        if !self.has_name() {
            if let Some(name) = &signals.name {
                self.display_name.clone_from(&name.display);
            }
        }
        if !self.sources.contains(source) {
            self.sources.push(source.clone());
        }
        self.last_seen_at = Utc::now();
    }

    /// The 3-digit area codes of this entity's phones.
    pub fn area_codes(&self) -> impl Iterator<Item = &str> {
        self.phones.iter().filter_map(|p| p.get(..3))
    }
}
