//! Households of co-resident identities.
//!
//! Membership is a one-directional edge from a person to a household keyed by
//! place. There is no person-to-person graph, so cycles cannot form.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;

/// Unique identifier for a household.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HouseholdId(Uuid);

impl HouseholdId {
    /// Creates a new random household ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HouseholdId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HouseholdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical place key (the canonical address string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceId(String);

impl PlaceId {
    /// Wraps a canonical address.
    #[must_use]
    pub fn new(canonical_address: impl Into<String>) -> Self {
        Self(canonical_address.into())
    }

    /// The canonical address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a person within a household.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseholdRole {
    /// The resident the household was first inferred around.
    Primary,
    /// Any other resident.
    Member,
}

/// What evidence tied a member to the household.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredFrom {
    /// Shares a phone number with a resident.
    SharedPhone,
    /// Shares the place's address.
    SharedAddress,
    /// Shares both.
    SharedPhoneAndAddress,
}

impl InferredFrom {
    /// Picks the variant for the given shared signals.
    #[must_use]
    pub const fn from_shared(phone: bool, address: bool) -> Option<Self> {
        match (phone, address) {
            (true, true) => Some(Self::SharedPhoneAndAddress),
            (true, false) => Some(Self::SharedPhone),
            (false, true) => Some(Self::SharedAddress),
            (false, false) => None,
        }
    }
}

impl fmt::Display for InferredFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedPhone => write!(f, "shared_phone"),
            Self::SharedAddress => write!(f, "shared_address"),
            Self::SharedPhoneAndAddress => write!(f, "shared_phone_and_address"),
        }
    }
}

/// One resident of a household.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdMember {
    /// The resident.
    pub person_id: EntityId,
    /// Role within the household.
    pub role: HouseholdRole,
    /// Confidence of the inferred membership.
    pub confidence: f64,
    /// Evidence for membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_from: Option<InferredFrom>,
    /// When the member was added.
    pub added_at: DateTime<Utc>,
}

/// Distinct identities sharing one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Household {
    /// Unique identifier.
    pub household_id: HouseholdId,
    /// The place the household lives at.
    pub primary_place_id: PlaceId,
    /// Residents, each at most once.
    pub members: Vec<HouseholdMember>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Household {
    /// Creates a household at `place` with `primary` as its first resident.
    #[must_use]
    pub fn new(place: PlaceId, primary: EntityId) -> Self {
        let now = Utc::now();
        Self {
            household_id: HouseholdId::new(),
            primary_place_id: place,
            members: vec![HouseholdMember {
                person_id: primary,
                role: HouseholdRole::Primary,
                confidence: 1.0,
                inferred_from: None,
                added_at: now,
            }],
            created_at: now,
        }
    }

    /// Returns true if `person` is already a resident.
    #[must_use]
    pub fn has_member(&self, person: EntityId) -> bool {
        self.members.iter().any(|m| m.person_id == person)
    }

    /// Adds a resident. Returns false if the person was already present.
    pub fn add_member(
        &mut self,
        person: EntityId,
        confidence: f64,
        inferred_from: Option<InferredFrom>,
    ) -> bool {
        if self.has_member(person) {
            return false;
        }
        self.members.push(HouseholdMember {
            person_id: person,
            role: HouseholdRole::Member,
            confidence: confidence.clamp(0.0, 1.0),
            inferred_from,
            added_at: Utc::now(),
        });
        true
    }

    /// Ids of all residents.
    pub fn member_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.members.iter().map(|m| m.person_id)
    }
}
