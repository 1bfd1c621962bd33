//! Incoming contact records.
//!
//! An `IncomingRecord` is the set of raw signals an upstream ingestion
//! pipeline extracted from one row of a source system. It is consumed exactly
//! once by the resolver.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new random record ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a record ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream system a record was ingested from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceSystem {
    /// Clinic management export.
    ClinicHq,
    /// Web intake form.
    JotForm,
    /// Airtable base.
    Airtable,
    /// One-off legacy import.
    LegacyImport,
    /// Manual entry by staff.
    Manual,
    /// Any other named system.
    Other(String),
}

impl TryFrom<String> for SourceSystem {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err("source system cannot be empty".to_string());
        }
        Ok(match value.to_ascii_lowercase().as_str() {
            "clinichq" => Self::ClinicHq,
            "jotform" => Self::JotForm,
            "airtable" => Self::Airtable,
            "legacy_import" | "legacy" => Self::LegacyImport,
            "manual" => Self::Manual,
            _ => Self::Other(value.to_string()),
        })
    }
}

impl From<SourceSystem> for String {
    fn from(value: SourceSystem) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClinicHq => write!(f, "clinichq"),
            Self::JotForm => write!(f, "jotform"),
            Self::Airtable => write!(f, "airtable"),
            Self::LegacyImport => write!(f, "legacy_import"),
            Self::Manual => write!(f, "manual"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Raw signals extracted from a new row of data.
///
/// All signals are optional; the resolver normalizes each one independently.
///
/// # Examples
///
/// ```
/// use contact_resolver::{IncomingRecord, SourceSystem};
///
/// let record = IncomingRecord::builder(SourceSystem::JotForm)
///     .email("Jane.Doe+cats@Example.com")
///     .name("Jane Doe")
///     .build();
/// assert_eq!(record.source_system, SourceSystem::JotForm);
/// assert!(record.phone.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingRecord {
    /// Record identifier; stable across replays of the same row.
    pub record_id: RecordId,
    /// Raw email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Raw phone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Raw display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw postal address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Originating system.
    pub source_system: SourceSystem,
    /// Primary key of the row in the originating system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_id: Option<String>,
    /// When the ingestion pipeline received the row.
    pub received_at: DateTime<Utc>,
}

impl IncomingRecord {
    /// Starts building a record from the given source.
    #[must_use]
    pub fn builder(source_system: SourceSystem) -> IncomingRecordBuilder {
        IncomingRecordBuilder::new(source_system)
    }

    /// Deterministic record ID derived from the source and raw signals.
    ///
    /// Replaying the same upstream row yields the same ID, which lets the
    /// resolver keep its one-decision-per-record guarantee across retries.
    #[must_use]
    pub fn fingerprint(
        source_system: &SourceSystem,
        source_record_id: Option<&str>,
        signals: [Option<&str>; 4],
    ) -> RecordId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_system.to_string().as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(source_record_id.unwrap_or("").as_bytes());
        for signal in signals {
            hasher.update(&[0x1e]);
            hasher.update(signal.map(str::trim).unwrap_or("").as_bytes());
        }
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        RecordId(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    /// Returns true if every raw signal is absent or blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [&self.email, &self.phone, &self.name, &self.address]
            .iter()
            .all(|s| s.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

/// Builder for `IncomingRecord`.
#[derive(Debug, Clone)]
pub struct IncomingRecordBuilder {
    record_id: Option<RecordId>,
    email: Option<String>,
    phone: Option<String>,
    name: Option<String>,
    address: Option<String>,
    source_system: SourceSystem,
    source_record_id: Option<String>,
    received_at: Option<DateTime<Utc>>,
}

impl IncomingRecordBuilder {
    fn new(source_system: SourceSystem) -> Self {
        Self {
            record_id: None,
            email: None,
            phone: None,
            name: None,
            address: None,
            source_system,
            source_record_id: None,
            received_at: None,
        }
    }

    /// Explicit record ID (otherwise a content fingerprint is used).
    #[must_use]
    pub fn record_id(mut self, id: RecordId) -> Self {
        self.record_id = Some(id);
        self
    }

    /// Raw email.
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Raw phone.
    #[must_use]
    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Raw name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Raw address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Upstream primary key.
    #[must_use]
    pub fn source_record_id(mut self, id: impl Into<String>) -> Self {
        self.source_record_id = Some(id.into());
        self
    }

    /// Receipt time (defaults to now).
    #[must_use]
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Builds the record.
    #[must_use]
    pub fn build(self) -> IncomingRecord {
        let record_id = self.record_id.unwrap_or_else(|| {
            IncomingRecord::fingerprint(
                &self.source_system,
                self.source_record_id.as_deref(),
                [
                    self.email.as_deref(),
                    self.phone.as_deref(),
                    self.name.as_deref(),
                    self.address.as_deref(),
                ],
            )
        });
        IncomingRecord {
            record_id,
            email: self.email,
            phone: self.phone,
            name: self.name,
            address: self.address,
            source_system: self.source_system,
            source_record_id: self.source_record_id,
            received_at: self.received_at.unwrap_or_else(Utc::now),
        }
    }
}
