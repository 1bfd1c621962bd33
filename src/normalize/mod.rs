//! Signal normalization.
//!
//! Canonicalizes raw email, phone, name and address strings so that records
//! from different source systems compare equal when they describe the same
//! person. Email, phone and name normalization are pure functions; address
//! normalization delegates to an external collaborator.

pub mod address;
pub mod email;
pub mod name;
pub mod phone;

use serde::{Deserialize, Serialize};

pub use address::{AddressNormalizer, AddressNormalizerError, AddressResolver, BasicAddressNormalizer};
pub use email::{canonical_email, normalize_email};
pub use name::{canonical_name, name_key, normalize_name, trigrams, NormalizedName};
pub use phone::{canonical_phone, normalize_phone};

use crate::error::{ResolverError, ResolverResult, SignalKind, ValidationError};
use crate::record::IncomingRecord;

/// A signal that was present but malformed, and therefore scored 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalIssue {
    /// Which signal.
    pub signal: SignalKind,
    /// Why it was rejected.
    pub reason: String,
}

/// Canonical signals extracted from one incoming record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSignals {
    /// Canonical email.
    pub email: Option<String>,
    /// Canonical 10-digit phone.
    pub phone: Option<String>,
    /// Display and comparison name.
    pub name: Option<NormalizedName>,
    /// Canonical address.
    pub address: Option<String>,
    /// Malformed signals that were dropped.
    #[serde(default)]
    pub issues: Vec<SignalIssue>,
}

impl NormalizedSignals {
    /// Returns true if at least one signal survived normalization.
    #[must_use]
    pub fn has_any(&self) -> bool {
        self.email.is_some() || self.phone.is_some() || self.name.is_some() || self.address.is_some()
    }

    /// Area code of the phone, if any.
    #[must_use]
    pub fn area_code(&self) -> Option<&str> {
        self.phone.as_deref().and_then(|p| p.get(..3))
    }
}

fn present(raw: Option<&String>) -> Option<&str> {
    raw.map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Applies every normalizer to a record.
#[derive(Debug)]
pub struct SignalNormalizer {
    addresses: AddressResolver,
    min_name_length: usize,
}

impl SignalNormalizer {
    /// Creates a normalizer using `addresses` for address canonicalization.
    #[must_use]
    pub fn new(addresses: AddressResolver, min_name_length: usize) -> Self {
        Self {
            addresses,
            min_name_length,
        }
    }

    /// The address front used by this normalizer.
    #[must_use]
    pub fn addresses(&self) -> &AddressResolver {
        &self.addresses
    }

    /// Canonical address for an arbitrary string (used for store-side data).
    ///
    /// # Errors
    /// Same as [`AddressResolver::canonical`].
    pub fn canonical_address(&self, raw: &str) -> ResolverResult<String> {
        self.addresses.canonical(raw)
    }

    /// Normalizes every signal of `record`.
    ///
    /// Malformed signals are recorded in `issues` and dropped. Only a failure
    /// to reach a collaborator is returned as an error.
    ///
    /// # Errors
    /// `ResolutionError::ResolutionUnavailable` when address normalization
    /// cannot be completed.
    pub fn normalize(&self, record: &IncomingRecord) -> ResolverResult<NormalizedSignals> {
        let mut out = NormalizedSignals::default();

        if let Some(raw) = present(record.email.as_ref()) {
            match canonical_email(raw) {
                Ok(email) => out.email = Some(email),
                Err(e) => push_issue(&mut out, SignalKind::Email, &e),
            }
        }

        if let Some(raw) = present(record.phone.as_ref()) {
            match canonical_phone(raw) {
                Ok(phone) => out.phone = Some(phone),
                Err(e) => push_issue(&mut out, SignalKind::Phone, &e),
            }
        }

        if let Some(raw) = present(record.name.as_ref()) {
            match canonical_name(raw, self.min_name_length) {
                Ok(name) => out.name = Some(name),
                Err(e) => push_issue(&mut out, SignalKind::Name, &e),
            }
        }

        if let Some(raw) = present(record.address.as_ref()) {
            match self.addresses.canonical(raw) {
                Ok(address) => out.address = Some(address),
                Err(ResolverError::Validation(e)) => push_issue(&mut out, SignalKind::Address, &e),
                Err(other) => return Err(other.for_record(record.record_id)),
            }
        }

        if !out.issues.is_empty() {
            tracing::debug!(
                record_id = %record.record_id,
                issues = out.issues.len(),
                "degraded malformed signals"
            );
        }
        Ok(out)
    }
}

fn push_issue(out: &mut NormalizedSignals, signal: SignalKind, err: &ValidationError) {
    out.issues.push(SignalIssue {
        signal,
        reason: err.to_string(),
    });
}
