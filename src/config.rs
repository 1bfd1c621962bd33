//! Injected configuration for scoring, classification and scanning.
//!
//! Every weight and threshold the resolution core uses lives here so tests and
//! deployments can vary them without touching scoring or classification logic.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Weights applied to per-signal scores when computing the composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    /// Email weight.
    pub email: f64,
    /// Phone weight.
    pub phone: f64,
    /// Name weight.
    pub name: f64,
    /// Address weight.
    pub address: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            email: 0.40,
            phone: 0.25,
            name: 0.25,
            address: 0.10,
        }
    }
}

impl SignalWeights {
    /// Sum of all weights.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.email + self.phone + self.name + self.address
    }
}

/// Composite score bands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Composite at or above which a candidate is auto-matched.
    pub auto_match: f64,
    /// Composite at or above which a candidate goes to human review.
    pub review: f64,
    /// Send exact email matches below `review` to the queue instead of
    /// creating a second entity that holds the same address.
    pub review_on_exact_email: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_match: 0.95,
            review: 0.50,
            review_on_exact_email: true,
        }
    }
}

/// When co-residents are kept apart instead of merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HouseholdPolicy {
    /// Enables the household override.
    pub enabled: bool,
    /// Name scores below this count as "different people".
    pub name_ceiling: f64,
    /// Distinct residents the shared place must already have.
    pub min_residents: usize,
    /// Confidence recorded on inferred memberships.
    pub member_confidence: f64,
}

impl Default for HouseholdPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            name_ceiling: 0.7,
            min_residents: 1,
            member_confidence: 0.8,
        }
    }
}

/// Tiered dedup scan tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupPolicy {
    /// Minimum name similarity for tiers 3 and 4.
    pub name_threshold: f64,
    /// Minimum name similarity for the name-only tier.
    pub name_only_threshold: f64,
    /// Upper bound on pairs generated from a single blocking key.
    pub max_block_size: usize,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            name_threshold: 0.7,
            name_only_threshold: 0.92,
            max_block_size: 200,
        }
    }
}

/// Full resolution configuration.
///
/// # Examples
///
/// ```
/// use contact_resolver::ResolutionConfig;
///
/// let config = ResolutionConfig::default();
/// assert!(config.validate().is_ok());
/// assert!((config.weights.email - 0.40).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Signal weights.
    pub weights: SignalWeights,
    /// Decision thresholds.
    pub thresholds: Thresholds,
    /// Household override policy.
    pub household: HouseholdPolicy,
    /// Dedup scanner policy.
    pub dedup: DedupPolicy,
    /// Maximum candidates retrieved per signal type.
    pub candidates_per_signal: usize,
    /// Fuzzy name scores below this are treated as no match.
    pub name_floor: f64,
    /// Normalized names shorter than this are malformed.
    pub min_name_length: usize,
    /// Bound on calls to external collaborators (address normalization).
    pub dependency_timeout_ms: u64,
    /// Bound on waiting for an entity edit lock.
    pub lock_timeout_ms: u64,
    /// Maximum cached canonical addresses.
    pub address_cache_capacity: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            thresholds: Thresholds::default(),
            household: HouseholdPolicy::default(),
            dedup: DedupPolicy::default(),
            candidates_per_signal: 5,
            name_floor: 0.5,
            min_name_length: 2,
            dependency_timeout_ms: 2_000,
            lock_timeout_ms: 1_000,
            address_cache_capacity: 4_096,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(ValidationError::InvalidConfig {
            reason: format!("{name} must be within [0.0, 1.0], got {value}"),
        });
    }
    Ok(())
}

impl ResolutionConfig {
    /// Validates weights, thresholds and limits.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let w = &self.weights;
        check_unit("weights.email", w.email)?;
        check_unit("weights.phone", w.phone)?;
        check_unit("weights.name", w.name)?;
        check_unit("weights.address", w.address)?;
        if (w.total() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ValidationError::InvalidConfig {
                reason: format!("weights must sum to 1.0, got {:.6}", w.total()),
            });
        }

        let t = &self.thresholds;
        check_unit("thresholds.auto_match", t.auto_match)?;
        check_unit("thresholds.review", t.review)?;
        if t.review > t.auto_match {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "thresholds.review ({}) must not exceed thresholds.auto_match ({})",
                    t.review, t.auto_match
                ),
            });
        }

        check_unit("household.name_ceiling", self.household.name_ceiling)?;
        check_unit("household.member_confidence", self.household.member_confidence)?;
        check_unit("dedup.name_threshold", self.dedup.name_threshold)?;
        check_unit("dedup.name_only_threshold", self.dedup.name_only_threshold)?;
        check_unit("name_floor", self.name_floor)?;

        if self.candidates_per_signal == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "candidates_per_signal must be at least 1".to_string(),
            });
        }
        if self.dependency_timeout_ms == 0 || self.lock_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "timeouts must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    ///
    /// Missing keys fall back to defaults.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidConfig` on parse or validation failure.
    pub fn from_toml_str(raw: &str) -> Result<Self, ValidationError> {
        let config: Self = toml::from_str(raw).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidConfig` on parse or validation failure.
    pub fn from_json_str(raw: &str) -> Result<Self, ValidationError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ValidationError::InvalidConfig {
                reason: format!("invalid JSON: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file, choosing the format by extension (`.json` or TOML).
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
    }
}
