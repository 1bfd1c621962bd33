//! Address canonicalization.
//!
//! Real address normalization and geocoding live in an external service. The
//! resolver talks to it through `AddressNormalizer` and never waits on it
//! longer than the configured dependency timeout. Calls run on a small fixed
//! set of worker threads, so a collaborator that hangs ties up those workers
//! and nothing more. Canonical forms are cached because the same handful of
//! addresses recur across every source export.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::error::{ResolutionError, ResolverError, ResolverResult, SignalKind, ValidationError};

/// Failures reported by an address collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressNormalizerError {
    /// The input is not an address.
    #[error("address is unparseable: {0}")]
    Unparseable(String),

    /// The service could not be reached.
    #[error("address service unavailable: {0}")]
    Unavailable(String),
}

/// External address normalization/geocoding collaborator.
pub trait AddressNormalizer: Send + Sync {
    /// Name of the collaborator (for logs).
    fn name(&self) -> &str;

    /// Returns the canonical form of `raw`.
    ///
    /// # Errors
    /// `Unparseable` for input that is not an address, `Unavailable` when the
    /// service cannot answer.
    fn normalize(&self, raw: &str) -> Result<String, AddressNormalizerError>;
}

const ABBREVIATIONS: [(&str, &str); 23] = [
    ("street", "st"),
    ("avenue", "ave"),
    ("road", "rd"),
    ("boulevard", "blvd"),
    ("drive", "dr"),
    ("lane", "ln"),
    ("court", "ct"),
    ("place", "pl"),
    ("terrace", "ter"),
    ("circle", "cir"),
    ("highway", "hwy"),
    ("parkway", "pkwy"),
    ("square", "sq"),
    ("trail", "trl"),
    ("apartment", "apt"),
    ("suite", "ste"),
    ("unit", "unit"),
    ("north", "n"),
    ("south", "s"),
    ("east", "e"),
    ("west", "w"),
    ("california", "ca"),
    ("mount", "mt"),
];

/// Worker threads per resolver.
const ADDRESS_WORKERS: usize = 2;
/// Calls that may wait for a worker before new ones are refused.
const ADDRESS_QUEUE_CAPACITY: usize = 64;

fn abbreviate(token: &str) -> &str {
    ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == token)
        .map_or(token, |(_, short)| *short)
}

/// Offline normalizer: case fold, punctuation strip and USPS-style suffix
/// abbreviations. Used for tests and embedded deployments without a geocoder.
///
/// "St" opening a street name ("12 St Helena Hwy") reads as "saint", so it
/// never collides with the "street" suffix.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicAddressNormalizer;

impl AddressNormalizer for BasicAddressNormalizer {
    fn name(&self) -> &str {
        "basic"
    }

    fn normalize(&self, raw: &str) -> Result<String, AddressNormalizerError> {
        let folded: String = raw
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        let words: Vec<&str> = folded.split_whitespace().collect();
        // First word of the street name, after any house number.
        let lead = usize::from(words.first().is_some_and(|w| w.chars().all(|c| c.is_ascii_digit())));
        let tokens: Vec<&str> = words
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                if matches!(t, "st" | "saint") && i == lead && i + 1 < words.len() {
                    "saint"
                } else {
                    abbreviate(t)
                }
            })
            .collect();

        if !tokens.iter().any(|t| t.chars().any(char::is_alphabetic)) {
            return Err(AddressNormalizerError::Unparseable(raw.trim().to_string()));
        }
        Ok(tokens.join(" "))
    }
}

/// One queued call to the collaborator.
struct AddressCall {
    raw: String,
    reply: Sender<Result<String, AddressNormalizerError>>,
}

/// Bounded, cached front for an `AddressNormalizer`.
///
/// Dropping the resolver closes the call queue; idle workers exit and busy
/// ones exit after their current call.
pub struct AddressResolver {
    inner: Arc<dyn AddressNormalizer>,
    timeout: Duration,
    capacity: usize,
    cache: RwLock<HashMap<String, String>>,
    calls: Sender<AddressCall>,
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("inner", &self.inner.name())
            .field("timeout", &self.timeout)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

fn cache_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl AddressResolver {
    /// Wraps `inner` with a call timeout and a cache of at most `capacity`
    /// entries, and starts its worker threads.
    ///
    /// # Errors
    /// `Internal` if a worker thread cannot be spawned.
    pub fn new(inner: Arc<dyn AddressNormalizer>, timeout: Duration, capacity: usize) -> ResolverResult<Self> {
        let (calls, queue) = bounded::<AddressCall>(ADDRESS_QUEUE_CAPACITY);
        for n in 0..ADDRESS_WORKERS {
            let queue = queue.clone();
            let worker = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("address-normalizer-{n}"))
                .spawn(move || {
                    for call in queue {
                        // The caller may have timed out and gone away.
                        let _ = call.reply.send(worker.normalize(&call.raw));
                    }
                })
                .map_err(|e| ResolverError::internal(format!("failed to spawn address worker: {e}")))?;
        }
        Ok(Self {
            inner,
            timeout,
            capacity: capacity.max(1),
            cache: RwLock::new(HashMap::new()),
            calls,
        })
    }

    /// Offline resolver backed by `BasicAddressNormalizer`.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn basic(timeout: Duration, capacity: usize) -> ResolverResult<Self> {
        Self::new(Arc::new(BasicAddressNormalizer), timeout, capacity)
    }

    /// Number of cached canonical forms.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.read().map_or(0, |c| c.len())
    }

    /// Returns the canonical form of `raw`, consulting the cache first.
    ///
    /// # Errors
    /// - `ValidationError::MalformedSignal` if the collaborator rejects the input.
    /// - `ResolutionError::ResolutionUnavailable` if it is unreachable or
    ///   exceeds the timeout.
    pub fn canonical(&self, raw: &str) -> ResolverResult<String> {
        let key = cache_key(raw);
        if key.is_empty() {
            return Err(ValidationError::malformed(SignalKind::Address, "empty").into());
        }

        {
            let guard = self
                .cache
                .read()
                .map_err(|_| ResolverError::internal("address cache lock poisoned"))?;
            if let Some(hit) = guard.get(&key) {
                return Ok(hit.clone());
            }
        }

        let canonical = self.call_bounded(raw)?;

        let mut guard = self
            .cache
            .write()
            .map_err(|_| ResolverError::internal("address cache lock poisoned"))?;
        if guard.len() >= self.capacity {
            guard.clear();
        }
        guard.entry(key).or_insert_with(|| canonical.clone());
        Ok(canonical)
    }

    fn call_bounded(&self, raw: &str) -> ResolverResult<String> {
        let (reply, rx) = bounded(1);
        let call = AddressCall {
            raw: raw.to_string(),
            reply,
        };
        match self.calls.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(normalizer = self.inner.name(), "address normalizer queue full");
                return Err(ResolutionError::unavailable(None, "address normalizer queue full").into());
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(ResolutionError::unavailable(None, "address normalizer workers stopped").into());
            }
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(canonical)) => Ok(canonical),
            Ok(Err(AddressNormalizerError::Unparseable(reason))) => {
                Err(ValidationError::malformed(SignalKind::Address, reason).into())
            }
            Ok(Err(AddressNormalizerError::Unavailable(reason))) => {
                tracing::warn!(normalizer = self.inner.name(), %reason, "address normalizer unavailable");
                Err(ResolutionError::unavailable(None, reason).into())
            }
            Err(RecvTimeoutError::Timeout) => {
                let duration_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(normalizer = self.inner.name(), duration_ms, "address normalizer timed out");
                Err(ResolutionError::unavailable(
                    None,
                    format!("address normalizer timed out after {duration_ms}ms"),
                )
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(ResolutionError::unavailable(
                None,
                "address normalizer exited without a reply",
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNormalizer {
        calls: AtomicUsize,
    }

    impl AddressNormalizer for CountingNormalizer {
        fn name(&self) -> &str {
            "counting"
        }

        fn normalize(&self, raw: &str) -> Result<String, AddressNormalizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            BasicAddressNormalizer.normalize(raw)
        }
    }

    struct SlowNormalizer;

    impl AddressNormalizer for SlowNormalizer {
        fn name(&self) -> &str {
            "slow"
        }

        fn normalize(&self, raw: &str) -> Result<String, AddressNormalizerError> {
            thread::sleep(Duration::from_millis(300));
            Ok(raw.to_string())
        }
    }

    /// Tracks how many calls run at once.
    struct GatedNormalizer {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl AddressNormalizer for GatedNormalizer {
        fn name(&self) -> &str {
            "gated"
        }

        fn normalize(&self, raw: &str) -> Result<String, AddressNormalizerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(raw.to_string())
        }
    }

    struct DownNormalizer;

    impl AddressNormalizer for DownNormalizer {
        fn name(&self) -> &str {
            "down"
        }

        fn normalize(&self, _raw: &str) -> Result<String, AddressNormalizerError> {
            Err(AddressNormalizerError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn basic_normalizer_abbreviates_suffixes() {
        let got = BasicAddressNormalizer.normalize("123 North Main Street, Apt. 4").unwrap();
        assert_eq!(got, "123 n main st apt 4");
    }

    #[test]
    fn leading_st_reads_as_saint() {
        let saint = BasicAddressNormalizer.normalize("12 Saint Helena Hwy").unwrap();
        assert_eq!(saint, "12 saint helena hwy");
        assert_eq!(BasicAddressNormalizer.normalize("12 St. Helena Highway").unwrap(), saint);
        assert_ne!(BasicAddressNormalizer.normalize("12 Street Helena Hwy").unwrap(), saint);
        assert_eq!(BasicAddressNormalizer.normalize("1 Elm St").unwrap(), "1 elm st");
        assert_eq!(BasicAddressNormalizer.normalize("9 Main St Apt 2").unwrap(), "9 main st apt 2");
    }

    #[test]
    fn basic_normalizer_rejects_digits_only() {
        assert!(matches!(
            BasicAddressNormalizer.normalize("12345"),
            Err(AddressNormalizerError::Unparseable(_))
        ));
    }

    #[test]
    fn resolver_caches_canonical_forms() {
        let inner = Arc::new(CountingNormalizer {
            calls: AtomicUsize::new(0),
        });
        let resolver = AddressResolver::new(inner.clone(), Duration::from_secs(1), 16).unwrap();
        let a = resolver.canonical("1 Elm Street").unwrap();
        let b = resolver.canonical("1  elm street").unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_len(), 1);
    }

    #[test]
    fn resolver_cache_is_bounded() {
        let resolver = AddressResolver::basic(Duration::from_secs(1), 2).unwrap();
        resolver.canonical("1 a st").unwrap();
        resolver.canonical("2 b st").unwrap();
        resolver.canonical("3 c st").unwrap();
        assert!(resolver.cached_len() <= 2);
    }

    #[test]
    fn resolver_times_out_slow_collaborator() {
        let resolver = AddressResolver::new(Arc::new(SlowNormalizer), Duration::from_millis(20), 4).unwrap();
        let err = resolver.canonical("1 elm st").unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn timed_out_calls_share_the_fixed_workers() {
        let inner = Arc::new(GatedNormalizer {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let resolver = AddressResolver::new(inner.clone(), Duration::from_millis(1), 4).unwrap();
        for i in 0..10 {
            assert!(resolver.canonical(&format!("{i} elm st")).unwrap_err().is_unavailable());
        }
        thread::sleep(Duration::from_millis(200));
        assert!(inner.peak.load(Ordering::SeqCst) <= ADDRESS_WORKERS);
    }

    #[test]
    fn resolver_surfaces_unavailable_service() {
        let resolver = AddressResolver::new(Arc::new(DownNormalizer), Duration::from_secs(1), 4).unwrap();
        let err = resolver.canonical("1 elm st").unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.is_retryable());
    }

    #[test]
    fn resolver_reports_unparseable_as_validation() {
        let resolver = AddressResolver::basic(Duration::from_secs(1), 4).unwrap();
        let err = resolver.canonical("!!!").unwrap_err();
        assert!(err.is_validation());
    }
}
