//! Lane-isolated execution runtime.
//!
//! Intake (a form submission, a clinic appointment) is latency sensitive,
//! while bulk imports and dedup sweeps can run for minutes. This module runs
//! them on separate bounded worker pools so sweep work never blocks realtime
//! resolution.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::decision::MatchDecision;
use crate::dedup::{DedupScanner, MatchTier, ScanReport};
use crate::error::{ResolutionError, ResolverError, ResolverResult};
use crate::record::IncomingRecord;
use crate::resolver::Resolver;

/// Worker pool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Single records arriving from intake.
    Realtime,
    /// Batch imports and dedup scans.
    Sweep,
}

impl Lane {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Sweep => "sweep",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct ResolutionRuntimeConfig {
    /// Number of realtime workers.
    pub realtime_workers: usize,
    /// Number of sweep workers.
    pub sweep_workers: usize,
    /// Maximum queued jobs per lane.
    pub queue_capacity: usize,
    /// Attempts per record when the resolver reports itself unavailable.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
}

impl Default for ResolutionRuntimeConfig {
    fn default() -> Self {
        Self {
            realtime_workers: 2,
            sweep_workers: 1,
            queue_capacity: 1024,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

enum Job {
    Resolve {
        record: Box<IncomingRecord>,
        reply: Sender<ResolverResult<MatchDecision>>,
    },
    Scan {
        tier: Option<MatchTier>,
        dry_run: bool,
        reply: Sender<ResolverResult<ScanReport>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<ResolverResult<()>>,
    },
}

#[derive(Clone)]
struct Worker {
    resolver: Arc<Resolver>,
    scanner: Arc<DedupScanner>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl Worker {
    fn run(&self, job: Job) {
        match job {
            Job::Resolve { record, reply } => {
                let _ = reply.send(self.resolve_with_retry(&record));
            }
            Job::Scan { tier, dry_run, reply } => {
                let _ = reply.send(self.scanner.run(tier, dry_run));
            }

            #[cfg(test)]
            Job::Sleep { duration, reply } => {
                thread::sleep(duration);
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Retries unavailable failures. An attempt that failed after creating
    /// the record's entity leaves it behind; the retry reuses it.
    fn resolve_with_retry(&self, record: &IncomingRecord) -> ResolverResult<MatchDecision> {
        let mut attempt = 1;
        loop {
            match self.resolver.resolve(record) {
                Err(e) if e.is_unavailable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        record_id = %record.record_id,
                        attempt,
                        error = %e,
                        "resolution unavailable, retrying"
                    );
                    attempt += 1;
                    thread::sleep(self.retry_backoff);
                }
                other => return other,
            }
        }
    }
}

struct WorkerPool {
    lane: Lane,
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(lane: Lane, workers: usize, queue_capacity: usize, worker: &Worker) -> ResolverResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let worker = worker.clone();
            let handle = thread::Builder::new()
                .name(format!("resolver-{lane}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        worker.run(job);
                    }
                })
                .map_err(|e| ResolverError::internal(format!("failed to spawn {lane} worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            lane,
            tx,
            workers: handles,
            queue_capacity,
        })
    }

    fn try_submit(&self, job: Job) -> ResolverResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ResolutionError::QueueFull {
                lane: self.lane.to_string(),
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ResolutionError::Disconnected {
                lane: self.lane.to_string(),
            }
            .into()),
        }
    }

    fn shutdown(self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }

    fn closed(lane: Lane) -> Self {
        Self {
            lane,
            tx: bounded::<Job>(1).0,
            workers: Vec::new(),
            queue_capacity: 1,
        }
    }
}

/// Pending result of a submitted job.
pub struct ResolutionHandle<T> {
    lane: Lane,
    rx: Receiver<ResolverResult<T>>,
}

impl<T> fmt::Debug for ResolutionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionHandle").field("lane", &self.lane).finish_non_exhaustive()
    }
}

impl<T> ResolutionHandle<T> {
    /// Lane the job was queued on.
    #[must_use]
    pub const fn lane(&self) -> Lane {
        self.lane
    }

    /// Waits for the job to finish.
    ///
    /// # Errors
    /// The job's own error, or `Disconnected` if the worker went away.
    pub fn join(self) -> ResolverResult<T> {
        let lane = self.lane;
        self.rx.recv().map_err(|_| ResolutionError::Disconnected {
            lane: lane.to_string(),
        })?
    }

    /// Waits for the job to finish, giving up after `timeout`.
    ///
    /// # Errors
    /// The job's own error, `Timeout`, or `Disconnected`.
    pub fn join_timeout(self, timeout: Duration) -> ResolverResult<T> {
        let lane = self.lane;
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ResolutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => ResolutionError::Disconnected {
                lane: lane.to_string(),
            },
        })?
    }
}

/// Runs a `Resolver` and a `DedupScanner` on isolated worker pools.
pub struct ResolutionRuntime {
    resolver: Arc<Resolver>,
    realtime: WorkerPool,
    sweep: WorkerPool,
}

impl fmt::Debug for ResolutionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionRuntime")
            .field("realtime_workers", &self.realtime.workers.len())
            .field("sweep_workers", &self.sweep.workers.len())
            .finish_non_exhaustive()
    }
}

impl ResolutionRuntime {
    /// Starts both pools. The dedup scanner shares the resolver's stores and
    /// dedup policy.
    ///
    /// # Errors
    /// `Internal` if a worker thread cannot be spawned.
    pub fn start(resolver: Resolver, config: &ResolutionRuntimeConfig) -> ResolverResult<Self> {
        let scanner = DedupScanner::new(resolver.entities(), resolver.reviews(), resolver.config().dedup);
        let resolver = Arc::new(resolver);
        let worker = Worker {
            resolver: Arc::clone(&resolver),
            scanner: Arc::new(scanner),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff,
        };
        let realtime = WorkerPool::start(Lane::Realtime, config.realtime_workers, config.queue_capacity, &worker)?;
        let sweep = WorkerPool::start(Lane::Sweep, config.sweep_workers, config.queue_capacity, &worker)?;
        tracing::info!(
            realtime_workers = realtime.workers.len(),
            sweep_workers = sweep.workers.len(),
            queue_capacity = config.queue_capacity,
            "resolution runtime started"
        );
        Ok(Self {
            resolver,
            realtime,
            sweep,
        })
    }

    /// Queues one record on `lane`.
    ///
    /// # Errors
    /// `QueueFull` when the lane is saturated, `Disconnected` after shutdown.
    pub fn submit(&self, record: IncomingRecord, lane: Lane) -> ResolverResult<ResolutionHandle<MatchDecision>> {
        let (tx, rx) = bounded(1);
        self.pool(lane).try_submit(Job::Resolve {
            record: Box::new(record),
            reply: tx,
        })?;
        Ok(ResolutionHandle { lane, rx })
    }

    /// Resolves one record on the realtime lane and waits for the decision.
    ///
    /// # Errors
    /// Any resolution error, or a lane error from `submit`.
    pub fn resolve(&self, record: IncomingRecord) -> ResolverResult<MatchDecision> {
        self.submit(record, Lane::Realtime)?.join()
    }

    /// Queues a batch on the sweep lane. Records that could not be queued
    /// come back as errors in their slot.
    #[must_use]
    pub fn submit_batch(
        &self,
        records: impl IntoIterator<Item = IncomingRecord>,
    ) -> Vec<ResolverResult<ResolutionHandle<MatchDecision>>> {
        records.into_iter().map(|r| self.submit(r, Lane::Sweep)).collect()
    }

    /// Queues a dedup scan on the sweep lane.
    ///
    /// # Errors
    /// `QueueFull` when the lane is saturated, `Disconnected` after shutdown.
    pub fn submit_scan(&self, tier: Option<MatchTier>, dry_run: bool) -> ResolverResult<ResolutionHandle<ScanReport>> {
        let (tx, rx) = bounded(1);
        self.sweep.try_submit(Job::Scan {
            tier,
            dry_run,
            reply: tx,
        })?;
        Ok(ResolutionHandle { lane: Lane::Sweep, rx })
    }

    /// The shared resolver.
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    const fn pool(&self, lane: Lane) -> &WorkerPool {
        match lane {
            Lane::Realtime => &self.realtime,
            Lane::Sweep => &self.sweep,
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, lane: Lane, duration: Duration) -> ResolverResult<ResolutionHandle<()>> {
        let (tx, rx) = bounded(1);
        self.pool(lane).try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(ResolutionHandle { lane, rx })
    }
}

impl Drop for ResolutionRuntime {
    fn drop(&mut self) {
        let realtime = std::mem::replace(&mut self.realtime, WorkerPool::closed(Lane::Realtime));
        let sweep = std::mem::replace(&mut self.sweep, WorkerPool::closed(Lane::Sweep));
        realtime.shutdown();
        sweep.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::config::ResolutionConfig;
    use crate::decision::DecisionType;
    use crate::normalize::{AddressNormalizer, AddressNormalizerError, BasicAddressNormalizer};
    use crate::record::SourceSystem;
    use crate::storage::{EntityStore, InMemoryStores, ReviewStore};

    fn runtime(config: &ResolutionRuntimeConfig) -> (ResolutionRuntime, InMemoryStores) {
        let stores = InMemoryStores::new();
        let resolver = Resolver::in_memory(ResolutionConfig::default(), &stores).unwrap();
        (ResolutionRuntime::start(resolver, config).unwrap(), stores)
    }

    fn record(name: &str) -> IncomingRecord {
        IncomingRecord::builder(SourceSystem::JotForm).name(name).build()
    }

    #[test]
    fn resolves_on_realtime_lane() {
        let (runtime, stores) = runtime(&ResolutionRuntimeConfig::default());
        let decision = runtime.resolve(record("Jane Doe")).unwrap();
        assert_eq!(decision.decision_type, DecisionType::NewEntity);
        assert_eq!(stores.entities.len(), 1);
    }

    #[test]
    fn sweep_work_does_not_starve_realtime() {
        let (runtime, _stores) = runtime(&ResolutionRuntimeConfig {
            realtime_workers: 1,
            sweep_workers: 1,
            queue_capacity: 16,
            ..ResolutionRuntimeConfig::default()
        });

        let sleep = runtime.submit_sleep(Lane::Sweep, Duration::from_millis(300)).unwrap();

        let started = Instant::now();
        let handle = runtime.submit(record("Jane Doe"), Lane::Realtime).unwrap();
        assert_eq!(handle.lane(), Lane::Realtime);
        handle.join_timeout(Duration::from_millis(200)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));

        sleep.join_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn full_lane_reports_queue_full() {
        let (runtime, _stores) = runtime(&ResolutionRuntimeConfig {
            realtime_workers: 1,
            sweep_workers: 1,
            queue_capacity: 1,
            ..ResolutionRuntimeConfig::default()
        });
        let mut sleeps = Vec::new();
        let mut full = None;
        for _ in 0..4 {
            match runtime.submit_sleep(Lane::Sweep, Duration::from_millis(100)) {
                Ok(handle) => sleeps.push(handle),
                Err(e) => {
                    full = Some(e);
                    break;
                }
            }
        }
        let Some(ResolverError::Resolution(ResolutionError::QueueFull { lane, capacity })) = full else {
            panic!("expected QueueFull, got {full:?}");
        };
        assert_eq!(lane, "sweep");
        assert_eq!(capacity, 1);
        for handle in sleeps {
            handle.join_timeout(Duration::from_secs(2)).unwrap();
        }
    }

    #[test]
    fn scan_runs_on_sweep_lane() {
        let (runtime, stores) = runtime(&ResolutionRuntimeConfig::default());
        for _ in 0..2 {
            stores
                .entities
                .insert(crate::entity::CandidateEntity::new("Jane Doe").with_email("jane@x.com"))
                .unwrap();
        }
        let handle = runtime.submit_scan(None, false).unwrap();
        assert_eq!(handle.lane(), Lane::Sweep);
        let report = handle.join_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(report.inserted, 1);
    }

    struct Flaky {
        failures_left: AtomicUsize,
    }

    impl AddressNormalizer for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn normalize(&self, raw: &str) -> Result<String, AddressNormalizerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AddressNormalizerError::Unavailable("geocoder down".to_string()));
            }
            BasicAddressNormalizer.normalize(raw)
        }
    }

    fn flaky_runtime(failures: usize, max_attempts: u32) -> ResolutionRuntime {
        let stores = InMemoryStores::new();
        let resolver = Resolver::with_address_normalizer(
            ResolutionConfig::default(),
            stores.entities.clone(),
            stores.households.clone(),
            stores.reviews.clone(),
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(failures),
            }),
        )
        .unwrap();
        ResolutionRuntime::start(
            resolver,
            &ResolutionRuntimeConfig {
                max_attempts,
                retry_backoff: Duration::from_millis(1),
                ..ResolutionRuntimeConfig::default()
            },
        )
        .unwrap()
    }

    fn addressed(name: &str) -> IncomingRecord {
        IncomingRecord::builder(SourceSystem::ClinicHq)
            .name(name)
            .address("1 Elm Street")
            .build()
    }

    #[test]
    fn unavailable_resolution_is_retried() {
        let runtime = flaky_runtime(2, 3);
        let decision = runtime.resolve(addressed("Jane Doe")).unwrap();
        assert_eq!(decision.decision_type, DecisionType::NewEntity);
    }

    #[test]
    fn retries_stop_after_max_attempts() {
        let runtime = flaky_runtime(5, 2);
        let err = runtime.resolve(addressed("Jane Doe")).unwrap_err();
        assert!(err.is_unavailable());
        assert!(runtime.resolver().reviews().decision_for_record(addressed("Jane Doe").record_id).unwrap().is_none());
    }

    #[test]
    fn join_reports_disconnected_when_reply_dropped() {
        let (tx, rx) = bounded::<ResolverResult<MatchDecision>>(1);
        drop(tx);
        let handle = ResolutionHandle { lane: Lane::Realtime, rx };
        let err = handle.join().unwrap_err();
        let ResolverError::Resolution(ResolutionError::Disconnected { lane }) = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(lane, "realtime");
    }
}
