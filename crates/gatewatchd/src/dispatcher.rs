//! Rate-limited, non-blocking fan-out of verification requests.

use crate::cache::{CacheEntry, SpatialKey, SpatialResultCache};
use crate::verifier::Verifier;
use crossbeam_channel::{Sender, TrySendError};
use gatewatch_core::Embedding;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Why [`VerificationDispatcher::maybe_dispatch`] did or did not launch a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    /// A fresh result for this key is already cached.
    Cached,
    /// A call for this key is still running.
    InFlight,
    /// Another dispatch happened less than the debounce interval ago.
    Debounced,
    /// Every worker is busy.
    Busy,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub debounce: Duration,
    pub ttl: Duration,
    pub workers: usize,
}

#[derive(Default)]
pub struct DispatchStats {
    pub dispatched: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub busy: AtomicU64,
}

struct Job {
    key: SpatialKey,
    embedding: Vec<f32>,
}

struct Gate {
    last_dispatch: Option<Instant>,
    in_flight: HashSet<SpatialKey>,
}

struct Shared {
    cache: Arc<SpatialResultCache>,
    gate: Mutex<Gate>,
    ttl: Duration,
    stats: DispatchStats,
}

impl Shared {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decides whether an observation warrants a remote call and, if so, hands
/// it to a fixed pool of worker threads without waiting for the answer.
///
/// Two gates apply: the key must have no fresh cached result, and the
/// global debounce interval must have elapsed since the last dispatch.
/// Results land in the shared [`SpatialResultCache`]; failures are logged
/// and leave the cache untouched so the key is retried later.
pub struct VerificationDispatcher {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    debounce: Duration,
}

impl VerificationDispatcher {
    pub fn start<V: Verifier>(
        verifier: Arc<V>,
        cache: Arc<SpatialResultCache>,
        settings: DispatcherSettings,
    ) -> std::io::Result<Self> {
        let workers = settings.workers.max(1);
        let (jobs, rx) = crossbeam_channel::bounded::<Job>(workers);
        let shared = Arc::new(Shared {
            cache,
            gate: Mutex::new(Gate {
                last_dispatch: None,
                in_flight: HashSet::new(),
            }),
            ttl: settings.ttl,
            stats: DispatchStats::default(),
        });

        for i in 0..workers {
            let rx = rx.clone();
            let shared = shared.clone();
            let verifier = verifier.clone();
            // Workers are detached: dropping the dispatcher closes the queue,
            // and a worker exits once its current call returns.
            std::thread::Builder::new()
                .name(format!("gatewatch-verify-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        run_job(verifier.as_ref(), &shared, job);
                    }
                })?;
        }

        tracing::info!(
            workers,
            debounce_ms = settings.debounce.as_millis() as u64,
            ttl_ms = settings.ttl.as_millis() as u64,
            "verification dispatcher started"
        );

        Ok(Self {
            shared,
            jobs,
            debounce: settings.debounce,
        })
    }

    pub fn maybe_dispatch(&self, embedding: &Embedding, key: SpatialKey) -> DispatchOutcome {
        self.maybe_dispatch_at(embedding, key, Instant::now())
    }

    /// Gate check, debounce stamp, and hand-off happen under one lock, so
    /// concurrent callers can never both pass the debounce gate.
    pub fn maybe_dispatch_at(
        &self,
        embedding: &Embedding,
        key: SpatialKey,
        now: Instant,
    ) -> DispatchOutcome {
        let mut gate = self.shared.gate();

        if self.shared.cache.contains_fresh_at(key, now) {
            return DispatchOutcome::Cached;
        }
        if gate.in_flight.contains(&key) {
            return DispatchOutcome::InFlight;
        }
        if let Some(last) = gate.last_dispatch {
            if now.saturating_duration_since(last) < self.debounce {
                return DispatchOutcome::Debounced;
            }
        }

        let job = Job {
            key,
            embedding: embedding.values.clone(),
        };
        match self.jobs.try_send(job) {
            Ok(()) => {
                gate.last_dispatch = Some(now);
                gate.in_flight.insert(key);
                self.shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(col = key.col, row = key.row, "verification dispatched");
                DispatchOutcome::Dispatched
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.stats.busy.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Busy
            }
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.shared.stats
    }

    pub fn in_flight(&self) -> usize {
        self.shared.gate().in_flight.len()
    }
}

fn run_job(verifier: &dyn Verifier, shared: &Shared, job: Job) {
    match verifier.verify(&job.embedding) {
        Ok(response) => {
            let entry = CacheEntry::new(response.label(), response.verdict(), shared.ttl);
            tracing::info!(
                col = job.key.col,
                row = job.key.row,
                label = %entry.label,
                verdict = ?entry.verdict,
                "verification result cached"
            );
            shared.cache.put(job.key, entry);
            shared.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!(col = job.key.col, row = job.key.row, error = %e, "verification failed");
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    shared.gate().in_flight.remove(&job.key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Verdict;
    use crate::verifier::{VerifyError, VerifyResponse, VerifyStatus};
    use std::sync::atomic::AtomicUsize;

    struct FakeVerifier {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl FakeVerifier {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    impl Verifier for FakeVerifier {
        fn verify(&self, _embedding: &[f32]) -> Result<VerifyResponse, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(VerifyError::Backend("offline".into()));
            }
            Ok(VerifyResponse {
                status: VerifyStatus::Success,
                person_name: Some("Jane".into()),
            })
        }
    }

    fn settings(debounce_ms: u64, workers: usize) -> DispatcherSettings {
        DispatcherSettings {
            debounce: Duration::from_millis(debounce_ms),
            ttl: Duration::from_secs(10),
            workers,
        }
    }

    fn embedding() -> Embedding {
        Embedding {
            values: vec![0.1; 8],
            model_version: None,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_debounce_allows_one_dispatch_per_window() {
        let verifier = Arc::new(FakeVerifier::new());
        let cache = Arc::new(SpatialResultCache::new());
        let dispatcher = VerificationDispatcher::start(verifier.clone(), cache, settings(1000, 4)).unwrap();

        // Three distinct faces in the same pass.
        let now = Instant::now();
        let outcomes: Vec<_> = (0..3)
            .map(|i| dispatcher.maybe_dispatch_at(&embedding(), SpatialKey { col: i, row: 0 }, now))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::Dispatched,
                DispatchOutcome::Debounced,
                DispatchOutcome::Debounced
            ]
        );

        let later = now + Duration::from_millis(1100);
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), SpatialKey { col: 1, row: 0 }, later),
            DispatchOutcome::Dispatched
        );
        assert!(wait_until(|| verifier.calls.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_cached_key_is_not_redispatched_within_ttl() {
        let verifier = Arc::new(FakeVerifier::new());
        let cache = Arc::new(SpatialResultCache::new());
        let dispatcher =
            VerificationDispatcher::start(verifier.clone(), cache.clone(), settings(0, 2)).unwrap();
        let key = SpatialKey { col: 3, row: 3 };

        let start = Instant::now();
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), key, start),
            DispatchOutcome::Dispatched
        );
        assert!(wait_until(|| cache.get(key).is_some()));
        assert!(wait_until(|| dispatcher.in_flight() == 0));

        let entry = cache.get(key).unwrap();
        assert_eq!(entry.label, "Jane");
        assert_eq!(entry.verdict, Verdict::Recognized);

        for secs in [1, 5, 9] {
            assert_eq!(
                dispatcher.maybe_dispatch_at(&embedding(), key, start + Duration::from_secs(secs)),
                DispatchOutcome::Cached
            );
        }
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

        // Once the entry lapses the key becomes eligible again.
        let after = entry.expires_at + Duration::from_millis(1);
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), key, after),
            DispatchOutcome::Dispatched
        );
    }

    #[test]
    fn test_failure_leaves_cache_empty_and_allows_retry() {
        let verifier = Arc::new(FakeVerifier {
            fail: true,
            ..FakeVerifier::new()
        });
        let cache = Arc::new(SpatialResultCache::new());
        let dispatcher =
            VerificationDispatcher::start(verifier.clone(), cache.clone(), settings(0, 1)).unwrap();
        let key = SpatialKey { col: 0, row: 0 };

        assert_eq!(dispatcher.maybe_dispatch(&embedding(), key), DispatchOutcome::Dispatched);
        assert!(wait_until(|| dispatcher.stats().failed.load(Ordering::Relaxed) == 1));
        assert!(wait_until(|| dispatcher.in_flight() == 0));
        assert!(cache.is_empty());

        assert_eq!(dispatcher.maybe_dispatch(&embedding(), key), DispatchOutcome::Dispatched);
    }

    #[test]
    fn test_pending_key_is_not_duplicated() {
        let verifier = Arc::new(FakeVerifier {
            delay: Duration::from_millis(300),
            ..FakeVerifier::new()
        });
        let cache = Arc::new(SpatialResultCache::new());
        let dispatcher = VerificationDispatcher::start(verifier, cache, settings(0, 4)).unwrap();
        let key = SpatialKey { col: 2, row: 2 };

        assert_eq!(dispatcher.maybe_dispatch(&embedding(), key), DispatchOutcome::Dispatched);
        assert_eq!(dispatcher.maybe_dispatch(&embedding(), key), DispatchOutcome::InFlight);
    }

    #[test]
    fn test_saturated_pool_declines_without_stamping() {
        let verifier = Arc::new(FakeVerifier {
            delay: Duration::from_millis(300),
            ..FakeVerifier::new()
        });
        let cache = Arc::new(SpatialResultCache::new());
        // One worker plus a one-slot queue: the third job has nowhere to go.
        let dispatcher =
            VerificationDispatcher::start(verifier.clone(), cache, settings(1000, 1)).unwrap();
        let window = Duration::from_millis(1100);

        let t0 = Instant::now();
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), SpatialKey { col: 0, row: 0 }, t0),
            DispatchOutcome::Dispatched
        );
        assert!(wait_until(|| verifier.calls.load(Ordering::SeqCst) == 1));

        let t1 = t0 + window;
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), SpatialKey { col: 1, row: 0 }, t1),
            DispatchOutcome::Dispatched
        );

        // Debounce has elapsed but the worker and the queue are both taken.
        let t2 = t1 + window;
        let late = SpatialKey { col: 2, row: 0 };
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), late, t2),
            DispatchOutcome::Busy
        );
        assert_eq!(dispatcher.stats().busy.load(Ordering::Relaxed), 1);

        // Once the pool drains, the same instant still passes the debounce
        // gate: the declined attempt did not count as a dispatch.
        assert!(wait_until(|| dispatcher.stats().succeeded.load(Ordering::Relaxed) == 2));
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), late, t2),
            DispatchOutcome::Dispatched
        );
        assert_eq!(
            dispatcher.maybe_dispatch_at(&embedding(), SpatialKey { col: 3, row: 0 }, t2),
            DispatchOutcome::Debounced
        );
        assert_eq!(dispatcher.stats().dispatched.load(Ordering::Relaxed), 3);
    }
}
