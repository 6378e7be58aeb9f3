//! Cache-backed request batching for region values.
//!
//! The sampler turns many concurrent "value of region R" requests into a
//! small number of bounded remote calls. Callers enqueue regions and await
//! resolution; a single background worker drains the queue, tops each batch
//! up with opportunistic sub-divisions of the drained regions, issues one
//! provider request for the whole batch and resolves every waiter whose
//! centroid key matches a returned coordinate.
//!
//! The result cache and the queue are the only shared mutable state in the
//! engine; both live behind one mutex, written by the two entry points
//! ([`Sampler::enqueue`], [`Sampler::seed`]) and the worker's drain step.

use crate::config::Config;
use crate::error::{Result, VargridError};
use crate::provider::{SampleProvider, SampleQuery};
use crate::region::{Region, point_key};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct State {
    /// Resolved values by centroid key.
    results: FxHashMap<String, f64>,
    /// Regions waiting to be drained into a batch.
    queue: VecDeque<Region>,
    /// Keys that are queued or in flight, to dedup re-requests.
    queued: FxHashSet<String>,
    /// Sticky provider failure; fails all waiters promptly instead of
    /// letting them run into their timeout.
    failure: Option<String>,
}

#[derive(Debug)]
struct Shared {
    measurement: String,
    observed_at: SystemTime,
    max_batch: usize,
    batch_interval: Duration,
    sample_timeout: Duration,
    state: Mutex<State>,
    resolved: Notify,
    requests: AtomicU64,
}

/// Cheaply clonable handle to the sampling cache and queue.
///
/// One sampler serves one (measurement, observation time) pair; the key
/// space is per-run, so resumed runs seed a fresh sampler from persisted
/// state rather than sharing caches across times.
#[derive(Debug, Clone)]
pub struct Sampler {
    shared: Arc<Shared>,
}

impl Sampler {
    pub fn new(measurement: impl Into<String>, observed_at: SystemTime, config: &Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                measurement: measurement.into(),
                observed_at,
                max_batch: config.max_batch,
                batch_interval: config.batch_interval(),
                sample_timeout: config.sample_timeout(),
                state: Mutex::new(State::default()),
                resolved: Notify::new(),
                requests: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a region for sampling. No-op if its key is already resolved,
    /// queued, or in flight.
    pub fn enqueue(&self, region: &Region) {
        let key = region.key();
        let mut state = self.shared.state.lock();
        if state.results.contains_key(&key) {
            return;
        }
        if !state.queued.insert(key) {
            return;
        }
        state.queue.push_back(region.clone());
    }

    /// Non-blocking cache lookup.
    pub fn cached(&self, region: &Region) -> Option<f64> {
        self.shared.state.lock().results.get(&region.key()).copied()
    }

    /// Pre-populate the cache from persisted state, so resumed runs never
    /// re-request already-known values.
    pub fn seed<I>(&self, values: I)
    where
        I: IntoIterator<Item = (Region, f64)>,
    {
        let mut state = self.shared.state.lock();
        for (region, value) in values {
            state.results.insert(region.key(), value);
        }
    }

    /// Total provider round trips issued so far.
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::Relaxed)
    }

    /// Enqueue and wait for a region's value, bounded by the configured
    /// sample timeout. A timeout or provider failure here is fatal to the
    /// refinement run awaiting it.
    pub async fn value_of(&self, region: &Region) -> Result<f64> {
        let key = region.key();
        self.enqueue(region);

        let started = Instant::now();
        let deadline = started + self.shared.sample_timeout;
        loop {
            // Register interest before checking, so a resolution between the
            // check and the await still wakes us.
            let mut notified = pin!(self.shared.resolved.notified());
            notified.as_mut().enable();

            {
                let state = self.shared.state.lock();
                if let Some(value) = state.results.get(&key) {
                    return Ok(*value);
                }
                if let Some(message) = &state.failure {
                    return Err(VargridError::Provider(message.clone()));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let queued = self.shared.state.lock().queue.len();
                return Err(VargridError::SampleTimeout {
                    key,
                    waited_ms: started.elapsed().as_millis() as u64,
                    queued,
                });
            }
        }
    }

    /// Spawn the background batching worker. The worker runs until the
    /// returned handle is shut down (or dropped); the engine does this on
    /// every exit path, normal or failed.
    pub fn spawn_worker<P: SampleProvider>(&self, provider: Arc<P>) -> SamplerWorker {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                let batch = drain_batch(&shared);
                if !batch.is_empty() {
                    dispatch(&shared, provider.as_ref(), batch).await;
                }
                // Idle poll when the queue is empty. A queue-non-empty signal
                // would avoid the wakeups; the fixed sleep also acts as the
                // pacing delay toward a rate-limited provider.
                tokio::time::sleep(shared.batch_interval).await;
            }
        });
        SamplerWorker { handle }
    }
}

/// Pop up to `max_batch` distinct unresolved regions, then spend leftover
/// capacity on breadth-first sub-divisions of the drained regions.
fn drain_batch(shared: &Shared) -> Vec<(String, Region)> {
    let mut state = shared.state.lock();
    let mut out: Vec<(String, Region)> = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();

    while out.len() < shared.max_batch {
        let Some(region) = state.queue.pop_front() else {
            break;
        };
        let key = region.key();
        if state.results.contains_key(&key) || !seen.insert(key.clone()) {
            continue;
        }
        out.push((key, region));
    }

    let drained: Vec<Region> = out.iter().map(|(_, region)| region.clone()).collect();
    for region in drained {
        let remaining = shared.max_batch - out.len();
        if remaining == 0 {
            break;
        }
        for child in region.split_buffer(remaining) {
            if out.len() == shared.max_batch {
                break;
            }
            let key = child.key();
            if state.results.contains_key(&key) || seen.contains(&key) {
                continue;
            }
            seen.insert(key.clone());
            out.push((key, child));
        }
    }

    out
}

async fn dispatch<P: SampleProvider>(shared: &Shared, provider: &P, batch: Vec<(String, Region)>) {
    let coords = batch.iter().map(|(_, region)| region.centroid()).collect();
    let query = SampleQuery {
        measurement: shared.measurement.clone(),
        observed_at: shared.observed_at,
        coords,
    };
    log::debug!(
        "sampling {} coordinates for {}",
        batch.len(),
        shared.measurement
    );

    match provider.fetch(query).await {
        Ok(readings) => {
            let mut state = shared.state.lock();
            for reading in readings {
                state.results.insert(point_key(reading.coord), reading.value);
            }
            for (key, _) in &batch {
                state.queued.remove(key);
            }
            drop(state);

            let requests = shared.requests.fetch_add(1, Ordering::Relaxed) + 1;
            if requests % 10 == 0 {
                log::info!("{requests} provider requests issued");
            }
        }
        Err(e) => {
            log::warn!("provider request failed: {e}");
            let mut state = shared.state.lock();
            state.failure = Some(e.to_string());
            for (key, _) in &batch {
                state.queued.remove(key);
            }
        }
    }
    shared.resolved.notify_waiters();
}

/// Handle to the background batching task. Aborts the task on shutdown or
/// drop.
#[derive(Debug)]
pub struct SamplerWorker {
    handle: JoinHandle<()>,
}

impl SamplerWorker {
    /// Stop the batching loop. Pending waiters will time out rather than
    /// resolve, so this is only called once the scheduler has exited.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for SamplerWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SampleReading, SyntheticProvider};
    use geo::{Coord, Point, Rect};
    use std::future::{Future, ready};

    fn fast_config() -> Config {
        Config::default()
            .with_batch_interval_ms(5)
            .with_sample_timeout_ms(1_000)
    }

    fn region_at(x: f64, y: f64) -> Region {
        Region::from_rect(Rect::new(Coord { x, y }, Coord { x: x + 1.0, y: y + 1.0 }))
    }

    #[test]
    fn test_seed_and_cached() {
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &fast_config());
        let region = region_at(0.0, 0.0);
        assert_eq!(sampler.cached(&region), None);

        sampler.seed([(region.clone(), 3.5)]);
        assert_eq!(sampler.cached(&region), Some(3.5));
    }

    #[test]
    fn test_enqueue_dedups() {
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &fast_config());
        let region = region_at(0.0, 0.0);
        sampler.enqueue(&region);
        sampler.enqueue(&region);
        assert_eq!(sampler.shared.state.lock().queue.len(), 1);

        // Seeded regions are never queued.
        let other = region_at(5.0, 5.0);
        sampler.seed([(other.clone(), 1.0)]);
        sampler.enqueue(&other);
        assert_eq!(sampler.shared.state.lock().queue.len(), 1);
    }

    #[tokio::test]
    async fn test_value_resolves_through_worker() {
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &fast_config());
        let provider = Arc::new(SyntheticProvider::new(|p: Point<f64>| p.x()));
        let worker = sampler.spawn_worker(provider);

        let region = region_at(2.0, 0.0);
        let value = sampler.value_of(&region).await.unwrap();
        assert_eq!(value, 2.5);
        assert!(sampler.request_count() >= 1);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_opportunistic_subdivision_prefetches_children() {
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &fast_config());
        let provider = Arc::new(SyntheticProvider::new(|_| 1.0));
        let worker = sampler.spawn_worker(provider);

        let region = region_at(0.0, 0.0);
        sampler.value_of(&region).await.unwrap();

        // A single drained region tops the batch up with its descendants,
        // so the children resolved in the same round trip.
        for child in region.split() {
            assert!(sampler.cached(&child).is_some());
        }
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_batches_respect_max_batch() {
        struct Recording {
            sizes: Mutex<Vec<usize>>,
        }
        impl SampleProvider for Arc<Recording> {
            fn fetch(
                &self,
                query: SampleQuery,
            ) -> impl Future<Output = Result<Vec<SampleReading>>> + Send {
                self.sizes.lock().push(query.coords.len());
                let readings = query
                    .coords
                    .iter()
                    .map(|&coord| SampleReading { coord, value: 0.0 })
                    .collect();
                ready(Ok(readings))
            }
        }

        let recording = Arc::new(Recording {
            sizes: Mutex::new(Vec::new()),
        });
        let config = fast_config().with_max_batch(3);
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let worker = sampler.spawn_worker(Arc::new(Arc::clone(&recording)));

        let regions: Vec<Region> = (0..7).map(|i| region_at(i as f64 * 10.0, 0.0)).collect();
        for region in &regions {
            sampler.enqueue(region);
        }
        for region in &regions {
            sampler.value_of(region).await.unwrap();
        }

        let sizes = recording.sizes.lock();
        assert!(!sizes.is_empty());
        assert!(sizes.iter().all(|&n| n <= 3));
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_unresolved_value_times_out() {
        struct Silent;
        impl SampleProvider for Silent {
            fn fetch(
                &self,
                _query: SampleQuery,
            ) -> impl Future<Output = Result<Vec<SampleReading>>> + Send {
                ready(Ok(Vec::new()))
            }
        }

        let config = fast_config().with_sample_timeout_ms(50);
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let worker = sampler.spawn_worker(Arc::new(Silent));

        let err = sampler.value_of(&region_at(0.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, VargridError::SampleTimeout { .. }));
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_provider_failure_fails_waiters() {
        struct Failing;
        impl SampleProvider for Failing {
            fn fetch(
                &self,
                _query: SampleQuery,
            ) -> impl Future<Output = Result<Vec<SampleReading>>> + Send {
                ready(Err(VargridError::Provider("rate limited".to_string())))
            }
        }

        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &fast_config());
        let worker = sampler.spawn_worker(Arc::new(Failing));

        let err = sampler.value_of(&region_at(0.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, VargridError::Provider(_)));
        worker.shutdown();
    }
}
