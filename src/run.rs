//! Engine: the public entry point tying sampler, scheduler and store
//! together.
//!
//! A run reconciles the query against persisted state before any sampling
//! happens: an existing covering root is resumed (its fresh values seed the
//! sampler and its converged frontier short-circuits straight into the
//! output), otherwise a new root is created and refinement starts from the
//! full region. Everything newly evaluated is persisted back under the
//! root. The sampler's background worker is shut down on every exit path.

use crate::config::Config;
use crate::error::{Result, VargridError};
use crate::provider::SampleProvider;
use crate::region::Region;
use crate::sampler::Sampler;
use crate::scheduler::{PendingRegion, Refinement, SampledNode, Scheduler};
use crate::store::{MemoryBackend, TreeBackend, TreeStore};
use crate::tree::RootId;
use geo::Point;
#[cfg(feature = "snapshot")]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Result of one sampling run.
#[derive(Debug)]
pub struct Outcome {
    pub root: RootId,
    pub leaves: Vec<SampledNode>,
    /// Intermediate nodes, present unless `Config::keep_branches` is off.
    pub branches: Vec<SampledNode>,
}

/// Half-open range of observation times stepped by a fixed delta.
#[derive(Debug, Clone)]
pub struct TimeRange {
    next: Option<SystemTime>,
    end: SystemTime,
    step: Duration,
}

impl TimeRange {
    pub fn new(start: SystemTime, end: SystemTime, step: Duration) -> Result<Self> {
        if step.is_zero() {
            return Err(VargridError::InvalidConfig(
                "time step must be greater than zero".to_string(),
            ));
        }
        if start > end {
            return Err(VargridError::InvalidConfig(
                "time range end precedes its start".to_string(),
            ));
        }
        Ok(Self {
            next: Some(start),
            end,
            step,
        })
    }
}

impl Iterator for TimeRange {
    type Item = SystemTime;

    fn next(&mut self) -> Option<SystemTime> {
        let current = self.next.take()?;
        if current >= self.end {
            return None;
        }
        self.next = Some(current + self.step);
        Some(current)
    }
}

/// The adaptive sampling engine.
///
/// Generic over the measurement provider and the tree storage backend; the
/// common case is a remote provider with the in-memory (optionally
/// snapshotted) backend.
pub struct Engine<P: SampleProvider, B: TreeBackend = MemoryBackend> {
    provider: Arc<P>,
    store: TreeStore<B>,
    config: Config,
}

impl<P: SampleProvider> Engine<P, MemoryBackend> {
    /// Engine with default configuration and a fresh in-memory store.
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            store: TreeStore::in_memory(),
            config: Config::default(),
        }
    }

    pub fn builder(provider: P) -> EngineBuilder<P> {
        EngineBuilder::new(provider)
    }
}

impl<P: SampleProvider, B: TreeBackend> Engine<P, B> {
    pub fn with_store(provider: P, config: Config, store: TreeStore<B>) -> Result<Self> {
        config.validate().map_err(VargridError::InvalidConfig)?;
        Ok(Self {
            provider: Arc::new(provider),
            store,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &TreeStore<B> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TreeStore<B> {
        &mut self.store
    }

    /// Run one adaptive sampling pass.
    ///
    /// `region` bounds a fresh run; when a persisted root already covers the
    /// points it is resumed instead and `region` is ignored. `keep_unused`
    /// retains leaves that contain no point of interest (and permits an
    /// empty point set, turning the run exhaustive at the root).
    pub async fn run(
        &mut self,
        region: &Region,
        points: &[Point<f64>],
        measurement: &str,
        observed_at: SystemTime,
        keep_unused: bool,
    ) -> Result<Outcome> {
        if points.is_empty() && !keep_unused {
            return Err(VargridError::NoPointsOfInterest);
        }

        let existing = self.store.resolve_root(points, measurement)?;

        let sampler = Sampler::new(measurement, observed_at, &self.config);
        let worker = sampler.spawn_worker(Arc::clone(&self.provider));
        let result = self
            .drive(&sampler, existing, region, points, measurement, observed_at, keep_unused)
            .await;
        worker.shutdown();
        result
    }

    async fn drive(
        &mut self,
        sampler: &Sampler,
        existing: Option<(RootId, Vec<Point<f64>>)>,
        region: &Region,
        points: &[Point<f64>],
        measurement: &str,
        observed_at: SystemTime,
        keep_unused: bool,
    ) -> Result<Outcome> {
        let mut direct_leaves: Vec<SampledNode> = Vec::new();
        let mut patch_root_region: Option<Region> = None;

        let (root_id, seeds) = match existing {
            None => {
                let (contained, rest) = region.partition_points(points);
                if !rest.is_empty() {
                    log::warn!(
                        "{} points fall outside the starting region",
                        rest.len()
                    );
                }
                let (root_id, _) = self
                    .store
                    .create_root(region, measurement, observed_at)?;
                patch_root_region = Some(region.clone());
                (
                    root_id,
                    vec![PendingRegion::root(region.clone(), contained)],
                )
            }
            Some((root_id, covered)) => {
                log::info!("resuming root {root_id} covering {} points", covered.len());
                let frontier = self.store.load_frontier(
                    root_id,
                    &covered,
                    observed_at,
                    self.config.freshness_window(),
                )?;
                sampler.seed(frontier.seeds);
                direct_leaves = frontier.converged;
                (root_id, frontier.pending)
            }
        };

        let scheduler = Scheduler::new(sampler.clone(), &self.config, keep_unused);
        let Refinement { leaves, branches } = scheduler.refine(seeds).await?;

        let mut to_persist: Vec<SampledNode> = Vec::with_capacity(leaves.len() + branches.len());
        to_persist.extend(branches.iter().cloned());
        to_persist.extend(leaves.iter().cloned());
        self.store.persist(root_id, &to_persist)?;

        // The root node row was created before its value resolved; patch it
        // now that the sampler has one. This is the single permitted value
        // mutation.
        if let Some(root_region) = patch_root_region
            && let Some(value) = sampler.cached(&root_region)
        {
            self.store.set_root_value(root_id, value)?;
        }

        let mut all_leaves = direct_leaves;
        all_leaves.extend(leaves);
        let branches = if self.config.keep_branches {
            branches
        } else {
            Vec::new()
        };

        Ok(Outcome {
            root: root_id,
            leaves: all_leaves,
            branches,
        })
    }

    /// Drive [`Engine::run`] over every (time, measurement) combination.
    pub async fn run_series(
        &mut self,
        region: &Region,
        points: &[Point<f64>],
        measurements: &[&str],
        times: TimeRange,
        keep_unused: bool,
    ) -> Result<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        for observed_at in times {
            for measurement in measurements {
                outcomes.push(
                    self.run(region, points, measurement, observed_at, keep_unused)
                        .await?,
                );
            }
        }
        Ok(outcomes)
    }
}

/// Builder for engines with custom configuration and persistence paths.
#[derive(Debug)]
pub struct EngineBuilder<P> {
    provider: P,
    config: Config,
    #[cfg(feature = "snapshot")]
    snapshot_path: Option<PathBuf>,
}

impl<P: SampleProvider> EngineBuilder<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: Config::default(),
            #[cfg(feature = "snapshot")]
            snapshot_path: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Load the tree store from a snapshot file if it exists; see
    /// [`Engine::save_snapshot`] for the writing half.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_path<T: Into<PathBuf>>(mut self, path: T) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Engine<P, MemoryBackend>> {
        self.config
            .validate()
            .map_err(VargridError::InvalidConfig)?;

        #[cfg(feature = "snapshot")]
        let backend = match &self.snapshot_path {
            Some(path) if path.exists() => MemoryBackend::load_snapshot(path)?,
            _ => MemoryBackend::new(),
        };
        #[cfg(not(feature = "snapshot"))]
        let backend = MemoryBackend::new();

        Ok(Engine {
            provider: Arc::new(self.provider),
            store: TreeStore::new(backend),
            config: self.config,
        })
    }
}

impl<P: SampleProvider> Engine<P, MemoryBackend> {
    /// Persist the current tree store to a snapshot file.
    #[cfg(feature = "snapshot")]
    pub fn save_snapshot(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.store.backend().save_snapshot(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_steps() {
        let start = SystemTime::UNIX_EPOCH;
        let end = start + Duration::from_secs(3 * 86_400);
        let times: Vec<SystemTime> = TimeRange::new(start, end, Duration::from_secs(86_400))
            .unwrap()
            .collect();
        assert_eq!(times.len(), 3);
        assert_eq!(times[0], start);
        assert_eq!(times[2], start + Duration::from_secs(2 * 86_400));
    }

    #[test]
    fn test_time_range_empty_when_start_equals_end() {
        let start = SystemTime::UNIX_EPOCH;
        let times: Vec<SystemTime> = TimeRange::new(start, start, Duration::from_secs(60))
            .unwrap()
            .collect();
        assert!(times.is_empty());
    }

    #[test]
    fn test_time_range_rejects_zero_step() {
        let start = SystemTime::UNIX_EPOCH;
        assert!(TimeRange::new(start, start, Duration::ZERO).is_err());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        use crate::provider::ConstantProvider;

        let result = Engine::builder(ConstantProvider::new(1.0))
            .config(Config::default().with_epsilon(-1.0))
            .build();
        assert!(matches!(result, Err(VargridError::InvalidConfig(_))));
    }
}
