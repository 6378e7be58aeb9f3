//! Refinement scheduler: the partition/stop state machine.
//!
//! Each region moves `Pending -> Evaluated -> Leaf | Branch`. Pending work
//! carries its ancestry chain (the regions above it) and the points of
//! interest it still contains; the chain is what the convergence test reads,
//! so it rides on the work item itself and never depends on whether an
//! ancestor node was persisted or kept.
//!
//! The driving loop alternates between draining queued work into concurrent
//! sampler waits and collecting whatever completed within a polling window.
//! Partial completion is normal; the loop exits when the queue is empty and
//! nothing is in flight. Children are pushed to the front of the queue so a
//! branch's subtree is explored before its siblings, bounding frontier
//! growth.

use crate::config::Config;
use crate::error::{Result, VargridError};
use crate::region::Region;
use crate::sampler::Sampler;
use geo::Point;
use std::collections::VecDeque;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// A not-yet-evaluated region: the unit of scheduler work.
#[derive(Debug, Clone)]
pub struct PendingRegion {
    pub region: Region,
    /// Ancestor regions, root first. The last entry is the direct parent.
    pub ancestry: Vec<Region>,
    /// Points of interest contained in this region.
    pub points: Vec<Point<f64>>,
}

impl PendingRegion {
    /// Seed entry for a fresh run: the root region with every contained
    /// point and no ancestry.
    pub fn root(region: Region, points: Vec<Point<f64>>) -> Self {
        Self {
            region,
            ancestry: Vec::new(),
            points,
        }
    }

    /// Depth equals the number of ancestors.
    pub fn level(&self) -> u32 {
        self.ancestry.len() as u32
    }
}

/// An evaluated region in the scheduler's output.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledNode {
    pub value: f64,
    pub level: u32,
    pub region: Region,
    pub parent: Option<Region>,
}

impl SampledNode {
    pub fn node_key(&self) -> String {
        self.region.node_key(self.level)
    }

    /// Dedup key of the parent node, one level up.
    pub fn parent_key(&self) -> Option<String> {
        self.parent.as_ref().map(|p| p.node_key(self.level - 1))
    }
}

/// Final output of a refinement run.
#[derive(Debug, Default)]
pub struct Refinement {
    pub leaves: Vec<SampledNode>,
    pub branches: Vec<SampledNode>,
}

/// Outcome of the stopping rule for one evaluated region.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StopDecision {
    /// No points of interest remain; stop, keep only under `keep_unused`.
    NoPoints,
    /// Value settled against parent and grandparent; stop and keep.
    Converged(f64),
    /// Keep subdividing.
    Refine,
}

/// Summed pairwise absolute differences between a value, its parent's and
/// its grandparent's. Symmetric in its three terms and monotonic in each
/// pairwise difference.
fn spread(value: f64, parent: f64, grandparent: f64) -> f64 {
    (value - parent).abs() + (parent - grandparent).abs() + (value - grandparent).abs()
}

/// Drives the recursive partition/stop decision over a frontier of pending
/// regions.
pub struct Scheduler<'a> {
    sampler: Sampler,
    config: &'a Config,
    keep_unused: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(sampler: Sampler, config: &'a Config, keep_unused: bool) -> Self {
        Self {
            sampler,
            config,
            keep_unused,
        }
    }

    /// Run the refinement to completion over the given seed frontier.
    ///
    /// Any sampling failure (timeout or provider error) aborts the whole
    /// run: a stalled branch cannot be dropped silently because its value
    /// may still be consulted by descendants' convergence tests.
    pub async fn refine(&self, seeds: Vec<PendingRegion>) -> Result<Refinement> {
        let mut queue: VecDeque<PendingRegion> = seeds.into();
        let mut inflight: JoinSet<(PendingRegion, Result<f64>)> = JoinSet::new();
        let mut output = Refinement::default();
        let mut evaluated = 0usize;

        while !queue.is_empty() || !inflight.is_empty() {
            // Issue requests for a bounded window, then switch to collecting.
            let window = Instant::now();
            while window.elapsed() < self.config.drain_window() {
                let Some(work) = queue.pop_front() else {
                    break;
                };
                let sampler = self.sampler.clone();
                inflight.spawn(async move {
                    let value = sampler.value_of(&work.region).await;
                    (work, value)
                });
            }

            let deadline = Instant::now() + self.config.poll_timeout();
            loop {
                match tokio::time::timeout_at(deadline, inflight.join_next()).await {
                    // Poll window expired with tasks still in flight.
                    Err(_) => break,
                    // Nothing in flight; go refill from the queue.
                    Ok(None) => break,
                    Ok(Some(Err(join_err))) => {
                        return Err(VargridError::TaskFailed(join_err.to_string()));
                    }
                    Ok(Some(Ok((work, value)))) => {
                        let value = value?;
                        evaluated += 1;
                        self.transition(work, value, &mut queue, &mut output);
                    }
                }
            }
        }

        log::debug!(
            "refinement complete: {} evaluated, {} leaves, {} branches",
            evaluated,
            output.leaves.len(),
            output.branches.len()
        );
        Ok(output)
    }

    /// Apply the Evaluated -> Leaf | Branch transition for one region.
    fn transition(
        &self,
        work: PendingRegion,
        value: f64,
        queue: &mut VecDeque<PendingRegion>,
        output: &mut Refinement,
    ) {
        let node = SampledNode {
            value,
            level: work.level(),
            region: work.region.clone(),
            parent: work.ancestry.last().cloned(),
        };

        match self.decide(&work, value) {
            StopDecision::NoPoints => {
                if self.keep_unused {
                    output.leaves.push(node);
                }
            }
            StopDecision::Converged(total) => {
                log::trace!("{} converged at {total}", node.node_key());
                output.leaves.push(node);
            }
            StopDecision::Refine => {
                output.branches.push(node);

                let children = work.region.split();
                let mut ancestry = work.ancestry;
                ancestry.push(work.region);

                let mut rest = work.points;
                for child in children {
                    let (mine, others) = child.partition_points(&rest);
                    rest = others;
                    // Empty children are only worth evaluating when they are
                    // to be kept as formal leaves.
                    if mine.is_empty() && !self.keep_unused {
                        continue;
                    }
                    queue.push_front(PendingRegion {
                        region: child,
                        ancestry: ancestry.clone(),
                        points: mine,
                    });
                }
            }
        }
    }

    /// The stopping rule. A region with fewer than two resolved ancestors
    /// can never converge; the ancestor values are read from the sampler
    /// cache, where the parent's evaluation is guaranteed to have left them.
    fn decide(&self, work: &PendingRegion, value: f64) -> StopDecision {
        if work.points.is_empty() {
            return StopDecision::NoPoints;
        }

        let len = work.ancestry.len();
        if len < 2 {
            return StopDecision::Refine;
        }
        let parent = &work.ancestry[len - 1];
        let grandparent = &work.ancestry[len - 2];
        let (Some(pv), Some(gpv)) = (self.sampler.cached(parent), self.sampler.cached(grandparent))
        else {
            return StopDecision::Refine;
        };

        let total = spread(value, pv, gpv);
        if total < self.config.epsilon {
            StopDecision::Converged(total)
        } else {
            StopDecision::Refine
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SyntheticProvider;
    use geo::{Coord, Rect};
    use std::sync::Arc;
    use std::time::SystemTime;

    fn unit_square() -> Region {
        Region::from_rect(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }))
    }

    fn fast_config() -> Config {
        Config::default()
            .with_batch_interval_ms(5)
            .with_poll_timeout_ms(10)
            .with_drain_window_ms(50)
            .with_sample_timeout_ms(2_000)
    }

    #[test]
    fn test_spread_is_symmetric() {
        let (a, b, c) = (1.0, 4.5, -2.0);
        let reference = spread(a, b, c);
        assert_eq!(spread(a, c, b), reference);
        assert_eq!(spread(b, a, c), reference);
        assert_eq!(spread(b, c, a), reference);
        assert_eq!(spread(c, a, b), reference);
        assert_eq!(spread(c, b, a), reference);
    }

    #[test]
    fn test_spread_is_monotonic() {
        // Widening any single pairwise gap cannot shrink the total.
        let base = spread(1.0, 2.0, 3.0);
        assert!(spread(0.5, 2.0, 3.0) >= base);
        assert!(spread(1.0, 2.0, 3.5) >= base);
        assert!(spread(1.0, 1.5, 3.0) >= base);
    }

    #[test]
    fn test_convergence_requires_two_ancestors() {
        let config = fast_config();
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let scheduler = Scheduler::new(sampler.clone(), &config, false);

        let root = unit_square();
        let child = root.split()[0].clone();
        sampler.seed([(root.clone(), 5.0), (child.clone(), 5.0)]);

        let point = vec![Point::new(0.05, 0.05)];
        let no_ancestors = PendingRegion::root(root.clone(), point.clone());
        assert_eq!(scheduler.decide(&no_ancestors, 5.0), StopDecision::Refine);

        let one_ancestor = PendingRegion {
            region: child.clone(),
            ancestry: vec![root.clone()],
            points: point.clone(),
        };
        assert_eq!(scheduler.decide(&one_ancestor, 5.0), StopDecision::Refine);

        let grandchild = child.split()[0].clone();
        let two_ancestors = PendingRegion {
            region: grandchild,
            ancestry: vec![root, child],
            points: point,
        };
        assert_eq!(
            scheduler.decide(&two_ancestors, 5.0),
            StopDecision::Converged(0.0)
        );
    }

    #[test]
    fn test_unresolved_ancestor_value_forces_refine() {
        let config = fast_config();
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let scheduler = Scheduler::new(sampler.clone(), &config, false);

        let root = unit_square();
        let child = root.split()[0].clone();
        let grandchild = child.split()[0].clone();
        // Only the parent's value is known.
        sampler.seed([(child.clone(), 5.0)]);

        let work = PendingRegion {
            region: grandchild,
            ancestry: vec![root, child],
            points: vec![Point::new(0.05, 0.05)],
        };
        assert_eq!(scheduler.decide(&work, 5.0), StopDecision::Refine);
    }

    #[test]
    fn test_empty_region_stops_immediately() {
        let config = fast_config();
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let scheduler = Scheduler::new(sampler, &config, false);

        let work = PendingRegion::root(unit_square(), Vec::new());
        assert_eq!(scheduler.decide(&work, 5.0), StopDecision::NoPoints);
    }

    #[tokio::test]
    async fn test_refine_constant_field_single_leaf() {
        let config = fast_config();
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let worker = sampler.spawn_worker(Arc::new(SyntheticProvider::new(|_| 5.0)));
        let scheduler = Scheduler::new(sampler.clone(), &config, false);

        let point = Point::new(0.1, 0.1);
        let seeds = vec![PendingRegion::root(unit_square(), vec![point])];
        let refinement = scheduler.refine(seeds).await.unwrap();
        worker.shutdown();

        // Constant field: the third generation converges with zero spread.
        assert_eq!(refinement.leaves.len(), 1);
        let leaf = &refinement.leaves[0];
        assert_eq!(leaf.level, 2);
        assert!(leaf.region.contains(&point));
        assert_eq!(refinement.branches.len(), 2);
    }

    #[tokio::test]
    async fn test_refine_keep_unused_retains_empty_leaves() {
        let config = fast_config();
        let sampler = Sampler::new("t_2m:C", SystemTime::now(), &config);
        let worker = sampler.spawn_worker(Arc::new(SyntheticProvider::new(|_| 5.0)));
        let scheduler = Scheduler::new(sampler.clone(), &config, true);

        let point = Point::new(0.1, 0.1);
        let seeds = vec![PendingRegion::root(unit_square(), vec![point])];
        let refinement = scheduler.refine(seeds).await.unwrap();
        worker.shutdown();

        // Two branch generations of 9 children each: 8 empty leaves per
        // generation plus the one converged leaf holding the point.
        assert_eq!(refinement.leaves.len(), 17);
        assert_eq!(
            refinement
                .leaves
                .iter()
                .filter(|leaf| leaf.region.contains(&point))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_sampling_failure_aborts_run() {
        use crate::provider::{SampleProvider, SampleQuery, SampleReading};
        use std::future::{Future, ready};

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
        let scheduler = Scheduler::new(sampler, &config, false);

        let seeds = vec![PendingRegion::root(
            unit_square(),
            vec![Point::new(0.1, 0.1)],
        )];
        let err = scheduler.refine(seeds).await.unwrap_err();
        worker.shutdown();
        assert!(matches!(err, VargridError::SampleTimeout { .. }));
    }
}
