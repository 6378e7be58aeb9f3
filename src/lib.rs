//! Adaptive spatial sampling engine with variable-resolution refinement,
//! request batching and resumable persistence.
//!
//! Given a bounding region and a set of points of interest, the engine
//! recursively subdivides the region into a 3×3 hierarchy, samples each
//! sub-region's representative value from a remote provider, and stops a
//! branch once its value has converged across two generations or it no
//! longer contains a point of interest. The result is a partition that is
//! fine where the measured field is heterogeneous or points are dense, and
//! coarse elsewhere — persisted as a tree that later runs resume instead of
//! re-sampling.
//!
//! ```rust,no_run
//! use std::time::SystemTime;
//! use vargrid::{ConstantProvider, Engine, Point, Region};
//!
//! # fn main() -> vargrid::Result<()> {
//! let points = vec![Point::new(0.1, 0.1), Point::new(0.9, 0.9)];
//! let region = Region::bounding(&points)?;
//!
//! let mut engine = Engine::new(ConstantProvider::new(5.0));
//! let runtime = tokio::runtime::Runtime::new()?;
//! let outcome = runtime.block_on(engine.run(
//!     &region,
//!     &points,
//!     "t_2m:C",
//!     SystemTime::now(),
//!     false,
//! ))?;
//! println!("{} leaves, {} branches", outcome.leaves.len(), outcome.branches.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod provider;
pub mod region;
pub mod run;
pub mod sampler;
pub mod scheduler;
pub mod store;
pub mod tree;

#[cfg(feature = "geojson")]
pub mod export;

pub use config::Config;
pub use error::{Result, VargridError};
pub use provider::{
    ConstantProvider, SampleProvider, SampleQuery, SampleReading, SyntheticProvider,
};
pub use region::{KEY_PRECISION, Region};
pub use run::{Engine, EngineBuilder, Outcome, TimeRange};
pub use sampler::{Sampler, SamplerWorker};
pub use scheduler::{PendingRegion, Refinement, SampledNode, Scheduler};
pub use store::{Frontier, MemoryBackend, TreeBackend, TreeStore};
pub use tree::{AncestryEdge, Node, NodeId, Root, RootId};

pub use geo::{Point, Polygon, Rect};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {
    pub use crate::{Config, Engine, EngineBuilder, Outcome, Result, VargridError};

    pub use crate::{ConstantProvider, SampleProvider, SyntheticProvider};

    pub use crate::{Region, SampledNode};

    pub use crate::{MemoryBackend, TreeBackend, TreeStore};

    pub use geo::{Point, Polygon, Rect};

    pub use std::time::{Duration, SystemTime};
}
