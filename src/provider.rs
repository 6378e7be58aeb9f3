//! Remote sampling provider boundary.
//!
//! The engine never talks to a measurement source directly; it hands a batch
//! of coordinates to a [`SampleProvider`] and expects one scalar back per
//! coordinate. Provider failures are opaque here: whatever richer per-error
//! retry policy a deployment wants (splitting by parameter, time window or
//! coordinate count) belongs in a wrapper around the provider, not in the
//! engine.

use crate::error::Result;
use geo::Point;
use std::future::{Future, ready};
use std::time::SystemTime;

/// One batched request: a measurement name, an observation time and the
/// coordinates to sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleQuery {
    pub measurement: String,
    pub observed_at: SystemTime,
    pub coords: Vec<Point<f64>>,
}

/// One scalar result for one queried coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleReading {
    pub coord: Point<f64>,
    pub value: f64,
}

/// A remote per-location measurement source.
///
/// Implementations must echo queried coordinates verbatim in their readings;
/// results are matched back to waiting regions by the rounded coordinate
/// key. A provider may return fewer readings than coordinates (unknown
/// locations); affected requests will time out rather than error.
pub trait SampleProvider: Send + Sync + 'static {
    /// Resolve one scalar per coordinate, up to the provider's batch limit.
    fn fetch(&self, query: SampleQuery) -> impl Future<Output = Result<Vec<SampleReading>>> + Send;
}

/// An in-process provider computing values from a closure over the
/// coordinate. Useful for tests, demos and synthetic fields.
///
/// # Example
///
/// ```rust
/// use vargrid::SyntheticProvider;
///
/// // A linear field in x.
/// let provider = SyntheticProvider::new(|p: geo::Point<f64>| 10.0 * p.x());
/// ```
#[derive(Debug, Clone)]
pub struct SyntheticProvider<F> {
    field: F,
}

impl<F> SyntheticProvider<F>
where
    F: Fn(Point<f64>) -> f64 + Send + Sync + 'static,
{
    pub fn new(field: F) -> Self {
        Self { field }
    }
}

impl<F> SampleProvider for SyntheticProvider<F>
where
    F: Fn(Point<f64>) -> f64 + Send + Sync + 'static,
{
    fn fetch(&self, query: SampleQuery) -> impl Future<Output = Result<Vec<SampleReading>>> + Send {
        let readings = query
            .coords
            .iter()
            .map(|&coord| SampleReading {
                coord,
                value: (self.field)(coord),
            })
            .collect();
        ready(Ok(readings))
    }
}

/// A provider returning the same value for every coordinate.
#[derive(Debug, Clone, Copy)]
pub struct ConstantProvider {
    value: f64,
}

impl ConstantProvider {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl SampleProvider for ConstantProvider {
    fn fetch(&self, query: SampleQuery) -> impl Future<Output = Result<Vec<SampleReading>>> + Send {
        let value = self.value;
        let readings = query
            .coords
            .iter()
            .map(|&coord| SampleReading { coord, value })
            .collect();
        ready(Ok(readings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_provider_echoes_coords() {
        let provider = SyntheticProvider::new(|p: Point<f64>| p.x() + p.y());
        let coords = vec![Point::new(1.0, 2.0), Point::new(3.0, 4.0)];
        let readings = provider
            .fetch(SampleQuery {
                measurement: "t_2m:C".to_string(),
                observed_at: SystemTime::now(),
                coords: coords.clone(),
            })
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].coord, coords[0]);
        assert_eq!(readings[0].value, 3.0);
        assert_eq!(readings[1].value, 7.0);
    }

    #[tokio::test]
    async fn test_constant_provider() {
        let provider = ConstantProvider::new(5.0);
        let readings = provider
            .fetch(SampleQuery {
                measurement: "t_2m:C".to_string(),
                observed_at: SystemTime::now(),
                coords: vec![Point::new(0.0, 0.0)],
            })
            .await
            .unwrap();
        assert_eq!(readings[0].value, 5.0);
    }
}
