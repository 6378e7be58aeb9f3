//! Region and partition model.
//!
//! A [`Region`] is an immutable polygon plus its derived bounding box. The
//! engine only ever subdivides bounding boxes (a deterministic 3×3 grid), so
//! every derived region is an axis-aligned rectangle; arbitrary polygons are
//! accepted at the root.
//!
//! Regions are identified by their centroid rounded to [`KEY_PRECISION`]
//! decimal places, optionally scoped by tree depth. Two distinct regions can
//! collide only at floating-point precision limits; this is an accepted
//! approximation, not something the engine detects or repairs.

use crate::error::{Result, VargridError};
use geo::{BoundingRect, Contains, Coord, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Decimal places kept when formatting a centroid into a key. Five decimals
/// of longitude/latitude resolve to roughly a meter.
pub const KEY_PRECISION: usize = 5;

/// Margin added around a point hull by [`Region::bounding`] so that hull
/// corner points test as strictly contained.
const BOUND_MARGIN: f64 = 1e-5;

/// Format a coordinate pair into a cache/lookup key.
pub fn point_key(point: Point<f64>) -> String {
    format!(
        "{:.prec$},{:.prec$}",
        point.x(),
        point.y(),
        prec = KEY_PRECISION
    )
}

/// An immutable spatial extent: a polygon with its derived bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    polygon: Polygon<f64>,
    bbox: Rect<f64>,
}

impl Region {
    /// Wrap a polygon, deriving its bounding box.
    pub fn new(polygon: Polygon<f64>) -> Result<Self> {
        let bbox = polygon.bounding_rect().ok_or_else(|| {
            VargridError::InvalidRegion("polygon has no bounding rectangle".to_string())
        })?;
        Ok(Self { polygon, bbox })
    }

    /// Region covering an axis-aligned rectangle.
    pub fn from_rect(bbox: Rect<f64>) -> Self {
        Self {
            polygon: bbox.to_polygon(),
            bbox,
        }
    }

    /// Axis-aligned hull of a point set, expanded by a small margin so the
    /// extreme points are strictly inside. Errors on an empty set.
    pub fn bounding(points: &[Point<f64>]) -> Result<Self> {
        let first = points.first().ok_or_else(|| {
            VargridError::InvalidRegion("cannot bound an empty point set".to_string())
        })?;

        let (mut min_x, mut min_y) = (first.x(), first.y());
        let (mut max_x, mut max_y) = (first.x(), first.y());
        for p in &points[1..] {
            min_x = min_x.min(p.x());
            min_y = min_y.min(p.y());
            max_x = max_x.max(p.x());
            max_y = max_y.max(p.y());
        }

        let bbox = Rect::new(
            Coord {
                x: min_x - BOUND_MARGIN,
                y: min_y - BOUND_MARGIN,
            },
            Coord {
                x: max_x + BOUND_MARGIN,
                y: max_y + BOUND_MARGIN,
            },
        );
        Ok(Self::from_rect(bbox))
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    pub fn bbox(&self) -> Rect<f64> {
        self.bbox
    }

    /// Midpoint of the bounding box. This is the representative coordinate
    /// sampled for the region, and the basis of its key.
    pub fn centroid(&self) -> Point<f64> {
        let min = self.bbox.min();
        let max = self.bbox.max();
        Point::new((min.x + max.x) / 2.0, (min.y + max.y) / 2.0)
    }

    /// Cache key: the rounded centroid.
    pub fn key(&self) -> String {
        point_key(self.centroid())
    }

    /// Depth-scoped key used for node deduplication: two regions with the
    /// same centroid at different depths are distinct nodes.
    pub fn node_key(&self, level: u32) -> String {
        format!("[{level}]{}", self.key())
    }

    /// Strict-interior containment; points on the boundary are outside.
    pub fn contains(&self, point: &Point<f64>) -> bool {
        self.polygon.contains(point)
    }

    /// Partition a point set into those inside this region and the rest.
    pub fn partition_points(
        &self,
        points: &[Point<f64>],
    ) -> (Vec<Point<f64>>, Vec<Point<f64>>) {
        let mut contained = Vec::new();
        let mut rest = Vec::new();
        for p in points {
            if self.contains(p) {
                contained.push(*p);
            } else {
                rest.push(*p);
            }
        }
        (contained, rest)
    }

    /// Deterministically partition the bounding box into a 3×3 grid of nine
    /// sub-regions, x-major. This is the sole subdivision rule.
    pub fn split(&self) -> SmallVec<[Self; 9]> {
        let min = self.bbox.min();
        let max = self.bbox.max();
        let dx = (max.x - min.x) / 3.0;
        let dy = (max.y - min.y) / 3.0;

        let mut out = SmallVec::new();
        for i in 0..3 {
            for j in 0..3 {
                let x = min.x + i as f64 * dx;
                let y = min.y + j as f64 * dy;
                out.push(Self::from_rect(Rect::new(
                    Coord { x, y },
                    Coord {
                        x: x + dx,
                        y: y + dy,
                    },
                )));
            }
        }
        out
    }

    /// Breadth-first descendants of this region, at most `capacity` of them.
    ///
    /// Used by the sampler to top a batch up with sub-regions that are likely
    /// to be requested soon anyway, so one remote round trip amortizes over
    /// as many samples as the provider allows.
    pub fn split_buffer(&self, capacity: usize) -> Vec<Self> {
        let mut out = Vec::with_capacity(capacity.min(64));
        let mut frontier = VecDeque::from([self.clone()]);
        while out.len() < capacity {
            let Some(next) = frontier.pop_front() else {
                break;
            };
            for child in next.split() {
                if out.len() == capacity {
                    return out;
                }
                out.push(child.clone());
                frontier.push_back(child);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Region {
        Region::from_rect(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }))
    }

    #[test]
    fn test_centroid_is_bbox_midpoint() {
        let region = unit_square();
        assert_eq!(region.centroid(), Point::new(0.5, 0.5));
    }

    #[test]
    fn test_key_precision() {
        let region = unit_square();
        assert_eq!(region.key(), "0.50000,0.50000");
        assert_eq!(region.node_key(3), "[3]0.50000,0.50000");
    }

    #[test]
    fn test_node_keys_distinct_per_level() {
        let region = unit_square();
        assert_ne!(region.node_key(0), region.node_key(1));
    }

    #[test]
    fn test_split_yields_nine_tiles() {
        let region = unit_square();
        let parts = region.split();
        assert_eq!(parts.len(), 9);

        // The tiles cover the parent bbox without gaps or overlaps.
        let area: f64 = parts
            .iter()
            .map(|p| {
                let b = p.bbox();
                b.width() * b.height()
            })
            .sum();
        assert!((area - 1.0).abs() < 1e-12);

        let mut keys: Vec<String> = parts.iter().map(Region::key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 9);

        for p in &parts {
            let b = p.bbox();
            assert!(b.min().x >= -1e-12 && b.max().x <= 1.0 + 1e-12);
            assert!(b.min().y >= -1e-12 && b.max().y <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let region = unit_square();
        let a: Vec<String> = region.split().iter().map(Region::key).collect();
        let b: Vec<String> = region.split().iter().map(Region::key).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_partition_points() {
        let region = unit_square();
        let points = [
            Point::new(0.2, 0.2),
            Point::new(1.5, 0.5),
            Point::new(0.8, 0.9),
        ];
        let (contained, rest) = region.partition_points(&points);
        assert_eq!(contained.len(), 2);
        assert_eq!(rest, vec![Point::new(1.5, 0.5)]);
    }

    #[test]
    fn test_boundary_points_are_outside() {
        let region = unit_square();
        assert!(!region.contains(&Point::new(0.0, 0.5)));
        assert!(region.contains(&Point::new(1e-9, 0.5)));
    }

    #[test]
    fn test_bounding_contains_extremes() {
        let points = [Point::new(0.0, 0.0), Point::new(2.0, 3.0)];
        let region = Region::bounding(&points).unwrap();
        assert!(region.contains(&points[0]));
        assert!(region.contains(&points[1]));
    }

    #[test]
    fn test_bounding_rejects_empty() {
        assert!(Region::bounding(&[]).is_err());
    }

    #[test]
    fn test_split_buffer_respects_capacity() {
        let region = unit_square();
        for capacity in [0, 5, 9, 10, 90] {
            let buffer = region.split_buffer(capacity);
            assert_eq!(buffer.len(), capacity);
        }
    }

    #[test]
    fn test_split_buffer_middle_cells_share_parent_centroid() {
        // The middle cell of a 3x3 split has the same centroid as its
        // parent, so a two-generation buffer of 90 regions carries exactly
        // 81 distinct keys (9 children + 81 grandchildren, 9 of which
        // collide with their parents). Consumers dedup by key.
        let region = unit_square();
        let mut keys: Vec<String> = region.split_buffer(90).iter().map(Region::key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 81);
    }
}
