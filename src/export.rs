//! GeoJSON export of refinement output, for rendering the
//! variable-resolution partition on a map.

use crate::scheduler::SampledNode;
use geojson::{Feature, FeatureCollection, Geometry, Value};
use serde_json::Map;

/// One feature per node: the region polygon with `value` and `level`
/// properties.
pub fn to_feature_collection(nodes: &[SampledNode]) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: nodes.iter().map(feature_of).collect(),
        foreign_members: None,
    }
}

fn feature_of(node: &SampledNode) -> Feature {
    let polygon = node.region.polygon();

    let mut rings = Vec::with_capacity(1 + polygon.interiors().len());
    let exterior: Vec<Vec<f64>> = polygon
        .exterior()
        .coords()
        .map(|coord| vec![coord.x, coord.y])
        .collect();
    rings.push(exterior);
    for interior in polygon.interiors() {
        let ring: Vec<Vec<f64>> = interior
            .coords()
            .map(|coord| vec![coord.x, coord.y])
            .collect();
        rings.push(ring);
    }

    let mut properties = Map::new();
    properties.insert("value".to_string(), node.value.into());
    properties.insert("level".to_string(), node.level.into());

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Polygon(rings))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}
