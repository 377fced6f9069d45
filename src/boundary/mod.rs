//! Named boundary regions, reduced to their outer rings.
//!
//! Every polygon of a boundary feature keeps only its exterior ring, so a
//! point inside a hole of the real boundary still counts as inside the
//! region. Regions are immutable once loaded and can be shared across threads.

use geo::{BoundingRect, Intersects};
use geo_types::{Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, Value as GeoValue};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::{BoundaryConfig, MissingNamePolicy};
use crate::entity::Location;
use crate::error::ClipError;
use crate::sinks::StagedOutput;

const EXPORT_NAME: &str = "boundaries";
const CRS84: &str = "urn:ogc:def:crs:OGC:1.3:CRS84";

#[derive(Clone, Debug)]
pub struct BoundaryRegion {
    name: String,
    outer: MultiPolygon<f64>,
    bbox: Option<Rect<f64>>,
}

impl BoundaryRegion {
    fn new(name: String, outer: MultiPolygon<f64>) -> Self {
        let bbox = outer.bounding_rect();
        Self { name, outer, bbox }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outer rings of the region, one polygon per ring, never with interiors.
    pub fn outer(&self) -> &MultiPolygon<f64> {
        &self.outer
    }

    /// Points on a ring count as inside.
    pub fn contains(&self, point: &Point<f64>) -> bool {
        match &self.bbox {
            Some(bbox) if bbox.intersects(point) => self.outer.intersects(point),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BoundaryStore {
    regions: BTreeMap<String, BoundaryRegion>,
}

impl BoundaryStore {
    /// Load a GeoJSON Feature or FeatureCollection.
    pub fn load(path: &Path, config: &BoundaryConfig) -> Result<Self, ClipError> {
        if !path.exists() {
            return Err(ClipError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ClipError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let geojson: GeoJson = text.parse().map_err(|err| ClipError::InvalidBoundary {
            path: path.to_path_buf(),
            reason: format!("{}", err),
        })?;

        let features = match geojson {
            GeoJson::FeatureCollection(collection) => collection.features,
            GeoJson::Feature(feature) => vec![feature],
            GeoJson::Geometry(_) => {
                return Err(ClipError::InvalidBoundary {
                    path: path.to_path_buf(),
                    reason: "expected a Feature or FeatureCollection".to_string(),
                });
            }
        };

        let store = Self::from_features(path, features, config)?;
        tracing::info!(
            "Boundary: loaded {} region(s) from {:?}",
            store.len(),
            path
        );
        Ok(store)
    }

    pub fn from_features(
        path: &Path,
        features: Vec<Feature>,
        config: &BoundaryConfig,
    ) -> Result<Self, ClipError> {
        let mut outers: BTreeMap<String, Vec<Polygon<f64>>> = BTreeMap::new();

        for (index, feature) in features.into_iter().enumerate() {
            let Some(geometry) = feature.geometry else {
                tracing::warn!("Boundary: feature {} has no geometry, skipped", index);
                continue;
            };
            let polygons = outer_rings(&geometry.value).map_err(|reason| {
                ClipError::InvalidBoundary {
                    path: path.to_path_buf(),
                    reason: format!("feature {}: {}", index, reason),
                }
            })?;
            if polygons.is_empty() {
                tracing::warn!("Boundary: feature {} has no polygon geometry, skipped", index);
                continue;
            }

            let name = match region_name(feature.properties.as_ref(), &config.name_fields) {
                Some(name) => name,
                None if config.missing_name == MissingNamePolicy::Synthesize => {
                    format!("region-{}", index)
                }
                None => {
                    return Err(ClipError::MissingAttribute {
                        path: path.to_path_buf(),
                        index,
                        candidates: config.name_fields.clone(),
                    });
                }
            };
            tracing::debug!(
                "Boundary: feature {} -> {:?} ({} outer ring(s))",
                index,
                name,
                polygons.len()
            );
            outers.entry(name).or_default().extend(polygons);
        }

        Ok(Self::from_regions(
            outers
                .into_iter()
                .map(|(name, polygons)| (name, MultiPolygon::new(polygons))),
        ))
    }

    /// Build a store from named geometries. Interior rings are dropped.
    pub fn from_regions<I>(regions: I) -> Self
    where
        I: IntoIterator<Item = (String, MultiPolygon<f64>)>,
    {
        let mut merged: BTreeMap<String, Vec<Polygon<f64>>> = BTreeMap::new();
        for (name, multi) in regions {
            merged.entry(name).or_default().extend(
                multi
                    .into_iter()
                    .map(|polygon| Polygon::new(polygon.exterior().clone(), vec![])),
            );
        }
        Self {
            regions: merged
                .into_iter()
                .map(|(name, polygons)| {
                    let region = BoundaryRegion::new(name.clone(), MultiPolygon::new(polygons));
                    (name, region)
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region names in ascending order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn region(&self, name: &str) -> Option<&BoundaryRegion> {
        self.regions.get(name)
    }

    /// Whether `location` lies inside the named region, or inside any region
    /// when no name is given. An unknown region contains nothing.
    pub fn contains(&self, location: Location, region: Option<&str>) -> bool {
        let point = location.to_point();
        match region {
            Some(name) => self
                .regions
                .get(name)
                .is_some_and(|region| region.contains(&point)),
            None => self.regions.values().any(|region| region.contains(&point)),
        }
    }

    /// Write every region as a named MultiPolygon feature, replacing any
    /// existing file at `path`.
    pub fn export_regions(&self, path: &Path) -> Result<(), ClipError> {
        let features = self
            .regions
            .values()
            .map(|region| {
                let mut properties = JsonObject::new();
                properties.insert("name".to_string(), Value::String(region.name().to_string()));
                Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(GeoValue::from(region.outer()))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();

        let mut foreign_members = JsonObject::new();
        foreign_members.insert("name".to_string(), Value::String(EXPORT_NAME.to_string()));
        foreign_members.insert(
            "crs".to_string(),
            json!({ "type": "name", "properties": { "name": CRS84 } }),
        );
        let collection = GeoJson::FeatureCollection(FeatureCollection {
            bbox: None,
            features,
            foreign_members: Some(foreign_members),
        });

        let staged = StagedOutput::create(path, true)?;
        let mut writer = BufWriter::new(staged.writer()?);
        serde_json::to_writer_pretty(&mut writer, &collection)
            .map_err(|err| ClipError::write(path, err.into()))?;
        writeln!(writer).map_err(|source| ClipError::write(path, source))?;
        writer
            .flush()
            .map_err(|source| ClipError::write(path, source))?;
        drop(writer);
        staged.commit()?;

        tracing::info!("Boundary: exported {} region(s) to {:?}", self.len(), path);
        Ok(())
    }
}

/// First candidate field present with a non-empty value, keys compared
/// case-insensitively.
fn region_name(properties: Option<&JsonObject>, candidates: &[String]) -> Option<String> {
    let properties = properties?;
    candidates.iter().find_map(|candidate| {
        let (_, value) = properties
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(candidate))?;
        let name = match value {
            Value::Null => return None,
            Value::String(text) => text.trim().to_string(),
            other => other.to_string(),
        };
        (!name.is_empty()).then_some(name)
    })
}

fn outer_rings(value: &GeoValue) -> Result<Vec<Polygon<f64>>, String> {
    match value {
        GeoValue::Polygon(rings) => Ok(exterior(rings)?.into_iter().collect()),
        GeoValue::MultiPolygon(polygons) => {
            let mut outers = Vec::with_capacity(polygons.len());
            for rings in polygons {
                outers.extend(exterior(rings)?);
            }
            Ok(outers)
        }
        GeoValue::GeometryCollection(geometries) => {
            let mut outers = Vec::new();
            for geometry in geometries {
                outers.extend(outer_rings(&geometry.value)?);
            }
            Ok(outers)
        }
        _ => Ok(Vec::new()),
    }
}

/// Polygon from the first ring of a GeoJSON polygon, holes discarded.
fn exterior(rings: &[Vec<geojson::Position>]) -> Result<Option<Polygon<f64>>, String> {
    let Some(ring) = rings.first() else {
        return Ok(None);
    };
    let mut coords = Vec::with_capacity(ring.len());
    for position in ring {
        if position.len() < 2 {
            return Err(format!("position with {} coordinate(s)", position.len()));
        }
        coords.push(Coord {
            x: position[0],
            y: position[1],
        });
    }
    if coords.len() < 4 {
        return Err(format!("ring with {} position(s), need at least 4", coords.len()));
    }
    Ok(Some(Polygon::new(LineString::new(coords), vec![])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::polygon;
    use std::io::Write;

    fn square(min: f64, max: f64) -> Polygon<f64> {
        polygon![
            (x: min, y: min),
            (x: min, y: max),
            (x: max, y: max),
            (x: max, y: min),
            (x: min, y: min),
        ]
    }

    fn write_geojson(value: serde_json::Value) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".geojson").tempfile().unwrap();
        file.write_all(value.to_string().as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn polygon_feature(properties: serde_json::Value, rings: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "Feature",
            "properties": properties,
            "geometry": { "type": "Polygon", "coordinates": rings }
        })
    }

    fn square_ring(min: f64, max: f64) -> serde_json::Value {
        json!([[min, min], [min, max], [max, max], [max, min], [min, min]])
    }

    #[test]
    fn square_region_contains_interior_point_only() {
        let store = BoundaryStore::from_regions([(
            "Forest A".to_string(),
            MultiPolygon::new(vec![square(0.0, 10.0)]),
        )]);

        assert!(store.contains(Location::new(5.0, 5.0), Some("Forest A")));
        assert!(!store.contains(Location::new(15.0, 15.0), Some("Forest A")));
        assert!(store.contains(Location::new(5.0, 5.0), None));
        assert!(!store.contains(Location::new(5.0, 5.0), Some("Forest B")));
    }

    #[test]
    fn point_on_ring_is_inside() {
        let store = BoundaryStore::from_regions([(
            "edge".to_string(),
            MultiPolygon::new(vec![square(0.0, 10.0)]),
        )]);
        assert!(store.contains(Location::new(0.0, 5.0), None));
        assert!(store.contains(Location::new(10.0, 10.0), None));
    }

    #[test]
    fn holes_are_discarded() {
        let file = write_geojson(json!({
            "type": "FeatureCollection",
            "features": [polygon_feature(
                json!({ "name": "Holey" }),
                json!([
                    [[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0], [0.0, 0.0]],
                    [[4.0, 4.0], [4.0, 6.0], [6.0, 6.0], [6.0, 4.0], [4.0, 4.0]]
                ]),
            )]
        }));
        let store = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap();

        let region = store.region("Holey").unwrap();
        assert_eq!(region.outer().0.len(), 1);
        let polygon = &region.outer().0[0];
        assert!(polygon.interiors().is_empty());
        assert_eq!(polygon.exterior(), square(0.0, 10.0).exterior());

        assert!(store.contains(Location::new(5.0, 5.0), Some("Holey")));
    }

    #[test]
    fn multipolygon_keeps_every_outer_ring() {
        let file = write_geojson(json!({
            "type": "Feature",
            "properties": { "name": "Split" },
            "geometry": {
                "type": "MultiPolygon",
                "coordinates": [
                    [[[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]],
                    [[[5.0, 5.0], [5.0, 6.0], [6.0, 6.0], [6.0, 5.0], [5.0, 5.0]]]
                ]
            }
        }));
        let store = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap();

        assert_eq!(store.region("Split").unwrap().outer().0.len(), 2);
        assert!(store.contains(Location::new(5.5, 5.5), None));
        assert!(!store.contains(Location::new(3.0, 3.0), None));
    }

    #[test]
    fn name_field_is_case_insensitive_and_ordered() {
        let file = write_geojson(json!({
            "type": "FeatureCollection",
            "features": [
                polygon_feature(json!({ "FORESTNAME": "Pike" }), json!([square_ring(0.0, 1.0)])),
                polygon_feature(
                    json!({ "unit_name": "Unit 7", "Name": "Preferred" }),
                    json!([square_ring(2.0, 3.0)]),
                ),
            ]
        }));
        let store = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap();
        let names: Vec<&str> = store.names().collect();
        assert_eq!(names, vec!["Pike", "Preferred"]);
    }

    #[test]
    fn features_sharing_a_name_merge() {
        let file = write_geojson(json!({
            "type": "FeatureCollection",
            "features": [
                polygon_feature(json!({ "name": "Twin" }), json!([square_ring(0.0, 1.0)])),
                polygon_feature(json!({ "name": "Twin" }), json!([square_ring(5.0, 6.0)])),
            ]
        }));
        let store = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.region("Twin").unwrap().outer().0.len(), 2);
        assert!(store.contains(Location::new(5.5, 5.5), Some("Twin")));
    }

    #[test]
    fn missing_name_fails_or_synthesizes() {
        let file = write_geojson(json!({
            "type": "FeatureCollection",
            "features": [
                polygon_feature(json!({ "name": "Named" }), json!([square_ring(0.0, 1.0)])),
                polygon_feature(json!({ "id": 4 }), json!([square_ring(2.0, 3.0)])),
            ]
        }));

        let err = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap_err();
        assert!(matches!(err, ClipError::MissingAttribute { index: 1, .. }));

        let config = BoundaryConfig {
            missing_name: MissingNamePolicy::Synthesize,
            ..BoundaryConfig::default()
        };
        let store = BoundaryStore::load(file.path(), &config).unwrap();
        assert!(store.region("region-1").is_some());
        assert!(store.region("Named").is_some());
    }

    #[test]
    fn non_polygon_features_are_skipped() {
        let file = write_geojson(json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [1.0, 1.0] } },
                polygon_feature(json!({ "name": "Only" }), json!([square_ring(0.0, 1.0)])),
            ]
        }));
        let store = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap();
        assert_eq!(store.names().collect::<Vec<_>>(), vec!["Only"]);
    }

    #[test]
    fn load_errors() {
        let missing = Path::new("/nonexistent/forests.geojson");
        let err = BoundaryStore::load(missing, &BoundaryConfig::default()).unwrap_err();
        assert!(matches!(err, ClipError::NotFound { .. }));

        let mut file = tempfile::Builder::new().suffix(".geojson").tempfile().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = BoundaryStore::load(file.path(), &BoundaryConfig::default()).unwrap_err();
        assert!(matches!(err, ClipError::InvalidBoundary { .. }));
    }

    #[test]
    fn empty_store_exports_empty_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundaries.geojson");
        BoundaryStore::default().export_regions(&path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["type"], "FeatureCollection");
        assert_eq!(parsed["name"], "boundaries");
        assert_eq!(parsed["crs"]["properties"]["name"], CRS84);
        assert!(parsed["features"].as_array().unwrap().is_empty());
    }

    #[test]
    fn export_overwrites_and_lists_regions_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundaries.geojson");
        std::fs::write(&path, "stale").unwrap();

        let store = BoundaryStore::from_regions([
            ("Zeta".to_string(), MultiPolygon::new(vec![square(0.0, 1.0)])),
            ("Alpha".to_string(), MultiPolygon::new(vec![square(2.0, 3.0)])),
        ]);
        store.export_regions(&path).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let features = parsed["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["properties"]["name"], "Alpha");
        assert_eq!(features[1]["properties"]["name"], "Zeta");
        assert_eq!(features[0]["geometry"]["type"], "MultiPolygon");
    }

    #[test]
    fn export_to_missing_directory_is_write_error() {
        let err = BoundaryStore::default()
            .export_regions(Path::new("/nonexistent/dir/boundaries.geojson"))
            .unwrap_err();
        assert!(matches!(err, ClipError::WriteError { .. }));
    }
}
