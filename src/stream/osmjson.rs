//! Line-delimited OSM JSON.
//!
//! One header object on the first line, then one entity object per line.
//! Ways may carry a `geometry` array with one `{lat, lon}` (or `null`) per
//! node reference once their locations are resolved.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::entity::{Entity, EntityKind, KindFilter, Location, Member, Node, Relation, Tags, Way};
use crate::error::ClipError;

const BATCH_SIZE: usize = 4096;
const STREAM_VERSION: &str = "0.6";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub version: String,
    #[serde(default)]
    pub generator: String,
}

impl StreamHeader {
    pub fn new(generator: impl Into<String>) -> Self {
        Self {
            version: STREAM_VERSION.to_string(),
            generator: generator.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEntity {
    Node(WireNode),
    Way(WireWay),
    Relation(WireRelation),
}

#[derive(Serialize, Deserialize)]
struct WireNode {
    id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
}

#[derive(Serialize, Deserialize)]
struct WireWay {
    id: i64,
    #[serde(default)]
    nodes: Vec<i64>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    geometry: Vec<Option<WirePoint>>,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct WirePoint {
    lat: f64,
    lon: f64,
}

#[derive(Serialize, Deserialize)]
struct WireRelation {
    id: i64,
    #[serde(default)]
    members: Vec<WireMember>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    tags: Tags,
}

#[derive(Serialize, Deserialize)]
struct WireMember {
    #[serde(rename = "type")]
    kind: WireKind,
    #[serde(rename = "ref")]
    id: i64,
    #[serde(default)]
    role: String,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireKind {
    Node,
    Way,
    Relation,
}

impl From<WireKind> for EntityKind {
    fn from(kind: WireKind) -> Self {
        match kind {
            WireKind::Node => EntityKind::Node,
            WireKind::Way => EntityKind::Way,
            WireKind::Relation => EntityKind::Relation,
        }
    }
}

impl From<EntityKind> for WireKind {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Node => WireKind::Node,
            EntityKind::Way => WireKind::Way,
            EntityKind::Relation => WireKind::Relation,
        }
    }
}

impl From<WirePoint> for Location {
    fn from(point: WirePoint) -> Self {
        Location::new(point.lon, point.lat)
    }
}

impl From<Location> for WirePoint {
    fn from(location: Location) -> Self {
        WirePoint {
            lat: location.lat,
            lon: location.lon,
        }
    }
}

impl WireEntity {
    fn kind(&self) -> EntityKind {
        match self {
            WireEntity::Node(_) => EntityKind::Node,
            WireEntity::Way(_) => EntityKind::Way,
            WireEntity::Relation(_) => EntityKind::Relation,
        }
    }

    fn into_entity(self) -> Result<Entity, String> {
        Ok(match self {
            WireEntity::Node(node) => {
                let location = match (node.lon, node.lat) {
                    (Some(lon), Some(lat)) => Some(Location::new(lon, lat)),
                    (None, None) => None,
                    _ => return Err(format!("node {} has only one coordinate", node.id)),
                };
                Entity::Node(Node {
                    id: node.id,
                    location,
                    tags: node.tags,
                })
            }
            WireEntity::Way(way) => {
                if !way.geometry.is_empty() && way.geometry.len() != way.nodes.len() {
                    return Err(format!(
                        "way {} has {} geometry points for {} nodes",
                        way.id,
                        way.geometry.len(),
                        way.nodes.len()
                    ));
                }
                Entity::Way(Way {
                    id: way.id,
                    refs: way.nodes,
                    tags: way.tags,
                    locations: way
                        .geometry
                        .into_iter()
                        .map(|point| point.map(Location::from))
                        .collect(),
                })
            }
            WireEntity::Relation(relation) => Entity::Relation(Relation {
                id: relation.id,
                members: relation
                    .members
                    .into_iter()
                    .map(|member| Member {
                        kind: member.kind.into(),
                        id: member.id,
                        role: member.role,
                    })
                    .collect(),
                tags: relation.tags,
            }),
        })
    }

    fn from_entity(entity: &Entity) -> Self {
        match entity {
            Entity::Node(node) => WireEntity::Node(WireNode {
                id: node.id,
                lat: node.location.map(|loc| loc.lat),
                lon: node.location.map(|loc| loc.lon),
                tags: node.tags.clone(),
            }),
            Entity::Way(way) => WireEntity::Way(WireWay {
                id: way.id,
                nodes: way.refs.clone(),
                tags: way.tags.clone(),
                geometry: way
                    .locations
                    .iter()
                    .map(|loc| loc.map(WirePoint::from))
                    .collect(),
            }),
            Entity::Relation(relation) => WireEntity::Relation(WireRelation {
                id: relation.id,
                members: relation
                    .members
                    .iter()
                    .map(|member| WireMember {
                        kind: member.kind.into(),
                        id: member.id,
                        role: member.role.clone(),
                    })
                    .collect(),
                tags: relation.tags.clone(),
            }),
        }
    }
}

pub fn write_header<W: Write>(writer: &mut W, header: &StreamHeader) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, header)?;
    writeln!(writer)
}

pub fn write_entity<W: Write>(writer: &mut W, entity: &Entity) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, &WireEntity::from_entity(entity))?;
    writeln!(writer)
}

/// Reads an OSM JSON line stream in batches, dropping kinds outside the filter.
pub struct OsmJsonReader<R> {
    reader: R,
    kinds: KindFilter,
    path: PathBuf,
    header: Option<StreamHeader>,
    line: String,
    line_number: u64,
    /// Set once a non-blank line was read; only that line may be the header
    started: bool,
    done: bool,
}

impl<R: BufRead> OsmJsonReader<R> {
    pub fn new(reader: R, kinds: KindFilter, path: &Path) -> Self {
        Self {
            reader,
            kinds,
            path: path.to_path_buf(),
            header: None,
            line: String::new(),
            line_number: 0,
            started: false,
            done: false,
        }
    }

    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }

    /// Next batch of up to `BATCH_SIZE` lines, `None` at end of stream.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Entity>>, ClipError> {
        if self.done {
            return Ok(None);
        }

        let mut entities = Vec::new();
        let mut lines = 0;
        while lines < BATCH_SIZE {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .map_err(|source| ClipError::Read {
                    path: self.path.clone(),
                    source,
                })?;
            if read == 0 {
                self.done = true;
                break;
            }
            self.line_number += 1;
            lines += 1;

            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            let first = !self.started;
            self.started = true;
            if first && !text.contains("\"type\"") {
                let header: StreamHeader =
                    serde_json::from_str(text).map_err(|err| self.decode_error(err))?;
                self.header = Some(header);
                continue;
            }

            let wire: WireEntity = serde_json::from_str(text).map_err(|err| self.decode_error(err))?;
            if !self.kinds.accepts(wire.kind()) {
                continue;
            }
            entities.push(wire.into_entity().map_err(|err| self.decode_error(err))?);
        }

        if self.done && entities.is_empty() {
            return Ok(None);
        }
        Ok(Some(entities))
    }

    fn decode_error(&self, err: impl std::fmt::Display) -> ClipError {
        ClipError::Decode {
            path: self.path.clone(),
            reason: format!("line {}: {}", self.line_number, err),
        }
    }
}
