use osmpbf::{Blob, BlobDecode, Element, ErrorKind, HeaderBlock, RelMemberType};
use std::path::Path;

use crate::entity::{Entity, EntityKind, KindFilter, Location, Member, Node, Relation, Way};
use crate::error::ClipError;
use crate::utils::build_tag_map;

const SORT_FEATURES: [&str; 4] = ["Sort.Type_then_ID", "Sort.Nodes", "Sort.Ways", "Sort.Relations"];

pub fn read_error(path: &Path, err: osmpbf::Error) -> ClipError {
    let reason = err.to_string();
    match err.into_kind() {
        ErrorKind::Io(source) => ClipError::Read {
            path: path.to_path_buf(),
            source,
        },
        _ => ClipError::Decode {
            path: path.to_path_buf(),
            reason,
        },
    }
}

/// Decode one blob into entities of the requested kinds.
pub fn decode_blob(blob: Blob, kinds: KindFilter, path: &Path) -> Result<Vec<Entity>, ClipError> {
    let block = match blob.decode() {
        Ok(BlobDecode::OsmHeader(header)) => {
            log_sorted_header(&header);
            return Ok(Vec::new());
        }
        Ok(BlobDecode::OsmData(block)) => block,
        Ok(BlobDecode::Unknown(unknown)) => {
            tracing::info!("Unknown blob: {}", unknown);
            return Ok(Vec::new());
        }
        Err(err) => return Err(read_error(path, err)),
    };

    let mut entities = Vec::new();
    for element in block.elements() {
        match element {
            Element::Node(node) if kinds.nodes => entities.push(Entity::Node(Node {
                id: node.id(),
                location: Some(Location::new(node.lon(), node.lat())),
                tags: build_tag_map(node.tags()),
            })),
            Element::DenseNode(node) if kinds.nodes => entities.push(Entity::Node(Node {
                id: node.id(),
                location: Some(Location::new(node.lon(), node.lat())),
                tags: build_tag_map(node.tags()),
            })),
            Element::Way(way) if kinds.ways => entities.push(Entity::Way(Way::new(
                way.id(),
                way.refs().collect(),
                build_tag_map(way.tags()),
            ))),
            Element::Relation(relation) if kinds.relations => {
                let mut members = Vec::new();
                for member in relation.members() {
                    let role = member.role().map_err(|err| read_error(path, err))?;
                    members.push(Member {
                        kind: match member.member_type {
                            RelMemberType::Node => EntityKind::Node,
                            RelMemberType::Way => EntityKind::Way,
                            RelMemberType::Relation => EntityKind::Relation,
                        },
                        id: member.member_id,
                        role: role.to_string(),
                    });
                }
                entities.push(Entity::Relation(Relation {
                    id: relation.id(),
                    members,
                    tags: build_tag_map(relation.tags()),
                }));
            }
            _ => {}
        }
    }
    Ok(entities)
}

fn log_sorted_header(header: &HeaderBlock) {
    let found = sort_features(header);
    if found.is_empty() {
        tracing::debug!("PBF header declares no sort order");
    } else {
        tracing::debug!("Detected PBF sort header(s): {}", found.join(", "));
    }
}

fn sort_features(header: &HeaderBlock) -> Vec<&str> {
    header
        .required_features()
        .iter()
        .chain(header.optional_features())
        .map(|feature| feature.trim())
        .filter(|feature| {
            SORT_FEATURES
                .iter()
                .any(|known| known.eq_ignore_ascii_case(feature))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{EntityReader, read_all};
    use osmpbf::BlobReader;
    use std::path::PathBuf;

    /// Nodes 1-2 as plain nodes, 3-5 dense, ways 10-13, relation 20.
    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("fixture")
            .join("forest_roads.osm.pbf")
    }

    fn decode(kinds: KindFilter) -> Vec<Entity> {
        read_all(EntityReader::open(&fixture(), kinds).unwrap()).unwrap()
    }

    fn assert_near(actual: Option<Location>, lon: f64, lat: f64) {
        let actual = actual.expect("node without location");
        assert!((actual.lon - lon).abs() < 1e-7, "lon {} != {}", actual.lon, lon);
        assert!((actual.lat - lat).abs() < 1e-7, "lat {} != {}", actual.lat, lat);
    }

    #[test]
    fn decodes_plain_and_dense_nodes() {
        let nodes = decode(KindFilter::NODES);
        let ids: Vec<i64> = nodes.iter().map(Entity::id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let Entity::Node(tree) = &nodes[0] else {
            panic!("expected node");
        };
        assert_near(tree.location, 1.0, 1.0);
        assert_eq!(tree.tags.get("natural").map(String::as_str), Some("tree"));

        let Entity::Node(far) = &nodes[2] else {
            panic!("expected node");
        };
        assert_near(far.location, 20.0, 20.0);
        assert!(far.tags.is_empty());

        let Entity::Node(gate) = &nodes[4] else {
            panic!("expected node");
        };
        assert_near(gate.location, 5.0, 5.0);
        assert_eq!(gate.tags.get("barrier").map(String::as_str), Some("gate"));
    }

    #[test]
    fn decodes_ways_with_refs_and_tags() {
        let ways = decode(KindFilter::WAYS);
        let ids: Vec<i64> = ways.iter().map(Entity::id).collect();
        assert_eq!(ids, vec![10, 11, 12, 13]);

        let Entity::Way(building) = &ways[2] else {
            panic!("expected way");
        };
        assert_eq!(building.refs, vec![5, 1]);
        assert_eq!(building.tags.get("building").map(String::as_str), Some("yes"));
        assert!(building.locations.is_empty());
    }

    #[test]
    fn decodes_relation_members() {
        let relations = decode(KindFilter {
            nodes: false,
            ways: false,
            relations: true,
        });
        assert_eq!(relations.len(), 1);

        let Entity::Relation(route) = &relations[0] else {
            panic!("expected relation");
        };
        assert_eq!(route.id, 20);
        assert_eq!(route.tags.get("type").map(String::as_str), Some("route"));
        assert_eq!(
            route.members,
            vec![
                Member {
                    kind: EntityKind::Way,
                    id: 10,
                    role: "outer".to_string(),
                },
                Member {
                    kind: EntityKind::Node,
                    id: 5,
                    role: String::new(),
                },
            ]
        );
    }

    #[test]
    fn unfiltered_read_keeps_file_order() {
        let kinds: Vec<EntityKind> = decode(KindFilter::ALL).iter().map(Entity::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntityKind::Node,
                EntityKind::Node,
                EntityKind::Node,
                EntityKind::Node,
                EntityKind::Node,
                EntityKind::Way,
                EntityKind::Way,
                EntityKind::Way,
                EntityKind::Way,
                EntityKind::Relation,
            ]
        );
    }

    #[test]
    fn finds_sort_feature_in_header() {
        let blob = BlobReader::from_path(fixture()).unwrap().next().unwrap().unwrap();
        let BlobDecode::OsmHeader(header) = blob.decode().unwrap() else {
            panic!("expected header blob first");
        };
        assert_eq!(sort_features(&header), vec!["Sort.Type_then_ID"]);
    }

    #[test]
    fn truncated_file_fails_to_read() {
        let bytes = std::fs::read(fixture()).unwrap();
        let file = tempfile::Builder::new().suffix(".osm.pbf").tempfile().unwrap();
        std::fs::write(file.path(), &bytes[..bytes.len() - 10]).unwrap();

        let err = read_all(EntityReader::open(file.path(), KindFilter::ALL).unwrap()).unwrap_err();
        assert!(
            matches!(err, ClipError::Read { .. } | ClipError::Decode { .. }),
            "unexpected error: {err:?}"
        );
    }
}
