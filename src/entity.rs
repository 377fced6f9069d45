use geo_types::Point;
use std::collections::BTreeMap;
use std::fmt;

/// Tag set of an entity. Ordered so that serialized output is stable between runs.
pub type Tags = BTreeMap<String, String>;

// OSM coordinates carry 7 decimal places
const MAX_LON: f64 = 180.0;
const MAX_LAT: f64 = 90.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Location {
    pub lon: f64,
    pub lat: f64,
}

impl Location {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && self.lon.abs() <= MAX_LON
            && self.lat.abs() <= MAX_LAT
    }

    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Node,
    Way,
    Relation,
}

impl EntityKind {
    pub fn index(self) -> usize {
        match self {
            EntityKind::Node => 0,
            EntityKind::Way => 1,
            EntityKind::Relation => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Way => "way",
            EntityKind::Relation => "relation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which entity kinds a reader hands out. Everything else is dropped while decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindFilter {
    pub nodes: bool,
    pub ways: bool,
    pub relations: bool,
}

impl KindFilter {
    #[cfg(test)]
    pub const ALL: KindFilter = KindFilter {
        nodes: true,
        ways: true,
        relations: true,
    };
    pub const NODES: KindFilter = KindFilter {
        nodes: true,
        ways: false,
        relations: false,
    };
    pub const WAYS: KindFilter = KindFilter {
        nodes: false,
        ways: true,
        relations: false,
    };

    pub fn accepts(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Node => self.nodes,
            EntityKind::Way => self.ways,
            EntityKind::Relation => self.relations,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: i64,
    pub location: Option<Location>,
    pub tags: Tags,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Way {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Tags,
    /// Empty until resolved, then one entry per node reference. `None` marks a
    /// reference whose location is unknown.
    pub locations: Vec<Option<Location>>,
}

impl Way {
    pub fn new(id: i64, refs: Vec<i64>, tags: Tags) -> Self {
        Self {
            id,
            refs,
            tags,
            locations: Vec::new(),
        }
    }

    pub fn missing_locations(&self) -> usize {
        self.locations.iter().filter(|loc| loc.is_none()).count()
    }

    pub fn resolved_locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.locations.iter().filter_map(|loc| *loc)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub kind: EntityKind,
    pub id: i64,
    pub role: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    pub id: i64,
    pub members: Vec<Member>,
    pub tags: Tags,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

#[cfg(test)]
impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Node(_) => EntityKind::Node,
            Entity::Way(_) => EntityKind::Way,
            Entity::Relation(_) => EntityKind::Relation,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Entity::Node(node) => node.id,
            Entity::Way(way) => way.id,
            Entity::Relation(relation) => relation.id,
        }
    }
}
