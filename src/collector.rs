use roaring::RoaringTreemap;

use crate::entity::{EntityKind, Way};

/// Id sets per entity kind. Compressed bitmaps keep memory proportional to the
/// number of ids stored, not to the largest id.
#[derive(Clone, Debug, Default)]
pub struct IdCollector {
    ids: [RoaringTreemap; 3],
}

impl IdCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every node the way references.
    ///
    /// Non-positive references are skipped; the way scan rejects them before a
    /// way is recorded.
    pub fn record(&mut self, way: &Way) {
        let nodes = &mut self.ids[EntityKind::Node.index()];
        for id in way.refs.iter().filter_map(|&r| u64::try_from(r).ok()) {
            if id > 0 {
                nodes.insert(id);
            }
        }
    }

    pub fn insert(&mut self, kind: EntityKind, id: u64) -> bool {
        self.ids[kind.index()].insert(id)
    }

    pub fn contains(&self, kind: EntityKind, id: u64) -> bool {
        self.ids[kind.index()].contains(id)
    }

    /// Ids of one kind in ascending order.
    pub fn all(&self, kind: EntityKind) -> impl Iterator<Item = u64> + '_ {
        self.ids[kind.index()].iter()
    }

    pub fn len(&self, kind: EntityKind) -> u64 {
        self.ids[kind.index()].len()
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.ids[kind.index()].is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tags;

    #[test]
    fn record_inserts_node_refs_only_into_node_set() {
        let mut collector = IdCollector::new();
        collector.record(&Way::new(10, vec![1, 2, 2, 5], Tags::new()));

        for id in [1, 2, 5] {
            assert!(collector.contains(EntityKind::Node, id));
            assert!(!collector.contains(EntityKind::Way, id));
            assert!(!collector.contains(EntityKind::Relation, id));
        }
        assert_eq!(collector.len(EntityKind::Node), 3);
        assert!(collector.is_empty(EntityKind::Way));
    }

    #[test]
    fn all_iterates_in_ascending_order() {
        let mut collector = IdCollector::new();
        collector.record(&Way::new(1, vec![9, 3, 7], Tags::new()));
        collector.record(&Way::new(2, vec![3, 1], Tags::new()));

        let ids: Vec<u64> = collector.all(EntityKind::Node).collect();
        assert_eq!(ids, vec![1, 3, 7, 9]);
    }

    #[test]
    fn accepts_ids_across_full_osm_range() {
        let mut collector = IdCollector::new();
        let large = 13_000_000_000u64;
        assert!(collector.insert(EntityKind::Node, large));
        assert!(!collector.insert(EntityKind::Node, large));
        assert!(collector.insert(EntityKind::Node, 1));
        assert!(collector.contains(EntityKind::Node, large));
        assert_eq!(collector.len(EntityKind::Node), 2);
    }

    #[test]
    fn kinds_are_independent() {
        let mut collector = IdCollector::new();
        collector.insert(EntityKind::Way, 4);
        assert!(collector.contains(EntityKind::Way, 4));
        assert!(!collector.contains(EntityKind::Node, 4));
    }
}
