// graph.rs - Archetype transition cache
//
// Memoizes "table A plus id X -> table B" and "table A minus id X -> table C"
// edges so the hot add/remove path skips rebuilding and re-hashing sorted id
// lists. The source side uses Option<TableId>: None is the empty id-set an
// entity occupies before its first add. The cache is advisory; a miss falls
// back to the id-set hash lookup in the table store.

use crate::entity::Id;
use crate::table::TableId;
use std::collections::HashMap;

#[derive(Default)]
pub struct TableGraph {
    add_edges: HashMap<(Option<TableId>, Id), TableId>,
    remove_edges: HashMap<(TableId, Id), Option<TableId>>,
}

impl TableGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_edge(&self, from: Option<TableId>, id: Id) -> Option<TableId> {
        self.add_edges.get(&(from, id)).copied()
    }

    pub fn cache_add_edge(&mut self, from: Option<TableId>, id: Id, to: TableId) {
        self.add_edges.insert((from, id), to);
    }

    #[inline]
    pub fn remove_edge(&self, from: TableId, id: Id) -> Option<Option<TableId>> {
        self.remove_edges.get(&(from, id)).copied()
    }

    pub fn cache_remove_edge(&mut self, from: TableId, id: Id, to: Option<TableId>) {
        self.remove_edges.insert((from, id), to);
    }

    /// Drop every edge that references a retired table.
    pub fn purge_table(&mut self, table: TableId) {
        self.add_edges
            .retain(|&(from, _), &mut to| from != Some(table) && to != table);
        self.remove_edges
            .retain(|&(from, _), &mut to| from != table && to != Some(table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn id(index: u32) -> Id {
        Id::of(Entity::from_parts(index, 0))
    }

    #[test]
    fn edges_memoize_transitions() {
        let mut graph = TableGraph::new();
        assert_eq!(graph.add_edge(None, id(1)), None);
        graph.cache_add_edge(None, id(1), 4);
        graph.cache_add_edge(Some(4), id(2), 5);
        graph.cache_remove_edge(5, id(2), Some(4));
        graph.cache_remove_edge(4, id(1), None);

        assert_eq!(graph.add_edge(None, id(1)), Some(4));
        assert_eq!(graph.add_edge(Some(4), id(2)), Some(5));
        assert_eq!(graph.remove_edge(5, id(2)), Some(Some(4)));
        assert_eq!(graph.remove_edge(4, id(1)), Some(None));
    }

    #[test]
    fn purge_drops_edges_on_both_sides() {
        let mut graph = TableGraph::new();
        graph.cache_add_edge(None, id(1), 4);
        graph.cache_add_edge(Some(4), id(2), 5);
        graph.cache_remove_edge(5, id(2), Some(4));
        graph.cache_remove_edge(5, id(9), None);

        graph.purge_table(4);
        assert_eq!(graph.add_edge(None, id(1)), None);
        assert_eq!(graph.add_edge(Some(4), id(2)), None);
        assert_eq!(graph.remove_edge(5, id(2)), None);
        // Edges not touching table 4 survive.
        assert_eq!(graph.remove_edge(5, id(9)), Some(None));
    }
}
