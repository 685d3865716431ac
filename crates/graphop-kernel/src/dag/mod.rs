use crate::error::{GraphError, Inconsistency};
use graphop_schema::ModelRef;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::HashMap;

/// Must-go-first relation among objects
///
/// An edge `a -> b` means `a` has to be handled before `b`; for deletions,
/// `a` holds a non-nullable link to `b`.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    inner: DiGraphMap<ModelRef, ()>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: ModelRef) {
        self.inner.add_node(node);
    }

    /// Self-references impose no order and are skipped.
    pub fn add_edge(&mut self, from: ModelRef, to: ModelRef) {
        if from != to {
            self.inner.add_edge(from, to, ());
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn topological_sort(&self) -> Result<Vec<ModelRef>, GraphError> {
        toposort(&self.inner, None).map_err(|cycle| {
            GraphError::from(Inconsistency::DeletionCycle {
                at: cycle.node_id(),
            })
        })
    }

    /// Nodes grouped by depth: every node sits in a later layer than all of
    /// its predecessors. Within a layer nodes keep the order of `rank`, or
    /// insertion order for unranked nodes.
    pub fn layers(&self, rank: &HashMap<ModelRef, usize>) -> Result<Vec<Vec<ModelRef>>, GraphError> {
        let order = self.topological_sort()?;
        let mut depth: HashMap<ModelRef, usize> = HashMap::with_capacity(order.len());
        let mut layers: Vec<Vec<ModelRef>> = Vec::new();
        for node in order {
            let d = self
                .inner
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|pred| depth.get(&pred).map(|p| p + 1))
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
            if layers.len() <= d {
                layers.resize_with(d + 1, Vec::new);
            }
            layers[d].push(node);
        }
        for layer in &mut layers {
            layer.sort_by_key(|n| rank.get(n).copied().unwrap_or(usize::MAX));
        }
        Ok(layers)
    }

    /// Nodes nothing has to precede
    pub fn entry_nodes(&self) -> Vec<ModelRef> {
        self.inner
            .nodes()
            .filter(|n| self.inner.neighbors_directed(*n, Direction::Incoming).next().is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphop_schema::{ClassSpec, SchemaBuilder};

    fn refs(n: u64) -> Vec<ModelRef> {
        let schema = SchemaBuilder::new().class(ClassSpec::new("Thing")).build().unwrap();
        let class = schema.resolve("Thing").unwrap();
        (0..n).map(|id| ModelRef::new(class, id)).collect()
    }

    #[test]
    fn layers_respect_edges() {
        let r = refs(4);
        let mut g = DependencyGraph::new();
        for n in &r {
            g.add_node(*n);
        }
        g.add_edge(r[0], r[1]);
        g.add_edge(r[1], r[2]);
        g.add_edge(r[0], r[2]);

        let rank: HashMap<_, _> = r.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let layers = g.layers(&rank).unwrap();
        assert_eq!(layers, vec![vec![r[0], r[3]], vec![r[1]], vec![r[2]]]);
        assert_eq!(g.entry_nodes().len(), 2);
    }

    #[test]
    fn cycles_are_inconsistent() {
        let r = refs(2);
        let mut g = DependencyGraph::new();
        g.add_edge(r[0], r[1]);
        g.add_edge(r[1], r[0]);
        let err = g.topological_sort().unwrap_err();
        assert!(matches!(err, GraphError::Inconsistency(Inconsistency::DeletionCycle { .. })));
    }

    #[test]
    fn self_loops_are_ignored() {
        let r = refs(1);
        let mut g = DependencyGraph::new();
        g.add_edge(r[0], r[0]);
        assert_eq!(g.edge_count(), 0);
        assert!(g.topological_sort().is_ok());
    }
}
