//! Edge dominance and post-dominance, used by result post-processing.
//!
//! Edge relations are computed as node dominance on the per-CFG line graph:
//! one node per CFG edge, an arc `e1 → e2` whenever `sink(e1) = source(e2)`,
//! plus virtual entry/exit nodes. Post-dominance is dominance on the
//! reversed line graph rooted at the virtual exit.

use crate::program::{CfgId, EdgeId, Program};
use petgraph::algo::dominators::{Dominators, simple_fast};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;
use std::collections::HashMap;

struct EdgeDominance {
    nodes: HashMap<EdgeId, NodeIndex>,
    dom: Dominators<NodeIndex>,
    postdom: Dominators<NodeIndex>,
}

pub struct GlobalDominance {
    per_cfg: HashMap<CfgId, EdgeDominance>,
}

impl GlobalDominance {
    pub fn new(program: &Program) -> Self {
        let mut per_cfg = HashMap::new();
        for cfg in &program.cfgs {
            let mut graph: DiGraph<Option<EdgeId>, ()> = DiGraph::new();
            let entry = graph.add_node(None);
            let exit = graph.add_node(None);
            let mut nodes = HashMap::new();
            for e in cfg.edge_ids() {
                nodes.insert(e, graph.add_node(Some(e)));
            }
            for e in cfg.edge_ids() {
                let ne = nodes[&e];
                if cfg.source(e) == cfg.entry_block() {
                    graph.add_edge(entry, ne, ());
                }
                if cfg.sink(e) == cfg.exit_block() {
                    graph.add_edge(ne, exit, ());
                }
                for next in cfg.outs(cfg.sink(e)) {
                    graph.add_edge(ne, nodes[&next], ());
                }
            }
            let dom = simple_fast(&graph, entry);
            let postdom = simple_fast(Reversed(&graph), exit);
            per_cfg.insert(
                cfg.id,
                EdgeDominance {
                    nodes,
                    dom,
                    postdom,
                },
            );
        }
        Self { per_cfg }
    }

    /// `e1` dominates `e2`: every path from the entry to `e2` crosses `e1`.
    /// Edges of different CFGs never dominate each other.
    pub fn dom(&self, e1: EdgeId, e2: EdgeId) -> bool {
        self.related(e1, e2, false)
    }

    /// `e2` post-dominates `e1`: every path from `e1` to the exit crosses
    /// `e2`.
    pub fn postdom(&self, e2: EdgeId, e1: EdgeId) -> bool {
        self.related(e2, e1, true)
    }

    fn related(&self, a: EdgeId, b: EdgeId, post: bool) -> bool {
        if a.cfg != b.cfg {
            return false;
        }
        let Some(ed) = self.per_cfg.get(&a.cfg) else {
            return false;
        };
        let (Some(na), Some(nb)) = (ed.nodes.get(&a), ed.nodes.get(&b)) else {
            return false;
        };
        if na == nb {
            return true;
        }
        let tree = if post { &ed.postdom } else { &ed.dom };
        tree.strict_dominators(*nb)
            .map(|mut it| it.any(|d| d == *na))
            .unwrap_or(false)
    }
}
