//! Detailed paths: ordered CFG traversals with structural markers.
//!
//! An infeasible-path result is a detailed path: the ordered edges that
//! cannot all be taken, kept inside their loop/call structure so the report
//! writer can nest them correctly.

use crate::error::CuldesacError;
use crate::program::{BlockId, CfgId, EdgeId, Program};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowItem {
    Edge(EdgeId),
    LoopEntry(BlockId),
    LoopExit(BlockId),
    Call(BlockId),
    Return(BlockId),
}

impl FlowItem {
    pub fn edge(&self) -> Option<EdgeId> {
        match self {
            FlowItem::Edge(e) => Some(*e),
            _ => None,
        }
    }

    fn is_call_marker(&self) -> bool {
        matches!(self, FlowItem::Call(_) | FlowItem::Return(_))
    }
}

/// Ordered sequence of flow items. Two paths are equal when their item
/// sequences are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailedPath {
    items: Vec<FlowItem>,
}

impl DetailedPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_last(&mut self, item: FlowItem) {
        self.items.push(item);
    }

    pub fn append_edge(&mut self, e: EdgeId) {
        self.items.push(FlowItem::Edge(e));
    }

    pub fn on_loop_entry(&mut self, h: BlockId) {
        self.items.push(FlowItem::LoopEntry(h));
    }

    pub fn on_loop_exit(&mut self, h: BlockId) {
        self.items.push(FlowItem::LoopExit(h));
    }

    pub fn on_call(&mut self, call_block: BlockId) {
        self.items.push(FlowItem::Call(call_block));
    }

    pub fn on_return(&mut self, call_block: BlockId) {
        self.items.push(FlowItem::Return(call_block));
    }

    pub fn items(&self) -> &[FlowItem] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowItem> {
        self.items.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.items.iter().filter_map(FlowItem::edge)
    }

    pub fn to_ordered_path(&self) -> Vec<EdgeId> {
        self.edges().collect()
    }

    pub fn contains_edge(&self, e: EdgeId) -> bool {
        self.edges().any(|x| x == e)
    }

    /// Removes the first occurrence of `e`.
    pub fn remove(&mut self, e: EdgeId) {
        if let Some(pos) = self
            .items
            .iter()
            .position(|i| i.edge() == Some(e))
        {
            self.items.remove(pos);
        }
    }

    pub fn first_edge(&self) -> Option<EdgeId> {
        self.edges().next()
    }

    pub fn last_edge(&self) -> Option<EdgeId> {
        self.edges().last()
    }

    pub fn count_edges(&self) -> usize {
        self.edges().count()
    }

    pub fn has_an_edge(&self) -> bool {
        self.first_edge().is_some()
    }

    /// The CFG containing the first edge.
    pub fn function(&self) -> Option<CfgId> {
        self.first_edge().map(|e| e.cfg)
    }

    /// Folds `Call f .. Return f` runs with no intermediate edge into
    /// nothing, and merges adjacent loop markers.
    pub fn optimize(&mut self) {
        loop {
            let mut changed = false;

            'call: for i in 0..self.items.len() {
                let FlowItem::Call(b) = self.items[i] else {
                    continue;
                };
                for j in i + 1..self.items.len() {
                    match self.items[j] {
                        FlowItem::Edge(_) => break,
                        FlowItem::Return(r) if r == b => {
                            self.items.drain(i..=j);
                            changed = true;
                            break 'call;
                        }
                        _ => {}
                    }
                }
            }

            for i in 0..self.items.len().saturating_sub(1) {
                let (a, b) = (self.items[i], self.items[i + 1]);
                let collapse = match (a, b) {
                    (FlowItem::LoopEntry(x), FlowItem::LoopEntry(y)) => x == y,
                    (FlowItem::LoopExit(x), FlowItem::LoopExit(y)) => x == y,
                    (FlowItem::LoopEntry(x), FlowItem::LoopExit(y)) => x == y,
                    _ => false,
                };
                if collapse {
                    if matches!((a, b), (FlowItem::LoopEntry(_), FlowItem::LoopExit(_))) {
                        self.items.drain(i..=i + 1);
                    } else {
                        self.items.remove(i + 1);
                    }
                    changed = true;
                    break;
                }
            }

            if !changed {
                return;
            }
        }
    }

    /// Drops call/return markers trailing after the last edge.
    pub fn remove_calls_at_end(&mut self) {
        while self
            .items
            .last()
            .is_some_and(FlowItem::is_call_marker)
        {
            self.items.pop();
        }
    }

    /// Canonical text form; [`DetailedPath::parse`] is its inverse.
    pub fn to_text(&self, program: &Program) -> String {
        let home = self.function();
        let mut out = String::new();
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match item {
                FlowItem::Edge(e) => {
                    let d = program.edge(*e);
                    if Some(e.cfg) != home {
                        out.push_str(&format!("f{}:", e.cfg.0));
                    }
                    out.push_str(&format!("{}->{}", d.src, d.dst));
                }
                FlowItem::LoopEntry(h) => out.push_str(&format!("+L{}", h.index)),
                FlowItem::LoopExit(h) => out.push_str(&format!("-L{}", h.index)),
                FlowItem::Call(b) => out.push_str(&format!("call@{}", b.index)),
                FlowItem::Return(b) => out.push_str(&format!("ret@{}", b.index)),
            }
        }
        out
    }

    /// Parses the output of [`DetailedPath::to_text`]. The home CFG of the
    /// path must be given since unprefixed edges are resolved against it.
    pub fn parse(text: &str, home: CfgId, program: &Program) -> Result<Self, CuldesacError> {
        let mut path = DetailedPath::new();
        let bad = |what: &str| CuldesacError::MalformedInput(format!("bad path item: {what}"));
        for raw in text.split(',') {
            let item = raw.trim();
            if item.is_empty() {
                continue;
            }
            if let Some(rest) = item.strip_prefix("+L") {
                let index = rest.parse().map_err(|_| bad(item))?;
                path.on_loop_entry(BlockId { cfg: home, index });
            } else if let Some(rest) = item.strip_prefix("-L") {
                let index = rest.parse().map_err(|_| bad(item))?;
                path.on_loop_exit(BlockId { cfg: home, index });
            } else if let Some(rest) = item.strip_prefix("call@") {
                let index = rest.parse().map_err(|_| bad(item))?;
                path.on_call(BlockId { cfg: home, index });
            } else if let Some(rest) = item.strip_prefix("ret@") {
                let index = rest.parse().map_err(|_| bad(item))?;
                path.on_return(BlockId { cfg: home, index });
            } else {
                let (cfg, spec) = match item.split_once(':') {
                    Some((f, rest)) => {
                        let id = f
                            .strip_prefix('f')
                            .and_then(|n| n.parse().ok())
                            .ok_or_else(|| bad(item))?;
                        (CfgId(id), rest)
                    }
                    None => (home, item),
                };
                let (src, dst) = spec.split_once("->").ok_or_else(|| bad(item))?;
                let src = src.trim().parse().map_err(|_| bad(item))?;
                let dst = dst.trim().parse().map_err(|_| bad(item))?;
                let e = program
                    .find_edge(cfg, src, dst)
                    .ok_or_else(|| bad(item))?;
                path.append_edge(e);
            }
        }
        Ok(path)
    }
}

impl fmt::Display for DetailedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match item {
                FlowItem::Edge(e) => write!(f, "e{}.{}", e.cfg.0, e.index)?,
                FlowItem::LoopEntry(h) => write!(f, "+L{}", h.index)?,
                FlowItem::LoopExit(h) => write!(f, "-L{}", h.index)?,
                FlowItem::Call(b) => write!(f, "call@{}", b.index)?,
                FlowItem::Return(b) => write!(f, "ret@{}", b.index)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CfgBuilder, MachineInst, ProgramBuilder};

    fn sample() -> Program {
        let mut f = CfgBuilder::new("main");
        let entry = f.entry();
        let b1 = f.basic::<MachineInst>(vec![]);
        let b2 = f.basic::<MachineInst>(vec![]);
        let exit = f.exit();
        f.edge(entry, b1);
        f.edge(b1, b2);
        f.edge(b2, exit);
        let mut p = ProgramBuilder::new(0, 4, 4);
        p.add(f);
        p.finish().unwrap()
    }

    fn eid(p: &Program, index: u32) -> EdgeId {
        EdgeId {
            cfg: p.main().id,
            index,
        }
    }

    #[test]
    fn text_round_trip() {
        let p = sample();
        let home = p.main().id;
        let mut path = DetailedPath::new();
        path.append_edge(eid(&p, 0));
        path.on_loop_entry(BlockId { cfg: home, index: 1 });
        path.append_edge(eid(&p, 1));
        path.on_loop_exit(BlockId { cfg: home, index: 1 });
        path.on_call(BlockId { cfg: home, index: 2 });
        path.on_return(BlockId { cfg: home, index: 2 });
        let text = path.to_text(&p);
        let parsed = DetailedPath::parse(&text, home, &p).unwrap();
        assert_eq!(parsed, path);
        assert_eq!(parsed.to_text(&p), text);
    }

    #[test]
    fn optimize_folds_empty_call_runs() {
        let p = sample();
        let home = p.main().id;
        let mut path = DetailedPath::new();
        path.append_edge(eid(&p, 0));
        path.on_call(BlockId { cfg: home, index: 2 });
        path.on_return(BlockId { cfg: home, index: 2 });
        path.append_edge(eid(&p, 2));
        path.optimize();
        assert_eq!(path.count_edges(), 2);
        assert!(path.items().iter().all(|i| i.edge().is_some()));
    }

    #[test]
    fn optimize_keeps_calls_with_inner_edges() {
        let p = sample();
        let home = p.main().id;
        let mut path = DetailedPath::new();
        path.on_call(BlockId { cfg: home, index: 2 });
        path.append_edge(eid(&p, 1));
        path.on_return(BlockId { cfg: home, index: 2 });
        path.optimize();
        assert_eq!(path.items().len(), 3);
    }

    #[test]
    fn trailing_call_markers_are_dropped() {
        let p = sample();
        let home = p.main().id;
        let mut path = DetailedPath::new();
        path.append_edge(eid(&p, 0));
        path.on_call(BlockId { cfg: home, index: 2 });
        path.remove_calls_at_end();
        assert_eq!(path.items().len(), 1);
        assert_eq!(path.last_edge(), Some(eid(&p, 0)));
    }

    #[test]
    fn remove_deletes_first_occurrence_only() {
        let p = sample();
        let mut path = DetailedPath::new();
        path.append_edge(eid(&p, 0));
        path.append_edge(eid(&p, 1));
        path.append_edge(eid(&p, 0));
        path.remove(eid(&p, 0));
        assert_eq!(path.to_ordered_path(), vec![eid(&p, 1), eid(&p, 0)]);
    }
}
