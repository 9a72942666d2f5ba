//! The analyzed program: a set of CFGs with loop labels, semantic
//! microinstructions per basic block, the platform context, and the initial
//! data-flow state.
//!
//! All of this is produced upstream (CFG construction, loop-header detection
//! and back-edge labeling are external services); the analysis only consumes
//! it. The model is serde-(de)serializable so the CLI can load a program from
//! JSON, and [`CfgBuilder`]/[`ProgramBuilder`] provide construction for tests.

use crate::error::CuldesacError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod sem;

pub use sem::{CompareCond, MachineInst, Sem, VarId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CfgId(pub u32);

/// Stable block identifier: owning CFG plus index in that CFG.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockId {
    pub cfg: CfgId,
    pub index: u32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EdgeId {
    pub cfg: CfgId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Entry,
    Exit,
    Basic(Vec<MachineInst>),
    /// Synthetic call block: control enters the callee and resumes on the
    /// block's outgoing edge after the callee's exit.
    Call(CfgId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub kind: BlockKind,
    #[serde(default)]
    pub loop_header: bool,
    /// Enclosing loop headers, innermost first; a header lists itself first.
    #[serde(default)]
    pub loops: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    pub src: u32,
    pub dst: u32,
    /// True on the branch-taken edge of a conditional block.
    #[serde(default)]
    pub taken: bool,
    #[serde(default)]
    pub back: bool,
    /// For a loop-exit edge: the header of the outermost loop being exited.
    #[serde(default)]
    pub loop_exit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cfg {
    pub name: String,
    pub id: CfgId,
    pub blocks: Vec<BlockData>,
    pub edges: Vec<EdgeData>,
    pub entry: u32,
    pub exit: u32,
    #[serde(skip)]
    ins: Vec<Vec<u32>>,
    #[serde(skip)]
    outs: Vec<Vec<u32>>,
}

impl Cfg {
    pub fn entry_block(&self) -> BlockId {
        BlockId {
            cfg: self.id,
            index: self.entry,
        }
    }

    pub fn exit_block(&self) -> BlockId {
        BlockId {
            cfg: self.id,
            index: self.exit,
        }
    }

    pub fn block(&self, b: BlockId) -> &BlockData {
        &self.blocks[b.index as usize]
    }

    pub fn edge(&self, e: EdgeId) -> &EdgeData {
        &self.edges[e.index as usize]
    }

    pub fn source(&self, e: EdgeId) -> BlockId {
        BlockId {
            cfg: self.id,
            index: self.edge(e).src,
        }
    }

    pub fn sink(&self, e: EdgeId) -> BlockId {
        BlockId {
            cfg: self.id,
            index: self.edge(e).dst,
        }
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(|index| BlockId {
            cfg: self.id,
            index,
        })
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        (0..self.edges.len() as u32).map(|index| EdgeId {
            cfg: self.id,
            index,
        })
    }

    pub fn ins(&self, b: BlockId) -> impl Iterator<Item = EdgeId> + '_ {
        self.ins[b.index as usize].iter().map(|index| EdgeId {
            cfg: self.id,
            index: *index,
        })
    }

    pub fn outs(&self, b: BlockId) -> impl Iterator<Item = EdgeId> + '_ {
        self.outs[b.index as usize].iter().map(|index| EdgeId {
            cfg: self.id,
            index: *index,
        })
    }

    /// A block is conditional when it has more than one outgoing edge.
    pub fn is_conditional(&self, b: BlockId) -> bool {
        self.outs[b.index as usize].len() > 1
    }

    pub fn back_ins(&self, b: BlockId) -> Vec<EdgeId> {
        self.ins(b).filter(|e| self.edge(*e).back).collect()
    }

    pub fn non_back_ins(&self, b: BlockId) -> Vec<EdgeId> {
        self.ins(b).filter(|e| !self.edge(*e).back).collect()
    }

    pub fn all_ins(&self, b: BlockId) -> Vec<EdgeId> {
        self.ins(b).collect()
    }

    /// Enclosing loop headers of `b`, innermost first.
    pub fn loop_headers(&self, b: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.block(b).loops.iter().map(|index| BlockId {
            cfg: self.id,
            index: *index,
        })
    }

    /// The headers of the loops an exit edge leaves: from the innermost loop
    /// of its source up to (and including) the labeled outermost one.
    pub fn exited_headers(&self, e: EdgeId) -> Vec<BlockId> {
        let Some(outer) = self.edge(e).loop_exit else {
            return Vec::new();
        };
        let src = self.source(e);
        let mut out = Vec::new();
        for h in self.loop_headers(src) {
            out.push(h);
            if h.index == outer {
                break;
            }
        }
        out
    }

    fn seal(&mut self) {
        self.ins = vec![Vec::new(); self.blocks.len()];
        self.outs = vec![Vec::new(); self.blocks.len()];
        for (index, e) in self.edges.iter().enumerate() {
            self.outs[e.src as usize].push(index as u32);
            self.ins[e.dst as usize].push(index as u32);
        }
    }

    fn validate(&self) -> Result<(), CuldesacError> {
        let nb = self.blocks.len() as u32;
        let bad_block = |index: u32| CuldesacError::UnknownBlock(BlockId {
            cfg: self.id,
            index,
        });
        if self.entry >= nb {
            return Err(CuldesacError::MissingEntry(self.id));
        }
        if self.exit >= nb {
            return Err(CuldesacError::MissingExit(self.id));
        }
        for e in &self.edges {
            if e.src >= nb {
                return Err(bad_block(e.src));
            }
            if e.dst >= nb {
                return Err(bad_block(e.dst));
            }
            if let Some(h) = e.loop_exit {
                if h >= nb || !self.blocks[h as usize].loop_header {
                    return Err(CuldesacError::BadLoopExit(BlockId {
                        cfg: self.id,
                        index: e.src,
                    }));
                }
            }
        }
        for b in &self.blocks {
            for h in &b.loops {
                if *h >= nb {
                    return Err(bad_block(*h));
                }
            }
        }
        Ok(())
    }
}

/// Platform facts the analysis needs from upstream: which register is the
/// stack pointer, and how many registers/temporaries the decoder can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformContext {
    pub sp: VarId,
    pub register_count: u32,
    pub max_temps: u32,
}

/// Initial data-flow state: memory cells whose content is known from the
/// binary image and constant for the whole execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialState {
    pub readonly: BTreeMap<i32, i32>,
}

impl InitialState {
    pub fn lookup(&self, addr: i32) -> Option<i32> {
        self.readonly.get(&addr).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub cfgs: Vec<Cfg>,
    pub context: PlatformContext,
    #[serde(default)]
    pub initial: InitialState,
}

impl Program {
    /// Rebuilds adjacency and checks the preconditions the analysis relies
    /// on. Must be called after deserialization; the builders do it for you.
    pub fn seal(&mut self) -> Result<(), CuldesacError> {
        if self.cfgs.is_empty() {
            return Err(CuldesacError::NoCfg);
        }
        if self.context.sp < 0 || self.context.sp as u32 >= self.context.register_count {
            return Err(CuldesacError::SpNotIdentified);
        }
        for (i, cfg) in self.cfgs.iter_mut().enumerate() {
            if cfg.id != CfgId(i as u32) {
                return Err(CuldesacError::MalformedInput(format!(
                    "CFG \"{}\" has id {:?}, expected {:?}",
                    cfg.name,
                    cfg.id,
                    CfgId(i as u32)
                )));
            }
            cfg.seal();
            cfg.validate()?;
        }
        let count = self.cfgs.len() as u32;
        for cfg in &self.cfgs {
            for b in &cfg.blocks {
                if let BlockKind::Call(callee) = b.kind {
                    if callee.0 >= count {
                        return Err(CuldesacError::UnknownCfg(callee));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, CuldesacError> {
        let mut program: Program = serde_json::from_str(json)
            .map_err(|e| CuldesacError::MalformedInput(e.to_string()))?;
        program.seal()?;
        Ok(program)
    }

    /// The analyzed entry point is the first CFG by convention.
    pub fn main(&self) -> &Cfg {
        &self.cfgs[0]
    }

    pub fn cfg(&self, id: CfgId) -> &Cfg {
        &self.cfgs[id.0 as usize]
    }

    pub fn block(&self, b: BlockId) -> &BlockData {
        self.cfg(b.cfg).block(b)
    }

    pub fn edge(&self, e: EdgeId) -> &EdgeData {
        self.cfg(e.cfg).edge(e)
    }

    pub fn source(&self, e: EdgeId) -> BlockId {
        self.cfg(e.cfg).source(e)
    }

    pub fn sink(&self, e: EdgeId) -> BlockId {
        self.cfg(e.cfg).sink(e)
    }

    /// `src->dst` lookup used by path parsing.
    pub fn find_edge(&self, cfg: CfgId, src: u32, dst: u32) -> Option<EdgeId> {
        let cfg_data = self.cfg(cfg);
        cfg_data
            .edge_ids()
            .find(|e| cfg_data.edge(*e).src == src && cfg_data.edge(*e).dst == dst)
    }
}

impl fmt::Display for Cfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} blocks, {} edges)",
            self.name,
            self.blocks.len(),
            self.edges.len()
        )
    }
}

/// Test-oriented CFG construction.
#[derive(Debug, Default)]
pub struct CfgBuilder {
    name: String,
    blocks: Vec<BlockData>,
    edges: Vec<EdgeData>,
    entry: Option<u32>,
    exit: Option<u32>,
}

impl CfgBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn push_block(&mut self, kind: BlockKind) -> u32 {
        let index = self.blocks.len() as u32;
        self.blocks.push(BlockData {
            kind,
            loop_header: false,
            loops: Vec::new(),
        });
        index
    }

    pub fn entry(&mut self) -> u32 {
        let b = self.push_block(BlockKind::Entry);
        self.entry = Some(b);
        b
    }

    pub fn exit(&mut self) -> u32 {
        let b = self.push_block(BlockKind::Exit);
        self.exit = Some(b);
        b
    }

    pub fn basic<I: Into<MachineInst>>(&mut self, insts: Vec<I>) -> u32 {
        self.push_block(BlockKind::Basic(
            insts.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn call(&mut self, callee: CfgId) -> u32 {
        self.push_block(BlockKind::Call(callee))
    }

    pub fn edge(&mut self, src: u32, dst: u32) -> u32 {
        let index = self.edges.len() as u32;
        self.edges.push(EdgeData {
            src,
            dst,
            taken: false,
            back: false,
            loop_exit: None,
        });
        index
    }

    pub fn taken_edge(&mut self, src: u32, dst: u32) -> u32 {
        let e = self.edge(src, dst);
        self.edges[e as usize].taken = true;
        e
    }

    pub fn back_edge(&mut self, src: u32, dst: u32) -> u32 {
        let e = self.edge(src, dst);
        self.edges[e as usize].back = true;
        e
    }

    pub fn taken_back_edge(&mut self, src: u32, dst: u32) -> u32 {
        let e = self.back_edge(src, dst);
        self.edges[e as usize].taken = true;
        e
    }

    pub fn loop_exit_edge(&mut self, src: u32, dst: u32, header: u32) -> u32 {
        let e = self.edge(src, dst);
        self.edges[e as usize].loop_exit = Some(header);
        e
    }

    /// Labels `header` as a loop header and records the loop context on the
    /// header and every body block. Mark enclosing loops before nested ones
    /// so `loops` stays innermost-first.
    pub fn mark_loop(&mut self, header: u32, body: &[u32]) {
        self.blocks[header as usize].loop_header = true;
        self.blocks[header as usize].loops.insert(0, header);
        for b in body {
            self.blocks[*b as usize].loops.insert(0, header);
        }
    }

    pub fn build(self, id: CfgId) -> Cfg {
        Cfg {
            name: self.name,
            id,
            entry: self.entry.expect("CFG built without an entry block"),
            exit: self.exit.expect("CFG built without an exit block"),
            blocks: self.blocks,
            edges: self.edges,
            ins: Vec::new(),
            outs: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ProgramBuilder {
    cfgs: Vec<Cfg>,
    context: PlatformContext,
    initial: InitialState,
}

impl ProgramBuilder {
    pub fn new(sp: VarId, register_count: u32, max_temps: u32) -> Self {
        Self {
            cfgs: Vec::new(),
            context: PlatformContext {
                sp,
                register_count,
                max_temps,
            },
            initial: InitialState::default(),
        }
    }

    /// Reserves the id the next added CFG will get, for forward call edges.
    pub fn next_id(&self) -> CfgId {
        CfgId(self.cfgs.len() as u32)
    }

    pub fn add(&mut self, builder: CfgBuilder) -> CfgId {
        let id = self.next_id();
        self.cfgs.push(builder.build(id));
        id
    }

    pub fn readonly_cell(&mut self, addr: i32, value: i32) -> &mut Self {
        self.initial.readonly.insert(addr, value);
        self
    }

    pub fn finish(self) -> Result<Program, CuldesacError> {
        let mut program = Program {
            cfgs: self.cfgs,
            context: self.context,
            initial: self.initial,
        };
        program.seal()?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Program {
        let mut f = CfgBuilder::new("main");
        let entry = f.entry();
        let b1 = f.basic::<MachineInst>(vec![]);
        let b2 = f.basic::<MachineInst>(vec![]);
        let b3 = f.basic::<MachineInst>(vec![]);
        let exit = f.exit();
        f.edge(entry, b1);
        f.taken_edge(b1, b2);
        f.edge(b1, b3);
        f.edge(b2, exit);
        f.edge(b3, exit);
        let mut p = ProgramBuilder::new(13, 16, 8);
        p.add(f);
        p.finish().unwrap()
    }

    #[test]
    fn adjacency_is_sealed() {
        let p = diamond();
        let cfg = p.main();
        let b1 = BlockId {
            cfg: cfg.id,
            index: 1,
        };
        assert!(cfg.is_conditional(b1));
        assert_eq!(cfg.ins(b1).count(), 1);
        assert_eq!(cfg.outs(b1).count(), 2);
        assert_eq!(cfg.ins(cfg.exit_block()).count(), 2);
    }

    #[test]
    fn json_round_trip() {
        let p = diamond();
        let json = serde_json::to_string(&p).unwrap();
        let p2 = Program::from_json(&json).unwrap();
        assert_eq!(p2.main().blocks.len(), p.main().blocks.len());
        assert!(p2.main().is_conditional(BlockId {
            cfg: p2.main().id,
            index: 1
        }));
    }

    #[test]
    fn bad_sp_is_rejected() {
        let mut f = CfgBuilder::new("f");
        let e = f.entry();
        let x = f.exit();
        f.edge(e, x);
        let mut p = ProgramBuilder::new(99, 16, 8);
        p.add(f);
        assert!(matches!(
            p.finish(),
            Err(CuldesacError::SpNotIdentified)
        ));
    }

    #[test]
    fn exited_headers_stop_at_label() {
        let mut f = CfgBuilder::new("f");
        let entry = f.entry();
        let outer = f.basic::<MachineInst>(vec![]);
        let inner = f.basic::<MachineInst>(vec![]);
        let body = f.basic::<MachineInst>(vec![]);
        let exit = f.exit();
        f.edge(entry, outer);
        f.edge(outer, inner);
        f.edge(inner, body);
        f.back_edge(body, inner);
        let ex = f.loop_exit_edge(body, exit, inner);
        f.mark_loop(outer, &[inner, body]);
        f.mark_loop(inner, &[body]);
        let mut p = ProgramBuilder::new(0, 4, 4);
        let id = p.add(f);
        let p = p.finish().unwrap();
        let exited = p.cfg(id).exited_headers(EdgeId { cfg: id, index: ex });
        assert_eq!(
            exited,
            vec![BlockId { cfg: id, index: inner }]
        );
    }
}
