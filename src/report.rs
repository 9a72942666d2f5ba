//! FFX output: the analyzed infeasible paths as a flow-fact document.
//!
//! Per analyzed CFG, each infeasible path is written as its ordered
//! `(source, target)` block-index pairs, nested inside the call/loop
//! structure its detailed path recorded.

use crate::path::{DetailedPath, FlowItem};
use crate::program::{BlockKind, CfgId, Program};
use itertools::Itertools;
use std::io::{self, Write};

pub fn write_ffx<W: Write>(
    w: &mut W,
    program: &Program,
    paths: &[DetailedPath],
) -> io::Result<()> {
    writeln!(w, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(w, "<flowfacts>")?;
    let by_function = paths
        .iter()
        .filter(|p| p.function().is_some())
        .into_group_map_by(|p| p.function().unwrap_or(CfgId(0)));
    for (cfg, group) in by_function.into_iter().sorted_by_key(|(cfg, _)| *cfg) {
        let name = &program.cfg(cfg).name;
        writeln!(w, "  <function name=\"{}\">", escape(name))?;
        for path in group {
            write_path(w, program, path)?;
        }
        writeln!(w, "  </function>")?;
    }
    writeln!(w, "</flowfacts>")
}

fn write_path<W: Write>(w: &mut W, program: &Program, path: &DetailedPath) -> io::Result<()> {
    let mut depth = 2;
    let indent = |d: usize| "  ".repeat(d);
    writeln!(w, "{}<not-all seq=\"true\">", indent(depth))?;
    depth += 1;
    let mut open: Vec<&'static str> = Vec::new();
    for item in path.iter() {
        match item {
            FlowItem::Edge(e) => {
                let d = program.edge(*e);
                writeln!(
                    w,
                    "{}<edge src=\"{}\" dst=\"{}\"/>",
                    indent(depth),
                    d.src,
                    d.dst
                )?;
            }
            FlowItem::LoopEntry(h) => {
                writeln!(w, "{}<loop header=\"{}\">", indent(depth), h.index)?;
                open.push("loop");
                depth += 1;
            }
            FlowItem::Call(b) => {
                let callee = match program.block(*b).kind {
                    BlockKind::Call(callee) => escape(&program.cfg(callee).name),
                    _ => String::new(),
                };
                writeln!(
                    w,
                    "{}<call block=\"{}\" callee=\"{}\">",
                    indent(depth),
                    b.index,
                    callee
                )?;
                open.push("call");
                depth += 1;
            }
            FlowItem::LoopExit(_) | FlowItem::Return(_) => {
                if let Some(tag) = open.pop() {
                    depth -= 1;
                    writeln!(w, "{}</{}>", indent(depth), tag)?;
                }
            }
        }
    }
    while let Some(tag) = open.pop() {
        depth -= 1;
        writeln!(w, "{}</{}>", indent(depth), tag)?;
    }
    writeln!(w, "{}</not-all>", indent(depth - 1))
}

fn escape(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&apos;".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CfgBuilder, EdgeId, MachineInst, ProgramBuilder};

    #[test]
    fn nested_structure_is_balanced() {
        let mut f = CfgBuilder::new("ma<in");
        let entry = f.entry();
        let b1 = f.basic::<MachineInst>(vec![]);
        let b2 = f.basic::<MachineInst>(vec![]);
        let exit = f.exit();
        f.edge(entry, b1);
        f.edge(b1, b2);
        f.edge(b2, exit);
        f.mark_loop(b2, &[]);
        let mut p = ProgramBuilder::new(0, 4, 4);
        let id = p.add(f);
        let p = p.finish().unwrap();

        let mut path = DetailedPath::new();
        path.append_edge(EdgeId { cfg: id, index: 1 });
        path.on_loop_entry(crate::program::BlockId { cfg: id, index: b2 });
        path.append_edge(EdgeId { cfg: id, index: 2 });
        path.on_loop_exit(crate::program::BlockId { cfg: id, index: b2 });

        let mut out = Vec::new();
        write_ffx(&mut out, &p, &[path]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<function name=\"ma&lt;in\">"));
        assert!(text.contains("<loop header=\"2\">"));
        assert_eq!(text.matches("<loop").count(), text.matches("</loop>").count());
        assert!(text.contains("<edge src=\"1\" dst=\"2\"/>"));
        assert!(text.contains("</flowfacts>"));
    }
}
