//! Whole-analysis scenarios: programs built through the builders, analyzed
//! with the built-in ground decider.

use culdesac::analyze;
use culdesac::config::AnalysisConfig;
use culdesac::dominance::GlobalDominance;
use culdesac::oracle::post_process;
use culdesac::path::{DetailedPath, FlowItem};
use culdesac::program::{
    CfgBuilder, CfgId, CompareCond, EdgeId, MachineInst, Program, ProgramBuilder, Sem,
};
use culdesac::smt::GroundFactory;

const SP: i32 = 13;

fn builder() -> ProgramBuilder {
    ProgramBuilder::new(SP, 16, 8)
}

fn cond(cmp: CompareCond, a: i32, b: i32) -> MachineInst {
    MachineInst::new(vec![
        Sem::Cmp { dst: 7, a, b },
        Sem::If { cond: cmp, sr: 7 },
        Sem::Branch,
        Sem::Cont,
    ])
}

fn seti(dst: i32, val: i32) -> MachineInst {
    MachineInst::new(vec![Sem::SetI { dst, val }])
}

fn eid(cfg: CfgId, index: u32) -> EdgeId {
    EdgeId { cfg, index }
}

#[test]
fn trivially_unsat_branch_is_reported() {
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let b1 = f.basic(vec![seti(0, 0), cond(CompareCond::Eq, 0, 0)]);
    let b2 = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, b1);
    let _e_t = f.taken_edge(b1, b2);
    let e_nt = f.edge(b1, b2);
    f.edge(b2, exit);

    let mut p = builder();
    let id = p.add(f);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();

    assert_eq!(result.infeasible_paths.len(), 1);
    assert_eq!(
        result.infeasible_paths[0].to_ordered_path(),
        vec![eid(id, e_nt)]
    );
    assert_eq!(result.stats.ip_count, 1);
    assert_eq!(result.stats.minimized_count(), 1);
}

#[test]
fn post_dominated_edges_are_pruned() {
    // entry -> a -> (b | c) -> d -> exit; d's out edge post-dominates the
    // branch edge but is not dominated by it.
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let a = f.basic(vec![cond(CompareCond::Lt, 0, 1)]);
    let b = f.basic::<MachineInst>(vec![]);
    let c = f.basic::<MachineInst>(vec![]);
    let d = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, a);
    let e1 = f.taken_edge(a, b);
    f.edge(a, c);
    f.edge(b, d);
    f.edge(c, d);
    let e2 = f.edge(d, exit);

    let mut p = builder();
    let id = p.add(f);
    let p = p.finish().unwrap();

    let mut path = DetailedPath::new();
    path.append_edge(eid(id, e1));
    path.append_edge(eid(id, e2));
    let mut paths = vec![path];
    let gdom = GlobalDominance::new(&p);
    post_process(&mut paths, &gdom);
    assert_eq!(paths[0].to_ordered_path(), vec![eid(id, e1)]);

    // Idempotence: a second pass changes nothing.
    let snapshot = paths.clone();
    post_process(&mut paths, &gdom);
    assert_eq!(paths, snapshot);
}

#[test]
fn linear_induction_loop_terminates_without_reports() {
    // for (i = 0; i < n; i++) with n symbolic in r1.
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let init = f.basic(vec![seti(0, 0)]);
    let h = f.basic(vec![cond(CompareCond::Lt, 0, 1)]);
    let body = f.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -1, val: 1 },
        Sem::Add { dst: 0, a: 0, b: -1 },
    ])]);
    let after = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, init);
    f.edge(init, h);
    f.taken_edge(h, body);
    f.back_edge(body, h);
    f.loop_exit_edge(h, after, h);
    f.edge(after, exit);
    f.mark_loop(h, &[body]);

    let mut p = builder();
    p.add(f);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
    assert_eq!(result.stats.ip_count, 0);
}

#[test]
fn constant_assignment_loop_accelerates() {
    // The loop body re-establishes exactly the incoming state, so the
    // fixpoint is immediate and widening changes nothing.
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let init = f.basic(vec![seti(0, 5)]);
    let h = f.basic(vec![seti(0, 5)]);
    let after = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, init);
    f.edge(init, h);
    f.back_edge(h, h);
    f.loop_exit_edge(h, after, h);
    f.edge(after, exit);
    f.mark_loop(h, &[]);

    let mut p = builder();
    p.add(f);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
}

#[test]
fn nested_loops_terminate() {
    // for (i = 0; i < n; i++) for (j = 0; j < m; j++) j++  — all symbolic.
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let init = f.basic(vec![seti(0, 0)]);
    let oh = f.basic(vec![cond(CompareCond::Lt, 0, 1)]);
    let jinit = f.basic(vec![seti(2, 0)]);
    let ih = f.basic(vec![cond(CompareCond::Lt, 2, 3)]);
    let body = f.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -1, val: 1 },
        Sem::Add { dst: 2, a: 2, b: -1 },
    ])]);
    let oinc = f.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -1, val: 1 },
        Sem::Add { dst: 0, a: 0, b: -1 },
    ])]);
    let after = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, init);
    f.edge(init, oh);
    f.taken_edge(oh, jinit);
    f.edge(jinit, ih);
    f.taken_edge(ih, body);
    f.back_edge(body, ih);
    f.loop_exit_edge(ih, oinc, ih);
    f.back_edge(oinc, oh);
    f.loop_exit_edge(oh, after, oh);
    f.edge(after, exit);
    f.mark_loop(oh, &[jinit, ih, body, oinc]);
    f.mark_loop(ih, &[body]);

    let mut p = builder();
    p.add(f);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
}

#[test]
fn merge_cap_still_finds_contradictions() {
    // A diamond fans out two states; with the cap at 1 they are merged at
    // the join block, after which a constant contradiction is still caught.
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let b1 = f.basic(vec![seti(0, 0), cond(CompareCond::Lt, 4, 5)]);
    let join = f.basic(vec![cond(CompareCond::Ne, 0, 0)]);
    let exit = f.exit();
    f.edge(entry, b1);
    f.taken_edge(b1, join);
    f.edge(b1, join);
    let e_taken = f.taken_edge(join, exit);
    f.edge(join, exit);

    let mut p = builder();
    let id = p.add(f);
    let p = p.finish().unwrap();
    let config = AnalysisConfig {
        merge: true,
        merge_threshold: 1,
        ..Default::default()
    };
    let result = analyze(&p, &config, &GroundFactory).unwrap();
    assert_eq!(result.infeasible_paths.len(), 1);
    assert_eq!(
        result.infeasible_paths[0].to_ordered_path(),
        vec![eid(id, e_taken)]
    );
}

#[test]
fn call_with_constant_argument_reports_callee_branch() {
    let mut p = builder();
    let callee_id = CfgId(1);

    let mut main = CfgBuilder::new("main");
    let entry = main.entry();
    let a = main.basic(vec![seti(0, 7)]);
    let call = main.call(callee_id);
    let b = main.basic(vec![cond(CompareCond::Lt, 4, 5)]);
    let exit = main.exit();
    main.edge(entry, a);
    main.edge(a, call);
    main.edge(call, b);
    main.taken_edge(b, exit);
    main.edge(b, exit);

    // callee "f" returns through a branch guarded by r0 <= 3.
    let mut f = CfgBuilder::new("f");
    let fe = f.entry();
    let fc = f.basic(vec![seti(2, 3), cond(CompareCond::Le, 0, 2)]);
    let f1 = f.basic::<MachineInst>(vec![]);
    let f2 = f.basic::<MachineInst>(vec![]);
    let fx = f.exit();
    f.edge(fe, fc);
    let guarded = f.taken_edge(fc, f1);
    f.edge(fc, f2);
    f.edge(f1, fx);
    f.edge(f2, fx);

    let main_id = p.add(main);
    assert_eq!(p.add(f), callee_id);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();

    // Both out-edges of b see the same contradiction; exactly one path is
    // reported (duplicate suppression).
    assert_eq!(result.infeasible_paths.len(), 1);
    let path = &result.infeasible_paths[0];
    assert!(path.contains_edge(eid(callee_id, guarded)));
    assert!(
        path.iter()
            .any(|i| matches!(i, FlowItem::Call(cb) if cb.cfg == main_id))
    );
    assert_eq!(result.stats.ip_count, 2);
}

#[test]
fn memory_survives_a_well_behaved_call() {
    // [sp+8] := r1 before the call; reloading it afterwards must still give
    // r1, making the Ne branch infeasible.
    let mut p = builder();
    let callee_id = CfgId(1);

    let mut main = CfgBuilder::new("main");
    let entry = main.entry();
    let store = main.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -2, val: 8 },
        Sem::Add { dst: -1, a: SP, b: -2 },
        Sem::Store { src: 1, addr: -1 },
    ])]);
    let call = main.call(callee_id);
    let check = main.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -2, val: 8 },
        Sem::Add { dst: -1, a: SP, b: -2 },
        Sem::Load { dst: 3, addr: -1 },
        Sem::Cmp { dst: 7, a: 3, b: 1 },
        Sem::If {
            cond: CompareCond::Ne,
            sr: 7,
        },
        Sem::Branch,
        Sem::Cont,
    ])]);
    let exit = main.exit();
    main.edge(entry, store);
    main.edge(store, call);
    main.edge(call, check);
    let e_ne = main.taken_edge(check, exit);
    main.edge(check, exit);

    let mut f = CfgBuilder::new("f");
    let fe = f.entry();
    let fb = f.basic(vec![seti(2, 1)]);
    let fx = f.exit();
    f.edge(fe, fb);
    f.edge(fb, fx);

    let main_id = p.add(main);
    assert_eq!(p.add(f), callee_id);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();

    assert_eq!(result.infeasible_paths.len(), 1);
    assert_eq!(
        result.infeasible_paths[0].to_ordered_path(),
        vec![eid(main_id, e_ne)]
    );
}

#[test]
fn sp_scratching_call_drops_memory_knowledge() {
    // Same shape as above, but the callee clobbers SP: the reload cannot be
    // resolved any more, so nothing is infeasible.
    let mut p = builder();
    let callee_id = CfgId(1);

    let mut main = CfgBuilder::new("main");
    let entry = main.entry();
    let store = main.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -2, val: 8 },
        Sem::Add { dst: -1, a: SP, b: -2 },
        Sem::Store { src: 1, addr: -1 },
    ])]);
    let call = main.call(callee_id);
    let check = main.basic(vec![MachineInst::new(vec![
        Sem::SetI { dst: -2, val: 8 },
        Sem::Add { dst: -1, a: SP, b: -2 },
        Sem::Load { dst: 3, addr: -1 },
        Sem::Cmp { dst: 7, a: 3, b: 1 },
        Sem::If {
            cond: CompareCond::Ne,
            sr: 7,
        },
        Sem::Branch,
        Sem::Cont,
    ])]);
    let exit = main.exit();
    main.edge(entry, store);
    main.edge(store, call);
    main.edge(call, check);
    main.taken_edge(check, exit);
    main.edge(check, exit);

    let mut f = CfgBuilder::new("f");
    let fe = f.entry();
    let fb = f.basic(vec![MachineInst::new(vec![Sem::Scratch { dst: SP }])]);
    let fx = f.exit();
    f.edge(fe, fb);
    f.edge(fb, fx);

    p.add(main);
    assert_eq!(p.add(f), callee_id);
    let p = p.finish().unwrap();
    let config = AnalysisConfig {
        assume_identical_sp: false,
        ..Default::default()
    };
    let result = analyze(&p, &config, &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
}

#[test]
fn unresolvable_store_does_not_derail_the_analysis() {
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let b1 = f.basic(vec![MachineInst::new(vec![
        Sem::Scratch { dst: 2 },
        Sem::Store { src: 0, addr: 2 },
    ])]);
    let b2 = f.basic(vec![cond(CompareCond::Lt, 0, 1)]);
    let exit = f.exit();
    f.edge(entry, b1);
    f.edge(b1, b2);
    f.taken_edge(b2, exit);
    f.edge(b2, exit);

    let mut p = builder();
    p.add(f);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
}

#[test]
fn empty_cfg_yields_empty_result() {
    let mut f = CfgBuilder::new("main");
    f.entry();
    f.exit();
    let mut p = builder();
    p.add(f);
    let p = p.finish().unwrap();
    let result = analyze(&p, &AnalysisConfig::default(), &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
    assert_eq!(result.stats.ip_count, 0);
}

#[test]
fn dry_run_skips_the_solver() {
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let b1 = f.basic(vec![seti(0, 0), cond(CompareCond::Eq, 0, 0)]);
    let b2 = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, b1);
    f.taken_edge(b1, b2);
    f.edge(b1, b2);
    f.edge(b2, exit);

    let mut p = builder();
    p.add(f);
    let p = p.finish().unwrap();
    let config = AnalysisConfig {
        dry_run: true,
        ..Default::default()
    };
    let result = analyze(&p, &config, &GroundFactory).unwrap();
    assert!(result.infeasible_paths.is_empty());
}

#[test]
fn parallel_checks_match_sequential_results() {
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let b1 = f.basic(vec![seti(0, 0), cond(CompareCond::Eq, 0, 0)]);
    let b2 = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, b1);
    f.taken_edge(b1, b2);
    let e_nt = f.edge(b1, b2);
    f.edge(b2, exit);

    let mut p = builder();
    let id = p.add(f);
    let p = p.finish().unwrap();
    let config = AnalysisConfig {
        nb_cores: 4,
        ..Default::default()
    };
    let result = analyze(&p, &config, &GroundFactory).unwrap();
    assert_eq!(result.infeasible_paths.len(), 1);
    assert_eq!(
        result.infeasible_paths[0].to_ordered_path(),
        vec![eid(id, e_nt)]
    );
}

#[test]
fn json_program_round_trips_through_the_analysis() {
    let mut f = CfgBuilder::new("main");
    let entry = f.entry();
    let b1 = f.basic(vec![seti(0, 0), cond(CompareCond::Eq, 0, 0)]);
    let b2 = f.basic::<MachineInst>(vec![]);
    let exit = f.exit();
    f.edge(entry, b1);
    f.taken_edge(b1, b2);
    let e_nt = f.edge(b1, b2);
    f.edge(b2, exit);

    let mut p = builder();
    let id = p.add(f);
    let p = p.finish().unwrap();
    let json = serde_json::to_string(&p).unwrap();
    let p2 = Program::from_json(&json).unwrap();
    let result = analyze(&p2, &AnalysisConfig::default(), &GroundFactory).unwrap();
    assert_eq!(
        result.infeasible_paths[0].to_ordered_path(),
        vec![eid(id, e_nt)]
    );
}
