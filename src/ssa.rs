//! SSA construction: numbering, Cooper-Harvey-Kennedy dominators,
//! dominance frontiers, minimal (non-pruned) phi placement, and
//! renaming.
//!
//! Renaming walks the CFG in plain reachability order rather than
//! dominator-tree-child order (see `SPEC_FULL.md` design notes — this
//! is deliberate, not an oversight): the rule that a use reads the
//! current top of its vreg's stack, and that a block's phi argument for
//! a given predecessor is filled exactly when that predecessor is
//! visited, holds regardless of which order the CFG is walked in, as
//! long as every block is visited at least once along a path that
//! passes through all of its dominators first — which holds for any
//! forward reachability DFS from the entry.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::ir::{BlockId, InsnId, InsnKind, Procedure};
use crate::operand::{self, Operand, VRegCell};

pub fn transform_to_ssa(proc: &mut Procedure) {
    let entry = match proc.block_head() {
        Some(e) => e,
        None => return,
    };
    compute_preds_dfs(proc, entry);

    let postorder = compute_postorder(proc, entry);
    let number: HashMap<BlockId, i64> = postorder.iter().enumerate().map(|(i, &b)| (b, i as i64)).collect();
    let idom = compute_idom(proc, entry, &postorder, &number);
    let df = dominance_frontiers(proc, &idom);
    let phi_origin = place_phis(proc, &df);

    let mut stacks: HashMap<usize, Vec<Rc<VRegCell>>> = HashMap::new();
    for b in proc.block_ids() {
        proc.block_mut(b).visited = false;
        proc.block_mut(b).phi_arg_index = 0;
    }
    rename_from_entry(proc, entry, &phi_origin, &mut stacks);

    log::debug!("ssa: placed {} phi node(s) over {} reachable block(s)", phi_origin.len(), postorder.len());
}

/// Computes each reachable block's predecessor list from a preorder
/// depth-first walk starting at `entry`, rather than delegating to
/// `dataflow::update_cfg_preds`'s arena-order scan: block creation order
/// can diverge from DFS order (e.g. after call inlining or `split_before`
/// splice in new blocks), and SSA renaming's phi-argument fill order must
/// line up with this traversal, not with creation order.
fn compute_preds_dfs(proc: &mut Procedure, entry: BlockId) {
    for b in proc.block_ids() {
        proc.block_mut(b).preds.clear();
    }
    let mut visited = HashSet::new();
    let mut stack = vec![entry];
    visited.insert(entry);
    while let Some(b) = stack.pop() {
        let targets = proc.block(b).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
        for &t in &targets {
            let preds = &mut proc.block_mut(t).preds;
            if preds.last() != Some(&b) {
                preds.push(b);
            }
        }
        for t in targets.into_iter().rev() {
            if visited.insert(t) {
                stack.push(t);
            }
        }
    }
}

fn compute_postorder(proc: &Procedure, entry: BlockId) -> Vec<BlockId> {
    enum Frame {
        Enter(BlockId),
        Exit(BlockId),
    }
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![Frame::Enter(entry)];
    visited.insert(entry);
    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(b) => {
                stack.push(Frame::Exit(b));
                let targets = proc.block(b).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
                for t in targets {
                    if visited.insert(t) {
                        stack.push(Frame::Enter(t));
                    }
                }
            }
            Frame::Exit(b) => order.push(b),
        }
    }
    order
}

fn intersect(mut a: BlockId, mut b: BlockId, idom: &HashMap<BlockId, BlockId>, number: &HashMap<BlockId, i64>) -> BlockId {
    while a != b {
        while number[&a] < number[&b] {
            a = idom[&a];
        }
        while number[&b] < number[&a] {
            b = idom[&b];
        }
    }
    a
}

fn compute_idom(proc: &Procedure, entry: BlockId, postorder: &[BlockId], number: &HashMap<BlockId, i64>) -> HashMap<BlockId, BlockId> {
    let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();
    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(entry, entry);
    let mut changed = true;
    while changed {
        changed = false;
        for &b in &rpo {
            if b == entry {
                continue;
            }
            let mut new_idom: Option<BlockId> = None;
            for &p in &proc.block(b).preds {
                if !idom.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(cur, p, &idom, number),
                });
            }
            if let Some(ni) = new_idom {
                if idom.get(&b) != Some(&ni) {
                    idom.insert(b, ni);
                    changed = true;
                }
            }
        }
    }
    idom
}

fn dominance_frontiers(proc: &Procedure, idom: &HashMap<BlockId, BlockId>) -> HashMap<BlockId, HashSet<BlockId>> {
    let mut df: HashMap<BlockId, HashSet<BlockId>> = HashMap::new();
    for &b in idom.keys() {
        let preds = &proc.block(b).preds;
        if preds.len() < 2 {
            continue;
        }
        for &p in preds {
            if !idom.contains_key(&p) {
                continue;
            }
            let mut runner = p;
            while runner != idom[&b] {
                df.entry(runner).or_default().insert(b);
                runner = idom[&runner];
            }
        }
    }
    df
}

/// Minimal (non-pruned) phi placement by dominance-frontier closure.
/// Returns, for each inserted phi, the pre-renaming vreg it represents
/// — needed by `rename_from_entry` to know which stack to read from when
/// filling a predecessor's argument slot, since the phi's own `dest`
/// and `args` fields are overwritten by renaming itself.
fn place_phis(proc: &mut Procedure, df: &HashMap<BlockId, HashSet<BlockId>>) -> HashMap<InsnId, Rc<VRegCell>> {
    let mut defsites: HashMap<usize, HashSet<BlockId>> = HashMap::new();
    let mut vreg_by_key: HashMap<usize, Rc<VRegCell>> = HashMap::new();
    for b in proc.block_ids() {
        for i in proc.insn_ids(b) {
            for out in proc.insn(i).kind.outputs() {
                let key = Rc::as_ptr(&out) as usize;
                defsites.entry(key).or_default().insert(b);
                vreg_by_key.entry(key).or_insert(out);
            }
        }
    }

    let mut phi_origin = HashMap::new();
    for (key, sites) in &defsites {
        let vr = vreg_by_key[key].clone();
        let mut placed: HashSet<BlockId> = HashSet::new();
        let mut worklist: Vec<BlockId> = sites.iter().copied().collect();
        while let Some(b) = worklist.pop() {
            let frontier = match df.get(&b) {
                Some(f) => f.clone(),
                None => continue,
            };
            for f in frontier {
                if placed.insert(f) {
                    let preds_count = proc.block(f).preds.len();
                    let head = proc.block(f).head.expect("every block ends in a terminator");
                    let phi_id = proc.insert_insn_before(
                        head,
                        InsnKind::Phi { args: vec![Operand::VReg(vr.clone()); preds_count], dest: vr.clone() },
                    );
                    phi_origin.insert(phi_id, vr.clone());
                    worklist.push(f);
                }
            }
        }
    }
    phi_origin
}

/// One entry per block currently on the explicit DFS stack used by
/// `rename_from_entry`: `Enter` renames the block's own instructions and
/// fills its predecessors' phi slots as each successor is entered;
/// `Resume` returns to a block already renamed to advance to its next
/// unvisited successor, and performs the stack cleanup a recursive
/// call's return would otherwise do once every successor is handled.
enum RenameFrame {
    Enter(BlockId),
    Resume { targets: Vec<BlockId>, idx: usize, pushed: Vec<usize> },
}

fn rename_from_entry(
    proc: &mut Procedure,
    entry: BlockId,
    phi_origin: &HashMap<InsnId, Rc<VRegCell>>,
    stacks: &mut HashMap<usize, Vec<Rc<VRegCell>>>,
) {
    let mut stack = vec![RenameFrame::Enter(entry)];
    while let Some(frame) = stack.pop() {
        match frame {
            RenameFrame::Enter(b) => {
                if proc.block(b).visited {
                    continue;
                }
                proc.block_mut(b).visited = true;

                let mut pushed = Vec::new();
                for i in proc.insn_ids(b) {
                    let is_phi = proc.insn(i).kind.is_phi();
                    if !is_phi {
                        for input in proc.insn_mut(i).kind.inputs_mut() {
                            if let Operand::VReg(v) = input {
                                let key = Rc::as_ptr(v) as usize;
                                if let Some(top) = stacks.get(&key).and_then(|s| s.last()) {
                                    *input = Operand::VReg(top.clone());
                                }
                            }
                        }
                    }
                    for out in proc.insn_mut(i).kind.outputs_mut() {
                        let key = Rc::as_ptr(out) as usize;
                        let fresh = operand::make_vreg_cell();
                        stacks.entry(key).or_default().push(fresh.clone());
                        pushed.push(key);
                        *out = fresh;
                    }
                }

                let mut targets = proc.block(b).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
                let mut seen = HashSet::new();
                targets.retain(|t| seen.insert(*t));

                stack.push(RenameFrame::Resume { targets, idx: 0, pushed });
            }
            RenameFrame::Resume { targets, idx, pushed } => {
                if idx == targets.len() {
                    for key in pushed {
                        stacks.get_mut(&key).unwrap().pop();
                    }
                    continue;
                }
                let s = targets[idx];
                let arg_idx = proc.block(s).phi_arg_index;
                for i in proc.insn_ids(s) {
                    if !proc.insn(i).kind.is_phi() {
                        break;
                    }
                    let orig = phi_origin[&i].clone();
                    let key = Rc::as_ptr(&orig) as usize;
                    let cur = stacks.get(&key).and_then(|st| st.last()).cloned().unwrap_or(orig);
                    if let InsnKind::Phi { args, .. } = &mut proc.insn_mut(i).kind {
                        args[arg_idx] = Operand::VReg(cur);
                    }
                }
                proc.block_mut(s).phi_arg_index += 1;

                stack.push(RenameFrame::Resume { targets, idx: idx + 1, pushed });
                stack.push(RenameFrame::Enter(s));
            }
        }
    }
}
