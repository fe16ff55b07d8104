//! Dataflow transformations: predecessor maintenance, constant and copy
//! propagation, dead-code elimination, CFG garbage collection, and
//! basic-block merging. Each is a free function over a [`Procedure`]
//! returning whether it changed anything, run to a local fixed point
//! where the source algorithm does so (const/copy propagation) and once
//! per pipeline sweep otherwise — the pipeline driver supplies the
//! outer fixed-point loop across all passes.

use std::collections::HashSet;
use std::rc::Rc;

use crate::ir::{BlockId, InsnId, InsnKind, Procedure};
use crate::operand::{self, Operand, VRegCell};

fn reset_visited(proc: &mut Procedure) {
    for b in proc.block_ids() {
        for i in proc.insn_ids(b) {
            proc.insn_mut(i).visited = false;
        }
    }
}

/// Recomputes every block's predecessor list from the current
/// terminators. Consecutive duplicate edges from the same predecessor
/// (e.g. both arms of a `br` landing on the same block) collapse to one
/// predecessor entry.
pub fn update_cfg_preds(proc: &mut Procedure) {
    for b in proc.block_ids() {
        proc.block_mut(b).preds.clear();
    }
    for b in proc.block_ids() {
        let targets = proc.block(b).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
        for t in targets {
            let preds = &mut proc.block_mut(t).preds;
            if preds.last() != Some(&b) {
                preds.push(b);
            }
        }
    }
}

pub fn transform_insn_simplify(proc: &mut Procedure) -> bool {
    let mut count = 0u32;
    for b in proc.block_ids() {
        for i in proc.insn_ids(b) {
            if proc.block_live(b) && crate::simplify::simplify(proc, i) {
                count += 1;
            }
        }
    }
    if count > 0 {
        log::trace!("insn_simplify: simplified {} instruction(s)", count);
    }
    count > 0
}

// --- constant propagation ----------------------------------------------

fn const_traverse(proc: &mut Procedure, in_id: InsnId, vr: &Rc<VRegCell>) -> Operand {
    let mut cur = proc.insn(in_id).prev;
    while let Some(ci) = cur {
        if proc.insn(ci).visited {
            return Operand::VReg(vr.clone());
        }
        proc.insn_mut(ci).visited = true;
        if let InsnKind::Mov { src, dest } = &proc.insn(ci).kind {
            if operand::same_vreg(dest, vr) {
                return if operand::is_imm(src) { src.clone() } else { Operand::VReg(vr.clone()) };
            }
        }
        for out in proc.insn(ci).kind.outputs() {
            if operand::same_vreg(&out, vr) {
                return Operand::VReg(vr.clone());
            }
        }
        cur = proc.insn(ci).prev;
    }

    let owner = proc.insn(in_id).owner;
    let preds = proc.block(owner).preds.clone();
    if preds.is_empty() {
        return Operand::VReg(vr.clone());
    }

    let probe = |proc: &mut Procedure, pred: BlockId| -> Operand {
        let rear = proc.block(pred).rear.expect("every block ends in a terminator");
        let proven = match &proc.insn(rear).kind {
            InsnKind::Br { op: crate::ir::BrOp::Beq, lhs: Operand::VReg(l), rhs, not_taken, .. }
                if operand::same_vreg(l, vr) && operand::is_imm(rhs) && *not_taken != owner =>
            {
                Some(rhs.clone())
            }
            _ => None,
        };
        proven.unwrap_or_else(|| const_traverse(proc, rear, vr))
    };

    let first = probe(proc, preds[0]);
    if let Some(val) = operand::abs_value(&first) {
        for &p in &preds[1..] {
            if operand::abs_value(&probe(proc, p)) != Some(val) {
                return Operand::VReg(vr.clone());
            }
        }
        return first;
    }
    if let Some((id0, _)) = operand::rel_id_and_add(&first) {
        let mut result = first;
        for &p in &preds[1..] {
            let r = probe(proc, p);
            match operand::rel_id_and_add(&r) {
                Some((id1, _)) if id1 == id0 => result = r,
                _ => return Operand::VReg(vr.clone()),
            }
        }
        return result;
    }
    Operand::VReg(vr.clone())
}

pub fn transform_const_propag(proc: &mut Procedure) -> bool {
    let mut total_replaced = 0u32;
    let mut sweeps = 0u32;
    loop {
        let mut local_changed = false;
        sweeps += 1;
        for b in proc.block_ids() {
            for i in proc.insn_ids(b) {
                let count = proc.insn(i).kind.inputs().len();
                for idx in 0..count {
                    let cur = proc.insn(i).kind.inputs()[idx].clone();
                    let vr = match &cur {
                        Operand::VReg(v) => v.clone(),
                        _ => continue,
                    };
                    reset_visited(proc);
                    let resolved = const_traverse(proc, i, &vr);
                    if !operand::same(&resolved, &cur) {
                        local_changed = true;
                        total_replaced += 1;
                        if let Some(slot) = proc.insn_mut(i).kind.inputs_mut().into_iter().nth(idx) {
                            *slot = resolved;
                        }
                    }
                }
            }
        }
        if !local_changed {
            break;
        }
    }
    if total_replaced > 0 {
        log::trace!("const_propag: replaced {} use(s) over {} sweep(s)", total_replaced, sweeps);
    }
    total_replaced > 0
}

// --- copy propagation ----------------------------------------------------

fn copy_traverse(proc: &mut Procedure, in_id: InsnId, vr: &Rc<VRegCell>) -> Rc<VRegCell> {
    let mut cur = proc.insn(in_id).prev;
    while let Some(ci) = cur {
        if proc.insn(ci).visited {
            return vr.clone();
        }
        proc.insn_mut(ci).visited = true;
        if let InsnKind::Mov { src: Operand::VReg(src_vr), dest } = &proc.insn(ci).kind {
            if operand::same_vreg(dest, vr) {
                let src_vr = src_vr.clone();
                let mut k = proc.insn(ci).next;
                while let Some(kk) = k {
                    if kk == in_id {
                        break;
                    }
                    if proc.insn(kk).kind.outputs().iter().any(|o| operand::same_vreg(o, &src_vr)) {
                        return vr.clone();
                    }
                    k = proc.insn(kk).next;
                }
                return src_vr;
            }
        }
        for out in proc.insn(ci).kind.outputs() {
            if operand::same_vreg(&out, vr) {
                return vr.clone();
            }
        }
        cur = proc.insn(ci).prev;
    }

    let owner = proc.insn(in_id).owner;
    let preds = proc.block(owner).preds.clone();
    if preds.is_empty() {
        return vr.clone();
    }
    let rear0 = proc.block(preds[0]).rear.expect("every block ends in a terminator");
    let res = copy_traverse(proc, rear0, vr);
    for &p in &preds[1..] {
        let rearp = proc.block(p).rear.expect("every block ends in a terminator");
        if !operand::same_vreg(&copy_traverse(proc, rearp, vr), &res) {
            return vr.clone();
        }
    }
    // No redefinition of `res` between the block's start and `in_id`.
    let mut k = proc.block(owner).head;
    while let Some(kk) = k {
        if kk == in_id {
            break;
        }
        if proc.insn(kk).kind.outputs().iter().any(|o| operand::same_vreg(o, &res)) {
            return vr.clone();
        }
        k = proc.insn(kk).next;
    }
    res
}

pub fn transform_copy_propag(proc: &mut Procedure) -> bool {
    let mut total_replaced = 0u32;
    let mut sweeps = 0u32;
    loop {
        let mut local_changed = false;
        sweeps += 1;
        for b in proc.block_ids() {
            for i in proc.insn_ids(b) {
                let count = proc.insn(i).kind.inputs().len();
                for idx in 0..count {
                    let cur = proc.insn(i).kind.inputs()[idx].clone();
                    let vr = match &cur {
                        Operand::VReg(v) => v.clone(),
                        _ => continue,
                    };
                    reset_visited(proc);
                    let resolved = copy_traverse(proc, i, &vr);
                    if !operand::same_vreg(&resolved, &vr) {
                        local_changed = true;
                        total_replaced += 1;
                        if let Some(slot) = proc.insn_mut(i).kind.inputs_mut().into_iter().nth(idx) {
                            *slot = Operand::VReg(resolved);
                        }
                    }
                }
            }
        }
        if !local_changed {
            break;
        }
    }
    if total_replaced > 0 {
        log::trace!("copy_propag: replaced {} use(s) over {} sweep(s)", total_replaced, sweeps);
    }
    total_replaced > 0
}

// --- dead-code elimination -------------------------------------------------

fn dce_traverse(proc: &mut Procedure, start: InsnId, vr: &Rc<VRegCell>) -> bool {
    let mut cur = Some(start);
    let mut last_owner = proc.insn(start).owner;
    while let Some(ci) = cur {
        if proc.insn(ci).visited {
            return false;
        }
        proc.insn_mut(ci).visited = true;
        last_owner = proc.insn(ci).owner;
        for input in proc.insn(ci).kind.inputs() {
            if let Operand::VReg(v) = &input {
                if operand::same_vreg(v, vr) {
                    return true;
                }
            }
        }
        cur = proc.insn(ci).next;
    }
    let targets = proc.block(last_owner).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
    for t in targets {
        if let Some(h) = proc.block(t).head {
            if dce_traverse(proc, h, vr) {
                return true;
            }
        }
    }
    false
}

/// Eliminates instructions whose only effect is to produce a value that
/// nothing downstream uses. Impure instructions (`call`, `load`,
/// `store`, `oops`) and `entry` are exempt regardless of their outputs.
pub fn transform_dce(proc: &mut Procedure) -> bool {
    let mut changed = false;
    let mut eliminated = 0u32;
    for b in proc.block_ids() {
        for i in proc.insn_ids(b) {
            if !proc.block_live(b) || proc.insn(i).kind.is_impure() {
                continue;
            }
            let outputs = proc.insn(i).kind.outputs();
            if outputs.is_empty() {
                continue;
            }
            let mut any_used = false;
            for out in &outputs {
                reset_visited(proc);
                let used = match proc.insn(i).next {
                    Some(n) => dce_traverse(proc, n, out),
                    None => {
                        let owner = proc.insn(i).owner;
                        let targets = proc.block(owner).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
                        targets.into_iter().any(|t| proc.block(t).head.map(|h| dce_traverse(proc, h, out)).unwrap_or(false))
                    }
                };
                if used {
                    any_used = true;
                    break;
                }
            }
            if !any_used {
                proc.eliminate_insn(i);
                changed = true;
                eliminated += 1;
            }
        }
    }
    if eliminated > 0 {
        log::trace!("dce: eliminated {} instruction(s)", eliminated);
    }
    changed
}

/// Eliminates basic blocks unreachable from the entry block.
pub fn transform_cfg_gc(proc: &mut Procedure) -> bool {
    let entry = match proc.block_head() {
        Some(e) => e,
        None => return false,
    };
    let mut visited = HashSet::new();
    let mut stack = vec![entry];
    while let Some(b) = stack.pop() {
        if !visited.insert(b) {
            continue;
        }
        let targets = proc.block(b).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default();
        stack.extend(targets);
    }
    let mut changed = false;
    let mut eliminated = 0u32;
    for b in proc.block_ids() {
        if !visited.contains(&b) {
            proc.eliminate_block(b);
            changed = true;
            eliminated += 1;
        }
    }
    if eliminated > 0 {
        log::trace!("cfg_gc: eliminated {} unreachable block(s)", eliminated);
    }
    changed
}

/// Splices a block into its sole predecessor when that predecessor ends
/// in a plain `jmp` to it.
pub fn transform_cfg_merge(proc: &mut Procedure) -> bool {
    let mut changed = false;
    let mut merged = 0u32;
    for b in proc.block_ids() {
        if !proc.block_live(b) {
            continue;
        }
        let preds = proc.block(b).preds.clone();
        if preds.len() != 1 || !proc.block_live(preds[0]) {
            continue;
        }
        let p = preds[0];
        let rear = match proc.block(p).rear {
            Some(r) => r,
            None => continue,
        };
        if !matches!(proc.insn(rear).kind, InsnKind::Jmp { .. }) {
            continue;
        }
        proc.eliminate_insn(rear);
        for i in proc.insn_ids(b) {
            proc.reattach_insn(i, p);
        }
        proc.eliminate_block(b);
        changed = true;
        merged += 1;
    }
    if merged > 0 {
        log::trace!("cfg_merge: merged {} block(s) into their predecessor", merged);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BrOp;

    #[test]
    fn dce_removes_an_unused_pure_instruction() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        let dead = operand::make_vreg_cell();
        let dead_insn = proc.append_insn(
            b,
            InsnKind::BinOp { op: crate::ir::BinOp::Add, lhs: operand::make_abs(1), rhs: operand::make_abs(2), dest: dead },
        );
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });

        assert!(transform_dce(&mut proc));
        assert!(!proc.insn_ids(b).contains(&dead_insn));
    }

    #[test]
    fn dce_keeps_an_instruction_whose_output_is_used() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        let live = operand::make_vreg_cell();
        let live_insn = proc.append_insn(
            b,
            InsnKind::BinOp { op: crate::ir::BinOp::Add, lhs: operand::make_abs(1), rhs: operand::make_abs(2), dest: live.clone() },
        );
        proc.append_insn(b, InsnKind::Ret { inputs: vec![Operand::VReg(live)] });

        assert!(!transform_dce(&mut proc));
        assert!(proc.insn_ids(b).contains(&live_insn));
    }

    #[test]
    fn dce_never_removes_an_impure_instruction() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        let dest = operand::make_vreg_cell();
        let load = proc.append_insn(b, InsnKind::Load { addr: operand::make_abs(0x1000), dest });
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });

        assert!(!transform_dce(&mut proc));
        assert!(proc.insn_ids(b).contains(&load));
    }

    #[test]
    fn copy_propagation_forwards_a_mov_source_into_a_later_use() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        let src = operand::make_vreg();
        let src_cell = operand::as_vreg(&src).unwrap().clone();
        let copy = operand::make_vreg_cell();
        proc.append_insn(b, InsnKind::Mov { src: src.clone(), dest: copy.clone() });
        let ret = proc.append_insn(b, InsnKind::Ret { inputs: vec![Operand::VReg(copy)] });

        update_cfg_preds(&mut proc);
        assert!(transform_copy_propag(&mut proc));
        match &proc.insn(ret).kind {
            InsnKind::Ret { inputs } => assert!(operand::same_vreg(operand::as_vreg(&inputs[0]).unwrap(), &src_cell)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn copy_propagation_does_not_forward_past_a_redefinition_of_the_source() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        let src = operand::make_vreg();
        let src_cell = operand::as_vreg(&src).unwrap().clone();
        let copy = operand::make_vreg_cell();
        proc.append_insn(b, InsnKind::Mov { src: src.clone(), dest: copy.clone() });
        proc.append_insn(b, InsnKind::Mov { src: operand::make_abs(9), dest: src_cell });
        let ret = proc.append_insn(b, InsnKind::Ret { inputs: vec![Operand::VReg(copy.clone())] });

        update_cfg_preds(&mut proc);
        transform_copy_propag(&mut proc);
        match &proc.insn(ret).kind {
            InsnKind::Ret { inputs } => assert!(operand::same_vreg(operand::as_vreg(&inputs[0]).unwrap(), &copy)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn cfg_gc_removes_a_block_unreachable_from_entry() {
        let mut proc = Procedure::new(1);
        let entry = proc.make_bblock();
        let reachable = proc.make_bblock();
        let orphan = proc.make_bblock();
        proc.append_insn(entry, InsnKind::Jmp { target: reachable });
        proc.append_insn(reachable, InsnKind::Ret { inputs: Vec::new() });
        proc.append_insn(orphan, InsnKind::Ret { inputs: Vec::new() });

        assert!(transform_cfg_gc(&mut proc));
        assert!(!proc.block_ids().contains(&orphan));
        assert!(proc.block_ids().contains(&reachable));
    }

    #[test]
    fn cfg_merge_splices_a_sole_successor_into_its_predecessor() {
        let mut proc = Procedure::new(1);
        let entry = proc.make_bblock();
        let tail = proc.make_bblock();
        proc.append_insn(entry, InsnKind::Jmp { target: tail });
        proc.append_insn(tail, InsnKind::Ret { inputs: Vec::new() });

        update_cfg_preds(&mut proc);
        assert!(transform_cfg_merge(&mut proc));
        assert_eq!(proc.block_ids(), vec![entry]);
        assert!(matches!(proc.insn_ids(entry).last().map(|&i| &proc.insn(i).kind), Some(InsnKind::Ret { .. })));
    }

    /// A `br` that folds to a `jmp` leaves one of its two original
    /// targets unreachable; the next `transform_cfg_gc` sweep removes it.
    #[test]
    fn unreachable_block_from_a_folded_branch_is_collected_next_sweep() {
        let mut proc = Procedure::new(1);
        let entry = proc.make_bblock();
        let taken = proc.make_bblock();
        let not_taken = proc.make_bblock();
        proc.append_insn(
            entry,
            InsnKind::Br { op: BrOp::Beq, lhs: operand::make_abs(1), rhs: operand::make_abs(1), taken, not_taken },
        );
        proc.append_insn(taken, InsnKind::Ret { inputs: Vec::new() });
        proc.append_insn(not_taken, InsnKind::Ret { inputs: Vec::new() });

        assert!(transform_insn_simplify(&mut proc));
        update_cfg_preds(&mut proc);
        assert!(transform_cfg_gc(&mut proc));
        assert!(!proc.block_ids().contains(&not_taken));
        assert!(proc.block_ids().contains(&taken));
    }
}
