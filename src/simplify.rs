//! Per-instruction simplification: canonicalization, algebraic
//! simplification, constant folding (including the divide/modulo trap
//! and guard-branch patterns), and call-site inlining.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ir::{BinOp, BrOp, InsnKind, InsnId, Procedure};
use crate::operand::{self, Operand};

/// Simplifies one instruction in place. Returns `true` iff the IR
/// changed (the instruction's operands, kind, or surrounding blocks).
pub fn simplify(proc: &mut Procedure, id: InsnId) -> bool {
    match &proc.insn(id).kind {
        InsnKind::BinOp { .. } => simplify_binop(proc, id),
        InsnKind::Br { .. } => simplify_br(proc, id),
        InsnKind::SwitchBr { .. } => simplify_switch_br(proc, id),
        InsnKind::Call { .. } => simplify_call(proc, id),
        _ => false,
    }
}

fn negate(k: u64) -> u64 {
    0u64.wrapping_sub(k)
}

/// Whether `lhs`/`rhs` should swap to canonical order: `abs` belongs on
/// the right, ahead of any other immediate kind; failing that (neither
/// side is `abs`, or both are), any immediate belongs on the right if
/// the other side is a `vreg`. The two rules are mutually exclusive —
/// the second is only consulted when the first doesn't apply.
fn should_swap(lhs: &Operand, rhs: &Operand) -> bool {
    if operand::is_abs(lhs) && !operand::is_abs(rhs) {
        true
    } else if operand::is_imm(lhs) && !operand::is_imm(rhs) {
        true
    } else {
        false
    }
}

fn simplify_binop(proc: &mut Procedure, id: InsnId) -> bool {
    let (mut op, mut lhs, mut rhs, dest) = match &proc.insn(id).kind {
        InsnKind::BinOp { op, lhs, rhs, dest } => (*op, lhs.clone(), rhs.clone(), dest.clone()),
        _ => unreachable!(),
    };
    let mut changed = false;

    // sub x, abs(k) -> add x, abs(-k)
    if op == BinOp::Sub {
        if let Some(k) = operand::abs_value(&rhs) {
            op = BinOp::Add;
            rhs = operand::make_abs(negate(k));
            changed = true;
        }
    }

    if op.is_commutative() && should_swap(&lhs, &rhs) {
        std::mem::swap(&mut lhs, &mut rhs);
        changed = true;
    }

    // Algebraic identities.
    if let Some(result) = algebraic_identity(op, &lhs, &rhs) {
        write_mov(proc, id, result);
        return true;
    }

    // Relocatable arithmetic.
    if let Some(folded) = fold_relocatable(op, &lhs, &rhs) {
        write_mov(proc, id, folded);
        return true;
    }

    // Constant folding over two absolutes, including trap detection.
    if let (Some(a), Some(b)) = (operand::abs_value(&lhs), operand::abs_value(&rhs)) {
        if op.is_div_or_rem() {
            if b == 0 || (matches!(op, BinOp::SDiv | BinOp::SRem) && a == i64::MIN as u64 && b as i64 == -1) {
                proc.insn_mut(id).kind = InsnKind::Oops;
                return true;
            }
        }
        let result = eval_binop(op, a, b);
        write_mov(proc, id, operand::make_abs(result));
        return true;
    }

    // Divide/modulo by a possibly-zero variable: insert a runtime guard.
    if op.is_div_or_rem() && !operand::is_abs(&rhs) {
        return guard_div(proc, id, op, lhs, rhs, dest) || changed;
    }

    if changed {
        proc.insn_mut(id).kind = InsnKind::BinOp { op, lhs, rhs, dest };
    }
    changed
}

fn write_mov(proc: &mut Procedure, id: InsnId, src: Operand) {
    let dest = proc.insn(id).kind.outputs().into_iter().next().expect("binop has one output");
    proc.insn_mut(id).kind = InsnKind::Mov { src, dest };
}

fn algebraic_identity(op: BinOp, lhs: &Operand, rhs: &Operand) -> Option<Operand> {
    let rhs_abs = operand::abs_value(rhs);
    let lhs_abs = operand::abs_value(lhs);
    match op {
        BinOp::Add if rhs_abs == Some(0) => Some(lhs.clone()),
        BinOp::Sub if operand::same(lhs, rhs) => Some(operand::make_abs(0)),
        BinOp::UMul | BinOp::SMul if rhs_abs == Some(1) => Some(lhs.clone()),
        BinOp::UMul | BinOp::SMul if rhs_abs == Some(0) => Some(operand::make_abs(0)),
        BinOp::UDiv | BinOp::SDiv if rhs_abs == Some(1) => Some(lhs.clone()),
        BinOp::URem | BinOp::SRem if rhs_abs == Some(1) => Some(operand::make_abs(0)),
        BinOp::And if rhs_abs == Some(u64::MAX) => Some(lhs.clone()),
        BinOp::And if rhs_abs == Some(0) => Some(operand::make_abs(0)),
        BinOp::And if operand::same(lhs, rhs) => Some(lhs.clone()),
        BinOp::And if same_reloc(lhs, rhs) => Some(lhs.clone()),
        BinOp::Or if rhs_abs == Some(0) => Some(lhs.clone()),
        BinOp::Or if rhs_abs == Some(u64::MAX) => Some(operand::make_abs(u64::MAX)),
        BinOp::Or if operand::same(lhs, rhs) => Some(lhs.clone()),
        BinOp::Or if same_reloc(lhs, rhs) => Some(lhs.clone()),
        BinOp::Xor if rhs_abs == Some(0) => Some(lhs.clone()),
        BinOp::Xor if operand::same(lhs, rhs) => Some(operand::make_abs(0)),
        BinOp::Shl | BinOp::UShr | BinOp::SShr if rhs_abs.map(|k| k & 0x3F == 0).unwrap_or(false) => Some(lhs.clone()),
        BinOp::Shl | BinOp::UShr | BinOp::SShr if lhs_abs == Some(0) => Some(operand::make_abs(0)),
        _ => None,
    }
}

fn same_reloc(a: &Operand, b: &Operand) -> bool {
    match (operand::rel_id_and_add(a), operand::rel_id_and_add(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn fold_relocatable(op: BinOp, lhs: &Operand, rhs: &Operand) -> Option<Operand> {
    match op {
        BinOp::Add => {
            let (rel, k) = if operand::abs_value(rhs).is_some() && operand::is_rel(lhs) {
                (lhs, operand::abs_value(rhs).unwrap())
            } else if operand::abs_value(lhs).is_some() && operand::is_rel(rhs) {
                (rhs, operand::abs_value(lhs).unwrap())
            } else {
                return None;
            };
            let (base, add_k) = match rel {
                Operand::RelBase(b) => (b.clone(), k),
                Operand::RelDisp(d) => (d.base.clone(), d.add.wrapping_add(k)),
                _ => unreachable!(),
            };
            Some(operand::make_rel_disp(base, add_k))
        }
        BinOp::Sub => {
            if let (Some((id_a, add_a)), Some((id_b, add_b))) = (operand::rel_id_and_add(lhs), operand::rel_id_and_add(rhs)) {
                if id_a == id_b {
                    return Some(operand::make_abs(add_a.wrapping_sub(add_b)));
                }
                return None;
            }
            if operand::is_rel(lhs) && operand::abs_value(rhs).is_some() {
                let k = operand::abs_value(rhs).unwrap();
                return match lhs {
                    Operand::RelBase(b) => Some(operand::make_rel_disp(b.clone(), negate(k))),
                    Operand::RelDisp(d) => Some(operand::make_rel_disp(d.base.clone(), d.add.wrapping_sub(k))),
                    _ => None,
                };
            }
            None
        }
        _ => None,
    }
}

fn eval_binop(op: BinOp, a: u64, b: u64) -> u64 {
    let (sa, sb) = (a as i64, b as i64);
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::UMul => a.wrapping_mul(b),
        BinOp::SMul => sa.wrapping_mul(sb) as u64,
        BinOp::UDiv => a.wrapping_div(b),
        BinOp::URem => a.wrapping_rem(b),
        BinOp::SDiv => sa.wrapping_div(sb) as u64,
        BinOp::SRem => sa.wrapping_rem(sb) as u64,
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl((b & 0x3F) as u32),
        BinOp::UShr => a.wrapping_shr((b & 0x3F) as u32),
        BinOp::SShr => (sa.wrapping_shr((b & 0x3F) as u32)) as u64,
    }
}

/// Builds the guard for a divide/modulo whose divisor is not a literal
/// zero but is not statically known to be nonzero either:
/// `br bne rhs, 0, ok, trap` where `trap` contains a single `oops`.
fn guard_div(proc: &mut Procedure, id: InsnId, op: BinOp, lhs: Operand, rhs: Operand, dest: Rc<crate::operand::VRegCell>) -> bool {
    let is_div = matches!(op, BinOp::UDiv | BinOp::SDiv);

    let known_result = if operand::abs_value(&lhs) == Some(0) {
        Some(operand::make_abs(0))
    } else if operand::same(&lhs, &rhs) {
        Some(operand::make_abs(if is_div { 1 } else { 0 }))
    } else {
        None
    };

    let ok_block = proc.split_before(id);
    let owner = {
        // `id` now lives in `ok_block`; the original block is whatever
        // owned it immediately before the split, found via its new sibling link.
        proc.block(ok_block).prev.expect("split always has a predecessor block")
    };

    let trap_block = proc.make_bblock_after(ok_block);
    proc.append_insn(trap_block, InsnKind::Oops);

    proc.append_insn(
        owner,
        InsnKind::Br { op: BrOp::Beq, lhs: rhs.clone(), rhs: operand::make_abs(0), taken: trap_block, not_taken: ok_block },
    );

    match known_result {
        Some(result) => {
            proc.insn_mut(id).kind = InsnKind::Mov { src: result, dest };
        }
        None => {
            proc.insn_mut(id).kind = InsnKind::BinOp { op, lhs, rhs, dest };
        }
    }
    true
}

fn simplify_br(proc: &mut Procedure, id: InsnId) -> bool {
    let (op, mut lhs, mut rhs, taken, not_taken) = match &proc.insn(id).kind {
        InsnKind::Br { op, lhs, rhs, taken, not_taken } => (*op, lhs.clone(), rhs.clone(), *taken, *not_taken),
        _ => unreachable!(),
    };
    let mut changed = false;
    if op == BrOp::Beq && should_swap(&lhs, &rhs) {
        std::mem::swap(&mut lhs, &mut rhs);
        changed = true;
    }

    if let (Some(a), Some(b)) = (operand::abs_value(&lhs), operand::abs_value(&rhs)) {
        let taken_branch = match op {
            BrOp::Beq => a == b,
            BrOp::Bult => a < b,
            BrOp::Bslt => (a as i64) < (b as i64),
        };
        proc.insn_mut(id).kind = InsnKind::Jmp { target: if taken_branch { taken } else { not_taken } };
        return true;
    }

    if changed {
        proc.insn_mut(id).kind = InsnKind::Br { op, lhs, rhs, taken, not_taken };
    }
    changed
}

fn simplify_switch_br(proc: &mut Procedure, id: InsnId) -> bool {
    let (index, targets) = match &proc.insn(id).kind {
        InsnKind::SwitchBr { index, targets } => (index.clone(), targets.clone()),
        _ => unreachable!(),
    };
    if let Some(k) = operand::abs_value(&index) {
        proc.insn_mut(id).kind = match targets.get(k as usize) {
            Some(target) => InsnKind::Jmp { target: *target },
            None => InsnKind::Oops,
        };
        return true;
    }
    false
}

/// Inlines a direct call to a statically known `proc` operand.
/// Arity mismatches lower to `oops` rather than aborting; a call back
/// into the procedure currently being optimized is left uninlined since
/// cloning a procedure into itself mid-mutation can never reach a fixed
/// point.
fn simplify_call(proc: &mut Procedure, id: InsnId) -> bool {
    let (callee_op, args, results) = match &proc.insn(id).kind {
        InsnKind::Call { callee, inputs, outputs } => (callee.clone(), inputs.clone(), outputs.clone()),
        _ => unreachable!(),
    };
    let callee_handle = match operand::as_proc(&callee_op) {
        Some(p) => p,
        None => return false,
    };

    // A call back into the procedure currently being optimized is left
    // uninlined: cloning a procedure into itself mid-mutation can never
    // reach a fixed point. Compared by handle identity, never by
    // borrowing `callee_handle` — it may be the very `RefCell` already
    // mutably borrowed to produce `proc`.
    if Rc::as_ptr(&callee_handle) as usize == proc.self_ptr {
        log::trace!("call_inline: insn {:?} left uninlined (self-recursive callee)", id);
        return false;
    }

    let callee = callee_handle.borrow();
    let entry_block = callee.block_head().expect("procedure has at least one block");
    let entry_insn = callee.block(entry_block).head.expect("entry block is nonempty");
    let params = match &callee.insn(entry_insn).kind {
        InsnKind::Entry { outputs } => outputs.clone(),
        _ => Vec::new(),
    };
    let arity_ok = params.len() == args.len();
    let mut rets_ok = true;
    for b in callee.block_ids() {
        if let Some(rear) = callee.block(b).rear {
            if let InsnKind::Ret { inputs } = &callee.insn(rear).kind {
                rets_ok &= inputs.len() == results.len();
            }
        }
    }
    if !arity_ok || !rets_ok {
        drop(callee);
        log::debug!("call_inline: insn {:?} lowered to oops (arity mismatch)", id);
        proc.insn_mut(id).kind = InsnKind::Oops;
        return true;
    }

    // Snapshot the callee's body before dropping the borrow: the caller
    // (`proc`) and callee may later turn out to be the same `Procedure`
    // through other aliasing, and in general we never want to hold the
    // callee borrow while mutating `proc`.
    let callee_block_ids = callee.block_ids();
    let callee_ref = &callee;
    let snapshot: Vec<(crate::ir::BlockId, InsnKind)> = callee_block_ids
        .iter()
        .flat_map(|&b| callee_ref.insn_ids(b).into_iter().map(move |i| (b, callee_ref.insn(i).kind.clone())))
        .collect();
    drop(callee);

    let owner = proc.insn(id).owner;
    let next = proc.insn(id).next.expect("call is never the last instruction of its block");
    let continuation = proc.split_before(next);

    let mut vreg_map: HashMap<usize, Rc<crate::operand::VRegCell>> = HashMap::new();
    for p in &params {
        vreg_map.insert(Rc::as_ptr(p) as usize, operand::make_vreg_cell());
    }
    for (_, kind) in &snapshot {
        for out in kind.outputs() {
            vreg_map.entry(Rc::as_ptr(&out) as usize).or_insert_with(operand::make_vreg_cell);
        }
    }

    for i in 0..params.len() {
        let fresh = vreg_map[&(Rc::as_ptr(&params[i]) as usize)].clone();
        proc.insert_insn_before(id, InsnKind::Mov { src: args[i].clone(), dest: fresh });
    }

    let mut block_map: HashMap<crate::ir::BlockId, crate::ir::BlockId> = HashMap::new();
    block_map.insert(entry_block, owner);
    for &b in &callee_block_ids {
        if b != entry_block {
            block_map.insert(b, proc.make_bblock_before(continuation));
        }
    }

    for (b, kind) in &snapshot {
        let new_b = block_map[b];
        match remap_kind(kind, &vreg_map, &block_map) {
            InsnKind::Ret { inputs } => {
                for (slot, val) in results.iter().zip(inputs.into_iter()) {
                    proc.append_insn(new_b, InsnKind::Mov { src: val, dest: slot.clone() });
                }
                proc.append_insn(new_b, InsnKind::Jmp { target: continuation });
            }
            InsnKind::Entry { .. } => {}
            kind => {
                proc.append_insn(new_b, kind);
            }
        }
    }

    proc.eliminate_insn(id);
    log::debug!("call_inline: insn {:?} inlined ({} block(s) cloned)", id, callee_block_ids.len());
    true
}

fn remap_kind(
    kind: &InsnKind,
    vregs: &HashMap<usize, Rc<crate::operand::VRegCell>>,
    blocks: &HashMap<crate::ir::BlockId, crate::ir::BlockId>,
) -> InsnKind {
    let rv = |v: &Rc<crate::operand::VRegCell>| vregs.get(&(Rc::as_ptr(v) as usize)).cloned().unwrap_or_else(|| v.clone());
    let ro = |op: &Operand| match op {
        Operand::VReg(v) => Operand::VReg(rv(v)),
        other => other.clone(),
    };
    let rb = |b: &crate::ir::BlockId| *blocks.get(b).unwrap_or(b);
    match kind {
        InsnKind::Entry { .. } => InsnKind::Entry { outputs: Vec::new() },
        InsnKind::Ret { inputs } => InsnKind::Ret { inputs: inputs.iter().map(ro).collect() },
        InsnKind::Call { callee, inputs, outputs } => {
            InsnKind::Call { callee: ro(callee), inputs: inputs.iter().map(ro).collect(), outputs: outputs.iter().map(rv).collect() }
        }
        InsnKind::Mov { src, dest } => InsnKind::Mov { src: ro(src), dest: rv(dest) },
        InsnKind::Load { addr, dest } => InsnKind::Load { addr: ro(addr), dest: rv(dest) },
        InsnKind::Store { src, dest } => InsnKind::Store { src: ro(src), dest: ro(dest) },
        InsnKind::BinOp { op, lhs, rhs, dest } => InsnKind::BinOp { op: *op, lhs: ro(lhs), rhs: ro(rhs), dest: rv(dest) },
        InsnKind::Jmp { target } => InsnKind::Jmp { target: rb(target) },
        InsnKind::Br { op, lhs, rhs, taken, not_taken } => {
            InsnKind::Br { op: *op, lhs: ro(lhs), rhs: ro(rhs), taken: rb(taken), not_taken: rb(not_taken) }
        }
        InsnKind::SwitchBr { index, targets } => InsnKind::SwitchBr { index: ro(index), targets: targets.iter().map(rb).collect() },
        InsnKind::Oops => InsnKind::Oops,
        InsnKind::Phi { args, dest } => InsnKind::Phi { args: args.iter().map(ro).collect(), dest: rv(dest) },
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn commutative_op() -> impl Strategy<Value = BinOp> {
        prop_oneof![
            Just(BinOp::Add),
            Just(BinOp::UMul),
            Just(BinOp::SMul),
            Just(BinOp::And),
            Just(BinOp::Or),
            Just(BinOp::Xor),
        ]
    }

    fn any_binop() -> impl Strategy<Value = BinOp> {
        prop_oneof![
            commutative_op(),
            Just(BinOp::Sub),
            Just(BinOp::Shl),
            Just(BinOp::UShr),
            Just(BinOp::SShr),
        ]
    }

    fn binop_block(op: BinOp, lhs: Operand, rhs: Operand) -> (Procedure, InsnId) {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        let dest = operand::make_vreg_cell();
        let id = proc.append_insn(b, InsnKind::BinOp { op, lhs, rhs, dest });
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });
        (proc, id)
    }

    /// Reference 64-bit interpreter independent of `eval_binop`, used to
    /// cross-check constant folding (T7).
    fn reference_eval(op: BinOp, a: u64, b: u64) -> u64 {
        let (sa, sb) = (a as i64, b as i64);
        match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::UMul => a.wrapping_mul(b),
            BinOp::SMul => sa.wrapping_mul(sb) as u64,
            BinOp::UDiv => a.wrapping_div(b),
            BinOp::URem => a.wrapping_rem(b),
            BinOp::SDiv => sa.wrapping_div(sb) as u64,
            BinOp::SRem => sa.wrapping_rem(sb) as u64,
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl((b & 0x3F) as u32),
            BinOp::UShr => a.wrapping_shr((b & 0x3F) as u32),
            BinOp::SShr => sa.wrapping_shr((b & 0x3F) as u32) as u64,
        }
    }

    proptest! {
        /// T6: canonicalization is stable for commutative binops over two
        /// immediates — after simplification `lhs` is `abs` iff `rhs` is
        /// not an immediate, or both are `abs`.
        #[test]
        fn canonicalization_is_stable_for_commutative_immediates(
            op in commutative_op(),
            a in any::<u64>(),
            b in any::<u64>(),
            a_is_abs in any::<bool>(),
            b_is_abs in any::<bool>(),
        ) {
            let base = Rc::new(crate::operand::RelBaseCell { id: 1, kind: crate::operand::RelBaseKind::Extern });
            let lhs = if a_is_abs { operand::make_abs(a) } else { operand::make_rel_disp(base.clone(), a) };
            let rhs = if b_is_abs { operand::make_abs(b) } else { operand::make_rel_disp(base, b) };
            let (mut proc, id) = binop_block(op, lhs, rhs);
            simplify(&mut proc, id);
            if let InsnKind::BinOp { lhs, rhs, .. } = &proc.insn(id).kind {
                let lhs_abs = operand::is_abs(lhs);
                let rhs_not_imm = !operand::is_imm(rhs);
                let both_abs = lhs_abs && operand::is_abs(rhs);
                prop_assert_eq!(lhs_abs, rhs_not_imm || both_abs);
            }
        }

        /// T5: simplify is idempotent — a second call on an
        /// already-simplified instruction reports no further change.
        #[test]
        fn simplify_is_idempotent_over_random_binops(
            op in any_binop(),
            a in any::<u64>(),
            b in any::<u64>(),
        ) {
            let (mut proc, id) = binop_block(op, operand::make_abs(a), operand::make_abs(b));
            simplify(&mut proc, id);
            prop_assert!(!simplify(&mut proc, id));
        }

        /// T7: constant folding over two `abs` operands matches a
        /// reference interpreter, for every non-trapping binop input.
        #[test]
        fn constant_folding_matches_reference_interpreter(
            op in any_binop(),
            a in any::<u64>(),
            b in any::<u64>(),
        ) {
            let (mut proc, id) = binop_block(op, operand::make_abs(a), operand::make_abs(b));
            simplify(&mut proc, id);
            if let InsnKind::Mov { src, .. } = &proc.insn(id).kind {
                if let Some(folded) = operand::abs_value(src) {
                    prop_assert_eq!(folded, reference_eval(op, a, b));
                }
            }
        }

        /// T8: shift counts outside [0,63] are masked to 6 bits.
        #[test]
        fn shift_count_is_masked_for_any_count(count in any::<u64>(), value in any::<u64>()) {
            let (mut proc, id) = binop_block(BinOp::Shl, operand::make_abs(value), operand::make_abs(count));
            simplify(&mut proc, id);
            if let InsnKind::Mov { src, .. } = &proc.insn(id).kind {
                let folded = operand::abs_value(src).expect("both operands are abs, so this always folds");
                prop_assert_eq!(folded, value.wrapping_shl((count & 0x3F) as u32));
            }
        }

        /// T9: signed divide/rem by -1 of INT64_MIN, and any divide/rem
        /// by a literal zero, always trap.
        #[test]
        fn division_traps_match_the_spec(a in any::<u64>(), op in prop_oneof![Just(BinOp::UDiv), Just(BinOp::URem), Just(BinOp::SDiv), Just(BinOp::SRem)]) {
            let (mut proc, id) = binop_block(op, operand::make_abs(a), operand::make_abs(0));
            simplify(&mut proc, id);
            prop_assert!(matches!(proc.insn(id).kind, InsnKind::Oops));

            if matches!(op, BinOp::SDiv | BinOp::SRem) {
                let (mut proc, id) = binop_block(op, operand::make_abs(i64::MIN as u64), operand::make_abs((-1i64) as u64));
                simplify(&mut proc, id);
                prop_assert!(matches!(proc.insn(id).kind, InsnKind::Oops));
            }
        }
    }
}
