//! Ambient diagnostic layer. The optimization algorithms never return a
//! `Result`: breaking a structural invariant is a programmer error, not a
//! runtime condition. `validate` exists for tests and integration
//! boundaries that want to assert well-formedness explicitly.

use thiserror::Error;

use crate::ir::{BlockId, InsnId, Procedure};

/// A structural invariant violated in a [`Procedure`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("block {0:?} has no terminator")]
    MissingTerminator(BlockId),
    #[error("block {0:?} has a terminator before its last instruction (insn {1:?})")]
    TerminatorNotLast(BlockId, InsnId),
    #[error("block {0:?} has more than one terminator")]
    DuplicateTerminator(BlockId),
    #[error("phi {0:?} in block {1:?} has {2} argument(s) but the block has {3} predecessor(s)")]
    PhiArityMismatch(InsnId, BlockId, usize, usize),
    #[error("phi {0:?} appears after the head of block {1:?}")]
    PhiNotAtHead(InsnId, BlockId),
    #[error("vreg is defined by more than one instruction (insns {0:?} and {1:?})")]
    MultipleDefinitions(InsnId, InsnId),
    #[error("block {0:?} is not reachable from the entry block")]
    Unreachable(BlockId),
}

/// Checks invariants I1-I2 always, and I4-I5 (phi arity, single definition)
/// whenever the procedure contains any phi instruction. I3 (every use
/// dominated by its definition) is the job of the SSA construction
/// algorithm itself and is not independently re-verified here.
pub fn validate(proc: &Procedure) -> Result<(), ValidationError> {
    use crate::ir::InsnKind;

    let mut seen_defs: std::collections::HashMap<usize, InsnId> = std::collections::HashMap::new();

    let mut bb = proc.block_head();
    while let Some(b) = bb {
        let block = proc.block(b);
        let mut insn = block.head;
        let mut saw_terminator = false;
        let mut last = None;
        let mut phi_count_passed_non_phi = false;
        while let Some(i) = insn {
            let slot = proc.insn(i);
            if saw_terminator {
                if slot.kind.is_terminator() {
                    return Err(ValidationError::DuplicateTerminator(b));
                }
                return Err(ValidationError::TerminatorNotLast(b, i));
            }
            if matches!(slot.kind, InsnKind::Phi { .. }) {
                if phi_count_passed_non_phi {
                    return Err(ValidationError::PhiNotAtHead(i, b));
                }
            } else {
                phi_count_passed_non_phi = true;
            }
            if let InsnKind::Phi { args, .. } = &slot.kind {
                let preds = proc.block(b).preds.len();
                if args.len() != preds {
                    return Err(ValidationError::PhiArityMismatch(i, b, args.len(), preds));
                }
            }
            for out in slot.kind.outputs() {
                let key = std::rc::Rc::as_ptr(&out) as usize;
                if let Some(prev) = seen_defs.insert(key, i) {
                    return Err(ValidationError::MultipleDefinitions(prev, i));
                }
            }
            if slot.kind.is_terminator() {
                saw_terminator = true;
            }
            last = Some(i);
            insn = slot.next;
        }
        if last.is_none() || !saw_terminator {
            return Err(ValidationError::MissingTerminator(b));
        }
        bb = block.next;
    }

    let mut visited = std::collections::HashSet::new();
    let mut stack = vec![proc.block_head()];
    while let Some(Some(b)) = stack.pop() {
        if !visited.insert(b) {
            continue;
        }
        for t in proc.block(b).rear.map(|r| proc.insn(r).kind.targets()).unwrap_or_default() {
            stack.push(Some(t));
        }
    }
    let mut bb = proc.block_head();
    while let Some(b) = bb {
        if !visited.contains(&b) {
            return Err(ValidationError::Unreachable(b));
        }
        bb = proc.block(b).next;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InsnKind;
    use crate::operand;

    #[test]
    fn well_formed_procedure_validates() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        proc.append_insn(b, InsnKind::Entry { outputs: Vec::new() });
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });
        assert_eq!(validate(&proc), Ok(()));
    }

    #[test]
    fn block_without_a_terminator_is_rejected() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        proc.append_insn(b, InsnKind::Entry { outputs: Vec::new() });
        assert_eq!(validate(&proc), Err(ValidationError::MissingTerminator(b)));
    }

    #[test]
    fn duplicate_terminator_is_rejected() {
        let mut proc = Procedure::new(1);
        let b = proc.make_bblock();
        proc.append_insn(b, InsnKind::Entry { outputs: Vec::new() });
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });
        assert_eq!(validate(&proc), Err(ValidationError::DuplicateTerminator(b)));
    }

    #[test]
    fn unreachable_block_is_rejected() {
        let mut proc = Procedure::new(1);
        let entry = proc.make_bblock();
        proc.append_insn(entry, InsnKind::Ret { inputs: Vec::new() });
        let orphan = proc.make_bblock();
        proc.append_insn(orphan, InsnKind::Ret { inputs: Vec::new() });
        assert_eq!(validate(&proc), Err(ValidationError::Unreachable(orphan)));
    }

    #[test]
    fn phi_arity_mismatch_is_rejected() {
        let mut proc = Procedure::new(1);
        let entry = proc.make_bblock();
        let b = proc.make_bblock();
        proc.append_insn(entry, InsnKind::Jmp { target: b });
        let dest = operand::make_vreg_cell();
        let phi = proc.append_insn(b, InsnKind::Phi { args: vec![operand::make_abs(0), operand::make_abs(1)], dest });
        proc.append_insn(b, InsnKind::Ret { inputs: Vec::new() });
        crate::dataflow::update_cfg_preds(&mut proc);
        assert_eq!(validate(&proc), Err(ValidationError::PhiArityMismatch(phi, b, 2, 1)));
    }
}
