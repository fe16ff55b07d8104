//! Fixed-point pipeline driver.

use crate::dataflow;
use crate::ir::Procedure;

/// Bounds the optimizer's iteration count. A generous but finite
/// default means a malformed or adversarial input can never wedge the
/// pipeline in an unbounded loop; hitting the bound is logged and the
/// procedure is returned as-is, in whatever well-formed state it has
/// already reached, rather than panicking.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub max_iterations: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { max_iterations: 1000 }
    }
}

/// Runs the optimization pipeline to a fixed point (or until
/// [`PipelineConfig::max_iterations`] sweeps have run) on `proc`.
pub fn optimize(proc: &mut Procedure) {
    optimize_with_config(proc, PipelineConfig::default());
}

pub fn optimize_with_config(proc: &mut Procedure, config: PipelineConfig) {
    dataflow::update_cfg_preds(proc);
    let mut iterations = 0;
    loop {
        dataflow::update_cfg_preds(proc);
        let mut changed = dataflow::transform_const_propag(proc);
        changed |= dataflow::transform_copy_propag(proc);
        changed |= dataflow::transform_dce(proc);
        changed |= dataflow::transform_cfg_gc(proc);
        changed |= dataflow::transform_insn_simplify(proc);
        changed |= dataflow::transform_cfg_merge(proc);

        iterations += 1;
        if !changed {
            log::trace!("pipeline: reached fixed point after {} sweep(s)", iterations);
            break;
        }
        if iterations >= config.max_iterations {
            log::warn!("pipeline: stopped after {} sweep(s) without reaching a fixed point", iterations);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinOp, InsnKind};
    use crate::operand;

    #[test]
    fn folds_constant_addition_and_shrinks_the_block() {
        let mut proc = Procedure::new(1);
        let entry = proc.make_bblock();
        let dest = operand::make_vreg_cell();
        proc.append_insn(entry, InsnKind::Entry { outputs: Vec::new() });
        let add = proc.append_insn(
            entry,
            InsnKind::BinOp { op: BinOp::Add, lhs: operand::make_abs(3), rhs: operand::make_abs(4), dest: dest.clone() },
        );
        proc.append_insn(entry, InsnKind::Ret { inputs: vec![operand::Operand::VReg(dest)] });

        let before = proc.insn_ids(entry).len();
        optimize(&mut proc);
        let after = proc.insn_ids(entry).len();
        assert!(after < before, "constant folding should shrink the block");
        assert!(matches!(proc.insn(add).kind, InsnKind::Mov { .. }));
    }

    #[test]
    fn reaches_a_fixed_point_on_its_own_output() {
        let mut proc = Procedure::new(2);
        let entry = proc.make_bblock();
        let dest = operand::make_vreg_cell();
        proc.append_insn(entry, InsnKind::Entry { outputs: Vec::new() });
        proc.append_insn(
            entry,
            InsnKind::BinOp { op: BinOp::Add, lhs: operand::make_abs(1), rhs: operand::make_abs(1), dest: dest.clone() },
        );
        proc.append_insn(entry, InsnKind::Ret { inputs: vec![operand::Operand::VReg(dest)] });

        optimize(&mut proc);
        let snapshot_len = proc.block_ids().iter().map(|&b| proc.insn_ids(b).len()).sum::<usize>();
        optimize(&mut proc);
        let second_len = proc.block_ids().iter().map(|&b| proc.insn_ids(b).len()).sum::<usize>();
        assert_eq!(snapshot_len, second_len);
    }
}
