//! A readable textual dump of a procedure, orthogonal to the
//! optimization algorithms themselves: used only by tests and
//! diagnostics, never consulted by any pass.

use std::fmt::Write;
use std::rc::Rc;

use crate::ir::{BinOp, BrOp, InsnKind, Procedure};
use crate::operand::{Operand, VRegCell};

fn vreg_name(v: &Rc<VRegCell>) -> String {
    format!("%v{:x}", Rc::as_ptr(v) as usize & 0xffff)
}

fn operand_text(op: &Operand) -> String {
    match op {
        Operand::Abs(c) => format!("{}", c.val),
        Operand::VReg(v) => vreg_name(v),
        Operand::RelBase(c) => format!("@{:x}", c.id & 0xffff),
        Operand::RelDisp(c) => format!("@{:x}+{}", c.base.id & 0xffff, c.add),
    }
}

fn binop_mnemonic(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::UMul => "umul",
        BinOp::UDiv => "udiv",
        BinOp::URem => "urem",
        BinOp::SMul => "smul",
        BinOp::SDiv => "sdiv",
        BinOp::SRem => "srem",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Shl => "shl",
        BinOp::UShr => "ushr",
        BinOp::SShr => "sshr",
    }
}

fn br_mnemonic(op: BrOp) -> &'static str {
    match op {
        BrOp::Beq => "beq",
        BrOp::Bult => "bult",
        BrOp::Bslt => "bslt",
    }
}

/// Renders `proc` as an assembly-like listing: one line per basic
/// block, one line per instruction.
pub fn dump(proc: &Procedure) -> String {
    let mut out = String::new();
    for b in proc.block_ids() {
        let _ = writeln!(out, "bb{}:", b_short(proc, b));
        for i in proc.insn_ids(b) {
            let line = match &proc.insn(i).kind {
                InsnKind::Entry { outputs } => format!("  entry {}", outputs.iter().map(vreg_name).collect::<Vec<_>>().join(", ")),
                InsnKind::Ret { inputs } => format!("  ret {}", inputs.iter().map(operand_text).collect::<Vec<_>>().join(", ")),
                InsnKind::Call { callee, inputs, outputs } => format!(
                    "  {} = call {}({})",
                    outputs.iter().map(vreg_name).collect::<Vec<_>>().join(", "),
                    operand_text(callee),
                    inputs.iter().map(operand_text).collect::<Vec<_>>().join(", ")
                ),
                InsnKind::Mov { src, dest } => format!("  {} = mov {}", vreg_name(dest), operand_text(src)),
                InsnKind::Load { addr, dest } => format!("  {} = load [{}]", vreg_name(dest), operand_text(addr)),
                InsnKind::Store { src, dest } => format!("  store {}, [{}]", operand_text(src), operand_text(dest)),
                InsnKind::BinOp { op, lhs, rhs, dest } => {
                    format!("  {} = {} {}, {}", vreg_name(dest), binop_mnemonic(*op), operand_text(lhs), operand_text(rhs))
                }
                InsnKind::Jmp { target } => format!("  jmp bb{}", b_short(proc, *target)),
                InsnKind::Br { op, lhs, rhs, taken, not_taken } => format!(
                    "  {} {}, {}, bb{}, bb{}",
                    br_mnemonic(*op),
                    operand_text(lhs),
                    operand_text(rhs),
                    b_short(proc, *taken),
                    b_short(proc, *not_taken)
                ),
                InsnKind::SwitchBr { index, targets } => format!(
                    "  switch_br {} [{}]",
                    operand_text(index),
                    targets.iter().map(|t| format!("bb{}", b_short(proc, *t))).collect::<Vec<_>>().join(", ")
                ),
                InsnKind::Oops => "  oops".to_string(),
                InsnKind::Phi { args, dest } => {
                    format!("  {} = phi {}", vreg_name(dest), args.iter().map(operand_text).collect::<Vec<_>>().join(", "))
                }
            };
            let _ = writeln!(out, "{}", line);
        }
    }
    out
}

fn b_short(proc: &Procedure, b: crate::ir::BlockId) -> usize {
    proc.block_ids().iter().position(|&x| x == b).unwrap_or(usize::MAX)
}
