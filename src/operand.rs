//! Operand model: small, reference-counted, immutable value kinds plus the
//! one mutable kind (`vreg`). Equality between operands is IDENTITY
//! equality, never value equality — there is deliberately no
//! `PartialEq` impl on [`Operand`] so that a stray `==` cannot silently
//! compare pointee values instead of identity. Use [`same`] or the
//! value-accessor helpers below.

use std::cell::Cell;
use std::rc::Rc;

use crate::ir::ProcHandle;

/// 128-bit content hash identifying a relocatable symbol.
pub type RelId = u128;

/// A shared, reference-counted operand.
#[derive(Clone)]
pub enum Operand {
    Abs(Rc<AbsCell>),
    RelBase(Rc<RelBaseCell>),
    RelDisp(Rc<RelDispCell>),
    VReg(Rc<VRegCell>),
}

pub struct AbsCell {
    pub val: u64,
}

pub enum RelBaseKind {
    /// An externally-defined symbol with no body known to this procedure.
    Extern,
    Proc(ProcHandle),
    Data(Rc<DataObject>),
}

pub struct RelBaseCell {
    pub id: RelId,
    pub kind: RelBaseKind,
}

pub struct RelDispCell {
    pub base: Rc<RelBaseCell>,
    pub add: u64,
}

pub struct DataObject {
    pub id: RelId,
    pub items: std::cell::RefCell<Vec<Operand>>,
}

/// A virtual register. Its identity, not any payload, is what matters;
/// the only state it carries is scratch numbering used transiently by
/// passes (cleared at the start of whichever pass currently owns it).
pub struct VRegCell {
    pub number: Cell<i64>,
}

impl VRegCell {
    fn fresh() -> Rc<Self> {
        Rc::new(VRegCell { number: Cell::new(-1) })
    }
}

thread_local! {
    static ABS_ZERO: Operand = Operand::Abs(Rc::new(AbsCell { val: 0 }));
    static ABS_ONE: Operand = Operand::Abs(Rc::new(AbsCell { val: 1 }));
}

pub fn make_abs(val: u64) -> Operand {
    match val {
        0 => ABS_ZERO.with(|o| o.clone()),
        1 => ABS_ONE.with(|o| o.clone()),
        _ => Operand::Abs(Rc::new(AbsCell { val })),
    }
}

pub fn make_extern(id: RelId) -> Operand {
    Operand::RelBase(Rc::new(RelBaseCell { id, kind: RelBaseKind::Extern }))
}

pub fn make_proc_operand(id: RelId, proc: ProcHandle) -> Operand {
    Operand::RelBase(Rc::new(RelBaseCell { id, kind: RelBaseKind::Proc(proc) }))
}

pub fn make_data(id: RelId, items: Vec<Operand>) -> Rc<DataObject> {
    Rc::new(DataObject { id, items: std::cell::RefCell::new(items) })
}

pub fn make_data_operand(data: Rc<DataObject>) -> Operand {
    let id = data.id;
    Operand::RelBase(Rc::new(RelBaseCell { id, kind: RelBaseKind::Data(data) }))
}

/// Builds a `rel_disp`, folding a zero addendum back to the bare base.
pub fn make_rel_disp(base: Rc<RelBaseCell>, add: u64) -> Operand {
    if add == 0 {
        Operand::RelBase(base)
    } else {
        Operand::RelDisp(Rc::new(RelDispCell { base, add }))
    }
}

pub fn make_vreg() -> Operand {
    Operand::VReg(VRegCell::fresh())
}

pub fn make_vreg_cell() -> Rc<VRegCell> {
    VRegCell::fresh()
}

// --- variant queries -------------------------------------------------

pub fn is_abs(op: &Operand) -> bool {
    matches!(op, Operand::Abs(_))
}

pub fn is_vreg(op: &Operand) -> bool {
    matches!(op, Operand::VReg(_))
}

pub fn is_rel(op: &Operand) -> bool {
    matches!(op, Operand::RelBase(_) | Operand::RelDisp(_))
}

/// `abs`, `rel_base`, or `rel_disp` — anything whose value is known at
/// compile time (as opposed to a `vreg`).
pub fn is_imm(op: &Operand) -> bool {
    !is_vreg(op)
}

pub fn is_proc(op: &Operand) -> bool {
    matches!(op, Operand::RelBase(c) if matches!(c.kind, RelBaseKind::Proc(_)))
}

pub fn as_proc(op: &Operand) -> Option<ProcHandle> {
    match op {
        Operand::RelBase(c) => match &c.kind {
            RelBaseKind::Proc(p) => Some(p.clone()),
            _ => None,
        },
        _ => None,
    }
}

pub fn abs_value(op: &Operand) -> Option<u64> {
    match op {
        Operand::Abs(c) => Some(c.val),
        _ => None,
    }
}

pub fn as_vreg(op: &Operand) -> Option<&Rc<VRegCell>> {
    match op {
        Operand::VReg(v) => Some(v),
        _ => None,
    }
}

/// `(symbol id, addendum)` for any relocatable operand (addendum 0 for
/// a bare `rel_base`), used to test whether two relocatables name the
/// same location.
pub fn rel_id_and_add(op: &Operand) -> Option<(RelId, u64)> {
    match op {
        Operand::RelBase(c) => Some((c.id, 0)),
        Operand::RelDisp(c) => Some((c.base.id, c.add)),
        _ => None,
    }
}

// --- identity equality -------------------------------------------------

/// Identity equality: the two operands are the SAME object, not merely
/// equal in value. This is the only equality the core ever uses between
/// two arbitrary operands.
pub fn same(a: &Operand, b: &Operand) -> bool {
    match (a, b) {
        (Operand::Abs(x), Operand::Abs(y)) => Rc::ptr_eq(x, y),
        (Operand::RelBase(x), Operand::RelBase(y)) => Rc::ptr_eq(x, y),
        (Operand::RelDisp(x), Operand::RelDisp(y)) => Rc::ptr_eq(x, y),
        (Operand::VReg(x), Operand::VReg(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

pub fn same_vreg(a: &Rc<VRegCell>, b: &Rc<VRegCell>) -> bool {
    Rc::ptr_eq(a, b)
}

/// Value equality for immediates used by constant folding and
/// propagation: same absolute value, or the same relocatable symbol
/// with the same addendum.
pub fn same_value(a: &Operand, b: &Operand) -> bool {
    match (abs_value(a), abs_value(b)) {
        (Some(x), Some(y)) => return x == y,
        (None, None) => {}
        _ => return false,
    }
    match (rel_id_and_add(a), rel_id_and_add(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
