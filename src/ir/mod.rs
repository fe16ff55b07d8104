//! The CFG model: a procedure owns an ordered list of basic blocks, each
//! owning an ordered list of instructions. Implemented as arenas indexed
//! by newtype handles (`BlockId`, `InsnId`) with intrusive doubly-linked
//! ordering inside each arena slot, so insertion, detachment, and
//! reattachment stay O(1) while the arena itself is a plain growable
//! vector. Equivalent in spirit to a pointer-based ownership tree with
//! reference-counted owned handles; arenas were chosen because Rust's
//! borrow checker makes a mutable intrusive pointer graph painful to
//! express directly.

pub mod insn;

use std::cell::RefCell;
use std::rc::Rc;

pub use insn::{BinOp, BrOp, InsnKind};

use crate::operand::RelId;

/// A procedure, shared so it can also be referenced as a `proc` operand
/// by call instructions elsewhere in the same or another procedure.
pub type ProcHandle = Rc<RefCell<Procedure>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsnId(usize);

pub struct BlockSlot {
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    pub head: Option<InsnId>,
    pub rear: Option<InsnId>,
    /// Scratch: current predecessor list, recomputed by `update_cfg_preds`.
    pub preds: Vec<BlockId>,
    /// Scratch: postorder / reverse-postorder number used by SSA construction.
    pub number: i64,
    /// Scratch: visited flag used by whichever reachability walk currently runs.
    pub visited: bool,
    /// Scratch: count of predecessor edges already renamed into this block's phis.
    pub phi_arg_index: usize,
    live: bool,
}

pub struct InsnSlot {
    pub prev: Option<InsnId>,
    pub next: Option<InsnId>,
    pub owner: BlockId,
    pub kind: InsnKind,
    /// Scratch: visited flag used by dataflow passes' backward/forward walks.
    pub visited: bool,
    live: bool,
}

pub struct Procedure {
    pub id: RelId,
    /// Identity of the [`ProcHandle`] this procedure lives behind, set by
    /// [`make_procedure`]. Comparing this `usize` against
    /// `Rc::as_ptr(&other_handle)` lets the simplifier detect a
    /// self-recursive call without borrowing `other_handle` — which
    /// would panic when `other_handle` is the very `RefCell` currently
    /// borrowed mutably to produce this `&mut Procedure`.
    pub self_ptr: usize,
    block_head: Option<BlockId>,
    block_rear: Option<BlockId>,
    blocks: Vec<BlockSlot>,
    insns: Vec<InsnSlot>,
}

impl Procedure {
    pub fn new(id: RelId) -> Self {
        Procedure { id, self_ptr: 0, block_head: None, block_rear: None, blocks: Vec::new(), insns: Vec::new() }
    }

    pub fn block_head(&self) -> Option<BlockId> {
        self.block_head
    }

    pub fn block_rear(&self) -> Option<BlockId> {
        self.block_rear
    }

    pub fn block_live(&self, id: BlockId) -> bool {
        self.blocks[id.0].live
    }

    pub fn block(&self, id: BlockId) -> &BlockSlot {
        let s = &self.blocks[id.0];
        debug_assert!(s.live, "use of eliminated block");
        s
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BlockSlot {
        let s = &mut self.blocks[id.0];
        debug_assert!(s.live, "use of eliminated block");
        s
    }

    pub fn insn(&self, id: InsnId) -> &InsnSlot {
        let s = &self.insns[id.0];
        debug_assert!(s.live, "use of eliminated instruction");
        s
    }

    pub fn insn_mut(&mut self, id: InsnId) -> &mut InsnSlot {
        let s = &mut self.insns[id.0];
        debug_assert!(s.live, "use of eliminated instruction");
        s
    }

    /// Every live block, head to rear.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut v = Vec::new();
        let mut cur = self.block_head;
        while let Some(b) = cur {
            v.push(b);
            cur = self.block(b).next;
        }
        v
    }

    /// Every live instruction of `block`, head to rear.
    pub fn insn_ids(&self, block: BlockId) -> Vec<InsnId> {
        let mut v = Vec::new();
        let mut cur = self.block(block).head;
        while let Some(i) = cur {
            v.push(i);
            cur = self.insn(i).next;
        }
        v
    }

    /// Creates a new empty block appended at the rear of the procedure.
    pub fn make_bblock(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BlockSlot {
            prev: self.block_rear,
            next: None,
            head: None,
            rear: None,
            preds: Vec::new(),
            number: -1,
            visited: false,
            phi_arg_index: 0,
            live: true,
        });
        if let Some(rear) = self.block_rear {
            self.block_mut(rear).next = Some(id);
        } else {
            self.block_head = Some(id);
        }
        self.block_rear = Some(id);
        id
    }

    /// Creates a new empty block immediately before `sibling`.
    pub fn make_bblock_before(&mut self, sibling: BlockId) -> BlockId {
        let prev = self.block(sibling).prev;
        let id = BlockId(self.blocks.len());
        self.blocks.push(BlockSlot {
            prev,
            next: Some(sibling),
            head: None,
            rear: None,
            preds: Vec::new(),
            number: -1,
            visited: false,
            phi_arg_index: 0,
            live: true,
        });
        match prev {
            Some(p) => self.block_mut(p).next = Some(id),
            None => self.block_head = Some(id),
        }
        self.block_mut(sibling).prev = Some(id);
        id
    }

    /// Creates a new empty block immediately after `sibling`.
    pub fn make_bblock_after(&mut self, sibling: BlockId) -> BlockId {
        match self.block(sibling).next {
            Some(next) => self.make_bblock_before(next),
            None => self.make_bblock(),
        }
    }

    fn push_insn_slot(&mut self, owner: BlockId, kind: InsnKind) -> InsnId {
        let id = InsnId(self.insns.len());
        self.insns.push(InsnSlot { prev: None, next: None, owner, kind, visited: false, live: true });
        id
    }

    /// Appends an instruction at the rear of `block`.
    pub fn append_insn(&mut self, block: BlockId, kind: InsnKind) -> InsnId {
        let id = self.push_insn_slot(block, kind);
        let rear = self.block(block).rear;
        self.insn_mut(id).prev = rear;
        match rear {
            Some(r) => self.insn_mut(r).next = Some(id),
            None => self.block_mut(block).head = Some(id),
        }
        self.block_mut(block).rear = Some(id);
        id
    }

    /// Inserts an instruction immediately before `sibling`, in the same block.
    pub fn insert_insn_before(&mut self, sibling: InsnId, kind: InsnKind) -> InsnId {
        let owner = self.insn(sibling).owner;
        let prev = self.insn(sibling).prev;
        let id = self.push_insn_slot(owner, kind);
        self.insn_mut(id).prev = prev;
        self.insn_mut(id).next = Some(sibling);
        match prev {
            Some(p) => self.insn_mut(p).next = Some(id),
            None => self.block_mut(owner).head = Some(id),
        }
        self.insn_mut(sibling).prev = Some(id);
        id
    }

    /// Detaches and destroys an instruction.
    pub fn eliminate_insn(&mut self, id: InsnId) {
        let (prev, next, owner) = {
            let s = self.insn(id);
            (s.prev, s.next, s.owner)
        };
        match prev {
            Some(p) => self.insn_mut(p).next = next,
            None => self.block_mut(owner).head = next,
        }
        match next {
            Some(n) => self.insn_mut(n).prev = prev,
            None => self.block_mut(owner).rear = prev,
        }
        self.insns[id.0].live = false;
    }

    /// Detaches and destroys a block, along with every instruction it owns.
    pub fn eliminate_block(&mut self, id: BlockId) {
        for i in self.insn_ids(id) {
            self.insns[i.0].live = false;
        }
        let (prev, next) = {
            let s = self.block(id);
            (s.prev, s.next)
        };
        match prev {
            Some(p) => self.block_mut(p).next = next,
            None => self.block_head = next,
        }
        match next {
            Some(n) => self.block_mut(n).prev = prev,
            None => self.block_rear = prev,
        }
        self.blocks[id.0].live = false;
    }

    /// Detaches `id` from its current owner and appends it at the rear
    /// of `target`, without destroying it.
    pub fn reattach_insn(&mut self, id: InsnId, target: BlockId) {
        let (prev, next, owner) = {
            let s = self.insn(id);
            (s.prev, s.next, s.owner)
        };
        match prev {
            Some(p) => self.insn_mut(p).next = next,
            None => self.block_mut(owner).head = next,
        }
        match next {
            Some(n) => self.insn_mut(n).prev = prev,
            None => self.block_mut(owner).rear = prev,
        }
        let rear = self.block(target).rear;
        self.insn_mut(id).prev = rear;
        self.insn_mut(id).next = None;
        self.insn_mut(id).owner = target;
        match rear {
            Some(r) => self.insn_mut(r).next = Some(id),
            None => self.block_mut(target).head = Some(id),
        }
        self.block_mut(target).rear = Some(id);
    }

    /// Splits `block` so that everything from `insn` (inclusive) to the
    /// block's terminator moves into a freshly created block appended
    /// immediately after it. The original block is left without a
    /// terminator — the caller must append one (typically the guard
    /// branch for a divide/modulo trap). Returns the new block.
    pub fn split_before(&mut self, insn: InsnId) -> BlockId {
        let owner = self.insn(insn).owner;
        let new_block = self.make_bblock_after(owner);

        let before = self.insn(insn).prev;
        let old_rear = self.block(owner).rear;

        match before {
            Some(p) => self.insn_mut(p).next = None,
            None => self.block_mut(owner).head = None,
        }
        self.block_mut(owner).rear = before;

        self.insn_mut(insn).prev = None;
        self.block_mut(new_block).head = Some(insn);
        self.block_mut(new_block).rear = old_rear;

        let mut cur = Some(insn);
        while let Some(c) = cur {
            self.insn_mut(c).owner = new_block;
            cur = self.insn(c).next;
        }
        new_block
    }
}

/// Creates a procedure behind a shareable handle and records its own
/// identity on it, so later code can compare handle identity (see
/// [`Procedure::self_ptr`]) without ever borrowing the `RefCell`.
pub fn make_procedure(id: RelId) -> ProcHandle {
    let handle = Rc::new(RefCell::new(Procedure::new(id)));
    let ptr = Rc::as_ptr(&handle) as usize;
    handle.borrow_mut().self_ptr = ptr;
    handle
}
