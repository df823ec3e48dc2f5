//! IR node model
//!
//! One node is one operation in an expression or effect tree. Nodes are
//! allocated in an [`IrArena`] and referenced by [`NodeId`] handles;
//! children are handles too, so intentionally shared subtrees form a DAG.
//! A node is immutable after allocation. Identity is handle identity:
//! allocating the same shape twice yields two distinct vertices.

use crate::register::Register;

/// Stable handle of a node within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Binary operations with a logical result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryIrOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    Equals,
    NotEquals,
    LessThan,
    LessEquals,
    GreaterThan,
    GreaterEquals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryIrOp {
    /// Arithmetic negation.
    Negate,
    /// Bitwise complement.
    BitNot,
    /// Boolean negation of a 0/1 value.
    LogicalNot,
}

/// One operation of the intermediate form.
#[derive(Debug, Clone, PartialEq)]
pub enum IrNode {
    Const(i64),
    /// Address of an assembler label.
    MemoryLabel(String),
    MemoryRead(NodeId),
    MemoryWrite {
        address: NodeId,
        value: NodeId,
    },
    RegisterRead(Register),
    RegisterWrite {
        register: Register,
        value: NodeId,
    },
    Binary {
        op: BinaryIrOp,
        left: NodeId,
        right: NodeId,
    },
    Unary {
        op: UnaryIrOp,
        operand: NodeId,
    },
    StackPush(NodeId),
    StackPop,
    /// Call to a code label. `uses` are the argument registers filled before
    /// the call; `defines` are the registers the callee may clobber. Both
    /// feed liveness directly.
    Call {
        target: String,
        uses: Vec<Register>,
        defines: Vec<Register>,
    },
    NoOp,
}

impl IrNode {
    /// Whether the node has a logical result. A node used in a value
    /// context must; a node used purely for effect must not.
    pub fn has_value(&self) -> bool {
        match self {
            IrNode::Const(_)
            | IrNode::MemoryLabel(_)
            | IrNode::MemoryRead(_)
            | IrNode::RegisterRead(_)
            | IrNode::Binary { .. }
            | IrNode::Unary { .. }
            | IrNode::StackPop => true,
            IrNode::MemoryWrite { .. }
            | IrNode::RegisterWrite { .. }
            | IrNode::StackPush(_)
            | IrNode::Call { .. }
            | IrNode::NoOp => false,
        }
    }
}

/// Owns the nodes of one function. Handles returned by [`IrArena::alloc`]
/// are valid for the lifetime of the arena and are never invalidated;
/// node replacement allocates a new node and remaps edges instead of
/// rewriting trees in place.
#[derive(Debug, Default)]
pub struct IrArena {
    nodes: Vec<IrNode>,
}

impl IrArena {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn alloc(&mut self, node: IrNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &IrNode {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // Construction helpers, used heavily by the frame and lowering passes.

    pub fn constant(&mut self, value: i64) -> NodeId {
        self.alloc(IrNode::Const(value))
    }

    pub fn memory_label(&mut self, label: impl Into<String>) -> NodeId {
        self.alloc(IrNode::MemoryLabel(label.into()))
    }

    pub fn memory_read(&mut self, address: NodeId) -> NodeId {
        self.alloc(IrNode::MemoryRead(address))
    }

    pub fn memory_write(&mut self, address: NodeId, value: NodeId) -> NodeId {
        self.alloc(IrNode::MemoryWrite { address, value })
    }

    pub fn register_read(&mut self, register: impl Into<Register>) -> NodeId {
        self.alloc(IrNode::RegisterRead(register.into()))
    }

    pub fn register_write(&mut self, register: impl Into<Register>, value: NodeId) -> NodeId {
        self.alloc(IrNode::RegisterWrite {
            register: register.into(),
            value,
        })
    }

    pub fn binary(&mut self, op: BinaryIrOp, left: NodeId, right: NodeId) -> NodeId {
        self.alloc(IrNode::Binary { op, left, right })
    }

    pub fn unary(&mut self, op: UnaryIrOp, operand: NodeId) -> NodeId {
        self.alloc(IrNode::Unary { op, operand })
    }

    pub fn stack_push(&mut self, value: NodeId) -> NodeId {
        self.alloc(IrNode::StackPush(value))
    }

    pub fn stack_pop(&mut self) -> NodeId {
        self.alloc(IrNode::StackPop)
    }

    pub fn call(
        &mut self,
        target: impl Into<String>,
        uses: Vec<Register>,
        defines: Vec<Register>,
    ) -> NodeId {
        self.alloc(IrNode::Call {
            target: target.into(),
            uses,
            defines,
        })
    }

    pub fn no_op(&mut self) -> NodeId {
        self.alloc(IrNode::NoOp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{PhysReg, RegisterPool};

    #[test]
    fn test_identical_shapes_are_distinct_vertices() {
        let mut arena = IrArena::new();
        let a = arena.constant(1);
        let b = arena.constant(1);
        assert_ne!(a, b);
        assert_eq!(arena.get(a), arena.get(b));
    }

    #[test]
    fn test_value_vs_effect_contexts() {
        let mut arena = IrArena::new();
        let mut pool = RegisterPool::new();
        let reg = pool.fresh();

        let value = arena.constant(3);
        let read = arena.register_read(reg);
        let write = arena.register_write(reg, value);
        let pop = arena.stack_pop();
        let call = arena.call("fun$f", vec![], vec![PhysReg::Rax.into()]);

        assert!(arena.get(value).has_value());
        assert!(arena.get(read).has_value());
        assert!(arena.get(pop).has_value());
        assert!(!arena.get(write).has_value());
        assert!(!arena.get(call).has_value());
    }

    #[test]
    fn test_shared_subtree() {
        let mut arena = IrArena::new();
        let shared = arena.constant(8);
        let left = arena.binary(BinaryIrOp::Add, shared, shared);
        match arena.get(left) {
            IrNode::Binary { left, right, .. } => assert_eq!(left, right),
            other => panic!("unexpected node: {:?}", other),
        }
    }
}
