//! Vega Compiler - Intermediate Representation
//!
//! This crate defines the tree-shaped intermediate form the backend works
//! on: operation nodes held in a per-function arena, symbolic and physical
//! registers, and the control flow graph connecting tree roots. Nodes are
//! immutable once allocated and identified by their arena handle, so two
//! structurally identical trees are distinct vertices unless the same
//! handle is reused intentionally.

pub mod cfg;
pub mod node;
pub mod register;

pub use cfg::{ControlFlowGraph, ControlFlowGraphBuilder, IrError, LinkType};
pub use node::{BinaryIrOp, IrArena, IrNode, NodeId, UnaryIrOp};
pub use register::{PhysReg, Register, RegisterPool};
