//! Vega Compiler - Instruction Selection, Register Allocation and Emission
//!
//! The low-level half of the backend. It consumes per-function control flow
//! graphs and produces the final NASM listing:
//!
//! - addressing-mode operands and the target instruction set
//! - tree-pattern instruction selection (min-cost covering)
//! - linearization of the CFG into labels, jumps and instructions
//! - liveness analysis, interference and copy graphs
//! - graph-coloring register allocation with move coalescing
//! - program emission (externs, entry trampoline, reserved storage)

pub mod addressing;
pub mod emit;
pub mod instruction;
pub mod linearization;
pub mod liveness;
pub mod patterns;
pub mod regalloc;

pub use addressing::{Addressing, MemoryAddress, Scale};
pub use emit::{CodeImage, EmitError, FunctionCode};
pub use instruction::{Asmable, Condition, Instruction};
pub use linearization::linearize;
pub use liveness::{compute_liveness, LivenessGraphs};
pub use patterns::{Context, InstructionSet, Match, Pattern, SelectionError};
pub use regalloc::{allocate_registers, Allocation, RegAllocError};
