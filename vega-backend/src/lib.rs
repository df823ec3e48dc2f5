//! Vega Compiler - Function Activation Model and IR Generation
//!
//! This crate turns the resolved program into per-function control flow
//! graphs. It owns:
//!
//! - storage assignment (register vs. frame slot per variable)
//! - activation frames: prologue, epilogue, call sequences, and the
//!   depth-indexed display for nested-function variable access
//! - global variable access through the reserved `globals` block
//! - deterministic label mangling
//! - lowering of statements and expressions to CFGs

pub mod frame;
pub mod globals;
pub mod lower;
pub mod naming;
pub mod storage;

pub use frame::{FrameDescriptor, FrameError, FunctionCall, DISPLAY_LABEL, MEMORY_UNIT_SIZE};
pub use globals::{GlobalAccess, GLOBALS_LABEL};
pub use lower::{lower_program, LoweredFunction, LoweredProgram};
pub use naming::{LabelFactory, NamingError};
pub use storage::{assign_storage, StorageKind};
