//! Vega Compiler - Common Types and Utilities
//!
//! This crate contains the types shared between the backend passes: the
//! resolved program model delivered by the (out-of-scope) frontend, and the
//! error definitions used across the workspace.

pub mod error;
pub mod program;

pub use error::BackendError;
pub use program::{
    BinaryOp, Expr, Function, FunctionId, FunctionKind, Owner, Program, Stmt, Type, UnaryOp,
    Variable, VariableId, VariableProperties,
};
