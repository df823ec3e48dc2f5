//! Storage assignment
//!
//! Decides, per function, where each parameter and local lives: a dedicated
//! symbolic register, or a slot in the activation frame. A variable that any
//! other function reads or writes must be memory-resident, because registers
//! are not visible across activations; everything else gets a register.

use std::collections::BTreeMap;
use vega_common::program::{Function, Program, VariableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Register,
}

/// Storage decision for every frame variable of `function`, keyed in
/// declaration order (parameters first).
pub fn assign_storage(function: &Function, program: &Program) -> BTreeMap<VariableId, StorageKind> {
    function
        .frame_variables()
        .map(|var| {
            let kind = if program.properties_of(var).is_local_only() {
                StorageKind::Register
            } else {
                StorageKind::Memory
            };
            (var, kind)
        })
        .collect()
}
