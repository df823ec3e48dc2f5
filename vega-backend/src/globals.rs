//! Global variable access
//!
//! Globals live in a reserved block at the `globals` label, one slot per
//! variable, name-ordered so the layout is deterministic. Compile-time
//! constants occupy no slot; reads of them fold to the literal value.

use std::collections::BTreeMap;
use thiserror::Error;
use vega_common::program::{Program, VariableId};
use vega_ir::node::{BinaryIrOp, IrArena, NodeId};

/// Reserved label of the globals block.
pub const GLOBALS_LABEL: &str = "globals";

/// Size of one globals slot, in bytes.
pub const GLOBAL_SIZE: i64 = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GlobalAccessError {
    #[error("write to compile-time constant {0:?}")]
    WriteToConstant(VariableId),

    #[error("variable {0:?} is not a global")]
    NotAGlobal(VariableId),
}

/// Offset assignment and access-tree construction for global variables.
#[derive(Debug)]
pub struct GlobalAccess {
    offsets: BTreeMap<VariableId, i64>,
    constants: BTreeMap<VariableId, i64>,
}

impl GlobalAccess {
    pub fn new(program: &Program) -> Self {
        let mut offsets = BTreeMap::new();
        let mut constants = BTreeMap::new();
        let mut next_offset = 0;
        for var in program.global_variables() {
            match program.variable(var).constant_value {
                Some(value) => {
                    constants.insert(var, value);
                }
                None => {
                    offsets.insert(var, next_offset);
                    next_offset += GLOBAL_SIZE;
                }
            }
        }
        GlobalAccess { offsets, constants }
    }

    /// Number of slots the `globals` block needs.
    pub fn slot_count(&self) -> usize {
        self.offsets.len()
    }

    fn address(&self, arena: &mut IrArena, var: VariableId) -> NodeId {
        let base = arena.memory_label(GLOBALS_LABEL);
        let offset = arena.constant(self.offsets[&var]);
        arena.binary(BinaryIrOp::Add, base, offset)
    }

    pub fn gen_read(
        &self,
        arena: &mut IrArena,
        var: VariableId,
    ) -> Result<NodeId, GlobalAccessError> {
        if let Some(value) = self.constants.get(&var) {
            return Ok(arena.constant(*value));
        }
        if !self.offsets.contains_key(&var) {
            return Err(GlobalAccessError::NotAGlobal(var));
        }
        let address = self.address(arena, var);
        Ok(arena.memory_read(address))
    }

    pub fn gen_write(
        &self,
        arena: &mut IrArena,
        var: VariableId,
        value: NodeId,
    ) -> Result<NodeId, GlobalAccessError> {
        if self.constants.contains_key(&var) {
            return Err(GlobalAccessError::WriteToConstant(var));
        }
        if !self.offsets.contains_key(&var) {
            return Err(GlobalAccessError::NotAGlobal(var));
        }
        let address = self.address(arena, var);
        Ok(arena.memory_write(address, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use vega_common::program::{
        FunctionId, Owner, Program, Type, Variable, VariableProperties,
    };
    use vega_ir::node::IrNode;

    fn program_with_globals(vars: Vec<(&str, Option<i64>)>) -> Program {
        Program {
            functions: vec![],
            variables: vars
                .iter()
                .map(|(name, constant_value)| Variable {
                    name: name.to_string(),
                    ty: Type::Int,
                    constant_value: *constant_value,
                })
                .collect(),
            properties: vars
                .iter()
                .map(|_| VariableProperties {
                    owner: Owner::Global,
                    accessed_by: BTreeSet::new(),
                })
                .collect(),
            main: FunctionId(0),
        }
    }

    #[test]
    fn test_offsets_follow_name_order() {
        let program = program_with_globals(vec![("beta", None), ("alpha", None)]);
        let access = GlobalAccess::new(&program);
        let mut arena = IrArena::new();

        let read_beta = access.gen_read(&mut arena, VariableId(0)).unwrap();
        match arena.get(read_beta) {
            IrNode::MemoryRead(address) => match arena.get(*address) {
                IrNode::Binary { left, right, .. } => {
                    assert_eq!(arena.get(*left), &IrNode::MemoryLabel(GLOBALS_LABEL.to_string()));
                    // "beta" sorts after "alpha", so it gets the second slot.
                    assert_eq!(arena.get(*right), &IrNode::Const(8));
                }
                other => panic!("expected address computation, got {:?}", other),
            },
            other => panic!("expected memory read, got {:?}", other),
        }
        assert_eq!(access.slot_count(), 2);
    }

    #[test]
    fn test_constant_reads_fold_and_writes_fail() {
        let program = program_with_globals(vec![("limit", Some(100))]);
        let access = GlobalAccess::new(&program);
        let mut arena = IrArena::new();

        let read = access.gen_read(&mut arena, VariableId(0)).unwrap();
        assert_eq!(arena.get(read), &IrNode::Const(100));
        assert_eq!(access.slot_count(), 0);

        let value = arena.constant(1);
        assert_eq!(
            access.gen_write(&mut arena, VariableId(0), value),
            Err(GlobalAccessError::WriteToConstant(VariableId(0)))
        );
    }
}
