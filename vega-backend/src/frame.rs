//! Activation frames
//!
//! Per-function storage layout plus the code that keeps it consistent: the
//! prologue and epilogue, the call sequence of the calling convention
//! (register-then-stack argument passing, RAX result, caller-saved scratch
//! clobbered by calls, callee-saved preserved), and variable access
//! expressions. Non-local variable access from nested functions goes
//! through the display: a depth-indexed array of frame-base addresses at
//! the reserved `display` label, giving O(1) lookup instead of walking a
//! chain of access links.

use crate::storage::StorageKind;
use std::collections::BTreeMap;
use thiserror::Error;
use vega_common::program::{Function, VariableId};
use vega_ir::cfg::{ControlFlowGraph, ControlFlowGraphBuilder, IrError};
use vega_ir::node::{BinaryIrOp, IrArena, NodeId};
use vega_ir::register::{
    Register, RegisterPool, ARGUMENT_REGISTERS, CALLEE_SAVED, CALLER_SAVED, RESULT_REGISTER,
};

/// Size of one stack slot and one display entry, in bytes.
pub const MEMORY_UNIT_SIZE: i64 = 8;

/// Reserved label of the display storage.
pub const DISPLAY_LABEL: &str = "display";

/// Frame construction defects. Like all backend errors these signal a
/// compiler bug and abort compilation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("indirect access to register-resident variable {0:?}; registers are not visible across activations")]
    IndirectRegisterAccess(VariableId),

    #[error("variable {0:?} has no storage location in this frame")]
    UnknownVariable(VariableId),

    #[error("register spilling is not supported; cannot reserve {0} spill slots")]
    SpillingUnsupported(usize),

    #[error(transparent)]
    Ir(#[from] IrError),
}

/// The call sequence of a function plus, if it returns a value, the node
/// reading that value out of the result register.
#[derive(Debug)]
pub struct FunctionCall {
    pub cfg: ControlFlowGraph,
    pub result: Option<NodeId>,
}

/// Emits a call to `target` under the calling convention: the first six
/// arguments go to the argument registers, the rest are pushed in reverse
/// order and abandoned after the call by bumping RSP.
///
/// This is the whole convention for foreign functions; frame-owning
/// functions route through it via [`FrameDescriptor::gen_call`].
pub fn gen_call_sequence(
    arena: &mut IrArena,
    target: &str,
    args: &[NodeId],
    returns_value: bool,
) -> Result<FunctionCall, FrameError> {
    let mut builder = ControlFlowGraphBuilder::new();
    let mut used_registers: Vec<Register> = Vec::new();

    for (arg, register) in args.iter().zip(ARGUMENT_REGISTERS) {
        let node = arena.register_write(register, *arg);
        builder.add_link_from_all_final_roots(vega_ir::LinkType::Unconditional, node)?;
        used_registers.push(register.into());
    }

    let mut args_pushed = 0;
    for arg in args.iter().skip(ARGUMENT_REGISTERS.len()).rev() {
        let node = arena.stack_push(*arg);
        builder.add_link_from_all_final_roots(vega_ir::LinkType::Unconditional, node)?;
        args_pushed += 1;
    }

    let clobbered: Vec<Register> = CALLER_SAVED.iter().map(|reg| (*reg).into()).collect();
    let call = arena.call(target, used_registers, clobbered);
    builder.add_link_from_all_final_roots(vega_ir::LinkType::Unconditional, call)?;

    if args_pushed > 0 {
        let rsp = arena.register_read(vega_ir::PhysReg::Rsp);
        let amount = arena.constant(args_pushed * MEMORY_UNIT_SIZE);
        let bumped = arena.binary(BinaryIrOp::Add, rsp, amount);
        let node = arena.register_write(vega_ir::PhysReg::Rsp, bumped);
        builder.add_link_from_all_final_roots(vega_ir::LinkType::Unconditional, node)?;
    }

    let result = returns_value.then(|| arena.register_read(RESULT_REGISTER));
    Ok(FunctionCall {
        cfg: builder.build(),
        result,
    })
}

/// Storage-location assignment and activation code for one function.
///
/// Built once per function before code generation; all `gen_*` methods are
/// pure functions of this descriptor and the arena they allocate into.
#[derive(Debug)]
pub struct FrameDescriptor {
    params: Vec<VariableId>,
    result_variable: Option<VariableId>,
    code_label: String,
    depth: u32,
    locations: BTreeMap<VariableId, StorageKind>,
    stack_offsets: BTreeMap<VariableId, i64>,
    registers: BTreeMap<VariableId, Register>,
    frame_size: i64,
    saved_display_offset: i64,
}

impl FrameDescriptor {
    /// Lays out the frame: memory-resident variables get monotonically
    /// increasing, non-overlapping offsets below the frame pointer, in
    /// declaration order; register-resident ones get a fresh symbolic
    /// register each.
    pub fn new(
        function: &Function,
        storage: &BTreeMap<VariableId, StorageKind>,
        code_label: String,
        pool: &mut RegisterPool,
    ) -> Self {
        let mut stack_offsets = BTreeMap::new();
        let mut registers = BTreeMap::new();
        let mut total_offset = 0;
        for var in function.frame_variables() {
            match storage.get(&var).copied().unwrap_or(StorageKind::Memory) {
                StorageKind::Memory => {
                    total_offset += MEMORY_UNIT_SIZE;
                    stack_offsets.insert(var, total_offset);
                }
                StorageKind::Register => {
                    registers.insert(var, pool.fresh());
                }
            }
        }
        // The caller's display entry gets its own frame slot. A symbolic
        // register would be live from the prologue to the epilogue, across
        // every call clobber and callee-saved pop in the body.
        total_offset += MEMORY_UNIT_SIZE;
        let saved_display_offset = total_offset;
        FrameDescriptor {
            params: function.params.clone(),
            result_variable: function.result,
            code_label,
            depth: function.depth,
            locations: storage.clone(),
            stack_offsets,
            registers,
            frame_size: total_offset,
            saved_display_offset,
        }
    }

    pub fn code_label(&self) -> &str {
        &self.code_label
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn stack_offset_of(&self, var: VariableId) -> Option<i64> {
        self.stack_offsets.get(&var).copied()
    }

    pub fn register_of(&self, var: VariableId) -> Option<Register> {
        self.registers.get(&var).copied()
    }

    /// Address of this function's display slot:
    /// `display + depth * MEMORY_UNIT_SIZE`.
    fn display_slot_address(&self, arena: &mut IrArena) -> NodeId {
        let base = arena.memory_label(DISPLAY_LABEL);
        let offset = arena.constant(self.depth as i64 * MEMORY_UNIT_SIZE);
        arena.binary(BinaryIrOp::Add, base, offset)
    }

    /// Address of the frame slot holding the caller's display entry.
    fn saved_display_address(&self, arena: &mut IrArena) -> NodeId {
        let rbp = arena.register_read(vega_ir::PhysReg::Rbp);
        let offset = arena.constant(self.saved_display_offset);
        arena.binary(BinaryIrOp::Subtract, rbp, offset)
    }

    /// The prologue: save the caller's frame pointer, establish the new
    /// frame, reserve slot space, save and overwrite this depth's display
    /// entry, move incoming arguments into their assigned storage, and
    /// back up the callee-saved registers.
    pub fn gen_prologue(&self, arena: &mut IrArena) -> Result<ControlFlowGraph, FrameError> {
        use vega_ir::LinkType::Unconditional;
        use vega_ir::PhysReg::{Rbp, Rsp};
        let mut builder = ControlFlowGraphBuilder::new();

        let old_rbp = arena.register_read(Rbp);
        let push_rbp = arena.stack_push(old_rbp);
        builder.add_link_from_all_final_roots(Unconditional, push_rbp)?;

        let rsp = arena.register_read(Rsp);
        let set_rbp = arena.register_write(Rbp, rsp);
        builder.add_link_from_all_final_roots(Unconditional, set_rbp)?;

        let rsp = arena.register_read(Rsp);
        let frame_size = arena.constant(self.frame_size);
        let lowered = arena.binary(BinaryIrOp::Subtract, rsp, frame_size);
        let reserve = arena.register_write(Rsp, lowered);
        builder.add_link_from_all_final_roots(Unconditional, reserve)?;

        let slot = self.display_slot_address(arena);
        let old_entry = arena.memory_read(slot);
        let save_slot = self.saved_display_address(arena);
        let save_entry = arena.memory_write(save_slot, old_entry);
        builder.add_link_from_all_final_roots(Unconditional, save_entry)?;

        let slot = self.display_slot_address(arena);
        let rbp = arena.register_read(Rbp);
        let update_entry = arena.memory_write(slot, rbp);
        builder.add_link_from_all_final_roots(Unconditional, update_entry)?;

        for (param, register) in self.params.iter().zip(ARGUMENT_REGISTERS) {
            let incoming = arena.register_read(register);
            let store = self.gen_write(arena, *param, incoming, true)?;
            builder.add_link_from_all_final_roots(Unconditional, store)?;
        }
        for (index, param) in self
            .params
            .iter()
            .skip(ARGUMENT_REGISTERS.len())
            .enumerate()
        {
            // Stack arguments sit above the saved RBP and return address.
            let rbp = arena.register_read(Rbp);
            let offset = arena.constant((index as i64 + 2) * MEMORY_UNIT_SIZE);
            let address = arena.binary(BinaryIrOp::Add, rbp, offset);
            let incoming = arena.memory_read(address);
            let store = self.gen_write(arena, *param, incoming, true)?;
            builder.add_link_from_all_final_roots(Unconditional, store)?;
        }

        for register in CALLEE_SAVED.iter().rev() {
            let value = arena.register_read(*register);
            let push = arena.stack_push(value);
            builder.add_link_from_all_final_roots(Unconditional, push)?;
        }

        Ok(builder.build())
    }

    /// The epilogue, mirror of the prologue: restore callee-saved
    /// registers, move the result into the result register, restore the
    /// display entry, and tear the frame down.
    pub fn gen_epilogue(&self, arena: &mut IrArena) -> Result<ControlFlowGraph, FrameError> {
        use vega_ir::LinkType::Unconditional;
        use vega_ir::PhysReg::{Rbp, Rsp};
        let mut builder = ControlFlowGraphBuilder::new();

        for register in CALLEE_SAVED {
            let value = arena.stack_pop();
            let pop = arena.register_write(register, value);
            builder.add_link_from_all_final_roots(Unconditional, pop)?;
        }

        if let Some(result_variable) = self.result_variable {
            let value = self.gen_read(arena, result_variable, true)?;
            let set_result = arena.register_write(RESULT_REGISTER, value);
            builder.add_link_from_all_final_roots(Unconditional, set_result)?;
        }

        let save_slot = self.saved_display_address(arena);
        let saved = arena.memory_read(save_slot);
        let slot = self.display_slot_address(arena);
        let restore_entry = arena.memory_write(slot, saved);
        builder.add_link_from_all_final_roots(Unconditional, restore_entry)?;

        let rbp = arena.register_read(Rbp);
        let restore_rsp = arena.register_write(Rsp, rbp);
        builder.add_link_from_all_final_roots(Unconditional, restore_rsp)?;

        let old_rbp = arena.stack_pop();
        let restore_rbp = arena.register_write(Rbp, old_rbp);
        builder.add_link_from_all_final_roots(Unconditional, restore_rbp)?;

        Ok(builder.build())
    }

    /// Call sequence targeting this function's code label.
    pub fn gen_call(&self, arena: &mut IrArena, args: &[NodeId]) -> Result<FunctionCall, FrameError> {
        gen_call_sequence(
            arena,
            &self.code_label,
            args,
            self.result_variable.is_some(),
        )
    }

    fn gen_access(
        &self,
        arena: &mut IrArena,
        var: VariableId,
        direct: bool,
        reg_access: impl FnOnce(&mut IrArena, Register) -> NodeId,
        mem_access: impl FnOnce(&mut IrArena, NodeId) -> NodeId,
    ) -> Result<NodeId, FrameError> {
        let location = self
            .locations
            .get(&var)
            .copied()
            .ok_or(FrameError::UnknownVariable(var))?;
        if direct {
            match location {
                StorageKind::Memory => {
                    let rbp = arena.register_read(vega_ir::PhysReg::Rbp);
                    let offset = arena.constant(self.stack_offsets[&var]);
                    let address = arena.binary(BinaryIrOp::Subtract, rbp, offset);
                    Ok(mem_access(arena, address))
                }
                StorageKind::Register => Ok(reg_access(arena, self.registers[&var])),
            }
        } else {
            // A nested function reaches into this activation through the
            // display; that only works for memory-resident variables.
            if location == StorageKind::Register {
                return Err(FrameError::IndirectRegisterAccess(var));
            }
            let slot = self.display_slot_address(arena);
            let frame_base = arena.memory_read(slot);
            let offset = arena.constant(self.stack_offsets[&var]);
            let address = arena.binary(BinaryIrOp::Subtract, frame_base, offset);
            Ok(mem_access(arena, address))
        }
    }

    /// Read of `var`. `direct` means the access happens inside this
    /// function's own activation; indirect accesses come from nested
    /// functions and go through the display.
    pub fn gen_read(
        &self,
        arena: &mut IrArena,
        var: VariableId,
        direct: bool,
    ) -> Result<NodeId, FrameError> {
        self.gen_access(
            arena,
            var,
            direct,
            |arena, register| arena.register_read(register),
            |arena, address| arena.memory_read(address),
        )
    }

    /// Write of `value` to `var`; same direct/indirect contract as
    /// [`FrameDescriptor::gen_read`].
    pub fn gen_write(
        &self,
        arena: &mut IrArena,
        var: VariableId,
        value: NodeId,
        direct: bool,
    ) -> Result<NodeId, FrameError> {
        self.gen_access(
            arena,
            var,
            direct,
            |arena, register| arena.register_write(register, value),
            |arena, address| arena.memory_write(address, value),
        )
    }

    /// Extension point for a spilling allocator: reserve extra frame slots
    /// for demoted registers. Allocation shortfall is currently a hard
    /// compilation limit, so this reports the unsupported case explicitly
    /// instead of silently adjusting the frame.
    pub fn reserve_spill_slots(&mut self, count: usize) -> Result<(), FrameError> {
        Err(FrameError::SpillingUnsupported(count))
    }
}
