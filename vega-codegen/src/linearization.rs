//! Linearization
//!
//! Turns a control flow graph into one straight-line instruction list.
//! Traversal is a depth-first walk from the entry that visits the false
//! branch of every conditional first, so the false arm becomes the
//! fall-through and the true arm gets a conditional jump; unconditional
//! edges that cannot fall through become explicit jumps. Local labels
//! (`.L0`, `.L1`, ...) are assigned only to roots that are actually jumped
//! to, in first-need order, so the output is deterministic for a fixed
//! graph.

use crate::instruction::{Asmable, Instruction};
use crate::patterns::{InstructionSet, SelectionError};
use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use vega_ir::cfg::ControlFlowGraph;
use vega_ir::node::{IrArena, NodeId};
use vega_ir::register::RegisterPool;

/// Linearizes `cfg` into labels, jumps and selected instructions. Terminal
/// roots are followed by `ret`.
pub fn linearize(
    arena: &IrArena,
    cfg: &ControlFlowGraph,
    instruction_set: &InstructionSet,
    pool: &mut RegisterPool,
) -> Result<Vec<Asmable>, SelectionError> {
    let order = traversal_order(cfg);
    trace!("linearizing {} tree roots", order.len());

    // First pass: decide which roots need labels and what each root emits
    // after its own instructions.
    let mut labels: BTreeMap<NodeId, String> = BTreeMap::new();
    let mut next_label = 0usize;
    let mut request_label = |labels: &mut BTreeMap<NodeId, String>, node: NodeId| {
        if !labels.contains_key(&node) {
            labels.insert(node, format!(".L{}", next_label));
            next_label += 1;
        }
    };

    enum Exit {
        FallThrough,
        Jump(NodeId),
        CondFallFalse { on_true: NodeId },
        CondFallTrue { on_false: NodeId },
        CondJumpBoth { on_true: NodeId, on_false: NodeId },
        Return,
    }

    let mut exits: Vec<Exit> = Vec::with_capacity(order.len());
    for (index, node) in order.iter().enumerate() {
        let next = order.get(index + 1).copied();
        let exit = if let Some((on_true, on_false)) = cfg.conditional_links(*node) {
            if next == Some(on_false) {
                request_label(&mut labels, on_true);
                Exit::CondFallFalse { on_true }
            } else if next == Some(on_true) {
                request_label(&mut labels, on_false);
                Exit::CondFallTrue { on_false }
            } else {
                request_label(&mut labels, on_true);
                request_label(&mut labels, on_false);
                Exit::CondJumpBoth { on_true, on_false }
            }
        } else if let Some(successor) = cfg.unconditional_link(*node) {
            if next == Some(successor) {
                Exit::FallThrough
            } else {
                request_label(&mut labels, successor);
                Exit::Jump(successor)
            }
        } else {
            Exit::Return
        };
        exits.push(exit);
    }

    // Second pass: emit.
    let mut program: Vec<Asmable> = Vec::new();
    for (node, exit) in order.iter().zip(exits) {
        if let Some(label) = labels.get(node) {
            program.push(Asmable::Label(label.clone()));
        }
        match exit {
            Exit::CondFallFalse { on_true } => {
                let covered =
                    instruction_set.cover_conditional(arena, *node, &labels[&on_true], false, pool)?;
                program.extend(covered.into_iter().map(Asmable::from));
            }
            Exit::CondFallTrue { on_false } => {
                let covered =
                    instruction_set.cover_conditional(arena, *node, &labels[&on_false], true, pool)?;
                program.extend(covered.into_iter().map(Asmable::from));
            }
            Exit::CondJumpBoth { on_true, on_false } => {
                let covered =
                    instruction_set.cover_conditional(arena, *node, &labels[&on_true], false, pool)?;
                program.extend(covered.into_iter().map(Asmable::from));
                program.push(
                    Instruction::Jmp {
                        target: labels[&on_false].clone(),
                    }
                    .into(),
                );
            }
            Exit::FallThrough | Exit::Jump(_) | Exit::Return => {
                let covered = if arena.get(*node).has_value() {
                    // A value root outside a conditional context is
                    // evaluated and discarded.
                    instruction_set.cover_value(arena, *node, pool)?.0
                } else {
                    instruction_set.cover_effect(arena, *node, pool)?
                };
                program.extend(covered.into_iter().map(Asmable::from));
                match exit {
                    Exit::Jump(successor) => program.push(
                        Instruction::Jmp {
                            target: labels[&successor].clone(),
                        }
                        .into(),
                    ),
                    Exit::Return => program.push(Instruction::Ret.into()),
                    _ => {}
                }
            }
        }
    }
    Ok(program)
}

/// Depth-first order from the entry, false branch first. Roots unreachable
/// from the entry are dropped; an empty graph linearizes to nothing.
fn traversal_order(cfg: &ControlFlowGraph) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    let Some(entry) = cfg.entry() else {
        return order;
    };
    let mut stack = vec![entry];
    while let Some(node) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        order.push(node);
        if let Some((on_true, on_false)) = cfg.conditional_links(node) {
            // Pushed true-first so the false branch is visited first.
            stack.push(on_true);
            stack.push(on_false);
        } else if let Some(successor) = cfg.unconditional_link(node) {
            stack.push(successor);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Condition;
    use pretty_assertions::assert_eq;
    use vega_ir::cfg::{ControlFlowGraphBuilder, LinkType};

    fn instructions(program: &[Asmable]) -> Vec<&Instruction> {
        program
            .iter()
            .filter_map(|asmable| match asmable {
                Asmable::Instruction(instruction) => Some(instruction),
                Asmable::Label(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_straight_line_has_no_labels_or_jumps() {
        let mut arena = IrArena::new();
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let one = arena.constant(1);
        let first = arena.register_write(a, one);
        let two = arena.constant(2);
        let second = arena.register_write(a, two);

        let mut builder = ControlFlowGraphBuilder::with_entry(first);
        builder
            .add_link(Some((first, LinkType::Unconditional)), second)
            .unwrap();
        let cfg = builder.build();

        let program = linearize(&arena, &cfg, &InstructionSet::default(), &mut pool).unwrap();
        assert!(program
            .iter()
            .all(|asmable| matches!(asmable, Asmable::Instruction(_))));
        assert_eq!(
            program.last(),
            Some(&Asmable::Instruction(Instruction::Ret))
        );
        assert!(!instructions(&program)
            .iter()
            .any(|i| matches!(i, Instruction::Jmp { .. } | Instruction::JCc { .. })));
    }

    #[test]
    fn test_diamond_falls_through_to_false_branch() {
        let mut arena = IrArena::new();
        let mut pool = RegisterPool::new();
        let flag = pool.fresh();
        let result = pool.fresh();

        let zero = arena.constant(0);
        let cond_reg = arena.register_read(flag);
        let condition = arena.binary(vega_ir::BinaryIrOp::GreaterThan, cond_reg, zero);
        let one = arena.constant(1);
        let on_true = arena.register_write(result, one);
        let two = arena.constant(2);
        let on_false = arena.register_write(result, two);
        let join = arena.no_op();

        let mut builder = ControlFlowGraphBuilder::with_entry(condition);
        builder
            .merge_conditionally(
                &ControlFlowGraph::single_tree(on_true),
                &ControlFlowGraph::single_tree(on_false),
            )
            .unwrap();
        builder
            .add_link_from_all_final_roots(LinkType::Unconditional, join)
            .unwrap();
        let cfg = builder.build();

        let program = linearize(&arena, &cfg, &InstructionSet::default(), &mut pool).unwrap();

        // The conditional jump goes to the true branch; the false branch
        // follows immediately with no jump in between.
        let jcc_index = program
            .iter()
            .position(|asmable| {
                matches!(
                    asmable,
                    Asmable::Instruction(Instruction::JCc {
                        cond: Condition::Greater,
                        ..
                    })
                )
            })
            .expect("conditional jump present");
        assert!(matches!(
            program[jcc_index + 1],
            Asmable::Instruction(Instruction::MovRI { imm: 2, .. })
        ));

        // Exactly the true branch and the join need labels.
        let labels: Vec<&Asmable> = program
            .iter()
            .filter(|asmable| matches!(asmable, Asmable::Label(_)))
            .collect();
        assert_eq!(labels.len(), 2);

        // The out-of-line true arm reaches the join with an explicit jump.
        assert!(instructions(&program)
            .iter()
            .any(|i| matches!(i, Instruction::Jmp { .. })));
    }

    #[test]
    fn test_loop_emits_back_edge_jump() {
        let mut arena = IrArena::new();
        let mut pool = RegisterPool::new();
        let counter = pool.fresh();

        let zero = arena.constant(0);
        let read = arena.register_read(counter);
        let condition = arena.binary(vega_ir::BinaryIrOp::GreaterThan, read, zero);
        let one = arena.constant(1);
        let read_again = arena.register_read(counter);
        let decremented = arena.binary(vega_ir::BinaryIrOp::Subtract, read_again, one);
        let body = arena.register_write(counter, decremented);
        let exit = arena.no_op();

        let mut builder = ControlFlowGraphBuilder::with_entry(condition);
        builder
            .merge_conditionally(
                &ControlFlowGraph::single_tree(body),
                &ControlFlowGraph::single_tree(exit),
            )
            .unwrap();
        builder
            .add_link(Some((body, LinkType::Unconditional)), condition)
            .unwrap();
        let cfg = builder.build();

        let program = linearize(&arena, &cfg, &InstructionSet::default(), &mut pool).unwrap();

        // The body ends with a jump back to the labeled condition; the
        // exit path's `ret` sits between the two.
        let back_jump = instructions(&program)
            .iter()
            .find_map(|i| match i {
                Instruction::Jmp { target } => Some(target.clone()),
                _ => None,
            })
            .expect("back edge jump present");
        assert!(program.contains(&Asmable::Label(back_jump)));
        assert!(program.contains(&Asmable::Instruction(Instruction::Ret)));
    }

    #[test]
    fn test_deterministic_output() {
        let mut arena = IrArena::new();
        let mut pool = RegisterPool::new();
        let flag = pool.fresh();

        let read = arena.register_read(flag);
        let t = arena.no_op();
        let f = arena.no_op();
        let mut builder = ControlFlowGraphBuilder::with_entry(read);
        builder
            .merge_conditionally(
                &ControlFlowGraph::single_tree(t),
                &ControlFlowGraph::single_tree(f),
            )
            .unwrap();
        let cfg = builder.build();

        let mut pool_again = RegisterPool::new();
        let first = linearize(&arena, &cfg, &InstructionSet::default(), &mut pool).unwrap();
        // Register numbering differs between runs with different pools, so
        // compare the shapes.
        let second =
            linearize(&arena, &cfg, &InstructionSet::default(), &mut pool_again).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(
                std::mem::discriminant(a),
                std::mem::discriminant(b)
            );
        }
    }
}
