//! Tree-pattern instruction selection
//!
//! A [`Pattern`] tries to cover an IR node in one of three contexts:
//! producing a value into a register, executing for effect only, or
//! branching to a label on a boolean value (optionally inverted). A match
//! yields the uncovered subtrees, an integer cost and a builder closure
//! that, given registers for the subtree results and an output register,
//! produces the instruction sequence. [`InstructionSet`] holds the
//! registered library and picks the lowest-cost match per node, breaking
//! ties by registration order; a node no pattern covers is a fatal gap in
//! the library.

use crate::addressing::{Addressing, MemoryAddress};
use crate::instruction::{Condition, Instruction};
use thiserror::Error;
use vega_ir::node::{BinaryIrOp, IrArena, IrNode, NodeId, UnaryIrOp};
use vega_ir::register::{PhysReg, Register, RegisterPool};

/// The covering context a match was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Value,
    Effect,
    Conditional,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("no pattern covers node {node:?} in a {context:?} context")]
    NoMatchingPattern { node: NodeId, context: Context },
}

/// A successful pattern match: subtrees still needing value covering, the
/// cost of this covering, and the instruction builder.
pub struct Match {
    pub subtrees: Vec<NodeId>,
    pub cost: u32,
    pub build: Box<dyn Fn(&[Register], Register) -> Vec<Instruction>>,
}

impl Match {
    fn leaf(cost: u32, build: impl Fn(&[Register], Register) -> Vec<Instruction> + 'static) -> Self {
        Match {
            subtrees: vec![],
            cost,
            build: Box::new(build),
        }
    }

    fn with_subtrees(
        subtrees: Vec<NodeId>,
        cost: u32,
        build: impl Fn(&[Register], Register) -> Vec<Instruction> + 'static,
    ) -> Self {
        Match {
            subtrees,
            cost,
            build: Box::new(build),
        }
    }
}

/// One way of covering IR nodes with instructions. The default
/// implementations decline every node, so a pattern only overrides the
/// contexts it participates in.
pub trait Pattern {
    fn match_value(&self, _arena: &IrArena, _node: NodeId) -> Option<Match> {
        None
    }

    fn match_effect(&self, _arena: &IrArena, _node: NodeId) -> Option<Match> {
        None
    }

    fn match_conditional(
        &self,
        _arena: &IrArena,
        _node: NodeId,
        _target: &str,
        _invert: bool,
    ) -> Option<Match> {
        None
    }
}

fn condition_of(op: BinaryIrOp) -> Option<Condition> {
    match op {
        BinaryIrOp::Equals => Some(Condition::Equal),
        BinaryIrOp::NotEquals => Some(Condition::NotEqual),
        BinaryIrOp::LessThan => Some(Condition::Less),
        BinaryIrOp::LessEquals => Some(Condition::LessEqual),
        BinaryIrOp::GreaterThan => Some(Condition::Greater),
        BinaryIrOp::GreaterEquals => Some(Condition::GreaterEqual),
        _ => None,
    }
}

/// `base ± constant` shape of a frame or display slot address, foldable
/// into a single addressing-mode operand.
fn base_offset_address(arena: &IrArena, address: NodeId) -> Option<Addressing> {
    if let IrNode::Binary { op, left, right } = arena.get(address) {
        let sign = match op {
            BinaryIrOp::Add => 1,
            BinaryIrOp::Subtract => -1,
            _ => return None,
        };
        if let (IrNode::RegisterRead(base), IrNode::Const(offset)) =
            (arena.get(*left), arena.get(*right))
        {
            return Some(Addressing::Base {
                base: *base,
                displacement: MemoryAddress::Const(sign * *offset),
            });
        }
    }
    None
}

/// `label ± constant` shape of a globals or display slot address,
/// foldable into a pure displacement operand.
fn label_offset_address(arena: &IrArena, address: NodeId) -> Option<Addressing> {
    if let IrNode::Binary { op, left, right } = arena.get(address) {
        let sign = match op {
            BinaryIrOp::Add => 1,
            BinaryIrOp::Subtract => -1,
            _ => return None,
        };
        if let (IrNode::MemoryLabel(label), IrNode::Const(offset)) =
            (arena.get(*left), arena.get(*right))
        {
            let displacement = if *offset == 0 {
                MemoryAddress::Label(label.clone())
            } else {
                MemoryAddress::LabelOffset {
                    label: label.clone(),
                    offset: sign * *offset,
                }
            };
            return Some(Addressing::Displacement { displacement });
        }
    }
    None
}

struct ConstValue;

impl Pattern for ConstValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Const(value) = arena.get(node) {
            let imm = *value;
            Some(Match::leaf(1, move |_, out| {
                vec![Instruction::MovRI { dest: out, imm }]
            }))
        } else {
            None
        }
    }
}

struct MemoryLabelValue;

impl Pattern for MemoryLabelValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryLabel(label) = arena.get(node) {
            let label = label.clone();
            Some(Match::leaf(1, move |_, out| {
                vec![Instruction::MovRL {
                    dest: out,
                    label: label.clone(),
                }]
            }))
        } else {
            None
        }
    }
}

/// Folds `MemoryRead(base ± constant)` into one load.
struct FrameSlotRead;

impl Pattern for FrameSlotRead {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryRead(address) = arena.get(node) {
            let addressing = base_offset_address(arena, *address)?;
            return Some(Match::leaf(1, move |_, out| {
                vec![Instruction::MovRM {
                    dest: out,
                    src: addressing.clone(),
                }]
            }));
        }
        None
    }
}

/// Folds `MemoryRead(label ± constant)` into one load.
struct GlobalSlotRead;

impl Pattern for GlobalSlotRead {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryRead(address) = arena.get(node) {
            let addressing = label_offset_address(arena, *address)?;
            return Some(Match::leaf(1, move |_, out| {
                vec![Instruction::MovRM {
                    dest: out,
                    src: addressing.clone(),
                }]
            }));
        }
        None
    }
}

struct MemoryReadValue;

impl Pattern for MemoryReadValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryRead(address) = arena.get(node) {
            Some(Match::with_subtrees(vec![*address], 1, |regs, out| {
                vec![Instruction::MovRM {
                    dest: out,
                    src: Addressing::base(regs[0]),
                }]
            }))
        } else {
            None
        }
    }
}

struct RegisterReadValue;

impl Pattern for RegisterReadValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::RegisterRead(register) = arena.get(node) {
            let src = *register;
            Some(Match::leaf(1, move |_, out| {
                vec![Instruction::MovRR { dest: out, src }]
            }))
        } else {
            None
        }
    }
}

/// Folds `RegisterWrite(r, Const)` into one immediate move.
struct RegisterWriteConst;

impl Pattern for RegisterWriteConst {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::RegisterWrite { register, value } = arena.get(node) {
            if let IrNode::Const(imm) = arena.get(*value) {
                let dest = *register;
                let imm = *imm;
                return Some(Match::leaf(1, move |_, _| {
                    vec![Instruction::MovRI { dest, imm }]
                }));
            }
        }
        None
    }
}

struct RegisterWriteEffect;

impl Pattern for RegisterWriteEffect {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::RegisterWrite { register, value } = arena.get(node) {
            let dest = *register;
            Some(Match::with_subtrees(vec![*value], 1, move |regs, _| {
                vec![Instruction::MovRR {
                    dest,
                    src: regs[0],
                }]
            }))
        } else {
            None
        }
    }
}

/// Folds `MemoryWrite(base ± constant, value)` into one store.
struct FrameSlotWrite;

impl Pattern for FrameSlotWrite {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryWrite { address, value } = arena.get(node) {
            let addressing = base_offset_address(arena, *address)?;
            return Some(Match::with_subtrees(vec![*value], 1, move |regs, _| {
                vec![Instruction::MovMR {
                    dest: addressing.clone(),
                    src: regs[0],
                }]
            }));
        }
        None
    }
}

/// Folds `MemoryWrite(label ± constant, value)` into one store.
struct GlobalSlotWrite;

impl Pattern for GlobalSlotWrite {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryWrite { address, value } = arena.get(node) {
            let addressing = label_offset_address(arena, *address)?;
            return Some(Match::with_subtrees(vec![*value], 1, move |regs, _| {
                vec![Instruction::MovMR {
                    dest: addressing.clone(),
                    src: regs[0],
                }]
            }));
        }
        None
    }
}

struct MemoryWriteEffect;

impl Pattern for MemoryWriteEffect {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::MemoryWrite { address, value } = arena.get(node) {
            Some(Match::with_subtrees(vec![*address, *value], 1, |regs, _| {
                vec![Instruction::MovMR {
                    dest: Addressing::base(regs[0]),
                    src: regs[1],
                }]
            }))
        } else {
            None
        }
    }
}

/// Two-operand arithmetic and bitwise operations: copy the left operand
/// into the output, then combine with the right operand in place.
struct ArithmeticValue;

impl Pattern for ArithmeticValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Binary { op, left, right } = arena.get(node) {
            fn combine(op: BinaryIrOp, dest: Register, src: Register) -> Option<Instruction> {
                match op {
                    BinaryIrOp::Add => Some(Instruction::AddRR { dest, src }),
                    BinaryIrOp::Subtract => Some(Instruction::SubRR { dest, src }),
                    BinaryIrOp::Multiply => Some(Instruction::ImulRR { dest, src }),
                    BinaryIrOp::BitAnd => Some(Instruction::AndRR { dest, src }),
                    BinaryIrOp::BitOr => Some(Instruction::OrRR { dest, src }),
                    BinaryIrOp::BitXor => Some(Instruction::XorRR { dest, src }),
                    _ => None,
                }
            }
            let op = *op;
            let (left, right) = (*left, *right);
            combine(op, Register::Virt(0), Register::Virt(0))?;
            return Some(Match::with_subtrees(vec![left, right], 1, move |regs, out| {
                let mut instructions = vec![Instruction::MovRR {
                    dest: out,
                    src: regs[0],
                }];
                instructions.extend(combine(op, out, regs[1]));
                instructions
            }));
        }
        None
    }
}

/// Signed division and remainder through RDX:RAX.
struct DivisionValue;

impl Pattern for DivisionValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Binary { op, left, right } = arena.get(node) {
            let result_register: Register = match op {
                BinaryIrOp::Divide => PhysReg::Rax.into(),
                BinaryIrOp::Modulo => PhysReg::Rdx.into(),
                _ => return None,
            };
            return Some(Match::with_subtrees(
                vec![*left, *right],
                2,
                move |regs, out| {
                    vec![
                        Instruction::MovRR {
                            dest: PhysReg::Rax.into(),
                            src: regs[0],
                        },
                        Instruction::Cqo,
                        Instruction::IdivR { divisor: regs[1] },
                        Instruction::MovRR {
                            dest: out,
                            src: result_register,
                        },
                    ]
                },
            ));
        }
        None
    }
}

/// Shifts take their amount in CL.
struct ShiftValue;

impl Pattern for ShiftValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Binary { op, left, right } = arena.get(node) {
            let arithmetic_right = match op {
                BinaryIrOp::ShiftLeft => false,
                BinaryIrOp::ShiftRight => true,
                _ => return None,
            };
            return Some(Match::with_subtrees(
                vec![*left, *right],
                2,
                move |regs, out| {
                    let shift = if arithmetic_right {
                        Instruction::SarRCl { dest: out }
                    } else {
                        Instruction::SalRCl { dest: out }
                    };
                    vec![
                        Instruction::MovRR {
                            dest: out,
                            src: regs[0],
                        },
                        Instruction::MovRR {
                            dest: PhysReg::Rcx.into(),
                            src: regs[1],
                        },
                        shift,
                    ]
                },
            ));
        }
        None
    }
}

/// Comparison producing a 0/1 value via `setcc`.
struct ComparisonValue;

impl Pattern for ComparisonValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Binary { op, left, right } = arena.get(node) {
            let cond = condition_of(*op)?;
            return Some(Match::with_subtrees(
                vec![*left, *right],
                2,
                move |regs, out| {
                    vec![
                        Instruction::MovRI { dest: out, imm: 0 },
                        Instruction::CmpRR {
                            left: regs[0],
                            right: regs[1],
                        },
                        Instruction::SetCc { cond, dest: out },
                    ]
                },
            ));
        }
        None
    }
}

/// Comparison branching directly on the flags, with no materialized value.
struct ComparisonConditional;

impl Pattern for ComparisonConditional {
    fn match_conditional(
        &self,
        arena: &IrArena,
        node: NodeId,
        target: &str,
        invert: bool,
    ) -> Option<Match> {
        if let IrNode::Binary { op, left, right } = arena.get(node) {
            let cond = condition_of(*op)?;
            let cond = if invert { cond.negate() } else { cond };
            let target = target.to_string();
            return Some(Match::with_subtrees(
                vec![*left, *right],
                1,
                move |regs, _| {
                    vec![
                        Instruction::CmpRR {
                            left: regs[0],
                            right: regs[1],
                        },
                        Instruction::JCc {
                            cond,
                            target: target.clone(),
                        },
                    ]
                },
            ));
        }
        None
    }
}

/// Branch on a negation by branching on the operand with the sense flipped.
struct LogicalNotConditional;

impl Pattern for LogicalNotConditional {
    fn match_conditional(
        &self,
        arena: &IrArena,
        node: NodeId,
        target: &str,
        invert: bool,
    ) -> Option<Match> {
        if let IrNode::Unary {
            op: UnaryIrOp::LogicalNot,
            operand,
        } = arena.get(node)
        {
            let cond = if invert {
                Condition::NotEqual
            } else {
                Condition::Equal
            };
            let target = target.to_string();
            return Some(Match::with_subtrees(vec![*operand], 1, move |regs, _| {
                vec![
                    Instruction::TestRR {
                        left: regs[0],
                        right: regs[0],
                    },
                    Instruction::JCc {
                        cond,
                        target: target.clone(),
                    },
                ]
            }));
        }
        None
    }
}

struct UnaryValue;

impl Pattern for UnaryValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Unary { op, operand } = arena.get(node) {
            let op = *op;
            return Some(Match::with_subtrees(vec![*operand], 1, move |regs, out| {
                let mut instructions = vec![Instruction::MovRR {
                    dest: out,
                    src: regs[0],
                }];
                instructions.push(match op {
                    UnaryIrOp::Negate => Instruction::NegR { dest: out },
                    UnaryIrOp::BitNot => Instruction::NotR { dest: out },
                    // A 0/1 value is negated by flipping its low bit.
                    UnaryIrOp::LogicalNot => Instruction::XorRI { dest: out, imm: 1 },
                });
                instructions
            }));
        }
        None
    }
}

struct StackPushEffect;

impl Pattern for StackPushEffect {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::StackPush(value) = arena.get(node) {
            Some(Match::with_subtrees(vec![*value], 1, |regs, _| {
                vec![Instruction::PushR { src: regs[0] }]
            }))
        } else {
            None
        }
    }
}

struct StackPopValue;

impl Pattern for StackPopValue {
    fn match_value(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::StackPop = arena.get(node) {
            Some(Match::leaf(1, |_, out| {
                vec![Instruction::PopR { dest: out }]
            }))
        } else {
            None
        }
    }
}

struct CallEffect;

impl Pattern for CallEffect {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::Call {
            target,
            uses,
            defines,
        } = arena.get(node)
        {
            let target = target.clone();
            let uses = uses.clone();
            let defines = defines.clone();
            Some(Match::leaf(1, move |_, _| {
                vec![Instruction::CallLabel {
                    target: target.clone(),
                    uses: uses.clone(),
                    defines: defines.clone(),
                }]
            }))
        } else {
            None
        }
    }
}

struct NoOpEffect;

impl Pattern for NoOpEffect {
    fn match_effect(&self, arena: &IrArena, node: NodeId) -> Option<Match> {
        if let IrNode::NoOp = arena.get(node) {
            Some(Match::leaf(0, |_, _| vec![]))
        } else {
            None
        }
    }
}

/// Last resort for conditional contexts: materialize the value, test it,
/// and branch on the zero flag.
struct ConditionalFallback;

impl Pattern for ConditionalFallback {
    fn match_conditional(
        &self,
        arena: &IrArena,
        node: NodeId,
        target: &str,
        invert: bool,
    ) -> Option<Match> {
        if !arena.get(node).has_value() {
            return None;
        }
        let cond = if invert {
            Condition::Equal
        } else {
            Condition::NotEqual
        };
        let target = target.to_string();
        Some(Match::with_subtrees(vec![node], 2, move |regs, _| {
            vec![
                Instruction::TestRR {
                    left: regs[0],
                    right: regs[0],
                },
                Instruction::JCc {
                    cond,
                    target: target.clone(),
                },
            ]
        }))
    }
}

/// The registered pattern library. Registration order is the tie-break for
/// equal-cost matches, so folded special cases precede the generic
/// patterns covering the same nodes.
pub struct InstructionSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl Default for InstructionSet {
    fn default() -> Self {
        InstructionSet {
            patterns: vec![
                Box::new(ConstValue),
                Box::new(MemoryLabelValue),
                Box::new(FrameSlotRead),
                Box::new(GlobalSlotRead),
                Box::new(MemoryReadValue),
                Box::new(RegisterReadValue),
                Box::new(RegisterWriteConst),
                Box::new(RegisterWriteEffect),
                Box::new(FrameSlotWrite),
                Box::new(GlobalSlotWrite),
                Box::new(MemoryWriteEffect),
                Box::new(ArithmeticValue),
                Box::new(DivisionValue),
                Box::new(ShiftValue),
                Box::new(ComparisonValue),
                Box::new(ComparisonConditional),
                Box::new(LogicalNotConditional),
                Box::new(UnaryValue),
                Box::new(StackPushEffect),
                Box::new(StackPopValue),
                Box::new(CallEffect),
                Box::new(NoOpEffect),
                Box::new(ConditionalFallback),
            ],
        }
    }
}

impl InstructionSet {
    pub fn new(patterns: Vec<Box<dyn Pattern>>) -> Self {
        InstructionSet { patterns }
    }

    fn best(
        &self,
        node: NodeId,
        context: Context,
        matches: impl Iterator<Item = Option<Match>>,
    ) -> Result<Match, SelectionError> {
        let mut best: Option<Match> = None;
        for candidate in matches.flatten() {
            // Strict comparison keeps the earliest-registered winner on ties.
            if best.as_ref().map_or(true, |b| candidate.cost < b.cost) {
                best = Some(candidate);
            }
        }
        best.ok_or(SelectionError::NoMatchingPattern { node, context })
    }

    fn best_value(&self, arena: &IrArena, node: NodeId) -> Result<Match, SelectionError> {
        self.best(
            node,
            Context::Value,
            self.patterns.iter().map(|p| p.match_value(arena, node)),
        )
    }

    fn best_effect(&self, arena: &IrArena, node: NodeId) -> Result<Match, SelectionError> {
        self.best(
            node,
            Context::Effect,
            self.patterns.iter().map(|p| p.match_effect(arena, node)),
        )
    }

    fn best_conditional(
        &self,
        arena: &IrArena,
        node: NodeId,
        target: &str,
        invert: bool,
    ) -> Result<Match, SelectionError> {
        self.best(
            node,
            Context::Conditional,
            self.patterns
                .iter()
                .map(|p| p.match_conditional(arena, node, target, invert)),
        )
    }

    fn cover_subtrees(
        &self,
        arena: &IrArena,
        subtrees: &[NodeId],
        pool: &mut RegisterPool,
        instructions: &mut Vec<Instruction>,
    ) -> Result<Vec<Register>, SelectionError> {
        let mut registers = Vec::with_capacity(subtrees.len());
        for subtree in subtrees {
            let (covered, register) = self.cover_value(arena, *subtree, pool)?;
            instructions.extend(covered);
            registers.push(register);
        }
        Ok(registers)
    }

    /// Covers `node` as a value; returns the instructions and the register
    /// holding the result.
    pub fn cover_value(
        &self,
        arena: &IrArena,
        node: NodeId,
        pool: &mut RegisterPool,
    ) -> Result<(Vec<Instruction>, Register), SelectionError> {
        let matched = self.best_value(arena, node)?;
        let mut instructions = Vec::new();
        let registers = self.cover_subtrees(arena, &matched.subtrees, pool, &mut instructions)?;
        let out = pool.fresh();
        instructions.extend((matched.build)(&registers, out));
        Ok((instructions, out))
    }

    /// Covers `node` for effect only.
    pub fn cover_effect(
        &self,
        arena: &IrArena,
        node: NodeId,
        pool: &mut RegisterPool,
    ) -> Result<Vec<Instruction>, SelectionError> {
        let matched = self.best_effect(arena, node)?;
        let mut instructions = Vec::new();
        let registers = self.cover_subtrees(arena, &matched.subtrees, pool, &mut instructions)?;
        let scratch = pool.fresh();
        instructions.extend((matched.build)(&registers, scratch));
        Ok(instructions)
    }

    /// Covers `node` as a branch: the produced sequence jumps to `target`
    /// exactly when the value is true (or false, with `invert`).
    pub fn cover_conditional(
        &self,
        arena: &IrArena,
        node: NodeId,
        target: &str,
        invert: bool,
        pool: &mut RegisterPool,
    ) -> Result<Vec<Instruction>, SelectionError> {
        let matched = self.best_conditional(arena, node, target, invert)?;
        let mut instructions = Vec::new();
        let registers = self.cover_subtrees(arena, &matched.subtrees, pool, &mut instructions)?;
        let scratch = pool.fresh();
        instructions.extend((matched.build)(&registers, scratch));
        Ok(instructions)
    }
}
