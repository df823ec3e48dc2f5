//! The target instruction set
//!
//! The subset of x86-64 the pattern library emits, still over symbolic
//! registers. Every instruction knows which registers it reads and writes
//! (the gen/kill sets of the liveness analysis) and how to render itself to
//! NASM once physical registers are assigned. A linear program is a list of
//! [`Asmable`] items: labels interleaved with instructions.

use crate::addressing::Addressing;
use crate::emit::EmitError;
use std::collections::BTreeMap;
use vega_ir::register::{PhysReg, Register};

/// A condition code, as used by `setcc` and `jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Condition {
    pub fn to_nasm(self) -> &'static str {
        match self {
            Condition::Equal => "e",
            Condition::NotEqual => "ne",
            Condition::Less => "l",
            Condition::LessEqual => "le",
            Condition::Greater => "g",
            Condition::GreaterEqual => "ge",
        }
    }

    /// The condition that holds exactly when `self` does not.
    pub fn negate(self) -> Self {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterEqual,
            Condition::LessEqual => Condition::Greater,
            Condition::Greater => Condition::LessEqual,
            Condition::GreaterEqual => Condition::Less,
        }
    }
}

/// One item of a linear program.
#[derive(Debug, Clone, PartialEq)]
pub enum Asmable {
    Label(String),
    Instruction(Instruction),
}

impl From<Instruction> for Asmable {
    fn from(instruction: Instruction) -> Self {
        Asmable::Instruction(instruction)
    }
}

/// One target instruction over possibly-symbolic registers.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `mov dest, src`; the plain register move the coalescer targets.
    MovRR { dest: Register, src: Register },
    /// `mov dest, imm`
    MovRI { dest: Register, imm: i64 },
    /// `mov dest, label` (the address of the label)
    MovRL { dest: Register, label: String },
    /// `mov dest, qword [..]`
    MovRM { dest: Register, src: Addressing },
    /// `mov qword [..], src`
    MovMR { dest: Addressing, src: Register },
    AddRR { dest: Register, src: Register },
    SubRR { dest: Register, src: Register },
    ImulRR { dest: Register, src: Register },
    AndRR { dest: Register, src: Register },
    OrRR { dest: Register, src: Register },
    XorRR { dest: Register, src: Register },
    XorRI { dest: Register, imm: i64 },
    /// `cqo`: sign-extend RAX into RDX:RAX before division.
    Cqo,
    /// `idiv divisor`: quotient in RAX, remainder in RDX.
    IdivR { divisor: Register },
    NegR { dest: Register },
    NotR { dest: Register },
    /// `sal dest, cl`
    SalRCl { dest: Register },
    /// `sar dest, cl`
    SarRCl { dest: Register },
    CmpRR { left: Register, right: Register },
    TestRR { left: Register, right: Register },
    /// `setcc` on the low byte; the destination must be zeroed beforehand.
    SetCc { cond: Condition, dest: Register },
    PushR { src: Register },
    PopR { dest: Register },
    /// `call target`. `uses` and `defines` carry the calling convention's
    /// argument and clobber registers into the liveness analysis.
    CallLabel {
        target: String,
        uses: Vec<Register>,
        defines: Vec<Register>,
    },
    Jmp { target: String },
    JCc { cond: Condition, target: String },
    Ret,
}

impl Instruction {
    /// Registers the instruction reads.
    pub fn regs_used(&self) -> Vec<Register> {
        match self {
            Instruction::MovRR { src, .. } => vec![*src],
            Instruction::MovRI { .. } | Instruction::MovRL { .. } => vec![],
            Instruction::MovRM { src, .. } => src.registers(),
            Instruction::MovMR { dest, src } => {
                let mut used = dest.registers();
                used.push(*src);
                used
            }
            Instruction::AddRR { dest, src }
            | Instruction::SubRR { dest, src }
            | Instruction::ImulRR { dest, src }
            | Instruction::AndRR { dest, src }
            | Instruction::OrRR { dest, src }
            | Instruction::XorRR { dest, src } => vec![*dest, *src],
            Instruction::XorRI { dest, .. } => vec![*dest],
            Instruction::Cqo => vec![PhysReg::Rax.into()],
            Instruction::IdivR { divisor } => {
                vec![*divisor, PhysReg::Rax.into(), PhysReg::Rdx.into()]
            }
            Instruction::NegR { dest } | Instruction::NotR { dest } => vec![*dest],
            Instruction::SalRCl { dest } | Instruction::SarRCl { dest } => {
                vec![*dest, PhysReg::Rcx.into()]
            }
            Instruction::CmpRR { left, right } | Instruction::TestRR { left, right } => {
                vec![*left, *right]
            }
            Instruction::SetCc { .. } => vec![],
            Instruction::PushR { src } => vec![*src],
            Instruction::PopR { .. } => vec![],
            Instruction::CallLabel { uses, .. } => uses.clone(),
            Instruction::Jmp { .. } | Instruction::JCc { .. } | Instruction::Ret => vec![],
        }
    }

    /// Registers the instruction writes.
    pub fn regs_defined(&self) -> Vec<Register> {
        match self {
            Instruction::MovRR { dest, .. }
            | Instruction::MovRI { dest, .. }
            | Instruction::MovRL { dest, .. }
            | Instruction::MovRM { dest, .. }
            | Instruction::AddRR { dest, .. }
            | Instruction::SubRR { dest, .. }
            | Instruction::ImulRR { dest, .. }
            | Instruction::AndRR { dest, .. }
            | Instruction::OrRR { dest, .. }
            | Instruction::XorRR { dest, .. }
            | Instruction::XorRI { dest, .. }
            | Instruction::NegR { dest }
            | Instruction::NotR { dest }
            | Instruction::SalRCl { dest }
            | Instruction::SarRCl { dest }
            | Instruction::SetCc { dest, .. }
            | Instruction::PopR { dest } => vec![*dest],
            Instruction::Cqo => vec![PhysReg::Rdx.into()],
            Instruction::IdivR { .. } => vec![PhysReg::Rax.into(), PhysReg::Rdx.into()],
            Instruction::MovMR { .. }
            | Instruction::CmpRR { .. }
            | Instruction::TestRR { .. }
            | Instruction::PushR { .. }
            | Instruction::Jmp { .. }
            | Instruction::JCc { .. }
            | Instruction::Ret => vec![],
            Instruction::CallLabel { defines, .. } => defines.clone(),
        }
    }

    /// The (dest, src) pair of a plain register-to-register move; such
    /// moves are the coalescing candidates and their operands do not
    /// interfere with each other.
    pub fn as_copy(&self) -> Option<(Register, Register)> {
        match self {
            Instruction::MovRR { dest, src } => Some((*dest, *src)),
            _ => None,
        }
    }

    /// NASM text under the given register assignment.
    pub fn to_nasm(
        &self,
        allocation: &BTreeMap<Register, PhysReg>,
    ) -> Result<String, EmitError> {
        let resolve = |register: Register| -> Result<&'static str, EmitError> {
            allocation
                .get(&register)
                .map(|phys| phys.to_nasm())
                .ok_or(EmitError::UnallocatedRegister(register))
        };
        let resolve_byte = |register: Register| -> Result<&'static str, EmitError> {
            allocation
                .get(&register)
                .map(|phys| phys.to_nasm_byte())
                .ok_or(EmitError::UnallocatedRegister(register))
        };
        Ok(match self {
            Instruction::MovRR { dest, src } => {
                format!("mov {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::MovRI { dest, imm } => format!("mov {}, {}", resolve(*dest)?, imm),
            Instruction::MovRL { dest, label } => format!("mov {}, {}", resolve(*dest)?, label),
            Instruction::MovRM { dest, src } => {
                format!("mov {}, qword {}", resolve(*dest)?, src.to_nasm(allocation)?)
            }
            Instruction::MovMR { dest, src } => {
                format!("mov qword {}, {}", dest.to_nasm(allocation)?, resolve(*src)?)
            }
            Instruction::AddRR { dest, src } => {
                format!("add {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::SubRR { dest, src } => {
                format!("sub {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::ImulRR { dest, src } => {
                format!("imul {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::AndRR { dest, src } => {
                format!("and {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::OrRR { dest, src } => {
                format!("or {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::XorRR { dest, src } => {
                format!("xor {}, {}", resolve(*dest)?, resolve(*src)?)
            }
            Instruction::XorRI { dest, imm } => format!("xor {}, {}", resolve(*dest)?, imm),
            Instruction::Cqo => "cqo".to_string(),
            Instruction::IdivR { divisor } => format!("idiv {}", resolve(*divisor)?),
            Instruction::NegR { dest } => format!("neg {}", resolve(*dest)?),
            Instruction::NotR { dest } => format!("not {}", resolve(*dest)?),
            Instruction::SalRCl { dest } => format!("sal {}, cl", resolve(*dest)?),
            Instruction::SarRCl { dest } => format!("sar {}, cl", resolve(*dest)?),
            Instruction::CmpRR { left, right } => {
                format!("cmp {}, {}", resolve(*left)?, resolve(*right)?)
            }
            Instruction::TestRR { left, right } => {
                format!("test {}, {}", resolve(*left)?, resolve(*right)?)
            }
            Instruction::SetCc { cond, dest } => {
                format!("set{} {}", cond.to_nasm(), resolve_byte(*dest)?)
            }
            Instruction::PushR { src } => format!("push {}", resolve(*src)?),
            Instruction::PopR { dest } => format!("pop {}", resolve(*dest)?),
            Instruction::CallLabel { target, .. } => format!("call {}", target),
            Instruction::Jmp { target } => format!("jmp {}", target),
            Instruction::JCc { cond, target } => format!("j{} {}", cond.to_nasm(), target),
            Instruction::Ret => "ret".to_string(),
        })
    }
}
