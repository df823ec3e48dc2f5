//! Register model
//!
//! Code generation works on an unbounded supply of symbolic registers; the
//! allocator later maps them onto the x86-64 register file. Physical
//! registers appear in the IR wherever the calling convention pins a value
//! (argument registers, the result register, the stack and frame pointers).

use std::fmt;

/// The x86-64 general-purpose register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysReg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl PhysReg {
    /// NASM name of the full 64-bit register.
    pub fn to_nasm(self) -> &'static str {
        match self {
            PhysReg::Rax => "rax",
            PhysReg::Rbx => "rbx",
            PhysReg::Rcx => "rcx",
            PhysReg::Rdx => "rdx",
            PhysReg::Rsi => "rsi",
            PhysReg::Rdi => "rdi",
            PhysReg::Rbp => "rbp",
            PhysReg::Rsp => "rsp",
            PhysReg::R8 => "r8",
            PhysReg::R9 => "r9",
            PhysReg::R10 => "r10",
            PhysReg::R11 => "r11",
            PhysReg::R12 => "r12",
            PhysReg::R13 => "r13",
            PhysReg::R14 => "r14",
            PhysReg::R15 => "r15",
        }
    }

    /// NASM name of the low byte, as needed by `setcc`.
    pub fn to_nasm_byte(self) -> &'static str {
        match self {
            PhysReg::Rax => "al",
            PhysReg::Rbx => "bl",
            PhysReg::Rcx => "cl",
            PhysReg::Rdx => "dl",
            PhysReg::Rsi => "sil",
            PhysReg::Rdi => "dil",
            PhysReg::Rbp => "bpl",
            PhysReg::Rsp => "spl",
            PhysReg::R8 => "r8b",
            PhysReg::R9 => "r9b",
            PhysReg::R10 => "r10b",
            PhysReg::R11 => "r11b",
            PhysReg::R12 => "r12b",
            PhysReg::R13 => "r13b",
            PhysReg::R14 => "r14b",
            PhysReg::R15 => "r15b",
        }
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_nasm())
    }
}

/// Argument registers of the calling convention, in position order.
pub const ARGUMENT_REGISTERS: [PhysReg; 6] = [
    PhysReg::Rdi,
    PhysReg::Rsi,
    PhysReg::Rdx,
    PhysReg::Rcx,
    PhysReg::R8,
    PhysReg::R9,
];

/// Registers a call may clobber; the caller must not keep values in them
/// across a call.
pub const CALLER_SAVED: [PhysReg; 9] = [
    PhysReg::Rax,
    PhysReg::Rcx,
    PhysReg::Rdx,
    PhysReg::Rsi,
    PhysReg::Rdi,
    PhysReg::R8,
    PhysReg::R9,
    PhysReg::R10,
    PhysReg::R11,
];

/// Registers preserved across calls, RSP and RBP excluded (those are
/// managed by the prologue and epilogue directly).
pub const CALLEE_SAVED: [PhysReg; 5] = [
    PhysReg::Rbx,
    PhysReg::R12,
    PhysReg::R13,
    PhysReg::R14,
    PhysReg::R15,
];

/// The palette available to the register allocator. RSP and RBP are never
/// handed out; everything else is fair game.
pub const ALLOCATABLE: [PhysReg; 14] = [
    PhysReg::Rax,
    PhysReg::Rbx,
    PhysReg::Rcx,
    PhysReg::Rdx,
    PhysReg::Rsi,
    PhysReg::Rdi,
    PhysReg::R8,
    PhysReg::R9,
    PhysReg::R10,
    PhysReg::R11,
    PhysReg::R12,
    PhysReg::R13,
    PhysReg::R14,
    PhysReg::R15,
];

/// The register in which a function leaves its result.
pub const RESULT_REGISTER: PhysReg = PhysReg::Rax;

/// A register as seen by instruction selection and liveness: either a
/// pinned physical register or a symbolic one awaiting allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Phys(PhysReg),
    Virt(u32),
}

impl Register {
    pub fn is_physical(self) -> bool {
        matches!(self, Register::Phys(_))
    }

    pub fn as_physical(self) -> Option<PhysReg> {
        match self {
            Register::Phys(reg) => Some(reg),
            Register::Virt(_) => None,
        }
    }
}

impl From<PhysReg> for Register {
    fn from(reg: PhysReg) -> Self {
        Register::Phys(reg)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Phys(reg) => write!(f, "{}", reg),
            Register::Virt(id) => write!(f, "v{}", id),
        }
    }
}

/// Mints fresh symbolic registers. One pool is owned by each per-function
/// compilation context; there is no global counter.
#[derive(Debug, Default)]
pub struct RegisterPool {
    next: u32,
}

impl RegisterPool {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn fresh(&mut self) -> Register {
        let id = self.next;
        self.next += 1;
        Register::Virt(id)
    }
}
