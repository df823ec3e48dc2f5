//! Program emission
//!
//! Renders the final NASM listing: `extern` declarations for runtime
//! symbols, a `.bss` section providing the reserved `display` and
//! `globals` storage, the `main` entry trampoline calling the program's
//! main function, and one label plus instruction block per function with
//! its register allocation applied.

use crate::instruction::Asmable;
use std::collections::BTreeMap;
use thiserror::Error;
use vega_ir::register::{PhysReg, Register};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("register {0} has no physical assignment")]
    UnallocatedRegister(Register),
}

/// One function's linear code together with its register assignment.
#[derive(Debug)]
pub struct FunctionCode {
    pub instructions: Vec<Asmable>,
    pub allocation: BTreeMap<Register, PhysReg>,
}

/// Everything needed to render the complete program.
#[derive(Debug)]
pub struct CodeImage {
    pub main_label: String,
    /// Main returns no value; the trampoline zeroes the process exit code.
    pub ignore_main_result: bool,
    pub externs: Vec<String>,
    pub globals_slot_count: usize,
    pub display_slot_count: usize,
    pub functions: Vec<(String, FunctionCode)>,
}

impl CodeImage {
    /// The full NASM listing.
    pub fn to_nasm(&self) -> Result<String, EmitError> {
        let mut out = String::new();

        for symbol in &self.externs {
            out.push_str(&format!("extern {}\n", symbol));
        }
        if !self.externs.is_empty() {
            out.push('\n');
        }

        out.push_str("section .bss\n");
        out.push_str(&format!("display: resq {}\n", self.display_slot_count));
        if self.globals_slot_count > 0 {
            out.push_str(&format!("globals: resq {}\n", self.globals_slot_count));
        }
        out.push('\n');

        out.push_str("section .text\n");
        out.push_str("global main\n");
        out.push_str("main:\n");
        out.push_str("    push rbp\n");
        out.push_str("    mov rbp, rsp\n");
        out.push_str(&format!("    call {}\n", self.main_label));
        if self.ignore_main_result {
            out.push_str("    xor rax, rax\n");
        }
        out.push_str("    pop rbp\n");
        out.push_str("    ret\n");

        for (label, code) in &self.functions {
            out.push('\n');
            out.push_str(&format!("{}:\n", label));
            for asmable in &code.instructions {
                match asmable {
                    Asmable::Label(local) => out.push_str(&format!("{}:\n", local)),
                    Asmable::Instruction(instruction) => {
                        out.push_str(&format!(
                            "    {}\n",
                            instruction.to_nasm(&code.allocation)?
                        ));
                    }
                }
            }
        }
        Ok(out)
    }
}
