//! Addressing modes
//!
//! Value objects for the memory operand forms the target supports:
//! a bare displacement, base register plus displacement, base plus scaled
//! index plus displacement, and scaled index plus displacement. Each form
//! renders to NASM operand syntax once the register allocation is known.

use crate::emit::EmitError;
use std::collections::BTreeMap;
use std::fmt;
use vega_ir::register::{PhysReg, Register};

/// The constant part of a memory operand: a literal address or a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryAddress {
    Const(i64),
    Label(String),
    /// A fixed slot inside a label-addressed block, `label + offset`.
    LabelOffset { label: String, offset: i64 },
}

impl MemoryAddress {
    fn is_zero(&self) -> bool {
        matches!(self, MemoryAddress::Const(0))
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAddress::Const(address) => write!(f, "{}", address),
            MemoryAddress::Label(label) => write!(f, "{}", label),
            MemoryAddress::LabelOffset { label, offset } => {
                write!(f, "{} + {}", label, offset)
            }
        }
    }
}

/// Index scale; only these four factors are encodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    One,
    Two,
    Four,
    Eight,
}

impl Scale {
    pub fn factor(self) -> u8 {
        match self {
            Scale::One => 1,
            Scale::Two => 2,
            Scale::Four => 4,
            Scale::Eight => 8,
        }
    }
}

/// A memory operand before register allocation; `base` and `index` may be
/// symbolic registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// `[displacement]`
    Displacement { displacement: MemoryAddress },
    /// `[base]` or `[base + displacement]`
    Base {
        base: Register,
        displacement: MemoryAddress,
    },
    /// `[base + (index * scale) + displacement]` and its degenerate forms
    BaseAndIndex {
        base: Register,
        index: Register,
        scale: Scale,
        displacement: MemoryAddress,
    },
    /// `[(index * scale)]` or `[(index * scale) + displacement]`
    IndexAndDisplacement {
        index: Register,
        scale: Scale,
        displacement: MemoryAddress,
    },
}

impl Addressing {
    pub fn base(base: Register) -> Self {
        Addressing::Base {
            base,
            displacement: MemoryAddress::Const(0),
        }
    }

    /// Registers the operand reads when the address is computed.
    pub fn registers(&self) -> Vec<Register> {
        match self {
            Addressing::Displacement { .. } => vec![],
            Addressing::Base { base, .. } => vec![*base],
            Addressing::BaseAndIndex { base, index, .. } => vec![*base, *index],
            Addressing::IndexAndDisplacement { index, .. } => vec![*index],
        }
    }

    /// NASM operand text under the given register assignment.
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
        Ok(match self {
            Addressing::Displacement { displacement } => format!("[{}]", displacement),
            Addressing::Base { base, displacement } => {
                if displacement.is_zero() {
                    format!("[{}]", resolve(*base)?)
                } else {
                    format!("[{} + {}]", resolve(*base)?, displacement)
                }
            }
            Addressing::BaseAndIndex {
                base,
                index,
                scale,
                displacement,
            } => {
                let index_part = if *scale == Scale::One {
                    resolve(*index)?.to_string()
                } else {
                    format!("({} * {})", resolve(*index)?, scale.factor())
                };
                if displacement.is_zero() {
                    format!("[{} + {}]", resolve(*base)?, index_part)
                } else {
                    format!("[{} + {} + {}]", resolve(*base)?, index_part, displacement)
                }
            }
            Addressing::IndexAndDisplacement {
                index,
                scale,
                displacement,
            } => {
                if displacement.is_zero() {
                    format!("[({} * {})]", resolve(*index)?, scale.factor())
                } else {
                    format!(
                        "[({} * {}) + {}]",
                        resolve(*index)?,
                        scale.factor(),
                        displacement
                    )
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vega_ir::register::RegisterPool;

    fn allocation(pairs: &[(Register, PhysReg)]) -> BTreeMap<Register, PhysReg> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_displacement_forms() {
        let empty = allocation(&[]);
        let label = Addressing::Displacement {
            displacement: MemoryAddress::Label("globals".to_string()),
        };
        assert_eq!(label.to_nasm(&empty).unwrap(), "[globals]");
        let constant = Addressing::Displacement {
            displacement: MemoryAddress::Const(640),
        };
        assert_eq!(constant.to_nasm(&empty).unwrap(), "[640]");
        let slot = Addressing::Displacement {
            displacement: MemoryAddress::LabelOffset {
                label: "globals".to_string(),
                offset: 16,
            },
        };
        assert_eq!(slot.to_nasm(&empty).unwrap(), "[globals + 16]");
    }

    #[test]
    fn test_base_forms() {
        let mut pool = RegisterPool::new();
        let base = pool.fresh();
        let alloc = allocation(&[(base, PhysReg::Rbp)]);
        assert_eq!(Addressing::base(base).to_nasm(&alloc).unwrap(), "[rbp]");
        let with_offset = Addressing::Base {
            base,
            displacement: MemoryAddress::Const(-8),
        };
        assert_eq!(with_offset.to_nasm(&alloc).unwrap(), "[rbp + -8]");
    }

    #[test]
    fn test_base_and_index_forms() {
        let mut pool = RegisterPool::new();
        let base = pool.fresh();
        let index = pool.fresh();
        let alloc = allocation(&[(base, PhysReg::Rax), (index, PhysReg::Rbx)]);

        let unit_scale = Addressing::BaseAndIndex {
            base,
            index,
            scale: Scale::One,
            displacement: MemoryAddress::Const(0),
        };
        assert_eq!(unit_scale.to_nasm(&alloc).unwrap(), "[rax + rbx]");

        let scaled = Addressing::BaseAndIndex {
            base,
            index,
            scale: Scale::Eight,
            displacement: MemoryAddress::Const(16),
        };
        assert_eq!(scaled.to_nasm(&alloc).unwrap(), "[rax + (rbx * 8) + 16]");
    }

    #[test]
    fn test_index_and_displacement_forms() {
        let mut pool = RegisterPool::new();
        let index = pool.fresh();
        let alloc = allocation(&[(index, PhysReg::Rcx)]);
        let scaled = Addressing::IndexAndDisplacement {
            index,
            scale: Scale::Four,
            displacement: MemoryAddress::Label("globals".to_string()),
        };
        assert_eq!(scaled.to_nasm(&alloc).unwrap(), "[(rcx * 4) + globals]");
    }

    #[test]
    fn test_unallocated_register_is_an_error() {
        let mut pool = RegisterPool::new();
        let base = pool.fresh();
        let result = Addressing::base(base).to_nasm(&allocation(&[]));
        assert_eq!(result, Err(EmitError::UnallocatedRegister(base)));
    }
}
