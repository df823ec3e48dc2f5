//! Register allocation
//!
//! Graph coloring over the interference graph with the physical palette.
//! Physical registers appearing in the program are precolored to
//! themselves; symbolic registers are colored greedily in handle order
//! (deterministic), preferring a color already given to a copy-graph
//! neighbor so the corresponding move coalesces away at emission. An
//! uncolorable graph is a hard compilation limit reported explicitly,
//! never a silently wrong assignment.

use crate::liveness::LivenessGraphs;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use vega_ir::register::{PhysReg, Register};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegAllocError {
    #[error("ran out of registers while coloring {0}; spilling is not supported")]
    OutOfRegisters(Register),
}

/// A complete physical assignment for every register in the graphs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub assignment: BTreeMap<Register, PhysReg>,
}

/// Colors the interference graph with `palette`.
pub fn allocate_registers(
    graphs: &LivenessGraphs,
    palette: &[PhysReg],
) -> Result<Allocation, RegAllocError> {
    let mut assignment: BTreeMap<Register, PhysReg> = BTreeMap::new();

    // Physical registers keep themselves, whether or not they are in the
    // palette; RSP and RBP show up here through the frame code.
    for register in graphs.interference.keys() {
        if let Register::Phys(phys) = register {
            assignment.insert(*register, *phys);
        }
    }

    let empty = BTreeSet::new();
    for register in graphs.interference.keys() {
        if register.is_physical() {
            continue;
        }
        let neighbors = &graphs.interference[register];
        let forbidden: BTreeSet<PhysReg> = neighbors
            .iter()
            .filter_map(|neighbor| assignment.get(neighbor).copied())
            .collect();

        // Prefer a color shared with a coalescable copy partner.
        let copy_neighbors = graphs.copy.get(register).unwrap_or(&empty);
        let preferred = copy_neighbors
            .iter()
            .filter_map(|neighbor| assignment.get(neighbor).copied())
            .find(|color| palette.contains(color) && !forbidden.contains(color));

        let color = match preferred {
            Some(color) => {
                debug!("coalescing {} into {}", register, color);
                Some(color)
            }
            None => palette
                .iter()
                .copied()
                .find(|color| !forbidden.contains(color)),
        };
        match color {
            Some(color) => {
                assignment.insert(*register, color);
            }
            None => return Err(RegAllocError::OutOfRegisters(*register)),
        }
    }

    Ok(Allocation { assignment })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vega_ir::register::{RegisterPool, ALLOCATABLE};

    fn graphs(
        interference: &[(Register, Register)],
        copies: &[(Register, Register)],
        vertices: &[Register],
    ) -> LivenessGraphs {
        let mut result = LivenessGraphs::default();
        for vertex in vertices {
            result.interference.entry(*vertex).or_default();
            result.copy.entry(*vertex).or_default();
        }
        for (a, b) in interference {
            result.interference.entry(*a).or_default().insert(*b);
            result.interference.entry(*b).or_default().insert(*a);
        }
        for (a, b) in copies {
            result.copy.entry(*a).or_default().insert(*b);
            result.copy.entry(*b).or_default().insert(*a);
        }
        result
    }

    #[test]
    fn test_interfering_registers_get_distinct_colors() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let b = pool.fresh();
        let c = pool.fresh();
        let g = graphs(&[(a, b), (b, c), (a, c)], &[], &[a, b, c]);
        let allocation = allocate_registers(&g, &ALLOCATABLE).unwrap();
        assert_ne!(allocation.assignment[&a], allocation.assignment[&b]);
        assert_ne!(allocation.assignment[&b], allocation.assignment[&c]);
        assert_ne!(allocation.assignment[&a], allocation.assignment[&c]);
    }

    #[test]
    fn test_copy_partners_coalesce() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let b = pool.fresh();
        let unrelated = pool.fresh();
        // a and b are connected only by a move; they share a color.
        let g = graphs(&[(a, unrelated), (b, unrelated)], &[(a, b)], &[a, b, unrelated]);
        let allocation = allocate_registers(&g, &ALLOCATABLE).unwrap();
        assert_eq!(allocation.assignment[&a], allocation.assignment[&b]);
    }

    #[test]
    fn test_coalescing_never_violates_interference() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let b = pool.fresh();
        // A move between interfering registers must not coalesce.
        let g = graphs(&[(a, b)], &[(a, b)], &[a, b]);
        let allocation = allocate_registers(&g, &ALLOCATABLE).unwrap();
        assert_ne!(allocation.assignment[&a], allocation.assignment[&b]);
    }

    #[test]
    fn test_precolored_registers_constrain_neighbors() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let rax: Register = PhysReg::Rax.into();
        let g = graphs(&[(a, rax)], &[], &[a, rax]);
        let allocation = allocate_registers(&g, &ALLOCATABLE).unwrap();
        assert_eq!(allocation.assignment[&rax], PhysReg::Rax);
        assert_ne!(allocation.assignment[&a], PhysReg::Rax);
    }

    #[test]
    fn test_copy_preference_follows_a_physical_partner() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let rdi: Register = PhysReg::Rdi.into();
        // `a` is moved into rdi and does not interfere with it: it lands
        // in rdi, erasing the move.
        let g = graphs(&[], &[(a, rdi)], &[a, rdi]);
        let allocation = allocate_registers(&g, &ALLOCATABLE).unwrap();
        assert_eq!(allocation.assignment[&a], PhysReg::Rdi);
    }

    #[test]
    fn test_palette_exhaustion_is_detected() {
        let mut pool = RegisterPool::new();
        let palette = [PhysReg::Rax, PhysReg::Rbx];
        let a = pool.fresh();
        let b = pool.fresh();
        let c = pool.fresh();
        // A triangle needs three colors; two are available.
        let g = graphs(&[(a, b), (b, c), (a, c)], &[], &[a, b, c]);
        assert_eq!(
            allocate_registers(&g, &palette),
            Err(RegAllocError::OutOfRegisters(c))
        );
    }

    #[test]
    fn test_deterministic_assignment() {
        let mut pool = RegisterPool::new();
        let a = pool.fresh();
        let b = pool.fresh();
        let g = graphs(&[(a, b)], &[], &[a, b]);
        let first = allocate_registers(&g, &ALLOCATABLE).unwrap();
        let second = allocate_registers(&g, &ALLOCATABLE).unwrap();
        assert_eq!(first, second);
    }
}
