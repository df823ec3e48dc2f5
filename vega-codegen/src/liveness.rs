//! Liveness analysis
//!
//! Backward may-live dataflow over a linear program, followed by
//! interference- and copy-graph construction. Per instruction, `gen` is
//! the registers read and `kill` the registers written; the meet is set
//! union, and the fixed point exists because the lattice is bounded by the
//! finite register universe. For each instruction, every defined register
//! interferes with every register live out of it, except itself and
//! except the source of a plain move defining its destination; plain
//! moves additionally contribute copy-graph edges, the coalescing
//! candidates.

use crate::instruction::{Asmable, Instruction};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use vega_ir::register::Register;

/// The two undirected graphs register allocation works on, with one vertex
/// per register occurring in the program.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LivenessGraphs {
    pub interference: BTreeMap<Register, BTreeSet<Register>>,
    pub copy: BTreeMap<Register, BTreeSet<Register>>,
}

/// Successor positions of each item in the linear program. Labels fall
/// through; jumps follow their targets; `ret` has no successor.
fn successors(program: &[Asmable]) -> Vec<Vec<usize>> {
    let label_positions: BTreeMap<&str, usize> = program
        .iter()
        .enumerate()
        .filter_map(|(index, asmable)| match asmable {
            Asmable::Label(label) => Some((label.as_str(), index)),
            Asmable::Instruction(_) => None,
        })
        .collect();

    program
        .iter()
        .enumerate()
        .map(|(index, asmable)| {
            let next = if index + 1 < program.len() {
                vec![index + 1]
            } else {
                vec![]
            };
            match asmable {
                Asmable::Label(_) => next,
                Asmable::Instruction(Instruction::Ret) => vec![],
                Asmable::Instruction(Instruction::Jmp { target }) => label_positions
                    .get(target.as_str())
                    .map(|position| vec![*position])
                    .unwrap_or_default(),
                Asmable::Instruction(Instruction::JCc { target, .. }) => {
                    let mut successors = next;
                    if let Some(position) = label_positions.get(target.as_str()) {
                        successors.push(*position);
                    }
                    successors
                }
                Asmable::Instruction(_) => next,
            }
        })
        .collect()
}

/// Live-out set of every item in the program, by fixed-point iteration.
fn live_out_sets(program: &[Asmable]) -> Vec<BTreeSet<Register>> {
    let successors = successors(program);
    let mut live_in: Vec<BTreeSet<Register>> = vec![BTreeSet::new(); program.len()];
    let mut live_out: Vec<BTreeSet<Register>> = vec![BTreeSet::new(); program.len()];

    let mut changed = true;
    let mut rounds = 0usize;
    while changed {
        changed = false;
        rounds += 1;
        for index in (0..program.len()).rev() {
            let mut out = BTreeSet::new();
            for successor in &successors[index] {
                out.extend(live_in[*successor].iter().copied());
            }

            let mut incoming = out.clone();
            if let Asmable::Instruction(instruction) = &program[index] {
                for killed in instruction.regs_defined() {
                    incoming.remove(&killed);
                }
                incoming.extend(instruction.regs_used());
            }

            if out != live_out[index] {
                live_out[index] = out;
                changed = true;
            }
            if incoming != live_in[index] {
                live_in[index] = incoming;
                changed = true;
            }
        }
    }
    debug!("liveness fixed point after {} rounds", rounds);
    live_out
}

/// Computes the interference and copy graphs of a linear program.
pub fn compute_liveness(program: &[Asmable]) -> LivenessGraphs {
    let mut graphs = LivenessGraphs::default();
    for asmable in program {
        if let Asmable::Instruction(instruction) = asmable {
            for register in instruction
                .regs_used()
                .into_iter()
                .chain(instruction.regs_defined())
            {
                graphs.interference.entry(register).or_default();
                graphs.copy.entry(register).or_default();
            }
        }
    }

    let live_out = live_out_sets(program);
    for (index, asmable) in program.iter().enumerate() {
        let Asmable::Instruction(instruction) = asmable else {
            continue;
        };
        let copy = instruction.as_copy();

        // A register being defined here is live "at" the definition even
        // if it is dead afterwards; without this, two back-to-back dead
        // definitions could share a register with a live value.
        let mut live_across: BTreeSet<Register> = live_out[index].clone();
        live_across.extend(instruction.regs_defined());

        for defined in instruction.regs_defined() {
            for live in &live_across {
                if *live == defined {
                    continue;
                }
                if copy == Some((defined, *live)) {
                    continue;
                }
                graphs
                    .interference
                    .entry(defined)
                    .or_default()
                    .insert(*live);
                graphs
                    .interference
                    .entry(*live)
                    .or_default()
                    .insert(defined);
            }
        }

        if let Some((dest, src)) = copy {
            if dest != src {
                graphs.copy.entry(dest).or_default().insert(src);
                graphs.copy.entry(src).or_default().insert(dest);
            }
        }
    }
    graphs
}
