//! Control flow graph
//!
//! Vertices are tree roots (top-level IR nodes, one evaluation step each)
//! connected by unconditional and conditional-true/false edges. Edge maps
//! are keyed by node handle, so distinct nodes with identical shape are
//! distinct vertices. A builder accumulates state mutably and freezes it
//! into an immutable [`ControlFlowGraph`] with [`ControlFlowGraphBuilder::build`];
//! merging never mutates the merged-in graphs.

use crate::node::{IrArena, NodeId};
use std::collections::BTreeMap;
use thiserror::Error;

/// Construction defects. These signal a compiler bug, never a user error,
/// and abort compilation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("tried to set a second entry root in a control flow graph")]
    SecondEntryRoot,

    #[error("merged a control flow graph with no entry root")]
    MissingEntryRoot,
}

/// Kind of an outgoing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Unconditional,
    ConditionalTrue,
    ConditionalFalse,
}

/// An immutable control flow graph over tree roots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControlFlowGraph {
    tree_roots: Vec<NodeId>,
    entry: Option<NodeId>,
    unconditional: BTreeMap<NodeId, NodeId>,
    conditional_true: BTreeMap<NodeId, NodeId>,
    conditional_false: BTreeMap<NodeId, NodeId>,
}

impl ControlFlowGraph {
    /// A graph holding a single tree with no edges.
    pub fn single_tree(root: NodeId) -> Self {
        ControlFlowGraph {
            tree_roots: vec![root],
            entry: Some(root),
            ..Default::default()
        }
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry
    }

    pub fn tree_roots(&self) -> &[NodeId] {
        &self.tree_roots
    }

    pub fn is_empty(&self) -> bool {
        self.tree_roots.is_empty()
    }

    pub fn unconditional_link(&self, from: NodeId) -> Option<NodeId> {
        self.unconditional.get(&from).copied()
    }

    pub fn conditional_links(&self, from: NodeId) -> Option<(NodeId, NodeId)> {
        match (
            self.conditional_true.get(&from),
            self.conditional_false.get(&from),
        ) {
            (Some(on_true), Some(on_false)) => Some((*on_true, *on_false)),
            _ => None,
        }
    }

    pub fn unconditional_links(&self) -> &BTreeMap<NodeId, NodeId> {
        &self.unconditional
    }

    pub fn conditional_true_links(&self) -> &BTreeMap<NodeId, NodeId> {
        &self.conditional_true
    }

    pub fn conditional_false_links(&self) -> &BTreeMap<NodeId, NodeId> {
        &self.conditional_false
    }

    fn has_outgoing(&self, root: NodeId) -> bool {
        self.unconditional.contains_key(&root)
            || self.conditional_true.contains_key(&root)
            || self.conditional_false.contains_key(&root)
    }

    /// Roots with no outgoing edge, in insertion order.
    pub fn final_tree_roots(&self) -> Vec<NodeId> {
        self.tree_roots
            .iter()
            .copied()
            .filter(|root| !self.has_outgoing(*root))
            .collect()
    }
}

/// Single-owner mutable accumulator for a [`ControlFlowGraph`].
#[derive(Debug, Default)]
pub struct ControlFlowGraphBuilder {
    tree_roots: Vec<NodeId>,
    entry: Option<NodeId>,
    unconditional: BTreeMap<NodeId, NodeId>,
    conditional_true: BTreeMap<NodeId, NodeId>,
    conditional_false: BTreeMap<NodeId, NodeId>,
}

impl ControlFlowGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(entry: NodeId) -> Self {
        ControlFlowGraphBuilder {
            tree_roots: vec![entry],
            entry: Some(entry),
            ..Default::default()
        }
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry
    }

    fn add_root(&mut self, root: NodeId) {
        if !self.tree_roots.contains(&root) {
            self.tree_roots.push(root);
        }
    }

    fn links_mut(&mut self, link_type: LinkType) -> &mut BTreeMap<NodeId, NodeId> {
        match link_type {
            LinkType::Unconditional => &mut self.unconditional,
            LinkType::ConditionalTrue => &mut self.conditional_true,
            LinkType::ConditionalFalse => &mut self.conditional_false,
        }
    }

    /// Designates `root` as the entry. Setting a second entry is a fatal
    /// construction defect.
    pub fn set_entry(&mut self, root: NodeId) -> Result<(), IrError> {
        if self.entry.is_some() {
            return Err(IrError::SecondEntryRoot);
        }
        self.entry = Some(root);
        self.add_root(root);
        Ok(())
    }

    /// Records an edge. With `from` absent, `to` becomes the entry root
    /// instead; that fails if an entry already exists.
    pub fn add_link(
        &mut self,
        from: Option<(NodeId, LinkType)>,
        to: NodeId,
    ) -> Result<(), IrError> {
        match from {
            Some((source, link_type)) => {
                self.add_root(source);
                self.add_root(to);
                self.links_mut(link_type).insert(source, to);
                Ok(())
            }
            None => self.set_entry(to),
        }
    }

    fn final_roots(&self) -> Vec<NodeId> {
        self.tree_roots
            .iter()
            .copied()
            .filter(|root| {
                !self.unconditional.contains_key(root)
                    && !self.conditional_true.contains_key(root)
                    && !self.conditional_false.contains_key(root)
            })
            .collect()
    }

    /// Appends `to` after every currently-terminal root; with an empty
    /// graph, `to` becomes the entry. This is how straight-line sequencing
    /// continues after branches reconverge.
    pub fn add_link_from_all_final_roots(
        &mut self,
        link_type: LinkType,
        to: NodeId,
    ) -> Result<(), IrError> {
        let sources = self.final_roots();
        for source in sources {
            self.add_link(Some((source, link_type)), to)?;
        }
        if self.entry.is_none() {
            self.set_entry(to)?;
        } else {
            self.add_root(to);
        }
        Ok(())
    }

    /// Imports every root and edge of `cfg`; adopts its entry if the
    /// receiver has none.
    pub fn add_all_from(&mut self, cfg: &ControlFlowGraph) {
        for root in cfg.tree_roots() {
            self.add_root(*root);
        }
        if self.entry.is_none() {
            self.entry = cfg.entry();
        }
        self.unconditional.extend(cfg.unconditional_links());
        self.conditional_true.extend(cfg.conditional_true_links());
        self.conditional_false.extend(cfg.conditional_false_links());
    }

    /// Sequences `cfg` after the receiver: every final root gains an
    /// unconditional edge to `cfg`'s entry. Merging an empty graph is a
    /// no-op; a non-empty graph without an entry is malformed.
    pub fn merge_unconditionally(&mut self, cfg: &ControlFlowGraph) -> Result<(), IrError> {
        if cfg.is_empty() {
            return Ok(());
        }
        let target = cfg.entry().ok_or(IrError::MissingEntryRoot)?;
        for source in self.final_roots() {
            self.links_mut(LinkType::Unconditional).insert(source, target);
        }
        self.add_all_from(cfg);
        if self.entry.is_none() {
            self.entry = Some(target);
        }
        Ok(())
    }

    /// Branches after the receiver: every final root gains a
    /// conditional-true edge to `on_true`'s entry and a conditional-false
    /// edge to `on_false`'s entry.
    pub fn merge_conditionally(
        &mut self,
        on_true: &ControlFlowGraph,
        on_false: &ControlFlowGraph,
    ) -> Result<(), IrError> {
        let true_target = on_true.entry().ok_or(IrError::MissingEntryRoot)?;
        let false_target = on_false.entry().ok_or(IrError::MissingEntryRoot)?;
        for source in self.final_roots() {
            self.links_mut(LinkType::ConditionalTrue)
                .insert(source, true_target);
            self.links_mut(LinkType::ConditionalFalse)
                .insert(source, false_target);
        }
        self.add_all_from(on_true);
        self.add_all_from(on_false);
        Ok(())
    }

    /// Appends a single tree after all final roots.
    pub fn add_single_tree(&mut self, root: NodeId) -> Result<(), IrError> {
        self.merge_unconditionally(&ControlFlowGraph::single_tree(root))
    }

    /// Replaces every root matching `filter` with `rewrite`'s result,
    /// remapping the edge maps and the entry consistently. The rewrite may
    /// allocate new nodes; the replacement is a handle remap, not a deep
    /// tree rewrite.
    pub fn update_nodes(
        &mut self,
        arena: &mut IrArena,
        filter: impl Fn(&IrArena, NodeId) -> bool,
        rewrite: impl Fn(&mut IrArena, NodeId) -> NodeId,
    ) {
        let mut replacements: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        for root in &self.tree_roots {
            let new_root = if filter(arena, *root) {
                rewrite(arena, *root)
            } else {
                *root
            };
            replacements.insert(*root, new_root);
        }

        let remap = |links: &BTreeMap<NodeId, NodeId>| {
            links
                .iter()
                .map(|(from, to)| (replacements[from], replacements[to]))
                .collect::<BTreeMap<_, _>>()
        };
        self.unconditional = remap(&self.unconditional);
        self.conditional_true = remap(&self.conditional_true);
        self.conditional_false = remap(&self.conditional_false);
        self.entry = self.entry.map(|entry| replacements[&entry]);
        self.tree_roots = self.tree_roots.iter().map(|root| replacements[root]).collect();
    }

    /// Freezes the accumulated state.
    pub fn build(self) -> ControlFlowGraph {
        ControlFlowGraph {
            tree_roots: self.tree_roots,
            entry: self.entry,
            unconditional: self.unconditional,
            conditional_true: self.conditional_true,
            conditional_false: self.conditional_false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{IrArena, IrNode};
    use crate::register::RegisterPool;
    use pretty_assertions::assert_eq;

    struct Fixture {
        arena: IrArena,
        entry_node: NodeId,
        second_node: NodeId,
        true_node: NodeId,
        false_node: NodeId,
    }

    fn fixture() -> Fixture {
        let mut arena = IrArena::new();
        let mut pool = RegisterPool::new();
        let to_read = pool.fresh();
        let to_write = pool.fresh();
        let inner = arena.register_read(to_read);
        let entry_node = arena.register_write(to_write, inner);
        let second_node = arena.no_op();
        let true_node = arena.no_op();
        let false_node = arena.no_op();
        Fixture {
            arena,
            entry_node,
            second_node,
            true_node,
            false_node,
        }
    }

    fn diamond(fx: &Fixture) -> ControlFlowGraph {
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_link(None, fx.entry_node).unwrap();
        builder
            .add_link(Some((fx.entry_node, LinkType::Unconditional)), fx.second_node)
            .unwrap();
        builder
            .add_link(Some((fx.second_node, LinkType::ConditionalTrue)), fx.true_node)
            .unwrap();
        builder
            .add_link(
                Some((fx.second_node, LinkType::ConditionalFalse)),
                fx.false_node,
            )
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_entry_in_constructor() {
        let fx = fixture();
        let cfg = ControlFlowGraphBuilder::with_entry(fx.entry_node).build();
        assert_eq!(cfg.entry(), Some(fx.entry_node));
        assert_eq!(cfg.tree_roots(), &[fx.entry_node]);
        assert!(cfg.unconditional_links().is_empty());
        assert!(cfg.conditional_true_links().is_empty());
        assert!(cfg.conditional_false_links().is_empty());
    }

    #[test]
    fn test_set_entry() {
        let fx = fixture();
        let mut builder = ControlFlowGraphBuilder::new();
        builder.set_entry(fx.entry_node).unwrap();
        assert_eq!(
            builder.build(),
            ControlFlowGraphBuilder::with_entry(fx.entry_node).build()
        );
    }

    #[test]
    fn test_second_entry_is_an_error() {
        let fx = fixture();
        let mut builder = ControlFlowGraphBuilder::with_entry(fx.entry_node);
        assert_eq!(builder.set_entry(fx.entry_node), Err(IrError::SecondEntryRoot));
        assert_eq!(builder.add_link(None, fx.second_node), Err(IrError::SecondEntryRoot));
    }

    #[test]
    fn test_add_link_builds_diamond() {
        let fx = fixture();
        let cfg = diamond(&fx);
        assert_eq!(cfg.entry(), Some(fx.entry_node));
        assert_eq!(cfg.unconditional_link(fx.entry_node), Some(fx.second_node));
        assert_eq!(
            cfg.conditional_links(fx.second_node),
            Some((fx.true_node, fx.false_node))
        );
        assert_eq!(cfg.final_tree_roots(), vec![fx.true_node, fx.false_node]);
    }

    #[test]
    fn test_add_all_from() {
        let fx = fixture();
        let cfg = diamond(&fx);
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_all_from(&cfg);
        assert_eq!(builder.build(), cfg);
    }

    #[test]
    fn test_add_link_from_all_final_roots_on_empty_graph() {
        let fx = fixture();
        let mut builder = ControlFlowGraphBuilder::new();
        builder
            .add_link_from_all_final_roots(LinkType::Unconditional, fx.entry_node)
            .unwrap();
        assert_eq!(
            builder.build(),
            ControlFlowGraphBuilder::with_entry(fx.entry_node).build()
        );
    }

    #[test]
    fn test_add_link_from_all_final_roots_after_branch() {
        let mut fx = fixture();
        let mut builder = ControlFlowGraphBuilder::new();
        builder.add_all_from(&diamond(&fx));

        // Reconverge both branch arms onto a fresh join node.
        let join = fx.arena.no_op();
        builder
            .add_link_from_all_final_roots(LinkType::Unconditional, join)
            .unwrap();
        let cfg = builder.build();
        assert_eq!(cfg.unconditional_link(fx.true_node), Some(join));
        assert_eq!(cfg.unconditional_link(fx.false_node), Some(join));
        assert_eq!(cfg.final_tree_roots(), vec![join]);
    }

    #[test]
    fn test_merge_unconditionally_laws() {
        // Entry stays A's entry, finals become B's finals, one new edge per
        // former A-final-root.
        let mut arena = IrArena::new();
        let a1 = arena.no_op();
        let a2 = arena.no_op();
        let b1 = arena.no_op();
        let b2 = arena.no_op();

        let mut a = ControlFlowGraphBuilder::with_entry(a1);
        a.add_link(Some((a1, LinkType::Unconditional)), a2).unwrap();
        let mut b_builder = ControlFlowGraphBuilder::with_entry(b1);
        b_builder.add_link(Some((b1, LinkType::Unconditional)), b2).unwrap();
        let b = b_builder.build();

        a.merge_unconditionally(&b).unwrap();
        let merged = a.build();

        assert_eq!(merged.entry(), Some(a1));
        assert_eq!(merged.final_tree_roots(), vec![b2]);
        assert_eq!(merged.unconditional_link(a1), Some(a2));
        assert_eq!(merged.unconditional_link(a2), Some(b1));
        assert_eq!(merged.unconditional_link(b1), Some(b2));
    }

    #[test]
    fn test_merge_unconditionally_empty_is_noop() {
        let mut arena = IrArena::new();
        let a1 = arena.no_op();
        let mut a = ControlFlowGraphBuilder::with_entry(a1);
        a.merge_unconditionally(&ControlFlowGraph::default()).unwrap();
        let cfg = a.build();
        assert_eq!(cfg.final_tree_roots(), vec![a1]);
    }

    #[test]
    fn test_merge_conditionally() {
        let mut arena = IrArena::new();
        let cond = arena.no_op();
        let t = arena.no_op();
        let f = arena.no_op();

        let mut builder = ControlFlowGraphBuilder::with_entry(cond);
        builder
            .merge_conditionally(
                &ControlFlowGraph::single_tree(t),
                &ControlFlowGraph::single_tree(f),
            )
            .unwrap();
        let cfg = builder.build();

        assert_eq!(cfg.conditional_links(cond), Some((t, f)));
        assert_eq!(cfg.unconditional_link(cond), None);
        assert_eq!(cfg.final_tree_roots(), vec![t, f]);
    }

    #[test]
    fn test_merge_conditionally_missing_entry() {
        let mut arena = IrArena::new();
        let cond = arena.no_op();
        let t = arena.no_op();
        let mut builder = ControlFlowGraphBuilder::with_entry(cond);
        let result = builder.merge_conditionally(
            &ControlFlowGraph::single_tree(t),
            &ControlFlowGraph::default(),
        );
        assert_eq!(result, Err(IrError::MissingEntryRoot));
    }

    #[test]
    fn test_update_nodes_remaps_edges_and_entry() {
        let mut arena = IrArena::new();
        let first = arena.constant(1);
        let second = arena.no_op();
        let mut builder = ControlFlowGraphBuilder::with_entry(first);
        builder.add_link(Some((first, LinkType::Unconditional)), second).unwrap();

        builder.update_nodes(
            &mut arena,
            |arena, id| matches!(arena.get(id), IrNode::Const(_)),
            |arena, _| arena.constant(2),
        );
        let cfg = builder.build();

        let entry = cfg.entry().unwrap();
        assert_ne!(entry, first);
        assert_eq!(arena.get(entry), &IrNode::Const(2));
        assert_eq!(cfg.unconditional_link(entry), Some(second));
        assert_eq!(cfg.unconditional_link(first), None);
    }
}
