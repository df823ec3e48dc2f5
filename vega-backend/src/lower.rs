//! AST to CFG lowering
//!
//! Turns the resolved program into one control flow graph per function:
//! frames and labels are assigned first, then every statement and
//! expression is lowered bottom-up with the CFG builder, and finally the
//! prologue and epilogue are merged around the body. Functions are
//! independent after this point; each carries its own arena and register
//! pool.
//!
//! Evaluation-order note: a subexpression whose sibling has side effects is
//! materialized into a fresh register before the sibling runs, so calls
//! embedded in larger expressions cannot reorder observable effects.

use crate::frame::{gen_call_sequence, FrameDescriptor, FrameError};
use crate::globals::{GlobalAccess, GlobalAccessError};
use crate::naming::{LabelFactory, NamingError};
use crate::storage::assign_storage;
use log::debug;
use std::collections::BTreeMap;
use thiserror::Error;
use vega_common::error::BackendError;
use vega_common::program::{
    BinaryOp, Expr, FunctionId, Owner, Program, Stmt, UnaryOp, VariableId,
};
use vega_ir::cfg::{ControlFlowGraph, ControlFlowGraphBuilder, IrError, LinkType};
use vega_ir::node::{BinaryIrOp, IrArena, NodeId, UnaryIrOp};
use vega_ir::register::RegisterPool;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoweringError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Global(#[from] GlobalAccessError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("call to {0} produces no value but is used in a value context")]
    MissingCallResult(String),

    #[error("return with a value in a function without a result variable")]
    UnexpectedReturnValue,
}

impl From<LoweringError> for BackendError {
    fn from(err: LoweringError) -> Self {
        match err {
            LoweringError::Frame(inner) => BackendError::Frame {
                message: inner.to_string(),
            },
            LoweringError::Naming(inner) => BackendError::Naming {
                message: inner.to_string(),
            },
            LoweringError::Ir(inner) => BackendError::MalformedGraph {
                message: inner.to_string(),
            },
            other => BackendError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// One function ready for instruction selection.
#[derive(Debug)]
pub struct LoweredFunction {
    pub label: String,
    pub arena: IrArena,
    pub cfg: ControlFlowGraph,
    /// Register pool of this function; selection keeps minting from it.
    pub pool: RegisterPool,
}

/// The whole program after lowering, ready for the low-level passes.
#[derive(Debug)]
pub struct LoweredProgram {
    pub functions: Vec<LoweredFunction>,
    pub main_label: String,
    /// Runtime-provided symbols needing `extern` declarations.
    pub externs: Vec<String>,
    pub globals_slot_count: usize,
    pub display_slot_count: usize,
}

/// Lowers every function of `program`.
///
/// Assumes declaration order is topological with respect to nesting (a
/// function appears after its lexical parent), which the frontend
/// guarantees.
pub fn lower_program(program: &Program) -> Result<LoweredProgram, LoweringError> {
    let globals = GlobalAccess::new(program);
    let mut label_factory = LabelFactory::new();
    let mut labels: BTreeMap<FunctionId, String> = BTreeMap::new();
    let mut externs: Vec<String> = Vec::new();

    for id in program.function_ids() {
        let function = program.function(id);
        if function.is_foreign() {
            labels.insert(id, function.name.clone());
            if !externs.contains(&function.name) {
                externs.push(function.name.clone());
            }
        } else {
            let parent_label = function.parent.map(|parent| labels[&parent].clone());
            let label = label_factory.make_label(parent_label.as_deref(), &function.name)?;
            labels.insert(id, label);
        }
    }

    let mut frames: BTreeMap<FunctionId, FrameDescriptor> = BTreeMap::new();
    let mut pools: BTreeMap<FunctionId, RegisterPool> = BTreeMap::new();
    for id in program.function_ids() {
        let function = program.function(id);
        if function.is_foreign() {
            continue;
        }
        let storage = assign_storage(function, program);
        let mut pool = RegisterPool::new();
        let frame = FrameDescriptor::new(function, &storage, labels[&id].clone(), &mut pool);
        frames.insert(id, frame);
        pools.insert(id, pool);
    }

    let mut functions = Vec::new();
    for id in program.function_ids() {
        let function = program.function(id);
        let body = match &function.kind {
            vega_common::program::FunctionKind::Local { body } => body,
            vega_common::program::FunctionKind::Foreign => continue,
        };
        debug!("lowering function {}", labels[&id]);
        let pool = pools.remove(&id).unwrap_or_default();
        let lowered = FunctionLowering {
            program,
            function_id: id,
            frames: &frames,
            labels: &labels,
            globals: &globals,
            arena: IrArena::new(),
            pool,
            return_anchor: None,
        }
        .lower(body)?;
        functions.push(lowered);
    }

    Ok(LoweredProgram {
        functions,
        main_label: labels[&program.main].clone(),
        externs,
        globals_slot_count: globals.slot_count(),
        display_slot_count: program.max_depth() as usize + 1,
    })
}

struct FunctionLowering<'a> {
    program: &'a Program,
    function_id: FunctionId,
    frames: &'a BTreeMap<FunctionId, FrameDescriptor>,
    labels: &'a BTreeMap<FunctionId, String>,
    globals: &'a GlobalAccess,
    arena: IrArena,
    pool: RegisterPool,
    /// Join node every `return` routes through; linked to the epilogue at
    /// the end. Holds a self-loop while the body is being lowered so later
    /// statements never attach to it.
    return_anchor: Option<NodeId>,
}

impl<'a> FunctionLowering<'a> {
    fn lower(mut self, body: &[Stmt]) -> Result<LoweredFunction, LoweringError> {
        let frames = self.frames;
        let frame = &frames[&self.function_id];
        let mut builder = ControlFlowGraphBuilder::new();

        let prologue = frame.gen_prologue(&mut self.arena)?;
        builder.merge_unconditionally(&prologue)?;

        for stmt in body {
            self.lower_stmt(&mut builder, stmt)?;
        }

        let epilogue = frame.gen_epilogue(&mut self.arena)?;
        let epilogue_entry = epilogue.entry().ok_or(IrError::MissingEntryRoot)?;
        builder.merge_unconditionally(&epilogue)?;
        if let Some(anchor) = self.return_anchor {
            // Replace the anchor's self-loop with the real exit edge.
            builder.add_link(Some((anchor, LinkType::Unconditional)), epilogue_entry)?;
        }

        Ok(LoweredFunction {
            label: frame.code_label().to_string(),
            arena: self.arena,
            cfg: builder.build(),
            pool: self.pool,
        })
    }

    fn return_anchor(&mut self, builder: &mut ControlFlowGraphBuilder) -> Result<NodeId, IrError> {
        if let Some(anchor) = self.return_anchor {
            return Ok(anchor);
        }
        let anchor = self.arena.no_op();
        builder.add_link(Some((anchor, LinkType::Unconditional)), anchor)?;
        self.return_anchor = Some(anchor);
        Ok(anchor)
    }

    fn read_variable(&mut self, var: VariableId) -> Result<NodeId, LoweringError> {
        match self.program.properties_of(var).owner {
            Owner::Global => Ok(self.globals.gen_read(&mut self.arena, var)?),
            Owner::Function(owner) => {
                let direct = owner == self.function_id;
                Ok(self.frames[&owner].gen_read(&mut self.arena, var, direct)?)
            }
        }
    }

    fn write_variable(&mut self, var: VariableId, value: NodeId) -> Result<NodeId, LoweringError> {
        match self.program.properties_of(var).owner {
            Owner::Global => Ok(self.globals.gen_write(&mut self.arena, var, value)?),
            Owner::Function(owner) => {
                let direct = owner == self.function_id;
                Ok(self.frames[&owner].gen_write(&mut self.arena, var, value, direct)?)
            }
        }
    }

    /// Stashes a value into a fresh register as an explicit evaluation
    /// step, pinning its position relative to later side effects.
    fn materialize(
        &mut self,
        builder: &mut ControlFlowGraphBuilder,
        value: NodeId,
    ) -> Result<NodeId, LoweringError> {
        let fresh = self.pool.fresh();
        let write = self.arena.register_write(fresh, value);
        builder.add_link_from_all_final_roots(LinkType::Unconditional, write)?;
        Ok(self.arena.register_read(fresh))
    }

    fn lower_call(
        &mut self,
        builder: &mut ControlFlowGraphBuilder,
        callee: FunctionId,
        args: &[Expr],
    ) -> Result<Option<NodeId>, LoweringError> {
        let mut arg_nodes = Vec::with_capacity(args.len());
        for arg in args {
            let node = self.lower_expr(builder, arg)?;
            let node = if arg.has_effects() {
                self.materialize(builder, node)?
            } else {
                node
            };
            arg_nodes.push(node);
        }

        let target = self.program.function(callee);
        let call = if target.is_foreign() {
            gen_call_sequence(
                &mut self.arena,
                &self.labels[&callee],
                &arg_nodes,
                target.returns_value(),
            )?
        } else {
            self.frames[&callee].gen_call(&mut self.arena, &arg_nodes)?
        };
        builder.merge_unconditionally(&call.cfg)?;

        match call.result {
            Some(result) => {
                // Move the result register into a fresh register right
                // away; the next call would clobber it otherwise.
                let stashed = self.materialize(builder, result)?;
                Ok(Some(stashed))
            }
            None => Ok(None),
        }
    }

    fn lower_short_circuit(
        &mut self,
        builder: &mut ControlFlowGraphBuilder,
        left: &Expr,
        right: &Expr,
        is_conjunction: bool,
    ) -> Result<NodeId, LoweringError> {
        let result = self.pool.fresh();

        let condition = self.lower_expr(builder, left)?;
        builder.add_link_from_all_final_roots(LinkType::Unconditional, condition)?;

        let mut rhs_builder = ControlFlowGraphBuilder::new();
        let rhs_value = self.lower_expr(&mut rhs_builder, right)?;
        let write_rhs = self.arena.register_write(result, rhs_value);
        rhs_builder.add_link_from_all_final_roots(LinkType::Unconditional, write_rhs)?;
        let rhs_cfg = rhs_builder.build();

        let short_value = self.arena.constant(if is_conjunction { 0 } else { 1 });
        let write_short = self.arena.register_write(result, short_value);
        let short_cfg = ControlFlowGraph::single_tree(write_short);

        if is_conjunction {
            builder.merge_conditionally(&rhs_cfg, &short_cfg)?;
        } else {
            builder.merge_conditionally(&short_cfg, &rhs_cfg)?;
        }
        Ok(self.arena.register_read(result))
    }

    fn lower_expr(
        &mut self,
        builder: &mut ControlFlowGraphBuilder,
        expr: &Expr,
    ) -> Result<NodeId, LoweringError> {
        match expr {
            Expr::IntLiteral(value) => Ok(self.arena.constant(*value)),
            Expr::BoolLiteral(value) => Ok(self.arena.constant(i64::from(*value))),
            Expr::Read(var) => self.read_variable(*var),
            Expr::Unary(op, operand) => {
                let operand = self.lower_expr(builder, operand)?;
                let op = match op {
                    UnaryOp::Minus => UnaryIrOp::Negate,
                    UnaryOp::Not => UnaryIrOp::LogicalNot,
                    UnaryOp::BitNot => UnaryIrOp::BitNot,
                };
                Ok(self.arena.unary(op, operand))
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                self.lower_short_circuit(builder, left, right, true)
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                self.lower_short_circuit(builder, left, right, false)
            }
            Expr::Binary(op, left, right) => {
                let left_value = self.lower_expr(builder, left)?;
                let left_value = if right.has_effects() {
                    self.materialize(builder, left_value)?
                } else {
                    left_value
                };
                let right_value = self.lower_expr(builder, right)?;
                Ok(self
                    .arena
                    .binary(lower_binary_op(*op), left_value, right_value))
            }
            Expr::Call(callee, args) => {
                let name = self.labels[callee].clone();
                self.lower_call(builder, *callee, args)?
                    .ok_or(LoweringError::MissingCallResult(name))
            }
        }
    }

    /// Lowers a statement into its own graph; an empty branch becomes a
    /// single no-op so it still has an entry to branch to.
    fn lower_branch(&mut self, stmt: &Stmt) -> Result<ControlFlowGraph, LoweringError> {
        let mut builder = ControlFlowGraphBuilder::new();
        self.lower_stmt(&mut builder, stmt)?;
        if builder.entry().is_none() {
            let no_op = self.arena.no_op();
            builder.add_single_tree(no_op)?;
        }
        Ok(builder.build())
    }

    fn lower_stmt(
        &mut self,
        builder: &mut ControlFlowGraphBuilder,
        stmt: &Stmt,
    ) -> Result<(), LoweringError> {
        match stmt {
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.lower_stmt(builder, stmt)?;
                }
                Ok(())
            }
            Stmt::Assign(var, expr) => {
                let value = self.lower_expr(builder, expr)?;
                let write = self.write_variable(*var, value)?;
                builder.add_link_from_all_final_roots(LinkType::Unconditional, write)?;
                Ok(())
            }
            Stmt::Eval(expr) => {
                match expr {
                    Expr::Call(callee, args) => {
                        self.lower_call(builder, *callee, args)?;
                    }
                    other => {
                        // Side effects were emitted while lowering; the
                        // leftover value tree is pure and can be dropped.
                        let _ = self.lower_expr(builder, other)?;
                    }
                }
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let condition = self.lower_expr(builder, cond)?;
                builder.add_link_from_all_final_roots(LinkType::Unconditional, condition)?;
                let then_cfg = self.lower_branch(then_branch)?;
                let else_cfg = match else_branch {
                    Some(else_branch) => self.lower_branch(else_branch)?,
                    None => {
                        let no_op = self.arena.no_op();
                        ControlFlowGraph::single_tree(no_op)
                    }
                };
                builder.merge_conditionally(&then_cfg, &else_cfg)?;
                Ok(())
            }
            Stmt::While { cond, body } => {
                let mut cond_builder = ControlFlowGraphBuilder::new();
                let condition = self.lower_expr(&mut cond_builder, cond)?;
                cond_builder.add_link_from_all_final_roots(LinkType::Unconditional, condition)?;
                let cond_cfg = cond_builder.build();
                let cond_entry = cond_cfg.entry().ok_or(IrError::MissingEntryRoot)?;
                builder.merge_unconditionally(&cond_cfg)?;

                let body_cfg = self.lower_branch(body)?;
                let exit = self.arena.no_op();
                builder.merge_conditionally(&body_cfg, &ControlFlowGraph::single_tree(exit))?;
                for root in body_cfg.final_tree_roots() {
                    builder.add_link(Some((root, LinkType::Unconditional)), cond_entry)?;
                }
                Ok(())
            }
            Stmt::Return(expr) => {
                if let Some(expr) = expr {
                    let value = self.lower_expr(builder, expr)?;
                    let result_variable = self
                        .program
                        .function(self.function_id)
                        .result
                        .ok_or(LoweringError::UnexpectedReturnValue)?;
                    let write = self.write_variable(result_variable, value)?;
                    builder.add_link_from_all_final_roots(LinkType::Unconditional, write)?;
                }
                let anchor = self.return_anchor(builder)?;
                builder.add_link_from_all_final_roots(LinkType::Unconditional, anchor)?;
                Ok(())
            }
        }
    }
}

fn lower_binary_op(op: BinaryOp) -> BinaryIrOp {
    match op {
        BinaryOp::Add => BinaryIrOp::Add,
        BinaryOp::Sub => BinaryIrOp::Subtract,
        BinaryOp::Mul => BinaryIrOp::Multiply,
        BinaryOp::Div => BinaryIrOp::Divide,
        BinaryOp::Mod => BinaryIrOp::Modulo,
        BinaryOp::BitAnd => BinaryIrOp::BitAnd,
        BinaryOp::BitOr => BinaryIrOp::BitOr,
        BinaryOp::BitXor => BinaryIrOp::BitXor,
        BinaryOp::Shl => BinaryIrOp::ShiftLeft,
        BinaryOp::Shr => BinaryIrOp::ShiftRight,
        BinaryOp::Eq => BinaryIrOp::Equals,
        BinaryOp::Neq => BinaryIrOp::NotEquals,
        BinaryOp::Lt => BinaryIrOp::LessThan,
        BinaryOp::Le => BinaryIrOp::LessEquals,
        BinaryOp::Gt => BinaryIrOp::GreaterThan,
        BinaryOp::Ge => BinaryIrOp::GreaterEquals,
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are control flow"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use vega_common::program::{
        Function, FunctionKind, Type, Variable, VariableProperties,
    };
    use vega_ir::node::IrNode;

    /// Builds a program with a single top-level function `main`.
    fn single_function_program(body: Vec<Stmt>, locals: Vec<&str>) -> Program {
        let main = FunctionId(0);
        Program {
            functions: vec![Function {
                name: "main".to_string(),
                parent: None,
                depth: 0,
                params: vec![],
                locals: (0..locals.len() as u32).map(VariableId).collect(),
                result: None,
                kind: FunctionKind::Local { body },
            }],
            variables: locals
                .iter()
                .map(|name| Variable {
                    name: name.to_string(),
                    ty: Type::Int,
                    constant_value: None,
                })
                .collect(),
            properties: locals
                .iter()
                .map(|_| VariableProperties {
                    owner: Owner::Function(main),
                    accessed_by: BTreeSet::from([main]),
                })
                .collect(),
            main,
        }
    }

    #[test]
    fn test_straight_line_function_lowers_to_chain() {
        let program = single_function_program(
            vec![Stmt::Assign(VariableId(0), Expr::IntLiteral(5))],
            vec!["x"],
        );
        let lowered = lower_program(&program).unwrap();
        assert_eq!(lowered.functions.len(), 1);
        let function = &lowered.functions[0];
        assert_eq!(function.label, "fun$main");
        assert_eq!(lowered.main_label, "fun$main");

        // The whole graph is a straight line from prologue through the
        // assignment to the epilogue.
        let mut count = 0;
        let mut current = function.cfg.entry();
        while let Some(node) = current {
            count += 1;
            assert!(function.cfg.conditional_links(node).is_none());
            current = function.cfg.unconditional_link(node);
        }
        assert_eq!(count, function.cfg.tree_roots().len());
        assert_eq!(function.cfg.final_tree_roots().len(), 1);
    }

    #[test]
    fn test_if_creates_conditional_diamond() {
        let program = single_function_program(
            vec![Stmt::If {
                cond: Expr::Binary(
                    BinaryOp::Lt,
                    Box::new(Expr::Read(VariableId(0))),
                    Box::new(Expr::IntLiteral(10)),
                ),
                then_branch: Box::new(Stmt::Assign(VariableId(0), Expr::IntLiteral(1))),
                else_branch: Some(Box::new(Stmt::Assign(VariableId(0), Expr::IntLiteral(2)))),
            }],
            vec!["x"],
        );
        let lowered = lower_program(&program).unwrap();
        let function = &lowered.functions[0];

        let conditional_roots: Vec<NodeId> = function
            .cfg
            .tree_roots()
            .iter()
            .copied()
            .filter(|root| function.cfg.conditional_links(*root).is_some())
            .collect();
        assert_eq!(conditional_roots.len(), 1);
        let (on_true, on_false) = function.cfg.conditional_links(conditional_roots[0]).unwrap();
        assert_ne!(on_true, on_false);
        // Both arms reconverge on the epilogue, so there is exactly one
        // final root.
        assert_eq!(function.cfg.final_tree_roots().len(), 1);
    }

    #[test]
    fn test_while_loops_back_to_condition() {
        let program = single_function_program(
            vec![Stmt::While {
                cond: Expr::Binary(
                    BinaryOp::Gt,
                    Box::new(Expr::Read(VariableId(0))),
                    Box::new(Expr::IntLiteral(0)),
                ),
                body: Box::new(Stmt::Assign(
                    VariableId(0),
                    Expr::Binary(
                        BinaryOp::Sub,
                        Box::new(Expr::Read(VariableId(0))),
                        Box::new(Expr::IntLiteral(1)),
                    ),
                )),
            }],
            vec!["n"],
        );
        let lowered = lower_program(&program).unwrap();
        let function = &lowered.functions[0];

        let condition = function
            .cfg
            .tree_roots()
            .iter()
            .copied()
            .find(|root| function.cfg.conditional_links(*root).is_some())
            .unwrap();
        let (body_entry, _) = function.cfg.conditional_links(condition).unwrap();
        // The body's last step links back to the condition.
        assert_eq!(function.cfg.unconditional_link(body_entry), Some(condition));
    }

    #[test]
    fn test_return_routes_to_epilogue() {
        let main = FunctionId(0);
        let result = VariableId(0);
        let program = Program {
            functions: vec![Function {
                name: "main".to_string(),
                parent: None,
                depth: 0,
                params: vec![],
                locals: vec![result],
                result: Some(result),
                kind: FunctionKind::Local {
                    body: vec![Stmt::If {
                        cond: Expr::BoolLiteral(true),
                        then_branch: Box::new(Stmt::Return(Some(Expr::IntLiteral(1)))),
                        else_branch: None,
                    }, Stmt::Return(Some(Expr::IntLiteral(2)))],
                },
            }],
            variables: vec![Variable {
                name: "result".to_string(),
                ty: Type::Int,
                constant_value: None,
            }],
            properties: vec![VariableProperties {
                owner: Owner::Function(main),
                accessed_by: BTreeSet::from([main]),
            }],
            main,
        };
        let lowered = lower_program(&program).unwrap();
        let function = &lowered.functions[0];
        // Every path ends in the epilogue: a single final root, and the
        // return anchor no longer self-loops.
        assert_eq!(function.cfg.final_tree_roots().len(), 1);
        for root in function.cfg.tree_roots() {
            assert_ne!(function.cfg.unconditional_link(*root), Some(*root));
        }
    }

    #[test]
    fn test_foreign_call_and_externs() {
        let main = FunctionId(0);
        let write = FunctionId(1);
        let program = Program {
            functions: vec![
                Function {
                    name: "main".to_string(),
                    parent: None,
                    depth: 0,
                    params: vec![],
                    locals: vec![],
                    result: None,
                    kind: FunctionKind::Local {
                        body: vec![Stmt::Eval(Expr::Call(write, vec![Expr::IntLiteral(7)]))],
                    },
                },
                Function {
                    name: "print_int".to_string(),
                    parent: None,
                    depth: 0,
                    params: vec![],
                    locals: vec![],
                    result: None,
                    kind: FunctionKind::Foreign,
                },
            ],
            variables: vec![],
            properties: vec![],
            main,
        };
        let lowered = lower_program(&program).unwrap();
        assert_eq!(lowered.externs, vec!["print_int".to_string()]);
        let function = &lowered.functions[0];
        let has_call = function.cfg.tree_roots().iter().any(|root| {
            matches!(
                function.arena.get(*root),
                IrNode::Call { target, .. } if target == "print_int"
            )
        });
        assert!(has_call);
    }

    #[test]
    fn test_short_circuit_and_branches() {
        let program = single_function_program(
            vec![Stmt::Assign(
                VariableId(0),
                Expr::Binary(
                    BinaryOp::And,
                    Box::new(Expr::Read(VariableId(1))),
                    Box::new(Expr::Read(VariableId(2))),
                ),
            )],
            vec!["x", "a", "b"],
        );
        let lowered = lower_program(&program).unwrap();
        let function = &lowered.functions[0];
        // The left operand becomes a conditional root: evaluate the right
        // operand on true, skip to the constant 0 on false.
        let condition = function
            .cfg
            .tree_roots()
            .iter()
            .copied()
            .find(|root| function.cfg.conditional_links(*root).is_some());
        assert!(condition.is_some());
    }
}
