//! The resolved program model
//!
//! This is the backend's external input: an already-validated abstract
//! syntax tree in which every identifier use has been replaced by an entity
//! handle, every call target by a function handle, and every variable
//! carries an ownership record saying which functions access it from
//! outside its owner. Name resolution, type checking, overload and
//! default-argument resolution all happen upstream and are not represented
//! here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Handle of a function in [`Program::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

/// Handle of a variable in [`Program::variables`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub u32);

/// The types of the Vega language. The backend only needs them to know
/// whether an expression produces a value at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Bool,
    Unit,
}

/// Who owns a variable: the global scope or a single function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    Global,
    Function(FunctionId),
}

/// A named storage entity: a parameter, a local, or a global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
    /// Compile-time constant value, if the variable is a constant. Constant
    /// globals occupy no storage; reads of them fold to the literal.
    pub constant_value: Option<i64>,
}

impl Variable {
    pub fn is_constant(&self) -> bool {
        self.constant_value.is_some()
    }
}

/// Ownership and non-local-access record for one variable, computed by the
/// upstream analysis. A variable accessed by any function other than its
/// owner cannot live in a register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableProperties {
    pub owner: Owner,
    /// Functions that read or write the variable from outside its owner.
    pub accessed_by: BTreeSet<FunctionId>,
}

impl VariableProperties {
    /// True if only the owning function ever touches the variable.
    pub fn is_local_only(&self) -> bool {
        match self.owner {
            Owner::Global => false,
            Owner::Function(owner) => self
                .accessed_by
                .iter()
                .all(|accessor| *accessor == owner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Minus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit conjunction; lowered to control flow, not to a node.
    And,
    /// Short-circuit disjunction; lowered to control flow, not to a node.
    Or,
}

/// A resolved expression. Variable references and call targets are handles,
/// never names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    IntLiteral(i64),
    BoolLiteral(bool),
    Read(VariableId),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(FunctionId, Vec<Expr>),
}

impl Expr {
    /// Whether evaluating the expression can have side effects. Used by the
    /// lowering pass to preserve evaluation order around calls.
    pub fn has_effects(&self) -> bool {
        match self {
            Expr::IntLiteral(_) | Expr::BoolLiteral(_) | Expr::Read(_) => false,
            Expr::Unary(_, operand) => operand.has_effects(),
            Expr::Binary(_, left, right) => left.has_effects() || right.has_effects(),
            Expr::Call(_, _) => true,
        }
    }
}

/// A resolved statement.
///
/// `break`/`continue` and early `return` placement are normalized upstream:
/// a `Return` is always the last statement of its enclosing branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Block(Vec<Stmt>),
    Assign(VariableId, Expr),
    Eval(Expr),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Return(Option<Expr>),
}

/// A function is either defined in the program or provided by the runtime
/// (foreign); foreign functions get an `extern` declaration instead of a
/// code block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionKind {
    Local { body: Vec<Stmt> },
    Foreign,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Lexically enclosing function, if any. `None` for top-level functions.
    pub parent: Option<FunctionId>,
    /// Nesting depth: 0 for top-level functions, parent depth + 1 otherwise.
    pub depth: u32,
    pub params: Vec<VariableId>,
    /// Local variables, parameters excluded.
    pub locals: Vec<VariableId>,
    /// Synthesized variable holding the function result, if it returns one.
    pub result: Option<VariableId>,
    pub kind: FunctionKind,
}

impl Function {
    pub fn is_foreign(&self) -> bool {
        matches!(self.kind, FunctionKind::Foreign)
    }

    pub fn returns_value(&self) -> bool {
        self.result.is_some()
    }

    /// Parameters followed by locals, in declaration order.
    pub fn frame_variables(&self) -> impl Iterator<Item = VariableId> + '_ {
        self.params.iter().chain(self.locals.iter()).copied()
    }
}

/// The whole resolved program: entity arenas plus the entry function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Indexed by [`FunctionId`].
    pub functions: Vec<Function>,
    /// Indexed by [`VariableId`].
    pub variables: Vec<Variable>,
    /// Indexed by [`VariableId`], parallel to `variables`.
    pub properties: Vec<VariableProperties>,
    pub main: FunctionId,
}

impl Program {
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0 as usize]
    }

    pub fn properties_of(&self, id: VariableId) -> &VariableProperties {
        &self.properties[id.0 as usize]
    }

    /// Ids of all function entries, in declaration order.
    pub fn function_ids(&self) -> impl Iterator<Item = FunctionId> {
        (0..self.functions.len() as u32).map(FunctionId)
    }

    /// Global variables, name-sorted for deterministic layout.
    pub fn global_variables(&self) -> Vec<VariableId> {
        let mut globals: Vec<VariableId> = (0..self.variables.len() as u32)
            .map(VariableId)
            .filter(|id| self.properties_of(*id).owner == Owner::Global)
            .collect();
        globals.sort_by(|a, b| self.variable(*a).name.cmp(&self.variable(*b).name));
        globals
    }

    /// Deepest nesting depth in the program; sizes the display.
    pub fn max_depth(&self) -> u32 {
        self.functions.iter().map(|f| f.depth).max().unwrap_or(0)
    }
}
