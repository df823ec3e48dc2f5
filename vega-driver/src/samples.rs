//! Built-in demonstration programs
//!
//! Hand-built resolved programs exercising the interesting corners of the
//! backend: recursion, nested functions reaching outer locals through the
//! display, and global storage with constant folding. They stand in for a
//! frontend, which is out of scope for this workspace.

use vega_common::program::{
    BinaryOp, Expr, Function, FunctionId, FunctionKind, Owner, Program, Stmt, Type, Variable,
    VariableId, VariableProperties,
};

pub const NAMES: [&str; 3] = ["factorial", "nested", "globals"];

pub fn by_name(name: &str) -> Option<Program> {
    match name {
        "factorial" => Some(factorial()),
        "nested" => Some(nested()),
        "globals" => Some(globals()),
        _ => None,
    }
}

fn int_var(name: &str) -> Variable {
    Variable {
        name: name.to_string(),
        ty: Type::Int,
        constant_value: None,
    }
}

fn const_var(name: &str, value: i64) -> Variable {
    Variable {
        name: name.to_string(),
        ty: Type::Int,
        constant_value: Some(value),
    }
}

fn owned_by(owner: FunctionId, accessed_by: &[FunctionId]) -> VariableProperties {
    VariableProperties {
        owner: Owner::Function(owner),
        accessed_by: accessed_by.iter().copied().collect(),
    }
}

fn global_var(accessed_by: &[FunctionId]) -> VariableProperties {
    VariableProperties {
        owner: Owner::Global,
        accessed_by: accessed_by.iter().copied().collect(),
    }
}

fn int(value: i64) -> Expr {
    Expr::IntLiteral(value)
}

fn read(variable: VariableId) -> Expr {
    Expr::Read(variable)
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary(op, Box::new(left), Box::new(right))
}

fn print_int(param: VariableId) -> Function {
    Function {
        name: "print_int".to_string(),
        parent: None,
        depth: 0,
        params: vec![param],
        locals: vec![],
        result: None,
        kind: FunctionKind::Foreign,
    }
}

/// `print_int(factorial(10))` with a recursive `factorial`.
fn factorial() -> Program {
    let main = FunctionId(0);
    let fact = FunctionId(1);
    let print = FunctionId(2);
    let n = VariableId(0);
    let result = VariableId(1);
    let print_param = VariableId(2);

    Program {
        functions: vec![
            Function {
                name: "main".to_string(),
                parent: None,
                depth: 0,
                params: vec![],
                locals: vec![],
                result: None,
                kind: FunctionKind::Local {
                    body: vec![Stmt::Eval(Expr::Call(
                        print,
                        vec![Expr::Call(fact, vec![int(10)])],
                    ))],
                },
            },
            Function {
                name: "factorial".to_string(),
                parent: None,
                depth: 0,
                params: vec![n],
                locals: vec![result],
                result: Some(result),
                kind: FunctionKind::Local {
                    body: vec![Stmt::If {
                        cond: binary(BinaryOp::Le, read(n), int(1)),
                        then_branch: Box::new(Stmt::Return(Some(int(1)))),
                        else_branch: Some(Box::new(Stmt::Return(Some(binary(
                            BinaryOp::Mul,
                            read(n),
                            Expr::Call(fact, vec![binary(BinaryOp::Sub, read(n), int(1))]),
                        ))))),
                    }],
                },
            },
            print_int(print_param),
        ],
        variables: vec![int_var("n"), int_var("result"), int_var("n")],
        properties: vec![
            owned_by(fact, &[fact]),
            owned_by(fact, &[fact]),
            owned_by(print, &[]),
        ],
        main,
    }
}

/// A nested function incrementing an outer local through the display.
fn nested() -> Program {
    let main = FunctionId(0);
    let bump = FunctionId(1);
    let print = FunctionId(2);
    let total = VariableId(0);
    let amount = VariableId(1);
    let print_param = VariableId(2);

    Program {
        functions: vec![
            Function {
                name: "main".to_string(),
                parent: None,
                depth: 0,
                params: vec![],
                locals: vec![total],
                result: None,
                kind: FunctionKind::Local {
                    body: vec![
                        Stmt::Assign(total, int(0)),
                        Stmt::While {
                            cond: binary(BinaryOp::Lt, read(total), int(10)),
                            body: Box::new(Stmt::Eval(Expr::Call(bump, vec![int(3)]))),
                        },
                        Stmt::Eval(Expr::Call(print, vec![read(total)])),
                    ],
                },
            },
            Function {
                name: "bump".to_string(),
                parent: Some(main),
                depth: 1,
                params: vec![amount],
                locals: vec![],
                result: None,
                kind: FunctionKind::Local {
                    body: vec![Stmt::Assign(
                        total,
                        binary(BinaryOp::Add, read(total), read(amount)),
                    )],
                },
            },
            print_int(print_param),
        ],
        variables: vec![int_var("total"), int_var("amount"), int_var("n")],
        properties: vec![
            // `total` is touched by the nested function, forcing it into a
            // frame slot reached through the display.
            owned_by(main, &[main, bump]),
            owned_by(bump, &[bump]),
            owned_by(print, &[]),
        ],
        main,
    }
}

/// Global storage plus a constant global whose reads fold away.
fn globals() -> Program {
    let main = FunctionId(0);
    let print = FunctionId(1);
    let counter = VariableId(0);
    let step = VariableId(1);
    let print_param = VariableId(2);

    Program {
        functions: vec![
            Function {
                name: "main".to_string(),
                parent: None,
                depth: 0,
                params: vec![],
                locals: vec![],
                result: None,
                kind: FunctionKind::Local {
                    body: vec![
                        Stmt::Assign(counter, int(0)),
                        Stmt::While {
                            cond: binary(BinaryOp::Lt, read(counter), int(20)),
                            body: Box::new(Stmt::Assign(
                                counter,
                                binary(BinaryOp::Add, read(counter), read(step)),
                            )),
                        },
                        Stmt::Eval(Expr::Call(print, vec![read(counter)])),
                    ],
                },
            },
            print_int(print_param),
        ],
        variables: vec![int_var("counter"), const_var("step", 4), int_var("n")],
        properties: vec![
            global_var(&[main]),
            global_var(&[main]),
            owned_by(print, &[]),
        ],
        main,
    }
}
