//! Compiled program representation
//!
//! This is the value handed from the compiler to the virtual machine.
//! Every buffer compiles to one [`Unit`]; `entry` names the unit execution starts in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub units: BTreeMap<String, Unit>,
    pub entry: String,
}

impl Program {
    pub fn new(units: BTreeMap<String, Unit>, entry: impl Into<String>) -> Self {
        Self {
            units,
            entry: entry.into(),
        }
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }
}

/// Straight-line code of one buffer. Jump targets index into `code`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub code: Vec<Instr>,
}

impl Unit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
        }
    }
}

/// One executable statement and the 1-based source line it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    pub line: u32,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Op {
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    Print { value: Expr },
    Call { unit: String },
    JumpUnless { cond: Expr, target: usize },
    Jump { target: usize },
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Num { v: i64 },
    Var { name: String },
    Neg { inner: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    /// Call `f` for every variable read by this expression.
    pub fn visit_vars<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Expr::Num { .. } => {}
            Expr::Var { name } => f(name),
            Expr::Neg { inner } => inner.visit_vars(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_vars(f);
                rhs.visit_vars(f);
            }
        }
    }
}
