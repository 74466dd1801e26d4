//! Expression evaluation
//!
//! Expressions are evaluated atomically inside a single step. Comparisons
//! yield 1 or 0, and all arithmetic is checked.

use super::MachineFault;
use crate::program::{BinOp, Expr};
use crate::types::{SourceLocation, VariableSnapshot};

pub fn eval_expr(
    expr: &Expr,
    variables: &VariableSnapshot,
    location: &SourceLocation,
) -> Result<i64, MachineFault> {
    match expr {
        Expr::Num { v } => Ok(*v),

        Expr::Var { name } => {
            variables
                .get(name)
                .copied()
                .ok_or_else(|| MachineFault::UndefinedVariable {
                    name: name.clone(),
                    location: location.clone(),
                })
        }

        Expr::Neg { inner } => eval_expr(inner, variables, location)?
            .checked_neg()
            .ok_or_else(|| MachineFault::Overflow(location.clone())),

        Expr::Binary { op, lhs, rhs } => {
            let l = eval_expr(lhs, variables, location)?;
            let r = eval_expr(rhs, variables, location)?;
            apply(*op, l, r, location)
        }
    }
}

fn apply(op: BinOp, l: i64, r: i64, location: &SourceLocation) -> Result<i64, MachineFault> {
    let overflow = || MachineFault::Overflow(location.clone());
    match op {
        BinOp::Add => l.checked_add(r).ok_or_else(overflow),
        BinOp::Sub => l.checked_sub(r).ok_or_else(overflow),
        BinOp::Mul => l.checked_mul(r).ok_or_else(overflow),
        BinOp::Div | BinOp::Rem if r == 0 => Err(MachineFault::DivisionByZero(location.clone())),
        BinOp::Div => l.checked_div(r).ok_or_else(overflow),
        BinOp::Rem => l.checked_rem(r).ok_or_else(overflow),
        BinOp::Eq => Ok((l == r) as i64),
        BinOp::Ne => Ok((l != r) as i64),
        BinOp::Lt => Ok((l < r) as i64),
        BinOp::Le => Ok((l <= r) as i64),
        BinOp::Gt => Ok((l > r) as i64),
        BinOp::Ge => Ok((l >= r) as i64),
    }
}
