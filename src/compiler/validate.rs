//! Semantic checks run after a buffer lowered cleanly.
//!
//! Each check implements [`UnitRule`]; [`Validator`] runs them all and
//! concatenates whatever they report.

use std::collections::HashSet;

use crate::program::{Op, Unit};
use crate::types::{Diagnostic, DiagnosticKind};

pub trait UnitRule: Send + Sync {
    /// Unique identifier, e.g. "declare-before-use"
    fn id(&self) -> &'static str;

    fn check(&self, unit: &Unit) -> Vec<Diagnostic>;
}

/// Variables must be introduced with `let` before they are read or assigned.
///
/// The check follows source order, so a `let` inside a branch counts for
/// everything below it. Paths where the branch was skipped fault at run time.
pub struct DeclareBeforeUseRule;

impl UnitRule for DeclareBeforeUseRule {
    fn id(&self) -> &'static str {
        "declare-before-use"
    }

    fn check(&self, unit: &Unit) -> Vec<Diagnostic> {
        let mut declared: HashSet<&str> = HashSet::new();
        let mut errors = Vec::new();

        for instr in &unit.code {
            let mut reads = Vec::new();
            match &instr.op {
                Op::Let { value, .. } | Op::Assign { value, .. } | Op::Print { value } => {
                    value.visit_vars(&mut |name| reads.push(name));
                }
                Op::JumpUnless { cond, .. } => cond.visit_vars(&mut |name| reads.push(name)),
                Op::Call { .. } | Op::Jump { .. } | Op::Return => {}
            }

            for name in reads {
                if !declared.contains(name) {
                    errors.push(Diagnostic::new(
                        DiagnosticKind::Semantic,
                        &unit.name,
                        instr.line,
                        format!("variable '{}' is used before it is declared", name),
                    ));
                }
            }

            match &instr.op {
                Op::Let { name, .. } => {
                    declared.insert(name);
                }
                Op::Assign { name, .. } if !declared.contains(name.as_str()) => {
                    errors.push(Diagnostic::new(
                        DiagnosticKind::Semantic,
                        &unit.name,
                        instr.line,
                        format!("cannot assign to '{}' before it is declared with 'let'", name),
                    ));
                }
                _ => {}
            }
        }

        errors
    }
}

pub struct Validator {
    rules: Vec<Box<dyn UnitRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![Box::new(DeclareBeforeUseRule)],
        }
    }

    pub fn validate(&self, unit: &Unit) -> Vec<Diagnostic> {
        self.rules.iter().flat_map(|rule| rule.check(unit)).collect()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
