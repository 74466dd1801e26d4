//! PEST-based front end
//!
//! Parses one buffer and lowers it straight into a [`Unit`]. Block statements
//! (`if` / `else` / `while` ... `end`) are resolved into jumps while lowering.

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use crate::program::{BinOp, Expr, Instr, Op, Unit};
use crate::types::{Diagnostic, DiagnosticKind};

#[derive(Parser)]
#[grammar = "compiler/script.pest"]
struct ScriptParser;

/// Deepest expression accepted, counting parentheses, operators and negations.
/// Parsing, evaluation and dropping all recurse over the expression tree.
pub const MAX_EXPR_DEPTH: usize = 128;

/* ===================== Errors ===================== */

/// A problem found while turning parse pairs into instructions.
#[derive(Debug)]
struct BuildError {
    line: u32,
    message: String,
}

impl BuildError {
    fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

type BuildResult<T> = Result<T, BuildError>;

fn describe_rule(rule: &Rule) -> String {
    match rule {
        Rule::EOI => "end of input",
        Rule::statement | Rule::line => "a statement",
        Rule::expr | Rule::sum | Rule::product | Rule::unary => "an expression",
        Rule::ident => "a variable name",
        Rule::number => "a number",
        Rule::unit_name => "a script name",
        Rule::cmp_op | Rule::add_op | Rule::mul_op => "an operator",
        Rule::neg => "'-'",
        _ => return format!("{:?}", rule),
    }
    .to_string()
}

fn syntax_diagnostic(file: &str, err: pest::error::Error<Rule>) -> Diagnostic {
    let line = match err.line_col {
        pest::error::LineColLocation::Pos((line, _)) => line,
        pest::error::LineColLocation::Span((line, _), _) => line,
    };
    let err = err.renamed_rules(describe_rule);
    Diagnostic::new(
        DiagnosticKind::Syntax,
        file,
        line as u32,
        err.variant.message().to_string(),
    )
}

/* ===================== Public API ===================== */

/// Parse and lower a single buffer.
pub fn build_unit(name: &str, source: &str) -> Result<Unit, Diagnostic> {
    check_parentheses(name, source)?;
    let mut pairs =
        ScriptParser::parse(Rule::program, source).map_err(|err| syntax_diagnostic(name, err))?;
    let program = pairs.next().ok_or_else(|| {
        Diagnostic::new(DiagnosticKind::Internal, name, 0, "parser produced no program")
    })?;

    let mut lowering = Lowering::new(name);
    for line in program.into_inner() {
        if line.as_rule() != Rule::line {
            continue;
        }
        let number = line_of(&line);
        if let Some(statement) = line.into_inner().next() {
            lowering
                .statement(statement, number)
                .map_err(|e| Diagnostic::new(DiagnosticKind::Syntax, name, e.line, e.message))?;
        }
    }

    lowering
        .finish()
        .map_err(|e| Diagnostic::new(DiagnosticKind::Syntax, name, e.line, e.message))
}

/// Reject runaway parenthesis nesting before the recursive parser sees it.
fn check_parentheses(name: &str, source: &str) -> Result<(), Diagnostic> {
    for (index, text) in source.lines().enumerate() {
        let mut depth = 0usize;
        for c in text.chars() {
            match c {
                '#' => break,
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
            if depth > MAX_EXPR_DEPTH {
                return Err(Diagnostic::new(
                    DiagnosticKind::Syntax,
                    name,
                    index as u32 + 1,
                    too_deep(),
                ));
            }
        }
    }
    Ok(())
}

fn too_deep() -> String {
    format!("expression is nested more than {} levels deep", MAX_EXPR_DEPTH)
}

fn line_of(pair: &Pair<Rule>) -> u32 {
    pair.as_span().start_pos().line_col().0 as u32
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, line: u32, what: &str) -> BuildResult<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| BuildError::new(line, format!("missing {}", what)))
}

/* ===================== Lowering ===================== */

/// A block statement still waiting for its `end`.
#[derive(Debug)]
enum OpenBlock {
    If { line: u32, jump: usize },
    Else { line: u32, jump: usize },
    While { line: u32, start: usize, jump: usize },
}

struct Lowering {
    unit: Unit,
    open: Vec<OpenBlock>,
}

impl Lowering {
    fn new(name: &str) -> Self {
        Self {
            unit: Unit::new(name),
            open: Vec::new(),
        }
    }

    fn emit(&mut self, line: u32, op: Op) -> usize {
        self.unit.code.push(Instr { line, op });
        self.unit.code.len() - 1
    }

    fn patch(&mut self, at: usize, to: usize) {
        if let Some(instr) = self.unit.code.get_mut(at) {
            match &mut instr.op {
                Op::JumpUnless { target, .. } | Op::Jump { target } => *target = to,
                _ => {}
            }
        }
    }

    fn statement(&mut self, pair: Pair<Rule>, line: u32) -> BuildResult<()> {
        let stmt = next_pair(&mut pair.into_inner(), line, "statement")?;
        let rule = stmt.as_rule();
        // Keyword pairs come first and carry no information.
        let mut inner = stmt.into_inner();
        if !matches!(rule, Rule::assign_stmt) {
            inner.next();
        }

        match rule {
            Rule::let_stmt => {
                let name = next_pair(&mut inner, line, "variable name")?.as_str().to_string();
                let value = build_expr(next_pair(&mut inner, line, "expression")?, line)?;
                self.emit(line, Op::Let { name, value });
            }
            Rule::assign_stmt => {
                let name = next_pair(&mut inner, line, "variable name")?.as_str().to_string();
                let value = build_expr(next_pair(&mut inner, line, "expression")?, line)?;
                self.emit(line, Op::Assign { name, value });
            }
            Rule::print_stmt => {
                let value = build_expr(next_pair(&mut inner, line, "expression")?, line)?;
                self.emit(line, Op::Print { value });
            }
            Rule::call_stmt => {
                let unit = next_pair(&mut inner, line, "script name")?.as_str().to_string();
                self.emit(line, Op::Call { unit });
            }
            Rule::return_stmt => {
                self.emit(line, Op::Return);
            }
            Rule::if_stmt => {
                let cond = build_expr(next_pair(&mut inner, line, "condition")?, line)?;
                let jump = self.emit(line, Op::JumpUnless { cond, target: usize::MAX });
                self.open.push(OpenBlock::If { line, jump });
            }
            Rule::while_stmt => {
                let start = self.unit.code.len();
                let cond = build_expr(next_pair(&mut inner, line, "condition")?, line)?;
                let jump = self.emit(line, Op::JumpUnless { cond, target: usize::MAX });
                self.open.push(OpenBlock::While { line, start, jump });
            }
            Rule::else_stmt => match self.open.pop() {
                Some(OpenBlock::If { jump: if_jump, .. }) => {
                    let skip = self.emit(line, Op::Jump { target: usize::MAX });
                    let else_start = self.unit.code.len();
                    self.patch(if_jump, else_start);
                    self.open.push(OpenBlock::Else { line, jump: skip });
                }
                other => {
                    if let Some(block) = other {
                        self.open.push(block);
                    }
                    return Err(BuildError::new(line, "'else' without matching 'if'"));
                }
            },
            Rule::end_stmt => match self.open.pop() {
                Some(OpenBlock::If { jump, .. }) | Some(OpenBlock::Else { jump, .. }) => {
                    let after = self.unit.code.len();
                    self.patch(jump, after);
                }
                Some(OpenBlock::While { start, jump, .. }) => {
                    self.emit(line, Op::Jump { target: start });
                    let after = self.unit.code.len();
                    self.patch(jump, after);
                }
                None => {
                    return Err(BuildError::new(line, "'end' without matching 'if' or 'while'"));
                }
            },
            other => {
                return Err(BuildError::new(line, format!("unexpected statement {:?}", other)));
            }
        }
        Ok(())
    }

    fn finish(mut self) -> BuildResult<Unit> {
        if let Some(block) = self.open.pop() {
            let (keyword, line) = match block {
                OpenBlock::If { line, .. } => ("if", line),
                OpenBlock::Else { line, .. } => ("else", line),
                OpenBlock::While { line, .. } => ("while", line),
            };
            return Err(BuildError::new(
                line,
                format!("'{}' block is never closed with 'end'", keyword),
            ));
        }
        Ok(self.unit)
    }
}

/* ===================== Expressions ===================== */

/// An expression together with the height of its tree.
type Built = (Expr, usize);

fn build_expr(pair: Pair<Rule>, line: u32) -> BuildResult<Expr> {
    build_comparison(pair, line).map(|(expr, _)| expr)
}

fn build_comparison(pair: Pair<Rule>, line: u32) -> BuildResult<Built> {
    let mut inner = pair.into_inner();
    let lhs = build_sum(next_pair(&mut inner, line, "operand")?, line)?;
    match inner.next() {
        None => Ok(lhs),
        Some(op) => {
            let op = match op.as_str() {
                "==" => BinOp::Eq,
                "!=" => BinOp::Ne,
                "<=" => BinOp::Le,
                ">=" => BinOp::Ge,
                "<" => BinOp::Lt,
                ">" => BinOp::Gt,
                other => return Err(BuildError::new(line, format!("unknown comparison '{}'", other))),
            };
            let rhs = build_sum(next_pair(&mut inner, line, "operand")?, line)?;
            binary(op, lhs, rhs, line)
        }
    }
}

fn build_sum(pair: Pair<Rule>, line: u32) -> BuildResult<Built> {
    let mut inner = pair.into_inner();
    let mut acc = build_product(next_pair(&mut inner, line, "operand")?, line)?;
    while let Some(op) = inner.next() {
        let op = if op.as_str() == "+" { BinOp::Add } else { BinOp::Sub };
        let rhs = build_product(next_pair(&mut inner, line, "operand")?, line)?;
        acc = binary(op, acc, rhs, line)?;
    }
    Ok(acc)
}

fn build_product(pair: Pair<Rule>, line: u32) -> BuildResult<Built> {
    let mut inner = pair.into_inner();
    let mut acc = build_unary(next_pair(&mut inner, line, "operand")?, line)?;
    while let Some(op) = inner.next() {
        let op = match op.as_str() {
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            _ => BinOp::Rem,
        };
        let rhs = build_unary(next_pair(&mut inner, line, "operand")?, line)?;
        acc = binary(op, acc, rhs, line)?;
    }
    Ok(acc)
}

fn build_unary(pair: Pair<Rule>, line: u32) -> BuildResult<Built> {
    let mut negations = 0usize;
    let mut operand = None;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::neg => negations += 1,
            _ => operand = Some(build_atom(part, line)?),
        }
    }
    let (mut expr, depth) = operand.ok_or_else(|| BuildError::new(line, "missing operand"))?;
    let depth = nested(depth + negations, line)?;
    for _ in 0..negations {
        expr = Expr::Neg { inner: Box::new(expr) };
    }
    Ok((expr, depth))
}

fn build_atom(pair: Pair<Rule>, line: u32) -> BuildResult<Built> {
    match pair.as_rule() {
        Rule::number => pair
            .as_str()
            .parse::<i64>()
            .map(|v| (Expr::Num { v }, 1))
            .map_err(|_| BuildError::new(line, format!("number '{}' is too large", pair.as_str()))),
        Rule::ident => Ok((
            Expr::Var {
                name: pair.as_str().to_string(),
            },
            1,
        )),
        Rule::expr => build_comparison(pair, line),
        other => Err(BuildError::new(line, format!("unexpected operand {:?}", other))),
    }
}

fn binary(op: BinOp, (lhs, lhs_depth): Built, (rhs, rhs_depth): Built, line: u32) -> BuildResult<Built> {
    let depth = nested(lhs_depth.max(rhs_depth) + 1, line)?;
    Ok((
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        depth,
    ))
}

fn nested(depth: usize, line: u32) -> BuildResult<usize> {
    if depth > MAX_EXPR_DEPTH {
        return Err(BuildError::new(line, too_deep()));
    }
    Ok(depth)
}
