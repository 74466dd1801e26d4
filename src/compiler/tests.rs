use super::*;
use crate::program::{BinOp, Expr, Instr, Op};
use maplit::btreemap;

fn sources(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(name, text)| (name.to_string(), text.to_string()))
        .collect()
}

fn num(v: i64) -> Expr {
    Expr::Num { v }
}

fn var(name: &str) -> Expr {
    Expr::Var {
        name: name.to_string(),
    }
}

fn compile_ok(entries: &[(&str, &str)], main: &str) -> Program {
    ScriptCompiler::new()
        .compile(&sources(entries), main, &CancellationToken::new())
        .expect("compilation should succeed")
}

fn compile_err(entries: &[(&str, &str)], main: &str) -> Vec<Diagnostic> {
    ScriptCompiler::new()
        .compile(&sources(entries), main, &CancellationToken::new())
        .expect_err("compilation should fail")
}

#[test]
fn test_print_with_empty_sibling_buffer() {
    let program = compile_ok(&[("a", "PRINT 1"), ("b", "")], "a");

    assert_eq!(program.entry, "a");
    assert_eq!(
        program.unit("a").unwrap().code,
        vec![Instr {
            line: 1,
            op: Op::Print { value: num(1) }
        }]
    );
    assert!(program.unit("b").unwrap().code.is_empty());
}

#[test]
fn test_keywords_are_case_insensitive_and_comments_ignored() {
    let source = "LET x = 2 # the answer, halved\n\n# whole line comment\nPrint x\n";
    let program = compile_ok(&[("main", source)], "main");

    let code = &program.unit("main").unwrap().code;
    assert_eq!(code.len(), 2);
    assert_eq!(code[0].line, 1);
    assert_eq!(code[1].line, 4);
    assert_eq!(code[1].op, Op::Print { value: var("x") });
}

#[test]
fn test_operator_precedence() {
    let program = compile_ok(&[("main", "let x = 1 + 2 * -3")], "main");

    let expected = Expr::Binary {
        op: BinOp::Add,
        lhs: Box::new(num(1)),
        rhs: Box::new(Expr::Binary {
            op: BinOp::Mul,
            lhs: Box::new(num(2)),
            rhs: Box::new(Expr::Neg {
                inner: Box::new(num(3)),
            }),
        }),
    };
    assert_eq!(
        program.unit("main").unwrap().code[0].op,
        Op::Let {
            name: "x".to_string(),
            value: expected
        }
    );
}

#[test]
fn test_parentheses_and_comparison() {
    let program = compile_ok(&[("main", "let x = (1 + 2) * 3 >= 9")], "main");

    let expected = Expr::Binary {
        op: BinOp::Ge,
        lhs: Box::new(Expr::Binary {
            op: BinOp::Mul,
            lhs: Box::new(Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(num(1)),
                rhs: Box::new(num(2)),
            }),
            rhs: Box::new(num(3)),
        }),
        rhs: Box::new(num(9)),
    };
    assert_eq!(
        program.unit("main").unwrap().code[0].op,
        Op::Let {
            name: "x".to_string(),
            value: expected
        }
    );
}

#[test]
fn test_if_else_jump_targets() {
    let source = r#"let x = 1
if x > 0
  print 1
else
  print 2
end
print 3"#;
    let program = compile_ok(&[("main", source)], "main");
    let code = &program.unit("main").unwrap().code;

    assert_eq!(code.len(), 6);
    assert!(matches!(code[1].op, Op::JumpUnless { target: 4, .. }));
    assert_eq!(code[3], Instr { line: 4, op: Op::Jump { target: 5 } });
    assert_eq!(code[5].line, 7);
}

#[test]
fn test_while_loops_back_to_condition() {
    let source = "let i = 0\nwhile i < 3\n  i = i + 1\nend\n";
    let program = compile_ok(&[("main", source)], "main");
    let code = &program.unit("main").unwrap().code;

    assert_eq!(code.len(), 4);
    assert!(matches!(code[1].op, Op::JumpUnless { target: 4, .. }));
    assert_eq!(code[3], Instr { line: 4, op: Op::Jump { target: 1 } });
}

#[test]
fn test_call_between_buffers() {
    let program = compile_ok(&[("main", "call lib.scr"), ("lib.scr", "let y = 1")], "main");

    assert_eq!(
        program.unit("main").unwrap().code[0].op,
        Op::Call {
            unit: "lib.scr".to_string()
        }
    );
}

#[test]
fn test_syntax_error_reports_line() {
    let diagnostics = compile_err(&[("main", "let x = 1\nlet = 2")], "main");

    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::Syntax);
    assert_eq!(diagnostics[0].file, "main");
    assert_eq!(diagnostics[0].line, 2);
}

#[test]
fn test_unclosed_block() {
    let diagnostics = compile_err(&[("main", "let i = 0\nwhile i < 2\ni = i + 1")], "main");

    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].line, 2);
    assert!(diagnostics[0].message.contains("while"));
}

#[test]
fn test_end_without_block() {
    let diagnostics = compile_err(&[("main", "print 1\nend")], "main");

    assert_eq!(diagnostics[0].kind, DiagnosticKind::Syntax);
    assert_eq!(diagnostics[0].line, 2);
}

#[test]
fn test_else_without_if() {
    let diagnostics = compile_err(&[("main", "let i = 0\nwhile i < 1\nelse\nend")], "main");

    assert_eq!(diagnostics[0].line, 3);
    assert!(diagnostics[0].message.contains("else"));
}

#[test]
fn test_use_before_declaration() {
    let diagnostics = compile_err(&[("main", "print y\nlet y = 1\nz = 2")], "main");

    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics.iter().all(|d| d.kind == DiagnosticKind::Semantic));
    assert_eq!(diagnostics[0].line, 1);
    assert_eq!(diagnostics[1].line, 3);
}

#[test]
fn test_unknown_call_target() {
    let diagnostics = compile_err(&[("main", "call missing")], "main");

    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::Link);
    assert_eq!(diagnostics[0].line, 1);
}

#[test]
fn test_missing_main_unit() {
    let diagnostics = compile_err(&[("other", "print 1")], "main");

    assert_eq!(diagnostics[0].kind, DiagnosticKind::Link);
    assert_eq!(diagnostics[0].file, "main");
}

#[test]
fn test_diagnostics_from_every_buffer_are_collected() {
    let sources = btreemap! {
        "a".to_string() => "let = 1".to_string(),
        "b".to_string() => "print q".to_string(),
    };
    let diagnostics = ScriptCompiler::new()
        .compile(&sources, "a", &CancellationToken::new())
        .unwrap_err();

    let files: Vec<&str> = diagnostics.iter().map(|d| d.file.as_str()).collect();
    assert_eq!(files, vec!["a", "b"]);
}

#[test]
fn test_diagnostic_display() {
    let diagnostic = Diagnostic::new(DiagnosticKind::Syntax, "main", 3, "unexpected token");

    assert_eq!(diagnostic.to_string(), "[syntax] in 'main', line 3 'unexpected token'");
}

#[test]
fn test_cancelled_compile_returns_early() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let diagnostics = ScriptCompiler::new()
        .compile(&sources(&[("main", "print 1")]), "main", &cancel)
        .unwrap_err();

    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::Internal);
    assert_eq!(diagnostics[0].message, "compilation cancelled");
}

#[test]
fn test_deeply_nested_parentheses_are_a_diagnostic() {
    let source = format!("let x = 1\nprint {}1{}", "(".repeat(100_000), ")".repeat(100_000));

    let diagnostics = compile_err(&[("main", &source)], "main");

    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::Syntax);
    assert_eq!(diagnostics[0].line, 2);
    assert_eq!(
        diagnostics[0].message,
        format!("expression is nested more than {} levels deep", MAX_EXPR_DEPTH)
    );
}

#[test]
fn test_long_operator_chains_are_a_diagnostic() {
    let chain = vec!["1"; 10_000].join(" + ");
    let negations = format!("print {}1", "-".repeat(10_000));

    let diagnostics = compile_err(&[("a", &format!("print {}", chain)), ("b", &negations)], "a");

    let lines: Vec<(&str, u32)> = diagnostics.iter().map(|d| (d.file.as_str(), d.line)).collect();
    assert_eq!(lines, vec![("a", 1), ("b", 1)]);
    assert!(diagnostics
        .iter()
        .all(|d| d.kind == DiagnosticKind::Syntax && d.message.contains("nested")));
}

#[test]
fn test_moderate_nesting_compiles() {
    let source = format!("print {}7{}", "(".repeat(40), ")".repeat(40));

    compile_ok(&[("main", &source)], "main");
}
