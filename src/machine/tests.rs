use super::*;
use crate::compiler::{Compiler, ScriptCompiler};
use maplit::btreemap;
use tokio_util::sync::CancellationToken;

fn program_of(entries: &[(&str, &str)], main: &str) -> Arc<Program> {
    let sources = entries
        .iter()
        .map(|(name, text)| (name.to_string(), text.to_string()))
        .collect();
    Arc::new(
        ScriptCompiler::new()
            .compile(&sources, main, &CancellationToken::new())
            .expect("test program should compile"),
    )
}

fn machine_for(source: &str) -> ScriptMachine {
    ScriptMachine::new(program_of(&[("main", source)], "main"), vm::DEFAULT_MAX_CALL_DEPTH)
}

/// Step until the machine asks to suspend.
fn run_to_suspension(machine: &mut ScriptMachine) -> Result<(), MachineFault> {
    for _ in 0..10_000 {
        if machine.step_once()? {
            return Ok(());
        }
    }
    panic!("machine never suspended");
}

/* ===================== Straight-line execution ===================== */

#[test]
fn test_runs_to_program_end() {
    let mut machine = machine_for("let x = 2\nlet y = x * 21\nprint y");

    run_to_suspension(&mut machine).unwrap();

    assert!(machine.is_program_end_reached());
    assert_eq!(
        machine.top_frame_variables(),
        Some(btreemap! { "x".to_string() => 2, "y".to_string() => 42 })
    );
    assert_eq!(machine.drain_output(), vec!["42".to_string()]);
    assert!(machine.drain_output().is_empty());
}

#[test]
fn test_empty_program_ends_immediately() {
    let mut machine = machine_for("");

    assert!(machine.step_once().unwrap());
    assert!(machine.is_program_end_reached());
    assert_eq!(machine.current_location(), None);
    assert_eq!(machine.top_frame_variables(), Some(VariableSnapshot::new()));
}

#[test]
fn test_steps_after_end_stay_suspended() {
    let mut machine = machine_for("print 1");
    run_to_suspension(&mut machine).unwrap();

    assert!(machine.step_once().unwrap());
    assert_eq!(machine.drain_output(), vec!["1".to_string()]);
}

#[test]
fn test_while_loop_counts() {
    let mut machine = machine_for("let i = 0\nwhile i < 5\n  i = i + 1\nend\nprint i");

    run_to_suspension(&mut machine).unwrap();

    assert_eq!(machine.drain_output(), vec!["5".to_string()]);
}

#[test]
fn test_if_else_takes_one_branch() {
    let source = "let x = 0\nif x\n  print 1\nelse\n  print 2\nend";
    let mut machine = machine_for(source);

    run_to_suspension(&mut machine).unwrap();

    assert_eq!(machine.drain_output(), vec!["2".to_string()]);
}

#[test]
fn test_return_ends_entry_script() {
    let mut machine = machine_for("print 1\nreturn\nprint 2");

    run_to_suspension(&mut machine).unwrap();

    assert!(machine.is_program_end_reached());
    assert_eq!(machine.drain_output(), vec!["1".to_string()]);
}

#[test]
fn test_program_from_json() {
    let json = r#"{
        "entry": "main",
        "units": {
            "main": {
                "name": "main",
                "code": [
                    {"line": 1, "op": {"type": "Let", "name": "x", "value": {"type": "Num", "v": 7}}},
                    {"line": 2, "op": {"type": "Print", "value": {
                        "type": "Binary", "op": "Rem",
                        "lhs": {"type": "Var", "name": "x"},
                        "rhs": {"type": "Num", "v": 4}
                    }}}
                ]
            }
        }
    }"#;
    let program: Program = serde_json::from_str(json).unwrap();
    let mut machine = ScriptMachine::new(Arc::new(program), 8);

    run_to_suspension(&mut machine).unwrap();

    assert_eq!(machine.drain_output(), vec!["3".to_string()]);
}

/* ===================== Calls ===================== */

#[test]
fn test_call_runs_callee_with_own_frame() {
    let program = program_of(
        &[("main", "let x = 1\ncall lib\nprint x"), ("lib", "let x = 99\nprint x")],
        "main",
    );
    let mut machine = ScriptMachine::new(program, vm::DEFAULT_MAX_CALL_DEPTH);

    run_to_suspension(&mut machine).unwrap();

    assert_eq!(machine.drain_output(), vec!["99".to_string(), "1".to_string()]);
    assert_eq!(machine.frames().len(), 1);
    assert_eq!(
        machine.top_frame_variables(),
        Some(btreemap! { "x".to_string() => 1 })
    );
}

#[test]
fn test_return_from_callee_resumes_caller() {
    let program = program_of(
        &[("main", "call lib\nprint 3"), ("lib", "print 1\nreturn\nprint 2")],
        "main",
    );
    let mut machine = ScriptMachine::new(program, vm::DEFAULT_MAX_CALL_DEPTH);

    run_to_suspension(&mut machine).unwrap();

    assert_eq!(machine.drain_output(), vec!["1".to_string(), "3".to_string()]);
}

#[test]
fn test_recursion_hits_call_depth_limit() {
    let program = program_of(&[("main", "call main")], "main");
    let mut machine = ScriptMachine::new(program, 4);

    let fault = run_to_suspension(&mut machine).unwrap_err();

    assert_eq!(
        fault,
        MachineFault::CallDepthExceeded {
            limit: 4,
            location: SourceLocation::new("main", 1),
        }
    );
}

/* ===================== Faults ===================== */

#[test]
fn test_division_by_zero() {
    let mut machine = machine_for("let z = 0\nprint 10 / z");

    let fault = run_to_suspension(&mut machine).unwrap_err();

    assert_eq!(fault, MachineFault::DivisionByZero(SourceLocation::new("main", 2)));
    assert_eq!(fault.to_string(), "division by zero at main:2");
}

#[test]
fn test_overflow() {
    let mut machine = machine_for("let x = 9223372036854775807\nx = x + 1");

    let fault = run_to_suspension(&mut machine).unwrap_err();

    assert!(matches!(fault, MachineFault::Overflow(_)));
}

/* ===================== Breakpoints and stepping ===================== */

#[test]
fn test_breakpoint_suspends_before_statement() {
    let mut machine = machine_for("let x = 1\nlet y = 2\nprint x + y");
    machine.set_breakpoint("main", 2, true);

    run_to_suspension(&mut machine).unwrap();

    assert!(!machine.is_program_end_reached());
    assert_eq!(machine.current_location(), Some(SourceLocation::new("main", 2)));
    assert_eq!(
        machine.top_frame_variables(),
        Some(btreemap! { "x".to_string() => 1 })
    );

    run_to_suspension(&mut machine).unwrap();
    assert!(machine.is_program_end_reached());
    assert_eq!(machine.drain_output(), vec!["3".to_string()]);
}

#[test]
fn test_breakpoint_inside_loop_hits_every_iteration() {
    let mut machine = machine_for("let i = 0\nwhile i < 3\n  i = i + 1\nend");
    machine.set_breakpoint("main", 3, true);

    let mut hits = 0;
    loop {
        run_to_suspension(&mut machine).unwrap();
        if machine.is_program_end_reached() {
            break;
        }
        hits += 1;
    }

    assert_eq!(hits, 3);
}

#[test]
fn test_disabled_breakpoint_is_ignored() {
    let mut machine = machine_for("let x = 1\nlet y = 2");
    machine.set_breakpoint("main", 2, true);
    machine.set_breakpoint("main", 2, false);

    run_to_suspension(&mut machine).unwrap();

    assert!(machine.is_program_end_reached());
}

#[test]
fn test_stepping_mode_stops_at_every_statement() {
    let mut machine = machine_for("let a = 1\nlet b = 2");
    machine.set_stepping_mode(true);
    assert!(machine.is_stepping_mode_enabled());

    run_to_suspension(&mut machine).unwrap();
    assert_eq!(machine.current_location(), Some(SourceLocation::new("main", 1)));

    run_to_suspension(&mut machine).unwrap();
    assert_eq!(machine.current_location(), Some(SourceLocation::new("main", 2)));

    machine.set_stepping_mode(false);
    run_to_suspension(&mut machine).unwrap();
    assert!(machine.is_program_end_reached());
}

#[test]
fn test_stepping_enters_callee() {
    let program = program_of(&[("main", "call lib\nprint 2"), ("lib", "print 1")], "main");
    let mut machine = ScriptMachine::new(program, vm::DEFAULT_MAX_CALL_DEPTH);
    machine.set_stepping_mode(true);

    run_to_suspension(&mut machine).unwrap();
    run_to_suspension(&mut machine).unwrap();

    assert_eq!(machine.current_location(), Some(SourceLocation::new("lib", 1)));
    assert_eq!(machine.frames().len(), 2);
}

#[test]
fn test_reset_rewinds_and_keeps_breakpoints() {
    let mut machine = machine_for("let x = 1\nprint x");
    machine.set_breakpoint("main", 2, true);
    run_to_suspension(&mut machine).unwrap();
    machine.set_stepping_mode(true);

    machine.reset();

    assert!(!machine.is_stepping_mode_enabled());
    assert_eq!(machine.current_location(), Some(SourceLocation::new("main", 1)));
    assert_eq!(machine.top_frame_variables(), Some(VariableSnapshot::new()));

    run_to_suspension(&mut machine).unwrap();
    assert_eq!(machine.current_location(), Some(SourceLocation::new("main", 2)));
}

#[test]
fn test_factory_creates_fresh_machines() {
    let program = program_of(&[("main", "print 5")], "main");
    let factory = ScriptMachineFactory::default();

    let mut first = factory.create(program.clone());
    let second = factory.create(program);
    while !first.step_once().unwrap() {}

    assert!(first.is_program_end_reached());
    assert!(!second.is_program_end_reached());
    assert_eq!(first.drain_output(), vec!["5".to_string()]);
}
