//! Script virtual machine
//!
//! All execution state lives in `frames: Vec<Activation>`; there is no
//! recursion, so the machine can stop between any two statements and pick up
//! again later.
//!
//! ## Suspension
//!
//! Before a statement executes, the machine checks whether it has to stop
//! there: always in stepping mode, otherwise only on an enabled breakpoint.
//! After stopping, the next `step_once` executes that statement without
//! checking again, so resuming always makes progress.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::eval::eval_expr;
use super::{Machine, MachineFault};
use crate::program::{Instr, Op, Program};
use crate::types::{SourceLocation, VariableSnapshot};

pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/* ===================== Frames ===================== */

/// One entered unit: where it is and what it has declared.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub unit: String,
    pub pc: usize,
    pub variables: VariableSnapshot,
}

impl Activation {
    fn enter(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            pc: 0,
            variables: VariableSnapshot::new(),
        }
    }
}

/* ===================== VM ===================== */

#[derive(Debug, Clone)]
pub struct ScriptMachine {
    program: Arc<Program>,
    frames: Vec<Activation>,
    breakpoints: HashMap<String, HashSet<u32>>,
    stepping: bool,
    /// Set when the machine stopped in front of a statement it has not run yet
    resume_pending: bool,
    done: bool,
    output: Vec<String>,
    max_call_depth: usize,
}

impl ScriptMachine {
    pub fn new(program: Arc<Program>, max_call_depth: usize) -> Self {
        let frames = vec![Activation::enter(&program.entry)];
        Self {
            program,
            frames,
            breakpoints: HashMap::new(),
            stepping: false,
            resume_pending: false,
            done: false,
            output: Vec::new(),
            max_call_depth,
        }
    }

    pub fn frames(&self) -> &[Activation] {
        &self.frames
    }

    fn is_breakpoint(&self, location: &SourceLocation) -> bool {
        self.breakpoints
            .get(&location.file)
            .is_some_and(|lines| lines.contains(&location.line))
    }

    /// Find the statement the next step runs, leaving finished callee frames.
    ///
    /// Returns `None` once the entry frame has run past its last statement.
    fn next_instr(&mut self) -> Result<Option<Instr>, MachineFault> {
        loop {
            let Some(frame) = self.frames.last() else {
                return Ok(None);
            };
            let unit = self
                .program
                .unit(&frame.unit)
                .ok_or_else(|| MachineFault::UnknownUnit(frame.unit.clone()))?;

            if let Some(instr) = unit.code.get(frame.pc) {
                return Ok(Some(instr.clone()));
            }

            if self.frames.len() == 1 {
                return Ok(None);
            }
            self.frames.pop();
        }
    }

    fn execute(&mut self, instr: Instr) -> Result<(), MachineFault> {
        let depth = self.frames.len();
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| MachineFault::UnknownUnit(self.program.entry.clone()))?;
        let location = SourceLocation::new(frame.unit.clone(), instr.line);

        match instr.op {
            Op::Let { name, value } => {
                let v = eval_expr(&value, &frame.variables, &location)?;
                frame.variables.insert(name, v);
                frame.pc += 1;
            }

            Op::Assign { name, value } => {
                let v = eval_expr(&value, &frame.variables, &location)?;
                match frame.variables.get_mut(&name) {
                    Some(slot) => *slot = v,
                    None => {
                        return Err(MachineFault::UndefinedVariable { name, location });
                    }
                }
                frame.pc += 1;
            }

            Op::Print { value } => {
                let v = eval_expr(&value, &frame.variables, &location)?;
                self.output.push(v.to_string());
                frame.pc += 1;
            }

            Op::JumpUnless { cond, target } => {
                let v = eval_expr(&cond, &frame.variables, &location)?;
                frame.pc = if v == 0 { target } else { frame.pc + 1 };
            }

            Op::Jump { target } => {
                frame.pc = target;
            }

            Op::Call { unit } => {
                if depth >= self.max_call_depth {
                    return Err(MachineFault::CallDepthExceeded {
                        limit: self.max_call_depth,
                        location,
                    });
                }
                if self.program.unit(&unit).is_none() {
                    return Err(MachineFault::UnknownUnit(unit));
                }
                frame.pc += 1;
                self.frames.push(Activation::enter(&unit));
            }

            Op::Return => {
                if depth == 1 {
                    self.done = true;
                } else {
                    self.frames.pop();
                }
            }
        }

        Ok(())
    }
}

impl Machine for ScriptMachine {
    fn step_once(&mut self) -> Result<bool, MachineFault> {
        if self.done {
            return Ok(true);
        }

        let Some(instr) = self.next_instr()? else {
            self.done = true;
            return Ok(true);
        };

        if self.resume_pending {
            self.resume_pending = false;
        } else if self.stepping || self.current_location().is_some_and(|l| self.is_breakpoint(&l)) {
            self.resume_pending = true;
            return Ok(true);
        }

        self.execute(instr)?;
        // Return from the entry frame ends the program inside this step.
        Ok(self.done)
    }

    fn is_program_end_reached(&self) -> bool {
        self.done
    }

    fn top_frame_variables(&self) -> Option<VariableSnapshot> {
        self.frames.last().map(|frame| frame.variables.clone())
    }

    fn current_location(&self) -> Option<SourceLocation> {
        if self.done {
            return None;
        }
        let frame = self.frames.last()?;
        let instr = self.program.unit(&frame.unit)?.code.get(frame.pc)?;
        Some(SourceLocation::new(frame.unit.clone(), instr.line))
    }

    fn set_breakpoint(&mut self, file: &str, line: u32, enabled: bool) {
        if enabled {
            self.breakpoints
                .entry(file.to_string())
                .or_default()
                .insert(line);
        } else if let Some(lines) = self.breakpoints.get_mut(file) {
            lines.remove(&line);
        }
    }

    fn reset(&mut self) {
        self.frames = vec![Activation::enter(&self.program.entry)];
        self.stepping = false;
        self.resume_pending = false;
        self.done = false;
        self.output.clear();
    }

    fn set_stepping_mode(&mut self, enabled: bool) {
        self.stepping = enabled;
    }

    fn is_stepping_mode_enabled(&self) -> bool {
        self.stepping
    }

    fn drain_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}
