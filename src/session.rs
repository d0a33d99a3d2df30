//! Program-level facade: load a program once, run it, inspect output and breakpoint stops.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::Error;
use crate::ast::Value;
use crate::evaluator::{DebugSnapshot, EvalConfig, Interpreter};

/// A loaded program and the interpreter that runs it.
///
/// Globals and functions survive between runs unless `run` is asked to reset them.
/// Output and breakpoint snapshots always describe the latest run, including one that
/// ended in an error.
#[derive(Debug, Default)]
pub struct Session {
    interpreter: Interpreter,
    program: Vec<Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EvalConfig) -> Self {
        Session {
            interpreter: Interpreter::with_config(config),
            program: Vec::new(),
        }
    }

    /// Read `source` and make it the program of this session.
    ///
    /// On a parse error the previously loaded program is kept.
    #[cfg(feature = "reader")]
    pub fn load(&mut self, source: &str) -> Result<(), Error> {
        self.program = crate::reader::read_program(source)?;
        debug!(forms = self.program.len(), "program loaded");
        Ok(())
    }

    /// Use already-read toplevel forms as the program.
    pub fn load_program(&mut self, forms: Vec<Value>) {
        self.program = forms;
    }

    pub fn program(&self) -> &[Value] {
        &self.program
    }

    /// Evaluate every toplevel form in order and return one result per form.
    ///
    /// The first error stops the run. Effects of the forms evaluated before it stay in
    /// place. `budget` bounds the wall-clock time of the whole run.
    pub fn run(&mut self, reset: bool, budget: Option<Duration>) -> Result<Vec<Value>, Error> {
        if reset {
            self.interpreter.reset();
        }
        self.interpreter.clear_output();
        self.interpreter.clear_snapshots();
        self.interpreter.set_time_budget(budget);

        let started = Instant::now();
        debug!(forms = self.program.len(), reset, ?budget, "run started");
        let results: Result<Vec<Value>, Error> = self
            .program
            .iter()
            .map(|form| self.interpreter.eval(form))
            .collect();
        self.interpreter.set_deadline(None);

        debug!(
            elapsed_ms = started.elapsed().as_millis(),
            ok = results.is_ok(),
            "run finished"
        );
        results
    }

    pub fn add_breakpoint(&mut self, line: usize) {
        self.interpreter.add_breakpoint(line);
    }

    pub fn clear_breakpoints(&mut self) {
        self.interpreter.clear_breakpoints();
    }

    /// Text written by `WRITE` and `TERPRI` during the latest run
    pub fn output(&self) -> &str {
        self.interpreter.output()
    }

    pub fn debug_snapshots(&self) -> &[DebugSnapshot] {
        self.interpreter.snapshots()
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }
}
