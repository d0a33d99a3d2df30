//! Tree-walking evaluator.
//!
//! [`Interpreter`] owns all session state: the scope stack, the global function table,
//! the output buffer written by `WRITE`/`TERPRI`, the breakpoint set with the snapshots
//! captured at breakpoints, and the wall-clock deadline of the current run.
//!
//! Scoping is dynamic. Calling a function pushes one frame on top of the caller's frames,
//! so a function body sees the variables of every active caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::ast::{Closure, Datum, Value};
use crate::builtinops::{Arity, OpKind, find_builtin_op};
use crate::{DEFAULT_MAX_EVAL_DEPTH, Error};

mod environment;
pub(crate) mod special_forms;

pub use environment::Environment;

/// Evaluation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalConfig {
    /// Validate argument counts and argument types. When off, violations are not
    /// reported: missing arguments read as `NIL` and ill-typed operations yield `NIL`.
    pub checked: bool,
    /// Maximum nesting of `eval` invocations before evaluation fails
    pub max_eval_depth: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            checked: true,
            max_eval_depth: DEFAULT_MAX_EVAL_DEPTH,
        }
    }
}

impl EvalConfig {
    pub fn with_checked(mut self, checked: bool) -> Self {
        self.checked = checked;
        self
    }

    pub fn with_max_eval_depth(mut self, max_eval_depth: usize) -> Self {
        self.max_eval_depth = max_eval_depth;
        self
    }
}

/// Variables visible when evaluation reached a breakpoint line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSnapshot {
    pub line: usize,
    pub col: usize,
    /// Rendered value of every visible variable, inner bindings shadowing outer ones
    pub variables: BTreeMap<String, String>,
}

/// Evaluator state for one session. Not shareable across threads.
#[derive(Debug, Default)]
pub struct Interpreter {
    env: Environment,
    functions: HashMap<String, Closure>,
    output: String,
    config: EvalConfig,
    deadline: Option<Instant>,
    breakpoints: BTreeSet<usize>,
    snapshots: Vec<DebugSnapshot>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_config(EvalConfig::default())
    }

    pub fn with_config(config: EvalConfig) -> Self {
        Interpreter {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> EvalConfig {
        self.config
    }

    pub fn set_config(&mut self, config: EvalConfig) {
        self.config = config;
    }

    pub fn is_checked(&self) -> bool {
        self.config.checked
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    /// Text accumulated by `WRITE` and `TERPRI`
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn write_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    pub fn clear_output(&mut self) {
        self.output.clear();
    }

    pub fn add_breakpoint(&mut self, line: usize) {
        self.breakpoints.insert(line);
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn snapshots(&self) -> &[DebugSnapshot] {
        &self.snapshots
    }

    pub fn clear_snapshots(&mut self) {
        self.snapshots.clear();
    }

    /// Fail every evaluation step started after `deadline`.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Allow `budget` of wall-clock time from now; `None` removes the limit.
    pub fn set_time_budget(&mut self, budget: Option<Duration>) {
        self.deadline = budget.and_then(|b| Instant::now().checked_add(b));
    }

    /// Forget all variables, constants and functions.
    pub fn reset(&mut self) {
        self.env.reset();
        self.functions.clear();
    }

    pub fn define_function(&mut self, name: impl Into<String>, closure: Closure) {
        self.functions.insert(name.into(), closure);
    }

    pub fn function(&self, name: &str) -> Option<&Closure> {
        self.functions.get(name)
    }

    /// Names of all user functions, sorted
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Evaluate an S-expression (public API)
    pub fn eval(&mut self, expr: &Value) -> Result<Value, Error> {
        self.eval_with_depth_tracking(expr, 0)
    }

    /// Evaluate with depth tracking to prevent stack overflow
    pub(crate) fn eval_with_depth_tracking(
        &mut self,
        expr: &Value,
        depth: usize,
    ) -> Result<Value, Error> {
        self.eval_node(expr, false, depth)
    }

    /// Evaluate `expr` as an assignable place. A symbol resolves to its binding itself,
    /// created as `NIL` in the innermost frame if absent.
    pub(crate) fn eval_place(&mut self, expr: &Value, depth: usize) -> Result<Value, Error> {
        self.eval_node(expr, true, depth)
    }

    fn eval_node(&mut self, expr: &Value, create: bool, depth: usize) -> Result<Value, Error> {
        if depth >= self.config.max_eval_depth {
            return Err(Error::EvalError(format!(
                "Evaluation depth limit exceeded (max: {})",
                self.config.max_eval_depth
            )));
        }
        self.check_breakpoint(expr);
        if let Some(deadline) = self.deadline
            && Instant::now() > deadline
        {
            return Err(Error::Timeout);
        }

        match expr.datum() {
            // Self-evaluating forms yield a fresh node so program text is never mutated
            Datum::Nil
            | Datum::True
            | Datum::Int(_)
            | Datum::Ratio(_)
            | Datum::Float(_)
            | Datum::Char(_)
            | Datum::Str(_)
            | Datum::Closure(_)
            | Datum::GlobalRef(_) => Ok(expr.shallow_copy()),

            // Variable lookup yields the bound node itself, so aliases see later writes
            Datum::Symbol(name) if create => Ok(self.env.lookup_or_create(&name)),
            Datum::Symbol(name) => self
                .env
                .lookup(&name)
                .ok_or(Error::UnboundVariable(name)),

            // Function application or special form
            Datum::Cons(head, rest) => self
                .eval_form(&head, &rest, depth)
                .map_err(|err| add_context(err, expr)),
        }
    }

    fn eval_form(&mut self, head: &Value, rest: &Value, depth: usize) -> Result<Value, Error> {
        match head.datum() {
            Datum::Symbol(name) => {
                let args = rest.to_vec();
                if let Some(op) = find_builtin_op(&name) {
                    if self.config.checked {
                        op.validate_arity(args.len())?;
                    }
                    return match op.op_kind {
                        OpKind::Function(f) => {
                            let evaluated = self.eval_args(&args, depth)?;
                            f(&evaluated, self)
                        }
                        OpKind::SpecialForm(f) => f(&args, self, depth),
                    };
                }
                match self.functions.get(&name).cloned() {
                    Some(closure) => self.call(&closure, &args, depth),
                    None if self.config.checked => Err(Error::UnknownFunction(name)),
                    None => Ok(Value::nil()),
                }
            }
            // ((LAMBDA (X) ...) 3) and friends: the head must evaluate to a closure
            Datum::Cons(..) => {
                let func = self.eval_with_depth_tracking(head, depth + 1)?;
                match func.as_closure() {
                    Some(closure) => self.call(&closure, &rest.to_vec(), depth),
                    None if self.config.checked => {
                        Err(Error::EvalError(format!("{func} is not a function")))
                    }
                    None => Ok(Value::nil()),
                }
            }
            Datum::Str(s) => Err(Error::EvalError(format!("{s} is not a function name"))),
            _ => Err(Error::EvalError(format!("{head} is not a function name"))),
        }
    }

    /// Evaluate argument expressions left to right
    pub(crate) fn eval_args(&mut self, args: &[Value], depth: usize) -> Result<Vec<Value>, Error> {
        args.iter()
            .map(|arg| self.eval_with_depth_tracking(arg, depth + 1))
            .collect()
    }

    /// Evaluate expressions in order and return the last value (`NIL` if empty)
    pub(crate) fn eval_sequence(&mut self, exprs: &[Value], depth: usize) -> Result<Value, Error> {
        let mut result = Value::nil();
        for expr in exprs {
            result = self.eval_with_depth_tracking(expr, depth + 1)?;
        }
        Ok(result)
    }

    /// Apply `closure` to argument expressions. The arguments are evaluated in the
    /// caller's scope before the callee's frame is pushed.
    pub(crate) fn call(
        &mut self,
        closure: &Closure,
        arg_exprs: &[Value],
        depth: usize,
    ) -> Result<Value, Error> {
        let args = self.eval_args(arg_exprs, depth)?;
        self.apply_closure(closure, args, depth)
    }

    /// Apply `closure` to already evaluated arguments.
    pub fn apply_closure(
        &mut self,
        closure: &Closure,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Value, Error> {
        let params = closure.params.to_vec();
        if self.config.checked && params.len() != args.len() {
            return Err(Error::arity_error_with_expr(
                Arity::Exact(params.len()),
                args.len(),
                closure.name.clone(),
            ));
        }

        let mut bindings = Vec::with_capacity(params.len());
        let mut args = args.into_iter();
        for param in &params {
            let value = args.next().unwrap_or_else(Value::nil);
            match param.as_symbol() {
                Some(name) => bindings.push((name, value)),
                None if self.config.checked => {
                    return Err(Error::EvalError(format!(
                        "parameter must be an ID, got {param}"
                    )));
                }
                None => {}
            }
        }

        let body = closure.body.to_vec();
        self.with_scope(bindings, |interp| interp.eval_sequence(&body, depth + 1))
            .map_err(|err| match err {
                Error::EvalError(msg) if !msg.contains("\n  In function:") => {
                    Error::EvalError(format!("{msg}\n  In function: {}", closure.name))
                }
                other => other,
            })
    }

    /// Run `f` inside a new frame holding `bindings`. The frame is popped on every exit.
    pub(crate) fn with_scope<T, I, F>(&mut self, bindings: I, f: F) -> Result<T, Error>
    where
        I: IntoIterator<Item = (String, Value)>,
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        self.env.push_with(bindings);
        let result = f(self);
        self.env.pop();
        result
    }

    fn check_breakpoint(&mut self, expr: &Value) {
        if self.breakpoints.is_empty() {
            return;
        }
        let Some(pos) = expr.pos() else {
            return;
        };
        if !self.breakpoints.contains(&pos.row) {
            return;
        }
        // Stops within one statement coalesce into the latest one
        if let Some(last) = self.snapshots.last()
            && last.line == pos.row
            && last.col != pos.col
        {
            self.snapshots.pop();
        }
        let variables = self.env.visible_bindings();
        trace!(line = pos.row, col = pos.col, vars = variables.len(), "breakpoint hit");
        self.snapshots.push(DebugSnapshot {
            line: pos.row,
            col: pos.col,
            variables,
        });
    }
}

/// Helper function to add expression context to errors
fn add_context(error: Error, expr: &Value) -> Error {
    const MARKER: &str = "\n  Context: ";
    match error {
        Error::EvalError(msg) if !msg.contains(MARKER) => {
            Error::EvalError(format!("{msg}{MARKER}while evaluating: {expr}"))
        }
        Error::TypeError(msg) if !msg.contains(MARKER) => {
            Error::TypeError(format!("{msg}{MARKER}while evaluating: {expr}"))
        }
        // Unbound variables, arity errors and the rest carry their own context
        other => other,
    }
}

#[cfg(all(test, feature = "reader"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::Error;
    use crate::ast::{nil, sym, val};
    use crate::numeric::Ratio;
    use crate::reader::{read_expr, read_program};
    use maplit::btreemap;

    /// Test result variants for comprehensive testing
    #[derive(Debug)]
    enum TestResult {
        EvalResult(Value),           // Evaluation should succeed with this value
        Setup,                       // Evaluation should succeed, value is irrelevant
        SpecificError(&'static str), // Evaluation should fail with error containing this string
        Error,                       // Evaluation should fail (any error)
    }
    use TestResult::*;

    /// Test environment containing test cases that share state
    struct TestEnvironment(Vec<(&'static str, TestResult)>);

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> TestResult {
        EvalResult(val(value))
    }

    fn ratio(n: i64, d: i64) -> TestResult {
        EvalResult(Value::ratio(Ratio::new(n, d).unwrap()))
    }

    /// Macro for setup expressions whose value does not matter (like DEFUN)
    macro_rules! test_setup {
        ($expr:expr) => {
            ($expr, Setup)
        };
    }

    /// Run tests in isolated environments with shared state
    fn run_tests_in_environment(test_environments: Vec<TestEnvironment>) {
        for (env_idx, TestEnvironment(test_cases)) in test_environments.iter().enumerate() {
            let mut interp = Interpreter::new();
            for (test_idx, (input, expected)) in test_cases.iter().enumerate() {
                let test_id = format!("Environment #{} test #{}", env_idx + 1, test_idx + 1);
                execute_test_case(input, expected, &mut interp, &test_id);
            }
        }
    }

    /// Execute a single test case with detailed error reporting
    fn execute_test_case(
        input: &str,
        expected: &TestResult,
        interp: &mut Interpreter,
        test_id: &str,
    ) {
        let expr = match read_expr(input) {
            Ok(expr) => expr,
            Err(parse_err) => {
                panic!("{test_id}: unexpected parse error for '{input}': {parse_err:?}");
            }
        };

        match (interp.eval(&expr), expected) {
            (Ok(actual), EvalResult(expected_val)) => {
                assert!(
                    actual == *expected_val,
                    "{test_id}: '{input}' expected {expected_val:?}, got {actual:?}"
                );
            }
            (Ok(_), Setup) | (Err(_), Error) => {}
            (Err(e), SpecificError(expected_text)) => {
                let error_msg = format!("{e}");
                assert!(
                    error_msg.contains(expected_text),
                    "{test_id}: error should contain '{expected_text}', got: {error_msg}"
                );
            }
            (Ok(actual), Error) => {
                panic!("{test_id}: '{input}' expected error, got {actual:?}");
            }
            (Ok(actual), SpecificError(expected_text)) => {
                panic!("{test_id}: expected error containing '{expected_text}', got {actual:?}");
            }
            (Err(err), EvalResult(expected_val)) => {
                panic!("{test_id}: '{input}' expected {expected_val:?}, got error {err:?}");
            }
            (Err(err), Setup) => {
                panic!("{test_id}: setup '{input}' failed: {err}");
            }
        }
    }

    /// Simplified test runner, one fresh interpreter per case
    fn run_comprehensive_tests(test_cases: Vec<(&str, TestResult)>) {
        for (i, (input, expected)) in test_cases.iter().enumerate() {
            let mut interp = Interpreter::new();
            let test_id = format!("#{}", i + 1);
            execute_test_case(input, expected, &mut interp, &test_id);
        }
    }

    #[test]
    #[expect(clippy::too_many_lines)] // Comprehensive test coverage is intentionally thorough
    fn test_comprehensive_operations_data_driven() {
        let test_cases = vec![
            // === SELF-EVALUATING FORMS ===
            ("42", success(42)),
            ("-271", success(-271)),
            ("1/3", ratio(1, 3)),
            ("2.5", success(2.5)),
            ("\"hello\"", success("hello")),
            ("#\\a", success('a')),
            ("T", success(true)),
            ("NIL", EvalResult(nil())),
            ("()", EvalResult(nil())),
            // === ARITHMETIC ===
            ("(+ 3 4 (* 5 6))", success(37)),
            ("(+)", success(0)),
            ("(- 10 3 2)", success(5)),
            ("(- 10)", success(-10)),
            ("(/ 1 3)", ratio(1, 3)),
            ("(/ 6 3)", success(2)),
            ("(+ 1/2 1/2)", success(1)),
            ("(+ 2 1/2)", ratio(5, 2)),
            ("(* 1/2 0.5)", success(0.25)),
            ("(+ 9223372036854775807 1)", SpecificError("overflow")),
            ("(/ 1 0)", SpecificError("division by zero")),
            ("(-)", SpecificError("expected at least 1 arguments, got 0")),
            // === COMPARISONS ===
            ("(< 1 2 3)", success(true)),
            ("(< 1 3 2)", success(false)),
            ("(>= 3 3 1)", success(true)),
            ("(<)", SpecificError("<: expected at least 1 arguments, got 0")),
            ("(< 1 'A)", SpecificError("A is not a number")),
            ("(< 1 1.5)", Error),
            // === QUOTE ===
            ("(QUOTE (1 2 3))", success([1, 2, 3])),
            ("'hello", success(sym("HELLO"))),
            ("'(a b)", success(vec![sym("A"), sym("B")])),
            ("''x", success(vec![sym("QUOTE"), sym("X")])),
            ("'()", EvalResult(nil())),
            // === CONDITIONALS AND LOGIC ===
            ("(IF T 1 2)", success(1)),
            ("(IF NIL 1 2)", success(2)),
            ("(IF NIL 1)", EvalResult(nil())),
            ("(IF 0 'yes 'no)", success(sym("YES"))),
            ("(IF T)", SpecificError("expected 2 to 3 arguments")),
            ("(AND)", success(true)),
            ("(AND 1 2 3)", success(3)),
            ("(AND 1 NIL (car 5))", EvalResult(nil())),
            ("(OR)", EvalResult(nil())),
            ("(OR NIL 2 (car 5))", success(2)),
            ("(OR NIL NIL)", EvalResult(nil())),
            ("(PROGN)", EvalResult(nil())),
            ("(PROGN 1 2 3)", success(3)),
            // === LISTS ===
            ("(CAR '(1 2))", success(1)),
            ("(CDR '(1 2))", success([2])),
            ("(CONS 1 '(2 3))", success([1, 2, 3])),
            ("(CONS 1 2)", EvalResult(Value::cons(val(1), val(2)))),
            ("(LIST 1 (+ 1 1) 3)", success([1, 2, 3])),
            ("(LENGTH '(1 2 3))", success(3)),
            ("(NTH 1 '(a b c))", success(sym("B"))),
            ("(NTHCDR 1 '(a b c))", success(vec![sym("B"), sym("C")])),
            ("(APPEND '(1) '(2 3) NIL)", success([1, 2, 3])),
            ("(MEMBER 2 '(1 2 3))", success([2, 3])),
            ("(REMOVE 'a '(a b a c))", success(vec![sym("B"), sym("C")])),
            ("(SUBST 'x 'y '(y (y z)))", success(vec![sym("X"), val(vec![sym("X"), sym("Z")])])),
            ("(EQUALP '(1 (2)) (LIST 1 (LIST 2)))", success(true)),
            ("(CAR 5)", SpecificError("CAR expects a list")),
            ("(CONS 1)", SpecificError("CONS: expected 2 arguments, got 1")),
            // === ERRORS IN APPLICATION ===
            ("X", SpecificError("unknown symbol X")),
            ("(FOO 1)", SpecificError("unknown function FOO")),
            ("(1 2 3)", SpecificError("1 is not a function name")),
            ("(\"f\" 2)", SpecificError("f is not a function name")),
            ("((+ 1 2) 3)", SpecificError("3 is not a function")),
            ("(COMMA 1)", SpecificError("COMMA NOT ALLOWED OUTSIDE OF BACKQUOTE")),
            ("(ASSERT (> 1 2) \"bad order\")", SpecificError("ASSERT FAILED: bad order")),
            // === LAMBDA IN OPERATOR POSITION ===
            ("((LAMBDA (X) (* X X)) 4)", success(16)),
            ("((LAMBDA (X Y) X) 4)", SpecificError("LAMBDA: expected 2 arguments, got 1")),
            ("(FUNCALL (LAMBDA (X) (+ X 1)) 4)", success(5)),
            ("(APPLY (LAMBDA (X Y) (- X Y)) '(10 4))", success(6)),
            ("(FUNCALL #'(LAMBDA () 7))", success(7)),
            ("(FUNCALL 3 4)", SpecificError("expected a function")),
            // === BACKQUOTE ===
            ("`(1 ,(+ 1 1) 3)", success([1, 2, 3])),
            ("`x", success(sym("X"))),
            ("(LET ((x '(2 3))) `(1 ,x))", EvalResult(val(vec![val(1), val([2, 3])]))),
            ("(LET ((x 5)) `(a . ,x))", EvalResult(Value::cons(sym("A"), val(5)))),
            // === LOOPS ===
            // Updates rebind one by one, later updates see earlier ones
            ("(DO ((i 0 (+ i 1)) (acc NIL (CONS i acc))) ((>= i 3) acc))", success([3, 2, 1])),
            ("(DO ((i 0 (+ i 1)) (j 0 i)) ((>= i 3) j))", success(3)),
            ("(DO ((i 0 (+ i 1))) ((>= i 3)))", EvalResult(nil())),
            // A variable without an update becomes NIL after the first pass
            ("(DO ((i 0 (+ i 1)) (k 7)) ((>= i 2) k))", EvalResult(nil())),
            ("(DO ((i 0 (+ i 1)) (k 7)) ((>= i 0) k))", success(7)),
            ("(DO 5 (T))", SpecificError("DO is not well structured")),
            ("(DO () (T))", SpecificError("DO is not well structured")),
            ("(DOLIST (x '(1 2 3)) x)", EvalResult(nil())),
            ("(LET ((s 0)) (DOLIST (x '(1 2 3)) (SETF s (+ s x))) s)", success(6)),
            // === LET ===
            ("(LET ((x 1)) (LET ((x 2)) x))", success(2)),
            ("(LET ((x 1) (y 2)) (+ x y))", success(3)),
            ("(LET ((x 1)) (LET ((x 2) (y x)) y))", success(1)),
            ("(LET ((x)) x)", SpecificError("expected (id init)")),
            ("(LET ((1 2)) 3)", SpecificError("expected ID")),
            ("(LET () )", EvalResult(nil())),
            // === SETF ===
            ("(SETF)", EvalResult(nil())),
            ("(SETF a 1 b)", SpecificError("expected an even number of arguments")),
            ("(PROGN (SETF a 1 b (+ a 1)) (LIST a b))", success([1, 2])),
            ("(PROGN (SETF x '(1 2)) (SETF (CAR x) 9) x)", success([9, 2])),
            // === TYPES ===
            ("(TYPEP 1/2 'RATIO)", success(true)),
            ("(TYPEP 3 'FLOAT)", success(false)),
            ("(NUMBERP 'x)", success(false)),
            ("(CHAR \"abc\" 2)", success('c')),
            ("(THIRD '(1 2 3))", success(3)),
        ];

        run_comprehensive_tests(test_cases);
    }

    #[test]
    fn test_functions_and_shared_state() {
        let test_environments = vec![
            TestEnvironment(vec![
                test_setup!("(DEFUN SQ (X) (* X X))"),
                ("(SQ 5)", success(25)),
                ("(SQ (SQ 2))", success(16)),
                ("(SQ)", SpecificError("SQ: expected 1 arguments, got 0")),
                ("(SQ 1 2)", SpecificError("SQ: expected 1 arguments, got 2")),
                ("(FUNCALL #'SQ 3)", success(9)),
                ("(APPLY #'SQ '(4))", success(16)),
                (
                    "(FUNCTION SQ)",
                    EvalResult(Value::closure(
                        "SQ",
                        val(vec![sym("X")]),
                        val(vec![val(vec![sym("*"), sym("X"), sym("X")])]),
                    )),
                ),
                ("(FUNCTION NOPE)", SpecificError("undefined function NOPE")),
            ]),
            TestEnvironment(vec![
                // Recursion through the global function table
                test_setup!(
                    "(DEFUN FACT (N) (IF (<= N 1) 1 (* N (FACT (- N 1)))))"
                ),
                ("(FACT 10)", success(3_628_800)),
                test_setup!("(DEFUN COUNTDOWN (N) (IF (<= N 0) NIL (CONS N (COUNTDOWN (- N 1)))))"),
                ("(COUNTDOWN 3)", success([3, 2, 1])),
            ]),
            TestEnvironment(vec![
                // Dynamic scope: callees see their callers' variables
                test_setup!("(DEFUN PEEK () Y)"),
                ("(LET ((Y 42)) (PEEK))", success(42)),
                ("(PEEK)", SpecificError("unknown symbol Y")),
                // Arguments are evaluated in the caller's scope
                test_setup!("(DEFUN ID (Y) Y)"),
                ("(LET ((Y 1)) (ID (+ Y 1)))", success(2)),
            ]),
            TestEnvironment(vec![
                test_setup!("(DEFCONSTANT LIMIT 10)"),
                ("LIMIT", success(10)),
                ("(DEFPARAMETER RATE 1/4)", EvalResult(Value::global("RATE"))),
                ("(* LIMIT RATE)", ratio(5, 2)),
                // Constants are not protected
                ("(SETF LIMIT 11)", success(11)),
                ("LIMIT", success(11)),
                ("(DEFCONSTANT 5 10)", SpecificError("expected ID")),
            ]),
            TestEnvironment(vec![
                // Aliasing: SETF through CAR is visible from every holder of the list
                test_setup!("(SETF L '(1 2 3))"),
                test_setup!("(SETF M L)"),
                ("(SETF (CAR L) 9)", success(9)),
                ("M", success([9, 2, 3])),
                ("L", success([9, 2, 3])),
                // Rebinding L does not touch M
                test_setup!("(SETF L 0)"),
                ("M", success([9, 2, 3])),
            ]),
            TestEnvironment(vec![
                // Parameters and LET variables initialised from a variable share its node
                test_setup!("(SETF X 1)"),
                test_setup!("(DEFUN SET-ARG (A) (SETF A 5))"),
                test_setup!("(SET-ARG X)"),
                ("X", success(5)),
                test_setup!("(LET ((Y X)) (SETF Y 9))"),
                ("X", success(9)),
                test_setup!("(APPLY #'SET-ARG '(X))"),
                ("X", success(5)),
                test_setup!("(FUNCALL (LAMBDA (B) (SETF B 7)) X)"),
                ("X", success(7)),
                // SETF copies the value into its place, it does not alias
                test_setup!("(SETF Z X)"),
                test_setup!("(SETF Z 0)"),
                ("X", success(7)),
                // A literal argument is a fresh node
                test_setup!("(DEFUN BUMP (A) (SETF A (+ A 1)) A)"),
                ("(BUMP 1)", success(2)),
                ("(BUMP 1)", success(2)),
            ]),
            TestEnvironment(vec![
                // Closures capture parameter list and body, not the environment
                test_setup!("(SETF F (LAMBDA (A) (+ A K)))"),
                ("(LET ((K 10)) (FUNCALL F 1))", success(11)),
                ("(FUNCALL F 1)", SpecificError("unknown symbol K")),
            ]),
        ];

        run_tests_in_environment(test_environments);
    }

    #[test]
    fn test_output_buffer() {
        let mut interp = Interpreter::new();
        for expr in read_program("(WRITE 1) (TERPRI) (WRITE '(a \"b\")) (WRITE 1/2)").unwrap() {
            interp.eval(&expr).unwrap();
        }
        assert_eq!(interp.output(), "1\n(A \"b\")1/2");
        interp.clear_output();
        assert_eq!(interp.output(), "");
    }

    #[test]
    fn test_literals_are_not_mutated() {
        let mut interp = Interpreter::new();
        let program = read_program("(DEFUN MK () '(1 2)) (SETF (CAR (MK)) 5) (MK)").unwrap();
        let results: Vec<Value> = program
            .iter()
            .map(|expr| interp.eval(expr).unwrap())
            .collect();
        assert_eq!(results[2], val([1, 2]));
    }

    #[test]
    fn test_breakpoint_snapshots() {
        let mut interp = Interpreter::new();
        interp.add_breakpoint(2);
        let program = read_program("(SETF X 3)\n(+ X X)").unwrap();
        let results: Vec<Value> = program
            .iter()
            .map(|expr| interp.eval(expr).unwrap())
            .collect();
        assert_eq!(results[1], val(6));

        // Every stop on line 2 coalesces into the last one
        let snapshots = interp.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].line, 2);
        assert_eq!(
            snapshots[0].variables,
            btreemap! { "X".to_owned() => "3".to_owned() }
        );
    }

    #[test]
    fn test_breakpoint_inner_scope_shadows() {
        let mut interp = Interpreter::new();
        interp.add_breakpoint(3);
        let program = read_program("(SETF X 1)\n(LET ((X 2) (Y 5))\n  (+ X Y))").unwrap();
        for expr in &program {
            interp.eval(expr).unwrap();
        }
        let last = interp.snapshots().last().unwrap();
        assert_eq!(last.line, 3);
        assert_eq!(
            last.variables,
            btreemap! {
                "X".to_owned() => "2".to_owned(),
                "Y".to_owned() => "5".to_owned(),
            }
        );
    }

    #[test]
    fn test_timeout() {
        let mut interp = Interpreter::new();
        let program =
            read_program("(WRITE 'start) (DO ((i 0 (+ i 1))) ((< i 0)) (WRITE i))").unwrap();
        interp.set_time_budget(Some(Duration::from_millis(20)));
        assert!(interp.eval(&program[0]).is_ok());
        let err = interp.eval(&program[1]).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(format!("{err}"), "RuntimeError: max allowed runtime exceeded!");
        // Output written before cancellation is kept
        assert!(interp.output().starts_with("START0123"));
    }

    #[test]
    fn test_depth_limit() {
        let mut interp = Interpreter::with_config(EvalConfig::default().with_max_eval_depth(64));
        let program = read_program("(DEFUN DEEP (N) (+ 1 (DEEP (+ N 1)))) (DEEP 0)").unwrap();
        interp.eval(&program[0]).unwrap();
        let err = interp.eval(&program[1]).unwrap_err();
        assert!(format!("{err}").contains("Evaluation depth limit exceeded (max: 64)"));
        // Frames of the failed calls were popped
        assert_eq!(interp.environment().depth(), 1);
    }

    #[test]
    fn test_unchecked_mode() {
        let mut interp = Interpreter::with_config(EvalConfig::default().with_checked(false));
        let cases = vec![
            ("(CAR 5)", nil()),
            ("(CONS 1)", val([1])),
            ("(UNDEFINED 1 2)", nil()),
            ("((LAMBDA (X Y) Y) 1)", nil()),
            ("(< 1 'A)", nil()),
        ];
        for (input, expected) in cases {
            let expr = read_expr(input).unwrap();
            assert_eq!(interp.eval(&expr).unwrap(), expected, "{input}");
        }
        // Unknown symbols are still reported
        assert!(interp.eval(&read_expr("NOPE").unwrap()).is_err());
    }

    #[test]
    fn test_reset_forgets_definitions() {
        let mut interp = Interpreter::new();
        for expr in read_program("(DEFUN F () 1) (SETF X 2)").unwrap() {
            interp.eval(&expr).unwrap();
        }
        assert_eq!(interp.function_names(), vec!["F".to_owned()]);
        interp.reset();
        assert!(interp.function("F").is_none());
        assert!(interp.environment().lookup("X").is_none());
    }

    #[test]
    fn test_error_context() {
        let mut interp = Interpreter::new();
        let err = interp.eval(&read_expr("(+ 1 (CAR 5))").unwrap()).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.starts_with("RuntimeError: type error: CAR expects a list"));
        // Context is attached once, by the innermost failing form
        assert_eq!(msg.matches("Context:").count(), 1);
        assert!(msg.contains("while evaluating: (CAR 5)"));
    }
}
