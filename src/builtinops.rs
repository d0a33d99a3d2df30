//! Built-in operations registry.
//!
//! Every operation the evaluator dispatches on by head symbol lives in one static
//! table, looked up in O(1) through a name index. A head symbol that is not in the
//! table falls through to the user function table.
//!
//! ```lisp
//! (+ 1 2/3 0.5)          ; arithmetic over the numeric tower
//! (MEMBER 3 '(1 2 3 4))  ; => (3 4)
//! (SUBST 'X 'Y '(Y (Y)))  ; => (X (X))
//! ```
//!
//! ## Functions vs Special Forms
//!
//! - **Functions**: all arguments are evaluated left to right before the builtin runs
//!   (e.g. `+`, `CAR`, `WRITE`)
//! - **Special Forms**: receive their argument expressions unevaluated together with the
//!   current evaluation depth (e.g. `IF`, `LET`, `SETF`, `REWRITE`)
//!
//! ## Checked mode
//!
//! Argument counts are validated against each operation's [`Arity`] before it runs, and
//! builtins reject arguments of the wrong type. Both checks are skipped when the
//! interpreter runs with `checked` disabled: missing arguments then read as `NIL`, and
//! a type violation yields `NIL` instead of an error.
//!
//! ## Adding New Operations
//!
//! 1. **Implement the function** with the signature
//!    `fn(&[Value], &mut Interpreter) -> Result<Value, Error>`, or the special form
//!    signature that additionally receives the evaluation depth
//! 2. **Add it to BUILTIN_OPS** with its upper-case name and arity
//! 3. **Add tests** covering edge cases and error conditions

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::Error;
use crate::ast::{Datum, Value};
use crate::evaluator::Interpreter;
use crate::evaluator::special_forms::{
    eval_and, eval_apply, eval_backquote, eval_comma, eval_defconstant, eval_defparameter,
    eval_defun, eval_do, eval_dolist, eval_funcall, eval_function, eval_if, eval_lambda,
    eval_let, eval_or, eval_progn, eval_quote, eval_setf,
};
use crate::numeric::{self, ArithOp, Number};
use crate::rewrite::{builtin_append_tilde, eval_rewrite};

/// Number of arguments an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive bounds
    Range(usize, usize),
    Any,
}

impl Arity {
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        let ok = match *self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
            Arity::Range(lo, hi) => (lo..=hi).contains(&got),
            Arity::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::arity_error(*self, got))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(lo, hi) => write!(f, "{lo} to {hi}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// Signature of a builtin that receives evaluated arguments
pub type BuiltinFn = fn(&[Value], &mut Interpreter) -> Result<Value, Error>;

/// Signature of a special form: unevaluated arguments and the current evaluation depth
pub type SpecialFormFn = fn(&[Value], &mut Interpreter, usize) -> Result<Value, Error>;

/// Represents the implementation of a built-in expression (function or special form)
#[derive(Clone, Copy)]
pub enum OpKind {
    /// Regular function that takes evaluated arguments and returns a value
    Function(BuiltinFn),
    /// Special form that controls evaluation of its own arguments
    SpecialForm(SpecialFormFn),
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::SpecialForm(_) => write!(f, "SpecialForm(<fn>)"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// Upper-case head symbol this operation is dispatched on
    pub name: &'static str,
    /// The implementation of this operation (function or special form)
    pub op_kind: OpKind,
    /// Expected number of arguments
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl BuiltinOp {
    /// Check if this operation is a special form
    pub fn is_special_form(&self) -> bool {
        matches!(self.op_kind, OpKind::SpecialForm(_))
    }

    /// Check if the given number of arguments is valid for this operation
    pub(crate) fn validate_arity(&self, arg_count: usize) -> Result<(), Error> {
        self.arity
            .validate(arg_count)
            .map_err(|_| Error::arity_error_with_expr(self.arity, arg_count, self.name.to_owned()))
    }
}

//
// Argument helpers
//

/// Argument at `idx`, or `NIL` when it is missing (only reachable with checks off).
pub(crate) fn arg(args: &[Value], idx: usize) -> Value {
    args.get(idx).cloned().unwrap_or_else(Value::nil)
}

/// Report a type violation, or degrade to `NIL` when checks are off.
pub(crate) fn type_violation(interp: &Interpreter, msg: impl Into<String>) -> Result<Value, Error> {
    if interp.is_checked() {
        Err(Error::TypeError(msg.into()))
    } else {
        Ok(Value::nil())
    }
}

fn as_index(value: &Value) -> Option<usize> {
    value.as_int().and_then(|n| usize::try_from(n).ok())
}

//
// Builtin Function Implementations
//

fn numbers_of(args: &[Value]) -> Result<Vec<Number>, Value> {
    args.iter()
        .map(|v| Number::from_value(v).ok_or_else(|| v.clone()))
        .collect()
}

// Macro to generate the arithmetic folds
macro_rules! arithmetic_op {
    ($name:ident, $op:expr, $op_str:literal) => {
        fn $name(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
            match numbers_of(args) {
                Ok(operands) => Ok(numeric::fold($op, &operands)?.into_value()),
                Err(bad) => type_violation(
                    interp,
                    format!("{bad} is not a number (in {})", $op_str),
                ),
            }
        }
    };
}

arithmetic_op!(builtin_add, ArithOp::Add, "+");
arithmetic_op!(builtin_sub, ArithOp::Sub, "-");
arithmetic_op!(builtin_mul, ArithOp::Mul, "*");
arithmetic_op!(builtin_div, ArithOp::Div, "/");

// Macro to generate the integer comparison chains
macro_rules! integer_comparison {
    ($name:ident, $op:tt) => {
        fn $name(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
            // All arguments are already evaluated; the chain only decides the result.
            let mut holds = true;
            let mut prev: Option<i64> = None;
            for value in args {
                let Some(current) = value.as_int() else {
                    return type_violation(interp, format!("{value} is not a number"));
                };
                if let Some(p) = prev
                    && !(p $op current)
                {
                    holds = false;
                }
                prev = Some(current);
            }
            Ok(Value::bool(holds))
        }
    };
}

integer_comparison!(builtin_gt, >);
integer_comparison!(builtin_ge, >=);
integer_comparison!(builtin_lt, <);
integer_comparison!(builtin_le, <=);

// Macro to generate the one-argument trigonometric functions
macro_rules! float_function {
    ($name:ident, $f:ident) => {
        fn $name(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
            match Number::from_value(&arg(args, 0)) {
                Some(n) => Ok(Value::float(n.to_f64().$f())),
                None => type_violation(interp, "expected a number"),
            }
        }
    };
}

float_function!(builtin_sin, sin);
float_function!(builtin_cos, cos);
float_function!(builtin_tan, tan);

fn builtin_car(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let list = arg(args, 0);
    match list.as_cons() {
        Some((car, _)) => Ok(car),
        None if list.is_nil() => Ok(list),
        None => type_violation(interp, "CAR expects a list"),
    }
}

fn builtin_cdr(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let list = arg(args, 0);
    match list.as_cons() {
        Some((_, cdr)) => Ok(cdr),
        None if list.is_nil() => Ok(list),
        None => type_violation(interp, "CDR expects a list"),
    }
}

fn builtin_third(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(arg(args, 0).nth(2))
}

fn builtin_cons(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::cons(arg(args, 0), arg(args, 1)))
}

fn builtin_list(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::list(args.iter().cloned()))
}

fn builtin_length(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let list = arg(args, 0);
    if !list.is_list() {
        return type_violation(interp, "LENGTH expects a list");
    }
    let len = i64::try_from(list.list_len())
        .map_err(|_| Error::EvalError("list too long".into()))?;
    Ok(Value::int(len))
}

fn builtin_nth(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    match as_index(&arg(args, 0)) {
        Some(idx) => Ok(arg(args, 1).nth(idx)),
        None => type_violation(interp, "expected a non-negative integer index"),
    }
}

fn builtin_nthcdr(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    match as_index(&arg(args, 0)) {
        Some(idx) => Ok(arg(args, 1).nthcdr(idx)),
        None => type_violation(interp, "expected a non-negative integer index"),
    }
}

fn builtin_append(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let mut items = Vec::new();
    for list in args {
        if !list.is_list() {
            return type_violation(interp, format!("APPEND expects lists, got {list}"));
        }
        items.extend(list.iter());
    }
    Ok(Value::list(items))
}

fn builtin_copy_list(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let list = arg(args, 0);
    if !list.is_list() {
        return type_violation(interp, "COPY-LIST expects a list");
    }
    Ok(list.copy_list())
}

fn builtin_member(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let needle = arg(args, 0);
    let haystack = arg(args, 1);
    if !haystack.is_list() {
        return type_violation(interp, "MEMBER expects a list");
    }
    let mut tail = haystack;
    while let Some((car, cdr)) = tail.as_cons() {
        if car == needle {
            return Ok(tail);
        }
        tail = cdr;
    }
    Ok(Value::nil())
}

fn builtin_remove(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let needle = arg(args, 0);
    let haystack = arg(args, 1);
    if !haystack.is_list() {
        return type_violation(interp, "REMOVE expects a list");
    }
    // Conses are never removed, only atoms equal to the needle.
    let kept = haystack
        .iter()
        .filter(|element| element.is_cons() || *element != needle);
    Ok(Value::list(kept))
}

/// Replace every atom of `tree` equal to `old` by `new`. Returns fresh conses.
fn subst(new: &Value, old: &Value, tree: &Value) -> Value {
    if old.is_cons() {
        return tree.clone();
    }
    if !tree.is_cons() {
        return if tree == old { new.clone() } else { tree.clone() };
    }
    let mut items = Vec::new();
    let mut cur = tree.clone();
    while let Some((car, cdr)) = cur.as_cons() {
        items.push(subst(new, old, &car));
        cur = cdr;
    }
    Value::list_with_tail(items, subst(new, old, &cur))
}

fn builtin_substitute(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(subst(&arg(args, 0), &arg(args, 1), &arg(args, 2)))
}

fn builtin_equalp(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::bool(arg(args, 0) == arg(args, 1)))
}

fn builtin_not(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::bool(arg(args, 0).is_nil()))
}

fn builtin_atom(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::bool(!arg(args, 0).is_cons()))
}

fn builtin_consp(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::bool(arg(args, 0).is_cons()))
}

fn builtin_listp(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::bool(arg(args, 0).is_list()))
}

fn builtin_numberp(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    Ok(Value::bool(arg(args, 0).is_number()))
}

fn builtin_typep(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let value = arg(args, 0);
    let Some(type_name) = arg(args, 1).as_symbol() else {
        return type_violation(interp, "expected ID as second param");
    };
    let datum = value.datum();
    let matches = match type_name.as_str() {
        "INTEGER" => matches!(datum, Datum::Int(_)),
        "FLOAT" => matches!(datum, Datum::Float(_)),
        "RATIO" => matches!(datum, Datum::Ratio(_)),
        "NUMBER" => value.is_number(),
        "STRING" => matches!(datum, Datum::Str(_)),
        "SYMBOL" => matches!(datum, Datum::Symbol(_)),
        "CHARACTER" => matches!(datum, Datum::Char(_)),
        "CONS" => value.is_cons(),
        "LIST" => value.is_list(),
        "NULL" => value.is_nil(),
        other => return type_violation(interp, format!("unexpected TYPE {other}")),
    };
    Ok(Value::bool(matches))
}

fn builtin_char(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let Datum::Str(s) = arg(args, 0).datum() else {
        return type_violation(interp, "Expected a string");
    };
    let Some(idx) = arg(args, 1).as_int() else {
        return type_violation(interp, "Expected an integer index");
    };
    match usize::try_from(idx).ok().and_then(|i| s.chars().nth(i)) {
        Some(c) => Ok(Value::character(c)),
        None => type_violation(interp, "invalid string index"),
    }
}

fn builtin_write(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let value = arg(args, 0);
    interp.write_output(&value.to_string());
    Ok(value)
}

fn builtin_terpri(_args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    interp.write_output("\n");
    Ok(Value::nil())
}

fn builtin_assert(args: &[Value], interp: &mut Interpreter) -> Result<Value, Error> {
    let message = match args.get(1).map(Value::datum) {
        None => String::new(),
        Some(Datum::Str(s)) => s,
        Some(_) => return type_violation(interp, "expected STR for error message"),
    };
    if arg(args, 0).is_nil() {
        let message = if message.is_empty() {
            "(no message)".to_owned()
        } else {
            message
        };
        return Err(Error::AssertionFailed(message));
    }
    Ok(Value::nil())
}

/// Global registry of all built-in operations.
///
/// A single contiguous table keeps the whole surface auditable in one place; the
/// name index below is built once on first use.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    use Arity::{Any, AtLeast, Exact, Range};
    use OpKind::{Function, SpecialForm};

    let op = |name, op_kind, arity| BuiltinOp {
        name,
        op_kind,
        arity,
    };

    vec![
        // Arithmetic operations
        op("+", Function(builtin_add), Any),
        op("-", Function(builtin_sub), AtLeast(1)),
        op("*", Function(builtin_mul), Any),
        op("/", Function(builtin_div), AtLeast(1)),
        op("SIN", Function(builtin_sin), Exact(1)),
        op("COS", Function(builtin_cos), Exact(1)),
        op("TAN", Function(builtin_tan), Exact(1)),
        // Comparison operations
        op(">", Function(builtin_gt), AtLeast(1)),
        op(">=", Function(builtin_ge), AtLeast(1)),
        op("<", Function(builtin_lt), AtLeast(1)),
        op("<=", Function(builtin_le), AtLeast(1)),
        op("EQUALP", Function(builtin_equalp), Exact(2)),
        // Predicates
        op("NOT", Function(builtin_not), Exact(1)),
        op("NULL", Function(builtin_not), Exact(1)),
        op("ATOM", Function(builtin_atom), Exact(1)),
        op("CONSP", Function(builtin_consp), Exact(1)),
        op("LISTP", Function(builtin_listp), Exact(1)),
        op("NUMBERP", Function(builtin_numberp), Exact(1)),
        op("TYPEP", Function(builtin_typep), Exact(2)),
        // List operations
        op("CAR", Function(builtin_car), Exact(1)),
        op("CDR", Function(builtin_cdr), Exact(1)),
        op("THIRD", Function(builtin_third), Exact(1)),
        op("CONS", Function(builtin_cons), Exact(2)),
        op("LIST", Function(builtin_list), Any),
        op("LENGTH", Function(builtin_length), Exact(1)),
        op("NTH", Function(builtin_nth), Exact(2)),
        op("NTHCDR", Function(builtin_nthcdr), Exact(2)),
        op("APPEND", Function(builtin_append), Any),
        op("APPEND~", Function(builtin_append_tilde), Exact(1)),
        op("COPY-LIST", Function(builtin_copy_list), Exact(1)),
        op("MEMBER", Function(builtin_member), Exact(2)),
        op("REMOVE", Function(builtin_remove), Exact(2)),
        op("SUBSTITUTE", Function(builtin_substitute), Exact(3)),
        op("SUBST", Function(builtin_substitute), Exact(3)),
        // Strings and output
        op("CHAR", Function(builtin_char), Exact(2)),
        op("WRITE", Function(builtin_write), Exact(1)),
        op("TERPRI", Function(builtin_terpri), Exact(0)),
        op("ASSERT", Function(builtin_assert), Range(1, 2)),
        // Special forms
        op("QUOTE", SpecialForm(eval_quote), Exact(1)),
        op("IF", SpecialForm(eval_if), Range(2, 3)),
        op("AND", SpecialForm(eval_and), Any),
        op("OR", SpecialForm(eval_or), Any),
        op("PROGN", SpecialForm(eval_progn), Any),
        op("LET", SpecialForm(eval_let), AtLeast(1)),
        op("DO", SpecialForm(eval_do), AtLeast(2)),
        op("DOLIST", SpecialForm(eval_dolist), AtLeast(1)),
        op("DEFUN", SpecialForm(eval_defun), AtLeast(2)),
        op("LAMBDA", SpecialForm(eval_lambda), AtLeast(1)),
        op("FUNCTION", SpecialForm(eval_function), Exact(1)),
        op("FUNCALL", SpecialForm(eval_funcall), AtLeast(1)),
        op("APPLY", SpecialForm(eval_apply), Exact(2)),
        op("SETF", SpecialForm(eval_setf), Any),
        op("DEFCONSTANT", SpecialForm(eval_defconstant), Exact(2)),
        op("DEFPARAMETER", SpecialForm(eval_defparameter), Exact(2)),
        op("BACKQUOTE", SpecialForm(eval_backquote), Exact(1)),
        op("COMMA", SpecialForm(eval_comma), Any),
        op("REWRITE", SpecialForm(eval_rewrite), Exact(2)),
    ]
});

/// Lazy static map from name to BuiltinOp (private - use find_builtin_op)
static BUILTIN_INDEX: LazyLock<HashMap<&'static str, &'static BuiltinOp>> =
    LazyLock::new(|| {
        let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
        ops.iter().map(|op| (op.name, op)).collect()
    });

/// Get all builtin operations
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its upper-case name
pub fn find_builtin_op(name: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_INDEX.get(name).copied()
}
