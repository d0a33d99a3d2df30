//! Special forms: operations that receive their arguments unevaluated and decide
//! themselves what to evaluate, in which scope and how often.

use tracing::warn;

use super::Interpreter;
use crate::Error;
use crate::ast::{Closure, Datum, Value};
use crate::builtinops::{arg, type_violation};

fn not_well_structured(form: &str) -> Error {
    Error::EvalError(format!("{form} is not well structured"))
}

fn expect_id(value: &Value) -> Result<String, Error> {
    value
        .as_symbol()
        .ok_or_else(|| Error::EvalError(format!("expected ID, got {value}")))
}

fn is_comma_form(value: &Value) -> bool {
    value.car().is_some_and(|head| head.is_symbol("COMMA"))
}

/// A closure value, or the user function named by a symbol
fn resolve_function(interp: &Interpreter, value: &Value) -> Option<Closure> {
    value.as_closure().or_else(|| {
        value
            .as_symbol()
            .and_then(|name| interp.function(&name).cloned())
    })
}

pub(crate) fn eval_quote(
    args: &[Value],
    _interp: &mut Interpreter,
    _depth: usize,
) -> Result<Value, Error> {
    // Callers may mutate the result, the literal in the program must stay intact
    Ok(arg(args, 0).deep_copy())
}

pub(crate) fn eval_if(args: &[Value], interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    let condition = interp.eval_with_depth_tracking(&arg(args, 0), depth + 1)?;
    let branch = if condition.is_truthy() {
        arg(args, 1)
    } else {
        arg(args, 2)
    };
    interp.eval_with_depth_tracking(&branch, depth + 1)
}

pub(crate) fn eval_and(args: &[Value], interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    let mut result = Value::t();
    for expr in args {
        result = interp.eval_with_depth_tracking(expr, depth + 1)?;
        if result.is_nil() {
            break;
        }
    }
    Ok(result)
}

pub(crate) fn eval_or(args: &[Value], interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    for expr in args {
        let value = interp.eval_with_depth_tracking(expr, depth + 1)?;
        if value.is_truthy() {
            return Ok(value);
        }
    }
    Ok(Value::nil())
}

pub(crate) fn eval_progn(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    interp.eval_sequence(args, depth)
}

/// `(LET ((id init)*) body*)`. All initialisers are evaluated in the enclosing scope
/// before the new frame is pushed.
pub(crate) fn eval_let(args: &[Value], interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    let [bindings, body @ ..] = args else {
        return Ok(Value::nil());
    };
    if !bindings.is_list() {
        return Err(not_well_structured("LET"));
    }

    let mut frame = Vec::new();
    for binding in bindings.iter() {
        let parts = binding.to_vec();
        let [name, init] = parts.as_slice() else {
            return Err(Error::EvalError(format!("expected (id init), got {binding}")));
        };
        let name = expect_id(name)?;
        let value = interp.eval_with_depth_tracking(init, depth + 1)?;
        frame.push((name, value));
    }

    interp.with_scope(frame, |interp| interp.eval_sequence(body, depth))
}

/// `(DO ((id start update)*) (test result*) body*)`. Checked mode rejects an empty
/// variable list.
pub(crate) fn eval_do(args: &[Value], interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    let [specs, end_clause, body @ ..] = args else {
        return Err(not_well_structured("DO"));
    };
    if !specs.is_list() || !end_clause.is_cons() || (interp.is_checked() && specs.is_nil()) {
        return Err(not_well_structured("DO"));
    }

    let mut vars = Vec::new();
    for spec in specs.iter() {
        let parts = spec.to_vec();
        let name = match parts.first() {
            Some(name) => expect_id(name)?,
            None => expect_id(&spec)?,
        };
        vars.push((name, parts.get(1).cloned(), parts.get(2).cloned()));
    }
    let test = end_clause.nth(0);
    let results = end_clause.cdr().map(|rest| rest.to_vec()).unwrap_or_default();

    interp.with_scope(Vec::new(), |interp| {
        // Start values are bound one by one, each sees the previous ones
        for (name, start, _) in &vars {
            let value = match start {
                Some(expr) => interp.eval_with_depth_tracking(expr, depth + 1)?,
                None => Value::nil(),
            };
            interp.environment_mut().define(name.clone(), &value);
        }

        loop {
            if interp
                .eval_with_depth_tracking(&test, depth + 1)?
                .is_truthy()
            {
                return interp.eval_sequence(&results, depth);
            }
            interp.eval_sequence(body, depth)?;

            // Each variable is rebound as soon as its update is evaluated. A missing
            // update evaluates to NIL.
            for (name, _, update) in &vars {
                let value = match update {
                    Some(expr) => interp.eval_with_depth_tracking(expr, depth + 1)?,
                    None => Value::nil(),
                };
                interp.environment_mut().define(name.clone(), &value);
            }
        }
    })
}

/// `(DOLIST (id list) body*)`, always `NIL`
pub(crate) fn eval_dolist(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    let [spec, body @ ..] = args else {
        return Err(not_well_structured("DOLIST"));
    };
    let name = expect_id(&spec.nth(0))?;
    let list = interp.eval_with_depth_tracking(&spec.nth(1), depth + 1)?;
    if !list.is_list() {
        type_violation(interp, format!("DOLIST expects a list, got {list}"))?;
        return Ok(Value::nil());
    }

    interp.with_scope(Vec::new(), |interp| {
        for element in list.iter() {
            interp.environment_mut().define(name.clone(), &element);
            interp.eval_sequence(body, depth)?;
        }
        Ok(Value::nil())
    })
}

/// `(DEFUN name (params) body*)` registers a global function.
pub(crate) fn eval_defun(
    args: &[Value],
    interp: &mut Interpreter,
    _depth: usize,
) -> Result<Value, Error> {
    let [name, params, body @ ..] = args else {
        return Err(not_well_structured("DEFUN"));
    };
    let (Some(name), true) = (name.as_symbol(), params.is_list()) else {
        return Err(not_well_structured("DEFUN"));
    };
    let closure = Closure {
        name: name.clone(),
        params: params.clone(),
        body: Value::list(body.iter().cloned()),
    };
    interp.define_function(name, closure.clone());
    Ok(Value::new(Datum::Closure(closure)))
}

pub(crate) fn eval_lambda(
    args: &[Value],
    _interp: &mut Interpreter,
    _depth: usize,
) -> Result<Value, Error> {
    let [params, body @ ..] = args else {
        return Err(not_well_structured("LAMBDA"));
    };
    if !params.is_list() {
        return Err(not_well_structured("LAMBDA"));
    }
    Ok(Value::closure(
        "LAMBDA",
        params.clone(),
        Value::list(body.iter().cloned()),
    ))
}

/// `(FUNCTION name)` or `(FUNCTION (LAMBDA ...))`
pub(crate) fn eval_function(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    let target = arg(args, 0);
    if target.car().is_some_and(|head| head.is_symbol("LAMBDA")) {
        return interp.eval_with_depth_tracking(&target, depth + 1);
    }
    let name = expect_id(&target)?;
    match interp.function(&name) {
        Some(closure) => Ok(Value::new(Datum::Closure(closure.clone()))),
        None => Err(Error::EvalError(format!("undefined function {name}"))),
    }
}

/// `(FUNCALL fn arg*)`
pub(crate) fn eval_funcall(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    let [func, arg_exprs @ ..] = args else {
        return Ok(Value::nil());
    };
    let func = interp.eval_with_depth_tracking(func, depth + 1)?;
    match resolve_function(interp, &func) {
        Some(closure) => interp.call(&closure, arg_exprs, depth),
        None => type_violation(interp, format!("expected a function, got {func}")),
    }
}

/// `(APPLY fn list)`. The elements of the evaluated list are evaluated once more as
/// argument expressions.
pub(crate) fn eval_apply(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    let func = interp.eval_with_depth_tracking(&arg(args, 0), depth + 1)?;
    let Some(closure) = resolve_function(interp, &func) else {
        return type_violation(interp, format!("expected a function, got {func}"));
    };
    let list = interp.eval_with_depth_tracking(&arg(args, 1), depth + 1)?;
    if !list.is_list() {
        return type_violation(interp, format!("APPLY expects a list, got {list}"));
    }
    interp.call(&closure, &list.to_vec(), depth)
}

/// `(SETF place value ...)` overwrites each place in place and returns the last value.
pub(crate) fn eval_setf(args: &[Value], interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::EvalError(
            "SETF: expected an even number of arguments".into(),
        ));
    }

    let mut result = Value::nil();
    for pair in args.chunks_exact(2) {
        let [place_expr, value_expr] = pair else {
            continue;
        };
        let place = interp.eval_place(place_expr, depth + 1)?;
        let value = interp.eval_with_depth_tracking(value_expr, depth + 1)?;
        if let Some(name) = place_expr.as_symbol()
            && interp.environment().is_constant(&name)
        {
            warn!(name = %name, value = %value, "SETF on a constant");
        }
        place.set(&value);
        result = value;
    }
    Ok(result)
}

fn define_global(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
    constant: bool,
) -> Result<Value, Error> {
    let name = expect_id(&arg(args, 0))?;
    let value = interp.eval_with_depth_tracking(&arg(args, 1), depth + 1)?;
    if interp.environment().is_constant(&name) {
        warn!(name = %name, value = %value, "redefinition of a constant");
    }
    let env = interp.environment_mut();
    env.define_global(name.clone(), &value);
    if constant {
        env.mark_constant(&name);
    }
    Ok(Value::global(name))
}

pub(crate) fn eval_defconstant(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    define_global(args, interp, depth, true)
}

pub(crate) fn eval_defparameter(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    define_global(args, interp, depth, false)
}

/// `(BACKQUOTE template)`: a copy of `template` with every `(COMMA e)` replaced by the
/// value of `e`.
pub(crate) fn eval_backquote(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    expand_backquote(&arg(args, 0), interp, depth)
}

fn expand_backquote(template: &Value, interp: &mut Interpreter, depth: usize) -> Result<Value, Error> {
    if is_comma_form(template) {
        return interp.eval_with_depth_tracking(&template.nth(1), depth + 1);
    }
    if !template.is_cons() {
        return Ok(template.shallow_copy());
    }

    let mut items = Vec::new();
    let mut cur = template.clone();
    let tail = loop {
        // `(a . ,b)` reads as (a COMMA b): a comma form can also sit in the cdr
        if is_comma_form(&cur) {
            break interp.eval_with_depth_tracking(&cur.nth(1), depth + 1)?;
        }
        match cur.as_cons() {
            Some((car, cdr)) => {
                items.push(expand_backquote(&car, interp, depth)?);
                cur = cdr;
            }
            None => break cur.shallow_copy(),
        }
    };
    let expanded = Value::list_with_tail(items, tail);
    expanded.set_pos(template.pos());
    Ok(expanded)
}

pub(crate) fn eval_comma(
    _args: &[Value],
    _interp: &mut Interpreter,
    _depth: usize,
) -> Result<Value, Error> {
    Err(Error::EvalError(
        "COMMA NOT ALLOWED OUTSIDE OF BACKQUOTE".into(),
    ))
}
