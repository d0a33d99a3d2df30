//! Lowering of `(TRS input lhs -> rhs ...)` to a `REWRITE` call.
//!
//! `(TRS input s1 -> t1 s2 -> t2 ...)` becomes
//! `(REWRITE input (QUOTE ((BACKQUOTE s1') c1 (BACKQUOTE t1') ...)))`:
//!
//! - in a left-hand side, an all-caps identifier `X` becomes the pattern variable `$X`,
//!   `X*` the sequence variable `$$X`, and `X:number` adds `(NUMBERP X)` to the rule's
//!   condition
//! - in a right-hand side, a bound variable `X` becomes `(COMMA X)`, `[e]` evaluates `e`,
//!   and `~ e` splices the list `e` into the surrounding list
//! - all other identifiers are folded to upper case

use std::collections::HashSet;

use crate::ast::{Datum, Value};

use super::{symbol_or_constant, unary_call};

/// Names that keep their meaning inside rules
const RESERVED: [&str; 3] = ["QUOTE", "BACKQUOTE", "COMMA"];

fn is_variable(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_uppercase())
        && name == name.to_uppercase()
        && !RESERVED.contains(&name)
}

/// Rebuild a (possibly dotted) list, mapping every element and the tail.
fn map_list(
    list: &Value,
    mut f: impl FnMut(&Value) -> Result<Value, String>,
) -> Result<Value, String> {
    let mut items = Vec::new();
    let mut cur = list.clone();
    while let Some((car, cdr)) = cur.as_cons() {
        let item = f(&car)?;
        items.push((item, cur.pos()));
        cur = cdr;
    }
    let tail = f(&cur)?;
    Ok(items.into_iter().rev().fold(tail, |rest, (item, pos)| {
        Value::with_pos(Datum::Cons(item, rest), pos)
    }))
}

/// Copy of `value` with every identifier folded to upper case
fn fold_case(value: &Value) -> Result<Value, String> {
    match value.datum() {
        Datum::Symbol(name) => Ok(with_pos_of(value, symbol_or_constant(name.to_uppercase()))),
        Datum::Cons(..) => map_list(value, fold_case),
        _ => Ok(value.shallow_copy()),
    }
}

fn with_pos_of(original: &Value, value: Value) -> Value {
    value.set_pos(original.pos());
    value
}

/// A left-hand side and what it binds.
#[derive(Default)]
struct PatternScope {
    variables: HashSet<String>,
    /// `(NUMBERP X)` style checks, in order of appearance
    checks: Vec<Value>,
}

impl PatternScope {
    fn lower(&mut self, value: &Value) -> Result<Value, String> {
        let name = match value.datum() {
            Datum::Symbol(name) => name,
            Datum::Cons(..) => return map_list(value, |v| self.lower(v)),
            _ => return Ok(value.shallow_copy()),
        };

        let name = match name.split_once(':') {
            Some((var, ty)) => {
                let check = match ty.to_ascii_lowercase().as_str() {
                    "number" => "NUMBERP",
                    _ => return Err(format!("condition has unknown type {ty}")),
                };
                let checked = var.trim_end_matches('*').to_uppercase();
                self.checks
                    .push(Value::list([Value::symbol(check), Value::symbol(checked)]));
                var.to_owned()
            }
            None => name.clone(),
        };

        let lowered = match name.strip_suffix('*') {
            Some(var) if is_variable(var) => {
                self.variables.insert(var.to_owned());
                Value::symbol(format!("$${var}"))
            }
            _ if is_variable(&name) => {
                self.variables.insert(name.clone());
                Value::symbol(format!("${name}"))
            }
            _ => symbol_or_constant(name.to_uppercase()),
        };
        Ok(with_pos_of(value, lowered))
    }

    /// `T`, a single check, or an `AND` of all of them
    fn condition(&self) -> Value {
        match self.checks.as_slice() {
            [] => Value::t(),
            [check] => check.clone(),
            checks => Value::list(std::iter::once(Value::symbol("AND")).chain(checks.iter().cloned())),
        }
    }

    fn lower_template(&self, value: &Value, in_comma: bool) -> Result<Value, String> {
        match value.datum() {
            Datum::Symbol(name) => {
                let name = name.to_uppercase();
                if !in_comma && self.variables.contains(&name) {
                    let var = Value::with_pos(Datum::Symbol(name), value.pos());
                    return Ok(unary_call("COMMA", var));
                }
                Ok(with_pos_of(value, symbol_or_constant(name)))
            }
            Datum::Cons(car, _) => {
                let in_comma = in_comma || car.is_symbol("COMMA");
                let mut items = Vec::new();
                let mut cur = value.clone();
                while let Some((item, rest)) = cur.as_cons() {
                    cur = rest;
                    if !in_comma && item.as_symbol().as_deref() == Some("~") {
                        let Some((spliced, rest)) = cur.as_cons() else {
                            return Err("expected an expression after '~' while parsing TRS".into());
                        };
                        cur = rest;
                        let spliced = self.lower_template(&spliced, in_comma)?;
                        items.push(unary_call("~", spliced));
                        continue;
                    }
                    items.push(self.lower_template(&item, in_comma)?);
                }
                let tail = self.lower_template(&cur, in_comma)?;
                Ok(Value::list_with_tail(items, tail))
            }
            _ => Ok(value.shallow_copy()),
        }
    }
}

/// Lower the elements of a TRS form, the leading `TRS` symbol included.
pub(super) fn lower(items: &[Value]) -> Result<Value, String> {
    let [head, input, rules @ ..] = items else {
        return Err("TRS has too few args".into());
    };
    let mut rules = rules;

    let mut lowered = Vec::new();
    while let [lhs, rest @ ..] = rules {
        let Some((arrow, rest)) = rest.split_first() else {
            return Err("expected '->' while parsing TRS".into());
        };
        if !arrow.is_symbol("->") {
            return Err("expected '->' while parsing TRS".into());
        }
        let Some((rhs, rest)) = rest.split_first() else {
            return Err("expected a right-hand side after '->' while parsing TRS".into());
        };

        let mut scope = PatternScope::default();
        let pattern = scope.lower(lhs)?;
        let template = scope.lower_template(rhs, false)?;
        lowered.push(unary_call("BACKQUOTE", pattern));
        lowered.push(scope.condition());
        lowered.push(unary_call("BACKQUOTE", template));
        rules = rest;
    }

    let rewrite = Value::with_pos(Datum::Symbol("REWRITE".into()), head.pos());
    Ok(Value::list([
        rewrite,
        fold_case(input)?,
        unary_call("QUOTE", Value::list(lowered)),
    ]))
}
