//! JSON conversion of values and of run results.
//!
//! `NIL` is `null`, `T` is `true`, integers and floats are numbers, strings are strings and
//! proper lists are arrays. Everything else is a single-key object:
//! `{"symbol": "X"}`, `{"ratio": [1, 3]}`, `{"char": "c"}`, `{"cons": [car, cdr]}`,
//! `{"global": "X"}` and, one way only, `{"function": "NAME"}`.

use serde_json::{Map, json};

use crate::ast::{Datum, Value};
use crate::evaluator::DebugSnapshot;
use crate::numeric::Ratio;
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

fn tagged(tag: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = Map::new();
    map.insert(tag.to_owned(), value);
    serde_json::Value::Object(map)
}

/// Convert a value to JSON. Fails on non-finite floats.
pub fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    Ok(match value.datum() {
        Datum::Nil => serde_json::Value::Null,
        Datum::True => serde_json::Value::Bool(true),
        Datum::Int(n) => json!(n),
        Datum::Float(x) => serde_json::Number::from_f64(x)
            .map(serde_json::Value::Number)
            .ok_or_else(|| Error::EvalError(format!("cannot represent {x} in JSON")))?,
        Datum::Ratio(r) => tagged("ratio", json!([r.numerator(), r.denominator()])),
        Datum::Char(c) => tagged("char", json!(c.to_string())),
        Datum::Symbol(s) => tagged("symbol", json!(s)),
        Datum::Str(s) => json!(s),
        Datum::GlobalRef(s) => tagged("global", json!(s)),
        Datum::Closure(c) => tagged("function", json!(c.name)),
        Datum::Cons(car, cdr) => {
            if value.last_cons().cdr().is_some_and(|tail| tail.is_nil()) {
                let items = value.iter().map(|v| to_json(&v)).collect::<Result<_, _>>()?;
                serde_json::Value::Array(items)
            } else {
                tagged("cons", json!([to_json(&car)?, to_json(&cdr)?]))
            }
        }
    })
}

fn json_error(message: impl Into<String>) -> Error {
    Error::ParseError(ParseError::from_message(ParseErrorKind::InvalidSyntax, message))
}

/// Build a value from JSON produced by [`to_json`] or written by hand.
///
/// `false` reads as `NIL`. Functions cannot be rebuilt.
pub fn from_json(json: &serde_json::Value) -> Result<Value, Error> {
    from_json_with_depth(json, 0)
}

fn from_json_with_depth(json: &serde_json::Value, depth: usize) -> Result<Value, Error> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(Error::ParseError(ParseError::from_message(
            ParseErrorKind::TooDeeplyNested,
            format!("JSON value too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
        )));
    }
    match json {
        serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(Value::nil()),
        serde_json::Value::Bool(true) => Ok(Value::t()),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(Value::int(i)),
            (None, Some(x)) => Ok(Value::float(x)),
            (None, None) => Err(Error::ParseError(ParseError::from_message(
                ParseErrorKind::ImplementationLimit,
                format!("number out of range: {n}"),
            ))),
        },
        serde_json::Value::String(s) => Ok(Value::string(s.as_str())),
        serde_json::Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| from_json_with_depth(item, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::list(items))
        }
        serde_json::Value::Object(map) => {
            let mut entries = map.iter();
            let (Some((tag, payload)), None) = (entries.next(), entries.next()) else {
                return Err(json_error("expected an object with exactly one key"));
            };
            from_tagged(tag, payload, depth)
        }
    }
}

fn from_tagged(tag: &str, payload: &serde_json::Value, depth: usize) -> Result<Value, Error> {
    match (tag, payload) {
        ("symbol", serde_json::Value::String(s)) => Ok(Value::symbol(s.as_str())),
        ("global", serde_json::Value::String(s)) => Ok(Value::global(s.as_str())),
        ("char", serde_json::Value::String(s)) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::character(c)),
                _ => Err(json_error(format!("expected a single character, got {s:?}"))),
            }
        }
        ("ratio", serde_json::Value::Array(parts)) => {
            let [numerator, denominator] = parts.as_slice() else {
                return Err(json_error("ratio expects [numerator, denominator]"));
            };
            let (Some(n), Some(d)) = (numerator.as_i64(), denominator.as_i64()) else {
                return Err(json_error("ratio parts must be integers"));
            };
            Ratio::new(n, d).map(Value::ratio)
        }
        ("cons", serde_json::Value::Array(parts)) => {
            let [car, cdr] = parts.as_slice() else {
                return Err(json_error("cons expects [car, cdr]"));
            };
            Ok(Value::cons(
                from_json_with_depth(car, depth + 1)?,
                from_json_with_depth(cdr, depth + 1)?,
            ))
        }
        ("function", _) => Err(json_error("functions cannot be read from JSON")),
        _ => Err(json_error(format!("unknown tagged value {tag}"))),
    }
}

/// The message a host UI receives after a run.
///
/// Results are rendered as text, the way the REPL prints them.
pub fn run_report(
    results: &Result<Vec<Value>, Error>,
    output: &str,
    snapshots: &[DebugSnapshot],
) -> serde_json::Value {
    let debug: Vec<serde_json::Value> = snapshots
        .iter()
        .map(|snapshot| {
            json!({
                "line": snapshot.line,
                "col": snapshot.col,
                "variables": snapshot.variables,
            })
        })
        .collect();
    match results {
        Ok(values) => json!({
            "ok": true,
            "results": values.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "error": null,
            "output": output,
            "debug": debug,
        }),
        Err(err) => json!({
            "ok": false,
            "results": [],
            "error": err.to_string(),
            "output": output,
            "debug": debug,
        }),
    }
}
