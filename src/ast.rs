//! This module defines the value model shared by the reader, the evaluator and the
//! rewrite engine. Code and data are the same thing: every S-expression is a tree of
//! [`Value`] handles, each pointing at a mutable node holding a [`Datum`] and an
//! optional source position.
//!
//! Handles are reference counted and share their node. Cloning a `Value` clones the
//! handle, not the node; [`Value::set`] overwrites a node in place so that every holder
//! of the handle observes the change. This is how `SETF` updates places and how the
//! rewrite engine patches terms. Fresh nodes are created with [`Value::shallow_copy`]
//! and [`Value::deep_copy`].
//!
//! Ergonomic helpers such as [`val`], [`sym`], and [`nil`] are provided for building
//! trees in code and tests, together with `From` conversions for Rust literals, arrays
//! and vectors.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::Error;
use crate::numeric::{IntType, Ratio};

/// Absolute tolerance used when comparing floats structurally
pub const FLOAT_TOLERANCE: f64 = 1e-12;

/// 1-based source position of a node, used for breakpoints and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrcPos {
    pub row: usize,
    pub col: usize,
}

/// A user function: parameter list and body as written in the program.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    /// `"LAMBDA"` for anonymous functions
    pub name: String,
    /// Proper list of parameter symbols
    pub params: Value,
    /// List of body expressions, evaluated in order
    pub body: Value,
}

/// Payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// The empty list and the only false value
    Nil,
    True,
    Int(IntType),
    Ratio(Ratio),
    Float(f64),
    Char(char),
    Symbol(String),
    Str(String),
    Cons(Value, Value),
    Closure(Closure),
    /// Handle returned by `DEFCONSTANT` / `DEFPARAMETER`
    GlobalRef(String),
}

#[derive(Debug, Clone)]
struct Node {
    datum: Datum,
    pos: Option<SrcPos>,
}

/// Shared, mutable handle to an S-expression node.
///
/// Equality (`==`) is structural: conses compare element-wise, floats within
/// [`FLOAT_TOLERANCE`], and source positions are ignored.
#[derive(Clone)]
pub struct Value(Rc<RefCell<Node>>);

impl Value {
    pub fn new(datum: Datum) -> Value {
        Value::with_pos(datum, None)
    }

    pub fn with_pos(datum: Datum, pos: Option<SrcPos>) -> Value {
        Value(Rc::new(RefCell::new(Node { datum, pos })))
    }

    pub fn nil() -> Value {
        Value::new(Datum::Nil)
    }

    pub fn t() -> Value {
        Value::new(Datum::True)
    }

    /// `T` for true, `NIL` for false
    pub fn bool(b: bool) -> Value {
        if b { Value::t() } else { Value::nil() }
    }

    pub fn int(n: IntType) -> Value {
        Value::new(Datum::Int(n))
    }

    pub fn ratio(r: Ratio) -> Value {
        Value::new(Datum::Ratio(r))
    }

    pub fn float(x: f64) -> Value {
        Value::new(Datum::Float(x))
    }

    pub fn character(c: char) -> Value {
        Value::new(Datum::Char(c))
    }

    pub fn symbol(name: impl Into<String>) -> Value {
        Value::new(Datum::Symbol(name.into()))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::new(Datum::Str(s.into()))
    }

    pub fn cons(car: Value, cdr: Value) -> Value {
        Value::new(Datum::Cons(car, cdr))
    }

    pub fn closure(name: impl Into<String>, params: Value, body: Value) -> Value {
        Value::new(Datum::Closure(Closure {
            name: name.into(),
            params,
            body,
        }))
    }

    pub fn global(name: impl Into<String>) -> Value {
        Value::new(Datum::GlobalRef(name.into()))
    }

    /// Build a proper list from the given elements.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        let items: Vec<Value> = items.into_iter().collect();
        Value::list_with_tail(items, Value::nil())
    }

    /// Build a list whose last cdr is `tail` (a dotted list unless `tail` is `NIL`).
    /// Each cons cell takes the source position of its element.
    pub fn list_with_tail(items: Vec<Value>, tail: Value) -> Value {
        items.into_iter().rev().fold(tail, |rest, item| {
            let pos = item.pos();
            Value::with_pos(Datum::Cons(item, rest), pos)
        })
    }

    /// Snapshot of the payload. Children of a cons are shared handles.
    pub fn datum(&self) -> Datum {
        self.0.borrow().datum.clone()
    }

    pub fn pos(&self) -> Option<SrcPos> {
        self.0.borrow().pos
    }

    pub fn set_pos(&self, pos: Option<SrcPos>) {
        self.0.borrow_mut().pos = pos;
    }

    /// Overwrite this node with the contents of `other`. Every handle to this node
    /// observes the new contents.
    pub fn set(&self, other: &Value) {
        let node = other.0.borrow().clone();
        *self.0.borrow_mut() = node;
    }

    /// Fresh node with the same payload; children stay shared.
    pub fn shallow_copy(&self) -> Value {
        Value(Rc::new(RefCell::new(self.0.borrow().clone())))
    }

    /// Fresh copy of the whole tree.
    pub fn deep_copy(&self) -> Value {
        let mut spine = Vec::new();
        let mut cur = self.clone();
        while let Some((car, cdr)) = cur.as_cons() {
            spine.push((car.deep_copy(), cur.pos()));
            cur = cdr;
        }
        let tail = cur.shallow_copy();
        spine
            .into_iter()
            .rev()
            .fold(tail, |rest, (car, pos)| Value::with_pos(Datum::Cons(car, rest), pos))
    }

    /// True if both handles point at the same node.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_cons(&self) -> Option<(Value, Value)> {
        match &self.0.borrow().datum {
            Datum::Cons(car, cdr) => Some((car.clone(), cdr.clone())),
            _ => None,
        }
    }

    pub fn car(&self) -> Option<Value> {
        self.as_cons().map(|(car, _)| car)
    }

    pub fn cdr(&self) -> Option<Value> {
        self.as_cons().map(|(_, cdr)| cdr)
    }

    /// Replace the car of a cons cell. Returns false if this is not a cons.
    pub fn set_car(&self, value: Value) -> bool {
        match &mut self.0.borrow_mut().datum {
            Datum::Cons(car, _) => {
                *car = value;
                true
            }
            _ => false,
        }
    }

    /// Replace the cdr of a cons cell. Returns false if this is not a cons.
    pub fn set_cdr(&self, value: Value) -> bool {
        match &mut self.0.borrow_mut().datum {
            Datum::Cons(_, cdr) => {
                *cdr = value;
                true
            }
            _ => false,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.0.borrow().datum, Datum::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_nil()
    }

    pub fn is_cons(&self) -> bool {
        matches!(self.0.borrow().datum, Datum::Cons(..))
    }

    /// A cons or `NIL`
    pub fn is_list(&self) -> bool {
        matches!(self.0.borrow().datum, Datum::Cons(..) | Datum::Nil)
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self.0.borrow().datum,
            Datum::Int(_) | Datum::Ratio(_) | Datum::Float(_)
        )
    }

    pub fn as_symbol(&self) -> Option<String> {
        match &self.0.borrow().datum {
            Datum::Symbol(name) => Some(name.clone()),
            _ => None,
        }
    }

    pub fn is_symbol(&self, name: &str) -> bool {
        matches!(&self.0.borrow().datum, Datum::Symbol(s) if s == name)
    }

    pub fn as_int(&self) -> Option<IntType> {
        match self.0.borrow().datum {
            Datum::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<Closure> {
        match &self.0.borrow().datum {
            Datum::Closure(c) => Some(c.clone()),
            _ => None,
        }
    }

    /// Iterate over the elements of a list, stopping at the first non-cons cdr.
    pub fn iter(&self) -> ListIter {
        ListIter { next: self.clone() }
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().collect()
    }

    /// Number of cons cells along the cdr chain.
    pub fn list_len(&self) -> usize {
        self.iter().count()
    }

    /// Element at `idx`, or `NIL` past the end.
    pub fn nth(&self, idx: usize) -> Value {
        self.iter().nth(idx).unwrap_or_else(Value::nil)
    }

    /// The cons cell at `idx`, or `NIL` past the end.
    pub fn nthcdr(&self, idx: usize) -> Value {
        let mut cur = self.clone();
        for _ in 0..idx {
            match cur.cdr() {
                Some(next) => cur = next,
                None => return Value::nil(),
            }
        }
        if cur.is_cons() { cur } else { Value::nil() }
    }

    /// Copy of the top-level spine; elements are shared.
    pub fn copy_list(&self) -> Value {
        Value::list(self.iter())
    }

    /// The last cons cell of a list (the list itself if it is not a cons).
    pub fn last_cons(&self) -> Value {
        let mut cur = self.clone();
        while let Some(next) = cur.cdr() {
            if !next.is_cons() {
                break;
            }
            cur = next;
        }
        cur
    }

    /// Render as a Rust expression that rebuilds this value.
    ///
    /// Only atoms and conses have a literal form; closures and global references fail.
    pub fn to_code(&self) -> Result<String, Error> {
        Ok(match self.datum() {
            Datum::Nil => "Value::nil()".to_owned(),
            Datum::True => "Value::t()".to_owned(),
            Datum::Int(n) => format!("Value::int({n})"),
            Datum::Ratio(r) => format!(
                "Value::ratio(Ratio::new({}, {})?)",
                r.numerator(),
                r.denominator()
            ),
            Datum::Float(x) => format!("Value::float({x:?})"),
            Datum::Char(c) => format!("Value::character({c:?})"),
            Datum::Symbol(s) => format!("Value::symbol({s:?})"),
            Datum::Str(s) => format!("Value::string({s:?})"),
            Datum::Cons(car, cdr) => {
                format!("Value::cons({}, {})", car.to_code()?, cdr.to_code()?)
            }
            Datum::Closure(c) => {
                return Err(Error::EvalError(format!(
                    "FUNCTION {} has no literal form",
                    c.name
                )));
            }
            Datum::GlobalRef(name) => {
                return Err(Error::EvalError(format!("{name} has no literal form")));
            }
        })
    }
}

/// Iterator over list elements, see [`Value::iter`].
pub struct ListIter {
    next: Value,
}

impl Iterator for ListIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let (car, cdr) = self.next.as_cons()?;
        self.next = cdr;
        Some(car)
    }
}

fn equalp(a: &Value, b: &Value) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    loop {
        if a.ptr_eq(&b) {
            return true;
        }
        // Walk the cdr chain iteratively and only recurse on cars.
        let next = {
            let (na, nb) = (a.0.borrow(), b.0.borrow());
            match (&na.datum, &nb.datum) {
                (Datum::Cons(car_a, cdr_a), Datum::Cons(car_b, cdr_b)) => {
                    if !equalp(car_a, car_b) {
                        return false;
                    }
                    (cdr_a.clone(), cdr_b.clone())
                }
                (Datum::Nil, Datum::Nil) | (Datum::True, Datum::True) => return true,
                (Datum::Int(x), Datum::Int(y)) => return x == y,
                (Datum::Float(x), Datum::Float(y)) => return (x - y).abs() <= FLOAT_TOLERANCE,
                // Ratios are reduced on construction, so componentwise equality suffices.
                (Datum::Ratio(x), Datum::Ratio(y)) => return x == y,
                (Datum::Char(x), Datum::Char(y)) => return x == y,
                (Datum::Symbol(x), Datum::Symbol(y))
                | (Datum::Str(x), Datum::Str(y))
                | (Datum::GlobalRef(x), Datum::GlobalRef(y)) => return x == y,
                (Datum::Closure(x), Datum::Closure(y)) => return x == y,
                _ => return false,
            }
        };
        (a, b) = next;
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        equalp(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.datum() {
            Datum::Nil => write!(f, "NIL"),
            Datum::True => write!(f, "T"),
            Datum::Int(n) => write!(f, "{n}"),
            Datum::Ratio(r) => write!(f, "{r}"),
            Datum::Float(x) => write!(f, "{x}"),
            Datum::Char(c) => write!(f, "#\\{c}"),
            Datum::Symbol(s) | Datum::GlobalRef(s) => write!(f, "{s}"),
            Datum::Str(s) => write!(f, "\"{s}\""),
            Datum::Closure(c) => write!(f, "FUNCTION {}", c.name),
            Datum::Cons(..) => {
                write!(f, "(")?;
                let mut node = self.clone();
                let mut first = true;
                loop {
                    match node.as_cons() {
                        Some((car, cdr)) => {
                            if !first {
                                write!(f, " ")?;
                            }
                            write!(f, "{car}")?;
                            first = false;
                            node = cdr;
                        }
                        None if node.is_nil() => break,
                        None => {
                            write!(f, " . {node}")?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.datum() {
            Datum::Nil => write!(f, "Nil"),
            Datum::True => write!(f, "True"),
            Datum::Int(n) => write!(f, "Int({n})"),
            Datum::Ratio(r) => write!(f, "Ratio({r})"),
            Datum::Float(x) => write!(f, "Float({x})"),
            Datum::Char(c) => write!(f, "Char({c:?})"),
            Datum::Symbol(s) => write!(f, "Symbol({s})"),
            Datum::Str(s) => write!(f, "Str({s:?})"),
            Datum::Closure(c) => write!(f, "Closure({})", c.name),
            Datum::GlobalRef(s) => write!(f, "GlobalRef({s})"),
            Datum::Cons(car, cdr) => {
                if self.last_cons().cdr().is_some_and(|tail| tail.is_nil()) {
                    write!(f, "List(")?;
                    for (i, v) in self.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{v:?}")?;
                    }
                    write!(f, ")")
                } else {
                    write!(f, "Cons({car:?}, {cdr:?})")
                }
            }
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::float(x)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::character(c)
    }
}

impl From<Ratio> for Value {
    fn from(r: Ratio) -> Self {
        Value::ratio(r)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::int(IntType::from(n))
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(IntType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(Into::into))
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(Into::into))
    }
}

/// Helper function for creating symbols - works well in mixed lists
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::symbol(name.as_ref())
}

/// Helper function for creating Values from anything convertible
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

/// Helper function for the empty list
pub fn nil() -> Value {
    Value::nil()
}
