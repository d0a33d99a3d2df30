//! Exact rationals and the numeric promotion lattice `Int -> Ratio -> Float`.
//!
//! Arithmetic builtins fold over their arguments with [`Number`]: two integers stay
//! integers, any ratio operand lifts the fold to exact rational arithmetic, and once
//! a float is involved the rest of the fold is carried out in `f64`. Integer and
//! rational arithmetic is checked; overflow is reported instead of wrapping.

use std::fmt;

use crate::Error;
use crate::ast::{Datum, Value};

/// Type alias for integer values in the interpreter
pub type IntType = i64;

/// Greatest common divisor, always non-negative.
pub fn gcd(a: IntType, b: IntType) -> IntType {
    let (mut x, mut y) = (a.unsigned_abs(), b.unsigned_abs());
    while y != 0 {
        (x, y) = (y, x % y);
    }
    // gcd(i64::MIN, 0) does not fit; callers only divide by it, so saturate.
    IntType::try_from(x).unwrap_or(IntType::MAX)
}

/// An exact fraction kept in lowest terms with a positive denominator.
///
/// A ratio whose denominator is 1 stays a `Ratio`; collapsing to an integer is the
/// job of the arithmetic operators (see [`Number::into_value`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ratio {
    numerator: IntType,
    denominator: IntType,
}

impl Ratio {
    pub fn new(numerator: IntType, denominator: IntType) -> Result<Self, Error> {
        if denominator == 0 {
            return Err(Error::EvalError("division by zero".into()));
        }
        Self::reduced(i128::from(numerator), i128::from(denominator))
    }

    pub fn from_int(n: IntType) -> Self {
        Ratio {
            numerator: n,
            denominator: 1,
        }
    }

    pub fn numerator(&self) -> IntType {
        self.numerator
    }

    pub fn denominator(&self) -> IntType {
        self.denominator
    }

    pub fn to_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    // Reduce in i128 so intermediate products of two i64 ratios cannot overflow.
    fn reduced(mut n: i128, mut d: i128) -> Result<Self, Error> {
        if d == 0 {
            return Err(Error::EvalError("division by zero".into()));
        }
        if d < 0 {
            n = -n;
            d = -d;
        }
        let (mut x, mut y) = (n.unsigned_abs(), d.unsigned_abs());
        while y != 0 {
            (x, y) = (y, x % y);
        }
        let g = x.max(1) as i128;
        let overflow = || Error::EvalError("Integer overflow in ratio arithmetic".into());
        Ok(Ratio {
            numerator: IntType::try_from(n / g).map_err(|_| overflow())?,
            denominator: IntType::try_from(d / g).map_err(|_| overflow())?,
        })
    }

    pub fn add(self, other: Ratio) -> Result<Ratio, Error> {
        let (a, b) = (i128::from(self.numerator), i128::from(self.denominator));
        let (c, d) = (i128::from(other.numerator), i128::from(other.denominator));
        Self::reduced(a * d + c * b, b * d)
    }

    pub fn sub(self, other: Ratio) -> Result<Ratio, Error> {
        let (a, b) = (i128::from(self.numerator), i128::from(self.denominator));
        let (c, d) = (i128::from(other.numerator), i128::from(other.denominator));
        Self::reduced(a * d - c * b, b * d)
    }

    pub fn mul(self, other: Ratio) -> Result<Ratio, Error> {
        let (a, b) = (i128::from(self.numerator), i128::from(self.denominator));
        let (c, d) = (i128::from(other.numerator), i128::from(other.denominator));
        Self::reduced(a * c, b * d)
    }

    pub fn div(self, other: Ratio) -> Result<Ratio, Error> {
        let (a, b) = (i128::from(self.numerator), i128::from(self.denominator));
        let (c, d) = (i128::from(other.numerator), i128::from(other.denominator));
        Self::reduced(a * d, b * c)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Arithmetic operator applied by a fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "addition",
            ArithOp::Sub => "subtraction",
            ArithOp::Mul => "multiplication",
            ArithOp::Div => "division",
        }
    }

    /// Neutral seed used for `(+)`, `(*)` and the single-argument forms of `-` and `/`.
    pub fn identity(self) -> Number {
        match self {
            ArithOp::Add | ArithOp::Sub => Number::Int(0),
            ArithOp::Mul | ArithOp::Div => Number::Int(1),
        }
    }
}

/// A numeric operand lifted out of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(IntType),
    Ratio(Ratio),
    Float(f64),
}

impl Number {
    pub fn from_value(value: &Value) -> Option<Number> {
        match value.datum() {
            Datum::Int(n) => Some(Number::Int(n)),
            Datum::Ratio(r) => Some(Number::Ratio(r)),
            Datum::Float(x) => Some(Number::Float(x)),
            _ => None,
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Ratio(r) => r.to_f64(),
            Number::Float(x) => x,
        }
    }

    /// Convert back into a value, collapsing a ratio with denominator 1 to an integer.
    pub fn into_value(self) -> Value {
        match self {
            Number::Int(n) => Value::int(n),
            Number::Ratio(r) if r.denominator() == 1 => Value::int(r.numerator()),
            Number::Ratio(r) => Value::ratio(r),
            Number::Float(x) => Value::float(x),
        }
    }

    /// Apply `op` with promotion: Int op Int stays Int (except `/`, which yields a ratio),
    /// a Ratio operand lifts both sides to Ratio, and a Float operand makes the result Float.
    pub fn apply(self, op: ArithOp, rhs: Number) -> Result<Number, Error> {
        use Number::{Float, Int};
        let overflow = || Error::EvalError(format!("Integer overflow in {}", op.name()));
        match (self, rhs) {
            (Int(a), Int(b)) => match op {
                ArithOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
                ArithOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
                ArithOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
                ArithOp::Div => Ratio::new(a, b).map(Number::Ratio),
            },
            (Float(_), _) | (_, Float(_)) => {
                let (a, b) = (self.to_f64(), rhs.to_f64());
                Ok(Float(match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div => a / b,
                }))
            }
            (lhs, rhs) => {
                let (a, b) = (lhs.as_ratio(), rhs.as_ratio());
                let result = match op {
                    ArithOp::Add => a.add(b)?,
                    ArithOp::Sub => a.sub(b)?,
                    ArithOp::Mul => a.mul(b)?,
                    ArithOp::Div => {
                        if b.numerator() == 0 {
                            return Err(Error::EvalError("division by zero".into()));
                        }
                        a.div(b)?
                    }
                };
                Ok(Number::Ratio(result))
            }
        }
    }

    fn as_ratio(self) -> Ratio {
        match self {
            Number::Int(n) => Ratio::from_int(n),
            Number::Ratio(r) => r,
            // Float operands are handled before ratios are needed.
            Number::Float(_) => Ratio::from_int(0),
        }
    }
}

/// Fold `op` over `operands` left to right.
///
/// `+` and `*` start from their identity. `-` and `/` start from the first operand when
/// two or more are given, and negate or take the reciprocal of a single operand.
pub fn fold(op: ArithOp, operands: &[Number]) -> Result<Number, Error> {
    let (seed, rest) = match (op, operands) {
        (ArithOp::Sub | ArithOp::Div, [first, rest @ ..]) if !rest.is_empty() => (*first, rest),
        _ => (op.identity(), operands),
    };
    rest.iter().try_fold(seed, |acc, n| acc.apply(op, *n))
}
