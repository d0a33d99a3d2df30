//! Reader: source text to S-expressions.
//!
//! Identifiers are folded to upper case except inside strings, after `#\` and inside a
//! `(TRS ...)` form, which is lowered to a `REWRITE` call. Every node
//! carries the 1-based line and column where it starts.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace1, not_line_ending},
    combinator::{cut, recognize, value},
    error::ErrorKind,
    multi::many0_count,
    sequence::pair,
};

use crate::ast::{Datum, SrcPos, Value};
use crate::numeric::{IntType, Ratio};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

mod trs;

/// Error carried through the nom parsers
#[derive(Debug)]
struct ReadError<'a> {
    input: &'a str,
    kind: ParseErrorKind,
    /// `None` for errors raised by nom combinators themselves
    message: Option<String>,
}

impl<'a> nom::error::ParseError<&'a str> for ReadError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        ReadError {
            input,
            kind: ParseErrorKind::InvalidSyntax,
            message: None,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

type PResult<'a, T> = IResult<&'a str, T, ReadError<'a>>;

/// Abort parsing: no alternative is tried after this
fn fail<'a, T>(input: &'a str, kind: ParseErrorKind, message: impl Into<String>) -> PResult<'a, T> {
    Err(nom::Err::Failure(ReadError {
        input,
        kind,
        message: Some(message.into()),
    }))
}

/// Whether identifiers are folded to upper case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseMode {
    Fold,
    Preserve,
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || "()[]'`,;\"".contains(c)
}

/// Skip whitespace and `;` line comments
fn skip_trivia(input: &str) -> PResult<'_, ()> {
    value(
        (),
        many0_count(alt((
            multispace1,
            recognize(pair(char(';'), not_line_ending)),
        ))),
    )
    .parse(input)
}

fn token(input: &str) -> PResult<'_, &str> {
    take_while1(|c: char| !is_delimiter(c)).parse(input)
}

/// `T` and `NIL` read as constants, every other name as a symbol.
pub(crate) fn symbol_or_constant(name: String) -> Value {
    match name.as_str() {
        "T" => Value::t(),
        "NIL" => Value::nil(),
        _ => Value::symbol(name),
    }
}

/// `(NAME expr)`; both conses take the position of `expr`.
pub(crate) fn unary_call(name: &str, expr: Value) -> Value {
    let head = Value::with_pos(Datum::Symbol(name.to_owned()), expr.pos());
    Value::list([head, expr])
}

fn parse_int(text: &str) -> Result<IntType, (ParseErrorKind, String)> {
    use std::num::IntErrorKind;
    text.parse::<IntType>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => (
            ParseErrorKind::ImplementationLimit,
            format!("integer literal {text} out of range"),
        ),
        _ => (ParseErrorKind::InvalidSyntax, format!("invalid number {text}")),
    })
}

/// `12`, `-3`, `1/3`, `2.5`
fn number(text: &str) -> Result<Value, (ParseErrorKind, String)> {
    if text.contains('.') {
        return text
            .parse::<f64>()
            .map(Value::float)
            .map_err(|_| (ParseErrorKind::InvalidSyntax, format!("invalid number {text}")));
    }
    if let Some((numerator, denominator)) = text.split_once('/') {
        let ratio = Ratio::new(parse_int(numerator)?, parse_int(denominator)?).map_err(|_| {
            (
                ParseErrorKind::InvalidSyntax,
                format!("zero denominator in {text}"),
            )
        })?;
        return Ok(Value::ratio(ratio));
    }
    parse_int(text).map(Value::int)
}

struct Reader<'s> {
    source: &'s str,
    /// Byte offset of the start of every line
    line_starts: Vec<usize>,
}

impl<'s> Reader<'s> {
    fn new(source: &'s str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(idx, _)| idx + 1))
            .collect();
        Reader {
            source,
            line_starts,
        }
    }

    /// Position of the first character of `rest`, a suffix of the source
    fn pos_of(&self, rest: &str) -> SrcPos {
        let offset = self.source.len() - rest.len();
        let line = self
            .line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let line_start = self.line_starts.get(line).copied().unwrap_or(0);
        // A tab advances four columns
        let col = 1 + self.source[line_start..offset]
            .chars()
            .map(|c| if c == '\t' { 4 } else { 1 })
            .sum::<usize>();
        SrcPos { row: line + 1, col }
    }

    fn to_error(&self, err: nom::Err<ReadError<'_>>) -> Error {
        let (input, kind, message) = match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => (e.input, e.kind, e.message),
            nom::Err::Incomplete(_) => ("", ParseErrorKind::Incomplete, None),
        };
        let found = input.chars().next().map(String::from);
        let (kind, message) = match message {
            Some(message) => (kind, message),
            None if input.is_empty() => (
                ParseErrorKind::Incomplete,
                "Unexpected end of input".to_owned(),
            ),
            None => (kind, "Unexpected token".to_owned()),
        };
        let pos = self.pos_of(input);
        let offset = self.source.len() - input.len();
        Error::ParseError(ParseError::with_context_and_found(
            kind,
            format!("{message} (line {}, column {})", pos.row, pos.col),
            self.source,
            offset,
            found,
        ))
    }

    fn expr(&self, input: &'s str, mode: CaseMode, depth: usize) -> PResult<'s, Value> {
        if depth >= MAX_PARSE_DEPTH {
            return fail(
                input,
                ParseErrorKind::TooDeeplyNested,
                format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
            );
        }
        let (input, ()) = skip_trivia(input)?;
        let pos = self.pos_of(input);
        let (rest, expr) = alt((
            |input| self.sugar(input, mode, depth),
            |input| self.list(input, mode, depth),
            |input| self.string(input),
            |input| self.character(input),
            |input| self.atom(input, mode),
        ))
        .parse(input)?;
        if expr.pos().is_none() {
            expr.set_pos(Some(pos));
        }
        Ok((rest, expr))
    }

    /// `'x`, `` `x ``, `,x` and `#'x`
    fn sugar(&self, input: &'s str, mode: CaseMode, depth: usize) -> PResult<'s, Value> {
        let (rest, name) = alt((
            value("FUNCTION", tag("#'")),
            value("QUOTE", char('\'')),
            value("BACKQUOTE", char('`')),
            value("COMMA", char(',')),
        ))
        .parse(input)?;
        let (rest, expr) = cut(|input| self.expr(input, mode, depth + 1)).parse(rest)?;
        Ok((rest, unary_call(name, expr)))
    }

    /// `(...)`, `(a . b)` and `[...]`, which reads as `(COMMA (...))`
    fn list(&self, input: &'s str, mode: CaseMode, depth: usize) -> PResult<'s, Value> {
        let start = input;
        let pos = self.pos_of(input);
        let (mut input, open) = alt((char('('), char('['))).parse(input)?;
        let close = if open == '[' { ']' } else { ')' };

        let mut mode = mode;
        let mut is_trs = false;
        let mut items = Vec::new();
        let mut tail = None;
        loop {
            let (rest, ()) = skip_trivia(input)?;
            input = rest;
            match input.chars().next() {
                None => {
                    return fail(input, ParseErrorKind::Incomplete, format!("expected '{close}'"));
                }
                Some(c) if c == close => {
                    input = &input[1..];
                    break;
                }
                Some(')' | ']') => {
                    return fail(input, ParseErrorKind::InvalidSyntax, format!("expected '{close}'"));
                }
                Some(_) if tail.is_some() => {
                    return fail(input, ParseErrorKind::InvalidSyntax, "'.' is not allowed here.");
                }
                Some(_) => {}
            }

            if let Ok((rest, ".")) = token(input) {
                if items.is_empty() {
                    return fail(input, ParseErrorKind::InvalidSyntax, "'.' is not allowed here.");
                }
                let (after, ()) = skip_trivia(rest)?;
                if after.starts_with(close) {
                    return fail(input, ParseErrorKind::InvalidSyntax, "'.' is not allowed here.");
                }
                let (rest, cdr) = self.expr(rest, mode, depth + 1)?;
                tail = Some(cdr);
                input = rest;
                continue;
            }

            let (rest, item) = cut(|input| self.expr(input, mode, depth + 1)).parse(input)?;
            if items.is_empty() && mode == CaseMode::Fold && item.is_symbol("TRS") {
                // Rules keep their case: it decides what is a variable
                is_trs = true;
                mode = CaseMode::Preserve;
            }
            items.push(item);
            input = rest;
        }

        let list = if is_trs {
            if tail.is_some() {
                return fail(start, ParseErrorKind::InvalidSyntax, "'.' is not allowed in TRS");
            }
            match trs::lower(&items) {
                Ok(lowered) => lowered,
                Err(message) => return fail(start, ParseErrorKind::InvalidSyntax, message),
            }
        } else if items.is_empty() {
            Value::with_pos(Datum::Nil, Some(pos))
        } else {
            Value::list_with_tail(items, tail.unwrap_or_else(Value::nil))
        };

        if open == '[' {
            Ok((input, unary_call("COMMA", list)))
        } else {
            Ok((input, list))
        }
    }

    fn string(&self, input: &'s str) -> PResult<'s, Value> {
        let (mut remaining, _) = char('"').parse(input)?;
        let mut text = String::new();
        loop {
            let mut chars = remaining.chars();
            match chars.next() {
                Some('"') => return Ok((chars.as_str(), Value::string(text))),
                Some('\\') => {
                    match chars.next() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('r') => text.push('\r'),
                        Some('\\') => text.push('\\'),
                        Some('"') => text.push('"'),
                        Some(other) => {
                            return fail(
                                remaining,
                                ParseErrorKind::InvalidSyntax,
                                format!("unknown escape sequence \\{other}"),
                            );
                        }
                        None => {
                            return fail(remaining, ParseErrorKind::Incomplete, "unterminated string");
                        }
                    }
                    remaining = chars.as_str();
                }
                Some(c) => {
                    text.push(c);
                    remaining = chars.as_str();
                }
                None => return fail(input, ParseErrorKind::Incomplete, "unterminated string"),
            }
        }
    }

    /// `#\c`, `#\Space`, `#\Newline`, `#\Tab`
    fn character(&self, input: &'s str) -> PResult<'s, Value> {
        let (rest, _) = tag("#\\").parse(input)?;
        let Some(first) = rest.chars().next() else {
            return fail(rest, ParseErrorKind::Incomplete, "expected a character after #\\");
        };
        let name_len = rest.find(is_delimiter).unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.chars().count() > 1 {
            let c = match name.to_ascii_uppercase().as_str() {
                "SPACE" => ' ',
                "NEWLINE" => '\n',
                "TAB" => '\t',
                _ => {
                    return fail(
                        input,
                        ParseErrorKind::InvalidSyntax,
                        format!("unknown character name {name}"),
                    );
                }
            };
            return Ok((&rest[name_len..], Value::character(c)));
        }
        Ok((&rest[first.len_utf8()..], Value::character(first)))
    }

    fn atom(&self, input: &'s str, mode: CaseMode) -> PResult<'s, Value> {
        let (rest, text) = token(input)?;
        if text == "." {
            return fail(input, ParseErrorKind::InvalidSyntax, "'.' is not allowed here.");
        }
        let is_number = matches!(
            text.as_bytes(),
            [b'0'..=b'9', ..] | [b'-' | b'+', b'0'..=b'9', ..]
        );
        if is_number {
            return match number(text) {
                Ok(n) => Ok((rest, n)),
                Err((kind, message)) => fail(input, kind, message),
            };
        }
        let name = match mode {
            CaseMode::Fold => text.to_uppercase(),
            CaseMode::Preserve => text.to_owned(),
        };
        Ok((rest, symbol_or_constant(name)))
    }
}

/// Read every toplevel form of a program.
pub fn read_program(source: &str) -> Result<Vec<Value>, Error> {
    let reader = Reader::new(source);
    let mut forms = Vec::new();
    let mut input = source;
    loop {
        let (rest, ()) = skip_trivia(input).map_err(|e| reader.to_error(e))?;
        if rest.is_empty() {
            return Ok(forms);
        }
        if rest.starts_with([')', ']']) {
            let err = ReadError {
                input: rest,
                kind: ParseErrorKind::TrailingContent,
                message: Some("unexpected closing bracket".to_owned()),
            };
            return Err(reader.to_error(nom::Err::Failure(err)));
        }
        let (rest, form) = reader
            .expr(rest, CaseMode::Fold, 0)
            .map_err(|e| reader.to_error(e))?;
        forms.push(form);
        input = rest;
    }
}

/// Read exactly one form.
pub fn read_expr(source: &str) -> Result<Value, Error> {
    let mut forms = read_program(source)?;
    match forms.len() {
        1 => Ok(forms.remove(0)),
        0 => Err(Error::ParseError(ParseError::from_message(
            ParseErrorKind::Incomplete,
            "Unexpected end of input",
        ))),
        n => Err(Error::ParseError(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            format!("expected one expression, found {n}"),
            source,
            0,
        ))),
    }
}
