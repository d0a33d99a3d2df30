//! Term rewriting.
//!
//! A [`Rule`] is a `(pattern, condition, template)` triple of plain values. Patterns use
//! two kinds of variables:
//!
//! - a symbol `$X` matches any single value and binds it to `X`;
//! - a cons whose head is the symbol `$$X` matches the rest of the list at that position
//!   and binds it (possibly `NIL`) to `X`.
//!
//! A variable that occurs twice must match structurally equal values. The bindings of a
//! successful match form the scope in which the condition and then the template are
//! evaluated; the instantiated template finally goes through [`splice`], which flattens
//! `(~ list)` markers into their parent list.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::Error;
use crate::ast::Value;
use crate::builtinops::arg;
use crate::evaluator::Interpreter;

/// Variable bindings produced by [`match_pattern`]
pub type Bindings = HashMap<String, Value>;

/// A rewrite rule. The condition and the template are expressions evaluated in the scope
/// of the match bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub pattern: Value,
    pub condition: Value,
    pub template: Value,
}

impl Rule {
    pub fn new(pattern: Value, condition: Value, template: Value) -> Self {
        Rule {
            pattern,
            condition,
            template,
        }
    }

    /// A rule whose condition is `T`
    pub fn unconditional(pattern: Value, template: Value) -> Self {
        Rule::new(pattern, Value::t(), template)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.pattern, self.template)
    }
}

fn bind(var: &str, term: &Value, bindings: &mut Bindings) -> bool {
    match bindings.get(var) {
        Some(bound) => bound == term,
        None => {
            bindings.insert(var.to_owned(), term.clone());
            true
        }
    }
}

/// Match `term` against `pattern`, extending `bindings`. On failure `bindings` may hold
/// partial results and should be discarded.
pub fn match_pattern(pattern: &Value, term: &Value, bindings: &mut Bindings) -> bool {
    let mut pattern = pattern.clone();
    let mut term = term.clone();
    loop {
        if let Some(name) = pattern.as_symbol()
            && let Some(var) = name.strip_prefix('$')
        {
            return bind(var, &term, bindings);
        }
        if let Some(head) = pattern.car()
            && let Some(name) = head.as_symbol()
            && let Some(var) = name.strip_prefix("$$")
        {
            return bind(var, &term, bindings);
        }

        match (pattern.as_cons(), term.as_cons()) {
            (Some((pattern_car, pattern_cdr)), Some((term_car, term_cdr))) => {
                if !match_pattern(&pattern_car, &term_car, bindings) {
                    return false;
                }
                pattern = pattern_cdr;
                term = term_cdr;
            }
            (None, None) => return pattern == term,
            _ => return false,
        }
    }
}

/// The list inside a `(~ list)` marker
fn splice_marker(value: &Value) -> Option<Value> {
    let (head, rest) = value.as_cons()?;
    let (list, tail) = rest.as_cons()?;
    (head.is_symbol("~") && tail.is_nil()).then_some(list)
}

fn spliceable(list: &Value) -> Result<Value, Error> {
    if !list.is_list() {
        return Err(Error::EvalError("append~ can only append lists".into()));
    }
    Ok(list.copy_list())
}

/// Replace every `(~ list)` element of every list in `value` by the elements of `list`.
///
/// `(1 (~ (2 3)) 4)` becomes `(1 2 3 4)`. Spliced elements are scanned again, so markers
/// produced by a splice are flattened as well. A marker standing alone is replaced by its
/// list. The result is built from fresh conses; `value` is left untouched.
pub fn splice(value: &Value) -> Result<Value, Error> {
    let mut value = value.clone();
    while let Some(list) = splice_marker(&value) {
        value = spliceable(&list)?;
    }
    if !value.is_cons() {
        return Ok(value);
    }

    let tail = value.last_cons().cdr().unwrap_or_else(Value::nil);
    let mut pending: Vec<Value> = value.to_vec();
    pending.reverse();
    let mut items = Vec::with_capacity(pending.len());
    while let Some(element) = pending.pop() {
        match splice_marker(&element) {
            Some(list) => pending.extend(spliceable(&list)?.to_vec().into_iter().rev()),
            None if element.is_cons() => items.push(splice(&element)?),
            None => items.push(element),
        }
    }

    let spliced = Value::list_with_tail(items, tail);
    spliced.set_pos(value.pos());
    Ok(spliced)
}

/// `(APPEND~ x)`
pub(crate) fn builtin_append_tilde(args: &[Value], _interp: &mut Interpreter) -> Result<Value, Error> {
    splice(&arg(args, 0))
}

impl Interpreter {
    /// Rewrite `term` until no rule fires on it or on any of its subterms.
    ///
    /// Subterms are rewritten first: every element, then every proper suffix of the list
    /// from the shortest up. Then every rule is tried in order against the current term;
    /// a firing rule replaces the term and the remaining rules are tried against the
    /// replacement. The whole step repeats while anything fired. Conses of `term` are
    /// patched in place.
    ///
    /// Only list elements count against the depth limit, the length of a list does not.
    /// There is no cycle detection: a rule set without a fixpoint only stops at the time
    /// budget.
    pub fn rewrite(&mut self, term: &Value, rules: &[Rule], depth: usize) -> Result<Value, Error> {
        let max_depth = self.config().max_eval_depth;
        if depth >= max_depth {
            return Err(Error::EvalError(format!(
                "Rewrite depth limit exceeded (max: {max_depth})"
            )));
        }
        self.rewrite_to_fixpoint(term.clone(), rules, depth, false)
    }

    fn rewrite_to_fixpoint(
        &mut self,
        mut term: Value,
        rules: &[Rule],
        depth: usize,
        mut subterms_done: bool,
    ) -> Result<Value, Error> {
        loop {
            if !subterms_done {
                self.rewrite_subterms(&term, rules, depth)?;
            }
            match self.apply_rules(&term, rules, depth)? {
                Some(replacement) => {
                    term = replacement;
                    subterms_done = false;
                }
                None => return Ok(term),
            }
        }
    }

    /// The cdr spine is walked in a loop. Elements are rewritten front to back, then the
    /// suffixes back to front, each suffix seeing the already rewritten rest.
    fn rewrite_subterms(&mut self, term: &Value, rules: &[Rule], depth: usize) -> Result<(), Error> {
        let mut spine = Vec::new();
        let mut cur = term.clone();
        while let Some((car, cdr)) = cur.as_cons() {
            cur.set_car(self.rewrite(&car, rules, depth + 1)?);
            spine.push(cur);
            cur = cdr;
        }
        let Some((first, suffixes)) = spine.split_first() else {
            return Ok(());
        };

        let mut rest = self.rewrite_to_fixpoint(cur, rules, depth, true)?;
        for cell in suffixes.iter().rev() {
            cell.set_cdr(rest);
            rest = self.rewrite_to_fixpoint(cell.clone(), rules, depth, true)?;
        }
        first.set_cdr(rest);
        Ok(())
    }

    /// Try every rule once, in order. `None` if nothing fired.
    fn apply_rules(
        &mut self,
        term: &Value,
        rules: &[Rule],
        depth: usize,
    ) -> Result<Option<Value>, Error> {
        let mut term = term.clone();
        let mut changed = false;
        for rule in rules {
            let mut bindings = Bindings::new();
            if !match_pattern(&rule.pattern, &term, &mut bindings) {
                continue;
            }
            let replacement = self.with_scope(bindings, |interp| {
                let condition = interp.eval_with_depth_tracking(&rule.condition, depth + 1)?;
                if condition.is_nil() {
                    return Ok(None);
                }
                let instance =
                    interp.eval_with_depth_tracking(&rule.template.deep_copy(), depth + 1)?;
                splice(&instance).map(Some)
            })?;
            if let Some(replacement) = replacement {
                debug!(old = %term, new = %replacement, rule = %rule, "REWROTE");
                term = replacement;
                changed = true;
            }
        }
        Ok(changed.then_some(term))
    }
}

/// `(REWRITE term rules)`: `rules` evaluates to a flat list of
/// `pattern condition template` triples. Patterns are evaluated once up front; conditions
/// and templates are evaluated on every match.
pub(crate) fn eval_rewrite(
    args: &[Value],
    interp: &mut Interpreter,
    depth: usize,
) -> Result<Value, Error> {
    // Rewriting patches conses, keep the caller's structure out of it
    let term = interp
        .eval_with_depth_tracking(&arg(args, 0), depth + 1)?
        .deep_copy();
    let rule_list = interp.eval_with_depth_tracking(&arg(args, 1), depth + 1)?;
    let items = rule_list.to_vec();
    if interp.is_checked() && (!rule_list.is_list() || items.len() % 3 != 0) {
        return Err(Error::EvalError(format!(
            "REWRITE expects a list of (pattern condition template) triples, got {rule_list}"
        )));
    }

    let mut rules = Vec::with_capacity(items.len() / 3);
    for triple in items.chunks(3) {
        let part = |idx: usize| triple.get(idx).cloned().unwrap_or_else(Value::nil);
        let pattern = interp.eval_with_depth_tracking(&part(0), depth + 1)?;
        rules.push(Rule::new(pattern, part(1), part(2)));
    }
    interp.rewrite(&term, &rules, depth + 1)
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{nil, sym, val};
    use std::time::Duration;

    fn call(head: &str, args: Vec<Value>) -> Value {
        let mut items = vec![sym(head)];
        items.extend(args);
        Value::list(items)
    }

    fn backquote(template: Value) -> Value {
        call("BACKQUOTE", vec![template])
    }

    fn comma(expr: Value) -> Value {
        call("COMMA", vec![expr])
    }

    #[test]
    fn test_match_pattern_data_driven() {
        // (pattern, term, expected bindings or None for no match)
        let test_cases = vec![
            (
                val(vec![val(3), sym("$X"), sym("$X")]),
                val(vec![val(3), val([4, 5]), val([4, 5])]),
                Some(vec![("X", val([4, 5]))]),
            ),
            (
                val(vec![val(3), sym("$X"), sym("$X")]),
                val(vec![val(3), val([4, 5]), val([4, 333])]),
                None,
            ),
            (
                val(vec![val(3), sym("$$X")]),
                val([3, 4, 5]),
                Some(vec![("X", val([4, 5]))]),
            ),
            (val(vec![val(3), sym("$$X")]), val([3]), Some(vec![("X", nil())])),
            (
                val(vec![sym("F"), sym("$A"), sym("$B")]),
                val(vec![sym("F"), val(1), val("s")]),
                Some(vec![("A", val(1)), ("B", val("s"))]),
            ),
            // Constants must agree
            (val(vec![sym("F"), sym("$A")]), val(vec![sym("G"), val(1)]), None),
            // Shape mismatches
            (val(vec![sym("F"), sym("$A")]), val(vec![sym("F")]), None),
            (val(vec![sym("F")]), val(vec![sym("F"), val(1)]), None),
            (val([1, 2]), val(1), None),
            // A bare sequence symbol is treated as a single variable named `$X`
            (sym("$$X"), val(7), Some(vec![("$X", val(7))])),
            // Sequence variables also enforce consistency
            (
                val(vec![sym("$X"), sym("$$X")]),
                val(vec![val([2]), val(2)]),
                Some(vec![("X", val([2]))]),
            ),
            (val(vec![sym("$X"), sym("$$X")]), val([1, 2]), None),
            (val(2.5), val(2.5), Some(vec![])),
        ];

        for (i, (pattern, term, expected)) in test_cases.iter().enumerate() {
            let mut bindings = Bindings::new();
            let matched = match_pattern(pattern, term, &mut bindings);
            match expected {
                Some(expected) => {
                    assert!(matched, "Test case {}: {pattern} should match {term}", i + 1);
                    assert_eq!(bindings.len(), expected.len(), "Test case {}", i + 1);
                    for (name, value) in expected {
                        assert_eq!(bindings.get(*name), Some(value), "Test case {}", i + 1);
                    }
                }
                None => assert!(!matched, "Test case {}: {pattern} should not match {term}", i + 1),
            }
        }
    }

    #[test]
    fn test_splice_data_driven() {
        let test_cases = vec![
            (val(vec![val(1), call("~", vec![val([2, 3])]), val(4)]), Some(val([1, 2, 3, 4]))),
            (val(vec![val(1), call("~", vec![nil()]), val(4)]), Some(val([1, 4]))),
            (
                val(vec![call("~", vec![val([1])]), call("~", vec![val([2])])]),
                Some(val([1, 2])),
            ),
            // Markers inside nested lists
            (
                val(vec![sym("A"), val(vec![val(1), call("~", vec![val([2])])])]),
                Some(val(vec![sym("A"), val([1, 2])])),
            ),
            // A splice that produces another marker
            (
                val(vec![call("~", vec![val(vec![call("~", vec![val([7, 8])])])])]),
                Some(val([7, 8])),
            ),
            // A marker standing alone becomes its list
            (call("~", vec![val([5, 6])]), Some(val([5, 6]))),
            // Only two-element markers count
            (
                val(vec![call("~", vec![val([1]), val([2])])]),
                Some(val(vec![call("~", vec![val([1]), val([2])])])),
            ),
            (val(5), Some(val(5))),
            (val(vec![val(1), call("~", vec![val(5)])]), None),
            (call("~", vec![val(5)]), None),
        ];

        for (i, (input, expected)) in test_cases.iter().enumerate() {
            match (splice(input), expected) {
                (Ok(actual), Some(expected)) => {
                    assert_eq!(&actual, expected, "Test case {}", i + 1);
                }
                (Err(err), None) => {
                    assert_eq!(
                        format!("{err}"),
                        "RuntimeError: append~ can only append lists"
                    );
                }
                (result, _) => panic!("Test case {}: unexpected {result:?}", i + 1),
            }
        }
    }

    #[test]
    fn test_splice_copies_the_spliced_list() {
        let inner = val([2, 3]);
        let input = val(vec![call("~", vec![inner.clone()]), val(4)]);
        let spliced = splice(&input).unwrap();
        assert_eq!(spliced, val([2, 3, 4]));
        // The original list still ends after 3
        assert_eq!(inner, val([2, 3]));
        assert!(!spliced.ptr_eq(&inner));
    }

    #[test]
    fn test_rewrite_fixpoint() {
        let mut interp = Interpreter::new();
        let a_to_b = Rule::unconditional(
            val(vec![sym("A")]),
            backquote(val(vec![sym("B")])),
        );

        let result = interp.rewrite(&val(vec![sym("A")]), &[a_to_b.clone()], 0).unwrap();
        assert_eq!(result, val(vec![sym("B")]));

        let term = val(vec![sym("X"), val(vec![sym("A")]), val(vec![sym("A")])]);
        let result = interp.rewrite(&term, &[a_to_b], 0).unwrap();
        assert_eq!(
            result,
            val(vec![sym("X"), val(vec![sym("B")]), val(vec![sym("B")])])
        );
    }

    #[test]
    fn test_rewrite_long_list() {
        let mut interp = Interpreter::new();
        let a_to_b = Rule::unconditional(
            val(vec![sym("A")]),
            backquote(val(vec![sym("B")])),
        );
        let term = Value::list((0..2000).map(|_| val(vec![sym("A")])));
        let result = interp.rewrite(&term, &[a_to_b], 0).unwrap();
        assert_eq!(result.to_vec().len(), 2000);
        assert!(result.iter().all(|item| item == val(vec![sym("B")])));
    }

    #[test]
    fn test_rewrite_matches_list_suffixes() {
        let mut interp = Interpreter::new();
        // (END) -> (DONE): only the last suffix of (1 2 END) has this shape
        let rule = Rule::unconditional(
            val(vec![sym("END")]),
            backquote(val(vec![sym("DONE")])),
        );
        let term = val(vec![val(1), val(2), sym("END")]);
        assert_eq!(
            interp.rewrite(&term, &[rule], 0).unwrap(),
            val(vec![val(1), val(2), sym("DONE")])
        );
    }

    #[test]
    fn test_rewrite_tries_remaining_rules_on_replacement() {
        let mut interp = Interpreter::new();
        let rules = [
            Rule::unconditional(val(vec![sym("A")]), backquote(val(vec![sym("B")]))),
            Rule::unconditional(val(vec![sym("B")]), backquote(val(vec![sym("C")]))),
        ];
        let result = interp.rewrite(&val(vec![sym("A")]), &rules, 0).unwrap();
        assert_eq!(result, val(vec![sym("C")]));
    }

    #[test]
    fn test_rewrite_with_variables_and_conditions() {
        let mut interp = Interpreter::new();
        let rules = [
            // (PLUS x 0) -> x
            Rule::unconditional(
                val(vec![sym("PLUS"), sym("$X"), val(0)]),
                backquote(comma(sym("X"))),
            ),
            // (DOUBLE n) -> 2n, numbers only
            Rule::new(
                val(vec![sym("DOUBLE"), sym("$N")]),
                call("NUMBERP", vec![sym("N")]),
                backquote(comma(call("*", vec![val(2), sym("N")]))),
            ),
        ];

        let nested = val(vec![
            sym("PLUS"),
            val(vec![sym("PLUS"), val(5), val(0)]),
            val(0),
        ]);
        assert_eq!(interp.rewrite(&nested, &rules, 0).unwrap(), val(5));

        let term = val(vec![
            sym("LIST"),
            val(vec![sym("DOUBLE"), val(4)]),
            val(vec![sym("DOUBLE"), sym("Y")]),
        ]);
        assert_eq!(
            interp.rewrite(&term, &rules, 0).unwrap(),
            val(vec![sym("LIST"), val(8), val(vec![sym("DOUBLE"), sym("Y")])])
        );

        // Match scopes are popped again
        assert_eq!(interp.environment().depth(), 1);
        assert!(interp.environment().lookup("N").is_none());
    }

    #[test]
    fn test_rewrite_splices_templates() {
        let mut interp = Interpreter::new();
        // (WRAP xs...) -> (LIST ~xs ~xs)
        let rule = Rule::unconditional(
            val(vec![sym("WRAP"), sym("$$XS")]),
            backquote(val(vec![
                sym("LIST"),
                call("~", vec![comma(sym("XS"))]),
                call("~", vec![comma(sym("XS"))]),
            ])),
        );
        let term = val(vec![sym("WRAP"), val(1), val(2)]);
        assert_eq!(
            interp.rewrite(&term, &[rule], 0).unwrap(),
            val(vec![sym("LIST"), val(1), val(2), val(1), val(2)])
        );
    }

    #[test]
    fn test_rewrite_without_fixpoint_hits_time_budget() {
        let mut interp = Interpreter::new();
        let rule = Rule::unconditional(val(vec![sym("A")]), backquote(val(vec![sym("A")])));
        interp.set_time_budget(Some(Duration::from_millis(20)));
        let err = interp.rewrite(&val(vec![sym("A")]), &[rule], 0).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert_eq!(interp.environment().depth(), 1);
    }

    #[test]
    fn test_rewrite_builtin() {
        let mut interp = Interpreter::new();
        let quote = |v: Value| call("QUOTE", vec![v]);
        let expr = call(
            "REWRITE",
            vec![
                quote(val(vec![sym("F"), val(2), val(3)])),
                quote(val(vec![
                    backquote(val(vec![sym("F"), sym("$X"), sym("$Y")])),
                    Value::t(),
                    backquote(comma(call("+", vec![sym("X"), sym("Y")]))),
                ])),
            ],
        );
        assert_eq!(interp.eval(&expr).unwrap(), val(5));

        let malformed = call(
            "REWRITE",
            vec![quote(val(1)), quote(val(vec![sym("$X"), Value::t()]))],
        );
        let err = interp.eval(&malformed).unwrap_err();
        assert!(format!("{err}").contains("REWRITE expects a list of (pattern condition template) triples"));
    }

    #[test]
    fn test_rewrite_leaves_input_untouched() {
        let mut interp = Interpreter::new();
        let original = val(vec![sym("X"), val(vec![sym("A")])]);
        interp
            .environment_mut()
            .define("TERM".to_owned(), &original);
        let expr = call(
            "REWRITE",
            vec![
                sym("TERM"),
                call(
                    "QUOTE",
                    vec![val(vec![
                        backquote(val(vec![sym("A")])),
                        Value::t(),
                        backquote(val(vec![sym("B")])),
                    ])],
                ),
            ],
        );
        assert_eq!(
            interp.eval(&expr).unwrap(),
            val(vec![sym("X"), val(vec![sym("B")])])
        );
        assert_eq!(original, val(vec![sym("X"), val(vec![sym("A")])]));
    }
}
