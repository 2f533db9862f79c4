//! Step skip-condition evaluation.
//!
//! Conditions are a deliberately tiny grammar: `var == literal`,
//! `var != literal`, `var < n`, `var > n`, `var <= n`, `var >= n`, plus
//! two named shortcuts. A condition describes when the step should RUN; a
//! false result skips it, and an unrecognized expression falls through to
//! running the step.

use std::collections::BTreeMap;

/// A value available to condition expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum CondValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl From<&str> for CondValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for CondValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<f64> for CondValue {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<i64> for CondValue {
    fn from(value: i64) -> Self {
        Self::Num(value as f64)
    }
}

impl From<bool> for CondValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl CondValue {
    fn as_num(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }
}

/// The variable namespace visible to a condition: task fields, step
/// config, and flattened artifacts from previous step results.
pub type Namespace = BTreeMap<String, CondValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

/// Split `cond` into (identifier, op, rhs literal). Two-character
/// operators are matched before their one-character prefixes.
fn split_expression(cond: &str) -> Option<(&str, Op, &str)> {
    for (token, op) in [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("<", Op::Lt),
        (">", Op::Gt),
    ] {
        if let Some(idx) = cond.find(token) {
            let lhs = cond[..idx].trim();
            let rhs = cond[idx + token.len()..].trim();
            if lhs.is_empty() || rhs.is_empty() {
                return None;
            }
            if !lhs.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return None;
            }
            return Some((lhs, op, rhs));
        }
    }
    None
}

fn strip_quotes(raw: &str) -> &str {
    let raw = raw.trim();
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

/// Evaluate one expression against the namespace.
///
/// Returns `None` when the expression is not recognized or references an
/// absent variable; callers fall through to running the step.
pub fn evaluate(cond: &str, ns: &Namespace) -> Option<bool> {
    let (var, op, raw_rhs) = split_expression(cond.trim())?;
    let actual = ns.get(var)?;
    let rhs = strip_quotes(raw_rhs);

    match op {
        Op::Eq | Op::Ne => {
            let equal = match actual {
                CondValue::Str(s) => s == rhs,
                CondValue::Num(n) => rhs.parse::<f64>().map(|r| (*n - r).abs() < f64::EPSILON).unwrap_or(false),
                CondValue::Bool(b) => rhs.parse::<bool>().map(|r| *b == r).unwrap_or(false),
            };
            Some(if op == Op::Eq { equal } else { !equal })
        }
        Op::Lt | Op::Gt | Op::Le | Op::Ge => {
            let lhs_num = actual.as_num()?;
            let rhs_num: f64 = rhs.parse().ok()?;
            Some(match op {
                Op::Lt => lhs_num < rhs_num,
                Op::Gt => lhs_num > rhs_num,
                Op::Le => lhs_num <= rhs_num,
                Op::Ge => lhs_num >= rhs_num,
                _ => unreachable!(),
            })
        }
    }
}

/// Decide whether a step should be skipped given its condition.
///
/// Handles the named shortcuts first, then expression evaluation.
pub fn should_skip(condition: &str, ns: &Namespace) -> bool {
    let cond = condition.trim();

    match cond {
        "skip_if_docs_only" => {
            return matches!(ns.get("task_type"), Some(CondValue::Str(t)) if t == "docs");
        }
        "skip_if_small_change" => {
            return matches!(
                ns.get("lines_changed").and_then(CondValue::as_num),
                Some(n) if n < 10.0
            );
        }
        _ => {}
    }

    match evaluate(cond, ns) {
        // The condition says when to run; false means skip.
        Some(run) => !run,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(entries: &[(&str, CondValue)]) -> Namespace {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_with_and_without_quotes() {
        let ns = ns(&[("task_type", "docs".into())]);
        assert_eq!(evaluate("task_type == 'docs'", &ns), Some(true));
        assert_eq!(evaluate("task_type == \"docs\"", &ns), Some(true));
        assert_eq!(evaluate("task_type == docs", &ns), Some(true));
        assert_eq!(evaluate("task_type == feature", &ns), Some(false));
        assert_eq!(evaluate("task_type != feature", &ns), Some(true));
    }

    #[test]
    fn numeric_comparisons() {
        let ns = ns(&[("lines_changed", 42.0.into())]);
        assert_eq!(evaluate("lines_changed > 10", &ns), Some(true));
        assert_eq!(evaluate("lines_changed < 10", &ns), Some(false));
        assert_eq!(evaluate("lines_changed >= 42", &ns), Some(true));
        assert_eq!(evaluate("lines_changed <= 41", &ns), Some(false));
    }

    #[test]
    fn numeric_coercion_from_strings() {
        let ns = ns(&[("count", "7".into())]);
        assert_eq!(evaluate("count > 5", &ns), Some(true));
        assert_eq!(evaluate("count == 7", &ns), Some(false)); // string vs number literal
    }

    #[test]
    fn unknown_variable_falls_through() {
        let ns = Namespace::new();
        assert_eq!(evaluate("missing == 1", &ns), None);
        assert!(!should_skip("missing == 1", &ns));
    }

    #[test]
    fn unrecognized_expression_falls_through_to_run() {
        let ns = ns(&[("task_type", "docs".into())]);
        assert_eq!(evaluate("task_type in ('docs', 'test')", &ns), None);
        assert!(!should_skip("task_type in ('docs', 'test')", &ns));
        assert!(!should_skip("???", &ns));
    }

    #[test]
    fn false_condition_skips() {
        let ns = ns(&[("task_type", "feature".into())]);
        // Condition says "run when docs"; feature task skips.
        assert!(should_skip("task_type == 'docs'", &ns));
        assert!(!should_skip("task_type == 'feature'", &ns));
    }

    #[test]
    fn docs_only_shortcut() {
        let docs = ns(&[("task_type", "docs".into())]);
        let feature = ns(&[("task_type", "feature".into())]);
        assert!(should_skip("skip_if_docs_only", &docs));
        assert!(!should_skip("skip_if_docs_only", &feature));
    }

    #[test]
    fn small_change_shortcut() {
        let small = ns(&[("lines_changed", 3.0.into())]);
        let large = ns(&[("lines_changed", 300.0.into())]);
        let unknown = Namespace::new();
        assert!(should_skip("skip_if_small_change", &small));
        assert!(!should_skip("skip_if_small_change", &large));
        assert!(!should_skip("skip_if_small_change", &unknown));
    }

    #[test]
    fn bool_equality() {
        let ns = ns(&[("deps_ok", true.into())]);
        assert_eq!(evaluate("deps_ok == true", &ns), Some(true));
        assert_eq!(evaluate("deps_ok != true", &ns), Some(false));
    }
}
