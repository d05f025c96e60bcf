//! Symbolic expression resolution for `buffers`/`distances`/any scalar leaf
//! in a configuration document (spec §4.1 `resolve_math`, REDESIGN FLAGS §9
//! "Math evaluation -> expression interpreter").
//!
//! The original calls Python's `eval()` directly on the
//! substituted string. Per spec §9's Open Question, we deliberately narrow
//! this to arithmetic over numeric literals: no identifier lookup beyond the
//! textual substitution step, no attribute access, no calls. Anything that
//! doesn't reduce to `+ - * / ( )` over numbers is handed back unevaluated.
//!
//! The substitution step itself is plain substring replacement, matching
//! the original's `key in templated_expr` / `str.replace` (`base.py:603-604`)
//! rather than a word-boundary-aware one: a context key that happens to sit
//! inside a longer alphanumeric run is still replaced.

use std::collections::HashMap;

/// Resolves `expression` against `context` (top-level numeric document
/// keys). If `expression` contains no context key, or the substituted text
/// isn't pure arithmetic, the original string is returned unchanged.
pub fn resolve_math(expression: &str, context: &HashMap<String, f64>) -> String {
    let mut keys: Vec<&String> = context.keys().collect();
    // Longest keys first so e.g. "buffer_small" isn't partially shadowed by "buffer".
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

    let mut substituted = String::new();
    let mut did_substitute = false;
    let mut i = 0;
    'outer: while i < expression.len() {
        for key in &keys {
            if expression[i..].starts_with(key.as_str()) {
                let value = context[*key];
                substituted.push_str(&format_number(value));
                did_substitute = true;
                i += key.len();
                continue 'outer;
            }
        }
        substituted.push(expression[i..].chars().next().unwrap());
        i += expression[i..].chars().next().unwrap().len_utf8();
    }

    if !did_substitute {
        return expression.to_string();
    }

    match evaluate_arithmetic(&substituted) {
        Some(value) => format_rounded(value),
        None => expression.to_string(),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn format_rounded(value: f64) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    let s = format!("{rounded:.1}");
    s.strip_suffix(".0").map(str::to_string).unwrap_or(s)
}

/// Minimal recursive-descent parser/evaluator over `+ - * / ( )` and numeric
/// literals. Returns `None` on any non-arithmetic residue (identifiers,
/// trailing garbage, unbalanced parens, division by zero).
fn evaluate_arithmetic(text: &str) -> Option<f64> {
    let mut parser = Parser { chars: text.chars().filter(|c| !c.is_whitespace()).collect(), pos: 0 };
    let value = parser.parse_expr()?;
    if parser.pos != parser.chars.len() {
        return None;
    }
    Some(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse_expr(&mut self) -> Option<f64> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    value += self.parse_term()?;
                }
                Some('-') => {
                    self.pos += 1;
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn parse_term(&mut self) -> Option<f64> {
        let mut value = self.parse_factor()?;
        loop {
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    value *= self.parse_factor()?;
                }
                Some('/') => {
                    self.pos += 1;
                    let rhs = self.parse_factor()?;
                    if rhs == 0.0 {
                        return None;
                    }
                    value /= rhs;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn parse_factor(&mut self) -> Option<f64> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Some(-self.parse_factor()?)
            }
            Some('+') => {
                self.pos += 1;
                self.parse_factor()
            }
            Some('(') => {
                self.pos += 1;
                let value = self.parse_expr()?;
                if self.peek() != Some(')') {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            _ => None,
        }
    }

    fn parse_number(&mut self) -> Option<f64> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return None;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn substitutes_and_evaluates() {
        let context = ctx(&[("h", 100.0)]);
        assert_eq!(resolve_math("1.1 * h", &context), "110");
    }

    #[test]
    fn rounds_to_one_decimal_and_strips_trailing_zero() {
        let context = ctx(&[("h", 3.0)]);
        assert_eq!(resolve_math("h / 3", &context), "1");
        assert_eq!(resolve_math("h / 4", &context), "0.8");
    }

    #[test]
    fn longest_key_wins_on_prefix_collision() {
        let context = ctx(&[("h", 2.0), ("height", 10.0)]);
        assert_eq!(resolve_math("height", &context), "10");
    }

    #[test]
    fn no_matching_key_returns_original() {
        let context = ctx(&[("h", 2.0)]);
        assert_eq!(resolve_math("unrelated_text", &context), "unrelated_text");
    }

    #[test]
    fn non_arithmetic_residue_returns_original() {
        let mut context = ctx(&[("h", 2.0)]);
        context.insert("foo".to_string(), 1.0);
        assert_eq!(resolve_math("h + bar(1)", &context), "h + bar(1)");
    }

    #[test]
    fn is_pure_and_idempotent_on_its_own_output() {
        let context = ctx(&[("h", 100.0)]);
        let once = resolve_math("1.1 * h", &context);
        let twice = resolve_math(&once, &context);
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_division_by_zero() {
        let context = ctx(&[("h", 0.0)]);
        assert_eq!(resolve_math("1 / h", &context), "1 / h");
    }

    /// Plain substring replacement (spec §4.1, `base.py:603-604`): a key
    /// embedded inside a longer alphanumeric run is still substituted, not
    /// just one that sits at a word boundary.
    #[test]
    fn substitutes_a_key_embedded_in_an_alphanumeric_run() {
        let context = ctx(&[("h", 5.0)]);
        assert_eq!(resolve_math("3h", &context), "35");
    }
}
