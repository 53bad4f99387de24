//! Unary tests: the input entries of decision rules
//!
//! | entry | matches |
//! |---|---|
//! | `-` or empty | anything |
//! | `42`, `"text"`, `'text'`, `true`, `null` | equal value |
//! | `< 10`, `<= 10`, `> 10`, `>= 10`, `!= 3`, `= 3` | comparison |
//! | `[1..10]`, `]1..10[`, `(1..10)`, `[1..10[` | range, brackets give inclusiveness |
//! | `"A", "B", < 0` | any of the listed tests |
//! | `not("A", "B")` | none of the listed tests |
//!
//! Unquoted text that is not a number, boolean or `null` is read as a string.
//! Numbers compare numerically, strings lexicographically; other
//! combinations never match an ordering test.

use std::cmp::Ordering;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Test {
    Compare(Comparison, Value),
    Range {
        low: Value,
        low_inclusive: bool,
        high: Value,
        high_inclusive: bool,
    },
}

/// A parsed input entry
#[derive(Debug, Clone, PartialEq)]
pub enum UnaryTests {
    Any,
    OneOf(Vec<TestCase>),
    NoneOf(Vec<TestCase>),
}

/// One alternative of a test list
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase(Test);

impl UnaryTests {
    /// Parse an entry; errors carry a human readable reason
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "-" {
            return Ok(Self::Any);
        }
        if let Some(inner) = strip_not(trimmed) {
            return Ok(Self::NoneOf(parse_list(inner)?));
        }
        Ok(Self::OneOf(parse_list(trimmed)?))
    }

    /// Build the entry from a YAML/JSON scalar
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(text) => Self::parse(text),
            Value::Null => Ok(Self::Any),
            Value::Bool(_) | Value::Number(_) => Ok(Self::OneOf(vec![TestCase(Test::Compare(
                Comparison::Eq,
                value.clone(),
            ))])),
            other => Err(format!("unsupported input entry {other}")),
        }
    }

    pub fn matches(&self, input: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::OneOf(cases) => cases.iter().any(|c| c.matches(input)),
            Self::NoneOf(cases) => !cases.iter().any(|c| c.matches(input)),
        }
    }
}

impl TestCase {
    fn matches(&self, input: &Value) -> bool {
        match &self.0 {
            Test::Compare(Comparison::Eq, expected) => values_equal(input, expected),
            Test::Compare(Comparison::Ne, expected) => !values_equal(input, expected),
            Test::Compare(op, bound) => match compare(input, bound) {
                Some(ordering) => match op {
                    Comparison::Lt => ordering == Ordering::Less,
                    Comparison::Le => ordering != Ordering::Greater,
                    Comparison::Gt => ordering == Ordering::Greater,
                    Comparison::Ge => ordering != Ordering::Less,
                    Comparison::Eq | Comparison::Ne => false,
                },
                None => false,
            },
            Test::Range {
                low,
                low_inclusive,
                high,
                high_inclusive,
            } => {
                let above = match compare(input, low) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => *low_inclusive,
                    _ => false,
                };
                let below = match compare(input, high) {
                    Some(Ordering::Less) => true,
                    Some(Ordering::Equal) => *high_inclusive,
                    _ => false,
                };
                above && below
            }
        }
    }
}

fn strip_not(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("not")?.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner)
}

/// Split on commas that are outside quotes and brackets
fn split_top_level(text: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    // ranges do not nest, and `]1..5[` opens with a closing bracket
    let mut in_range = false;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | ']' | '(' | ')') => in_range = !in_range,
            (None, ',') if !in_range => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated string".into());
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn parse_list(text: &str) -> Result<Vec<TestCase>, String> {
    split_top_level(text)?
        .into_iter()
        .map(|part| parse_case(part.trim()).map(TestCase))
        .collect()
}

fn parse_case(text: &str) -> Result<Test, String> {
    if text.is_empty() {
        return Err("empty test in list".into());
    }
    if let Some(range) = parse_range(text)? {
        return Ok(range);
    }
    let (op, rest) = if let Some(rest) = text.strip_prefix("<=") {
        (Comparison::Le, rest)
    } else if let Some(rest) = text.strip_prefix(">=") {
        (Comparison::Ge, rest)
    } else if let Some(rest) = text.strip_prefix("!=") {
        (Comparison::Ne, rest)
    } else if let Some(rest) = text.strip_prefix('<') {
        (Comparison::Lt, rest)
    } else if let Some(rest) = text.strip_prefix('>') {
        (Comparison::Gt, rest)
    } else if let Some(rest) = text.strip_prefix('=') {
        (Comparison::Eq, rest)
    } else {
        (Comparison::Eq, text)
    };
    let operand = rest.trim();
    if operand.is_empty() {
        return Err(format!("missing operand in '{text}'"));
    }
    Ok(Test::Compare(op, parse_literal(operand)?))
}

fn parse_range(text: &str) -> Result<Option<Test>, String> {
    let first = text.chars().next();
    let last = text.chars().last();
    let low_inclusive = match first {
        Some('[') => true,
        Some(']' | '(') => false,
        _ => return Ok(None),
    };
    let high_inclusive = match last {
        Some(']') => true,
        Some('[' | ')') => false,
        _ => return Ok(None),
    };
    if text.len() < 2 {
        return Err(format!("incomplete range '{text}'"));
    }
    let body = &text[1..text.len() - 1];
    let Some((low, high)) = body.split_once("..") else {
        return Err(format!("range '{text}' needs 'low..high'"));
    };
    let low = parse_literal(low.trim())?;
    let high = parse_literal(high.trim())?;
    if compare(&low, &high).is_none() {
        return Err(format!("range '{text}' mixes incomparable bounds"));
    }
    Ok(Some(Test::Range {
        low,
        low_inclusive,
        high,
        high_inclusive,
    }))
}

/// Literal of an entry: number, quoted string, boolean, null or bare text
pub(crate) fn parse_literal(text: &str) -> Result<Value, String> {
    let text = text.trim();
    if text.len() >= 2 {
        let bytes = text.as_bytes();
        let (open, close) = (bytes[0], bytes[text.len() - 1]);
        if (open == b'"' && close == b'"') || (open == b'\'' && close == b'\'') {
            return Ok(Value::String(text[1..text.len() - 1].to_string()));
        }
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        "" => return Err("empty literal".into()),
        _ => {}
    }
    if let Ok(number) = serde_json::from_str::<serde_json::Number>(text) {
        return Ok(Value::Number(number));
    }
    if text.contains(['"', '\'']) {
        return Err(format!("malformed string literal {text}"));
    }
    Ok(Value::String(text.to_string()))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(entry: &str, input: Value) -> bool {
        UnaryTests::parse(entry).unwrap().matches(&input)
    }

    #[test]
    fn test_any() {
        assert!(check("-", json!(5)));
        assert!(check("", json!(null)));
        assert_eq!(UnaryTests::from_value(&Value::Null).unwrap(), UnaryTests::Any);
    }

    #[test]
    fn test_literals_and_comparisons() {
        assert!(check("40", json!(40.0)));
        assert!(check("\"DEHAM\"", json!("DEHAM")));
        assert!(check("'DEHAM'", json!("DEHAM")));
        assert!(check("DEHAM", json!("DEHAM")));
        assert!(!check("DEHAM", json!("NLRTM")));
        assert!(check("< 10", json!(9)));
        assert!(!check("< 10", json!(10)));
        assert!(check("<= 10", json!(10)));
        assert!(check(">= 5", json!(5.5)));
        assert!(check("!= 3", json!(4)));
        assert!(!check("> 3", json!("7")));
        assert!(check("true", json!(true)));
    }

    #[test]
    fn test_ranges() {
        assert!(check("[1..10]", json!(1)));
        assert!(check("[1..10]", json!(10)));
        assert!(!check("]1..10[", json!(1)));
        assert!(!check("]1..10[", json!(10)));
        assert!(check("(1..10)", json!(5)));
        assert!(check("[1..10[", json!(9.99)));
        assert!(check("[\"A\"..\"M\"]", json!("Hamburg")));
        assert!(UnaryTests::parse("[1..\"x\"]").is_err());
        assert!(UnaryTests::parse("[1;10]").is_err());
    }

    #[test]
    fn test_lists_and_negation() {
        assert!(check("\"A\",\"B\"", json!("B")));
        assert!(check("< 0, [10..20]", json!(15)));
        assert!(check("]1..5[, 9", json!(9)));
        assert!(!check("< 0, [10..20]", json!(5)));
        assert!(check("not(\"A\", \"B\")", json!("C")));
        assert!(!check("not(\"A\", \"B\")", json!("A")));
        assert!(check("\"a,b\"", json!("a,b")));
    }

    #[test]
    fn test_malformed() {
        assert!(UnaryTests::parse("\"open").is_err());
        assert!(UnaryTests::parse("<").is_err());
        assert!(UnaryTests::parse("1,,2").is_err());
        assert!(UnaryTests::from_value(&json!([1])).is_err());
    }
}
