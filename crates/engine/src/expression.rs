//! Condition expressions
//!
//! Sequence flow conditions and decision table inputs are written as
//! `${ ... }` expressions over the process variables:
//!
//! - Literals: numbers, `'text'` / `"text"`, `true`, `false`, `null`
//! - Variable paths: `order.amount`, `wagon.axles`
//! - Comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - Logic: `&&` / `and`, `||` / `or`, `!` / `not`, parentheses
//!
//! Text that is not wrapped in `${ }` is read as a boolean literal.

use serde_json::{Map, Number, Value};

/// Errors from parsing or evaluating an expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// Malformed expression text
    #[error("syntax error at {position} in '{source_text}': {message}")]
    Syntax {
        source_text: String,
        position: usize,
        message: String,
    },

    /// Variable path does not resolve
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    /// Operands cannot be combined with the operator
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Condition did not produce a boolean
    #[error("expression '{0}' did not evaluate to a boolean")]
    NotBoolean(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Path(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
}

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse an expression; `${ }` wrapping is optional
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let body = unwrap_delimiters(source).unwrap_or(source);
        let tokens = tokenize(source, body)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Original expression text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a JSON value
    pub fn evaluate(&self, variables: &Map<String, Value>) -> Result<Value, ExpressionError> {
        eval(&self.root, variables)
    }

    /// Evaluate and require a boolean result
    pub fn evaluate_bool(&self, variables: &Map<String, Value>) -> Result<bool, ExpressionError> {
        match self.evaluate(variables)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ExpressionError::NotBoolean(self.source.clone())),
        }
    }
}

/// Evaluate a sequence flow condition
///
/// `${...}` text is parsed and evaluated; any other text must be `true` or
/// `false` (surrounding whitespace ignored).
pub fn evaluate_condition(
    condition: &str,
    variables: &Map<String, Value>,
) -> Result<bool, ExpressionError> {
    if is_expression(condition) {
        return Expression::parse(condition)?.evaluate_bool(variables);
    }
    match condition.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ExpressionError::NotBoolean(condition.to_string())),
    }
}

/// Whether the text is wrapped in `${ }`
pub fn is_expression(text: &str) -> bool {
    unwrap_delimiters(text).is_some()
}

/// Resolve a dotted variable path (`order.lines.0.qty`)
pub fn resolve_path<'a>(variables: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn unwrap_delimiters(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
}

fn tokenize(source: &str, body: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |position: usize, message: &str| ExpressionError::Syntax {
        source_text: source.to_string(),
        position,
        message: message.to_string(),
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(syntax(i, "expected '=='")),
                };
                tokens.push(token);
                i += width;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(syntax(i, "expected '&&' or '||'"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(syntax(start, "unterminated string literal")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit()
                || (c == '-'
                    && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
                    && !matches!(
                        tokens.last(),
                        Some(Token::Number(_) | Token::Str(_) | Token::Path(_) | Token::RParen)
                    )) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| syntax(start, "invalid number literal"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "eq" => Token::Eq,
                    "ne" => Token::Ne,
                    "lt" => Token::Lt,
                    "le" => Token::Le,
                    "gt" => Token::Gt,
                    "ge" => Token::Ge,
                    _ => Token::Path(word),
                });
            }
            _ => return Err(syntax(i, &format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ExpressionError {
        ExpressionError::Syntax {
            source_text: self.source.to_string(),
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ExpressionError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Node::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::True) => Ok(Node::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Node::Literal(Value::Null)),
            Some(Token::Path(path)) => Ok(Node::Path(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Some(_) => Err(self.error("expected a value")),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn eval(node: &Node, variables: &Map<String, Value>) -> Result<Value, ExpressionError> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Path(path) => resolve_path(variables, path)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable(path.clone())),
        Node::Not(inner) => Ok(Value::Bool(!as_bool(&eval(inner, variables)?)?)),
        Node::And(left, right) => {
            if !as_bool(&eval(left, variables)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(right, variables)?)?))
        }
        Node::Or(left, right) => {
            if as_bool(&eval(left, variables)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(right, variables)?)?))
        }
        Node::Compare(op, left, right) => {
            let left = eval(left, variables)?;
            let right = eval(right, variables)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn as_bool(value: &Value) -> Result<bool, ExpressionError> {
    value
        .as_bool()
        .ok_or_else(|| ExpressionError::TypeMismatch(format!("expected boolean, got {value}")))
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::String(b)) => b
            .trim()
            .parse::<f64>()
            .ok()
            .zip(a.as_f64())
            .and_then(|(b, a)| a.partial_cmp(&b)),
        (Value::String(a), Value::Number(b)) => a
            .trim()
            .parse::<f64>()
            .ok()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, CompareOp::Eq | CompareOp::Ne) => {
            Some(a.cmp(b))
        }
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => Ok(o == Ordering::Equal),
        (CompareOp::Ne, Some(o)) => Ok(o != Ordering::Equal),
        (CompareOp::Eq, None) => Ok(false),
        (CompareOp::Ne, None) => Ok(true),
        (CompareOp::Lt, Some(o)) => Ok(o == Ordering::Less),
        (CompareOp::Le, Some(o)) => Ok(o != Ordering::Greater),
        (CompareOp::Gt, Some(o)) => Ok(o == Ordering::Greater),
        (CompareOp::Ge, Some(o)) => Ok(o != Ordering::Less),
        (_, None) => Err(ExpressionError::TypeMismatch(format!(
            "cannot order {left} and {right}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_numeric_comparisons() {
        let v = vars(json!({"amount": 1500, "limit": 1000.5}));
        assert!(evaluate_condition("${amount > 1000}", &v).unwrap());
        assert!(evaluate_condition("${amount >= limit}", &v).unwrap());
        assert!(!evaluate_condition("${amount < 10}", &v).unwrap());
        assert!(evaluate_condition("${amount == 1500.0}", &v).unwrap());
    }

    #[test]
    fn test_logic_and_grouping() {
        let v = vars(json!({"approved": true, "region": "north", "weight": 12}));
        assert!(evaluate_condition(
            "${approved && (region == 'south' || weight > 10)}",
            &v
        )
        .unwrap());
        assert!(!evaluate_condition("${not approved or region != \"north\"}", &v).unwrap());
        assert!(evaluate_condition("${!(weight < 5)}", &v).unwrap());
    }

    #[test]
    fn test_nested_paths() {
        let v = vars(json!({"wagon": {"axles": 4, "tags": ["hazmat"]}}));
        assert!(evaluate_condition("${wagon.axles == 4}", &v).unwrap());
        assert!(evaluate_condition("${wagon.tags.0 == 'hazmat'}", &v).unwrap());
    }

    #[test]
    fn test_unknown_variable() {
        let v = Map::new();
        let err = evaluate_condition("${missing > 1}", &v).unwrap_err();
        assert_eq!(err, ExpressionError::UnknownVariable("missing".into()));
    }

    #[test]
    fn test_plain_text_conditions() {
        let v = Map::new();
        assert!(evaluate_condition("true", &v).unwrap());
        assert!(!evaluate_condition(" false ", &v).unwrap());
        assert!(matches!(
            evaluate_condition("maybe", &v),
            Err(ExpressionError::NotBoolean(_))
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(
            Expression::parse("${a = 1}"),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            Expression::parse("${(a > 1}"),
            Err(ExpressionError::Syntax { .. })
        ));
        assert!(matches!(
            Expression::parse("${'open}"),
            Err(ExpressionError::Syntax { .. })
        ));
    }

    #[test]
    fn test_ordering_mismatch_is_an_error() {
        let v = vars(json!({"flag": true}));
        assert!(matches!(
            evaluate_condition("${flag > 1}", &v),
            Err(ExpressionError::TypeMismatch(_))
        ));
        // equality across types is simply false
        assert!(!evaluate_condition("${flag == 1}", &v).unwrap());
    }

    #[test]
    fn test_negative_numbers_and_subtraction_context() {
        let v = vars(json!({"delta": -3}));
        assert!(evaluate_condition("${delta < -2}", &v).unwrap());
        assert_eq!(
            Expression::parse("${-7}").unwrap().evaluate(&v).unwrap(),
            json!(-7)
        );
    }
}
