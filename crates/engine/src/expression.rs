//! Boolean expressions for `condition` nodes and convergence predicates.
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := operand ( op operand )?      op: == != < <= > >= contains
//! operand := literal | {{path}} | "(" expr ")"
//! ```
//!
//! Literals are numbers, quoted strings, `true`, `false` and `null`.
//! Truthiness follows JSON: `null`, `false`, `0`, `""`, `[]` and `{}` are false.

use serde_json::Value;

use crate::context::ContextSnapshot;
use crate::error::EngineError;
use crate::template::{self, Placeholder};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Placeholder(Placeholder),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Placeholder(Placeholder),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let mut end = start;
                while end + 1 < chars.len() && !(chars[end] == '}' && chars[end + 1] == '}') {
                    end += 1;
                }
                if end + 1 >= chars.len() {
                    return Err("unterminated placeholder".into());
                }
                let raw: String = chars[start..end].iter().collect();
                tokens.push(Token::Placeholder(Placeholder::parse(&raw)?));
                i = end + 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                text.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('<', _) => (Token::Op(CompareOp::Lt), 1),
                    ('>', _) => (Token::Op(CompareOp::Gt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(format!("unexpected '{c}' at position {i}")),
                };
                tokens.push(token);
                i += width;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value: Value =
                    serde_json::from_str(&text).map_err(|_| format!("bad number '{text}'"))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "contains" => Token::Op(CompareOp::Contains),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => return Err(format!("unknown word '{word}'; wrap paths in {{{{ }}}}")),
                });
            }
            other => return Err(format!("unexpected '{other}' at position {i}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Placeholder(p)) => Ok(Expr::Placeholder(p)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".into()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

/// Parses an expression without evaluating it.
pub fn parse(src: &str) -> Result<Expr, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!("unexpected trailing token {:?}", parser.tokens[parser.pos]));
    }
    Ok(expr)
}

impl Expr {
    pub fn evaluate(&self, ctx: &ContextSnapshot, node_id: &str) -> Result<Value, EngineError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Placeholder(p) => template::lookup(p, ctx, node_id),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(ctx, node_id)?))),
            Expr::And(l, r) => {
                if !is_truthy(&l.evaluate(ctx, node_id)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&r.evaluate(ctx, node_id)?)))
            }
            Expr::Or(l, r) => {
                if is_truthy(&l.evaluate(ctx, node_id)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&r.evaluate(ctx, node_id)?)))
            }
            Expr::Compare(l, op, r) => {
                let left = l.evaluate(ctx, node_id)?;
                let right = r.evaluate(ctx, node_id)?;
                compare(&left, *op, &right)
                    .map(Value::Bool)
                    .map_err(|message| EngineError::InvalidExpression {
                        node_id: node_id.to_owned(),
                        message,
                    })
            }
        }
    }
}

/// Parses and evaluates `src` to a boolean.
pub fn evaluate_bool(src: &str, ctx: &ContextSnapshot, node_id: &str) -> Result<bool, EngineError> {
    let expr = parse(src).map_err(|message| EngineError::InvalidExpression {
        node_id: node_id.to_owned(),
        message,
    })?;
    expr.evaluate(ctx, node_id).map(|v| is_truthy(&v))
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, String> {
    use std::cmp::Ordering;

    let ordering = || -> Result<Ordering, String> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                a.partial_cmp(&b).ok_or_else(|| "numbers are not comparable".to_string())
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(format!(
                "cannot order {} and {}",
                template::type_name(left),
                template::type_name(right)
            )),
        }
    };

    Ok(match op {
        CompareOp::Eq => loosely_equal(left, right),
        CompareOp::Ne => !loosely_equal(left, right),
        CompareOp::Lt => ordering()? == Ordering::Less,
        CompareOp::Le => ordering()? != Ordering::Greater,
        CompareOp::Gt => ordering()? == Ordering::Greater,
        CompareOp::Ge => ordering()? != Ordering::Less,
        CompareOp::Contains => match (left, right) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::String(haystack), other) => haystack.contains(&other.to_string()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            (other, _) => {
                return Err(format!(
                    "'contains' is not defined for {}",
                    template::type_name(other)
                ))
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkflowExecutionContext;
    use crate::models::{NodeExecutionResult, NodeMetadata, NodeType};
    use serde_json::json;
    use uuid::Uuid;

    fn snapshot() -> std::sync::Arc<ContextSnapshot> {
        let inputs = json!({"threshold": 10, "tier": "gold"});
        let mut ctx = WorkflowExecutionContext::new(Uuid::new_v4(), inputs);
        ctx.record(NodeExecutionResult::succeeded(
            "score",
            NodeType::Tool,
            json!({"value": 12, "tags": ["urgent", "billing"], "label": "needs review"}),
            NodeMetadata::default(),
        ));
        ctx.snapshot()
    }

    fn eval(src: &str) -> bool {
        evaluate_bool(src, &snapshot(), "gate").unwrap()
    }

    #[test]
    fn comparisons() {
        assert!(eval("{{score.value}} > {{inputs.threshold}}"));
        assert!(eval("{{score.value}} >= 12"));
        assert!(!eval("{{score.value}} < 12"));
        assert!(eval("{{inputs.tier}} == 'gold'"));
        assert!(eval("{{inputs.tier}} != \"silver\""));
        assert!(eval("{{score.value}} == 12.0"));
    }

    #[test]
    fn contains_works_on_strings_arrays_and_objects() {
        assert!(eval("{{score.tags}} contains 'urgent'"));
        assert!(eval("{{score.label}} contains \"review\""));
        assert!(eval("{{score}} contains 'tags'"));
        assert!(!eval("{{score.tags}} contains 'sales'"));
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        assert!(eval("!({{score.value}} < 5) && {{inputs.tier}} == 'gold'"));
        assert!(eval("false || {{score.tags}}"));
        assert!(!eval("not true"));
        assert!(eval("(1 > 2) or (2 > 1)"));
    }

    #[test]
    fn truthiness_follows_json() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!({"a": 1})));
        assert!(is_truthy(&json!(-1)));
    }

    #[test]
    fn malformed_expressions_are_invalid() {
        for src in ["", "{{score.value}} >", "(1 == 1", "score.value == 1", "1 == 1 2", "'open"] {
            let err = evaluate_bool(src, &snapshot(), "gate").unwrap_err();
            assert!(matches!(err, EngineError::InvalidExpression { .. }), "{src}: {err:?}");
        }
    }

    #[test]
    fn ordering_mismatched_types_is_invalid() {
        let err = evaluate_bool("{{score.tags}} > 1", &snapshot(), "gate").unwrap_err();
        assert!(matches!(err, EngineError::InvalidExpression { .. }));
    }

    #[test]
    fn missing_paths_are_unresolved_placeholders() {
        let err = evaluate_bool("{{score.nope}} == 1", &snapshot(), "gate").unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedPlaceholder { .. }));
    }
}
