//! Expression language used inside `{{ }}`, `if=` and `for=`.
//!
//! The grammar is a small JavaScript-flavoured subset: JSON literals plus
//! single-quoted strings, unquoted object keys and trailing commas, variable
//! paths (`user.name`, `items[0]`), arithmetic, comparison and boolean
//! operators. Values are `serde_json::Value` throughout.

use crate::error::{PomlError, Result};
use serde_json::{Map, Number, Value};

/// Resolves free variables during evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// Parses a complete expression; trailing input is an error.
///
/// # Errors
///
/// Returns `PomlError::Expression` describing the first syntax problem.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let mut parser = Parser::new(source, 0);
    let expr = parser.expression()?;
    parser.skip_ws();
    if parser.pos < source.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

/// Parses the longest expression starting at byte `start` of `source` and
/// returns it with the byte offset just past it (whitespace skipped).
///
/// # Errors
///
/// Returns `PomlError::Expression` describing the first syntax problem.
pub fn parse_prefix(source: &str, start: usize) -> Result<(Expr, usize)> {
    let mut parser = Parser::new(source, start);
    let expr = parser.expression()?;
    parser.skip_ws();
    Ok((expr, parser.pos))
}

/// JavaScript truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Text form used when a value is interpolated into surrounding text.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_value(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

impl Expr {
    /// Evaluates the expression against `scope`.
    ///
    /// # Errors
    ///
    /// - `PomlError::UndefinedVariable` for names missing from `scope`.
    /// - `PomlError::Expression` for type errors such as arithmetic on objects.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Variable(name) => {
                scope
                    .lookup(name)
                    .ok_or_else(|| PomlError::UndefinedVariable { name: name.clone() })
            }
            Expr::Member(target, key) => {
                let target = target.evaluate(scope)?;
                Ok(member(&target, key))
            }
            Expr::Index(target, index) => {
                let target = target.evaluate(scope)?;
                let index = index.evaluate(scope)?;
                Ok(match (&target, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_u64()
                        .and_then(|i| items.get(i as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    (_, Value::String(key)) => member(&target, key),
                    _ => Value::Null,
                })
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| item.evaluate(scope))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.evaluate(scope)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary(op, operand) => {
                let value = operand.evaluate(scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                    UnaryOp::Neg => as_number(&value)
                        .map(|n| number_value(-n))
                        .ok_or_else(|| type_error("cannot negate a non-numeric value")),
                }
            }
            Expr::Binary(op, left, right) => evaluate_binary(*op, left, right, scope),
        }
    }
}

fn member(target: &Value, key: &str) -> Value {
    match target {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        Value::Array(items) if key == "length" => Value::from(items.len()),
        Value::String(s) if key == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn type_error(message: &str) -> PomlError {
    PomlError::Expression {
        expression: String::new(),
        position: 0,
        message: message.to_string(),
    }
}

fn evaluate_binary(op: BinaryOp, left: &Expr, right: &Expr, scope: &dyn Scope) -> Result<Value> {
    // Short-circuit operators return the deciding operand, as in JavaScript
    match op {
        BinaryOp::And => {
            let l = left.evaluate(scope)?;
            return if is_truthy(&l) { right.evaluate(scope) } else { Ok(l) };
        }
        BinaryOp::Or => {
            let l = left.evaluate(scope)?;
            return if is_truthy(&l) { Ok(l) } else { right.evaluate(scope) };
        }
        _ => {}
    }

    let l = left.evaluate(scope)?;
    let r = right.evaluate(scope)?;
    match op {
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Ok(Value::String(display_value(&l) + &display_value(&r)))
            } else {
                arithmetic(&l, &r, |a, b| a + b)
            }
        }
        BinaryOp::Sub => arithmetic(&l, &r, |a, b| a - b),
        BinaryOp::Mul => arithmetic(&l, &r, |a, b| a * b),
        BinaryOp::Div => arithmetic(&l, &r, |a, b| a / b),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => match (as_number(&l), as_number(&r)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let result = ordering.is_some_and(|o| match op {
                BinaryOp::Lt => o.is_lt(),
                BinaryOp::LtEq => o.is_le(),
                BinaryOp::Gt => o.is_gt(),
                _ => o.is_ge(),
            });
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn arithmetic(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => Ok(number_value(f(a, b))),
        _ => Err(type_error("arithmetic on non-numeric values")),
    }
}

/// Deepest nesting of groups, literals, indexes and prefix operators.
pub const MAX_NESTING: usize = 64;

struct Parser<'a> {
    source: &'a str,
    pos: usize,
    start: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, start: usize) -> Self {
        Self {
            source,
            pos: start,
            start,
            depth: 0,
        }
    }

    fn error(&self, message: &str) -> PomlError {
        PomlError::Expression {
            expression: self.source[self.start..].trim().to_string(),
            position: self.pos - self.start,
            message: message.to_string(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.source.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{token}'")))
        }
    }

    fn deepen(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.deepen()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expression(&mut self) -> Result<Expr> {
        self.nested(Self::or)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        let base = self.depth;
        while self.eat("||") {
            self.deepen()?;
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        let base = self.depth;
        while self.eat("&&") {
            self.deepen()?;
            let right = self.equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.comparison()?;
        let base = self.depth;
        loop {
            let op = if self.eat("===") || self.eat("==") {
                BinaryOp::Eq
            } else if self.eat("!==") || self.eat("!=") {
                BinaryOp::NotEq
            } else {
                break;
            };
            self.deepen()?;
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        let base = self.depth;
        loop {
            let op = if self.eat("<=") {
                BinaryOp::LtEq
            } else if self.eat(">=") {
                BinaryOp::GtEq
            } else if self.eat("<") {
                BinaryOp::Lt
            } else if self.eat(">") {
                BinaryOp::Gt
            } else {
                break;
            };
            self.deepen()?;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        let base = self.depth;
        loop {
            let op = if self.eat("+") {
                BinaryOp::Add
            } else if self.eat("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            self.deepen()?;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        let base = self.depth;
        loop {
            let op = if self.eat("*") {
                BinaryOp::Mul
            } else if self.eat("/") {
                BinaryOp::Div
            } else {
                break;
            };
            self.deepen()?;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        self.skip_ws();
        // `!=` belongs to equality, never to a prefix operator
        if self.rest().starts_with('!') && !self.rest().starts_with("!=") {
            self.pos += 1;
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        if self.eat("-") {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        let base = self.depth;
        loop {
            self.skip_ws();
            if self.rest().starts_with('.') {
                self.deepen()?;
                self.pos += 1;
                self.skip_ws();
                let name = self
                    .identifier()
                    .ok_or_else(|| self.error("expected property name after '.'"))?;
                expr = Expr::Member(Box::new(expr), name);
            } else if self.rest().starts_with('[') {
                self.deepen()?;
                self.pos += 1;
                let index = self.expression()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                self.depth = base;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of expression")),
            Some('(') => {
                self.pos += 1;
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    if self.eat("]") {
                        break;
                    }
                    items.push(self.expression()?);
                    if !self.eat(",") {
                        self.expect("]")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Some('{') => {
                self.pos += 1;
                let mut entries = Vec::new();
                loop {
                    if self.eat("}") {
                        break;
                    }
                    self.skip_ws();
                    let key = match self.peek() {
                        Some(q @ ('"' | '\'')) => self.string(q)?,
                        _ => self
                            .identifier()
                            .or_else(|| self.number_text().map(str::to_string))
                            .ok_or_else(|| self.error("expected object key"))?,
                    };
                    self.expect(":")?;
                    entries.push((key, self.expression()?));
                    if !self.eat(",") {
                        self.expect("}")?;
                        break;
                    }
                }
                Ok(Expr::Object(entries))
            }
            Some(q @ ('"' | '\'')) => Ok(Expr::Literal(Value::String(self.string(q)?))),
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let text = self
                    .number_text()
                    .ok_or_else(|| self.error("invalid number"))?;
                parse_number(text)
                    .map(Expr::Literal)
                    .ok_or_else(|| self.error("invalid number"))
            }
            Some(_) => {
                let ident = self
                    .identifier()
                    .ok_or_else(|| self.error("unexpected character"))?;
                Ok(match ident.as_str() {
                    "true" => Expr::Literal(Value::Bool(true)),
                    "false" => Expr::Literal(Value::Bool(false)),
                    "null" | "undefined" => Expr::Literal(Value::Null),
                    _ => Expr::Variable(ident),
                })
            }
        }
    }

    fn identifier(&mut self) -> Option<String> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, c)) if c.is_alphabetic() || c == '_' || c == '$' => {}
            _ => return None,
        }
        let end = chars
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '$'))
            .map_or(rest.len(), |(i, _)| i);
        self.pos += end;
        Some(rest[..end].to_string())
    }

    fn number_text(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let mut end = 0;
        let mut seen_exp = false;
        while end < bytes.len() {
            let b = bytes[end];
            let is_sign_after_exp =
                (b == b'+' || b == b'-') && end > 0 && matches!(bytes[end - 1], b'e' | b'E');
            if b.is_ascii_digit() || b == b'.' || is_sign_after_exp {
                end += 1;
            } else if (b == b'e' || b == b'E') && !seen_exp && end > 0 {
                seen_exp = true;
                end += 1;
            } else {
                break;
            }
        }
        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }

    fn string(&mut self, quote: char) -> Result<String> {
        self.pos += quote.len_utf8();
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                c if c == quote => {
                    self.pos += i + c.len_utf8();
                    return Ok(out);
                }
                '\\' => {
                    let Some((_, escaped)) = chars.next() else {
                        break;
                    };
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'u' => {
                            let hex: String = chars.by_ref().take(4).map(|(_, h)| h).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid unicode escape"))?;
                            out.push(code);
                        }
                        other => out.push(other),
                    }
                }
                c => out.push(c),
            }
        }
        self.pos = self.source.len();
        Err(self.error("unterminated string literal"))
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if !text.contains(['.', 'e', 'E'])
        && let Ok(i) = text.parse::<i64>()
    {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}
