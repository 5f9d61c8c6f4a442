//! Scalar expressions for group-by keys and aggregate arguments.
//!
//! Supports expressions like:
//! - `region`
//! - `price * quantity`
//! - `(score + bonus) / 2`
//! - `-delta`
//! - `'fixed'`, `42`, `1.5`, `true`, `NULL`
//!
//! Arithmetic follows [`ColumnValue`] semantics: NULL propagates, integers
//! widen to Int64, and any float operand yields Float64.

use crate::column::{ColumnType, ColumnValue};
use crate::error::{Result, ViewError};
use crate::table::{Row, Schema};
use std::fmt;

/// A parsed expression that can be evaluated against a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Reference to a column of the row
    Column(String),
    /// Constant value
    Literal(ColumnValue),
    /// Arithmetic on two sub-expressions
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Unary minus
    Negate(Box<Expr>),
}

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add, // +
    Sub, // -
    Mul, // *
    Div, // /
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

/// Token types for lexing
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Eof,
}

/// Lexer for tokenizing expression strings
struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn read_ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }
        ident
    }

    fn read_number(&mut self) -> Result<Token> {
        let mut num_str = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                num_str.push(c);
                self.advance();
            } else if c == '.' && !is_float {
                is_float = true;
                num_str.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let invalid = || ViewError::Expression(format!("Invalid number literal '{}'", num_str));
        if is_float {
            num_str.parse().map(Token::Float).map_err(|_| invalid())
        } else {
            num_str.parse().map(Token::Int).map_err(|_| invalid())
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token> {
        self.advance(); // opening quote
        let mut s = String::new();

        while let Some(c) = self.advance() {
            if c == quote {
                return Ok(Token::String(s));
            }
            if c == '\\' {
                match self.advance() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(escaped) => s.push(escaped),
                    None => break,
                }
            } else {
                s.push(c);
            }
        }

        Err(ViewError::Expression("Unterminated string".to_string()))
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();

        let c = match self.peek() {
            None => return Ok(Token::Eof),
            Some(c) => c,
        };

        let single = |lexer: &mut Lexer, token: Token| {
            lexer.advance();
            Ok(token)
        };

        match c {
            '(' => single(self, Token::LParen),
            ')' => single(self, Token::RParen),
            '+' => single(self, Token::Plus),
            '-' => single(self, Token::Minus),
            '*' => single(self, Token::Star),
            '/' => single(self, Token::Slash),
            '\'' | '"' => self.read_string(c),
            _ if c.is_ascii_digit() || c == '.' => self.read_number(),
            _ if c.is_alphabetic() || c == '_' => {
                let ident = self.read_ident();
                match ident.to_uppercase().as_str() {
                    "NULL" => Ok(Token::Null),
                    "TRUE" => Ok(Token::Bool(true)),
                    "FALSE" => Ok(Token::Bool(false)),
                    _ => Ok(Token::Ident(ident)),
                }
            }
            _ => Err(ViewError::Expression(format!("Unexpected character: {}", c))),
        }
    }
}

/// Recursive-descent parser: additive > multiplicative > unary > primary.
struct Parser {
    lexer: Lexer,
    current: Token,
}

impl Parser {
    fn new(input: &str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.current == Token::Minus {
            self.advance()?;
            let inner = self.parse_unary()?;
            return Ok(match inner {
                Expr::Literal(ColumnValue::Int64(v)) => Expr::Literal(ColumnValue::Int64(-v)),
                Expr::Literal(ColumnValue::Float64(v)) => Expr::Literal(ColumnValue::Float64(-v)),
                other => Expr::Negate(Box::new(other)),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current.clone();
        let expr = match token {
            Token::LParen => {
                self.advance()?;
                let inner = self.parse_additive()?;
                if self.current != Token::RParen {
                    return Err(ViewError::Expression(format!("Expected ')', got {:?}", self.current)));
                }
                inner
            }
            Token::Ident(name) => Expr::Column(name),
            Token::Int(v) => Expr::Literal(ColumnValue::Int64(v)),
            Token::Float(v) => Expr::Literal(ColumnValue::Float64(v)),
            Token::String(s) => Expr::Literal(ColumnValue::String(s)),
            Token::Bool(b) => Expr::Literal(ColumnValue::Bool(b)),
            Token::Null => Expr::Literal(ColumnValue::Null),
            other => return Err(ViewError::Expression(format!("Unexpected token {:?}", other))),
        };
        self.advance()?;
        Ok(expr)
    }
}

/// Parse an expression string into an Expr AST.
pub fn parse_expr(input: &str) -> Result<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_additive()?;

    if parser.current != Token::Eof {
        return Err(ViewError::Expression(format!(
            "Unexpected token after expression: {:?}",
            parser.current
        )));
    }

    Ok(expr)
}

impl Expr {
    pub fn column(name: &str) -> Self {
        Expr::Column(name.to_string())
    }

    /// Evaluate against a row image. A referenced column missing from the
    /// row is an error, not NULL.
    pub fn eval(&self, row: &Row) -> Result<ColumnValue> {
        match self {
            Expr::Column(name) => row
                .get(name)
                .cloned()
                .ok_or_else(|| ViewError::Expression(format!("Column '{}' not found in row", name))),
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Binary { op, left, right } => {
                let lhs = left.eval(row)?;
                let rhs = right.eval(row)?;
                match op {
                    BinaryOp::Add => lhs.add(&rhs),
                    BinaryOp::Sub => lhs.sub(&rhs),
                    BinaryOp::Mul => lhs.mul(&rhs),
                    BinaryOp::Div => lhs.div(&rhs),
                }
            }
            Expr::Negate(inner) => inner.eval(row)?.neg(),
        }
    }

    /// All column names referenced, sorted and deduplicated.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        self.collect_columns(&mut columns);
        columns.sort();
        columns.dedup();
        columns
    }

    fn collect_columns(&self, columns: &mut Vec<String>) {
        match self {
            Expr::Column(name) => columns.push(name.clone()),
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_columns(columns);
                right.collect_columns(columns);
            }
            Expr::Negate(inner) => inner.collect_columns(columns),
        }
    }

    /// Static result type over `schema`, or None if it cannot be determined
    /// (unknown column, NULL literal, arithmetic on non-numbers).
    pub fn infer_type(&self, schema: &Schema) -> Option<ColumnType> {
        match self {
            Expr::Column(name) => schema.get_column_type(name),
            Expr::Literal(value) => value.column_type(),
            Expr::Binary { left, right, .. } => {
                numeric_result(left.infer_type(schema)?, right.infer_type(schema)?)
            }
            Expr::Negate(inner) => numeric_result(ColumnType::Int64, inner.infer_type(schema)?),
        }
    }
}

fn numeric_result(lhs: ColumnType, rhs: ColumnType) -> Option<ColumnType> {
    use ColumnType::*;
    match (lhs, rhs) {
        (Int32 | Int64, Int32 | Int64) => Some(Int64),
        (Int32 | Int64 | Float32 | Float64, Int32 | Int64 | Float32 | Float64) => Some(Float64),
        _ => None,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{}", name),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Negate(inner) => write!(f, "-{}", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_row() -> Row {
        let mut row = HashMap::new();
        row.insert("qty".to_string(), ColumnValue::Int32(3));
        row.insert("price".to_string(), ColumnValue::Float64(2.5));
        row.insert("region".to_string(), ColumnValue::String("east".to_string()));
        row.insert("missing".to_string(), ColumnValue::Null);
        row
    }

    #[test]
    fn test_column_and_literal() {
        let row = make_row();
        assert_eq!(parse_expr("region").unwrap().eval(&row).unwrap().as_string(), Some("east"));
        assert_eq!(parse_expr("'west'").unwrap().eval(&row).unwrap().as_string(), Some("west"));
        assert_eq!(parse_expr("-4").unwrap(), Expr::Literal(ColumnValue::Int64(-4)));
    }

    #[test]
    fn test_precedence() {
        let row = make_row();
        let expr = parse_expr("qty + 2 * 3").unwrap();
        assert_eq!(expr.eval(&row).unwrap(), ColumnValue::Int64(9));

        let expr = parse_expr("(qty + 2) * 3").unwrap();
        assert_eq!(expr.eval(&row).unwrap(), ColumnValue::Int64(15));

        let expr = parse_expr("qty * price").unwrap();
        assert_eq!(expr.eval(&row).unwrap(), ColumnValue::Float64(7.5));
        assert_eq!(expr.to_string(), "(qty * price)");
    }

    #[test]
    fn test_null_propagation_and_errors() {
        let row = make_row();
        assert!(parse_expr("missing + 1").unwrap().eval(&row).unwrap().is_null());
        assert!(parse_expr("nope").unwrap().eval(&row).is_err());
        assert!(parse_expr("qty / 0").unwrap().eval(&row).is_err());
        assert!(parse_expr("qty +").is_err());
        assert!(parse_expr("(qty").is_err());
        assert!(parse_expr("qty qty").is_err());
    }

    #[test]
    fn test_columns_and_types() {
        let expr = parse_expr("-(price * qty) + qty").unwrap();
        assert_eq!(expr.columns(), vec!["price".to_string(), "qty".to_string()]);

        let schema = Schema::new(vec![
            ("qty".to_string(), ColumnType::Int32, false),
            ("price".to_string(), ColumnType::Float64, false),
            ("region".to_string(), ColumnType::String, false),
        ]);
        assert_eq!(parse_expr("qty").unwrap().infer_type(&schema), Some(ColumnType::Int32));
        assert_eq!(parse_expr("qty * 2").unwrap().infer_type(&schema), Some(ColumnType::Int64));
        assert_eq!(expr.infer_type(&schema), Some(ColumnType::Float64));
        assert_eq!(parse_expr("region + 1").unwrap().infer_type(&schema), None);
    }
}
