//! Recursive-descent parser for workflow expressions
//!
//! Parses expressions like:
//! - `score >= 70`
//! - `intent == 'bug' and priority > 3`
//! - `items | len > 0 ? first(items) : null`
//!
//! Precedence, lowest first: ternary, `or`, `and`, `not`, comparisons,
//! `+ -`, `* / %`, unary minus, postfix (`.field`, `[index]`, `| filter`).

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{tokenize, Spanned, Token};
use crate::error::ExpressionError;
use serde_json::{json, Value};

/// Parser recursion ceiling, independent of the evaluation depth limit
const MAX_PARSE_DEPTH: usize = 128;

/// Parse an expression string into an AST
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExpressionError::syntax(source, "empty expression"));
    }

    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expression()?;

    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn error(&self, message: &str) -> ExpressionError {
        let start = self
            .tokens
            .get(self.pos)
            .map(|s| s.start)
            .unwrap_or(self.source.len());
        let fragment: String = self.source[start..].chars().take(40).collect();
        let fragment = if fragment.is_empty() {
            self.source.to_string()
        } else {
            fragment
        };
        let message = if start >= self.source.len() {
            format!("{} at end of input", message)
        } else {
            format!("{} at offset {}", message, start)
        };
        ExpressionError::syntax(fragment, message)
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let result = self.ternary();
        self.depth -= 1;
        result
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.expression()?;
        self.expect(Token::Colon, "':' in conditional expression")?;
        let otherwise = self.expression()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while matches!(self.peek(), Some(Token::Or) | Some(Token::OrOr)) {
            self.pos += 1;
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not()?;
        while matches!(self.peek(), Some(Token::And) | Some(Token::AndAnd)) {
            self.pos += 1;
            let right = self.not()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some(Token::Not) | Some(Token::Bang)) {
            self.pos += 1;
            self.enter()?;
            let inner = self.not();
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(inner?),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.additive()?;

        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Gte) => BinaryOp::Gte,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Lte) => BinaryOp::Lte,
            Some(Token::In) => BinaryOp::In,
            Some(Token::Contains) => BinaryOp::Contains,
            Some(Token::Not) if self.peek_at(1) == Some(&Token::In) => {
                self.pos += 1;
                BinaryOp::NotIn
            }
            _ => return Ok(left),
        };
        self.pos += 1;

        let right = self.additive()?;
        Ok(binary(op, left, right))
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.unary();
            self.depth -= 1;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(inner?),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    expr = match self.next() {
                        Some(Token::Ident(name)) => Expr::Member(Box::new(expr), name),
                        Some(Token::Int(i)) => {
                            Expr::Index(Box::new(expr), Box::new(Expr::Literal(json!(i))))
                        }
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("expected field name after '.'"));
                        }
                    };
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Token::Pipe) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        Some(Token::Contains) => "contains".to_string(),
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(self.error("expected filter name after '|'"));
                        }
                    };
                    let mut args = vec![expr];
                    if self.eat(&Token::LParen) {
                        args.extend(self.arguments(Token::RParen)?);
                    }
                    expr = Expr::Call { name, args };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = match self.next() {
            Some(t) => t,
            None => return Err(self.error("expected a value")),
        };

        match token {
            Token::Int(i) => Ok(Expr::Literal(json!(i))),
            Token::Float(f) => Ok(Expr::Literal(json!(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments(Token::RParen)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::Array(self.arguments(Token::RBracket)?)),
            Token::LBrace => self.object(),
            _ => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
        }
    }

    /// Comma-separated expressions up to `close`; the opener is already consumed
    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma, "',' or closing bracket")?;
        }
    }

    fn object(&mut self) -> Result<Expr, ExpressionError> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Object(entries));
        }
        loop {
            let key = match self.next() {
                Some(Token::Ident(k)) | Some(Token::Str(k)) => k,
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error("expected object key"));
                }
            };
            self.expect(Token::Colon, "':' after object key")?;
            entries.push((key, self.expression()?));
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Object(entries));
            }
            self.expect(Token::Comma, "',' or '}'")?;
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
