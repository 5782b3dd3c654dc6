//! Allow-listed arithmetic expression evaluator for custom regime scoring.
//!
//! Supports numbers, the named macro indicators as variables, `+ - * /`,
//! parentheses, comparisons (yielding 1 or 0), and the functions `min`,
//! `max`, `abs`, `if(cond, a, b)`. Input length and nesting depth are
//! bounded so an operator-supplied expression cannot stall a tick.

use std::collections::HashMap;
use thiserror::Error;

const MAX_LEN: usize = 512;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("expression exceeds {MAX_LEN} characters")]
    TooLong,
    #[error("expression nesting exceeds depth {MAX_DEPTH}")]
    TooDeep,
    #[error("unexpected character '{0}'")]
    BadChar(char),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{0}' called with wrong number of arguments")]
    BadArity(String),
    #[error("expression produced a non-finite value")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(num.clone()))?;
                tokens.push(Token::Number(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(ExprError::BadChar('='));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    return Err(ExprError::BadChar('!'));
                }
            }
            other => return Err(ExprError::BadChar(other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a HashMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExprError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(format!("{token:?}")))
        }
    }

    fn comparison(&mut self, depth: usize) -> Result<f64, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        let left = self.additive(depth + 1)?;
        let op = match self.peek() {
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            Some(Token::EqEq) => Token::EqEq,
            Some(Token::Ne) => Token::Ne,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive(depth + 1)?;
        let result = match op {
            Token::Lt => left < right,
            Token::Le => left <= right,
            Token::Gt => left > right,
            Token::Ge => left >= right,
            Token::EqEq => left == right,
            Token::Ne => left != right,
            _ => unreachable!(),
        };
        Ok(if result { 1.0 } else { 0.0 })
    }

    fn additive(&mut self, depth: usize) -> Result<f64, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        let mut value = self.multiplicative(depth + 1)?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.multiplicative(depth + 1)?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.multiplicative(depth + 1)?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn multiplicative(&mut self, depth: usize) -> Result<f64, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        let mut value = self.unary(depth + 1)?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value *= self.unary(depth + 1)?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value /= self.unary(depth + 1)?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self, depth: usize) -> Result<f64, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(-self.unary(depth + 1)?);
        }
        self.primary(depth + 1)
    }

    fn primary(&mut self, depth: usize) -> Result<f64, ExprError> {
        if depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        match self.next()? {
            Token::Number(n) => Ok(n),
            Token::LParen => {
                let value = self.comparison(depth + 1)?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.call(&name, depth + 1)
                } else {
                    self.vars
                        .get(&name)
                        .copied()
                        .ok_or(ExprError::UnknownVariable(name))
                }
            }
            other => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
        }
    }

    fn call(&mut self, name: &str, depth: usize) -> Result<f64, ExprError> {
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.comparison(depth + 1)?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        match (name, args.as_slice()) {
            ("min", [a, b]) => Ok(a.min(*b)),
            ("max", [a, b]) => Ok(a.max(*b)),
            ("abs", [a]) => Ok(a.abs()),
            ("if", [cond, a, b]) => Ok(if *cond != 0.0 { *a } else { *b }),
            ("min" | "max" | "abs" | "if", _) => Err(ExprError::BadArity(name.to_string())),
            _ => Err(ExprError::UnknownFunction(name.to_string())),
        }
    }
}

/// Evaluate an expression against the given variable bindings.
pub fn evaluate(input: &str, vars: &HashMap<String, f64>) -> Result<f64, ExprError> {
    if input.len() > MAX_LEN {
        return Err(ExprError::TooLong);
    }
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::UnexpectedEnd);
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        vars,
    };
    let value = parser.comparison(0)?;
    if parser.pos != tokens.len() {
        return Err(ExprError::UnexpectedToken(format!(
            "{:?}",
            tokens[parser.pos]
        )));
    }
    if !value.is_finite() {
        return Err(ExprError::NonFinite);
    }
    Ok(value)
}
