//! Restricted arithmetic evaluator.
//!
//! Accepts only digits, `+ - * / . ( )` and spaces. Numbers are integers
//! until an operation needs a fraction: `10 / 2` is `5`, `7 / 2` is `3.5`.
//! `**` (power) and `//` (floor division) are supported since they are
//! spelled with allowed characters.
//!
//! Integers are 128-bit. A result that overflows `i128` falls back to a
//! float, so `2 ** 200` renders as `1.6069380442589903e+60` rather than
//! the exact integer. Nesting (parentheses, unary signs, exponents) is
//! capped at [`MAX_DEPTH`] levels; deeper input is a calculation error.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use super::ToolHandler;
use crate::config::ToolDefinition;
use crate::error::{BidiError, Result};

const ALLOWED: &str = "0123456789+-*/.() ";
/// Deepest nesting the parser descends into.
pub const MAX_DEPTH: usize = 100;
const DISALLOWED_MESSAGE: &str = "エラー: 許可されていない文字が含まれています";

#[derive(Debug, Error, PartialEq)]
enum CalcError {
    #[error("empty expression")]
    Empty,
    #[error("division by zero")]
    DivisionByZero,
    #[error("zero cannot be raised to a negative power")]
    ZeroToNegativePower,
    #[error("result is not a real number")]
    Complex,
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("unexpected '{token}' at position {position}")]
    Unexpected { token: String, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i128),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Self::Int(i) => i == 0,
            Self::Float(f) => f == 0.0,
        }
    }

    fn checked(
        self,
        rhs: Self,
        int_op: fn(i128, i128) -> Option<i128>,
        float_op: fn(f64, f64) -> f64,
    ) -> Self {
        match (self, rhs) {
            (Self::Int(a), Self::Int(b)) => match int_op(a, b) {
                Some(v) => Self::Int(v),
                None => Self::Float(float_op(a as f64, b as f64)),
            },
            (a, b) => Self::Float(float_op(a.as_f64(), b.as_f64())),
        }
    }

    fn add(self, rhs: Self) -> Self {
        self.checked(rhs, i128::checked_add, |a, b| a + b)
    }

    fn sub(self, rhs: Self) -> Self {
        self.checked(rhs, i128::checked_sub, |a, b| a - b)
    }

    fn mul(self, rhs: Self) -> Self {
        self.checked(rhs, i128::checked_mul, |a, b| a * b)
    }

    fn div(self, rhs: Self) -> std::result::Result<Self, CalcError> {
        if rhs.is_zero() {
            return Err(CalcError::DivisionByZero);
        }
        Ok(match (self, rhs) {
            (Self::Int(a), Self::Int(b)) if a.checked_rem(b) == Some(0) => {
                a.checked_div(b).map(Self::Int).unwrap_or(Self::Float(a as f64 / b as f64))
            }
            (a, b) => Self::Float(a.as_f64() / b.as_f64()),
        })
    }

    fn floor_div(self, rhs: Self) -> std::result::Result<Self, CalcError> {
        if rhs.is_zero() {
            return Err(CalcError::DivisionByZero);
        }
        Ok(match (self, rhs) {
            (Self::Int(a), Self::Int(b)) => match (a.checked_div(b), a.checked_rem(b)) {
                (Some(q), Some(r)) if r != 0 && ((r < 0) != (b < 0)) => Self::Int(q - 1),
                (Some(q), Some(_)) => Self::Int(q),
                _ => Self::Float((a as f64 / b as f64).floor()),
            },
            (a, b) => Self::Float((a.as_f64() / b.as_f64()).floor()),
        })
    }

    fn pow(self, rhs: Self) -> std::result::Result<Self, CalcError> {
        if self.is_zero() && rhs.as_f64() < 0.0 {
            return Err(CalcError::ZeroToNegativePower);
        }
        if let (Self::Int(base), Self::Int(exp)) = (self, rhs) {
            if exp >= 0 {
                if let Some(v) = u32::try_from(exp).ok().and_then(|e| base.checked_pow(e)) {
                    return Ok(Self::Int(v));
                }
            }
        }
        let value = self.as_f64().powf(rhs.as_f64());
        if value.is_nan() {
            return Err(CalcError::Complex);
        }
        Ok(Self::Float(value))
    }

    fn neg(self) -> Self {
        match self {
            Self::Int(i) => i.checked_neg().map(Self::Int).unwrap_or(Self::Float(-(i as f64))),
            Self::Float(f) => Self::Float(-f),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) if v.is_nan() => f.write_str("nan"),
            Self::Float(v) if v.is_infinite() => f.write_str(if v > 0.0 { "inf" } else { "-inf" }),
            Self::Float(v) if v != 0.0 && (v.abs() >= 1e16 || v.abs() < 1e-4) => {
                // Scientific form with a signed, two digit exponent: 1e+16, 2.5e-05.
                let sci = format!("{v:e}");
                match sci.split_once('e') {
                    Some((mantissa, exp)) => {
                        let (sign, digits) = match exp.strip_prefix('-') {
                            Some(d) => ('-', d),
                            None => ('+', exp),
                        };
                        write!(f, "{mantissa}e{sign}{digits:0>2}")
                    }
                    None => f.write_str(&sci),
                }
            }
            Self::Float(v) if v.fract() == 0.0 => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Plus => f.write_str("+"),
            Self::Minus => f.write_str("-"),
            Self::Star => f.write_str("*"),
            Self::DoubleStar => f.write_str("**"),
            Self::Slash => f.write_str("/"),
            Self::DoubleSlash => f.write_str("//"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

fn parse_number(literal: &str) -> std::result::Result<Number, CalcError> {
    let invalid = || CalcError::InvalidNumber(literal.to_string());
    if literal.contains('.') {
        if literal == "." || literal.matches('.').count() > 1 {
            return Err(invalid());
        }
        return literal.parse::<f64>().map(Number::Float).map_err(|_| invalid());
    }
    // Decimal integers may not carry leading zeros, except zero itself.
    if literal.len() > 1 && literal.starts_with('0') && literal.chars().any(|c| c != '0') {
        return Err(invalid());
    }
    match literal.parse::<i128>() {
        Ok(i) => Ok(Number::Int(i)),
        Err(_) => literal.parse::<f64>().map(Number::Float).map_err(|_| invalid()),
    }
}

fn tokenize(expression: &str) -> std::result::Result<Vec<(usize, Token)>, CalcError> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices<'_>> = expression.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        let token = match c {
            ' ' => continue,
            '0'..='9' | '.' => {
                let mut end = pos + c.len_utf8();
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Number(parse_number(&expression[pos..end])?)
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if chars.next_if(|&(_, d)| d == '*').is_some() => Token::DoubleStar,
            '*' => Token::Star,
            '/' if chars.next_if(|&(_, d)| d == '/').is_some() => Token::DoubleSlash,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            other => return Err(CalcError::Unexpected { token: other.to_string(), position: pos }),
        };
        tokens.push((pos, token));
    }
    Ok(tokens)
}

/// Recursive descent over the token list. Precedence, lowest first:
/// `+ -` < `* / //` < unary `+ -` < `**` (right associative).
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

type Parsed = std::result::Result<Number, CalcError>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn bump(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(position: usize, token: &Token) -> CalcError {
        CalcError::Unexpected { token: token.to_string(), position }
    }

    fn parse(mut self) -> Parsed {
        if self.tokens.is_empty() {
            return Err(CalcError::Empty);
        }
        let value = self.expr()?;
        match self.bump() {
            None => Ok(value),
            Some((position, token)) => Err(Self::unexpected(position, &token)),
        }
    }

    fn expr(&mut self) -> Parsed {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value = value.add(self.term()?);
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value = value.sub(self.term()?);
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Parsed {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value = value.mul(self.unary()?);
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value = value.div(self.unary()?)?;
                }
                Some(Token::DoubleSlash) => {
                    self.pos += 1;
                    value = value.floor_div(self.unary()?)?;
                }
                _ => return Ok(value),
            }
        }
    }

    /// Every recursive path passes through here, so this is where depth is
    /// bounded.
    fn unary(&mut self) -> Parsed {
        if self.depth >= MAX_DEPTH {
            return Err(CalcError::TooDeep);
        }
        self.depth += 1;
        let value = self.unary_inner();
        self.depth -= 1;
        value
    }

    fn unary_inner(&mut self) -> Parsed {
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(self.unary()?.neg())
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Parsed {
        let base = self.atom()?;
        if self.peek() == Some(&Token::DoubleStar) {
            self.pos += 1;
            let exponent = self.unary()?;
            return base.pow(exponent);
        }
        Ok(base)
    }

    fn atom(&mut self) -> Parsed {
        match self.bump() {
            Some((_, Token::Number(n))) => Ok(n),
            Some((_, Token::LParen)) => {
                let value = self.expr()?;
                match self.bump() {
                    Some((_, Token::RParen)) => Ok(value),
                    Some((position, token)) => Err(Self::unexpected(position, &token)),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            Some((position, token)) => Err(Self::unexpected(position, &token)),
            None => Err(CalcError::UnexpectedEnd),
        }
    }
}

fn compute(expression: &str) -> Parsed {
    Parser { tokens: tokenize(expression)?, pos: 0, depth: 0 }.parse()
}

/// Evaluate `expression`, never failing.
///
/// Returns `"<expression> = <result>"` with the input echoed verbatim, or a
/// Japanese error message: one for disallowed characters, another
/// (`計算エラー: <cause>`) for anything that fails during evaluation.
pub fn evaluate(expression: &str) -> String {
    if !expression.chars().all(|c| ALLOWED.contains(c)) {
        return DISALLOWED_MESSAGE.to_string();
    }
    match compute(expression) {
        Ok(value) => format!("{expression} = {value}"),
        Err(e) => format!("計算エラー: {e}"),
    }
}

/// `simple_calculator`: evaluates an arithmetic expression.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorTool;

#[async_trait]
impl ToolHandler for CalculatorTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("simple_calculator")
            .with_description("簡単な計算を行います。四則演算に対応しています。")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "計算式（例: \"2 + 3\", \"10 * 5\"）"
                    }
                },
                "required": ["expression"]
            }))
    }

    async fn execute(&self, input: &Value) -> Result<Value> {
        let expression = input
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| BidiError::tool("simple_calculator requires a string 'expression'"))?;
        Ok(Value::String(evaluate(expression)))
    }
}
