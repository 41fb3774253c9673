//! Sandboxed arithmetic expressions in the curve parameter `t`.
//!
//! The grammar is fixed: numeric literals, the variable `t`, the constants
//! `pi` and `e`, the functions `sin cos tan sqrt exp abs log`, unary `+`/`-`,
//! binary `+ - * /` and exponentiation (`**`, right associative). Nesting is
//! limited to [`MAX_DEPTH`] levels.
//!
//! Parsed expressions are kept as an [`Expr`] tree. Frame transforms are built
//! by composing trees with the arithmetic operators, so numeric constants keep
//! full `f64` precision and are never round-tripped through text. Trees render
//! back to source with [`Display`](std::fmt::Display), which is also their
//! serialized form.

use crate::error::ExprError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// Functions callable from an expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Sqrt,
    Exp,
    Abs,
    Log,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "sqrt" => Self::Sqrt,
            "exp" => Self::Exp,
            "abs" => Self::Abs,
            "log" => Self::Log,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Abs => "abs",
            Self::Log => "log",
        }
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Sqrt => x.sqrt(),
            Self::Exp => x.exp(),
            Self::Abs => x.abs(),
            Self::Log => x.ln(),
        }
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Pow => "**",
        }
    }
}

/// A parsed expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Num(f64),
    /// The curve parameter `t`.
    Var,
    Pi,
    E,
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
}

impl Expr {
    /// Parses `source` into a tree, rejecting anything outside the grammar.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            nesting: 0,
        };
        let (expr, _) = parser.expression()?;
        match parser.peek() {
            None => Ok(expr),
            Some((tok, offset)) => Err(ExprError::UnexpectedToken {
                found: tok.describe(),
                offset,
            }),
        }
    }

    /// A numeric constant.
    pub fn num(value: f64) -> Self {
        Self::Num(value)
    }

    /// The parameter `t`.
    pub fn t() -> Self {
        Self::Var
    }

    /// Evaluates the tree at `t`. Any NaN or infinity is an error.
    pub fn eval(&self, t: f64) -> Result<f64, ExprError> {
        let value = self.eval_raw(t);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExprError::NonFinite { t })
        }
    }

    fn eval_raw(&self, t: f64) -> f64 {
        match self {
            Self::Num(v) => *v,
            Self::Var => t,
            Self::Pi => std::f64::consts::PI,
            Self::E => std::f64::consts::E,
            Self::Neg(inner) => -inner.eval_raw(t),
            Self::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval_raw(t), rhs.eval_raw(t));
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Pow => a.powf(b),
                }
            }
            Self::Call(func, arg) => func.apply(arg.eval_raw(t)),
        }
    }

    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs))
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // `{}` on f64 is the shortest representation that parses back exactly.
            Self::Num(v) if v.is_sign_negative() => write!(f, "({v})"),
            Self::Num(v) => write!(f, "{v}"),
            Self::Var => f.write_str("t"),
            Self::Pi => f.write_str("pi"),
            Self::E => f.write_str("e"),
            Self::Neg(inner) => write!(f, "(-{inner})"),
            Self::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Self::Call(func, arg) => write!(f, "{}({arg})", func.name()),
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Expr::parse(&source).map_err(serde::de::Error::custom)
    }
}

// --- Tokenizer ---

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Pow,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Num(v) => format!("number {v}"),
            Self::Ident(name) => format!("identifier '{name}'"),
            Self::Plus => "'+'".into(),
            Self::Minus => "'-'".into(),
            Self::Star => "'*'".into(),
            Self::Slash => "'/'".into(),
            Self::Pow => "'**'".into(),
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let token = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' if bytes.get(i + 1) == Some(&b'*') => {
                i += 1;
                Token::Pow
            }
            b'*' => Token::Star,
            b'/' => Token::Slash,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'0'..=b'9' | b'.' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                // Exponent only if digits follow, so `2e` stays a parse error rather than `2*e`.
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        while j < bytes.len() && bytes[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text = &source[start..i];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.to_string()))?;
                tokens.push((Token::Num(value), start));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push((Token::Ident(source[start..i].to_string()), start));
                continue;
            }
            _ => {
                let found = source[start..].chars().next().unwrap_or('?');
                return Err(ExprError::UnexpectedChar {
                    found,
                    offset: start,
                });
            }
        };
        tokens.push((token, start));
        i += 1;
    }

    Ok(tokens)
}

// --- Parser ---
//
// expression := term (('+' | '-') term)*
// term       := unary (('*' | '/') unary)*
// unary      := ('+' | '-') unary | power
// power      := atom ('**' unary)?
// atom       := number | ident | ident '(' expression ')' | '(' expression ')'
//
// Every parse function returns the height of the tree it built. Both the
// parser's own recursion and the tree height are capped at `MAX_DEPTH`, so
// neither parsing nor the recursive `eval`/`Display`/drop of the result can
// exhaust the stack.

/// Deepest nesting, and tallest tree, an expression may have.
pub const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.pos).map(|(tok, off)| (tok, *off))
    }

    fn next(&mut self) -> Result<(Token, usize), ExprError> {
        let item = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(item)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if matches!(self.peek(), Some((tok, _)) if tok == expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        let (tok, offset) = self.next()?;
        if tok == expected {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken {
                found: tok.describe(),
                offset,
            })
        }
    }

    /// Height of a node whose tallest child is `child`.
    fn grow(child: usize) -> Result<usize, ExprError> {
        let height = child + 1;
        if height > MAX_DEPTH {
            return Err(ExprError::TooDeep { limit: MAX_DEPTH });
        }
        Ok(height)
    }

    fn expression(&mut self) -> Result<(Expr, usize), ExprError> {
        let (mut lhs, mut height) = self.term()?;
        loop {
            let op = if self.eat(&Token::Plus) {
                BinOp::Add
            } else if self.eat(&Token::Minus) {
                BinOp::Sub
            } else {
                return Ok((lhs, height));
            };
            let (rhs, rhs_height) = self.term()?;
            height = Self::grow(height.max(rhs_height))?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<(Expr, usize), ExprError> {
        let (mut lhs, mut height) = self.unary()?;
        loop {
            let op = if self.eat(&Token::Star) {
                BinOp::Mul
            } else if self.eat(&Token::Slash) {
                BinOp::Div
            } else {
                return Ok((lhs, height));
            };
            let (rhs, rhs_height) = self.unary()?;
            height = Self::grow(height.max(rhs_height))?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    /// All recursion passes through here, so this is where nesting is counted.
    fn unary(&mut self) -> Result<(Expr, usize), ExprError> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(ExprError::TooDeep { limit: MAX_DEPTH });
        }
        let parsed = self.unary_inner();
        self.nesting -= 1;
        parsed
    }

    fn unary_inner(&mut self) -> Result<(Expr, usize), ExprError> {
        if self.eat(&Token::Minus) {
            let (inner, height) = self.unary()?;
            return Ok((-inner, Self::grow(height)?));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<(Expr, usize), ExprError> {
        let (base, base_height) = self.atom()?;
        if self.eat(&Token::Pow) {
            // -2**2 == -(2**2) and 2**-1 == 0.5, as in the usual math grammars.
            let (exponent, exp_height) = self.unary()?;
            let height = Self::grow(base_height.max(exp_height))?;
            return Ok((Expr::binary(BinOp::Pow, base, exponent), height));
        }
        Ok((base, base_height))
    }

    fn atom(&mut self) -> Result<(Expr, usize), ExprError> {
        let (tok, offset) = self.next()?;
        match tok {
            Token::Num(v) => Ok((Expr::Num(v), 1)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "t" => Ok((Expr::Var, 1)),
                "pi" => Ok((Expr::Pi, 1)),
                "e" => Ok((Expr::E, 1)),
                _ => {
                    let func = Func::from_name(&name)
                        .ok_or_else(|| ExprError::UnknownIdentifier(name.clone()))?;
                    self.expect(Token::LParen)?;
                    let (arg, height) = self.expression()?;
                    self.expect(Token::RParen)?;
                    Ok((Expr::Call(func, Box::new(arg)), Self::grow(height)?))
                }
            },
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, t: f64) -> f64 {
        Expr::parse(src).unwrap().eval(t).unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", 0.0), 7.0);
        assert_eq!(eval("(1 + 2) * 3", 0.0), 9.0);
        assert_eq!(eval("2 ** 3 ** 2", 0.0), 512.0);
        assert_eq!(eval("-2 ** 2", 0.0), -4.0);
        assert_eq!(eval("2 ** -1", 0.0), 0.5);
        assert_eq!(eval("8 / 4 / 2", 0.0), 1.0);
        assert_eq!(eval("1 - 2 - 3", 0.0), -4.0);
    }

    #[test]
    fn functions_constants_and_parameter() {
        assert!((eval("0.3*cos(t) + 0.5", 0.0) - 0.8).abs() < 1e-12);
        assert!((eval("sin(pi/2)", 0.0) - 1.0).abs() < 1e-12);
        assert!((eval("log(e)", 0.0) - 1.0).abs() < 1e-12);
        assert_eq!(eval("abs(-t) + sqrt(16)", 3.0), 7.0);
        assert_eq!(eval("-(t - 1)**2", 1.0), 0.0);
        assert!((eval("1 - exp(-5*t)", 0.0)).abs() < 1e-12);
        assert_eq!(eval("1.5e2 + .5", 0.0), 150.5);
    }

    #[test]
    fn rejects_identifiers_outside_the_sandbox() {
        assert_eq!(
            Expr::parse("__import__(t)"),
            Err(ExprError::UnknownIdentifier("__import__".into()))
        );
        assert_eq!(
            Expr::parse("atan2(t)"),
            Err(ExprError::UnknownIdentifier("atan2".into()))
        );
        assert!(Expr::parse("x + 1").is_err());
        assert!(Expr::parse("2e").is_err());
        assert!(Expr::parse("sin t").is_err());
        assert!(matches!(
            Expr::parse("2 ^ 3"),
            Err(ExprError::UnexpectedChar { found: '^', .. })
        ));
        assert!(Expr::parse("(1 + 2").is_err());
        assert!(Expr::parse("1 + 2)").is_err());
        assert_eq!(Expr::parse("   "), Err(ExprError::Empty));
        assert!(matches!(
            Expr::parse("t; 1"),
            Err(ExprError::UnexpectedChar { found: ';', .. })
        ));
    }

    #[test]
    fn deep_nesting_is_an_error_not_a_crash() {
        let too_deep = Err(ExprError::TooDeep { limit: MAX_DEPTH });
        assert_eq!(Expr::parse(&format!("{}t", "-".repeat(200_000))), too_deep);
        let parens = format!("{}t{}", "(".repeat(50_000), ")".repeat(50_000));
        assert_eq!(Expr::parse(&parens), too_deep);
        let chain = format!("t{}", " + t".repeat(100_000));
        assert_eq!(Expr::parse(&chain), too_deep);
        let calls = format!("{}t{}", "sin(".repeat(1_000), ")".repeat(1_000));
        assert_eq!(Expr::parse(&calls), too_deep);

        // Redundant parentheses and unary plus add no height.
        let shallow = format!("{}t{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval(&shallow, 2.0), 2.0);
        let chain = format!("t{}", " + t".repeat(200));
        assert_eq!(eval(&chain, 1.0), 201.0);
    }

    #[test]
    fn non_finite_results_are_errors() {
        let sqrt = Expr::parse("sqrt(t)").unwrap();
        assert_eq!(sqrt.eval(-1.0), Err(ExprError::NonFinite { t: -1.0 }));
        let div = Expr::parse("1 / t").unwrap();
        assert!(div.eval(0.0).is_err());
        assert_eq!(div.eval(4.0), Ok(0.25));
    }

    #[test]
    fn display_parses_back_to_the_same_values() {
        let composed = Expr::num(-0.123456789012345) * (Expr::parse("1 - sin(t)").unwrap()
            - Expr::num(1e-7))
            + -Expr::num(2.0) * Expr::t();
        let text = composed.to_string();
        assert!(!text.contains("NaN") && !text.contains("inf"));
        let reparsed = Expr::parse(&text).unwrap();
        for t in [0.0, 0.5, 1.7, -3.0] {
            assert_eq!(reparsed.eval(t), composed.eval(t));
        }
    }

    #[test]
    fn serde_uses_source_text() {
        let expr = Expr::parse("2*t").unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        assert_eq!(json, "\"(2 * t)\"");
        let back: Expr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
        assert!(serde_json::from_str::<Expr>("\"os(t)\"").is_err());
    }
}
