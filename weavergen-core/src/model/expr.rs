//! Conditional-flow expression grammar.
//!
//! Deliberately not Turing-complete:
//!
//! ```text
//! expr := term (('and' | 'or') term)*
//! term := key op literal | 'has' key | '(' expr ')'
//! op   := '=' | '!=' | '<' | '<=' | '>' | '>='
//! ```
//!
//! `and`/`or` share one precedence level and associate left; parentheses
//! group. Comparisons against a missing key evaluate false.

use crate::types::Value;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char as nom_char, multispace0, multispace1};
use nom::combinator::{map, opt, recognize, verify};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Neq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(n) => write!(f, "{n}"),
            Literal::Float(x) => write!(f, "{x:?}"),
            Literal::Str(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Cmp {
        key: String,
        op: CmpOp,
        literal: Literal,
    },
    Has(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse the full input as an expression; trailing garbage is an error.
    pub fn parse(input: &str) -> Result<Expr, String> {
        match expr(input.trim()) {
            Ok(("", e)) => Ok(e),
            Ok((rest, _)) => Err(format!("unexpected trailing input: '{rest}'")),
            Err(e) => Err(format!("syntax error: {e}")),
        }
    }

    /// Evaluate against a key lookup. Missing keys make comparisons false
    /// and `has` false; type mismatches compare false.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> bool {
        match self {
            Expr::And(a, b) => a.eval(lookup) && b.eval(lookup),
            Expr::Or(a, b) => a.eval(lookup) || b.eval(lookup),
            Expr::Has(key) => lookup(key).is_some_and(|v| !matches!(v, Value::Null)),
            Expr::Cmp { key, op, literal } => match lookup(key) {
                None => false,
                Some(value) => compare(&value, *op, literal),
            },
        }
    }
}

fn compare(value: &Value, op: CmpOp, literal: &Literal) -> bool {
    match (op, literal) {
        (CmpOp::Eq, _) => eq(value, literal),
        (CmpOp::Neq, _) => !eq(value, literal),
        // Ordering is defined for numerics only.
        (_, Literal::Int(_) | Literal::Float(_)) => {
            let lhs = match value.as_f64() {
                Some(x) => x,
                None => return false,
            };
            let rhs = match literal {
                Literal::Int(n) => *n as f64,
                Literal::Float(x) => *x,
                _ => return false,
            };
            match op {
                CmpOp::Lt => lhs < rhs,
                CmpOp::Le => lhs <= rhs,
                CmpOp::Gt => lhs > rhs,
                CmpOp::Ge => lhs >= rhs,
                CmpOp::Eq | CmpOp::Neq => unreachable!(),
            }
        }
        _ => false,
    }
}

fn eq(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::Bool(a), Literal::Bool(b)) => a == b,
        (Value::Str(a), Literal::Str(b)) => a == b,
        (_, Literal::Int(_) | Literal::Float(_)) => {
            let rhs = match literal {
                Literal::Int(n) => *n as f64,
                Literal::Float(x) => *x,
                _ => return false,
            };
            value.as_f64() == Some(rhs)
        }
        _ => false,
    }
}

// ─── Grammar ──────────────────────────────────────────────────

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn key(input: &str) -> IResult<&str, String> {
    let ident = recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        opt(take_while1(|c: char| {
            c.is_ascii_alphanumeric() || c == '_' || c == '.'
        })),
    ));
    map(
        verify(ident, |s: &&str| {
            !matches!(*s, "and" | "or" | "has" | "true" | "false")
        }),
        |s: &str| s.to_string(),
    )(input)
}

fn op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        map(tag("!="), |_| CmpOp::Neq),
        map(tag("<="), |_| CmpOp::Le),
        map(tag(">="), |_| CmpOp::Ge),
        map(tag("="), |_| CmpOp::Eq),
        map(tag("<"), |_| CmpOp::Lt),
        map(tag(">"), |_| CmpOp::Gt),
    ))(input)
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(tag("true"), |_| Literal::Bool(true)),
        map(tag("false"), |_| Literal::Bool(false)),
        map(
            delimited(nom_char('\''), take_while1(|c| c != '\''), nom_char('\'')),
            |s: &str| Literal::Str(s.to_string()),
        ),
        map(
            delimited(nom_char('"'), take_while1(|c| c != '"'), nom_char('"')),
            |s: &str| Literal::Str(s.to_string()),
        ),
        number,
    ))(input)
}

fn number(input: &str) -> IResult<&str, Literal> {
    // Prefer an integer literal when the text has no fractional part.
    let (rest, value) = double(input)?;
    let consumed = &input[..input.len() - rest.len()];
    if !consumed.contains('.') && !consumed.contains('e') && !consumed.contains('E') {
        if let Ok(n) = consumed.parse::<i64>() {
            return Ok((rest, Literal::Int(n)));
        }
    }
    Ok((rest, Literal::Float(value)))
}

fn term(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(pair(tag("has"), multispace1), key), Expr::Has),
        delimited(ws(nom_char('(')), expr, ws(nom_char(')'))),
        map(tuple((key, ws(op), literal)), |(key, op, literal)| {
            Expr::Cmp { key, op, literal }
        }),
    ))(input)
}

/// `and` / `or` as a whole word; a longer identifier is not a conjunction.
fn conjunction(input: &str) -> IResult<&str, &str> {
    verify(take_while1(|c: char| c.is_ascii_alphabetic()), |s: &&str| {
        matches!(*s, "and" | "or")
    })(input)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = ws(term)(input)?;
    loop {
        match conjunction(input) {
            Ok((rest, word)) => {
                let (rest, rhs) = ws(term)(rest)?;
                acc = match word {
                    "and" => Expr::And(Box::new(acc), Box::new(rhs)),
                    _ => Expr::Or(Box::new(acc), Box::new(rhs)),
                };
                input = rest;
            }
            Err(_) => return Ok((input, acc)),
        }
    }
}

// Display emits text the parser accepts; right-hand binary operands are
// parenthesized so the left-associative reparse reproduces the tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Cmp { key, op, literal } => write!(f, "{key} {op} {literal}"),
            Expr::Has(key) => write!(f, "has {key}"),
            Expr::And(a, b) => {
                write!(f, "{a} and ")?;
                write_operand(f, b)
            }
            Expr::Or(a, b) => {
                write!(f, "{a} or ")?;
                write_operand(f, b)
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    if matches!(e, Expr::And(..) | Expr::Or(..)) {
        write!(f, "({e})")
    } else {
        write!(f, "{e}")
    }
}
