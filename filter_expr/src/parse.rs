//! The expression grammar, smallest productions first:
//!
//! ```text
//! expression := or_expr
//! or_expr    := and_expr ( "||" and_expr )*
//! and_expr   := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := operand ( cmp_op operand )?
//! operand    := literal | field_ref | "(" expression ")"
//! cmp_op     := "==" | "!=" | "<=" | ">=" | "<" | ">"
//! literal    := number | string | "true" | "false" | "null"
//! field_ref  := ident ( "." ident )*
//! ```

use crate::{BinaryOperator, Expr, Literal};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, digit0, digit1, multispace0};
use nom::combinator::{all_consuming, map, opt, recognize, value};
use nom::multi::{fold_many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, separated_pair, tuple};
use nom::IResult;

/// Parses a complete expression, requiring all input be consumed.
pub(crate) fn parse(input: &str) -> Result<Expr, String> {
    match all_consuming(delimited(multispace0, expression, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            Err(format!("parse error near {:?}", truncate(e.input)))
        }
        Err(nom::Err::Incomplete(_)) => Err("incomplete expression".to_string()),
    }
}

fn truncate(input: &str) -> &str {
    &input[..input.len().min(24)]
}

fn expression(i: &str) -> IResult<&str, Expr> {
    or_expr(i)
}

fn or_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = and_expr(i)?;
    fold_many0(
        preceded(ws(tag("||")), and_expr),
        move || first.clone(),
        |lhs, rhs| Expr::Binary {
            lhs: Box::new(lhs),
            op: BinaryOperator::Or,
            rhs: Box::new(rhs),
        },
    )(i)
}

fn and_expr(i: &str) -> IResult<&str, Expr> {
    let (i, first) = unary(i)?;
    fold_many0(
        preceded(ws(tag("&&")), unary),
        move || first.clone(),
        |lhs, rhs| Expr::Binary {
            lhs: Box::new(lhs),
            op: BinaryOperator::And,
            rhs: Box::new(rhs),
        },
    )(i)
}

fn unary(i: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), unary), |e| Expr::Not(Box::new(e))),
        comparison,
    ))(i)
}

fn comparison(i: &str) -> IResult<&str, Expr> {
    let (i, lhs) = operand(i)?;
    let (i, tail) = opt(pair(ws(comparison_operator), operand))(i)?;
    Ok((
        i,
        match tail {
            Some((op, rhs)) => Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            },
            None => lhs,
        },
    ))
}

fn comparison_operator(i: &str) -> IResult<&str, BinaryOperator> {
    // Two-character operators first so `<` does not shadow `<=`.
    alt((
        value(BinaryOperator::Eq, tag("==")),
        value(BinaryOperator::NotEq, tag("!=")),
        value(BinaryOperator::LtEq, tag("<=")),
        value(BinaryOperator::GtEq, tag(">=")),
        value(BinaryOperator::Lt, tag("<")),
        value(BinaryOperator::Gt, tag(">")),
    ))(i)
}

fn operand(i: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            map(literal, Expr::Literal),
            field_ref,
            delimited(char('('), expression, ws(char(')'))),
        )),
    )(i)
}

fn literal(i: &str) -> IResult<&str, Literal> {
    alt((
        value(Literal::Null, keyword("null")),
        value(Literal::Bool(true), keyword("true")),
        value(Literal::Bool(false), keyword("false")),
        map(number, Literal::Number),
        map(string, Literal::String),
    ))(i)
}

/// A keyword not followed by more identifier characters, so `nullable`
/// parses as a field reference rather than `null` + garbage.
fn keyword(word: &'static str) -> impl Fn(&str) -> IResult<&str, ()> {
    move |i: &str| {
        let (rest, _) = tag(word)(i)?;
        match rest.chars().next() {
            Some(c) if c.is_alphanumeric() || c == '_' => Err(nom::Err::Error(
                nom::error::Error::new(i, nom::error::ErrorKind::Tag),
            )),
            _ => Ok((rest, ())),
        }
    }
}

fn number(i: &str) -> IResult<&str, f64> {
    let (i, text) = recognize(tuple((
        opt(char('-')),
        alt((
            recognize(separated_pair(digit1, char('.'), digit0)),
            recognize(separated_pair(digit0, char('.'), digit1)),
            digit1,
        )),
    )))(i)?;
    match text.parse() {
        Ok(v) => Ok((i, v)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Float,
        ))),
    }
}

fn string(i: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
        )),
        |s: &str| s.to_string(),
    )(i)
}

fn field_ref(i: &str) -> IResult<&str, Expr> {
    map(separated_list1(char('.'), identifier), |segments| {
        Expr::FieldRef(segments)
    })(i)
}

fn identifier(i: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            take_while1(|c: char| c.is_alphabetic() || c == '_'),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        )),
        |s: &str| s.to_string(),
    )(i)
}

fn ws<'a, O>(
    parser: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(multispace0, parser)
}
