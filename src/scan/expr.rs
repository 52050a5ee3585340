//! Evaluation of `#if` expressions over already expanded tokens.

use crate::error::PreprocError;
use crate::scan::lexer::Token;

/// Binary operator levels, loosest first.
const LEVELS: &[&[&str]] = &[
    &["&&", "||"],
    &["&", "|", "^"],
    &["==", "!="],
    &["<", "<=", ">", ">="],
    &["<<", ">>"],
    &["+", "-"],
    &["*", "/", "%"],
];

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&'a Token, PreprocError> {
        let token = self.peek().ok_or(PreprocError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<(), PreprocError> {
        match self.next()? {
            Token::Op(o) if *o == op => Ok(()),
            other => Err(PreprocError::UnexpectedToken(other.to_string())),
        }
    }

    /// `a, b` evaluates both and yields `b`.
    fn comma(&mut self, live: bool) -> Result<i64, PreprocError> {
        let mut value = self.ternary(live)?;
        while self.eat(",") {
            value = self.ternary(live)?;
        }
        Ok(value)
    }

    fn ternary(&mut self, live: bool) -> Result<i64, PreprocError> {
        let cond = self.binary(0, live)?;
        if !self.eat("?") {
            return Ok(cond);
        }

        let yes = self.comma(live && cond != 0)?;
        self.expect(":")?;
        let no = self.ternary(live && cond == 0)?;
        Ok(if cond != 0 { yes } else { no })
    }

    fn binary(&mut self, level: usize, live: bool) -> Result<i64, PreprocError> {
        let Some(ops) = LEVELS.get(level) else {
            return self.unary(live);
        };

        let mut left = self.binary(level + 1, live)?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if ops.contains(op) => *op,
                _ => return Ok(left),
            };
            self.pos += 1;

            // The right operand of a decided && or || is parsed but not evaluated.
            let right_live = live
                && match op {
                    "&&" => left != 0,
                    "||" => left == 0,
                    _ => true,
                };
            let right = self.binary(level + 1, right_live)?;
            left = if right_live || matches!(op, "&&" | "||") {
                apply(op, left, right, right_live)?
            } else {
                0
            };
        }
    }

    fn unary(&mut self, live: bool) -> Result<i64, PreprocError> {
        match self.next()? {
            Token::Num(n) => Ok(*n),
            // Names that survived expansion are not macros.
            Token::Ident(_) => Ok(0),
            Token::Op("(") => {
                let value = self.comma(live)?;
                self.expect(")")?;
                Ok(value)
            }
            Token::Op("-") => Ok(self.unary(live)?.wrapping_neg()),
            Token::Op("+") => self.unary(live),
            Token::Op("!") => Ok(i64::from(self.unary(live)? == 0)),
            Token::Op("~") => Ok(!self.unary(live)?),
            other => Err(PreprocError::UnexpectedToken(other.to_string())),
        }
    }
}

fn apply(op: &str, left: i64, right: i64, live: bool) -> Result<i64, PreprocError> {
    let truth = |b: bool| i64::from(b);
    Ok(match op {
        "&&" => truth(left != 0 && live && right != 0),
        "||" => truth(left != 0 || (live && right != 0)),
        "&" => left & right,
        "|" => left | right,
        "^" => left ^ right,
        "==" => truth(left == right),
        "!=" => truth(left != right),
        "<" => truth(left < right),
        "<=" => truth(left <= right),
        ">" => truth(left > right),
        ">=" => truth(left >= right),
        "<<" => left.wrapping_shl(right as u32),
        ">>" => left.wrapping_shr(right as u32),
        "+" => left.wrapping_add(right),
        "-" => left.wrapping_sub(right),
        "*" => left.wrapping_mul(right),
        "/" | "%" if right == 0 => return Err(PreprocError::DivisionByZero),
        "/" => left.wrapping_div(right),
        "%" => left.wrapping_rem(right),
        other => return Err(PreprocError::UnexpectedToken(other.to_string())),
    })
}

/// Evaluates a fully expanded condition.
pub(crate) fn evaluate(tokens: &[Token]) -> Result<i64, PreprocError> {
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.comma(true)?;
    match parser.peek() {
        None => Ok(value),
        Some(extra) => Err(PreprocError::UnexpectedToken(extra.to_string())),
    }
}
