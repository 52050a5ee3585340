//! Tokenizer for preprocessor lines.

use std::fmt;

use crate::error::PreprocError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Num(i64),
    /// String literal contents, without the quotes.
    Str(String),
    Ident(String),
    Op(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Ident(s) => f.write_str(s),
            Token::Op(op) => f.write_str(op),
        }
    }
}

/// Punctuators, longest first. Digraphs are listed with the canonical
/// spelling they stand for.
const PUNCTUATORS: &[(&str, &str)] = &[
    ("%:%:", "##"),
    ("<<=", "<<="),
    (">>=", ">>="),
    ("...", "..."),
    ("<<", "<<"),
    (">>", ">>"),
    ("<=", "<="),
    (">=", ">="),
    ("==", "=="),
    ("!=", "!="),
    ("&&", "&&"),
    ("||", "||"),
    ("++", "++"),
    ("--", "--"),
    ("->", "->"),
    ("+=", "+="),
    ("-=", "-="),
    ("*=", "*="),
    ("/=", "/="),
    ("%=", "%="),
    ("&=", "&="),
    ("|=", "|="),
    ("^=", "^="),
    ("##", "##"),
    ("::", "::"),
    ("<%", "{"),
    ("%>", "}"),
    ("<:", "["),
    (":>", "]"),
    ("%:", "#"),
    ("#", "#"),
    ("+", "+"),
    ("-", "-"),
    ("*", "*"),
    ("/", "/"),
    ("%", "%"),
    ("<", "<"),
    (">", ">"),
    ("=", "="),
    ("!", "!"),
    ("~", "~"),
    ("&", "&"),
    ("|", "|"),
    ("^", "^"),
    ("?", "?"),
    (":", ":"),
    ("(", "("),
    (")", ")"),
    ("[", "["),
    ("]", "]"),
    ("{", "{"),
    ("}", "}"),
    (",", ","),
    (";", ";"),
    (".", "."),
];

/// Alternative spellings of operators.
fn alternative(word: &str) -> Option<&'static str> {
    Some(match word {
        "and" => "&&",
        "or" => "||",
        "not" => "!",
        "not_eq" => "!=",
        "bitand" => "&",
        "bitor" => "|",
        "xor" => "^",
        "compl" => "~",
        "and_eq" => "&=",
        "or_eq" => "|=",
        "xor_eq" => "^=",
        _ => return None,
    })
}

struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn rest(&self) -> &'a [u8] {
        &self.source[self.pos..]
    }

    fn text(&self, start: usize) -> &'a str {
        std::str::from_utf8(&self.source[start..self.pos]).unwrap_or_default()
    }

    fn next_token(&mut self) -> Result<Option<Token>, PreprocError> {
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() {
                self.pos += 1;
                continue;
            }

            if byte.is_ascii_digit()
                || (byte == b'.' && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()))
            {
                return self.number().map(Some);
            }

            if byte == b'L' && matches!(self.peek_at(1), Some(b'\'' | b'"')) {
                self.pos += 1;
                continue;
            }

            if byte == b'\'' {
                return self.char_literal().map(Some);
            }

            if byte == b'"' {
                return self.string_literal().map(Some);
            }

            if byte.is_ascii_alphabetic() || byte == b'_' {
                return Ok(Some(self.identifier()));
            }

            for &(spelling, canonical) in PUNCTUATORS {
                if self.rest().starts_with(spelling.as_bytes()) {
                    self.pos += spelling.len();
                    return Ok(Some(Token::Op(canonical)));
                }
            }

            // Stray characters such as `@`, `$` or `\` carry no meaning here.
            self.pos += 1;
        }
        Ok(None)
    }

    fn identifier(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }

        let word = self.text(start);
        match word {
            "true" => Token::Num(1),
            "false" => Token::Num(0),
            _ => match alternative(word) {
                Some(op) => Token::Op(op),
                None => Token::Ident(word.to_string()),
            },
        }
    }

    fn number(&mut self) -> Result<Token, PreprocError> {
        let start = self.pos;
        let hex = self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X'));
        if hex {
            self.pos += 2;
        }

        while let Some(byte) = self.peek() {
            if !hex && matches!(byte, b'e' | b'E') && matches!(self.peek_at(1), Some(b'+' | b'-')) {
                self.pos += 2;
            } else if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        let spelling = self.text(start);
        let bad = || PreprocError::UnexpectedToken(spelling.to_string());
        let digits = spelling.trim_end_matches(['u', 'U', 'l', 'L']);

        let value = if hex {
            u64::from_str_radix(&digits[2..], 16).map_err(|_| bad())? as i64
        } else if digits.contains(['.', 'e', 'E']) {
            digits.parse::<f64>().map_err(|_| bad())? as i64
        } else if digits.len() > 1 && digits.starts_with('0') {
            u64::from_str_radix(&digits[1..], 8).map_err(|_| bad())? as i64
        } else {
            digits.parse::<u64>().map_err(|_| bad())? as i64
        };

        Ok(Token::Num(value))
    }

    fn escape(&mut self) -> Result<i64, PreprocError> {
        let byte = self.advance().ok_or(PreprocError::Unterminated)?;
        Ok(match byte {
            b'n' => 10,
            b't' => 9,
            b'r' => 13,
            b'a' => 7,
            b'b' => 8,
            b'f' => 12,
            b'v' => 11,
            b'0'..=b'7' => {
                let mut value = i64::from(byte - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + i64::from(d - b'0');
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                value
            }
            b'x' => {
                let start = self.pos;
                while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
                    self.pos += 1;
                }
                i64::from_str_radix(self.text(start), 16)
                    .map_err(|_| PreprocError::UnexpectedToken(self.text(start - 2).to_string()))?
            }
            other => i64::from(other),
        })
    }

    fn char_literal(&mut self) -> Result<Token, PreprocError> {
        self.pos += 1;
        let mut value: i64 = 0;
        loop {
            match self.advance().ok_or(PreprocError::Unterminated)? {
                b'\'' => return Ok(Token::Num(value)),
                b'\\' => value = (value << 8) | self.escape()?,
                byte => value = (value << 8) | i64::from(byte),
            }
        }
    }

    fn string_literal(&mut self) -> Result<Token, PreprocError> {
        self.pos += 1;
        let start = self.pos;
        loop {
            match self.advance().ok_or(PreprocError::Unterminated)? {
                b'"' => {
                    let body = std::str::from_utf8(&self.source[start..self.pos - 1])
                        .unwrap_or_default();
                    return Ok(Token::Str(body.to_string()));
                }
                b'\\' => {
                    self.advance().ok_or(PreprocError::Unterminated)?;
                }
                _ => {}
            }
        }
    }
}

/// Splits a directive remainder into tokens.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, PreprocError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}
