//! Macro table and expansion.
//!
//! Definitions are stored as raw text and only tokenized when first used;
//! most macros seen while scanning headers are never evaluated.

use std::collections::HashMap;

use crate::error::PreprocError;
use crate::scan::lexer::{Token, tokenize};

/// How identifiers left after expansion are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// `#if` / `#elif`: `defined` is an operator and unknown names become 0.
    Condition,
    /// `#include MACRO`: unknown names are kept as they are.
    Include,
}

#[derive(Debug, Clone)]
enum MacroDef {
    Raw(String),
    Object(Vec<Token>),
    Function {
        params: Vec<String>,
        /// Name bound to the trailing arguments: `__VA_ARGS__` for `...`,
        /// or the parameter name of a GNU `name...` declaration.
        variadic: Option<String>,
        body: Vec<Token>,
    },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Macros {
    defs: HashMap<String, MacroDef>,
}

/// Splits a define line into the macro name and the rest.
fn split_name(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    let end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(line.len());
    let name = &line[..end];
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    valid.then(|| (name, &line[end..]))
}

/// Leading identifier of a line, as used by `#ifdef` and `#undef`.
pub(crate) fn leading_ident(line: &str) -> Option<&str> {
    split_name(line).map(|(name, _)| name)
}

fn parse_define(line: &str) -> Result<MacroDef, PreprocError> {
    let (_, rest) = split_name(line).ok_or(PreprocError::BadDefine)?;

    // Function-like only when the parenthesis touches the name.
    let Some(after_paren) = rest.strip_prefix('(') else {
        return Ok(MacroDef::Object(tokenize(rest)?));
    };

    let close = after_paren.find(')').ok_or(PreprocError::BadDefine)?;
    let mut params = Vec::new();
    let mut variadic = None;

    for param in after_paren[..close].split(',') {
        let param = param.trim();
        if variadic.is_some() {
            return Err(PreprocError::BadDefine);
        }
        if param == "..." {
            variadic = Some("__VA_ARGS__".to_string());
        } else if let Some(named) = param.strip_suffix("...") {
            let named = named.trim();
            if leading_ident(named) != Some(named) {
                return Err(PreprocError::BadDefine);
            }
            variadic = Some(named.to_string());
        } else if param.is_empty() {
            if close != 0 {
                return Err(PreprocError::BadDefine);
            }
        } else if leading_ident(param) == Some(param) {
            params.push(param.to_string());
        } else {
            return Err(PreprocError::BadDefine);
        }
    }

    Ok(MacroDef::Function {
        params,
        variadic,
        body: tokenize(&after_paren[close + 1..])?,
    })
}

/// Applies every `##` of a token list.
fn paste(tokens: &[Token]) -> Result<Vec<Token>, PreprocError> {
    if !tokens.contains(&Token::Op("##")) {
        return Ok(tokens.to_vec());
    }

    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] != Token::Op("##") {
            out.push(tokens[i].clone());
            i += 1;
            continue;
        }

        match (out.pop(), tokens.get(i + 1)) {
            (Some(left), Some(right)) => {
                out.extend(tokenize(&format!("{left}{right}"))?);
                i += 2;
            }
            (Some(left), None) => {
                out.push(left);
                i += 1;
            }
            (None, Some(right)) => {
                out.push(right.clone());
                i += 2;
            }
            (None, None) => i += 1,
        }
    }
    Ok(out)
}

/// Spells an argument back as a string literal. Tokens are joined as
/// written, with a single space only where two words would otherwise fuse.
fn stringize(tokens: &[Token]) -> Token {
    let word = |t: &Token| matches!(t, Token::Ident(_) | Token::Num(_));
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 && word(&tokens[i - 1]) && word(token) {
            out.push(' ');
        }
        out.push_str(&token.to_string());
    }
    Token::Str(out)
}

/// Arguments of an invocation whose `(` is at `open`. Returns the arguments
/// and the index after the closing parenthesis.
fn collect_args(
    tokens: &[Token],
    open: usize,
    name: &str,
) -> Result<(Vec<Vec<Token>>, usize), PreprocError> {
    let mut args = vec![Vec::new()];
    let mut depth = 0usize;
    let mut i = open + 1;

    loop {
        let token = tokens.get(i).ok_or_else(|| PreprocError::BadInvocation {
            name: name.to_string(),
            reason: "unterminated argument list".into(),
        })?;
        i += 1;

        match token {
            Token::Op("(") => depth += 1,
            Token::Op(")") if depth == 0 => return Ok((args, i)),
            Token::Op(")") => depth -= 1,
            Token::Op(",") if depth == 0 => {
                args.push(Vec::new());
                continue;
            }
            _ => {}
        }

        if let Some(last) = args.last_mut() {
            last.push(token.clone());
        }
    }
}

/// `defined X` or `defined ( X )` starting right after `defined`.
fn defined_operand(tokens: &[Token], start: usize) -> Result<(&str, usize), PreprocError> {
    let ident = |i: usize| match tokens.get(i) {
        Some(Token::Ident(name)) => Ok(name.as_str()),
        Some(other) => Err(PreprocError::UnexpectedToken(other.to_string())),
        None => Err(PreprocError::UnexpectedEnd),
    };

    if tokens.get(start) == Some(&Token::Op("(")) {
        let name = ident(start + 1)?;
        match tokens.get(start + 2) {
            Some(Token::Op(")")) => Ok((name, start + 3)),
            Some(other) => Err(PreprocError::UnexpectedToken(other.to_string())),
            None => Err(PreprocError::UnexpectedEnd),
        }
    } else {
        Ok((ident(start)?, start + 1))
    }
}

impl Macros {
    /// Records a define line, e.g. `NAME(a, b) a + b`.
    pub(crate) fn define(&mut self, line: &str) -> Result<(), PreprocError> {
        let (name, _) = split_name(line).ok_or(PreprocError::BadDefine)?;
        self.defs
            .insert(name.to_string(), MacroDef::Raw(line.to_string()));
        Ok(())
    }

    pub(crate) fn undef(&mut self, name: &str) {
        self.defs.remove(name);
    }

    pub(crate) fn is_defined(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    fn resolve(&mut self, name: &str) -> Result<Option<MacroDef>, PreprocError> {
        let Some(def) = self.defs.get_mut(name) else {
            return Ok(None);
        };
        if let MacroDef::Raw(line) = def {
            *def = parse_define(line)?;
        }
        Ok(Some(def.clone()))
    }

    /// Expands every macro in `tokens`. Names in `ban` are in the middle of
    /// their own expansion and are left alone.
    pub(crate) fn expand(
        &mut self,
        tokens: &[Token],
        mode: Mode,
        ban: &[String],
    ) -> Result<Vec<Token>, PreprocError> {
        let tokens = paste(tokens)?;
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;

        while i < tokens.len() {
            let Token::Ident(name) = &tokens[i] else {
                out.push(tokens[i].clone());
                i += 1;
                continue;
            };

            if mode == Mode::Condition && name == "defined" {
                let (target, next) = defined_operand(&tokens, i + 1)?;
                out.push(Token::Num(i64::from(self.is_defined(target))));
                i = next;
                continue;
            }

            let def = if ban.contains(name) {
                None
            } else {
                self.resolve(name)?
            };

            let mut inner_ban = ban.to_vec();
            inner_ban.push(name.clone());

            match def {
                None => {
                    out.push(match mode {
                        Mode::Condition => Token::Num(0),
                        Mode::Include => Token::Ident(name.clone()),
                    });
                    i += 1;
                }
                Some(MacroDef::Raw(_)) => unreachable!("resolved above"),
                Some(MacroDef::Object(body)) => {
                    out.extend(self.expand(&body, mode, &inner_ban)?);
                    i += 1;
                }
                Some(MacroDef::Function {
                    params,
                    variadic,
                    body,
                }) => {
                    if tokens.get(i + 1) != Some(&Token::Op("(")) {
                        // A function-like name without arguments is not an invocation.
                        out.push(match mode {
                            Mode::Condition => Token::Num(0),
                            Mode::Include => Token::Ident(name.clone()),
                        });
                        i += 1;
                        continue;
                    }

                    let (args, next) = collect_args(&tokens, i + 1, name)?;
                    let args = check_arity(name, &params, variadic.is_some(), args)?;
                    let replaced =
                        self.substitute(&params, variadic.as_deref(), &body, &args, mode, ban)?;
                    out.extend(self.expand(&replaced, mode, &inner_ban)?);
                    i = next;
                }
            }
        }

        Ok(out)
    }

    /// Replaces parameters in a function-like body. Operands of `#` and
    /// `##` get the raw argument, every other use the expanded one.
    fn substitute(
        &mut self,
        params: &[String],
        variadic: Option<&str>,
        body: &[Token],
        args: &[Vec<Token>],
        mode: Mode,
        ban: &[String],
    ) -> Result<Vec<Token>, PreprocError> {
        let mut varargs = Vec::new();
        if variadic.is_some() {
            for (n, arg) in args.iter().skip(params.len()).enumerate() {
                if n > 0 {
                    varargs.push(Token::Op(","));
                }
                varargs.extend(arg.iter().cloned());
            }
        }

        let lookup = |name: &str| -> Option<&[Token]> {
            if variadic.is_some_and(|v| v == name || name == "__VA_ARGS__") {
                return Some(&varargs);
            }
            params
                .iter()
                .position(|p| p == name)
                .map(|index| args.get(index).map(Vec::as_slice).unwrap_or_default())
        };

        let mut out: Vec<Token> = Vec::with_capacity(body.len());
        let mut j = 0;
        while j < body.len() {
            let token = &body[j];

            if *token == Token::Op("#")
                && let Some(Token::Ident(param)) = body.get(j + 1)
                && let Some(arg) = lookup(param)
            {
                out.push(stringize(arg));
                j += 2;
                continue;
            }

            let Token::Ident(name) = token else {
                out.push(token.clone());
                j += 1;
                continue;
            };

            let Some(arg) = lookup(name) else {
                out.push(token.clone());
                j += 1;
                continue;
            };

            let pasted = (j > 0 && body[j - 1] == Token::Op("##"))
                || body.get(j + 1) == Some(&Token::Op("##"));

            if arg.is_empty()
                && out.ends_with(&[Token::Op(","), Token::Op("##")])
            {
                // `, ## __VA_ARGS__` with nothing to paste drops the comma.
                out.truncate(out.len() - 2);
            } else if pasted {
                out.extend(arg.iter().cloned());
            } else {
                out.extend(self.expand(arg, mode, ban)?);
            }
            j += 1;
        }

        Ok(out)
    }
}

fn check_arity(
    name: &str,
    params: &[String],
    variadic: bool,
    mut args: Vec<Vec<Token>>,
) -> Result<Vec<Vec<Token>>, PreprocError> {
    // `F()` passes no arguments rather than one empty argument.
    if args.len() == 1 && args[0].is_empty() && params.is_empty() {
        args.clear();
    }

    let ok = if variadic {
        args.len() >= params.len()
    } else {
        args.len() == params.len()
    };

    if ok {
        Ok(args)
    } else {
        Err(PreprocError::BadInvocation {
            name: name.to_string(),
            reason: format!("expected {} argument(s), got {}", params.len(), args.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand_cond(macros: &mut Macros, text: &str) -> Vec<Token> {
        macros
            .expand(&tokenize(text).unwrap(), Mode::Condition, &[])
            .unwrap()
    }

    fn spelled(tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn table(lines: &[&str]) -> Macros {
        let mut macros = Macros::default();
        for line in lines {
            macros.define(line).unwrap();
        }
        macros
    }

    #[test]
    fn test_object_macro_is_textual() {
        let mut macros = table(&["m1 1+2"]);
        assert_eq!(spelled(&expand_cond(&mut macros, "m1*3")), "1 + 2 * 3");
    }

    #[test]
    fn test_defined_operator() {
        let mut macros = table(&["A"]);
        assert_eq!(
            expand_cond(&mut macros, "defined A + defined(B) + defined ( A )"),
            vec![
                Token::Num(1),
                Token::Op("+"),
                Token::Num(0),
                Token::Op("+"),
                Token::Num(1)
            ]
        );
    }

    #[test]
    fn test_function_macro_with_paste() {
        let mut macros = table(&["m1 1+2", "fun1(x, y) x##y", "fun2(x, y) x*y"]);
        assert_eq!(spelled(&expand_cond(&mut macros, "fun1(m,1)")), "1 + 2");
        assert_eq!(
            spelled(&expand_cond(&mut macros, "fun2(2, fun1(m,1))")),
            "2 * 1 + 2"
        );
    }

    #[test]
    fn test_stringize() {
        let mut macros = table(&["STR(x) #x"]);
        let out = macros
            .expand(&tokenize("STR(abc)").unwrap(), Mode::Include, &[])
            .unwrap();
        assert_eq!(out, vec![Token::Str("abc".into())]);

        let out = macros
            .expand(&tokenize("STR(dir/b.h)").unwrap(), Mode::Include, &[])
            .unwrap();
        assert_eq!(out, vec![Token::Str("dir/b.h".into())]);

        let out = macros
            .expand(&tokenize("STR(long int)").unwrap(), Mode::Include, &[])
            .unwrap();
        assert_eq!(out, vec![Token::Str("long int".into())]);
    }

    #[test]
    fn test_variadic() {
        let mut macros = table(&[
            "FIRST(a, ...) a",
            "REST(a, ...) __VA_ARGS__",
            "CALL(f, ...) f(0 , ## __VA_ARGS__)",
            "NAMED(args...) args",
        ]);
        assert_eq!(spelled(&expand_cond(&mut macros, "FIRST(1, 2, 3)")), "1");
        assert_eq!(spelled(&expand_cond(&mut macros, "REST(1, 2, 3)")), "2 , 3");
        assert_eq!(spelled(&expand_cond(&mut macros, "CALL(g)")), "0 ( 0 )");
        assert_eq!(spelled(&expand_cond(&mut macros, "NAMED(4, 5)")), "4 , 5");
    }

    #[test]
    fn test_self_reference_is_banned() {
        let mut macros = table(&["LOOP LOOP + 1", "A B", "B A"]);
        assert_eq!(spelled(&expand_cond(&mut macros, "LOOP")), "0 + 1");
        assert_eq!(spelled(&expand_cond(&mut macros, "A")), "0");

        let kept = macros
            .expand(&tokenize("LOOP").unwrap(), Mode::Include, &[])
            .unwrap();
        assert_eq!(spelled(&kept), "LOOP + 1");
    }

    #[test]
    fn test_function_name_without_call() {
        let mut macros = table(&["F(x) x"]);
        assert_eq!(expand_cond(&mut macros, "F"), vec![Token::Num(0)]);
    }

    #[test]
    fn test_arity_errors() {
        let mut macros = table(&["F(x, y) x"]);
        let err = macros
            .expand(&tokenize("F(1)").unwrap(), Mode::Condition, &[])
            .unwrap_err();
        assert!(matches!(err, PreprocError::BadInvocation { .. }));

        let err = macros
            .expand(&tokenize("F(1, 2").unwrap(), Mode::Condition, &[])
            .unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_bad_defines() {
        let mut macros = Macros::default();
        assert_eq!(macros.define("1abc"), Err(PreprocError::BadDefine));

        macros.define("F(a, 1) a").unwrap();
        assert!(
            macros
                .expand(&tokenize("F(1, 2)").unwrap(), Mode::Condition, &[])
                .is_err()
        );
    }
}
