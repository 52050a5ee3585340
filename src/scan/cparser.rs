//! Include discovery for C-family sources.
//!
//! Walks the directives of a file and everything it includes, keeping a
//! macro table and a conditional stack so that only the includes a compiler
//! would actually see are reported.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::{trace, warn};

use crate::core::Node;
use crate::error::{PreprocError, ScanError};
use crate::scan::ScanContext;
use crate::scan::expr::evaluate;
use crate::scan::filter::{Directive, DirectiveKind};
use crate::scan::lexer::{Token, tokenize};
use crate::scan::macros::{Macros, Mode, leading_ident};

static INCLUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^(<[^>]*>|"[^"]*")"#).expect("include pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    /// The current branch is taken.
    Accepted,
    /// No branch taken yet; a later `#elif` or `#else` may be.
    Ignored,
    /// A branch was already taken, or an enclosing one is not.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    Local,
    System,
}

/// A file being walked and the index of its next directive.
struct Cursor {
    path: Utf8PathBuf,
    lines: Arc<[Directive]>,
    next: usize,
}

pub(crate) struct CParser<'a> {
    cx: &'a ScanContext<'a>,
    variant: &'a str,
    include_paths: &'a [Utf8PathBuf],
    pub(crate) macros: Macros,
    frames: Vec<Frame>,
    stack: Vec<Cursor>,
    banned: HashSet<Utf8PathBuf>,
    visited: usize,
    pub(crate) nodes: Vec<Node>,
    pub(crate) names: Vec<String>,
    seen_nodes: HashSet<Node>,
    seen_names: HashSet<String>,
}

impl<'a> CParser<'a> {
    pub(crate) fn new(
        cx: &'a ScanContext<'a>,
        variant: &'a str,
        include_paths: &'a [Utf8PathBuf],
    ) -> Self {
        Self {
            cx,
            variant,
            include_paths,
            macros: Macros::default(),
            frames: Vec::new(),
            stack: Vec::new(),
            banned: HashSet::new(),
            visited: 0,
            nodes: Vec::new(),
            names: Vec::new(),
            seen_nodes: HashSet::new(),
            seen_names: HashSet::new(),
        }
    }

    /// Walks `origin` and everything it pulls in.
    pub(crate) fn start(&mut self, origin: &Utf8Path) -> Result<(), ScanError> {
        self.push_file(origin, origin)?;

        while let Some(cursor) = self.stack.last_mut() {
            let Some(directive) = cursor.lines.get(cursor.next).cloned() else {
                self.stack.pop();
                continue;
            };
            cursor.next += 1;
            let file = cursor.path.clone();

            let found = self
                .process(&file, &directive)
                .map_err(|reason| ScanError::Directive {
                    file: file.clone(),
                    line: format!("{} {}", directive.kind.keyword(), directive.line),
                    reason,
                })?;

            if let Some(path) = found {
                self.push_file(&path, origin)?;
            }
        }

        if !self.frames.is_empty() {
            warn!("{origin}: {} unterminated conditional(s)", self.frames.len());
        }
        Ok(())
    }

    fn push_file(&mut self, path: &Utf8Path, origin: &Utf8Path) -> Result<(), ScanError> {
        self.visited += 1;
        if self.visited > self.cx.max_files {
            return Err(ScanError::RecursionLimit {
                limit: self.cx.max_files,
                origin: origin.to_path_buf(),
            });
        }

        let lines = self.cx.cache.directives(path)?;
        self.stack.push(Cursor {
            path: path.to_path_buf(),
            lines,
            next: 0,
        });
        Ok(())
    }

    fn live(&self) -> bool {
        self.frames
            .iter()
            .all(|frame| *frame == Frame::Accepted)
    }

    fn condition(&mut self, line: &str) -> Result<bool, PreprocError> {
        let tokens = self.macros.expand(&tokenize(line)?, Mode::Condition, &[])?;
        Ok(evaluate(&tokens)? != 0)
    }

    fn defined(&self, line: &str) -> Result<bool, PreprocError> {
        let name =
            leading_ident(line).ok_or_else(|| PreprocError::UnexpectedToken(line.to_string()))?;
        Ok(self.macros.is_defined(name))
    }

    /// Applies one directive. Returns a header to descend into.
    fn process(
        &mut self,
        file: &Utf8Path,
        directive: &Directive,
    ) -> Result<Option<Utf8PathBuf>, PreprocError> {
        let line = directive.line.as_str();

        match directive.kind {
            DirectiveKind::If | DirectiveKind::Ifdef | DirectiveKind::Ifndef => {
                let frame = if !self.live() {
                    Frame::Skipped
                } else {
                    let taken = match directive.kind {
                        DirectiveKind::If => self.condition(line)?,
                        DirectiveKind::Ifdef => self.defined(line)?,
                        _ => !self.defined(line)?,
                    };
                    if taken { Frame::Accepted } else { Frame::Ignored }
                };
                self.frames.push(frame);
                return Ok(None);
            }
            DirectiveKind::Elif => {
                match self.frames.last().copied() {
                    Some(Frame::Accepted) => self.set_top(Frame::Skipped),
                    Some(Frame::Ignored) => {
                        if self.condition(line)? {
                            self.set_top(Frame::Accepted);
                        }
                    }
                    Some(Frame::Skipped) => {}
                    None => warn!("{file}: #elif without #if"),
                }
                return Ok(None);
            }
            DirectiveKind::Else => {
                match self.frames.last().copied() {
                    Some(Frame::Accepted) => self.set_top(Frame::Skipped),
                    Some(Frame::Ignored) => self.set_top(Frame::Accepted),
                    Some(Frame::Skipped) => {}
                    None => warn!("{file}: #else without #if"),
                }
                return Ok(None);
            }
            DirectiveKind::Endif => {
                if self.frames.pop().is_none() {
                    warn!("{file}: #endif without #if");
                }
                return Ok(None);
            }
            _ if !self.live() => return Ok(None),
            _ => {}
        }

        match directive.kind {
            DirectiveKind::Define => {
                self.macros.define(line)?;
                Ok(None)
            }
            DirectiveKind::Undef => {
                if let Some(name) = leading_ident(line) {
                    self.macros.undef(name);
                }
                Ok(None)
            }
            DirectiveKind::Pragma => {
                if line.split_whitespace().next() == Some("once") {
                    self.banned.insert(file.to_path_buf());
                }
                Ok(None)
            }
            DirectiveKind::Include | DirectiveKind::Import => {
                let (quote, name) = self.include_target(line)?;
                let Some(path) = self.find(file, quote, &name) else {
                    trace!("{file}: unresolved include {name}");
                    if self.seen_names.insert(name.clone()) {
                        self.names.push(name);
                    }
                    return Ok(None);
                };

                if self.banned.contains(&path) {
                    return Ok(None);
                }
                if directive.kind == DirectiveKind::Import {
                    self.banned.insert(path.clone());
                }

                let node = self.cx.layout.classify(&path, self.variant);
                if self.seen_nodes.insert(node.clone()) {
                    self.nodes.push(node);
                }
                Ok(Some(path))
            }
            _ => Ok(None),
        }
    }

    fn set_top(&mut self, frame: Frame) {
        if let Some(top) = self.frames.last_mut() {
            *top = frame;
        }
    }

    /// The quote style and name of an include argument, expanding macros
    /// when it is not a literal.
    fn include_target(&mut self, line: &str) -> Result<(Quote, String), PreprocError> {
        if let Some(m) = INCLUDE.find(line) {
            let text = m.as_str();
            let quote = if text.starts_with('<') {
                Quote::System
            } else {
                Quote::Local
            };
            return Ok((quote, text[1..text.len() - 1].to_string()));
        }

        let tokens = self.macros.expand(&tokenize(line)?, Mode::Include, &[])?;

        // Adjacent literals concatenate: `"dir/" "name.h"`.
        let mut joined = String::new();
        if !tokens.is_empty() && tokens.iter().all(|t| matches!(t, Token::Str(_))) {
            for token in &tokens {
                if let Token::Str(part) = token {
                    joined.push_str(part);
                }
            }
            return Ok((Quote::Local, joined));
        }

        if let [Token::Op("<"), middle @ .., Token::Op(">")] = tokens.as_slice()
            && !middle.is_empty()
        {
            for token in middle {
                joined.push_str(&token.to_string());
            }
            return Ok((Quote::System, joined));
        }

        Err(PreprocError::BadInclude)
    }

    fn find(&self, file: &Utf8Path, quote: Quote, name: &str) -> Option<Utf8PathBuf> {
        let local = match quote {
            Quote::Local => file.parent(),
            Quote::System => None,
        };

        local
            .into_iter()
            .chain(self.include_paths.iter().map(Utf8PathBuf::as_path))
            .map(|dir| crate::core::normalize_path(&dir.join(name)))
            .find(|candidate| candidate.is_file())
    }
}
