//! Comment stripping and directive extraction, plus the per-file memo.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::error::ScanError;

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t]*(?:#|%:)[ \t]*(ifdef|ifndef|if|else|elif|endif|include|import|define|undef|pragma)\b[ \t]*(.*?)\r*$",
    )
    .expect("directive pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirectiveKind {
    If,
    Ifdef,
    Ifndef,
    Elif,
    Else,
    Endif,
    Include,
    Import,
    Define,
    Undef,
    Pragma,
}

impl DirectiveKind {
    fn parse(keyword: &str) -> Option<Self> {
        Some(match keyword.to_ascii_lowercase().as_str() {
            "if" => DirectiveKind::If,
            "ifdef" => DirectiveKind::Ifdef,
            "ifndef" => DirectiveKind::Ifndef,
            "elif" => DirectiveKind::Elif,
            "else" => DirectiveKind::Else,
            "endif" => DirectiveKind::Endif,
            "include" => DirectiveKind::Include,
            "import" => DirectiveKind::Import,
            "define" => DirectiveKind::Define,
            "undef" => DirectiveKind::Undef,
            "pragma" => DirectiveKind::Pragma,
            _ => return None,
        })
    }

    pub(crate) fn keyword(self) -> &'static str {
        match self {
            DirectiveKind::If => "if",
            DirectiveKind::Ifdef => "ifdef",
            DirectiveKind::Ifndef => "ifndef",
            DirectiveKind::Elif => "elif",
            DirectiveKind::Else => "else",
            DirectiveKind::Endif => "endif",
            DirectiveKind::Include => "include",
            DirectiveKind::Import => "import",
            DirectiveKind::Define => "define",
            DirectiveKind::Undef => "undef",
            DirectiveKind::Pragma => "pragma",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Directive {
    pub kind: DirectiveKind,
    pub line: String,
}

/// Joins backslash-continued lines, then replaces comments with a single
/// space. String and character literals pass through untouched.
pub(crate) fn strip_comments(text: &str) -> String {
    let joined = join_continuations(text);
    let bytes = joined.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                out.push(b' ');
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                out.push(b' ');
            }
            quote @ (b'"' | b'\'') => {
                out.push(quote);
                i += 1;
                while i < bytes.len() && bytes[i] != quote && bytes[i] != b'\n' {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        out.push(bytes[i]);
                        i += 1;
                    }
                    out.push(bytes[i]);
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == quote {
                    out.push(quote);
                    i += 1;
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn join_continuations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('\\') {
        out.push_str(&rest[..at]);
        let after = rest[at + 1..].trim_start_matches('\r');
        if let Some(tail) = after.strip_prefix('\n') {
            rest = tail;
        } else {
            out.push('\\');
            rest = &rest[at + 1..];
        }
    }
    out.push_str(rest);
    out
}

/// Preprocessor directives of a source text, in document order.
pub(crate) fn extract_directives(text: &str) -> Vec<Directive> {
    let stripped = strip_comments(text);
    DIRECTIVE
        .captures_iter(&stripped)
        .filter_map(|caps| {
            let kind = DirectiveKind::parse(caps.get(1)?.as_str())?;
            let line = caps.get(2).map_or("", |m| m.as_str()).trim_end().to_string();
            Some(Directive { kind, line })
        })
        .collect()
}

/// Directive lists per absolute file path, shared by every scan of a build.
#[derive(Debug, Default)]
pub struct ParseCache {
    files: Mutex<HashMap<Utf8PathBuf, Arc<[Directive]>>>,
}

impl ParseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn directives(&self, path: &Utf8Path) -> Result<Arc<[Directive]>, ScanError> {
        if let Some(lines) = self.lock().get(path) {
            return Ok(lines.clone());
        }

        let bytes = fs::read(path).map_err(|source| ScanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let lines: Arc<[Directive]> = extract_directives(&String::from_utf8_lossy(&bytes)).into();

        self.lock().insert(path.to_path_buf(), lines.clone());
        Ok(lines)
    }

    /// Drops every parsed file; called at the start of each run.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Utf8PathBuf, Arc<[Directive]>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
