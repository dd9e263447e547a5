//! Call sites found in script source
//!
//! Rhai resolves `obj.name(..)` against functions registered on the engine,
//! and an engine cannot gain functions while it evaluates. Scanning the source
//! up front lets every name a script calls be registered for handles before
//! the script runs, even when the type that answers it is first seen mid-run.

use std::collections::BTreeSet;

/// Words followed by `(` that are never function calls
const KEYWORDS: &[&str] = &[
    "if", "else", "while", "loop", "do", "until", "for", "in", "switch", "fn", "return", "throw",
    "try", "catch", "let", "const", "import", "export", "as", "private", "global", "this", "true",
    "false", "break", "continue", "is_def_fn", "is_def_var", "is_shared",
];

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CallSites {
    /// Identifiers written directly before an opening parenthesis
    pub names: BTreeSet<String>,
    /// String literals following `import`
    pub imports: Vec<String>,
}

pub(crate) fn scan(source: &str) -> CallSites {
    let chars: Vec<char> = source.chars().collect();
    let mut sites = CallSites::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => i = skip_block_comment(&chars, i),
            '"' | '`' | '\'' => i = skip_literal(&chars, i).0,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let next = skip_whitespace(&chars, i);

                if word == "import" && chars.get(next) == Some(&'"') {
                    let (end, path) = skip_literal(&chars, next);
                    sites.imports.push(path);
                    i = end;
                } else if chars.get(next) == Some(&'(') && !KEYWORDS.contains(&word.as_str()) {
                    sites.names.insert(word);
                }
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    sites
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

/// Index past the comment opening at `start`; block comments nest
fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1)) {
            ('/', Some('*')) => {
                depth += 1;
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    i
}

/// Index past the literal opening at `start`, plus its raw contents
fn skip_literal(chars: &[char], start: usize) -> (usize, String) {
    let quote = chars[start];
    let mut contents = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if let Some(&escaped) = chars.get(i + 1) {
                    contents.push(escaped);
                }
                i += 2;
            }
            c if c == quote => return (i + 1, contents),
            c => {
                contents.push(c);
                i += 1;
            }
        }
    }
    (i, contents)
}
