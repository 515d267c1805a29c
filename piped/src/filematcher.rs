//! Glob-style path matching with `!` exclusions
//!
//! `*` matches anything but `/`, `?` a single non-`/` character and `**`
//! any number of directories. A pattern also matches every file below a
//! directory it matches.

use std::sync::Arc;

use regex::Regex;

use crate::errors::PipedError;
use crate::regexpool;

#[derive(Debug, Clone)]
struct Pattern {
    cleaned: String,
    dirs: usize,
    regex: Arc<Regex>,
}

#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
    exclusions: Vec<Pattern>,
}

impl PatternMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PipedError> {
        let mut pm = PatternMatcher::default();
        for p in patterns {
            let p = p.as_ref().trim();
            if p.is_empty() {
                continue;
            }
            let (negative, p) = match p.strip_prefix('!') {
                Some("") => {
                    return Err(PipedError::Validation(
                        "illegal exclusion pattern: \"!\"".to_string(),
                    ))
                }
                Some(rest) => (true, rest),
                None => (false, p),
            };
            let cleaned = clean_path(p);
            let regex = regexpool::default_pool()
                .get(&regexp_string(&cleaned))
                .map_err(|_| PipedError::Validation(format!("syntax error in pattern {}", p)))?;
            let pattern = Pattern {
                dirs: cleaned.split('/').count(),
                cleaned,
                regex,
            };
            if negative {
                pm.exclusions.push(pattern);
            } else {
                pm.patterns.push(pattern);
            }
        }
        Ok(pm)
    }

    pub fn matches(&self, file: &str) -> bool {
        let file = clean_path(file);
        if file == "." {
            return false;
        }
        if matches(&file, &self.exclusions) {
            return false;
        }
        matches(&file, &self.patterns)
    }

    pub fn matches_any<S: AsRef<str>>(&self, files: &[S]) -> bool {
        files.iter().any(|f| self.matches(f.as_ref()))
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.cleaned.as_str()).collect()
    }
}

fn matches(file: &str, patterns: &[Pattern]) -> bool {
    let parent = match file.rfind('/') {
        Some(idx) => &file[..idx],
        None => ".",
    };
    let parent_dirs: Vec<&str> = parent.split('/').collect();

    patterns.iter().any(|pattern| {
        if pattern.regex.is_match(file) {
            return true;
        }
        // The pattern may match one of the parent directories
        parent != "." && pattern.dirs <= parent_dirs.len() && {
            let prefix = parent_dirs[..pattern.dirs].join("/");
            pattern.regex.is_match(&prefix)
        }
    })
}

/// Lexical cleanup similar to `path.Clean`
fn clean_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !p.starts_with('/') {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    match (p.starts_with('/'), joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

fn regexp_string(pattern: &str) -> String {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                    }
                    if chars.peek().is_none() {
                        re.push_str(".*");
                    } else {
                        re.push_str("(.*/)?");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '.' | '$' | '+' | '(' | ')' | '|' | '^' | '{' | '}' => {
                re.push('\\');
                re.push(ch);
            }
            '\\' => match chars.next() {
                Some(next) => {
                    re.push('\\');
                    re.push(next);
                }
                None => re.push_str("\\\\"),
            },
            _ => re.push(ch),
        }
    }
    re.push('$');
    re
}

/// Shorthand for a one-shot match
pub fn matches_patterns<S: AsRef<str>>(file: &str, patterns: &[S]) -> Result<bool, PipedError> {
    Ok(PatternMatcher::new(patterns)?.matches(file))
}
