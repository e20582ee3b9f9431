//! A single compiled `.gitignore`-style rule
//!
//! Each rule is split on `/` into per-component globs. A rule without an
//! interior slash matches any component of the path. A rule with one is
//! anchored and matched component by component, where `**` spans zero or more
//! directories.

use globset::{GlobBuilder, GlobMatcher};

/// Outcome of testing one rule against a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    NoMatch,
    /// The path is ignored by this rule
    Exclude,
    /// The path is re-included by a `!` rule
    Include,
}

/// One path component glob.
///
/// `*` and `?` never cross a separator and a backslash escapes the next
/// character. A malformed glob (unclosed class, dangling escape) never
/// matches anything.
#[derive(Debug, Clone)]
struct Glob {
    raw: String,
    matcher: Option<GlobMatcher>,
}

impl Glob {
    fn compile(raw: &str) -> Self {
        let matcher = GlobBuilder::new(&normalize(raw))
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map(|glob| glob.compile_matcher())
            .ok();
        Glob {
            raw: raw.to_string(),
            matcher,
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.is_match(name))
    }
}

/// Spell gitignore syntax the way globset reads it: `[^..]` negates like
/// `[!..]` and braces are plain characters
fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_class => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push(c);
                if let Some(&first) = chars.peek() {
                    if first == '^' || first == '!' {
                        chars.next();
                        out.push('!');
                    }
                }
                // a leading ']' is a member, not the end of the class
                if chars.peek() == Some(&']') {
                    chars.next();
                    out.push(']');
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(c);
            }
            '{' | '}' if !in_class => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// A parsed ignore rule
#[derive(Debug, Clone)]
pub struct Pattern {
    globs: Vec<Glob>,
    inclusion: bool,
    dir_only: bool,
    anchored: bool,
}

impl Pattern {
    /// Parse one non-comment policy line
    pub fn parse(line: &str) -> Self {
        let mut p = line;

        let inclusion = p.starts_with('!');
        if inclusion {
            p = &p[1..];
        }

        if !p.ends_with("\\ ") {
            p = p.trim_end_matches(' ');
        }

        let dir_only = p.ends_with('/');
        if dir_only {
            p = &p[..p.len() - 1];
        }

        let anchored = p.contains('/');
        let globs = p.split('/').map(Glob::compile).collect();

        Pattern {
            globs,
            inclusion,
            dir_only,
            anchored,
        }
    }

    /// Whether this is a `!` re-include rule
    pub fn is_inclusion(&self) -> bool {
        self.inclusion
    }

    /// Test the rule against the components of a relative path
    pub fn matches(&self, path: &[&str], is_dir: bool) -> MatchResult {
        if path.is_empty() {
            return MatchResult::NoMatch;
        }

        let hit = if self.anchored {
            self.anchored_match(path, is_dir)
        } else {
            self.name_match(path, is_dir)
        };

        match (hit, self.inclusion) {
            (false, _) => MatchResult::NoMatch,
            (true, true) => MatchResult::Include,
            (true, false) => MatchResult::Exclude,
        }
    }

    fn name_match(&self, path: &[&str], is_dir: bool) -> bool {
        let glob = match self.globs.first() {
            Some(g) => g,
            None => return false,
        };

        for (i, name) in path.iter().enumerate() {
            if !glob.matches(name) {
                continue;
            }
            // a directory-only rule cannot match the final (file) component
            return !(self.dir_only && !is_dir && i == path.len() - 1);
        }
        false
    }

    fn anchored_match(&self, mut path: &[&str], is_dir: bool) -> bool {
        let mut matched = false;
        let mut can_traverse = false;

        for (i, glob) in self.globs.iter().enumerate() {
            if glob.raw.is_empty() {
                can_traverse = false;
                continue;
            }
            if glob.raw == "**" {
                if i == self.globs.len() - 1 {
                    break;
                }
                can_traverse = true;
                continue;
            }
            if glob.raw.contains("**") {
                return false;
            }
            if path.is_empty() {
                return false;
            }

            if can_traverse {
                can_traverse = false;
                while let Some((first, rest)) = path.split_first() {
                    path = rest;
                    if glob.matches(first) {
                        matched = true;
                        break;
                    } else if path.is_empty() {
                        matched = false;
                    }
                }
            } else {
                if !glob.matches(path[0]) {
                    return false;
                }
                matched = true;
                path = &path[1..];
            }
        }

        if matched && self.dir_only && !is_dir && path.is_empty() {
            matched = false;
        }
        matched
    }
}
