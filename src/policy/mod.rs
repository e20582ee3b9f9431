//! Ignore policy: decides per relative path whether file contents are encrypted
//!
//! The policy file uses `.gitignore` syntax. A path matched by the rule set is
//! "ignored" and stored in plaintext; everything else is encrypted. With no
//! rules at all, every file is encrypted.

mod pattern;

pub use pattern::{MatchResult, Pattern};

use crate::error::{Error, Result};
use std::io::{BufRead, BufReader};
use std::path::{Component, Path};
use tracing::debug;

/// Compiled ignore rules for one mount
#[derive(Debug, Clone, Default)]
pub struct IgnorePolicy {
    patterns: Vec<Pattern>,
}

impl IgnorePolicy {
    /// A policy with no rules: encrypt everything
    pub fn encrypt_all() -> Self {
        Self::default()
    }

    /// Compile rules from a line-oriented source.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self> {
        let mut patterns = Vec::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).map_err(Error::PolicyRead)?;
            if n == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let text = String::from_utf8_lossy(&line);
            if text.starts_with('#') || text.trim().is_empty() {
                continue;
            }
            patterns.push(Pattern::parse(&text));
        }

        Ok(IgnorePolicy { patterns })
    }

    /// Load the policy file at `path`. A missing file means "no rules".
    pub fn load(path: &Path) -> Result<Self> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ignore policy at {:?}, encrypting everything", path);
                return Ok(Self::encrypt_all());
            }
            Err(e) => return Err(Error::PolicyRead(e)),
        };

        let policy = Self::from_reader(BufReader::new(file))?;
        debug!("Loaded {} ignore rules from {:?}", policy.len(), path);
        Ok(policy)
    }

    /// Number of compiled rules
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether the file at `rel_path` (relative to the source root) is stored encrypted
    pub fn should_encrypt(&self, rel_path: &Path) -> bool {
        if self.patterns.is_empty() {
            return true;
        }

        let owned: Vec<String> = rel_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let parts: Vec<&str> = owned.iter().map(String::as_str).collect();

        !self.is_ignored(&parts)
    }

    /// The last rule that says anything about the path decides
    fn is_ignored(&self, parts: &[&str]) -> bool {
        for pattern in self.patterns.iter().rev() {
            match pattern.matches(parts, false) {
                MatchResult::NoMatch => continue,
                result => return result == MatchResult::Exclude,
            }
        }
        false
    }
}
