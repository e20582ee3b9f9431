//! Public encryption targets and recipients-file parsing

use super::plugin::plugin_recipient;
use super::prompt::Prompter;
use super::ssh::{ssh_key_type, SshKeyKind};
use crate::error::{Error, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Recipients files larger than this are rejected
pub const RECIPIENTS_FILE_LIMIT: u64 = 16 << 20;

/// Same line limit as sshd(8)
pub const LINE_LENGTH_LIMIT: usize = 8 << 10;

/// A public key that file keys can be wrapped to
pub enum Recipient {
    /// `age1...` X25519 recipient
    Native(age::x25519::Recipient),
    /// `ssh-rsa` or `ssh-ed25519` public key
    Ssh(age::ssh::Recipient),
    /// Wrapping is delegated to an external plugin
    Plugin {
        /// The `age1<name>1...` string, unknown when derived from a plugin identity
        token: Option<String>,
        plugin: String,
        inner: Box<dyn age::Recipient + Send + Sync>,
    },
}

impl Recipient {
    /// Borrow as the trait object age's encryptor consumes
    pub fn as_age(&self) -> &dyn age::Recipient {
        match self {
            Recipient::Native(r) => r,
            Recipient::Ssh(r) => r,
            Recipient::Plugin { inner, .. } => inner.as_ref(),
        }
    }

    /// Parse a single recipient string
    pub fn parse(s: &str, prompter: Arc<dyn Prompter>) -> Result<Self> {
        if s.starts_with("age1") && s.matches('1').count() > 1 {
            let name = s
                .strip_prefix("age1")
                .and_then(|rest| rest.split('1').next())
                .unwrap_or_default()
                .to_string();
            return Ok(Recipient::Plugin {
                token: Some(s.to_string()),
                plugin: name,
                inner: plugin_recipient(s, prompter)?,
            });
        }
        if s.starts_with("age1") {
            return s
                .parse::<age::x25519::Recipient>()
                .map(Recipient::Native)
                .map_err(|e| recipient_error(None, e));
        }
        if s.starts_with("ssh-") {
            return s
                .parse::<age::ssh::Recipient>()
                .map(Recipient::Ssh)
                .map_err(|e| recipient_error(None, format!("{:?}", e)));
        }
        if s.starts_with("github:") {
            return Err(recipient_error(
                None,
                "\"github:\" recipients are not supported; fetch the keys from https://github.com/<user>.keys instead",
            ));
        }
        Err(recipient_error(None, "unknown recipient type"))
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Native(r) => write!(f, "{}", r),
            Recipient::Ssh(r) => write!(f, "{}", r),
            Recipient::Plugin {
                token: Some(token), ..
            } => f.write_str(token),
            Recipient::Plugin { plugin, .. } => write!(f, "# age-plugin-{} identity", plugin),
        }
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Native(r) => write!(f, "Recipient::Native({})", r),
            Recipient::Ssh(r) => write!(f, "Recipient::Ssh({})", r),
            Recipient::Plugin { plugin, .. } => write!(f, "Recipient::Plugin({})", plugin),
        }
    }
}

fn recipient_error(line: Option<usize>, reason: impl fmt::Display) -> Error {
    Error::RecipientParse {
        reason: match line {
            Some(n) => format!("line {}: {}", n, reason),
            None => reason.to_string(),
        },
        line,
    }
}

/// Parse a recipients file: one recipient per line, `#` comments allowed.
///
/// Valid SSH keys of a type age cannot encrypt to are skipped with a warning.
/// Malformed lines are errors that cite the line number but not its content.
pub fn parse_recipients_file(path: &Path, prompter: Arc<dyn Prompter>) -> Result<Vec<Recipient>> {
    let file = std::fs::File::open(path).map_err(|e| Error::RecipientParse {
        reason: format!("failed to open recipients file {:?}: {}", path, e),
        line: None,
    })?;

    let mut contents = Vec::new();
    file.take(RECIPIENTS_FILE_LIMIT + 1).read_to_end(&mut contents)?;
    if contents.len() as u64 > RECIPIENTS_FILE_LIMIT {
        return Err(Error::RecipientParse {
            reason: format!("{:?}: file too long", path),
            line: None,
        });
    }

    let mut recipients = Vec::new();
    for (i, raw) in contents.split(|&b| b == b'\n').enumerate() {
        let n = i + 1;
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.len() > LINE_LENGTH_LIMIT {
            return Err(recipient_error(Some(n), "line is too long"));
        }

        if line.starts_with("github:") {
            return Err(recipient_error(
                Some(n),
                "\"github:\" recipients are not supported",
            ));
        }

        match Recipient::parse(&line, prompter.clone()) {
            Ok(r) => recipients.push(r),
            Err(_) => match ssh_key_type(&line) {
                Some(t) if SshKeyKind::from_type(&t).is_none() => {
                    warn!(
                        "recipients file {:?}: ignoring unsupported SSH key of type {:?} at line {}",
                        path, t, n
                    );
                }
                _ => return Err(recipient_error(Some(n), "malformed recipient")),
            },
        }
    }

    if recipients.is_empty() {
        return Err(Error::RecipientParse {
            reason: format!("{:?}: no recipients found", path),
            line: None,
        });
    }
    Ok(recipients)
}
