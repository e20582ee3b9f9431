//! Error types for agefs
//!
//! Every fallible operation in the crate returns [`Result`]. At the FUSE
//! boundary errors are collapsed into a POSIX errno with [`Error::to_errno`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by agefs
#[derive(Debug, Error)]
pub enum Error {
    /// Plain OS-level I/O failure (open, read, write, rename, fsync...)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Reading the ignore policy file failed. A missing file is not an error.
    #[error("failed to read ignore policy: {0}")]
    PolicyRead(#[source] io::Error),

    /// An identity file could not be opened, had no keys, or held malformed key material
    #[error("failed to parse identities: {reason}")]
    IdentityParse {
        reason: String,
        /// 1-based line number for line-oriented identity files
        line: Option<usize>,
    },

    /// An identity has no public counterpart to encrypt to
    #[error("unsupported identity: {0}")]
    UnsupportedIdentity(String),

    /// A recipients file could not be parsed
    #[error("failed to parse recipients: {reason}")]
    RecipientParse { reason: String, line: Option<usize> },

    /// Bad key, corrupt or truncated ciphertext, or not an age file
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Recipient wrapping or stream encoding failed
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Extended attribute get/set failed for a reason other than "absent"
    #[error("extended attribute {name} on {path:?}: {source}")]
    Attribute {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A passphrase was required but could not be obtained
    #[error("passphrase unavailable: {0}")]
    Passphrase(String),

    /// Operation on a handle whose descriptor was already released
    #[error("bad file descriptor")]
    BadDescriptor,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an identity parse error without a line number
    pub fn identity(reason: impl Into<String>) -> Self {
        Error::IdentityParse {
            reason: reason.into(),
            line: None,
        }
    }

    /// Build an identity parse error citing a 1-based line number
    pub fn identity_at(line: usize, reason: impl std::fmt::Display) -> Self {
        Error::IdentityParse {
            reason: format!("error at line {}: {}", line, reason),
            line: Some(line),
        }
    }

    /// Map to the nearest POSIX error code for the kernel
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) | Error::PolicyRead(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Attribute { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::BadDescriptor => libc::EBADF,
            Error::InodeNotFound(_) | Error::PathNotFound(_) => libc::ENOENT,
            Error::Decrypt(_)
            | Error::Encrypt(_)
            | Error::IdentityParse { .. }
            | Error::UnsupportedIdentity(_)
            | Error::RecipientParse { .. }
            | Error::Passphrase(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => libc::EIO,
        }
    }
}

impl From<age::DecryptError> for Error {
    fn from(e: age::DecryptError) -> Self {
        Error::Decrypt(e.to_string())
    }
}

impl From<age::EncryptError> for Error {
    fn from(e: age::EncryptError) -> Self {
        Error::Encrypt(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let e = Error::Io(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(e.to_errno(), libc::EACCES);

        assert_eq!(Error::Decrypt("bad".into()).to_errno(), libc::EIO);
        assert_eq!(Error::BadDescriptor.to_errno(), libc::EBADF);
        assert_eq!(Error::InodeNotFound(7).to_errno(), libc::ENOENT);

        let e = Error::Attribute {
            name: "user.x".into(),
            path: PathBuf::from("/tmp/x"),
            source: io::Error::from_raw_os_error(libc::EPERM),
        };
        assert_eq!(e.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_identity_at_cites_line() {
        match Error::identity_at(3, "unknown identity type") {
            Error::IdentityParse { reason, line } => {
                assert_eq!(line, Some(3));
                assert!(reason.contains("line 3"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
