//! agefs - a FUSE loopback filesystem that age-encrypts file content
//!
//! Files written through the mount are stored encrypted in the source
//! directory; an `.ageignore` file selects paths that pass through as-is.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod identity;
pub mod policy;
pub mod xattr;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{AgeFs, Root};
    pub use crate::identity::Keyring;
    pub use crate::policy::IgnorePolicy;
}
