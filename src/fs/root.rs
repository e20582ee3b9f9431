//! Shared mount state

use super::inode::InoMap;
use crate::cache;
use crate::error::{Error, Result};
use crate::identity::{Keyring, Prompter};
use crate::policy::IgnorePolicy;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// State owned by one mount: the source tree, keys and ignore policy.
///
/// Nodes and open handles hold an `Arc<Root>`. Only the inode aliases
/// change after the mount starts.
pub struct Root {
    source: PathBuf,
    dev: u64,
    keyring: Keyring,
    policy: IgnorePolicy,
    inos: InoMap,
}

impl Root {
    /// Bind already-loaded keys and policy to a source directory
    pub fn new(source: PathBuf, keyring: Keyring, policy: IgnorePolicy) -> Result<Self> {
        let meta = std::fs::metadata(&source).map_err(|e| {
            Error::PathNotFound(format!("{}: {}", source.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "source {} is not a directory",
                source.display()
            )));
        }

        Ok(Root {
            source,
            dev: meta.dev(),
            keyring,
            policy,
            inos: InoMap::new(),
        })
    }

    /// Load the identity file and the source tree's policy file, then bind them
    pub fn open(
        source: PathBuf,
        identity_file: &Path,
        policy_file_name: &str,
        prompter: Arc<dyn Prompter>,
    ) -> Result<Self> {
        if !source.is_dir() {
            return Err(Error::PathNotFound(source.display().to_string()));
        }

        let keyring = Keyring::load(identity_file, prompter)?;
        let policy = IgnorePolicy::load(&source.join(policy_file_name))?;
        info!(
            "Source {:?}: {} identities, {} recipients, {} ignore rules",
            source,
            keyring.identities().len(),
            keyring.recipients().len(),
            policy.len()
        );

        Root::new(source, keyring, policy)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn inos(&self) -> &InoMap {
        &self.inos
    }

    /// Absolute backing path for a path relative to the source root
    pub fn abs_path(&self, rel: &Path) -> PathBuf {
        if rel.as_os_str().is_empty() {
            self.source.clone()
        } else {
            self.source.join(rel)
        }
    }

    pub fn should_encrypt(&self, rel: &Path) -> bool {
        self.policy.should_encrypt(rel)
    }

    /// Inode number exposed for a backing (dev, ino) pair.
    ///
    /// Files on the source root's device keep their original inode number.
    pub fn stable_ino(&self, dev: u64, ino: u64) -> u64 {
        let swapped = dev.rotate_left(32);
        let swapped_root = self.dev.rotate_left(32);
        (swapped ^ swapped_root) ^ ino
    }

    /// [`Root::stable_ino`], followed through write-back replacements
    pub fn exposed_ino(&self, dev: u64, ino: u64) -> u64 {
        self.inos.exposed(self.stable_ino(dev, ino))
    }

    /// Plaintext size of the encrypted file at `rel`
    pub fn plaintext_size(&self, rel: &Path) -> Result<u64> {
        cache::plaintext_size(&self.abs_path(rel), self.keyring.identities())
    }
}
