//! Identity store: private key parsing and recipient derivation
//!
//! An identity file is one of
//! - a list of bare `AGE-SECRET-KEY-1...` / `AGE-PLUGIN-...` lines,
//! - a PEM SSH private key, optionally passphrase-protected,
//! - an age passphrase-encrypted container (binary or armored) wrapping
//!   either of the above.
//!
//! [`Keyring::load`] parses the file, unlocks anything passphrase-protected
//! and derives the recipients the mount re-encrypts to.

mod plugin;
mod prompt;
mod recipient;
mod ssh;

pub use plugin::{AgePlugin, PluginBackend};
pub use prompt::{CachedPassphrase, FixedPassphrase, PromptCallbacks, Prompter, TerminalPrompter};
pub use recipient::{parse_recipients_file, Recipient};
pub use ssh::{ssh_key_type, SshKeyKind};

use crate::error::{Error, Result};
use age::armor::ArmoredReader;
use std::fmt;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use zeroize::Zeroizing;

/// Size ceiling for line-oriented and encrypted identity files
pub const IDENTITY_FILE_LIMIT: u64 = 1 << 24;

/// Size ceiling for PEM SSH private keys
pub const SSH_KEY_LIMIT: u64 = 1 << 14;

const NATIVE_PREFIX: &str = "AGE-SECRET-KEY-1";
const PLUGIN_PREFIX: &str = "AGE-PLUGIN-";

/// An unencrypted SSH private key
pub struct SshIdentity {
    identity: age::ssh::Identity,
    /// `<type> <base64>`, `None` for legacy PEM keys whose public half could not be found
    public: Option<String>,
}

/// A passphrase-protected SSH private key.
///
/// The passphrase is asked for once, on first use, and remembered.
pub struct EncryptedSshIdentity {
    name: String,
    identity: Box<dyn age::Identity + Send + Sync>,
    callbacks: CachedPassphrase,
    public: String,
}

/// An age file encrypted with a passphrase, holding more identities
pub struct EncryptedContainer {
    filename: PathBuf,
    contents: Zeroizing<Vec<u8>>,
    prompter: Arc<dyn Prompter>,
    unlocked: OnceLock<Vec<Identity>>,
}

/// A key held by a plugin
pub struct PluginIdentity {
    backend: Box<dyn PluginBackend>,
}

/// A private decryption key
pub enum Identity {
    Native(age::x25519::Identity),
    SshRsa(SshIdentity),
    SshEd25519(SshIdentity),
    EncryptedSsh(EncryptedSshIdentity),
    EncryptedContainer(EncryptedContainer),
    Plugin(PluginIdentity),
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Native(_) => f.write_str("Identity::Native"),
            Identity::SshRsa(_) => f.write_str("Identity::SshRsa"),
            Identity::SshEd25519(_) => f.write_str("Identity::SshEd25519"),
            Identity::EncryptedSsh(e) => write!(f, "Identity::EncryptedSsh({})", e.name),
            Identity::EncryptedContainer(c) => {
                write!(f, "Identity::EncryptedContainer({:?})", c.filename)
            }
            Identity::Plugin(p) => write!(f, "Identity::Plugin({})", p.backend.plugin_name()),
        }
    }
}

impl Identity {
    /// Wrap a plugin capability as an identity
    pub fn plugin(backend: Box<dyn PluginBackend>) -> Self {
        Identity::Plugin(PluginIdentity { backend })
    }

    /// Variant name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Identity::Native(_) => "native X25519",
            Identity::SshRsa(_) => "SSH RSA",
            Identity::SshEd25519(_) => "SSH Ed25519",
            Identity::EncryptedSsh(_) => "encrypted SSH",
            Identity::EncryptedContainer(_) => "passphrase-encrypted identity file",
            Identity::Plugin(_) => "plugin",
        }
    }

    /// Ask for any passphrase this identity needs now instead of on first use
    pub fn unlock(&self) -> Result<()> {
        match self {
            Identity::EncryptedSsh(e) => e.unlock(),
            Identity::EncryptedContainer(c) => c.unlock().map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Append the age-level identities backing this key
    pub(crate) fn collect_age<'a>(&'a self, out: &mut Vec<&'a dyn age::Identity>) -> Result<()> {
        match self {
            Identity::Native(k) => out.push(k),
            Identity::SshRsa(s) | Identity::SshEd25519(s) => out.push(&s.identity),
            Identity::EncryptedSsh(e) => out.push(e.identity.as_ref()),
            Identity::EncryptedContainer(c) => {
                for inner in c.unlock()? {
                    inner.collect_age(out)?;
                }
            }
            Identity::Plugin(p) => out.push(p.backend.identity()),
        }
        Ok(())
    }

    fn push_recipients(&self, out: &mut Vec<Recipient>) -> Result<()> {
        match self {
            Identity::Native(k) => out.push(Recipient::Native(k.to_public())),
            Identity::SshRsa(s) | Identity::SshEd25519(s) => match &s.public {
                Some(public) => out.push(Recipient::Ssh(parse_ssh_public(public)?)),
                None => return Err(Error::UnsupportedIdentity(self.kind().to_string())),
            },
            Identity::EncryptedSsh(e) => out.push(Recipient::Ssh(parse_ssh_public(&e.public)?)),
            Identity::EncryptedContainer(c) => {
                for inner in c.unlock()? {
                    inner.push_recipients(out)?;
                }
            }
            Identity::Plugin(p) => out.push(Recipient::Plugin {
                token: None,
                plugin: p.backend.plugin_name().to_string(),
                inner: p.backend.recipient()?,
            }),
        }
        Ok(())
    }
}

impl EncryptedSshIdentity {
    /// Prompt now and check the passphrase by round-tripping an empty message
    fn unlock(&self) -> Result<()> {
        let public = parse_ssh_public(&self.public)?;
        let round_trip = crate::crypto::encrypt_to(&[], std::iter::once(&public as &dyn age::Recipient))
            .and_then(|ciphertext| {
                let decryptor = age::Decryptor::new(&ciphertext[..])?;
                let mut reader =
                    decryptor.decrypt(std::iter::once(self.identity.as_ref() as &dyn age::Identity))?;
                let mut sink = Vec::new();
                reader.read_to_end(&mut sink)?;
                Ok(())
            });

        round_trip.map_err(|e| {
            self.callbacks.forget();
            Error::Passphrase(format!("could not unlock {}: {}", self.name, e))
        })
    }
}

impl EncryptedContainer {
    /// Decrypt the container once and parse the identities inside it
    fn unlock(&self) -> Result<&[Identity]> {
        if let Some(ids) = self.unlocked.get() {
            return Ok(ids);
        }

        let passphrase = self.prompter.passphrase(&format!(
            "Enter passphrase for identity file {:?}:",
            self.filename
        ))?;

        let decryptor = age::Decryptor::new(ArmoredReader::new(&self.contents[..]))?;
        if !decryptor.is_scrypt() {
            return Err(Error::identity(format!(
                "identity file {:?} is not passphrase-encrypted",
                self.filename
            )));
        }
        let scrypt = age::scrypt::Identity::new(passphrase);
        let mut reader = decryptor.decrypt(std::iter::once(&scrypt as &dyn age::Identity))?;

        let mut inner = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut inner)
            .map_err(|e| Error::Decrypt(e.to_string()))?;

        let ids = parse_unencrypted(&self.filename, &inner, self.prompter.clone())?;
        debug!("Unlocked {} identities from {:?}", ids.len(), self.filename);
        Ok(self.unlocked.get_or_init(|| ids))
    }

    pub(crate) fn warn_no_match(&self) {
        self.prompter.warn(&format!(
            "encrypted identity file {:?} didn't match file's recipients",
            self.filename
        ));
    }
}

fn read_limited(file: impl Read, limit: u64, name: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let mut contents = Zeroizing::new(Vec::new());
    file.take(limit + 1)
        .read_to_end(&mut contents)
        .map_err(|e| Error::identity(format!("failed to read {:?}: {}", name, e)))?;
    if contents.len() as u64 > limit {
        return Err(Error::identity(format!("failed to read {:?}: file too long", name)));
    }
    Ok(contents)
}

/// Parse an identity file.
///
/// Passphrase prompts for protected keys are deferred to [`Identity::unlock`]
/// or first use.
pub fn parse_identities_file(path: &Path, prompter: Arc<dyn Prompter>) -> Result<Vec<Identity>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::identity(format!("failed to open file {:?}: {}", path, e)))?;
    let contents = read_limited(file, IDENTITY_FILE_LIMIT, path)?;

    if contents.starts_with(b"age-encryption") || contents.starts_with(b"-----BEGIN AGE") {
        return Ok(vec![Identity::EncryptedContainer(EncryptedContainer {
            filename: path.to_path_buf(),
            contents,
            prompter,
            unlocked: OnceLock::new(),
        })]);
    }

    parse_unencrypted(path, &contents, prompter)
}

/// PEM SSH key or a list of bare identity lines
fn parse_unencrypted(path: &Path, contents: &[u8], prompter: Arc<dyn Prompter>) -> Result<Vec<Identity>> {
    if contents.starts_with(b"-----BEGIN") {
        if contents.len() as u64 > SSH_KEY_LIMIT {
            return Err(Error::identity(format!("failed to read {:?}: file too long", path)));
        }
        return parse_ssh_identity(path, contents, prompter).map(|id| vec![id]);
    }
    parse_identity_lines(contents, prompter)
}

fn parse_identity_lines(contents: &[u8], prompter: Arc<dyn Prompter>) -> Result<Vec<Identity>> {
    let mut ids = Vec::new();

    for (i, raw) in contents.split(|&b| b == b'\n').enumerate() {
        let n = i + 1;
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = Zeroizing::new(String::from_utf8_lossy(raw).into_owned());
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with(PLUGIN_PREFIX) {
            let backend = AgePlugin::new(&line, prompter.clone()).map_err(|e| match e {
                Error::IdentityParse { reason, .. } => Error::identity_at(n, reason),
                other => Error::identity_at(n, other),
            })?;
            ids.push(Identity::plugin(Box::new(backend)));
        } else if line.starts_with(NATIVE_PREFIX) {
            let key = line
                .parse::<age::x25519::Identity>()
                .map_err(|e| Error::identity_at(n, e))?;
            ids.push(Identity::Native(key));
        } else {
            return Err(Error::identity_at(n, "unknown identity type"));
        }
    }

    if ids.is_empty() {
        return Err(Error::identity("no secret keys found"));
    }
    Ok(ids)
}

fn parse_ssh_public(key: &str) -> Result<age::ssh::Recipient> {
    key.parse::<age::ssh::Recipient>()
        .map_err(|e| Error::identity(format!("invalid SSH public key {:?}: {:?}", key, e)))
}

fn parse_ssh_identity(path: &Path, pem: &[u8], prompter: Arc<dyn Prompter>) -> Result<Identity> {
    let name = path.display().to_string();
    let public_line = ssh::public_key_for(pem, path);

    let identity = age::ssh::Identity::from_buffer(BufReader::new(pem), Some(name.clone()))
        .map_err(|e| Error::identity(format!("malformed SSH identity in {:?}: {}", path, e)))?;

    let kind = public_line
        .as_ref()
        .ok()
        .and_then(|l| l.split(' ').next())
        .and_then(SshKeyKind::from_type)
        .or_else(|| ssh::banner_kind(pem));

    match identity {
        age::ssh::Identity::Unencrypted(_) => {
            let public = match public_line {
                Ok(line) => {
                    parse_ssh_public(&line)?;
                    Some(line)
                }
                Err(_) => None,
            };
            let ssh = SshIdentity { identity, public };
            match kind {
                Some(SshKeyKind::Rsa) => Ok(Identity::SshRsa(ssh)),
                Some(SshKeyKind::Ed25519) => Ok(Identity::SshEd25519(ssh)),
                None => Err(Error::identity(format!(
                    "unsupported SSH key type in {:?}",
                    path
                ))),
            }
        }
        age::ssh::Identity::Encrypted(_) => {
            let public = public_line?;
            parse_ssh_public(&public)?;
            let callbacks =
                CachedPassphrase::new(prompter, format!("Enter passphrase for {:?}:", path));
            Ok(Identity::EncryptedSsh(EncryptedSshIdentity {
                name,
                identity: Box::new(identity.with_callbacks(callbacks.clone())),
                callbacks,
                public,
            }))
        }
        age::ssh::Identity::Unsupported(age::ssh::UnsupportedKey::EncryptedPem) => {
            // without a public key we could not even encrypt to it
            public_line?;
            Err(Error::identity(format!(
                "unsupported SSH identity in {:?}: passphrase-protected PEM keys cannot be decrypted\n\n\
                 Convert it to a modern format with \"ssh-keygen -p -m RFC4716 -f {}\"",
                path,
                path.display()
            )))
        }
        age::ssh::Identity::Unsupported(k) => Err(Error::identity(format!(
            "unsupported SSH identity in {:?}: {:?}",
            path, k
        ))),
    }
}

/// Derive the recipient for every identity
pub fn identities_to_recipients(identities: &[Identity]) -> Result<Vec<Recipient>> {
    let mut recipients = Vec::new();
    for id in identities {
        id.push_recipients(&mut recipients)?;
    }
    Ok(recipients)
}

/// Identities and recipients for one mount. Read-only once built.
pub struct Keyring {
    identities: Vec<Identity>,
    recipients: Vec<Recipient>,
}

impl Keyring {
    /// Parse, unlock and derive recipients from an identity file
    pub fn load(path: &Path, prompter: Arc<dyn Prompter>) -> Result<Self> {
        let identities = parse_identities_file(path, prompter)?;
        for id in &identities {
            id.unlock()?;
        }
        let recipients = identities_to_recipients(&identities)?;
        debug!(
            "Loaded {} identities, {} recipients from {:?}",
            identities.len(),
            recipients.len(),
            path
        );
        Ok(Keyring {
            identities,
            recipients,
        })
    }

    pub fn new(identities: Vec<Identity>, recipients: Vec<Recipient>) -> Self {
        Keyring {
            identities,
            recipients,
        }
    }

    /// Build from identities, deriving their recipients
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self> {
        let recipients = identities_to_recipients(&identities)?;
        Ok(Keyring::new(identities, recipients))
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }
}
