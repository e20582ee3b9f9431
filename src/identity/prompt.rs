//! Passphrase and user-message capability injected into identity parsing

use crate::error::{Error, Result};
use age::secrecy::{ExposeSecret, SecretString};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Source of passphrases and sink for user-facing notices.
///
/// Key parsing never touches the terminal directly; it asks a `Prompter`.
pub trait Prompter: Send + Sync {
    /// Ask for a passphrase. Called at most once per protected key.
    fn passphrase(&self, description: &str) -> Result<SecretString>;

    /// Non-fatal warning
    fn warn(&self, message: &str) {
        warn!("{}", message);
    }

    /// Informational message, e.g. from a plugin
    fn message(&self, message: &str) {
        info!("{}", message);
    }
}

/// Interactive prompt on the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn passphrase(&self, description: &str) -> Result<SecretString> {
        let pass = rpassword::prompt_password(format!("{} ", description))
            .map_err(|e| Error::Passphrase(format!("could not read passphrase: {}", e)))?;
        Ok(SecretString::from(pass))
    }
}

/// Non-interactive provider that answers every request with the same passphrase
pub struct FixedPassphrase {
    passphrase: SecretString,
}

impl FixedPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        FixedPassphrase {
            passphrase: SecretString::from(passphrase.into()),
        }
    }
}

impl Prompter for FixedPassphrase {
    fn passphrase(&self, _description: &str) -> Result<SecretString> {
        Ok(SecretString::from(self.passphrase.expose_secret().to_string()))
    }
}

/// Adapts a [`Prompter`] to the callback interface age uses for plugins and keys
#[derive(Clone)]
pub struct PromptCallbacks {
    prompter: Arc<dyn Prompter>,
}

impl PromptCallbacks {
    pub fn new(prompter: Arc<dyn Prompter>) -> Self {
        PromptCallbacks { prompter }
    }
}

impl age::Callbacks for PromptCallbacks {
    fn display_message(&self, message: &str) {
        self.prompter.message(message);
    }

    fn confirm(&self, _message: &str, _yes_string: &str, _no_string: Option<&str>) -> Option<bool> {
        None
    }

    fn request_public_string(&self, _description: &str) -> Option<String> {
        None
    }

    fn request_passphrase(&self, description: &str) -> Option<SecretString> {
        self.prompter.passphrase(description).ok()
    }
}

/// Callbacks that ask once and replay the answer on every later request.
///
/// Used for passphrase-protected SSH keys, which age asks to unlock on
/// every decryption.
#[derive(Clone)]
pub struct CachedPassphrase {
    prompter: Arc<dyn Prompter>,
    description: String,
    cached: Arc<Mutex<Option<Zeroizing<String>>>>,
}

impl CachedPassphrase {
    pub fn new(prompter: Arc<dyn Prompter>, description: impl Into<String>) -> Self {
        CachedPassphrase {
            prompter,
            description: description.into(),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// Forget the remembered passphrase so the next request prompts again
    pub fn forget(&self) {
        *self.cached.lock() = None;
    }
}

impl age::Callbacks for CachedPassphrase {
    fn display_message(&self, message: &str) {
        self.prompter.message(message);
    }

    fn confirm(&self, _message: &str, _yes_string: &str, _no_string: Option<&str>) -> Option<bool> {
        None
    }

    fn request_public_string(&self, _description: &str) -> Option<String> {
        None
    }

    fn request_passphrase(&self, _description: &str) -> Option<SecretString> {
        let mut cached = self.cached.lock();
        if let Some(pass) = cached.as_ref() {
            return Some(SecretString::from(pass.to_string()));
        }

        let pass = self.prompter.passphrase(&self.description).ok()?;
        *cached = Some(Zeroizing::new(pass.expose_secret().to_string()));
        Some(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::Callbacks;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl Prompter for Counting {
        fn passphrase(&self, _description: &str) -> Result<SecretString> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SecretString::from("hunter2".to_string()))
        }
    }

    #[test]
    fn test_fixed_passphrase() {
        let p = FixedPassphrase::new("correct horse");
        let got = p.passphrase("anything").unwrap();
        assert_eq!(got.expose_secret(), "correct horse");
    }

    #[test]
    fn test_cached_passphrase_prompts_once() {
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let callbacks = CachedPassphrase::new(counting.clone(), "Enter passphrase");

        for _ in 0..3 {
            let pass = callbacks.request_passphrase("ignored").unwrap();
            assert_eq!(pass.expose_secret(), "hunter2");
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        callbacks.forget();
        callbacks.request_passphrase("ignored").unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }
}
