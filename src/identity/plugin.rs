//! Plugin-backed identities
//!
//! The key material lives in an external `age-plugin-<name>` binary. The core
//! only sees the [`PluginBackend`] capability; [`AgePlugin`] owns the
//! subprocess protocol through age's plugin client.

use super::prompt::{PromptCallbacks, Prompter};
use crate::error::{Error, Result};
use std::sync::Arc;

/// What the keyring needs from a plugin-held key
pub trait PluginBackend: Send + Sync {
    /// Plugin name, the `<name>` in `age-plugin-<name>`
    fn plugin_name(&self) -> &str;

    /// Identity that unwraps file keys by talking to the plugin
    fn identity(&self) -> &dyn age::Identity;

    /// Recipient that wraps file keys to this identity
    fn recipient(&self) -> Result<Box<dyn age::Recipient + Send + Sync>>;
}

/// Adapter over age's plugin client (`IdentityPluginV1` / `RecipientPluginV1`)
pub struct AgePlugin {
    name: String,
    token: zeroize::Zeroizing<String>,
    prompter: Arc<dyn Prompter>,
    identity: age::plugin::IdentityPluginV1<PromptCallbacks>,
}

impl AgePlugin {
    /// Build from an `AGE-PLUGIN-...` identity line
    pub fn new(token: &str, prompter: Arc<dyn Prompter>) -> Result<Self> {
        let parsed = parse_identity(token)?;
        let name = parsed.plugin().to_string();
        let identity = age::plugin::IdentityPluginV1::new(
            &name,
            &[parsed],
            PromptCallbacks::new(prompter.clone()),
        )
        .map_err(|e| Error::identity(e.to_string()))?;

        Ok(AgePlugin {
            name,
            token: zeroize::Zeroizing::new(token.to_string()),
            prompter,
            identity,
        })
    }
}

fn parse_identity(token: &str) -> Result<age::plugin::Identity> {
    token
        .parse::<age::plugin::Identity>()
        .map_err(|e| Error::identity(e.to_string()))
}

impl PluginBackend for AgePlugin {
    fn plugin_name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> &dyn age::Identity {
        &self.identity
    }

    fn recipient(&self) -> Result<Box<dyn age::Recipient + Send + Sync>> {
        let identity = parse_identity(&self.token)?;
        let recipient = age::plugin::RecipientPluginV1::new(
            &self.name,
            &[],
            &[identity],
            PromptCallbacks::new(self.prompter.clone()),
        )
        .map_err(|e| Error::Encrypt(e.to_string()))?;
        Ok(Box::new(recipient))
    }
}

/// Recipient for an `age1<name>1...` plugin recipient string
pub fn plugin_recipient(
    token: &str,
    prompter: Arc<dyn Prompter>,
) -> Result<Box<dyn age::Recipient + Send + Sync>> {
    let parsed = token
        .parse::<age::plugin::Recipient>()
        .map_err(|e| Error::Encrypt(e.to_string()))?;
    let name = parsed.plugin().to_string();
    let recipient =
        age::plugin::RecipientPluginV1::new(&name, &[parsed], &[], PromptCallbacks::new(prompter))
            .map_err(|e| Error::Encrypt(e.to_string()))?;
    Ok(Box::new(recipient))
}
