//! age encryption helpers over keyring identities and recipients
//!
//! Ciphertext is the standard age format. Decryption accepts binary or ASCII
//! armored input; encryption optionally armors.

use crate::error::{Error, Result};
use crate::identity::{Identity, Recipient};
use age::armor::{ArmoredReader, ArmoredWriter, Format};
use age::secrecy::{ExposeSecret, SecretString};
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::{BufReader, Read, Write};
use zeroize::Zeroizing;

/// Decrypt a whole age stream into memory
pub fn decrypt<R: Read>(input: R, identities: &[Identity]) -> Result<Zeroizing<Vec<u8>>> {
    let mut keys: Vec<&dyn age::Identity> = Vec::new();
    for id in identities {
        id.collect_age(&mut keys)?;
    }

    let decryptor = age::Decryptor::new(ArmoredReader::new(BufReader::new(input)))?;
    if decryptor.is_scrypt() {
        return Err(Error::Decrypt(
            "file is passphrase-encrypted, not encrypted to an identity".to_string(),
        ));
    }

    let mut reader = match decryptor.decrypt(keys.into_iter()) {
        Ok(r) => r,
        Err(age::DecryptError::NoMatchingKeys) => {
            for id in identities {
                if let Identity::EncryptedContainer(c) = id {
                    c.warn_no_match();
                }
            }
            return Err(Error::Decrypt("no identity matched any of the recipients".to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut plaintext = Zeroizing::new(Vec::new());
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| Error::Decrypt(e.to_string()))?;
    Ok(plaintext)
}

/// Encrypt `plaintext` to every recipient, writing the age stream to `output`
pub fn encrypt<W: Write>(plaintext: &[u8], recipients: &[Recipient], output: W, armor: bool) -> Result<W> {
    let encryptor = age::Encryptor::with_recipients(recipients.iter().map(Recipient::as_age))?;
    let format = if armor { Format::AsciiArmor } else { Format::Binary };

    let armored = ArmoredWriter::wrap_output(output, format)?;
    let mut writer = encryptor.wrap_output(armored)?;
    writer.write_all(plaintext)?;
    let armored = writer.finish()?;
    Ok(armored.finish()?)
}

/// Encrypt to raw age recipients into a fresh buffer
pub fn encrypt_to<'a>(
    plaintext: &[u8],
    recipients: impl Iterator<Item = &'a dyn age::Recipient>,
) -> Result<Vec<u8>> {
    let encryptor = age::Encryptor::with_recipients(recipients)?;
    let mut out = Vec::new();
    let mut writer = encryptor.wrap_output(&mut out)?;
    writer.write_all(plaintext)?;
    writer.finish()?;
    Ok(out)
}

/// Encrypt with a passphrase (scrypt recipient), ASCII armored
pub fn encrypt_with_passphrase<W: Write>(plaintext: &[u8], passphrase: SecretString, output: W) -> Result<W> {
    let encryptor = age::Encryptor::with_user_passphrase(passphrase);
    let armored = ArmoredWriter::wrap_output(output, Format::AsciiArmor)?;
    let mut writer = encryptor.wrap_output(armored)?;
    writer.write_all(plaintext)?;
    let armored = writer.finish()?;
    Ok(armored.finish()?)
}

/// A freshly generated native identity in identity-file form
pub struct GeneratedKey {
    /// Identity file contents, comment header included
    pub contents: Zeroizing<String>,
    /// `age1...` recipient string
    pub public: String,
}

/// Generate a new X25519 identity
pub fn generate_key(created: DateTime<Utc>) -> GeneratedKey {
    let identity = age::x25519::Identity::generate();
    let public = identity.to_public().to_string();
    let secret = identity.to_string();

    let contents = Zeroizing::new(format!(
        "# created: {}\n# public key: {}\n{}\n",
        created.to_rfc3339_opts(SecondsFormat::Secs, true),
        public,
        secret.expose_secret()
    ));
    GeneratedKey { contents, public }
}

/// Random passphrase: ten words drawn from a small alphabet of syllables
pub fn random_passphrase() -> SecretString {
    use rand::seq::SliceRandom;

    const SYLLABLES: &[&str] = &[
        "ba", "ko", "ri", "mu", "te", "na", "lo", "shi", "va", "do", "pe", "zu", "fa", "gi",
        "ho", "ju", "ke", "mi", "no", "ru", "sa", "tu", "wa", "yo",
    ];
    let mut rng = rand::thread_rng();
    let words: Vec<String> = (0..10)
        .map(|_| {
            (0..3)
                .filter_map(|_| SYLLABLES.choose(&mut rng).copied())
                .collect::<String>()
        })
        .collect();
    SecretString::from(words.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keyring;

    fn keyring() -> Keyring {
        Keyring::from_identities(vec![Identity::Native(age::x25519::Identity::generate())]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let keys = keyring();
        for armor in [false, true] {
            let plaintext = b"the quick brown fox".repeat(1000);
            let mut ciphertext = Vec::new();
            encrypt(&plaintext, keys.recipients(), &mut ciphertext, armor).unwrap();
            assert_ne!(&ciphertext[..], &plaintext[..]);
            if armor {
                assert!(ciphertext.starts_with(b"-----BEGIN AGE ENCRYPTED FILE-----"));
            }

            let decrypted = decrypt(&ciphertext[..], keys.identities()).unwrap();
            assert_eq!(&decrypted[..], &plaintext[..]);
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let keys = keyring();
        let mut ciphertext = Vec::new();
        encrypt(b"", keys.recipients(), &mut ciphertext, false).unwrap();
        assert!(!ciphertext.is_empty());
        assert!(decrypt(&ciphertext[..], keys.identities()).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key() {
        let a = keyring();
        let b = keyring();
        let mut ciphertext = Vec::new();
        encrypt(b"secret", a.recipients(), &mut ciphertext, false).unwrap();

        assert!(matches!(
            decrypt(&ciphertext[..], b.identities()),
            Err(Error::Decrypt(_))
        ));
    }

    #[test]
    fn test_garbage_and_truncation() {
        let keys = keyring();
        assert!(decrypt(&b"definitely not age"[..], keys.identities()).is_err());

        let mut ciphertext = Vec::new();
        encrypt(&[7u8; 4096], keys.recipients(), &mut ciphertext, false).unwrap();
        ciphertext.truncate(ciphertext.len() - 10);
        assert!(decrypt(&ciphertext[..], keys.identities()).is_err());
    }

    #[test]
    fn test_no_recipients() {
        let err = encrypt(b"x", &[], Vec::new(), false).unwrap_err();
        assert!(matches!(err, Error::Encrypt(_)));
    }

    #[test]
    fn test_generate_key() {
        let key = generate_key(Utc::now());
        assert!(key.public.starts_with("age1"));
        assert!(key.contents.contains("# public key: "));
        assert!(key.contents.contains("AGE-SECRET-KEY-1"));
        assert_eq!(random_passphrase().expose_secret().split('-').count(), 10);
    }
}
