//! Plaintext size cache
//!
//! The decrypted length of an encrypted file is memoized in the reserved
//! extended attribute [`SIZE_XATTR`] on the ciphertext file, as decimal ASCII.
//! `stat` on an encrypted file reads the attribute instead of decrypting.

use crate::crypto;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::xattr;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// Reserved attribute holding the plaintext length
pub const SIZE_XATTR: &str = "user.agefs_decrypted_size";

fn attribute_error(path: &Path, source: std::io::Error) -> Error {
    Error::Attribute {
        name: SIZE_XATTR.to_string(),
        path: path.to_path_buf(),
        source,
    }
}

/// Cached size, `None` when absent or when the backing FS has no user
/// attributes. A present value that is not a decimal length is an error.
pub fn cached_size(path: &Path) -> Result<Option<u64>> {
    match xattr::get(path, SIZE_XATTR) {
        Ok(Some(value)) => std::str::from_utf8(&value)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| {
                attribute_error(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed size value {:?}", String::from_utf8_lossy(&value)),
                    ),
                )
            }),
        Ok(None) => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => Ok(None),
        Err(e) => Err(attribute_error(path, e)),
    }
}

/// Persist the plaintext size for `path`
pub fn store_size(path: &Path, size: u64) -> Result<()> {
    xattr::set(path, SIZE_XATTR, size.to_string().as_bytes(), 0).map_err(|e| attribute_error(path, e))
}

/// Drop the cached size for `path`; an absent attribute is fine
pub fn clear_size(path: &Path) -> Result<()> {
    match xattr::remove(path, SIZE_XATTR) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.raw_os_error(), Some(xattr::ENOATTR) | Some(libc::ENOTSUP)) => Ok(()),
        Err(e) => Err(attribute_error(path, e)),
    }
}

/// Plaintext size of the encrypted file at `path`.
///
/// An empty file holds empty plaintext. Otherwise the cached value is
/// returned without touching file content when present; failing that the
/// file is decrypted, measured and the result recorded (best-effort).
pub fn plaintext_size(path: &Path, identities: &[Identity]) -> Result<u64> {
    if std::fs::metadata(path)?.len() == 0 {
        return Ok(0);
    }
    if let Some(size) = cached_size(path)? {
        return Ok(size);
    }

    let file = File::open(path)?;
    let size = crypto::decrypt(BufReader::new(file), identities)?.len() as u64;
    debug!("Measured plaintext size {} for {:?}", size, path);

    if let Err(e) = store_size(path, size) {
        warn!("Failed to cache plaintext size: {}", e);
    }
    Ok(size)
}
