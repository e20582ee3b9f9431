//! Extended attribute syscalls on paths
//!
//! All calls act on the link itself, never following a final symlink.

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

/// errno meaning "no such attribute"
#[cfg(target_os = "linux")]
pub const ENOATTR: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
pub const ENOATTR: i32 = libc::ENOATTR;

fn cstr(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(target_os = "linux")]
unsafe fn raw_get(path: &CString, name: &CString, buf: *mut libc::c_void, size: usize) -> isize {
    libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf, size)
}

#[cfg(target_os = "macos")]
unsafe fn raw_get(path: &CString, name: &CString, buf: *mut libc::c_void, size: usize) -> isize {
    libc::getxattr(path.as_ptr(), name.as_ptr(), buf, size, 0, libc::XATTR_NOFOLLOW)
}

#[cfg(target_os = "linux")]
unsafe fn raw_set(path: &CString, name: &CString, value: &[u8], flags: i32) -> i32 {
    libc::lsetxattr(
        path.as_ptr(),
        name.as_ptr(),
        value.as_ptr() as *const libc::c_void,
        value.len(),
        flags,
    )
}

#[cfg(target_os = "macos")]
unsafe fn raw_set(path: &CString, name: &CString, value: &[u8], flags: i32) -> i32 {
    libc::setxattr(
        path.as_ptr(),
        name.as_ptr(),
        value.as_ptr() as *const libc::c_void,
        value.len(),
        0,
        flags | libc::XATTR_NOFOLLOW,
    )
}

#[cfg(target_os = "linux")]
unsafe fn raw_list(path: &CString, buf: *mut libc::c_char, size: usize) -> isize {
    libc::llistxattr(path.as_ptr(), buf, size)
}

#[cfg(target_os = "macos")]
unsafe fn raw_list(path: &CString, buf: *mut libc::c_char, size: usize) -> isize {
    libc::listxattr(path.as_ptr(), buf, size, libc::XATTR_NOFOLLOW)
}

#[cfg(target_os = "linux")]
unsafe fn raw_remove(path: &CString, name: &CString) -> i32 {
    libc::lremovexattr(path.as_ptr(), name.as_ptr())
}

#[cfg(target_os = "macos")]
unsafe fn raw_remove(path: &CString, name: &CString) -> i32 {
    libc::removexattr(path.as_ptr(), name.as_ptr(), libc::XATTR_NOFOLLOW)
}

/// Read an attribute. Returns `Ok(None)` when the attribute does not exist.
pub fn get(path: &Path, name: impl AsRef<OsStr>) -> io::Result<Option<Vec<u8>>> {
    let p = cstr(path.as_os_str().as_bytes())?;
    let n = cstr(name.as_ref().as_bytes())?;

    loop {
        let size = match check(unsafe { raw_get(&p, &n, std::ptr::null_mut(), 0) }) {
            Ok(size) => size,
            Err(e) if e.raw_os_error() == Some(ENOATTR) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut buf = vec![0u8; size];
        match check(unsafe { raw_get(&p, &n, buf.as_mut_ptr() as *mut libc::c_void, size) }) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(Some(buf));
            }
            // grew between the two calls
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
            Err(e) if e.raw_os_error() == Some(ENOATTR) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Write an attribute. `flags` takes `XATTR_CREATE` / `XATTR_REPLACE`.
pub fn set(path: &Path, name: impl AsRef<OsStr>, value: &[u8], flags: i32) -> io::Result<()> {
    let p = cstr(path.as_os_str().as_bytes())?;
    let n = cstr(name.as_ref().as_bytes())?;
    if unsafe { raw_set(&p, &n, value, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// List attribute names
pub fn list(path: &Path) -> io::Result<Vec<OsString>> {
    let p = cstr(path.as_os_str().as_bytes())?;

    loop {
        let size = check(unsafe { raw_list(&p, std::ptr::null_mut(), 0) })?;
        let mut buf = vec![0u8; size];
        match check(unsafe { raw_list(&p, buf.as_mut_ptr() as *mut libc::c_char, size) }) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(buf
                    .split(|&b| b == 0)
                    .filter(|s| !s.is_empty())
                    .map(|s| OsString::from_vec(s.to_vec()))
                    .collect());
            }
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Remove an attribute
pub fn remove(path: &Path, name: impl AsRef<OsStr>) -> io::Result<()> {
    let p = cstr(path.as_os_str().as_bytes())?;
    let n = cstr(name.as_ref().as_bytes())?;
    if unsafe { raw_remove(&p, &n) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether user attributes work under `dir` (tmpfs on older kernels says no)
pub fn supported(dir: &Path) -> bool {
    let scratch = dir.join(".xattr-check");
    if std::fs::write(&scratch, b"").is_err() {
        return false;
    }
    let ok = set(&scratch, "user.check", b"1", 0).is_ok();
    let _ = std::fs::remove_file(&scratch);
    ok
}
