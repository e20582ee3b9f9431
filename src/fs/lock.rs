//! Advisory lock forwarding to the OS lock manager

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// Which kernel lock family a request maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Whole-file `flock(2)` locks; byte ranges are ignored
    Flock,
    /// Byte-range locks owned by the open file description
    Posix,
}

/// A byte range lock as FUSE describes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    /// Inclusive end; `u64::MAX` means "to end of file"
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    pub typ: i32,
    pub pid: u32,
}

#[cfg(target_os = "linux")]
const GETLK: libc::c_int = libc::F_OFD_GETLK;
#[cfg(target_os = "linux")]
const SETLK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const SETLKW: libc::c_int = libc::F_OFD_SETLKW;

#[cfg(not(target_os = "linux"))]
const GETLK: libc::c_int = libc::F_GETLK;
#[cfg(not(target_os = "linux"))]
const SETLK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const SETLKW: libc::c_int = libc::F_SETLKW;

fn to_flock(range: &LockRange) -> libc::flock {
    // SAFETY: flock is plain old data; all-zero is a valid value
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = range.typ as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = range.start as libc::off_t;
    fl.l_len = if range.end == u64::MAX {
        0
    } else {
        (range.end - range.start + 1) as libc::off_t
    };
    // OFD locks require l_pid == 0
    fl.l_pid = 0;
    fl
}

/// Report the first lock that would conflict with `range`
pub fn getlk(file: &File, range: LockRange) -> io::Result<LockRange> {
    let mut fl = to_flock(&range);
    if unsafe { libc::fcntl(file.as_raw_fd(), GETLK, &mut fl as *mut libc::flock) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let start = fl.l_start as u64;
    let end = if fl.l_len == 0 {
        u64::MAX
    } else {
        start + fl.l_len as u64 - 1
    };
    Ok(LockRange {
        start,
        end,
        typ: fl.l_type as i32,
        pid: if fl.l_pid < 0 { 0 } else { fl.l_pid as u32 },
    })
}

/// Acquire or release a lock, blocking when `sleep` is set
pub fn setlk(file: &File, kind: LockKind, range: LockRange, sleep: bool) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let ret = match kind {
        LockKind::Flock => {
            let mut op = match range.typ {
                t if t == libc::F_RDLCK as i32 => libc::LOCK_SH,
                t if t == libc::F_WRLCK as i32 => libc::LOCK_EX,
                t if t == libc::F_UNLCK as i32 => libc::LOCK_UN,
                _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
            };
            if !sleep {
                op |= libc::LOCK_NB;
            }
            unsafe { libc::flock(fd, op) }
        }
        LockKind::Posix => {
            let fl = to_flock(&range);
            let cmd = if sleep { SETLKW } else { SETLK };
            unsafe { libc::fcntl(fd, cmd, &fl as *const libc::flock) }
        }
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whole(typ: i32) -> LockRange {
        LockRange {
            start: 0,
            end: u64::MAX,
            typ,
            pid: 0,
        }
    }

    #[test]
    fn test_posix_locks_conflict_across_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"data").unwrap();
        let a = File::options().read(true).write(true).open(&path).unwrap();
        let b = File::options().read(true).write(true).open(&path).unwrap();

        setlk(&a, LockKind::Posix, whole(libc::F_WRLCK as i32), false).unwrap();

        let conflict = getlk(&b, whole(libc::F_WRLCK as i32)).unwrap();
        assert_eq!(conflict.typ, libc::F_WRLCK as i32);
        assert!(setlk(&b, LockKind::Posix, whole(libc::F_WRLCK as i32), false).is_err());

        setlk(&a, LockKind::Posix, whole(libc::F_UNLCK as i32), false).unwrap();
        assert_eq!(getlk(&b, whole(libc::F_WRLCK as i32)).unwrap().typ, libc::F_UNLCK as i32);
    }

    #[test]
    fn test_flock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"data").unwrap();
        let a = File::open(&path).unwrap();
        let b = File::open(&path).unwrap();

        setlk(&a, LockKind::Flock, whole(libc::F_WRLCK as i32), false).unwrap();
        let err = setlk(&b, LockKind::Flock, whole(libc::F_RDLCK as i32), false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EWOULDBLOCK));
        setlk(&a, LockKind::Flock, whole(libc::F_UNLCK as i32), false).unwrap();
        setlk(&b, LockKind::Flock, whole(libc::F_RDLCK as i32), false).unwrap();
    }
}
