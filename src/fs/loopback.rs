//! Passthrough operations on the source tree
//!
//! Everything the mount does to directories, links and metadata is
//! forwarded here to the backing filesystem as-is. Paths are absolute
//! backing paths; the caller resolves them through [`Root::abs_path`].
//!
//! [`Root::abs_path`]: super::Root::abs_path

use crate::error::{Error, Result};
use fuser::{FileAttr, FileType};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use std::ffi::{CString, OsString};
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Directory entry captured at opendir time
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    /// Backing inode number; callers mix in the device before exposing it
    pub ino: u64,
    pub kind: FileType,
}

/// Filesystem statistics as `statfs` reports them
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Map the `S_IFMT` bits of a mode to a FUSE file type
pub fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Build the attributes FUSE reports for a backing file
pub fn file_attr(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: file_type(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// `lstat`: the final symlink is never followed
pub fn stat(path: &Path) -> Result<Metadata> {
    Ok(fs::symlink_metadata(path)?)
}

/// Snapshot a directory's entries. `.` and `..` are not included.
pub fn read_dir(path: &Path) -> Result<Vec<DirEntry>> {
    use std::os::unix::fs::DirEntryExt;

    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let kind = match entry.file_type() {
            Ok(ft) if ft.is_dir() => FileType::Directory,
            Ok(ft) if ft.is_symlink() => FileType::Symlink,
            Ok(_) => match entry.metadata() {
                Ok(meta) => file_type(meta.mode()),
                // vanished between readdir and stat
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        entries.push(DirEntry {
            name: entry.file_name(),
            ino: entry.ino(),
            kind,
        });
    }
    Ok(entries)
}

pub fn readlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

pub fn mkdir(path: &Path, mode: u32, umask: u32) -> Result<()> {
    DirBuilder::new().mode(mode & !umask & 0o7777).create(path)?;
    Ok(())
}

/// Create a device node, fifo, socket or empty regular file
pub fn mknod(path: &Path, mode: u32, umask: u32, rdev: u32) -> Result<()> {
    let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t);
    let perm = Mode::from_bits_truncate((mode & !umask & 0o7777) as libc::mode_t);
    nix::sys::stat::mknod(path, kind, perm, rdev as libc::dev_t).map_err(io::Error::from)?;
    Ok(())
}

pub fn unlink(path: &Path) -> Result<()> {
    Ok(fs::remove_file(path)?)
}

pub fn rmdir(path: &Path) -> Result<()> {
    Ok(fs::remove_dir(path)?)
}

pub fn symlink(target: &Path, link: &Path) -> Result<()> {
    Ok(std::os::unix::fs::symlink(target, link)?)
}

pub fn link(existing: &Path, new: &Path) -> Result<()> {
    Ok(fs::hard_link(existing, new)?)
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Io(io::Error::from_raw_os_error(libc::EINVAL)))
}

/// Rename, honoring `RENAME_NOREPLACE` and `RENAME_EXCHANGE` where the OS has them
pub fn rename(from: &Path, to: &Path, flags: u32) -> Result<()> {
    if flags == 0 {
        return Ok(fs::rename(from, to)?);
    }
    rename_with_flags(from, to, flags)
}

#[cfg(target_os = "linux")]
fn rename_with_flags(from: &Path, to: &Path, flags: u32) -> Result<()> {
    let from = cstring(from)?;
    let to = cstring(to)?;
    let ret = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            flags as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn rename_with_flags(from: &Path, to: &Path, _flags: u32) -> Result<()> {
    let _ = (cstring(from)?, cstring(to)?);
    Err(io::Error::from_raw_os_error(libc::EINVAL).into())
}

pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    Ok(fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?)
}

pub fn chown(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    Ok(std::os::unix::fs::lchown(path, uid, gid)?)
}

/// Set access and/or modification time; a missing one keeps its current value
pub fn set_times(path: &Path, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<()> {
    if atime.is_none() && mtime.is_none() {
        return Ok(());
    }
    let meta = stat(path)?;
    let atime = atime
        .map(filetime::FileTime::from_system_time)
        .unwrap_or_else(|| filetime::FileTime::from_last_access_time(&meta));
    let mtime = mtime
        .map(filetime::FileTime::from_system_time)
        .unwrap_or_else(|| filetime::FileTime::from_last_modification_time(&meta));
    filetime::set_symlink_file_times(path, atime, mtime)?;
    Ok(())
}

pub fn truncate(path: &Path, size: u64) -> Result<()> {
    nix::unistd::truncate(path, size as libc::off_t).map_err(io::Error::from)?;
    Ok(())
}

pub fn statfs(path: &Path) -> Result<StatFs> {
    let st = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    Ok(StatFs {
        blocks: st.blocks() as u64,
        bfree: st.blocks_free() as u64,
        bavail: st.blocks_available() as u64,
        files: st.files() as u64,
        ffree: st.files_free() as u64,
        bsize: st.block_size() as u32,
        namelen: st.name_max() as u32,
        frsize: st.fragment_size() as u32,
    })
}

pub fn access(path: &Path, mask: i32) -> Result<()> {
    nix::unistd::access(path, AccessFlags::from_bits_truncate(mask)).map_err(io::Error::from)?;
    Ok(())
}

/// Open a backing file with raw `open(2)` flags.
///
/// `create_mode` is applied when the flags include `O_CREAT`.
pub fn open(path: &Path, flags: i32, create_mode: Option<u32>) -> Result<File> {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options.custom_flags(flags & !libc::O_ACCMODE);
    if let Some(mode) = create_mode {
        options.mode(mode & 0o7777);
    }
    Ok(options.open(path)?)
}

/// Hand a freshly created entry to the requesting user when we run as root
pub fn preserve_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    chown(path, Some(uid), Some(gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_attr_kinds() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"hello world").unwrap();
        symlink(Path::new("f"), &dir.path().join("l")).unwrap();

        let attr = file_attr(&stat(&file).unwrap(), 42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 11);
        assert_eq!(attr.kind, FileType::RegularFile);

        let attr = file_attr(&stat(&dir.path().join("l")).unwrap(), 43);
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(file_attr(&stat(dir.path()).unwrap(), 1).kind, FileType::Directory);
    }

    #[test]
    fn test_read_dir_snapshot() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::write(dir.path().join("file2.txt"), b"2").unwrap();
        mkdir(&dir.path().join("subdir"), 0o755, 0o022).unwrap();

        let mut entries = read_dir(dir.path()).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].name, "subdir");
        assert_eq!(entries[2].kind, FileType::Directory);
        assert_eq!(entries[0].ino, stat(&dir.path().join("file1.txt")).unwrap().ino());
    }

    #[test]
    fn test_mkdir_applies_umask() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        mkdir(&sub, 0o777, 0o027).unwrap();
        assert_eq!(stat(&sub).unwrap().mode() & 0o777, 0o750);
        rmdir(&sub).unwrap();
        assert!(stat(&sub).is_err());
    }

    #[test]
    fn test_mknod_fifo() {
        let dir = tempdir().unwrap();
        let fifo = dir.path().join("pipe");
        mknod(&fifo, libc::S_IFIFO as u32 | 0o644, 0, 0).unwrap();
        assert_eq!(file_attr(&stat(&fifo).unwrap(), 2).kind, FileType::NamedPipe);
    }

    #[test]
    fn test_rename_noreplace() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        if cfg!(target_os = "linux") {
            let err = rename(&a, &b, libc::RENAME_NOREPLACE as u32).unwrap_err();
            // some filesystems lack renameat2 flag support
            assert!(matches!(err.to_errno(), libc::EEXIST | libc::EINVAL));
        }
        rename(&a, &b, 0).unwrap();
        assert_eq!(fs::read(&b).unwrap(), b"a");
        assert!(stat(&a).is_err());
    }

    #[test]
    fn test_set_times_partial() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"").unwrap();
        let before = stat(&file).unwrap();

        let mtime = UNIX_EPOCH + Duration::from_secs(1_000_000);
        set_times(&file, None, Some(mtime)).unwrap();
        let after = stat(&file).unwrap();
        assert_eq!(after.mtime(), 1_000_000);
        assert_eq!(after.atime(), before.atime());
    }

    #[test]
    fn test_open_with_flags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new");
        let file = open(&path, libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, Some(0o600)).unwrap();
        assert_eq!(file.metadata().unwrap().mode() & 0o777, 0o600);
        assert!(open(&path, libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, Some(0o600)).is_err());

        truncate(&path, 10).unwrap();
        assert_eq!(stat(&path).unwrap().len(), 10);
        chmod(&path, 0o640).unwrap();
        assert_eq!(stat(&path).unwrap().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_statfs_and_access() {
        let dir = tempdir().unwrap();
        let st = statfs(dir.path()).unwrap();
        assert!(st.bsize > 0);
        access(dir.path(), libc::R_OK | libc::W_OK).unwrap();
        assert!(access(&dir.path().join("absent"), libc::F_OK).is_err());
    }
}
