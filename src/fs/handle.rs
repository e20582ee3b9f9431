//! Open file handles
//!
//! An [`EncryptingFile`] is created on `open`/`create` and owns the backing
//! descriptor until `release`. Its mode is fixed at open time from the
//! ignore policy:
//!
//! - passthrough: every call goes straight to the descriptor
//! - encrypted: the plaintext is decrypted into memory on first access,
//!   edited there, and re-encrypted to a temporary sibling that atomically
//!   replaces the ciphertext on flush
//!
//! Handles opened separately on the same path do not share buffers. The
//! flush that commits last wins.

use super::lock::{self, LockKind, LockRange};
use super::loopback::{self, DirEntry};
use super::Root;
use crate::cache::{self, SIZE_XATTR};
use crate::crypto;
use crate::error::{Error, Result};
use crate::xattr;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{File, Metadata};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// How a handle treats file content, decided once per open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Passthrough,
    Encrypted,
}

struct HandleState {
    /// Location relative to the source root; `None` once unlinked
    rel_path: Option<PathBuf>,
    /// `None` after release
    file: Option<File>,
    /// Decrypted content, loaded on first access
    buffer: Option<Zeroizing<Vec<u8>>>,
    dirty: bool,
}

/// Per-open state for one file
pub struct EncryptingFile {
    root: Arc<Root>,
    ino: u64,
    mode: FileMode,
    flags: i32,
    state: Mutex<HandleState>,
}

fn errno(code: i32) -> Error {
    Error::Io(io::Error::from_raw_os_error(code))
}

impl EncryptingFile {
    /// Open the backing file for `rel_path` with raw open flags.
    ///
    /// `O_APPEND` is dropped: the kernel computes append offsets from the
    /// size we report, which differs from the ciphertext length.
    pub fn open(
        root: Arc<Root>,
        ino: u64,
        rel_path: PathBuf,
        flags: i32,
        create_mode: Option<u32>,
    ) -> Result<Self> {
        let flags = flags & !libc::O_APPEND;
        let file = loopback::open(&root.abs_path(&rel_path), flags, create_mode)?;
        Self::from_file(root, ino, rel_path, flags, file)
    }

    /// Wrap a descriptor that was opened with `flags`
    pub fn from_file(root: Arc<Root>, ino: u64, rel_path: PathBuf, flags: i32, file: File) -> Result<Self> {
        let flags = flags & !libc::O_APPEND;
        let abs = root.abs_path(&rel_path);
        let mode = if root.should_encrypt(&rel_path) {
            FileMode::Encrypted
        } else {
            FileMode::Passthrough
        };

        let mut buffer = None;
        if mode == FileMode::Encrypted && flags & libc::O_TRUNC != 0 {
            // the open already emptied the ciphertext
            cache::clear_size(&abs)?;
            buffer = Some(Zeroizing::new(Vec::new()));
        }
        debug!("Opened {:?} in {:?} mode (flags={:#o})", rel_path, mode, flags);

        Ok(EncryptingFile {
            root,
            ino,
            mode,
            flags,
            state: Mutex::new(HandleState {
                rel_path: Some(rel_path),
                file: Some(file),
                buffer,
                dirty: false,
            }),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn is_readable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_RDONLY || accmode == libc::O_RDWR
    }

    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    /// Whether there are edits not yet written back
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Point the handle at the entry's current location after a rename or unlink
    pub fn relocate(&self, rel_path: Option<PathBuf>) {
        self.state.lock().rel_path = rel_path;
    }

    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut st = self.state.lock();
        match self.mode {
            FileMode::Passthrough => {
                let file = st.file.as_ref().ok_or(Error::BadDescriptor)?;
                let mut buf = vec![0u8; size as usize];
                let mut filled = 0;
                while filled < buf.len() {
                    match file.read_at(&mut buf[filled..], offset + filled as u64) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                buf.truncate(filled);
                Ok(buf)
            }
            FileMode::Encrypted => {
                let plaintext = self.load(&mut st)?;
                let len = plaintext.len();
                let start = offset.min(len as u64) as usize;
                let end = start.saturating_add(size as usize).min(len);
                Ok(plaintext[start..end].to_vec())
            }
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let mut st = self.state.lock();
        match self.mode {
            FileMode::Passthrough => {
                let file = st.file.as_ref().ok_or(Error::BadDescriptor)?;
                file.write_all_at(data, offset)?;
            }
            FileMode::Encrypted => {
                let start = usize::try_from(offset).map_err(|_| errno(libc::EFBIG))?;
                let end = start
                    .checked_add(data.len())
                    .ok_or_else(|| errno(libc::EFBIG))?;
                let buffer = self.load(&mut st)?;
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(data);
                st.dirty = true;
            }
        }
        Ok(data.len() as u32)
    }

    /// Write back pending edits; a clean handle touches nothing
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.file.is_none() {
            return Err(Error::BadDescriptor);
        }
        if self.mode == FileMode::Encrypted && st.dirty {
            self.write_back(&mut st)?;
        }
        Ok(())
    }

    pub fn fsync(&self, datasync: bool) -> Result<()> {
        let mut st = self.state.lock();
        if self.mode == FileMode::Encrypted && st.dirty {
            self.write_back(&mut st)?;
        }
        let file = st.file.as_ref().ok_or(Error::BadDescriptor)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Close the descriptor. A second release is `BadDescriptor`.
    pub fn release(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.file.is_none() {
            return Err(Error::BadDescriptor);
        }
        let result = if self.mode == FileMode::Encrypted && st.dirty {
            self.write_back(&mut st)
        } else {
            Ok(())
        };
        st.file = None;
        st.buffer = None;
        st.dirty = false;
        result
    }

    /// Resize the file. In encrypted mode the new content is written back
    /// before returning so the reported size matches what is on disk.
    pub fn set_size(&self, size: u64) -> Result<()> {
        let mut st = self.state.lock();
        match self.mode {
            FileMode::Passthrough => {
                st.file
                    .as_ref()
                    .ok_or(Error::BadDescriptor)?
                    .set_len(size)?;
            }
            FileMode::Encrypted => {
                let len = usize::try_from(size).map_err(|_| errno(libc::EFBIG))?;
                if len == 0 {
                    st.file.as_ref().ok_or(Error::BadDescriptor)?.set_len(0)?;
                    if let Some(rel) = &st.rel_path {
                        cache::clear_size(&self.root.abs_path(rel))?;
                    }
                    st.buffer = Some(Zeroizing::new(Vec::new()));
                } else {
                    self.load(&mut st)?.resize(len, 0);
                }
                st.dirty = true;
                self.write_back(&mut st)?;
            }
        }
        Ok(())
    }

    /// Backing metadata plus the size applications see
    pub fn attr(&self) -> Result<(Metadata, u64)> {
        let mut st = self.state.lock();
        let meta = st.file.as_ref().ok_or(Error::BadDescriptor)?.metadata()?;
        let size = match self.mode {
            FileMode::Passthrough => meta.len(),
            FileMode::Encrypted => {
                let loaded = st.buffer.as_ref().map(|b| b.len() as u64);
                match (loaded, st.rel_path.clone()) {
                    (Some(len), _) => len,
                    (None, Some(rel)) => self.root.plaintext_size(&rel)?,
                    (None, None) => self.load(&mut st)?.len() as u64,
                }
            }
        };
        Ok((meta, size))
    }

    /// Plaintext length when the content is already in memory
    pub fn loaded_size(&self) -> Option<u64> {
        if self.mode != FileMode::Encrypted {
            return None;
        }
        self.state.lock().buffer.as_ref().map(|b| b.len() as u64)
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        let mut st = self.state.lock();
        match self.mode {
            FileMode::Passthrough => {
                let fd = st.file.as_ref().ok_or(Error::BadDescriptor)?.as_raw_fd();
                let ret = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
                if ret < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(ret as i64)
            }
            FileMode::Encrypted => {
                if offset < 0 {
                    return Err(errno(libc::EINVAL));
                }
                let len = self.load(&mut st)?.len() as i64;
                match whence {
                    libc::SEEK_SET => Ok(offset),
                    libc::SEEK_END => Ok(len + offset),
                    libc::SEEK_DATA if offset < len => Ok(offset),
                    libc::SEEK_HOLE if offset < len => Ok(len),
                    libc::SEEK_DATA | libc::SEEK_HOLE => Err(errno(libc::ENXIO)),
                    _ => Err(errno(libc::EINVAL)),
                }
            }
        }
    }

    pub fn getlk(&self, range: LockRange) -> Result<LockRange> {
        let st = self.state.lock();
        let file = st.file.as_ref().ok_or(Error::BadDescriptor)?;
        Ok(lock::getlk(file, range)?)
    }

    /// Forward a lock request; a blocking wait does not hold the handle
    pub fn setlk(&self, kind: LockKind, range: LockRange, sleep: bool) -> Result<()> {
        // the duplicate shares the open file description and so its locks
        let file = {
            let st = self.state.lock();
            st.file.as_ref().ok_or(Error::BadDescriptor)?.try_clone()?
        };
        Ok(lock::setlk(&file, kind, range, sleep)?)
    }

    pub fn fallocate(&self, offset: i64, length: i64, mode: i32) -> Result<()> {
        if self.mode == FileMode::Encrypted {
            return Err(errno(libc::EOPNOTSUPP));
        }
        let st = self.state.lock();
        let file = st.file.as_ref().ok_or(Error::BadDescriptor)?;
        Ok(fallocate(file, offset, length, mode)?)
    }

    fn load<'a>(&self, st: &'a mut HandleState) -> Result<&'a mut Zeroizing<Vec<u8>>> {
        if st.buffer.is_none() {
            let plaintext = self.decrypt_current(st)?;
            st.buffer = Some(plaintext);
        }
        st.buffer
            .as_mut()
            .ok_or_else(|| Error::Internal("plaintext buffer missing after load".to_string()))
    }

    fn decrypt_current(&self, st: &HandleState) -> Result<Zeroizing<Vec<u8>>> {
        let file = st.file.as_ref().ok_or(Error::BadDescriptor)?;
        let mut ciphertext = Vec::new();
        if self.is_readable() {
            let mut reader: &File = file;
            reader.seek(SeekFrom::Start(0))?;
            reader.read_to_end(&mut ciphertext)?;
        } else {
            let rel = st.rel_path.as_ref().ok_or(Error::BadDescriptor)?;
            File::open(self.root.abs_path(rel))?.read_to_end(&mut ciphertext)?;
        }

        if ciphertext.is_empty() {
            return Ok(Zeroizing::new(Vec::new()));
        }
        let plaintext = crypto::decrypt(&ciphertext[..], self.root.keyring().identities())?;
        debug!(
            "Decrypted {} bytes of ciphertext into {} bytes for inode {}",
            ciphertext.len(),
            plaintext.len(),
            self.ino
        );
        Ok(plaintext)
    }

    /// Re-encrypt the buffer into a temporary sibling and rename it over the
    /// target. On any failure the temporary file is removed and the buffer
    /// and dirty flag are left as they were.
    fn write_back(&self, st: &mut HandleState) -> Result<()> {
        let rel = match &st.rel_path {
            Some(rel) => rel.clone(),
            None => {
                debug!("Dropping pending edits for unlinked inode {}", self.ino);
                st.dirty = false;
                return Ok(());
            }
        };
        let target = self.root.abs_path(&rel);
        let dir = target
            .parent()
            .ok_or_else(|| Error::Internal(format!("no parent directory for {:?}", target)))?;
        let meta = st.file.as_ref().ok_or(Error::BadDescriptor)?.metadata()?;
        let plaintext: &[u8] = st.buffer.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
        let size = plaintext.len() as u64;

        let mut tmp = tempfile::Builder::new()
            .prefix(".agefs-")
            .tempfile_in(dir)?;
        let tmp_meta = tmp.as_file().metadata()?;
        if tmp_meta.uid() != meta.uid() || tmp_meta.gid() != meta.gid() {
            if let Err(e) = std::os::unix::fs::fchown(tmp.as_file(), Some(meta.uid()), Some(meta.gid())) {
                warn!("Failed to keep ownership of {:?}: {}", rel, e);
            }
        }
        tmp.as_file().set_permissions(meta.permissions())?;
        copy_attributes(&target, tmp.path());

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            crypto::encrypt(plaintext, self.root.keyring().recipients(), &mut writer, false)?;
            writer.flush()?;
        }
        if let Err(e) = cache::store_size(tmp.path(), size) {
            warn!("Failed to cache plaintext size for {:?}: {}", rel, e);
        }
        tmp.as_file().sync_all()?;

        // the kernel keeps addressing this file by its current number
        let replacement = self.root.stable_ino(tmp_meta.dev(), tmp_meta.ino());
        let previous = self.root.inos().supersede(self.ino, replacement);
        let file = match tmp.persist(&target) {
            Ok(file) => file,
            Err(e) => {
                self.root.inos().restore(self.ino, previous);
                return Err(Error::Io(e.error));
            }
        };
        debug!("Wrote back {} plaintext bytes to {:?}", size, rel);
        st.file = Some(file);
        st.dirty = false;
        Ok(())
    }
}

/// Carry user attributes over to the replacement file, best-effort
fn copy_attributes(from: &Path, to: &Path) {
    let names = match xattr::list(from) {
        Ok(names) => names,
        Err(_) => return,
    };
    for name in names {
        if name == SIZE_XATTR {
            continue;
        }
        if let Ok(Some(value)) = xattr::get(from, &name) {
            if let Err(e) = xattr::set(to, &name, &value, 0) {
                debug!("Not copying attribute {:?}: {}", name, e);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn fallocate(file: &File, offset: i64, length: i64, mode: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            mode,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn fallocate(_file: &File, _offset: i64, _length: i64, _mode: i32) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
}

/// Open file and directory handles by FUSE handle number
pub struct HandleTable {
    next_fh: AtomicU64,
    files: DashMap<u64, Arc<EncryptingFile>>,
    /// inode -> handle numbers open on it
    by_ino: DashMap<u64, Vec<u64>>,
    dirs: DashMap<u64, Arc<Vec<DirEntry>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_fh: AtomicU64::new(1),
            files: DashMap::new(),
            by_ino: DashMap::new(),
            dirs: DashMap::new(),
        }
    }

    fn alloc(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_file(&self, file: EncryptingFile) -> u64 {
        let fh = self.alloc();
        self.by_ino.entry(file.ino()).or_default().push(fh);
        self.files.insert(fh, Arc::new(file));
        fh
    }

    pub fn file(&self, fh: u64) -> Result<Arc<EncryptingFile>> {
        self.files
            .get(&fh)
            .map(|f| Arc::clone(f.value()))
            .ok_or(Error::BadDescriptor)
    }

    pub fn remove_file(&self, fh: u64) -> Option<Arc<EncryptingFile>> {
        let (_, file) = self.files.remove(&fh)?;
        self.by_ino.remove_if_mut(&file.ino(), |_, fhs| {
            fhs.retain(|&f| f != fh);
            fhs.is_empty()
        });
        Some(file)
    }

    /// Handles currently open on `ino`
    pub fn files_for(&self, ino: u64) -> Vec<Arc<EncryptingFile>> {
        let fhs = match self.by_ino.get(&ino) {
            Some(fhs) => fhs.value().clone(),
            None => return Vec::new(),
        };
        fhs.iter()
            .filter_map(|fh| self.files.get(fh).map(|f| Arc::clone(f.value())))
            .collect()
    }

    /// In-memory plaintext length of any open handle on `ino`
    pub fn loaded_size(&self, ino: u64) -> Option<u64> {
        self.files_for(ino).iter().find_map(|f| f.loaded_size())
    }

    pub fn insert_dir(&self, entries: Vec<DirEntry>) -> u64 {
        let fh = self.alloc();
        self.dirs.insert(fh, Arc::new(entries));
        fh
    }

    pub fn dir(&self, fh: u64) -> Result<Arc<Vec<DirEntry>>> {
        self.dirs
            .get(&fh)
            .map(|d| Arc::clone(d.value()))
            .ok_or(Error::BadDescriptor)
    }

    pub fn remove_dir(&self, fh: u64) -> bool {
        self.dirs.remove(&fh).is_some()
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::root::tests::test_root;
    use crate::identity::{Identity, Keyring};
    use crate::policy::IgnorePolicy;
    use age::secrecy::ExposeSecret;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn open(root: &Arc<Root>, rel: &str, flags: i32) -> EncryptingFile {
        EncryptingFile::open(Arc::clone(root), 2, PathBuf::from(rel), flags, Some(0o644)).unwrap()
    }

    fn put_ciphertext(root: &Root, rel: &str, plaintext: &[u8]) {
        let file = File::create(root.abs_path(Path::new(rel))).unwrap();
        crypto::encrypt(plaintext, root.keyring().recipients(), file, false).unwrap();
    }

    fn decrypt_on_disk(root: &Root, rel: &str) -> Vec<u8> {
        let file = File::open(root.abs_path(Path::new(rel))).unwrap();
        crypto::decrypt(file, root.keyring().identities()).unwrap().to_vec()
    }

    #[test]
    fn test_write_flush_read_back() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));

        let h = open(&root, "notes", libc::O_RDWR | libc::O_CREAT);
        assert_eq!(h.mode(), FileMode::Encrypted);
        h.write(0, b"hello").unwrap();
        h.write(5, b" world").unwrap();
        assert_eq!(h.read(0, 100).unwrap(), b"hello world");
        assert!(h.read(20, 5).unwrap().is_empty());
        assert_eq!(h.read(6, 3).unwrap(), b"wor");

        std::fs::set_permissions(dir.path().join("notes"), std::fs::Permissions::from_mode(0o640))
            .unwrap();
        assert!(h.is_dirty());
        h.flush().unwrap();
        assert!(!h.is_dirty());

        let raw = std::fs::read(dir.path().join("notes")).unwrap();
        assert!(!raw.windows(5).any(|w| w == b"hello"));
        assert_eq!(decrypt_on_disk(&root, "notes"), b"hello world");
        let mode = std::fs::metadata(dir.path().join("notes")).unwrap().mode();
        assert_eq!(mode & 0o777, 0o640);

        // buffer survives the flush
        assert_eq!(h.loaded_size(), Some(11));
        assert_eq!(h.attr().unwrap().1, 11);

        h.release().unwrap();
        assert!(matches!(h.release(), Err(Error::BadDescriptor)));
        assert!(matches!(h.read(0, 1), Err(Error::BadDescriptor)));
    }

    #[test]
    fn test_clean_flush_is_noop() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        put_ciphertext(&root, "secret", b"payload");
        let path = dir.path().join("secret");
        let before = std::fs::read(&path).unwrap();
        let ino = std::fs::metadata(&path).unwrap().ino();
        let cached = cache::cached_size(&path).unwrap();

        let h = open(&root, "secret", libc::O_RDWR);
        assert_eq!(h.read(0, 100).unwrap(), b"payload");
        h.flush().unwrap();
        h.fsync(false).unwrap();
        h.release().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(std::fs::metadata(&path).unwrap().ino(), ino);
        assert_eq!(cache::cached_size(&path).unwrap(), cached);
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        let h = open(&root, "sparse", libc::O_RDWR | libc::O_CREAT);

        h.write(4, b"x").unwrap();
        assert_eq!(h.read(0, 10).unwrap(), b"\0\0\0\0x");
        h.release().unwrap();
        assert_eq!(decrypt_on_disk(&root, "sparse"), b"\0\0\0\0x");
    }

    #[test]
    fn test_size_cached_after_flush() {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            return;
        }
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        let h = open(&root, "big", libc::O_RDWR | libc::O_CREAT);
        h.write(0, &[9u8; 70_000]).unwrap();
        h.flush().unwrap();

        let path = dir.path().join("big");
        assert_eq!(cache::cached_size(&path).unwrap(), Some(70_000));
        // no identities: only the cached value can answer
        assert_eq!(cache::plaintext_size(&path, &[]).unwrap(), 70_000);
    }

    #[test]
    fn test_failed_write_back_keeps_original() {
        let dir = tempdir().unwrap();
        let key = age::x25519::Identity::generate();
        let secret = key.to_string();
        let identity = || Identity::Native(secret.expose_secret().parse().unwrap());

        let good = Arc::new(
            Root::new(
                dir.path().to_path_buf(),
                Keyring::from_identities(vec![identity()]).unwrap(),
                IgnorePolicy::encrypt_all(),
            )
            .unwrap(),
        );
        // decrypts fine but has nothing to encrypt to
        let broken = Arc::new(
            Root::new(
                dir.path().to_path_buf(),
                Keyring::new(vec![identity()], Vec::new()),
                IgnorePolicy::encrypt_all(),
            )
            .unwrap(),
        );
        put_ciphertext(&good, "doc", b"original");
        let before = std::fs::read(dir.path().join("doc")).unwrap();

        let h = open(&broken, "doc", libc::O_RDWR);
        h.write(0, b"replaced").unwrap();
        assert!(matches!(h.flush(), Err(Error::Encrypt(_))));
        assert!(h.is_dirty());
        assert_eq!(h.read(0, 100).unwrap(), b"replaced");
        assert!(h.flush().is_err());

        assert_eq!(std::fs::read(dir.path().join("doc")).unwrap(), before);
        assert_eq!(decrypt_on_disk(&good, "doc"), b"original");
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".agefs-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_set_size() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        put_ciphertext(&root, "f", b"hello world");
        let h = open(&root, "f", libc::O_RDWR);

        h.set_size(5).unwrap();
        assert!(!h.is_dirty());
        assert_eq!(decrypt_on_disk(&root, "f"), b"hello");

        h.set_size(0).unwrap();
        assert!(decrypt_on_disk(&root, "f").is_empty());

        h.set_size(3).unwrap();
        assert_eq!(decrypt_on_disk(&root, "f"), b"\0\0\0");
        assert_eq!(h.attr().unwrap().1, 3);
    }

    #[test]
    fn test_last_writer_wins() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        put_ciphertext(&root, "shared", b"aaaaaaaaaa");

        let first = open(&root, "shared", libc::O_RDWR);
        let second = open(&root, "shared", libc::O_RDWR);
        first.write(0, b"11").unwrap();
        second.write(5, b"22").unwrap();

        first.flush().unwrap();
        assert_eq!(decrypt_on_disk(&root, "shared"), b"11aaaaaaaa");
        second.flush().unwrap();
        assert_eq!(decrypt_on_disk(&root, "shared"), b"aaaaa22aaa");
    }

    #[test]
    fn test_passthrough_mode() {
        let dir = tempdir().unwrap();
        let policy = IgnorePolicy::from_reader(&b"*.txt\n"[..]).unwrap();
        let root = Arc::new(test_root(dir.path(), policy));

        let plain = open(&root, "readme.txt", libc::O_RDWR | libc::O_CREAT | libc::O_APPEND);
        assert_eq!(plain.mode(), FileMode::Passthrough);
        plain.write(0, b"plain").unwrap();
        plain.write(5, b" text").unwrap();
        plain.flush().unwrap();
        assert_eq!(std::fs::read(dir.path().join("readme.txt")).unwrap(), b"plain text");
        assert_eq!(plain.read(6, 4).unwrap(), b"text");
        assert_eq!(plain.loaded_size(), None);
        plain.set_size(5).unwrap();
        assert_eq!(plain.attr().unwrap().1, 5);

        let secret = open(&root, "key.pem", libc::O_RDWR | libc::O_CREAT);
        assert_eq!(secret.mode(), FileMode::Encrypted);
    }

    #[test]
    fn test_open_truncate() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        put_ciphertext(&root, "t", b"old content");

        let h = open(&root, "t", libc::O_RDWR | libc::O_TRUNC);
        assert!(h.read(0, 100).unwrap().is_empty());
        h.release().unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("t")).unwrap().len(), 0);
        assert_eq!(root.plaintext_size(Path::new("t")).unwrap(), 0);
    }

    #[test]
    fn test_lseek_data_and_hole() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        put_ciphertext(&root, "s", b"0123456789");
        let h = open(&root, "s", libc::O_RDONLY);

        assert_eq!(h.lseek(3, libc::SEEK_DATA).unwrap(), 3);
        assert_eq!(h.lseek(3, libc::SEEK_HOLE).unwrap(), 10);
        assert_eq!(h.lseek(10, libc::SEEK_DATA).unwrap_err().to_errno(), libc::ENXIO);
        assert_eq!(h.fallocate(0, 10, 0).unwrap_err().to_errno(), libc::EOPNOTSUPP);
    }

    #[test]
    fn test_wrong_key_read_fails_and_retries() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        let other = test_root(dir.path(), IgnorePolicy::encrypt_all());
        put_ciphertext(&other, "foreign", b"not yours");

        let h = open(&root, "foreign", libc::O_RDONLY);
        let err = h.read(0, 10).unwrap_err();
        assert!(matches!(err, Error::Decrypt(_)));
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!(h.loaded_size(), None);
        assert!(h.read(0, 10).is_err());
    }

    #[test]
    fn test_locks_forward() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        let a = open(&root, "l", libc::O_RDWR | libc::O_CREAT);
        let b = open(&root, "l", libc::O_RDWR);
        let range = |typ: i32| LockRange {
            start: 0,
            end: u64::MAX,
            typ,
            pid: 0,
        };

        a.setlk(LockKind::Posix, range(libc::F_WRLCK as i32), false).unwrap();
        assert_eq!(b.getlk(range(libc::F_WRLCK as i32)).unwrap().typ, libc::F_WRLCK as i32);
        assert!(b.setlk(LockKind::Posix, range(libc::F_WRLCK as i32), false).is_err());
    }

    #[test]
    fn test_handle_table() {
        let dir = tempdir().unwrap();
        let root = Arc::new(test_root(dir.path(), IgnorePolicy::encrypt_all()));
        let table = HandleTable::new();

        let fh = table.insert_file(open(&root, "x", libc::O_RDWR | libc::O_CREAT));
        table.file(fh).unwrap().write(0, b"abc").unwrap();
        assert_eq!(table.loaded_size(2), Some(3));
        assert_eq!(table.loaded_size(3), None);
        assert_eq!(table.files_for(2).len(), 1);

        let dh = table.insert_dir(Vec::new());
        assert_ne!(dh, fh);
        assert!(table.dir(dh).unwrap().is_empty());
        assert!(table.remove_dir(dh));
        assert!(matches!(table.dir(dh), Err(Error::BadDescriptor)));

        let second = table.insert_file(open(&root, "x", libc::O_RDONLY));
        assert_eq!(table.files_for(2).len(), 2);
        assert!(table.remove_file(second).is_some());
        assert_eq!(table.files_for(2).len(), 1);

        assert!(table.remove_file(fh).is_some());
        assert!(matches!(table.file(fh), Err(Error::BadDescriptor)));
        assert!(table.files_for(2).is_empty());
        assert!(table.remove_file(fh).is_none());
        assert_eq!(table.open_files(), 0);
    }
}
