//! FUSE filesystem implementation
//!
//! Every request that touches the disk is handed, together with its reply,
//! to a worker of the runtime's blocking pool. Content I/O goes through
//! [`EncryptingFile`]; everything else is passthrough.

use super::handle::{EncryptingFile, HandleTable};
use super::inode::{InodeTable, ROOT_INO};
use super::lock::{LockKind, LockRange};
use super::loopback;
use super::Root;
use crate::cache::SIZE_XATTR;
use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::xattr;
use fuser::{
    FileAttr, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

#[cfg(target_os = "linux")]
const RENAME_EXCHANGE: u32 = libc::RENAME_EXCHANGE as u32;
#[cfg(not(target_os = "linux"))]
const RENAME_EXCHANGE: u32 = 0;

/// Attribute changes requested by one `setattr`
struct SetAttr {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
    fh: Option<u64>,
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn log_failure(op: &str, e: &Error) {
    match e {
        Error::Io(_) | Error::InodeNotFound(_) | Error::PathNotFound(_) | Error::BadDescriptor => {
            debug!("{} failed: {}", op, e)
        }
        _ => error!("{} failed: {}", op, e),
    }
}

fn to_offset(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)))
}

/// Answer an xattr query honoring the caller's buffer size
fn reply_xattr(reply: ReplyXattr, size: u32, value: &[u8]) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

/// State shared by all request workers
struct Inner {
    root: Arc<Root>,
    inodes: InodeTable,
    handles: HandleTable,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl Inner {
    fn abs(&self, ino: u64) -> Result<PathBuf> {
        Ok(self.root.abs_path(&self.inodes.resolve(ino)?))
    }

    /// Attributes as applications see them: encrypted regular files report
    /// their plaintext size
    fn attr_for(&self, rel: &Path, meta: &Metadata, ino: u64) -> Result<FileAttr> {
        let mut attr = loopback::file_attr(meta, ino);
        if meta.is_file() && self.root.should_encrypt(rel) {
            attr.size = match self.handles.loaded_size(ino) {
                Some(size) => size,
                None => self.root.plaintext_size(rel)?,
            };
        }
        Ok(attr)
    }

    fn lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let rel = self.inodes.child_path(parent, name)?;
        let meta = loopback::stat(&self.root.abs_path(&rel))?;
        let ino = self.root.exposed_ino(meta.dev(), meta.ino());
        let attr = self.attr_for(&rel, &meta, ino)?;
        self.inodes.remember(ino, parent, name);
        Ok(attr)
    }

    fn getattr(&self, ino: u64) -> Result<FileAttr> {
        let rel = self.inodes.resolve(ino)?;
        let meta = loopback::stat(&self.root.abs_path(&rel))?;
        self.attr_for(&rel, &meta, ino)
    }

    fn setattr(&self, ino: u64, req: SetAttr) -> Result<FileAttr> {
        let rel = self.inodes.resolve(ino)?;
        let abs = self.root.abs_path(&rel);

        if let Some(mode) = req.mode {
            loopback::chmod(&abs, mode)?;
        }
        if req.uid.is_some() || req.gid.is_some() {
            loopback::chown(&abs, req.uid, req.gid)?;
        }
        if let Some(size) = req.size {
            match req.fh.map(|fh| self.handles.file(fh)).transpose()? {
                Some(file) => {
                    self.refresh(&file);
                    file.set_size(size)?;
                }
                None if self.root.should_encrypt(&rel) && loopback::stat(&abs)?.is_file() => {
                    let file = EncryptingFile::open(
                        Arc::clone(&self.root),
                        ino,
                        rel.clone(),
                        libc::O_RDWR,
                        None,
                    )?;
                    let resized = file.set_size(size);
                    let released = file.release();
                    resized?;
                    released?;
                }
                None => loopback::truncate(&abs, size)?,
            }
        }
        loopback::set_times(&abs, req.atime, req.mtime)?;

        self.getattr(ino)
    }

    /// Reply attributes for an entry just created under `parent`
    fn created(&self, parent: u64, name: &OsStr, uid: u32, gid: u32) -> Result<FileAttr> {
        let abs = self.root.abs_path(&self.inodes.child_path(parent, name)?);
        loopback::preserve_owner(&abs, uid, gid)?;
        self.lookup(parent, name)
    }

    fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> Result<(FileAttr, u64)> {
        let rel = self.inodes.child_path(parent, name)?;
        let abs = self.root.abs_path(&rel);
        let flags = (flags | libc::O_CREAT) & !libc::O_APPEND;

        let file = loopback::open(&abs, flags, Some(mode & !umask))?;
        loopback::preserve_owner(&abs, uid, gid)?;
        let meta = file.metadata()?;
        let ino = self.root.exposed_ino(meta.dev(), meta.ino());

        let handle = EncryptingFile::from_file(Arc::clone(&self.root), ino, rel.clone(), flags, file)?;
        let attr = self.attr_for(&rel, &meta, ino)?;
        self.inodes.remember(ino, parent, name);
        Ok((attr, self.handles.insert_file(handle)))
    }

    /// Point an open handle at its inode's current location
    fn refresh(&self, file: &EncryptingFile) {
        let ino = file.ino();
        match self.inodes.path(ino) {
            Some(path) => file.relocate(Some(path)),
            None if self.inodes.is_unlinked(ino) => file.relocate(None),
            None => {}
        }
    }

    /// Drop the inode alias once neither the kernel nor a handle uses `ino`
    fn retire_if_unused(&self, ino: u64) {
        if !self.inodes.contains(ino) && self.handles.files_for(ino).is_empty() {
            self.root.inos().retire(ino);
        }
    }

    fn handle(&self, fh: u64) -> Result<Arc<EncryptingFile>> {
        let file = self.handles.file(fh)?;
        self.refresh(&file);
        Ok(file)
    }

    fn opendir(&self, ino: u64) -> Result<u64> {
        let abs = self.abs(ino)?;
        let dev = loopback::stat(&abs)?.dev();
        let mut entries = loopback::read_dir(&abs)?;
        for entry in &mut entries {
            entry.ino = self.root.exposed_ino(dev, entry.ino);
        }
        Ok(self.handles.insert_dir(entries))
    }

    fn readdir(&self, ino: u64, fh: u64, offset: i64, reply: &mut ReplyDirectory) -> Result<()> {
        let entries = self.handles.dir(fh)?;
        let parent = self.inodes.parent_of(ino).unwrap_or(ROOT_INO);

        let dots = [
            (ino, fuser::FileType::Directory, OsStr::new(".")),
            (parent, fuser::FileType::Directory, OsStr::new("..")),
        ];
        let listing = dots
            .into_iter()
            .chain(entries.iter().map(|e| (e.ino, e.kind, e.name.as_os_str())));

        for (i, (child_ino, kind, name)) in listing.enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        Ok(())
    }

    fn getxattr(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>> {
        let missing = || Error::Io(std::io::Error::from_raw_os_error(xattr::ENOATTR));
        if name == SIZE_XATTR {
            return Err(missing());
        }
        xattr::get(&self.abs(ino)?, name)?.ok_or_else(missing)
    }

    fn listxattr(&self, ino: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for name in xattr::list(&self.abs(ino)?)? {
            if name == SIZE_XATTR {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    fn guard_reserved(name: &OsStr) -> Result<()> {
        if name == SIZE_XATTR {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EPERM)));
        }
        Ok(())
    }
}

/// The mounted filesystem
pub struct AgeFs {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl AgeFs {
    /// Serve `root` with the TTLs from `config`, running requests on `runtime`
    pub fn new(root: Root, config: &MountConfig, runtime: Handle) -> Self {
        AgeFs {
            inner: Arc::new(Inner {
                root: Arc::new(root),
                inodes: InodeTable::new(),
                handles: HandleTable::new(),
                attr_ttl: Duration::from_millis(config.attr_ttl_ms),
                entry_ttl: Duration::from_millis(config.entry_ttl_ms),
            }),
            runtime,
        }
    }

    pub fn root(&self) -> &Root {
        &self.inner.root
    }

    fn spawn<F>(&self, f: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.runtime.spawn_blocking(move || f(&inner));
    }
}

impl Filesystem for AgeFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        info!("Serving {:?}", self.inner.root.source());
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            "Filesystem destroyed with {} open file handles",
            self.inner.handles.open_files()
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.spawn(move |fs| match fs.lookup(parent, &name) {
            Ok(attr) => reply.entry(&fs.entry_ttl, &attr, 0),
            Err(e) => {
                log_failure("lookup", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inner.inodes.forget(ino, nlookup);
        self.inner.retire_if_unused(ino);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        self.spawn(move |fs| match fs.getattr(ino) {
            Ok(attr) => reply.attr(&fs.attr_ttl, &attr),
            Err(e) => {
                log_failure("getattr", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, mode={:?}, size={:?}, fh={:?})", ino, mode, size, fh);
        let req = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
            fh,
        };
        self.spawn(move |fs| match fs.setattr(ino, req) {
            Ok(attr) => reply.attr(&fs.attr_ttl, &attr),
            Err(e) => {
                log_failure("setattr", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        self.spawn(move |fs| match fs.abs(ino).and_then(|p| loopback::readlink(&p)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => {
                log_failure("readlink", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let (uid, gid) = (req.uid(), req.gid());
        let name = name.to_os_string();
        self.spawn(move |fs| {
            let result = fs
                .inodes
                .child_path(parent, &name)
                .and_then(|rel| loopback::mknod(&fs.root.abs_path(&rel), mode, umask, rdev))
                .and_then(|_| fs.created(parent, &name, uid, gid));
            match result {
                Ok(attr) => reply.entry(&fs.entry_ttl, &attr, 0),
                Err(e) => {
                    log_failure("mknod", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn mkdir(&mut self, req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let (uid, gid) = (req.uid(), req.gid());
        let name = name.to_os_string();
        self.spawn(move |fs| {
            let result = fs
                .inodes
                .child_path(parent, &name)
                .and_then(|rel| loopback::mkdir(&fs.root.abs_path(&rel), mode, umask))
                .and_then(|_| fs.created(parent, &name, uid, gid));
            match result {
                Ok(attr) => reply.entry(&fs.entry_ttl, &attr, 0),
                Err(e) => {
                    log_failure("mkdir", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.spawn(move |fs| {
            let result = fs
                .inodes
                .child_path(parent, &name)
                .and_then(|rel| loopback::unlink(&fs.root.abs_path(&rel)));
            match result {
                Ok(()) => {
                    fs.inodes.unlinked(parent, &name);
                    reply.ok();
                }
                Err(e) => {
                    log_failure("unlink", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let name = name.to_os_string();
        self.spawn(move |fs| {
            let result = fs
                .inodes
                .child_path(parent, &name)
                .and_then(|rel| loopback::rmdir(&fs.root.abs_path(&rel)));
            match result {
                Ok(()) => {
                    fs.inodes.unlinked(parent, &name);
                    reply.ok();
                }
                Err(e) => {
                    log_failure("rmdir", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn symlink(&mut self, req: &Request, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);
        let (uid, gid) = (req.uid(), req.gid());
        let name = link_name.to_os_string();
        let target = target.to_path_buf();
        self.spawn(move |fs| {
            let result = fs
                .inodes
                .child_path(parent, &name)
                .and_then(|rel| loopback::symlink(&target, &fs.root.abs_path(&rel)))
                .and_then(|_| fs.created(parent, &name, uid, gid));
            match result {
                Ok(attr) => reply.entry(&fs.entry_ttl, &attr, 0),
                Err(e) => {
                    log_failure("symlink", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}, flags={})",
            parent, name, newparent, newname, flags
        );
        let name = name.to_os_string();
        let newname = newname.to_os_string();
        self.spawn(move |fs| {
            let result = fs.inodes.child_path(parent, &name).and_then(|from| {
                let to = fs.inodes.child_path(newparent, &newname)?;
                loopback::rename(&fs.root.abs_path(&from), &fs.root.abs_path(&to), flags)
            });
            match result {
                Ok(()) => {
                    let exchange = flags & RENAME_EXCHANGE != 0;
                    fs.inodes.rename(parent, &name, newparent, &newname, exchange);
                    reply.ok();
                }
                Err(e) => {
                    log_failure("rename", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);
        let newname = newname.to_os_string();
        self.spawn(move |fs| {
            let result = fs
                .abs(ino)
                .and_then(|existing| {
                    let new = fs.inodes.child_path(newparent, &newname)?;
                    loopback::link(&existing, &fs.root.abs_path(&new))
                })
                .and_then(|_| fs.lookup(newparent, &newname));
            match result {
                Ok(attr) => reply.entry(&fs.entry_ttl, &attr, 0),
                Err(e) => {
                    log_failure("link", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);
        self.spawn(move |fs| {
            let result = fs.inodes.resolve(ino).and_then(|rel| {
                let file = EncryptingFile::open(Arc::clone(&fs.root), ino, rel, flags, None)?;
                Ok(fs.handles.insert_file(file))
            });
            match result {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => {
                    log_failure("open", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:#o}, flags={:#o})", parent, name, mode, flags);
        let (uid, gid) = (req.uid(), req.gid());
        let name = name.to_os_string();
        self.spawn(move |fs| match fs.create(parent, &name, mode, umask, flags, uid, gid) {
            Ok((attr, fh)) => reply.created(&fs.entry_ttl, &attr, 0, fh, 0),
            Err(e) => {
                log_failure("create", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        self.spawn(move |fs| {
            let result = fs
                .handles
                .file(fh)
                .and_then(|file| file.read(to_offset(offset)?, size));
            match result {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    log_failure("read", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, size={})", ino, fh, offset, data.len());
        let data = data.to_vec();
        self.spawn(move |fs| {
            let result = fs
                .handles
                .file(fh)
                .and_then(|file| file.write(to_offset(offset)?, &data));
            match result {
                Ok(written) => reply.written(written),
                Err(e) => {
                    log_failure("write", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);
        self.spawn(move |fs| match fs.handle(fh).and_then(|file| file.flush()) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("flush", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.spawn(move |fs| {
            let result = fs
                .handles
                .remove_file(fh)
                .ok_or(Error::BadDescriptor)
                .and_then(|file| {
                    fs.refresh(&file);
                    let released = file.release();
                    fs.retire_if_unused(file.ino());
                    released
                });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("release", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);
        self.spawn(move |fs| match fs.handle(fh).and_then(|file| file.fsync(datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("fsync", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);
        self.spawn(move |fs| match fs.opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => {
                log_failure("opendir", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn readdir(&mut self, _req: &Request, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        self.spawn(move |fs| match fs.readdir(ino, fh, offset, &mut reply) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("readdir", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        if self.inner.handles.remove_dir(fh) {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        self.spawn(move |fs| match loopback::statfs(fs.root.source()) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => {
                log_failure("statfs", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);
        let name = name.to_os_string();
        let value = value.to_vec();
        self.spawn(move |fs| {
            let result = Inner::guard_reserved(&name)
                .and_then(|_| fs.abs(ino))
                .and_then(|abs| Ok(xattr::set(&abs, &name, &value, flags)?));
            match result {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("setxattr", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);
        let name = name.to_os_string();
        self.spawn(move |fs| match fs.getxattr(ino, &name) {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);
        self.spawn(move |fs| match fs.listxattr(ino) {
            Ok(names) => reply_xattr(reply, size, &names),
            Err(e) => {
                log_failure("listxattr", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);
        let name: OsString = name.to_os_string();
        self.spawn(move |fs| {
            let result = Inner::guard_reserved(&name)
                .and_then(|_| fs.abs(ino))
                .and_then(|abs| Ok(xattr::remove(&abs, &name)?));
            match result {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("removexattr", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);
        self.spawn(move |fs| match fs.abs(ino).and_then(|p| loopback::access(&p, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn getlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        debug!("getlk(ino={}, fh={}, start={}, end={}, typ={})", ino, fh, start, end, typ);
        let range = LockRange { start, end, typ, pid };
        self.spawn(move |fs| match fs.handles.file(fh).and_then(|file| file.getlk(range)) {
            Ok(lock) => reply.locked(lock.start, lock.end, lock.typ, lock.pid),
            Err(e) => {
                log_failure("getlk", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn setlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        debug!("setlk(ino={}, fh={}, start={}, end={}, typ={}, sleep={})", ino, fh, start, end, typ, sleep);
        let range = LockRange { start, end, typ, pid };
        self.spawn(move |fs| {
            let result = fs
                .handles
                .file(fh)
                .and_then(|file| file.setlk(LockKind::Posix, range, sleep));
            match result {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("setlk", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }

    fn lseek(&mut self, _req: &Request, ino: u64, fh: u64, offset: i64, whence: i32, reply: ReplyLseek) {
        debug!("lseek(ino={}, fh={}, offset={}, whence={})", ino, fh, offset, whence);
        self.spawn(move |fs| match fs.handles.file(fh).and_then(|file| file.lseek(offset, whence)) {
            Ok(pos) => reply.offset(pos),
            Err(e) => {
                log_failure("lseek", &e);
                reply.error(e.to_errno());
            }
        });
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        debug!("fallocate(ino={}, fh={}, offset={}, length={})", ino, fh, offset, length);
        self.spawn(move |fs| {
            let result = fs
                .handles
                .file(fh)
                .and_then(|file| file.fallocate(offset, length, mode));
            match result {
                Ok(()) => reply.ok(),
                Err(e) => {
                    log_failure("fallocate", &e);
                    reply.error(e.to_errno());
                }
            }
        });
    }
}

/// Mount options for a `MountConfig`
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("agefs".to_string()),
        MountOption::DefaultPermissions,
    ];
    options.push(if config.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if config.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Mount in the background; dropping the session unmounts
pub fn mount(fs: AgeFs, mountpoint: &Path, config: &MountConfig) -> Result<fuser::BackgroundSession> {
    let options = mount_options(config);
    info!("Mounting {:?} at {:?}", fs.root().source(), mountpoint);
    Ok(fuser::spawn_mount2(fs, mountpoint, &options)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::root::tests::test_root;
    use crate::policy::IgnorePolicy;
    use tempfile::tempdir;

    fn inner(dir: &Path, policy: IgnorePolicy) -> Inner {
        Inner {
            root: Arc::new(test_root(dir, policy)),
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_create_write_lookup_reports_plaintext_size() {
        let dir = tempdir().unwrap();
        let fs = inner(dir.path(), IgnorePolicy::encrypt_all());
        let name = OsStr::new("secret.txt");

        let (attr, fh) = fs
            .create(ROOT_INO, name, 0o644, 0o022, libc::O_RDWR, 0, 0)
            .unwrap();
        assert_eq!(attr.size, 0);
        let file = fs.handle(fh).unwrap();
        file.write(0, b"twelve bytes").unwrap();

        // getattr prefers the in-memory length of an open handle
        assert_eq!(fs.getattr(attr.ino).unwrap().size, 12);
        file.flush().unwrap();
        fs.handles.remove_file(fh).unwrap().release().unwrap();

        let looked_up = fs.lookup(ROOT_INO, name).unwrap();
        assert_eq!(looked_up.ino, attr.ino);
        assert_eq!(looked_up.size, 12);
        let on_disk = std::fs::metadata(dir.path().join("secret.txt")).unwrap().len();
        assert!(on_disk > 12);
    }

    #[test]
    fn test_edits_after_write_back_and_lookup_are_kept() {
        let dir = tempdir().unwrap();
        let fs = inner(dir.path(), IgnorePolicy::encrypt_all());
        let name = OsStr::new("doc");

        let (attr, fh) = fs
            .create(ROOT_INO, name, 0o644, 0o022, libc::O_RDWR, 0, 0)
            .unwrap();
        let backing_before = std::fs::metadata(dir.path().join("doc")).unwrap().ino();
        fs.handle(fh).unwrap().write(0, b"first").unwrap();
        fs.handle(fh).unwrap().fsync(false).unwrap();

        // the rename gave the path a new backing inode, the kernel keeps the old number
        let backing_after = std::fs::metadata(dir.path().join("doc")).unwrap().ino();
        assert_ne!(backing_before, backing_after);
        let looked_up = fs.lookup(ROOT_INO, name).unwrap();
        assert_eq!(looked_up.ino, attr.ino);
        assert!(!fs.inodes.is_unlinked(attr.ino));

        let file = fs.handle(fh).unwrap();
        file.write(5, b" second").unwrap();
        file.flush().unwrap();
        fs.handles.remove_file(fh).unwrap().release().unwrap();

        let ciphertext = std::fs::File::open(dir.path().join("doc")).unwrap();
        let plaintext =
            crate::crypto::decrypt(ciphertext, fs.root.keyring().identities()).unwrap();
        assert_eq!(&plaintext[..], b"first second");
        assert_eq!(fs.lookup(ROOT_INO, name).unwrap().ino, attr.ino);
        assert_eq!(fs.getattr(attr.ino).unwrap().size, 12);
    }

    #[test]
    fn test_ignored_files_report_backing_size() {
        let dir = tempdir().unwrap();
        let policy = IgnorePolicy::from_reader(&b"*.crt\n"[..]).unwrap();
        let fs = inner(dir.path(), policy);
        std::fs::create_dir(dir.path().join("certs")).unwrap();
        std::fs::write(dir.path().join("certs/www.example.com.crt"), b"PEM").unwrap();

        let certs = fs.lookup(ROOT_INO, OsStr::new("certs")).unwrap();
        assert_eq!(certs.kind, fuser::FileType::Directory);
        let crt = fs.lookup(certs.ino, OsStr::new("www.example.com.crt")).unwrap();
        assert_eq!(crt.size, 3);
        assert!(matches!(
            fs.lookup(certs.ino, OsStr::new("absent")),
            Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ENOENT)
        ));
    }

    #[test]
    fn test_setattr_truncates_encrypted_file_by_path() {
        let dir = tempdir().unwrap();
        let fs = inner(dir.path(), IgnorePolicy::encrypt_all());
        let (attr, fh) = fs
            .create(ROOT_INO, OsStr::new("f"), 0o600, 0, libc::O_WRONLY, 0, 0)
            .unwrap();
        let file = fs.handle(fh).unwrap();
        file.write(0, b"hello world").unwrap();
        fs.handles.remove_file(fh).unwrap().release().unwrap();

        let req = SetAttr {
            mode: Some(0o640),
            uid: None,
            gid: None,
            size: Some(5),
            atime: None,
            mtime: None,
            fh: None,
        };
        let updated = fs.setattr(attr.ino, req).unwrap();
        assert_eq!(updated.size, 5);
        assert_eq!(updated.perm, 0o640);
    }

    #[test]
    fn test_reserved_attribute_is_hidden() {
        let dir = tempdir().unwrap();
        if !xattr::supported(dir.path()) {
            return;
        }
        let fs = inner(dir.path(), IgnorePolicy::encrypt_all());
        let (attr, fh) = fs
            .create(ROOT_INO, OsStr::new("f"), 0o600, 0, libc::O_RDWR, 0, 0)
            .unwrap();
        fs.handle(fh).unwrap().write(0, b"abc").unwrap();
        fs.handle(fh).unwrap().flush().unwrap();

        let reserved = OsStr::new(SIZE_XATTR);
        assert_eq!(fs.getxattr(attr.ino, reserved).unwrap_err().to_errno(), xattr::ENOATTR);
        assert!(!fs
            .listxattr(attr.ino)
            .unwrap()
            .split(|&b| b == 0)
            .any(|n| n == SIZE_XATTR.as_bytes()));
        assert_eq!(Inner::guard_reserved(reserved).unwrap_err().to_errno(), libc::EPERM);

        xattr::set(&dir.path().join("f"), "user.color", b"blue", 0).unwrap();
        assert_eq!(fs.getxattr(attr.ino, OsStr::new("user.color")).unwrap(), b"blue");
    }

    #[test]
    fn test_rename_keeps_open_handle_on_its_file() {
        let dir = tempdir().unwrap();
        let fs = inner(dir.path(), IgnorePolicy::encrypt_all());
        let (_, fh) = fs
            .create(ROOT_INO, OsStr::new("draft"), 0o600, 0, libc::O_RDWR, 0, 0)
            .unwrap();
        fs.handle(fh).unwrap().write(0, b"text").unwrap();

        let from = dir.path().join("draft");
        let to = dir.path().join("final");
        loopback::rename(&from, &to, 0).unwrap();
        fs.inodes
            .rename(ROOT_INO, OsStr::new("draft"), ROOT_INO, OsStr::new("final"), false);

        fs.handle(fh).unwrap().flush().unwrap();
        assert!(!from.exists());
        let ciphertext = std::fs::File::open(&to).unwrap();
        let plaintext =
            crate::crypto::decrypt(ciphertext, fs.root.keyring().identities()).unwrap();
        assert_eq!(&plaintext[..], b"text");
    }

    #[test]
    fn test_opendir_snapshot() {
        let dir = tempdir().unwrap();
        let fs = inner(dir.path(), IgnorePolicy::encrypt_all());
        std::fs::write(dir.path().join("a"), b"").unwrap();

        let fh = fs.opendir(ROOT_INO).unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        let entries = fs.handles.dir(fh).unwrap();
        assert_eq!(entries.len(), 1);
        let meta = std::fs::metadata(dir.path().join("a")).unwrap();
        assert_eq!(entries[0].ino, meta.ino());
    }

    #[test]
    fn test_mount_options() {
        let mut config = MountConfig::default();
        config.read_only = true;
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::AllowOther));

        config.allow_other = true;
        assert!(mount_options(&config).contains(&MountOption::AllowOther));
    }
}
