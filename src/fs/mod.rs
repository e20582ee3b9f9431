//! FUSE filesystem implementation
//!
//! A loopback view of a source directory in which file content is
//! transparently age-encrypted on write and decrypted on read.

mod filesystem;
mod handle;
mod inode;
mod lock;
pub mod loopback;
mod root;

pub use filesystem::{mount, mount_options, AgeFs};
pub use handle::{EncryptingFile, FileMode, HandleTable};
pub use inode::{InodeTable, ROOT_INO};
pub use lock::{LockKind, LockRange};
pub use root::Root;
