//! Typed 9P2000.L operation layer.
//!
//! This crate speaks the client half of 9P2000.L over a single duplex byte
//! stream: wire types and codec ([`messages`]), the byte-stream contract with
//! host-FD donation ([`transport`]), and a blocking [`Client`] that hands out
//! fids as [`File`] objects ([`client`]).
//!
//! Consumers never see fids or tags directly. They hold `Arc<dyn File>`
//! values; every remote object the filesystem touches is reached through that
//! trait, which also makes it the natural seam for in-process fakes in tests.

pub mod client;
pub mod messages;
pub mod transport;

use std::any::Any;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use bitflags::bitflags;

pub use client::{Client, ClientFile};
pub use transport::{FdTransport, Transport};

/// Highest protocol version this client implements.
pub const HIGHEST_VERSION: &str = "9P2000.L";

/// Default maximum message size, in bytes.
pub const DEFAULT_MSIZE: u32 = 1024 * 1024;

/// QID type bits (the `type_` field of [`Qid`]).
pub const QID_TYPE_DIR: u8 = 0x80;
pub const QID_TYPE_SYMLINK: u8 = 0x02;
pub const QID_TYPE_FILE: u8 = 0x00;

/// Server-chosen unique identifier for a filesystem object. The `path` field
/// doubles as the client's inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    pub type_: u8,
    pub version: u32,
    pub path: u64,
}

bitflags! {
    /// Attribute validity bits for GetAttr requests and replies
    /// (`P9_GETATTR_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrMask: u64 {
        const MODE         = 0x0000_0001;
        const NLINK        = 0x0000_0002;
        const UID          = 0x0000_0004;
        const GID          = 0x0000_0008;
        const RDEV         = 0x0000_0010;
        const ATIME        = 0x0000_0020;
        const MTIME        = 0x0000_0040;
        const CTIME        = 0x0000_0080;
        const INO          = 0x0000_0100;
        const SIZE         = 0x0000_0200;
        const BLOCKS       = 0x0000_0400;
        const BTIME        = 0x0000_0800;
        const GEN          = 0x0000_1000;
        const DATA_VERSION = 0x0000_2000;

        const BASIC = 0x0000_07ff;
        const ALL   = 0x0000_3fff;
    }
}

bitflags! {
    /// Validity bits for SetAttr requests (`P9_SETATTR_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetAttrMask: u32 {
        const MODE      = 0x0000_0001;
        const UID       = 0x0000_0002;
        const GID       = 0x0000_0004;
        const SIZE      = 0x0000_0008;
        const ATIME     = 0x0000_0010;
        const MTIME     = 0x0000_0020;
        const CTIME     = 0x0000_0040;
        /// `ATIME` carries an explicit timestamp rather than the server clock.
        const ATIME_SET = 0x0000_0080;
        /// `MTIME` carries an explicit timestamp rather than the server clock.
        const MTIME_SET = 0x0000_0100;
    }
}

bitflags! {
    /// Open flags for Lopen/Lcreate. 9P2000.L reuses the Linux open(2) flag
    /// encoding on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x0000_0000;
        const WRONLY = 0x0000_0001;
        const RDWR   = 0x0000_0002;
        const TRUNC  = 0x0000_0200;
    }
}

impl OpenFlags {
    /// Build flags from the desired capabilities of a handle.
    pub fn from_rw(read: bool, write: bool, trunc: bool) -> Self {
        let mut flags = match (read, write) {
            (true, true) => Self::RDWR,
            (false, true) => Self::WRONLY,
            // A flag-less open is still a read-only open on the wire.
            _ => Self::RDONLY,
        };
        if trunc {
            flags |= Self::TRUNC;
        }
        flags
    }
}

/// File attributes as reported by GetAttr. Timestamps are second/nanosecond
/// pairs exactly as they travel on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub btime_sec: u64,
    pub btime_nsec: u64,
    pub r#gen: u64,
    pub data_version: u64,
}

/// Mutable attributes for SetAttr. Only fields whose bit is set in the
/// accompanying [`SetAttrMask`] are meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

/// A single directory entry from Readdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub qid: Qid,
    /// Opaque server offset of the *next* entry.
    pub offset: u64,
    /// Directory-entry type byte (`DT_*`).
    pub type_: u8,
    pub name: String,
}

/// Errors from the 9P layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered with Rlerror; the payload is the server's errno.
    #[error("server errno {0}")]
    Remote(i32),
    /// The byte stream failed underneath us.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The peer broke framing or replied with an unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Version negotiation did not converge on a version we implement.
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    /// A message exceeded the negotiated maximum size.
    #[error("message of {0} bytes exceeds negotiated msize {1}")]
    MessageTooLarge(u32, u32),
    /// The client connection has been shut down.
    #[error("client is closed")]
    Closed,
}

impl Error {
    /// The errno this error propagates to the guest. Server errors flow up
    /// unmodified; everything else degrades to EIO.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Remote(errno) => *errno,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Protocol(_)
            | Self::UnsupportedVersion(_)
            | Self::MessageTooLarge(..)
            | Self::Closed => libc::EIO,
        }
    }

    /// True if the server reported "no such file or directory".
    pub fn is_enoent(&self) -> bool {
        matches!(self, Self::Remote(errno) if *errno == libc::ENOENT)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A fid: the client's handle to one remote filesystem object.
///
/// This is the contract through which a filesystem issues every remote
/// operation. The production implementation is [`ClientFile`]; tests
/// substitute in-process fakes.
pub trait File: Send + Sync {
    /// Walk zero or more path components, producing a new fid.
    ///
    /// A zero-component walk clones the fid; this is how per-open fids are
    /// minted from a dentry's base fid.
    fn walk(&self, names: &[&str]) -> Result<(Vec<Qid>, Arc<dyn File>)>;

    /// Fetch attributes. The returned mask names the fields the server
    /// actually filled in.
    fn get_attr(&self, mask: AttrMask) -> Result<(Qid, AttrMask, Attr)>;

    /// Update attributes named by `valid`.
    fn set_attr(&self, valid: SetAttrMask, attr: &SetAttr) -> Result<()>;

    /// Open the fid. The server may donate a host file descriptor alongside
    /// the reply; when it does, the client can do I/O and mapping against
    /// that descriptor directly, bypassing the 9P data path.
    fn open(&self, flags: OpenFlags) -> Result<(Qid, u32, Option<OwnedFd>)>;

    /// Read at `offset`. Returns the number of bytes placed in `buf`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write at `offset`. Returns the number of bytes accepted.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Read directory entries starting at the server offset `offset`.
    fn readdir(&self, offset: u64, count: u32) -> Result<Vec<Dirent>>;

    /// Read a symbolic link's target.
    fn read_link(&self) -> Result<String>;

    /// Unlink `name` in this directory. `flags` carries `AT_REMOVEDIR` when
    /// removing a subdirectory.
    fn unlink_at(&self, name: &str, flags: u32) -> Result<()>;

    /// Rename `old_name` in this directory to `new_name` in `new_dir`.
    fn rename_at(&self, old_name: &str, new_dir: &Arc<dyn File>, new_name: &str) -> Result<()>;

    /// Commit the file's state to stable storage.
    fn fsync(&self) -> Result<()>;

    /// List extended attribute names. `size` bounds the reply; 0 asks the
    /// server for the full list.
    fn list_xattr(&self, size: u64) -> Result<Vec<String>>;

    /// Read one extended attribute value.
    fn get_xattr(&self, name: &str, size: u64) -> Result<Vec<u8>>;

    /// Create or replace one extended attribute value.
    fn set_xattr(&self, name: &str, value: &[u8], flags: u32) -> Result<()>;

    /// Remove one extended attribute.
    fn remove_xattr(&self, name: &str) -> Result<()>;

    /// Clunk the fid. Idempotent; errors are swallowed because the fid is
    /// gone from the client's table either way.
    fn close(&self);

    /// Downcast support, used by [`File::rename_at`] implementations that
    /// must extract a concrete peer (e.g. the destination directory's fid).
    fn as_any(&self) -> &dyn Any;
}
