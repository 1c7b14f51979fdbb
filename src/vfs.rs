//! Types exchanged with the host VFS layer.
//!
//! The VFS itself is an external collaborator; these are the shapes it hands
//! us (set-attribute requests, access kinds) and the shapes we hand back
//! (stat snapshots, directory entries).

use bitflags::bitflags;

bitflags! {
    /// Which fields of a [`Stat`] are valid, or which fields a [`SetStat`]
    /// wants changed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatMask: u32 {
        const TYPE   = 1 << 0;
        const MODE   = 1 << 1;
        const NLINK  = 1 << 2;
        const UID    = 1 << 3;
        const GID    = 1 << 4;
        const ATIME  = 1 << 5;
        const MTIME  = 1 << 6;
        const CTIME  = 1 << 7;
        const INO    = 1 << 8;
        const SIZE   = 1 << 9;
        const BLOCKS = 1 << 10;
        const BTIME  = 1 << 11;

        /// The set a SetStat request may legally name.
        const SETTABLE = Self::MODE.bits()
            | Self::UID.bits()
            | Self::GID.bits()
            | Self::ATIME.bits()
            | Self::MTIME.bits()
            | Self::SIZE.bits();
    }
}

bitflags! {
    /// Access kinds for permission checks, in POSIX rwx encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessKinds: u32 {
        const EXEC  = 1;
        const WRITE = 2;
        const READ  = 4;
    }
}

/// A metadata snapshot. `mask` names the valid fields; timestamps are
/// nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub mask: StatMask,
    pub blksize: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub btime: i64,
}

/// A timestamp in a [`SetStat`]: either "stamp the current time" or an
/// explicit value in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(i64),
}

impl SetTime {
    pub fn is_now(self) -> bool {
        matches!(self, Self::Now)
    }

    pub fn nanos_or(self, now: i64) -> i64 {
        match self {
            Self::Now => now,
            Self::At(nanos) => nanos,
        }
    }

    /// Wire encoding: (seconds, nanoseconds) of the explicit value, or zeros
    /// when the server clock is to be used.
    pub fn to_spec(self) -> (u64, u64) {
        match self {
            Self::Now => (0, 0),
            Self::At(nanos) => {
                let nanos = nanos.max(0) as u64;
                (nanos / 1_000_000_000, nanos % 1_000_000_000)
            }
        }
    }
}

impl Default for SetTime {
    fn default() -> Self {
        Self::Now
    }
}

/// An attribute-change request. Only fields named in `mask` are meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetStat {
    pub mask: StatMask,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SetTime,
    pub mtime: SetTime,
}

/// Options accompanying a stat request.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatOptions {
    /// Fields the caller actually wants.
    pub mask: StatMask,
    /// When set, the caller prefers a possibly-stale snapshot over a server
    /// round trip (`AT_STATX_DONT_SYNC`).
    pub dont_sync: bool,
}

/// A directory entry as returned to the VFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    /// `DT_*` type byte.
    pub type_: u8,
    pub ino: u64,
    /// Opaque offset of the next entry, for resuming a read.
    pub next_off: u64,
}
