//! ninefs: a 9P2000.L remote-filesystem client.
//!
//! ninefs exposes a POSIX-like filesystem to a sandboxed guest by proxying
//! operations to an external file server over 9P2000.L. The interesting
//! machinery is client-side: an LRU-bounded dentry cache with race-free
//! reference counting ([`fs::dentry`]), a three-mode coherence engine
//! ([`fs::coherence`]), a page cache with a dirty set coordinated with
//! donated host descriptors ([`fs::range_set`], [`fs::handle`]), and the
//! lock-ordering discipline that keeps path resolution, rename, truncate
//! and I/O safe against each other ([`fs`]).
//!
//! The wire protocol lives in the companion `p9` crate; the host VFS, the
//! page-frame allocator, and the mapping subsystem are external
//! collaborators reached through the contracts in [`mem`], [`vfs`] and
//! [`context`].

pub mod auth;
pub mod context;
pub mod error;
pub mod fs;
pub mod mem;
pub mod nlmsg;
pub mod vfs;

pub use context::{Context, RealtimeContext};
pub use error::{FsError, Result};
pub use fs::{Filesystem, FilesystemType, OpenOptions, OpenedFile};
