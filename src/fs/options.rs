//! Mount-option parsing.
//!
//! Options arrive as a comma-separated `key=value` string from the mount
//! syscall. Every key is enumerated here; an unknown key is a hard error
//! rather than a warning, so misspelled options cannot silently change
//! coherence semantics.

use std::collections::HashMap;
use std::os::fd::RawFd;

use tracing::warn;

use crate::error::{FsError, Result};
use crate::fs::coherence::InteropMode;

/// Default bound on unreferenced dentries retained in the LRU.
pub const DEFAULT_DENTRY_CACHE_LIMIT: u64 = 1000;

/// Parsed, immutable mount options.
#[derive(Debug, Clone)]
pub struct FilesystemOptions {
    /// The descriptor carrying the 9P byte stream (`rfdno` == `wfdno`).
    pub fd: RawFd,
    /// Server attach name.
    pub aname: String,
    /// Coherence mode, derived from `cache=`.
    pub interop: InteropMode,
    /// Maximum 9P message size.
    pub msize: u32,
    /// Protocol version string offered during negotiation.
    pub version: String,
    /// Maximum number of dentries with zero references retained.
    pub dentry_cache_limit: u64,
    /// Never serve application mappings from host FDs; always go through the
    /// client's own page cache.
    pub force_page_cache: bool,
    /// Apply the allocator's fill-range limits to host-FD translations.
    pub limit_host_fd_translation: bool,
    /// Read-only host FDs may be stale relative to writable FDs opened
    /// later (pre-4.19 overlayfs); mappings must be replaced on upgrade.
    pub overlayfs_stale_read: bool,
    /// Give every open of a regular file its own handle, with no page cache
    /// and no shared mmap. Enabled by `cache=none`.
    pub regular_files_use_special_fds: bool,
}

fn invalid(msg: impl Into<String>) -> FsError {
    let msg = msg.into();
    warn!("{msg}");
    FsError::Config(msg)
}

impl FilesystemOptions {
    /// Parse a mount-option string.
    pub fn parse(data: &str) -> Result<Self> {
        let mut mopts: HashMap<&str, &str> = HashMap::new();
        for piece in data.split(',') {
            if piece.is_empty() {
                continue;
            }
            let (key, value) = piece.split_once('=').unwrap_or((piece, ""));
            if mopts.insert(key, value).is_some() {
                return Err(invalid(format!("duplicate mount option {key:?}")));
            }
        }

        // The transport must be an inherited descriptor.
        match mopts.remove("trans") {
            Some("fd") => {}
            Some(other) => return Err(invalid(format!("unsupported transport: trans={other}"))),
            None => return Err(invalid("transport must be specified as trans=fd")),
        }

        // Read and write descriptors must be provided and identical.
        let rfd = mopts
            .remove("rfdno")
            .ok_or_else(|| invalid("read FD must be specified as rfdno=<fd>"))?
            .parse::<RawFd>()
            .map_err(|_| invalid("invalid read FD"))?;
        let wfd = mopts
            .remove("wfdno")
            .ok_or_else(|| invalid("write FD must be specified as wfdno=<fd>"))?
            .parse::<RawFd>()
            .map_err(|_| invalid("invalid write FD"))?;
        if rfd != wfd {
            return Err(invalid(format!(
                "read FD ({rfd}) and write FD ({wfd}) must be equal"
            )));
        }

        let aname = mopts.remove("aname").unwrap_or("/").to_owned();

        // For historical reasons the cache policy defaults to the least
        // generally-applicable mode.
        let mut interop = InteropMode::Exclusive;
        let mut regular_files_use_special_fds = false;
        if let Some(cache) = mopts.remove("cache") {
            match cache {
                "fscache" => interop = InteropMode::Exclusive,
                "fscache_writethrough" => interop = InteropMode::Writethrough,
                "remote_revalidating" => interop = InteropMode::Shared,
                "none" => {
                    interop = InteropMode::Shared;
                    regular_files_use_special_fds = true;
                }
                other => return Err(invalid(format!("invalid cache policy: cache={other}"))),
            }
        }

        let msize = match mopts.remove("msize") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| invalid(format!("invalid message size: msize={raw}")))?,
            None => p9::DEFAULT_MSIZE,
        };

        let version = mopts
            .remove("version")
            .unwrap_or(p9::HIGHEST_VERSION)
            .to_owned();

        let dentry_cache_limit = match mopts.remove("dentry_cache_limit") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                invalid(format!("invalid dentry cache limit: dentry_cache_limit={raw}"))
            })?,
            None => DEFAULT_DENTRY_CACHE_LIMIT,
        };

        let force_page_cache = mopts.remove("force_page_cache").is_some();
        let limit_host_fd_translation = mopts.remove("limit_host_fd_translation").is_some();
        let overlayfs_stale_read = mopts.remove("overlayfs_stale_read").is_some();

        if !mopts.is_empty() {
            let mut unknown: Vec<&str> = mopts.keys().copied().collect();
            unknown.sort_unstable();
            return Err(invalid(format!("unknown mount options: {unknown:?}")));
        }

        Ok(Self {
            fd: rfd,
            aname,
            interop,
            msize,
            version,
            dentry_cache_limit,
            force_page_cache,
            limit_host_fd_translation,
            overlayfs_stale_read,
            regular_files_use_special_fds,
        })
    }
}
