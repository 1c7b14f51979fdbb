//! Metadata and data coherence policy.
//!
//! The interop mode is fixed at mount time and decides what the client may
//! cache, when cached state must be revalidated against the server, whose
//! clock stamps timestamps, and whether mutations must reach the server
//! synchronously.

/// The client's relationship with other users of the remote filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteropMode {
    /// This client is the only user. Arbitrary state may be cached, changes
    /// may be flushed asynchronously (except where server permission checks
    /// require the round trip), and timestamps come from the client clock.
    /// Client-originated timestamp changes stay client-local: the server's
    /// clocks cannot be set to arbitrary values, so they are never sent.
    #[default]
    Exclusive,

    /// Read-only remote users expect to observe this client's changes.
    /// Caching is unrestricted, but every mutation goes to the server
    /// synchronously. Timestamps still come from the client clock.
    Writethrough,

    /// Other users may mutate remote state. Cached state must be revalidated
    /// before use, mutations are synchronous, and the server clock owns
    /// timestamps (the client re-reads attributes after modifying
    /// operations).
    Shared,
}

impl InteropMode {
    /// May regular-file data be cached (and mmapped through a shared
    /// handle) across operation boundaries?
    pub fn can_cache_data(self) -> bool {
        !matches!(self, Self::Shared)
    }

    /// May metadata be trusted across operations without revalidation?
    pub fn can_cache_metadata(self) -> bool {
        !matches!(self, Self::Shared)
    }

    /// May negative child names, dirent lists and symlink targets be stored
    /// across operations?
    pub fn can_cache_names(self) -> bool {
        !matches!(self, Self::Shared)
    }

    /// Must client mutations reach the server before the operation returns?
    pub fn flush_is_synchronous(self) -> bool {
        !matches!(self, Self::Exclusive)
    }

    /// Does the server clock own timestamps?
    pub fn timestamps_from_server(self) -> bool {
        matches!(self, Self::Shared)
    }
}
