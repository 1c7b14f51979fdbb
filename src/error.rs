//! Error taxonomy for the filesystem client.
//!
//! Remote errors propagate the server's errno unmodified; local policy
//! failures carry their own kinds. Invariant violations (reference counts
//! going negative, file types changing under us) are defects and panic
//! instead of surfacing here.

/// Errors surfaced to the VFS layer.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// A mount option was missing, malformed, or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller lacks permission under the generic POSIX rules.
    #[error("permission denied")]
    Access,

    /// The operation is forbidden regardless of file mode bits.
    #[error("operation not permitted")]
    Perm,

    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("file exists")]
    Exists,

    /// Outside the supported surface, e.g. an xattr not under `user.`.
    #[error("operation not supported")]
    Unsupported,

    #[error("invalid argument")]
    Invalid,

    /// Old and new handles disagree about host-FD availability; mixing them
    /// would produce incoherent memory mappings.
    #[error("host FD availability changed across handle upgrade")]
    IncoherentUpgrade,

    /// The server or transport failed.
    #[error(transparent)]
    Remote(#[from] p9::Error),

    /// A host-side syscall failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno equivalent handed back through the VFS.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Invalid => libc::EINVAL,
            Self::Access => libc::EACCES,
            Self::Perm => libc::EPERM,
            Self::NotFound => libc::ENOENT,
            Self::NotDir => libc::ENOTDIR,
            Self::IsDir => libc::EISDIR,
            Self::Exists => libc::EEXIST,
            Self::Unsupported => libc::EOPNOTSUPP,
            Self::IncoherentUpgrade => libc::EIO,
            Self::Remote(err) => err.errno(),
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True if the underlying cause is the server reporting ENOENT.
    pub fn is_remote_enoent(&self) -> bool {
        matches!(self, Self::Remote(err) if err.is_enoent())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
