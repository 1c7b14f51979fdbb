//! The 9P client filesystem.
//!
//! Lock order (strictly top-down; taking a lower lock while holding a higher
//! one is a defect):
//!
//! ```text
//! FileDescription mutexes
//!   Filesystem::rename_mu            (RW)
//!     Dentry::dir_mu                 (per directory)
//!       Filesystem::sync_mu
//!       Dentry::metadata_mu
//!         Dentry::maps_mu
//!           Dentry::handle_mu        (RW)
//!             Dentry::data_mu        (RW)
//! ```
//!
//! Holding `dir_mu` on two different dentries requires `rename_mu` held for
//! writing. Anything that may destroy or re-cache a dentry takes `rename_mu`
//! for writing. Mapping invalidation takes `maps_mu` and therefore runs with
//! `data_mu` dropped.

pub mod coherence;
pub mod dentry;
pub mod handle;
mod lru;
pub mod options;
pub mod range_set;
pub mod regular_file;
pub mod special_file;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

use crate::auth::Credentials;
use crate::context::{Context, RealtimeContext, UninterruptibleSleep};
use crate::error::{FsError, Result};
use crate::mem::MemoryFile;
use crate::vfs::{AccessKinds, Dirent, SetStat, Stat, StatOptions};

use coherence::InteropMode;
use dentry::{Dentry, dentry_attr_mask};
use lru::DentryLru;
use options::FilesystemOptions;
use regular_file::RegularFileFd;
use special_file::SpecialFileFd;

/// The filesystem type name, as registered with the VFS.
pub const FS_NAME: &str = "9p";

/// How a file is being opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub trunc: bool,
    pub append: bool,
}

/// The file description produced by an open, by file role.
pub enum OpenedFile {
    Regular(Arc<RegularFileFd>),
    Directory(Arc<DirectoryFd>),
    /// Special files, and regular files when each open gets a private
    /// handle (`cache=none`).
    Special(Arc<SpecialFileFd>),
}

struct SyncState {
    dentries: FxHashMap<u64, Arc<Dentry>>,
    special_fds: FxHashMap<u64, Weak<SpecialFileFd>>,
}

/// The mounted client filesystem: connection, options, root, dentry set and
/// LRU, and the open special-file descriptions.
pub struct Filesystem {
    opts: FilesystemOptions,
    /// `None` only for filesystems built directly on fake files in tests.
    client: Option<p9::Client>,
    mf: Arc<dyn MemoryFile>,
    /// Effective identity of the mount creator; owner/group for files the
    /// server reports none for.
    uid: u32,
    gid: u32,
    /// Clock and sleep bracketing for teardown paths that have no caller
    /// context.
    bg: RealtimeContext,

    /// Serialises path resolution against rename, and guards dentry caching
    /// state (`cached`, LRU membership, parent links).
    rename_mu: RwLock<()>,
    /// The LRU itself; mutated only with `rename_mu` held for writing.
    lru: Mutex<DentryLru>,
    /// All dentries plus open special-file descriptions, for sync and
    /// release.
    sync_state: Mutex<SyncState>,

    root: Mutex<Option<Arc<Dentry>>>,
    next_dentry_id: AtomicU64,
    next_fd_id: AtomicU64,
    released: AtomicBool,
}

/// Factory implementing the VFS filesystem-type contract.
pub struct FilesystemType;

impl FilesystemType {
    pub fn name(&self) -> &'static str {
        FS_NAME
    }

    /// Mount: parse options, establish the connection, negotiate a version,
    /// attach, and build the root dentry.
    ///
    /// The returned root carries one reference for the caller; a second,
    /// explicit pin reference keeps it out of the LRU until
    /// [`Filesystem::release`] drops it.
    #[instrument(name = "FilesystemType::get_filesystem", skip_all, fields(options = options))]
    pub fn get_filesystem(
        &self,
        ctx: &dyn Context,
        creds: &Credentials,
        mf: Arc<dyn MemoryFile>,
        options: &str,
    ) -> Result<(Arc<Filesystem>, Arc<Dentry>)> {
        let opts = FilesystemOptions::parse(options)?;

        // The descriptor number arrives via mount options; the runner hands
        // it to us open and unshared.
        let transport = unsafe { p9::FdTransport::from_raw(opts.fd) };
        let client = {
            let _sleep = UninterruptibleSleep::enter(ctx);
            p9::Client::new(Box::new(transport), opts.msize, &opts.version)?
        };
        let attach_file = {
            let _sleep = UninterruptibleSleep::enter(ctx);
            match client.attach(&opts.aname) {
                Ok(file) => file,
                Err(err) => {
                    client.close();
                    return Err(err.into());
                }
            }
        };
        Filesystem::with_attach_file(ctx, creds, mf, opts, Some(client), attach_file)
    }
}

impl Filesystem {
    /// Build the filesystem around an already-attached root file.
    pub(crate) fn with_attach_file(
        ctx: &dyn Context,
        creds: &Credentials,
        mf: Arc<dyn MemoryFile>,
        opts: FilesystemOptions,
        client: Option<p9::Client>,
        attach_file: Arc<dyn p9::File>,
    ) -> Result<(Arc<Filesystem>, Arc<Dentry>)> {
        let attrs = {
            let _sleep = UninterruptibleSleep::enter(ctx);
            attach_file.get_attr(dentry_attr_mask())
        };
        let (qid, valid, attr) = match attrs {
            Ok(got) => got,
            Err(err) => {
                attach_file.close();
                if let Some(client) = &client {
                    client.close();
                }
                return Err(err.into());
            }
        };

        let fs = Arc::new(Filesystem {
            opts,
            client,
            mf,
            uid: creds.uid,
            gid: creds.gid,
            bg: RealtimeContext,
            rename_mu: RwLock::new(()),
            lru: Mutex::new(DentryLru::new()),
            sync_state: Mutex::new(SyncState {
                dentries: FxHashMap::default(),
                special_fds: FxHashMap::default(),
            }),
            root: Mutex::new(None),
            next_dentry_id: AtomicU64::new(1),
            next_fd_id: AtomicU64::new(1),
            released: AtomicBool::new(false),
        });

        let root = fs.new_dentry(attach_file, qid, valid, &attr)?;
        // One reference for the caller, one pinning the root so it can never
        // be cached and evicted. The pin is dropped by release().
        root.inc_ref();
        root.inc_ref();
        *fs.root.lock().expect("root lock poisoned") = Some(Arc::clone(&root));
        debug!(root_ino = root.ino(), interop = ?fs.opts.interop, "filesystem attached");
        Ok((fs, root))
    }

    pub fn opts(&self) -> &FilesystemOptions {
        &self.opts
    }

    pub fn interop(&self) -> InteropMode {
        self.opts.interop
    }

    pub(crate) fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    pub(crate) fn memfile(&self) -> &dyn MemoryFile {
        self.mf.as_ref()
    }

    pub(crate) fn background_ctx(&self) -> &dyn Context {
        &self.bg
    }

    pub(crate) fn rename_mu(&self) -> &RwLock<()> {
        &self.rename_mu
    }

    pub(crate) fn lru(&self) -> &Mutex<DentryLru> {
        &self.lru
    }

    /// Number of dentries currently parked in the LRU.
    pub fn cached_dentry_count(&self) -> u64 {
        self.lru.lock().expect("lru lock poisoned").len()
    }

    /// Number of dentries registered with the filesystem.
    pub fn dentry_count(&self) -> usize {
        self.sync_state.lock().expect("sync lock poisoned").dentries.len()
    }

    pub(crate) fn contains_dentry(&self, id: u64) -> bool {
        self.sync_state
            .lock()
            .expect("sync lock poisoned")
            .dentries
            .contains_key(&id)
    }

    fn new_dentry(
        self: &Arc<Self>,
        file: Arc<dyn p9::File>,
        qid: p9::Qid,
        valid: p9::AttrMask,
        attr: &p9::Attr,
    ) -> Result<Arc<Dentry>> {
        let id = self.next_dentry_id.fetch_add(1, Ordering::Relaxed);
        let d = Arc::new(Dentry::new(Arc::clone(self), id, file, qid, valid, attr)?);
        self.sync_state
            .lock()
            .expect("sync lock poisoned")
            .dentries
            .insert(id, Arc::clone(&d));
        Ok(d)
    }

    pub(crate) fn forget_dentry(&self, id: u64) {
        self.sync_state
            .lock()
            .expect("sync lock poisoned")
            .dentries
            .remove(&id);
    }

    pub(crate) fn next_fd_id(&self) -> u64 {
        self.next_fd_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_special_fd(&self, id: u64, fd: &Arc<SpecialFileFd>) {
        self.sync_state
            .lock()
            .expect("sync lock poisoned")
            .special_fds
            .insert(id, Arc::downgrade(fd));
    }

    pub(crate) fn unregister_special_fd(&self, id: u64) {
        self.sync_state
            .lock()
            .expect("sync lock poisoned")
            .special_fds
            .remove(&id);
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Resolve one component under `parent`, materialising a dentry via a
    /// server walk when it is not already cached. The returned dentry
    /// carries a reference for the caller.
    #[instrument(name = "Filesystem::lookup", skip(self, ctx, creds, parent), fields(parent_ino = parent.ino()))]
    pub fn lookup(
        self: &Arc<Self>,
        ctx: &dyn Context,
        creds: &Credentials,
        parent: &Arc<Dentry>,
        name: &str,
    ) -> Result<Arc<Dentry>> {
        if !parent.is_directory() {
            return Err(FsError::NotDir);
        }
        parent.check_permissions(creds, AccessKinds::EXEC)?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            // "." and ".." are the VFS's to resolve.
            return Err(FsError::Invalid);
        }

        let _rename = self.rename_mu.read().expect("rename lock poisoned");
        let mut dir = parent.dir_state().lock().expect("dir lock poisoned");

        if let Some(child) = dir.children.get(name).cloned() {
            let mut valid = true;
            if !self.opts.interop.can_cache_metadata() && !child.is_deleted() {
                match child.update_from_getattr(ctx) {
                    Ok(()) => {}
                    Err(err) if err.is_remote_enoent() => valid = false,
                    Err(err) => return Err(err),
                }
            }
            if valid {
                // Taking a reference on a refs==0 dentry is safe here: the
                // rename lock serialises against check_caching.
                child.inc_ref();
                return Ok(child);
            }
            // Another remote user deleted the object behind this dentry.
            dir.children.remove(name);
            child.set_disowned();
        }

        if self.opts.interop.can_cache_names() && dir.negative_children.contains(name) {
            return Err(FsError::NotFound);
        }

        let walked = {
            let _sleep = UninterruptibleSleep::enter(ctx);
            parent.base_file().walk(&[name])
        };
        let (_, file) = match walked {
            Ok(ok) => ok,
            Err(err) if err.is_enoent() => {
                if self.opts.interop.can_cache_names() {
                    dir.negative_children.insert(name.to_owned());
                }
                return Err(FsError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };
        let (qid, valid_mask, attr) = {
            let _sleep = UninterruptibleSleep::enter(ctx);
            file.get_attr(dentry_attr_mask())?
        };

        let child = self.new_dentry(file, qid, valid_mask, &attr)?;
        // The child holds one reference on its parent until destroyed.
        parent.inc_ref();
        child.set_parent(Some(Arc::clone(parent)), name);
        child.inc_ref();
        dir.children.insert(name.to_owned(), Arc::clone(&child));
        Ok(child)
    }

    // ── Directory mutation ──────────────────────────────────────────────

    /// Unlink `name` under `parent`. The dentry (if materialised) is marked
    /// deleted and disowned: held descriptions keep working through their
    /// fids, and the dentry dies once its last reference drops.
    #[instrument(name = "Filesystem::unlink", skip(self, ctx, creds, parent), fields(parent_ino = parent.ino()))]
    pub fn unlink(
        self: &Arc<Self>,
        ctx: &dyn Context,
        creds: &Credentials,
        parent: &Arc<Dentry>,
        name: &str,
        remove_dir: bool,
    ) -> Result<()> {
        if !parent.is_directory() {
            return Err(FsError::NotDir);
        }
        parent.check_permissions(creds, AccessKinds::WRITE | AccessKinds::EXEC)?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(FsError::Invalid);
        }

        // Unlink may destroy the child, which requires the write half.
        let guard = self.rename_mu.write().expect("rename lock poisoned");
        let mut dir = parent.dir_state().lock().expect("dir lock poisoned");

        let child = dir.children.get(name).cloned();
        if let Some(child) = &child
            && remove_dir != child.is_directory()
        {
            return Err(if child.is_directory() {
                FsError::IsDir
            } else {
                FsError::NotDir
            });
        }

        let flags = if remove_dir { libc::AT_REMOVEDIR as u32 } else { 0 };
        {
            let _sleep = UninterruptibleSleep::enter(ctx);
            parent.base_file().unlink_at(name, flags)?;
        }

        parent.touch_cmtime(ctx);
        dir.invalidate_names();
        if self.opts.interop.can_cache_names() {
            dir.negative_children.insert(name.to_owned());
        }
        if let Some(child) = child {
            if remove_dir {
                parent.dec_links();
            }
            dir.children.remove(name);
            child.set_deleted();
            child.set_disowned();
            drop(dir);
            // A disowned child with no remaining references dies now.
            if child.ref_count() == 0 {
                child.check_caching_locked(&guard);
            }
        }
        Ok(())
    }

    /// Rename `old_name` under `old_parent` to `new_name` under
    /// `new_parent`.
    #[instrument(name = "Filesystem::rename", skip_all, fields(old_name = old_name, new_name = new_name))]
    pub fn rename(
        self: &Arc<Self>,
        ctx: &dyn Context,
        creds: &Credentials,
        old_parent: &Arc<Dentry>,
        old_name: &str,
        new_parent: &Arc<Dentry>,
        new_name: &str,
    ) -> Result<()> {
        if !old_parent.is_directory() || !new_parent.is_directory() {
            return Err(FsError::NotDir);
        }
        for name in [old_name, new_name] {
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return Err(FsError::Invalid);
            }
        }
        old_parent.check_permissions(creds, AccessKinds::WRITE | AccessKinds::EXEC)?;
        new_parent.check_permissions(creds, AccessKinds::WRITE | AccessKinds::EXEC)?;

        let guard = self.rename_mu.write().expect("rename lock poisoned");
        let same_dir = Arc::ptr_eq(old_parent, new_parent);

        // With the rename lock held for writing we may lock both dir
        // mutexes; order by dentry id to stay deterministic.
        let (old_dir_guard, new_dir_guard) = if same_dir {
            (old_parent.dir_state().lock().expect("dir lock poisoned"), None)
        } else if old_parent.id() < new_parent.id() {
            let old = old_parent.dir_state().lock().expect("dir lock poisoned");
            let new = new_parent.dir_state().lock().expect("dir lock poisoned");
            (old, Some(new))
        } else {
            let new = new_parent.dir_state().lock().expect("dir lock poisoned");
            let old = old_parent.dir_state().lock().expect("dir lock poisoned");
            (old, Some(new))
        };
        let mut old_dir = old_dir_guard;
        let mut new_dir = new_dir_guard;

        if same_dir && old_name == new_name {
            return Ok(());
        }

        let child = old_dir.children.get(old_name).cloned();
        {
            let _sleep = UninterruptibleSleep::enter(ctx);
            old_parent
                .base_file()
                .rename_at(old_name, new_parent.base_file(), new_name)?;
        }

        let replaced = {
            let dst = new_dir.as_deref_mut().unwrap_or(&mut *old_dir);
            dst.children.remove(new_name)
        };
        if let Some(replaced) = &replaced {
            replaced.set_deleted();
            replaced.set_disowned();
        }

        if let Some(child) = &child {
            old_dir.children.remove(old_name);
            let dst = new_dir.as_deref_mut().unwrap_or(&mut *old_dir);
            dst.children.insert(new_name.to_owned(), Arc::clone(child));
            if same_dir {
                child.set_parent(Some(Arc::clone(old_parent)), new_name);
            } else {
                // The child's parent reference moves from the old parent to
                // the new one.
                new_parent.inc_ref();
                child.set_parent(Some(Arc::clone(new_parent)), new_name);
                if child.is_directory() {
                    old_parent.dec_links();
                    new_parent.inc_links();
                }
            }
        }

        old_dir.invalidate_names();
        if let Some(new_dir) = new_dir.as_deref_mut() {
            new_dir.invalidate_names();
        }
        old_parent.touch_cmtime(ctx);
        if !same_dir {
            new_parent.touch_cmtime(ctx);
        }
        drop(new_dir);
        drop(old_dir);

        if child.is_some() && !same_dir {
            // The moved child no longer references its old parent.
            old_parent.dec_ref_locked(&guard);
        }
        if let Some(replaced) = replaced
            && replaced.ref_count() == 0
        {
            replaced.check_caching_locked(&guard);
        }
        Ok(())
    }

    // ── Directory reading ───────────────────────────────────────────────

    /// Fetch (and outside Shared mode, cache) the full dirent list of a
    /// directory, in server order.
    pub fn dirents(
        self: &Arc<Self>,
        ctx: &dyn Context,
        d: &Arc<Dentry>,
    ) -> Result<Vec<Dirent>> {
        if !d.is_directory() {
            return Err(FsError::NotDir);
        }
        let can_cache = self.opts.interop.can_cache_names();
        let mut dir = d.dir_state().lock().expect("dir lock poisoned");
        if can_cache && let Some(dirents) = &dir.dirents {
            return Ok(dirents.clone());
        }

        // Directories are read through the shared handle, opened read-only.
        d.ensure_shared_handle(ctx, true, false, false)?;
        let h = d.handle_state().read().expect("handle lock poisoned");
        let file = h.handle.file().cloned().ok_or(FsError::Invalid)?;
        drop(h);

        let mut entries = Vec::new();
        let mut offset = 0u64;
        loop {
            let batch = {
                let _sleep = UninterruptibleSleep::enter(ctx);
                file.readdir(offset, 8192)?
            };
            let Some(last) = batch.last() else { break };
            offset = last.offset;
            entries.extend(batch.into_iter().map(|ent| Dirent {
                name: ent.name,
                type_: ent.type_,
                ino: ent.qid.path,
                next_off: ent.offset,
            }));
        }

        if can_cache {
            dir.dirents = Some(entries.clone());
        }
        Ok(entries)
    }

    // ── Opening files ───────────────────────────────────────────────────

    /// Open a file description on `d`. Takes a new dentry reference for the
    /// description.
    pub fn open(
        self: &Arc<Self>,
        ctx: &dyn Context,
        creds: &Credentials,
        d: &Arc<Dentry>,
        opts: OpenOptions,
    ) -> Result<OpenedFile> {
        let mut ats = AccessKinds::empty();
        if opts.read {
            ats |= AccessKinds::READ;
        }
        if opts.write {
            ats |= AccessKinds::WRITE;
        }
        d.check_permissions(creds, ats)?;

        if d.is_directory() {
            if opts.write || opts.trunc {
                return Err(FsError::IsDir);
            }
            d.inc_ref();
            return Ok(OpenedFile::Directory(Arc::new(DirectoryFd {
                fd: FileDescription::new(Arc::clone(d)),
                pos: Mutex::new(0),
            })));
        }
        if d.is_symlink() {
            // The VFS resolves symlinks before opening.
            return Err(FsError::Invalid);
        }

        if d.is_regular_file() && !self.opts.regular_files_use_special_fds {
            // A cached write needs to read the file's current bytes to fill
            // the edges of freshly allocated pages, so a write-only open
            // still takes a readable handle when caching is on.
            let want_read =
                opts.read || (opts.write && self.opts.interop.can_cache_data());
            d.ensure_shared_handle(ctx, want_read, opts.write, opts.trunc)?;
            if opts.trunc {
                d.truncate_after_open(ctx);
            }
            d.inc_ref();
            return Ok(OpenedFile::Regular(RegularFileFd::new(
                FileDescription::new(Arc::clone(d)),
                opts,
            )));
        }

        // Special files, and regular files under cache=none, get a private
        // handle per description.
        let handle = handle::Handle::open(ctx, d.base_file(), opts.read, opts.write, opts.trunc)?;
        d.inc_ref();
        let fd = SpecialFileFd::new(FileDescription::new(Arc::clone(d)), handle, opts);
        self.register_special_fd(fd.id(), &fd);
        Ok(OpenedFile::Special(fd))
    }

    // ── Global sync and release ─────────────────────────────────────────

    /// Flush dirty state on every dentry and fsync open special-file
    /// handles.
    pub fn sync(&self, ctx: &dyn Context) -> Result<()> {
        let (dentries, special): (Vec<Arc<Dentry>>, Vec<Arc<SpecialFileFd>>) = {
            let state = self.sync_state.lock().expect("sync lock poisoned");
            (
                state.dentries.values().cloned().collect(),
                state.special_fds.values().filter_map(Weak::upgrade).collect(),
            )
        };
        for d in dentries {
            d.flush_dirty(ctx);
        }
        for fd in special {
            fd.fsync(ctx)?;
        }
        Ok(())
    }

    /// Tear the filesystem down: drop the root pin, flush every dentry,
    /// drop caches and host FDs, and close the connection (which clunks all
    /// outstanding fids). Idempotent.
    ///
    /// Only called once no file descriptions hold the mount.
    pub fn release(&self, ctx: &dyn Context) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drop the pin symmetrically with the reference taken at mount time.
        let root = self.root.lock().expect("root lock poisoned").take();
        if let Some(root) = root {
            root.dec_ref();
        }

        let dentries: Vec<Arc<Dentry>> = {
            let state = self.sync_state.lock().expect("sync lock poisoned");
            state.dentries.values().cloned().collect()
        };
        for d in &dentries {
            d.release_cached_state(ctx);
        }

        // Break the structural references so dentries can drop.
        {
            let _guard = self.rename_mu.write().expect("rename lock poisoned");
            self.lru.lock().expect("lru lock poisoned").clear();
        }
        {
            let mut state = self.sync_state.lock().expect("sync lock poisoned");
            state.dentries.clear();
            state.special_fds.clear();
        }

        if let Some(client) = &self.client {
            client.close();
        }
        debug!("filesystem released");
    }
}

// ── File descriptions ───────────────────────────────────────────────────

/// State common to every open file: the dentry reference.
pub struct FileDescription {
    d: Arc<Dentry>,
}

impl FileDescription {
    pub(crate) fn new(d: Arc<Dentry>) -> Self {
        Self { d }
    }

    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.d
    }

    pub fn stat(&self, ctx: &dyn Context, opts: &StatOptions) -> Result<Stat> {
        self.d.stat(ctx, opts)
    }

    pub fn set_stat(&self, ctx: &dyn Context, creds: &Credentials, stat: &SetStat) -> Result<()> {
        self.d.set_stat(ctx, creds, stat)
    }

    pub fn list_xattr(&self, ctx: &dyn Context, creds: &Credentials, size: u64) -> Result<Vec<String>> {
        self.d.list_xattr(ctx, creds, size)
    }

    pub fn get_xattr(
        &self,
        ctx: &dyn Context,
        creds: &Credentials,
        name: &str,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.d.get_xattr(ctx, creds, name, size)
    }

    pub fn set_xattr(
        &self,
        ctx: &dyn Context,
        creds: &Credentials,
        name: &str,
        value: &[u8],
        flags: u32,
    ) -> Result<()> {
        self.d.set_xattr(ctx, creds, name, value, flags)
    }

    pub fn remove_xattr(&self, ctx: &dyn Context, creds: &Credentials, name: &str) -> Result<()> {
        self.d.remove_xattr(ctx, creds, name)
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        self.d.dec_ref();
    }
}

/// An open directory; readdir walks the (possibly cached) dirent list.
pub struct DirectoryFd {
    fd: FileDescription,
    /// Index into the dirent list; the per-description mutex at the top of
    /// the lock order.
    pos: Mutex<usize>,
}

impl DirectoryFd {
    pub fn description(&self) -> &FileDescription {
        &self.fd
    }

    /// Return up to `count` entries, advancing the description's position.
    pub fn readdir(&self, ctx: &dyn Context, count: usize) -> Result<Vec<Dirent>> {
        let mut pos = self.pos.lock().expect("fd lock poisoned");
        let d = self.fd.dentry();
        let entries = d.filesystem().dirents(ctx, d)?;
        let start = (*pos).min(entries.len());
        let end = start.saturating_add(count).min(entries.len());
        *pos = end;
        Ok(entries[start..end].to_vec())
    }

    pub fn rewind(&self) {
        *self.pos.lock().expect("fd lock poisoned") = 0;
    }
}
