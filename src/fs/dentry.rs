//! The dentry: the client's cached view of one remote filesystem object.
//!
//! Each dentry maps 1:1 to a remote file (hard links are unsupported) and
//! carries cached metadata, an optional open handle, the regular-file page
//! cache, and the directory-only name caches. A separate logical reference
//! count — not the `Arc` count — drives caching and destruction:
//!
//!   refs >= 1   live, reachable by path resolution
//!   refs == 0   cacheable, parked in the filesystem LRU
//!   refs == -1  destroyed
//!
//! Children hold exactly one logical reference on their parent, released
//! only when the child is destroyed. Dropping a reference count below zero,
//! destroying a destroyed dentry, or observing a file-type change are
//! defects and panic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::auth::{self, Credentials};
use crate::context::{Context, UninterruptibleSleep};
use crate::error::{FsError, Result};
use crate::fs::Filesystem;
use crate::fs::handle::{Handle, dup3_cloexec};
use crate::fs::range_set::{DirtySet, FileRangeCache, sync_dirty_all};
use crate::mem::{
    HostFileMapper, InvalidateOpts, MappableRange, MappingSet, MappingSpace, PAGE_SIZE,
    page_round_up,
};
use crate::vfs::{AccessKinds, Dirent, SetStat, SetTime, Stat, StatMask, StatOptions};

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_REGULAR: u32 = 0o100000;
const MODE_DIRECTORY: u32 = 0o040000;
const MODE_SYMLINK: u32 = 0o120000;

const XATTR_USER_PREFIX: &str = "user.";

/// Directory-only state, protected by `dir_mu`.
#[derive(Default)]
pub(crate) struct DirState {
    /// Children materialised by path resolution.
    pub children: FxHashMap<String, Arc<Dentry>>,
    /// Names known not to exist. Populated only when the coherence mode
    /// permits caching names.
    pub negative_children: FxHashSet<String>,
    /// Cached dirents in server order. Same caching restriction.
    pub dirents: Option<Vec<Dirent>>,
}

impl DirState {
    /// Any local mutation of the directory invalidates both name caches.
    pub fn invalidate_names(&mut self) {
        self.negative_children.clear();
        self.dirents = None;
    }
}

/// Handle state, protected by `handle_mu`. `readable` and `writable` grow
/// monotonically: handles are never downgraded while the dentry lives.
#[derive(Default)]
pub(crate) struct HandleState {
    pub handle: Handle,
    pub readable: bool,
    pub writable: bool,
}

/// Data state, protected by `data_mu`.
#[derive(Default)]
pub(crate) struct DataState {
    pub cache: FileRangeCache,
    pub dirty: DirtySet,
    /// Symlink target, cached only outside Shared mode.
    pub target: Option<String>,
}

pub struct Dentry {
    /// Unique within the filesystem; keys the dentry set and the LRU.
    id: u64,
    fs: Arc<Filesystem>,

    /// The unopened fid backing this dentry. Immutable; clunked on destroy.
    file: Arc<dyn p9::File>,

    /// Inode number, from the server QID path. Immutable.
    ino: u64,

    refs: AtomicI64,
    deleted: AtomicBool,

    /// LRU membership; mutated only under the filesystem rename lock.
    cached: AtomicBool,
    /// Set when the dentry is removed from its parent's children. Mutated
    /// under the rename lock plus the parent's `dir_mu`.
    disowned: AtomicBool,

    /// Parent link and name. The child's logical reference on the parent is
    /// dropped at destruction, not at disownment. Mutated under the rename
    /// lock.
    parent: Mutex<Option<Arc<Dentry>>>,
    name: Mutex<String>,

    dir: Mutex<DirState>,

    /// Serialises metadata writers; the fields themselves are atomics so
    /// readers don't take it.
    metadata_mu: Mutex<()>,
    mode: AtomicU32,
    uid: AtomicU32,
    gid: AtomicU32,
    block_size: AtomicU32,
    nlink: AtomicU32,
    // Timestamps in nanoseconds since the Unix epoch.
    atime: AtomicI64,
    mtime: AtomicI64,
    ctime: AtomicI64,
    btime: AtomicI64,
    /// Guarded by both `metadata_mu` and `data_mu` for writes; reads may use
    /// either (or neither, accepting a racy-but-consistent snapshot).
    size: AtomicU64,

    maps: Mutex<MappingSet>,

    handle: RwLock<HandleState>,
    data: RwLock<DataState>,

    /// Platform-file adapter for mappings of the donated host descriptor.
    pf: HostFileMapper,
}

/// The attribute set the client asks for whenever it fetches metadata.
pub(crate) fn dentry_attr_mask() -> p9::AttrMask {
    p9::AttrMask::MODE
        | p9::AttrMask::NLINK
        | p9::AttrMask::UID
        | p9::AttrMask::GID
        | p9::AttrMask::ATIME
        | p9::AttrMask::MTIME
        | p9::AttrMask::CTIME
        | p9::AttrMask::SIZE
        | p9::AttrMask::BTIME
}

fn nanos_from_spec(sec: u64, nsec: u64) -> i64 {
    i64::try_from(sec.saturating_mul(1_000_000_000).saturating_add(nsec)).unwrap_or(i64::MAX)
}

impl Dentry {
    /// Build a dentry for `file`. The reference count starts at zero; the
    /// caller takes references and registers the dentry as appropriate.
    pub(crate) fn new(
        fs: Arc<Filesystem>,
        id: u64,
        file: Arc<dyn p9::File>,
        qid: p9::Qid,
        valid: p9::AttrMask,
        attr: &p9::Attr,
    ) -> Result<Self> {
        if !valid.contains(p9::AttrMask::MODE) {
            warn!(ino = qid.path, "server did not report a file type");
            return Err(FsError::Remote(p9::Error::Remote(libc::EIO)));
        }
        if attr.mode & MODE_TYPE_MASK == MODE_REGULAR && !valid.contains(p9::AttrMask::SIZE) {
            warn!(ino = qid.path, "server did not report a regular file's size");
            return Err(FsError::Remote(p9::Error::Remote(libc::EIO)));
        }

        let (fs_uid, fs_gid) = fs.owner();
        let d = Self {
            id,
            fs,
            file,
            ino: qid.path,
            refs: AtomicI64::new(0),
            deleted: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            disowned: AtomicBool::new(false),
            parent: Mutex::new(None),
            name: Mutex::new(String::new()),
            dir: Mutex::new(DirState::default()),
            metadata_mu: Mutex::new(()),
            mode: AtomicU32::new(attr.mode),
            uid: AtomicU32::new(if valid.contains(p9::AttrMask::UID) {
                attr.uid
            } else {
                fs_uid
            }),
            gid: AtomicU32::new(if valid.contains(p9::AttrMask::GID) {
                attr.gid
            } else {
                fs_gid
            }),
            block_size: AtomicU32::new(if attr.blksize != 0 {
                attr.blksize as u32
            } else {
                PAGE_SIZE as u32
            }),
            nlink: AtomicU32::new(if valid.contains(p9::AttrMask::NLINK) {
                attr.nlink as u32
            } else {
                1
            }),
            atime: AtomicI64::new(nanos_from_spec(attr.atime_sec, attr.atime_nsec)),
            mtime: AtomicI64::new(nanos_from_spec(attr.mtime_sec, attr.mtime_nsec)),
            ctime: AtomicI64::new(nanos_from_spec(attr.ctime_sec, attr.ctime_nsec)),
            btime: AtomicI64::new(nanos_from_spec(attr.btime_sec, attr.btime_nsec)),
            size: AtomicU64::new(if valid.contains(p9::AttrMask::SIZE) {
                attr.size
            } else {
                0
            }),
            maps: Mutex::new(MappingSet::new()),
            handle: RwLock::new(HandleState::default()),
            data: RwLock::new(DataState::default()),
            pf: HostFileMapper::new(),
        };
        Ok(d)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    pub(crate) fn base_file(&self) -> &Arc<dyn p9::File> {
        &self.file
    }

    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn gid(&self) -> u32 {
        self.gid.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn file_type(&self) -> u32 {
        self.mode() & MODE_TYPE_MASK
    }

    pub fn is_regular_file(&self) -> bool {
        self.file_type() == MODE_REGULAR
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == MODE_DIRECTORY
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == MODE_SYMLINK
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Mark the file unlinked by the guest. Reads and writes through held
    /// fids remain legal; revalidation becomes a no-op.
    pub fn set_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_disowned(&self) -> bool {
        self.disowned.load(Ordering::Acquire)
    }

    pub(crate) fn set_disowned(&self) {
        self.disowned.store(true, Ordering::Release);
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().expect("name lock poisoned").clone()
    }

    pub(crate) fn set_parent(&self, parent: Option<Arc<Dentry>>, name: &str) {
        *self.parent.lock().expect("parent lock poisoned") = parent;
        *self.name.lock().expect("name lock poisoned") = name.to_owned();
    }

    pub(crate) fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.lock().expect("parent lock poisoned").clone()
    }

    pub(crate) fn dir_state(&self) -> &Mutex<DirState> {
        &self.dir
    }

    pub(crate) fn data_state(&self) -> &RwLock<DataState> {
        &self.data
    }

    pub(crate) fn handle_state(&self) -> &RwLock<HandleState> {
        &self.handle
    }

    pub(crate) fn platform_file(&self) -> &HostFileMapper {
        &self.pf
    }

    pub(crate) fn metadata_mu(&self) -> &Mutex<()> {
        &self.metadata_mu
    }

    /// Store a new size. Callers hold both `metadata_mu` and the `data_mu`
    /// write half.
    pub(crate) fn store_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    // ── Reference counting and caching ──────────────────────────────────

    /// Current logical reference count. Exposed for invariant checks.
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    /// Unconditional increment. Safe because the caller already holds a
    /// reference, or holds the rename lock (which serialises against
    /// `check_caching_locked`).
    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Take a reference only if the dentry has not been destroyed. This is
    /// what distinguishes "cacheable" (refs == 0) from "destroyed"
    /// (refs == -1) without the rename lock.
    pub fn try_inc_ref(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Acquire);
        loop {
            if refs <= 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => refs = observed,
            }
        }
    }

    pub fn dec_ref(self: &Arc<Self>) {
        let refs = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if refs == 0 {
            let fs = Arc::clone(&self.fs);
            let guard = fs.rename_mu().write().expect("rename lock poisoned");
            self.check_caching_locked(&guard);
            drop(guard);
        } else if refs < 0 {
            panic!("Dentry::dec_ref called without holding a reference");
        }
    }

    /// `dec_ref` for callers that already hold the rename lock for writing.
    pub(crate) fn dec_ref_locked(self: &Arc<Self>, guard: &RwLockWriteGuard<'_, ()>) {
        let refs = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if refs == 0 {
            self.check_caching_locked(guard);
        } else if refs < 0 {
            panic!("Dentry::dec_ref called without holding a reference");
        }
    }

    /// Decide what to do with a dentry whose reference count reached zero or
    /// which was just disowned. May destroy `self`, and may evict and
    /// destroy the LRU's least recently used dentry.
    ///
    /// Preconditions: the filesystem rename lock is held for writing.
    pub(crate) fn check_caching_locked(self: &Arc<Self>, guard: &RwLockWriteGuard<'_, ()>) {
        // A racing path resolution may have re-referenced the dentry; it
        // can't drop back to zero while we hold the rename lock.
        let refs = self.refs.load(Ordering::Acquire);
        if refs > 0 {
            if self.is_cached() {
                self.fs.lru().lock().expect("lru lock poisoned").remove(self.id);
                self.cached.store(false, Ordering::Release);
            }
            return;
        }
        if refs == -1 {
            // Already destroyed by an earlier check in the same operation.
            return;
        }

        // Orphaned or disowned dentries are unreachable by path resolution;
        // drop them immediately.
        let parented = self.parent.lock().expect("parent lock poisoned").is_some();
        if !parented || self.is_disowned() {
            if self.is_cached() {
                self.fs.lru().lock().expect("lru lock poisoned").remove(self.id);
                self.cached.store(false, Ordering::Release);
            }
            self.destroy_locked(guard);
            return;
        }

        let mut lru = self.fs.lru().lock().expect("lru lock poisoned");
        if self.is_cached() {
            lru.touch(self.id);
            return;
        }
        lru.push_mru(Arc::clone(self));
        self.cached.store(true, Ordering::Release);
        if lru.len() <= self.fs.opts().dentry_cache_limit {
            return;
        }

        // Over-full: evict the least recently used dentry. Its refs may have
        // become non-zero since it was cached; either way the cache is back
        // at its bound, so eviction never loops.
        let Some(victim) = lru.pop_lru() else { return };
        victim.cached.store(false, Ordering::Release);
        drop(lru);
        if victim.refs.load(Ordering::Acquire) != 0 {
            return;
        }
        if let Some(parent) = victim.parent() {
            let mut dir = parent.dir.lock().expect("dir lock poisoned");
            if !victim.is_disowned() {
                // Force-delete the dentry. Only the dentry goes away, not
                // the file it represents, so the parent's dirent cache
                // stays valid.
                dir.children.remove(&victim.name());
                victim.set_disowned();
            }
            drop(dir);
        }
        victim.destroy_locked(guard);
    }

    /// Tear the dentry down: flush dirty pages, drop the cache, close the
    /// handle and the base fid, unregister from the filesystem, and drop the
    /// reference held on the parent.
    ///
    /// Preconditions: rename lock held for writing; refs == 0; the dentry is
    /// not reachable as a live child.
    pub(crate) fn destroy_locked(self: &Arc<Self>, guard: &RwLockWriteGuard<'_, ()>) {
        match self
            .refs
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(-1) => panic!("Dentry::destroy_locked called on already destroyed dentry"),
            Err(_) => panic!("Dentry::destroy_locked called with live references"),
        }

        let ctx = self.fs.background_ctx();
        {
            let mut h = self.handle.write().expect("handle lock poisoned");
            if h.handle.is_open() {
                let mut data = self.data.write().expect("data lock poisoned");
                if h.writable {
                    // Write dirty pages back; on failure the remote state is
                    // unrecoverable and the dentry is torn down regardless.
                    let size = self.size.load(Ordering::Relaxed);
                    let DataState { cache, dirty, .. } = &mut *data;
                    let handle = &h.handle;
                    let mut writer = |off: u64, buf: &[u8]| handle.write_at(ctx, buf, off);
                    if let Err(err) =
                        sync_dirty_all(cache, dirty, size, self.fs.memfile(), &mut writer)
                    {
                        warn!(ino = self.ino, error = %err, "failed to flush dentry during destroy");
                    }
                }
                data.cache.drop_all(self.fs.memfile());
                data.dirty.remove_all();
                drop(data);
                h.handle.close(ctx);
            }
        }
        self.file.close();
        self.fs.forget_dentry(self.id);

        // Drop the reference held on the parent, without re-locking the
        // rename lock.
        let parent = self.parent.lock().expect("parent lock poisoned").take();
        if let Some(parent) = parent {
            let refs = parent.refs.fetch_sub(1, Ordering::AcqRel) - 1;
            if refs == 0 {
                parent.check_caching_locked(guard);
            } else if refs < 0 {
                panic!("Dentry::dec_ref called without holding a reference");
            }
        }
    }

    // ── Metadata ────────────────────────────────────────────────────────

    /// Merge attributes reported by the server. A change of file type is a
    /// violated invariant and faults.
    pub(crate) fn update_from_attrs(&self, valid: p9::AttrMask, attr: &p9::Attr) {
        let _meta = self.metadata_mu.lock().expect("metadata lock poisoned");
        if valid.contains(p9::AttrMask::MODE) {
            let got = attr.mode & MODE_TYPE_MASK;
            let want = self.file_type();
            if got != want {
                panic!("dentry file type changed from {want:#o} to {got:#o}");
            }
            self.mode.store(attr.mode, Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::UID) {
            self.uid.store(attr.uid, Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::GID) {
            self.gid.store(attr.gid, Ordering::Relaxed);
        }
        // There is no validity bit for the I/O block size.
        if attr.blksize != 0 {
            self.block_size.store(attr.blksize as u32, Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::ATIME) {
            self.atime
                .store(nanos_from_spec(attr.atime_sec, attr.atime_nsec), Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::MTIME) {
            self.mtime
                .store(nanos_from_spec(attr.mtime_sec, attr.mtime_nsec), Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::CTIME) {
            self.ctime
                .store(nanos_from_spec(attr.ctime_sec, attr.ctime_nsec), Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::BTIME) {
            self.btime
                .store(nanos_from_spec(attr.btime_sec, attr.btime_nsec), Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::NLINK) {
            self.nlink.store(attr.nlink as u32, Ordering::Relaxed);
        }
        if valid.contains(p9::AttrMask::SIZE) {
            let _data = self.data.write().expect("data lock poisoned");
            self.size.store(attr.size, Ordering::Relaxed);
        }
    }

    /// Refresh metadata from the server, preferring the open handle's fid
    /// (servers often serve getattr on an open fid more cheaply).
    pub fn update_from_getattr(&self, ctx: &dyn Context) -> Result<()> {
        if self.is_deleted() {
            // The server-side object is gone; there is nothing coherent to
            // fetch, and the cached view is the only one that matters.
            return Ok(());
        }
        let h = self.handle.read().expect("handle lock poisoned");
        let handle_file = h.handle.file().cloned();
        let (valid, attr) = match handle_file {
            Some(file) => {
                // Hold the read half across the RPC so the fid cannot be
                // clunked out from under the getattr.
                let _sleep = UninterruptibleSleep::enter(ctx);
                let res = file.get_attr(dentry_attr_mask());
                drop(h);
                let (_, valid, attr) = res?;
                (valid, attr)
            }
            None => {
                drop(h);
                let _sleep = UninterruptibleSleep::enter(ctx);
                let (_, valid, attr) = self.file.get_attr(dentry_attr_mask())?;
                (valid, attr)
            }
        };
        self.update_from_attrs(valid, &attr);
        Ok(())
    }

    fn stat_snapshot(&self) -> Stat {
        let size = self.size();
        Stat {
            mask: StatMask::TYPE
                | StatMask::MODE
                | StatMask::NLINK
                | StatMask::UID
                | StatMask::GID
                | StatMask::ATIME
                | StatMask::MTIME
                | StatMask::CTIME
                | StatMask::INO
                | StatMask::SIZE
                | StatMask::BLOCKS
                | StatMask::BTIME,
            blksize: self.block_size.load(Ordering::Relaxed),
            nlink: self.nlink.load(Ordering::Relaxed),
            uid: self.uid(),
            gid: self.gid(),
            mode: self.mode(),
            ino: self.ino,
            size,
            // Consistent with seek: regular files are treated as having no
            // holes.
            blocks: (size + 511) / 512,
            atime: self.atime.load(Ordering::Relaxed),
            mtime: self.mtime.load(Ordering::Relaxed),
            ctime: self.ctime.load(Ordering::Relaxed),
            btime: self.btime.load(Ordering::Relaxed),
        }
    }

    /// A consistent metadata snapshot. Under Shared mode the snapshot is
    /// refreshed from the server first, unless the caller opted out or the
    /// file has been unlinked.
    pub fn stat(&self, ctx: &dyn Context, opts: &StatOptions) -> Result<Stat> {
        if !self.fs.opts().interop.can_cache_metadata()
            && opts.mask.intersects(StatMask::all())
            && !opts.dont_sync
        {
            self.update_from_getattr(ctx)?;
        }
        Ok(self.stat_snapshot())
    }

    /// Apply an attribute change.
    pub fn set_stat(&self, ctx: &dyn Context, creds: &Credentials, stat: &SetStat) -> Result<()> {
        if stat.mask.is_empty() {
            return Ok(());
        }
        if stat.mask.intersects(!StatMask::SETTABLE) {
            return Err(FsError::Perm);
        }
        auth::check_set_stat(creds, stat, self.mode(), self.uid(), self.gid())?;

        let interop = self.fs.opts().interop;
        let mut server_mask = stat.mask;
        let mut set_local_atime = false;
        let mut set_local_mtime = false;
        let mut local_mtime = stat.mtime;
        if !interop.timestamps_from_server() {
            // Timestamp updates are handled locally; the server never sees
            // client-originated clock values.
            set_local_atime = stat.mask.contains(StatMask::ATIME);
            set_local_mtime = stat.mask.contains(StatMask::MTIME);
            server_mask -= StatMask::ATIME | StatMask::MTIME;
            if !set_local_mtime && stat.mask.contains(StatMask::SIZE) {
                // Truncation updates mtime.
                set_local_mtime = true;
                local_mtime = SetTime::Now;
            }
        }

        let _meta = self.metadata_mu.lock().expect("metadata lock poisoned");
        if !server_mask.is_empty() {
            let mut valid = p9::SetAttrMask::empty();
            let mut attr = p9::SetAttr::default();
            if server_mask.contains(StatMask::MODE) {
                valid |= p9::SetAttrMask::MODE;
                attr.mode = stat.mode;
            }
            if server_mask.contains(StatMask::UID) {
                valid |= p9::SetAttrMask::UID;
                attr.uid = stat.uid;
            }
            if server_mask.contains(StatMask::GID) {
                valid |= p9::SetAttrMask::GID;
                attr.gid = stat.gid;
            }
            if server_mask.contains(StatMask::SIZE) {
                valid |= p9::SetAttrMask::SIZE;
                attr.size = stat.size;
            }
            if server_mask.contains(StatMask::ATIME) {
                valid |= p9::SetAttrMask::ATIME;
                if !stat.atime.is_now() {
                    valid |= p9::SetAttrMask::ATIME_SET;
                    (attr.atime_sec, attr.atime_nsec) = stat.atime.to_spec();
                }
            }
            if server_mask.contains(StatMask::MTIME) {
                valid |= p9::SetAttrMask::MTIME;
                if !stat.mtime.is_now() {
                    valid |= p9::SetAttrMask::MTIME_SET;
                    (attr.mtime_sec, attr.mtime_nsec) = stat.mtime.to_spec();
                }
            }
            let _sleep = UninterruptibleSleep::enter(ctx);
            self.file.set_attr(valid, &attr)?;
        }

        if interop.timestamps_from_server() {
            // Updating cached metadata is pointless: revalidation overwrites
            // it before the next use, and Shared mode has no page cache to
            // truncate.
            return Ok(());
        }

        let now = ctx.now_nanos();
        if stat.mask.contains(StatMask::MODE) {
            self.mode
                .store(self.file_type() | (stat.mode & !MODE_TYPE_MASK), Ordering::Relaxed);
        }
        if stat.mask.contains(StatMask::UID) {
            self.uid.store(stat.uid, Ordering::Relaxed);
        }
        if stat.mask.contains(StatMask::GID) {
            self.gid.store(stat.gid, Ordering::Relaxed);
        }
        if set_local_atime {
            self.atime.store(stat.atime.nanos_or(now), Ordering::Relaxed);
        }
        if set_local_mtime {
            self.mtime.store(local_mtime.nanos_or(now), Ordering::Relaxed);
        }
        self.ctime.store(now, Ordering::Relaxed);
        if stat.mask.contains(StatMask::SIZE) {
            self.resize_locked(stat.size);
        }
        Ok(())
    }

    /// Install a new size. On shrink, invalidate mappings over the truncated
    /// pages and drop the cache tail.
    ///
    /// Preconditions: `metadata_mu` held.
    fn resize_locked(&self, new_size: u64) {
        let old_size = {
            let _data = self.data.write().expect("data lock poisoned");
            let old = self.size.load(Ordering::Relaxed);
            self.size.store(new_size, Ordering::Relaxed);
            old
        };
        // The data lock must be dropped before taking the maps lock, which
        // sorts above it. Concurrent reads synchronise with the truncation
        // by refusing to use cache contents beyond the new size; racing
        // writers are excluded because we still hold `metadata_mu`.
        if new_size >= old_size {
            return;
        }
        let old_pgend = page_round_up(old_size);
        let new_pgend = page_round_up(new_size);
        if old_pgend != new_pgend {
            let maps = self.maps.lock().expect("maps lock poisoned");
            maps.invalidate(
                MappableRange::new(new_pgend, old_pgend),
                &InvalidateOpts {
                    // Truncated pages must disappear even from private
                    // copies, like unmap_mapping_range(evencows=1).
                    invalidate_private: true,
                },
            );
        }
        // No translation of the truncated pages can remain; they are gone
        // from the remote file, so drop them without writeback.
        let mut data = self.data.write().expect("data lock poisoned");
        let DataState { cache, dirty, .. } = &mut *data;
        cache.truncate(new_size, self.fs.memfile());
        dirty.keep_clean(MappableRange::new(new_size, old_pgend));
    }

    /// Bring local state in line with a server-side O_TRUNC open: size goes
    /// to zero, mappings over the old pages are invalidated, and cached
    /// pages are dropped. Under Shared mode the next revalidation picks the
    /// size up instead.
    pub(crate) fn truncate_after_open(&self, ctx: &dyn Context) {
        if self.fs.opts().interop.timestamps_from_server() {
            return;
        }
        let now = ctx.now_nanos();
        let _meta = self.metadata_mu.lock().expect("metadata lock poisoned");
        self.mtime.store(now, Ordering::Relaxed);
        self.ctime.store(now, Ordering::Relaxed);
        self.resize_locked(0);
    }

    /// Standard POSIX access check against cached metadata. Never contacts
    /// the server.
    pub fn check_permissions(&self, creds: &Credentials, ats: AccessKinds) -> Result<()> {
        auth::check_permissions(creds, ats, self.mode(), self.uid(), self.gid())
    }

    pub(crate) fn inc_links(&self) {
        let nlink = self.nlink.fetch_add(1, Ordering::AcqRel) + 1;
        if nlink < 2 {
            panic!("dentry link count was zero or overflowed: {nlink}");
        }
    }

    pub(crate) fn dec_links(&self) {
        let nlink = self.nlink.fetch_sub(1, Ordering::AcqRel);
        if nlink == 0 {
            panic!("dentry link count underflowed");
        }
    }

    pub(crate) fn touch_cmtime(&self, ctx: &dyn Context) {
        if self.fs.opts().interop.timestamps_from_server() {
            return;
        }
        let now = ctx.now_nanos();
        let _meta = self.metadata_mu.lock().expect("metadata lock poisoned");
        self.touch_cmtime_locked(now);
    }

    /// As [`Self::touch_cmtime`], with `metadata_mu` already held.
    pub(crate) fn touch_cmtime_locked(&self, now: i64) {
        self.mtime.store(now, Ordering::Relaxed);
        self.ctime.store(now, Ordering::Relaxed);
    }

    // ── Extended attributes ─────────────────────────────────────────────

    /// Only attributes in the `user.` namespace are exposed.
    pub fn list_xattr(
        &self,
        ctx: &dyn Context,
        _creds: &Credentials,
        size: u64,
    ) -> Result<Vec<String>> {
        let _sleep = UninterruptibleSleep::enter(ctx);
        let names = self.file.list_xattr(size)?;
        Ok(names
            .into_iter()
            .filter(|name| name.starts_with(XATTR_USER_PREFIX))
            .collect())
    }

    pub fn get_xattr(
        &self,
        ctx: &dyn Context,
        creds: &Credentials,
        name: &str,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.check_permissions(creds, AccessKinds::READ)?;
        if !name.starts_with(XATTR_USER_PREFIX) {
            return Err(FsError::Unsupported);
        }
        let _sleep = UninterruptibleSleep::enter(ctx);
        Ok(self.file.get_xattr(name, size)?)
    }

    pub fn set_xattr(
        &self,
        ctx: &dyn Context,
        creds: &Credentials,
        name: &str,
        value: &[u8],
        flags: u32,
    ) -> Result<()> {
        self.check_permissions(creds, AccessKinds::WRITE)?;
        if !name.starts_with(XATTR_USER_PREFIX) {
            return Err(FsError::Unsupported);
        }
        let _sleep = UninterruptibleSleep::enter(ctx);
        Ok(self.file.set_xattr(name, value, flags)?)
    }

    pub fn remove_xattr(&self, ctx: &dyn Context, creds: &Credentials, name: &str) -> Result<()> {
        self.check_permissions(creds, AccessKinds::WRITE)?;
        if !name.starts_with(XATTR_USER_PREFIX) {
            return Err(FsError::Unsupported);
        }
        let _sleep = UninterruptibleSleep::enter(ctx);
        Ok(self.file.remove_xattr(name)?)
    }

    // ── Symlinks ────────────────────────────────────────────────────────

    /// Read the symlink target, caching it when the coherence mode allows.
    pub fn read_symlink(&self, ctx: &dyn Context) -> Result<String> {
        if !self.is_symlink() {
            return Err(FsError::Invalid);
        }
        let can_cache = self.fs.opts().interop.can_cache_names();
        if can_cache {
            let data = self.data.read().expect("data lock poisoned");
            if let Some(target) = &data.target {
                return Ok(target.clone());
            }
        }
        let target = {
            let _sleep = UninterruptibleSleep::enter(ctx);
            self.file.read_link()?
        };
        if can_cache {
            self.data.write().expect("data lock poisoned").target = Some(target.clone());
        }
        Ok(target)
    }

    // ── Application mappings ────────────────────────────────────────────

    pub fn add_mapping(&self, range: MappableRange, space: Arc<dyn MappingSpace>) {
        let mut maps = self.maps.lock().expect("maps lock poisoned");
        maps.add(range, space);
    }

    pub fn remove_mapping(&self, range: MappableRange, space: &Arc<dyn MappingSpace>) {
        let mut maps = self.maps.lock().expect("maps lock poisoned");
        maps.remove(range, space);
    }

    // ── Handle management ───────────────────────────────────────────────

    /// Whether the shared handle currently satisfies `(read, write)`.
    pub fn handle_flags(&self) -> (bool, bool) {
        let h = self.handle.read().expect("handle lock poisoned");
        (h.readable, h.writable)
    }

    pub fn host_fd(&self) -> Option<std::os::fd::RawFd> {
        self.handle.read().expect("handle lock poisoned").handle.host_fd()
    }

    /// The host descriptor to serve application mappings from, if mappings
    /// may bypass the client's page cache at all. With `force_page_cache`
    /// the client caches regular-file pages itself even when a descriptor is
    /// available.
    pub fn mappable_host_fd(&self) -> Option<std::os::fd::RawFd> {
        if self.fs.opts().force_page_cache {
            return None;
        }
        self.host_fd()
    }

    /// Ensure the dentry's shared handle grants at least the requested
    /// capabilities, upgrading it in place if not.
    ///
    /// The upgrade must not disturb existing users: when both the old and
    /// new handles carry host descriptors, the new description is moved onto
    /// the old descriptor *number*, so racing I/O and established memory
    /// mappings keep working. A handle with a host descriptor and one
    /// without are not interchangeable; mixing them would produce
    /// incoherent mappings, so that upgrade fails instead.
    pub fn ensure_shared_handle(
        &self,
        ctx: &dyn Context,
        read: bool,
        write: bool,
        trunc: bool,
    ) -> Result<()> {
        // O_TRUNC always requires a fresh server-side open.
        if !trunc {
            let h = self.handle.read().expect("handle lock poisoned");
            if (!read || h.readable) && (!write || h.writable) {
                return Ok(());
            }
        }

        let mut had_old_fd = false;
        {
            let mut h = self.handle.write().expect("handle lock poisoned");
            if (read && !h.readable) || (write && !h.writable) || trunc {
                // Handles only ever grow capabilities.
                let want_read = h.readable || read;
                let want_write = h.writable || write;
                let mut new = Handle::open(ctx, &self.file, want_read, want_write, trunc)?;
                if h.handle.is_open() {
                    had_old_fd = h.handle.host_fd().is_some();
                    let have_new_fd = new.host_fd().is_some();
                    if had_old_fd != have_new_fd {
                        warn!(
                            ino = self.ino,
                            had_old_fd,
                            have_new_fd,
                            "host FD availability changed across handle upgrade"
                        );
                        new.close(ctx);
                        return Err(FsError::IncoherentUpgrade);
                    }
                    if had_old_fd {
                        let old_fd = h.handle.host_fd().expect("checked above");
                        let new_fd = new.host_fd().expect("checked above");
                        if let Err(err) = dup3_cloexec(new_fd, old_fd) {
                            warn!(ino = self.ino, error = %err, "dup3 failed during handle upgrade");
                            new.close(ctx);
                            return Err(err.into());
                        }
                        // The old number now names the new description;
                        // retire the temporary number and keep the old one.
                        let old_owned = h.handle.take_fd().expect("checked above");
                        new.set_fd(old_owned);
                        if self.fs.opts().overlayfs_stale_read {
                            // The old and new backing files may not be
                            // coherent at the host; re-establish our own
                            // mappings against the new description.
                            if let Err(err) = self.pf.regenerate_mappings(old_fd) {
                                warn!(ino = self.ino, error = %err,
                                    "failed to regenerate host mappings during handle upgrade");
                                new.close(ctx);
                                return Err(err.into());
                            }
                        }
                        // Clunk the old fid before the new handle becomes
                        // visible.
                        h.handle.clunk(ctx);
                    } else {
                        h.handle.close(ctx);
                    }
                }
                h.handle = new;
                h.readable = want_read;
                h.writable = want_write;
            }
        }

        if self.fs.opts().overlayfs_stale_read && had_old_fd {
            // Application mappings may still translate to the old backing
            // file; drop them so the next fault repopulates from the new
            // descriptor. The maps lock sorts above the handle lock, hence
            // this runs after the handle lock is released.
            let maps = self.maps.lock().expect("maps lock poisoned");
            maps.invalidate_all(&InvalidateOpts::default());
        }
        Ok(())
    }

    /// Flush dirty pages; used by filesystem-wide sync.
    pub(crate) fn flush_dirty(&self, ctx: &dyn Context) {
        let h = self.handle.write().expect("handle lock poisoned");
        if !h.handle.is_open() || !h.writable {
            return;
        }
        let mut data = self.data.write().expect("data lock poisoned");
        let size = self.size.load(Ordering::Relaxed);
        let DataState { cache, dirty, .. } = &mut *data;
        let handle = &h.handle;
        let mut writer = |off: u64, buf: &[u8]| handle.write_at(ctx, buf, off);
        if let Err(err) = sync_dirty_all(cache, dirty, size, self.fs.memfile(), &mut writer) {
            warn!(ino = self.ino, error = %err, "failed to flush dentry");
        }
    }

    /// Release-time teardown: flush, drop the page cache, and close the host
    /// descriptor. The fid is left alone; closing the client connection
    /// clunks every fid in one stroke.
    pub(crate) fn release_cached_state(&self, ctx: &dyn Context) {
        let mut h = self.handle.write().expect("handle lock poisoned");
        if !h.handle.is_open() {
            return;
        }
        let mut data = self.data.write().expect("data lock poisoned");
        if h.writable {
            let size = self.size.load(Ordering::Relaxed);
            let DataState { cache, dirty, .. } = &mut *data;
            let handle = &h.handle;
            let mut writer = |off: u64, buf: &[u8]| handle.write_at(ctx, buf, off);
            if let Err(err) = sync_dirty_all(cache, dirty, size, self.fs.memfile(), &mut writer) {
                warn!(ino = self.ino, error = %err, "failed to flush dentry during release");
            }
        }
        data.cache.drop_all(self.fs.memfile());
        data.dirty.remove_all();
        drop(data);
        drop(h.handle.take_fd());
    }
}
