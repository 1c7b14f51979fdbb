//! In-process fake 9P server for tests.
//!
//! Implements the `p9::File` contract over an in-memory tree, with call
//! counters so tests can assert which operations actually reached the
//! "server". When FD donation is enabled, opens of regular files donate a
//! descriptor onto a real (unlinked) temp file, so the handle-upgrade
//! machinery exercises genuine dup3 semantics.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File as StdFile;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use p9::{Attr, AttrMask, Dirent, Error, File, OpenFlags, Qid, Result, SetAttr, SetAttrMask};

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_REGULAR: u32 = 0o100000;
const MODE_DIRECTORY: u32 = 0o040000;
const MODE_SYMLINK: u32 = 0o120000;

pub(crate) struct Node {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub data: Vec<u8>,
    pub target: String,
    pub children: BTreeMap<String, u64>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Backing file for donated descriptors, created lazily.
    backing: Option<StdFile>,
}

impl Node {
    fn new(mode: u32) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            nlink: if mode & MODE_TYPE_MASK == MODE_DIRECTORY { 2 } else { 1 },
            data: Vec::new(),
            target: String::new(),
            children: BTreeMap::new(),
            xattrs: BTreeMap::new(),
            backing: None,
        }
    }

    fn qid(&self, ino: u64) -> Qid {
        let type_ = match self.mode & MODE_TYPE_MASK {
            MODE_DIRECTORY => p9::QID_TYPE_DIR,
            MODE_SYMLINK => p9::QID_TYPE_SYMLINK,
            _ => p9::QID_TYPE_FILE,
        };
        Qid {
            type_,
            version: 0,
            path: ino,
        }
    }

    fn attr(&self) -> Attr {
        Attr {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlink: self.nlink,
            size: self.data.len() as u64,
            blksize: 4096,
            atime_sec: 1,
            mtime_sec: 2,
            ctime_sec: 3,
            btime_sec: 4,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub walks: AtomicUsize,
    pub getattrs: AtomicUsize,
    pub setattrs: AtomicUsize,
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub readdirs: AtomicUsize,
    pub unlinks: AtomicUsize,
    pub renames: AtomicUsize,
    pub readlinks: AtomicUsize,
    pub xattr_ops: AtomicUsize,
}

pub(crate) struct FakeServer {
    nodes: Mutex<BTreeMap<u64, Node>>,
    next_ino: AtomicU64,
    donate_fds: AtomicBool,
    /// Inos whose fids have been clunked, in order.
    clunks: Mutex<Vec<u64>>,
    pub counters: Counters,
}

pub(crate) const ROOT_INO: u64 = 1;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_INO, Node::new(MODE_DIRECTORY | 0o755));
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            donate_fds: AtomicBool::new(false),
            clunks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    pub fn set_donate_fds(&self, donate: bool) {
        self.donate_fds.store(donate, Ordering::Relaxed);
    }

    fn insert_child(self: &Arc<Self>, parent: u64, name: &str, node: Node) -> u64 {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let mut nodes = self.nodes.lock().expect("fake server lock");
        let is_dir = node.mode & MODE_TYPE_MASK == MODE_DIRECTORY;
        nodes.insert(ino, node);
        let parent_node = nodes.get_mut(&parent).expect("parent node exists");
        parent_node.children.insert(name.to_owned(), ino);
        if is_dir {
            parent_node.nlink += 1;
        }
        ino
    }

    pub fn add_dir(self: &Arc<Self>, parent: u64, name: &str) -> u64 {
        self.insert_child(parent, name, Node::new(MODE_DIRECTORY | 0o755))
    }

    pub fn add_file(self: &Arc<Self>, parent: u64, name: &str, mode: u32, data: &[u8]) -> u64 {
        let mut node = Node::new(MODE_REGULAR | (mode & !MODE_TYPE_MASK));
        node.data = data.to_vec();
        self.insert_child(parent, name, node)
    }

    pub fn add_symlink(self: &Arc<Self>, parent: u64, name: &str, target: &str) -> u64 {
        let mut node = Node::new(MODE_SYMLINK | 0o777);
        node.target = target.to_owned();
        self.insert_child(parent, name, node)
    }

    pub fn set_xattr_raw(&self, ino: u64, name: &str, value: &[u8]) {
        let mut nodes = self.nodes.lock().expect("fake server lock");
        nodes
            .get_mut(&ino)
            .expect("node exists")
            .xattrs
            .insert(name.to_owned(), value.to_vec());
    }

    pub fn node_data(&self, ino: u64) -> Vec<u8> {
        self.nodes.lock().expect("fake server lock")[&ino].data.clone()
    }

    pub fn clunks_for(&self, ino: u64) -> usize {
        self.clunks
            .lock()
            .expect("fake server lock")
            .iter()
            .filter(|clunked| **clunked == ino)
            .count()
    }

    /// The root fid, as an attach would produce it.
    pub fn attach_root(self: &Arc<Self>) -> Arc<dyn File> {
        Arc::new(FakeFile {
            server: Arc::clone(self),
            ino: ROOT_INO,
            closed: AtomicBool::new(false),
        })
    }

    fn fid_for(self: &Arc<Self>, ino: u64) -> Arc<dyn File> {
        Arc::new(FakeFile {
            server: Arc::clone(self),
            ino,
            closed: AtomicBool::new(false),
        })
    }

    /// A descriptor onto the node's backing temp file.
    fn donated_fd(&self, ino: u64) -> std::io::Result<OwnedFd> {
        let mut nodes = self.nodes.lock().expect("fake server lock");
        let node = nodes.get_mut(&ino).expect("node exists");
        if node.backing.is_none() {
            let path = std::env::temp_dir().join(format!(
                "ninefs-fake-{}-{}",
                std::process::id(),
                TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            let file = StdFile::options()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            std::fs::remove_file(&path)?;
            file.set_len(node.data.len() as u64)?;
            node.backing = Some(file);
        }
        let clone = node.backing.as_ref().expect("just created").try_clone()?;
        Ok(OwnedFd::from(clone))
    }
}

pub(crate) struct FakeFile {
    server: Arc<FakeServer>,
    ino: u64,
    closed: AtomicBool,
}

impl FakeFile {
    fn with_node<R>(&self, f: impl FnOnce(&mut Node) -> Result<R>) -> Result<R> {
        let mut nodes = self.server.nodes.lock().expect("fake server lock");
        let node = nodes.get_mut(&self.ino).ok_or(Error::Remote(libc::EIO))?;
        f(node)
    }
}

impl File for FakeFile {
    fn walk(&self, names: &[&str]) -> Result<(Vec<Qid>, Arc<dyn File>)> {
        self.server.counters.walks.fetch_add(1, Ordering::Relaxed);
        let mut nodes = self.server.nodes.lock().expect("fake server lock");
        let mut ino = self.ino;
        let mut qids = Vec::new();
        for name in names {
            let node = nodes.get_mut(&ino).ok_or(Error::Remote(libc::EIO))?;
            let Some(&child) = node.children.get(*name) else {
                return Err(Error::Remote(libc::ENOENT));
            };
            ino = child;
            qids.push(nodes[&ino].qid(ino));
        }
        drop(nodes);
        Ok((qids, self.server.fid_for(ino)))
    }

    fn get_attr(&self, _mask: AttrMask) -> Result<(Qid, AttrMask, Attr)> {
        self.server.counters.getattrs.fetch_add(1, Ordering::Relaxed);
        let ino = self.ino;
        self.with_node(|node| {
            Ok((
                node.qid(ino),
                AttrMask::MODE
                    | AttrMask::UID
                    | AttrMask::GID
                    | AttrMask::NLINK
                    | AttrMask::SIZE
                    | AttrMask::ATIME
                    | AttrMask::MTIME
                    | AttrMask::CTIME
                    | AttrMask::BTIME,
                node.attr(),
            ))
        })
    }

    fn set_attr(&self, valid: SetAttrMask, attr: &SetAttr) -> Result<()> {
        self.server.counters.setattrs.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            if valid.contains(SetAttrMask::MODE) {
                node.mode = (node.mode & MODE_TYPE_MASK) | (attr.mode & !MODE_TYPE_MASK);
            }
            if valid.contains(SetAttrMask::UID) {
                node.uid = attr.uid;
            }
            if valid.contains(SetAttrMask::GID) {
                node.gid = attr.gid;
            }
            if valid.contains(SetAttrMask::SIZE) {
                node.data.resize(attr.size as usize, 0);
                if let Some(backing) = &node.backing {
                    let _ = backing.set_len(attr.size);
                }
            }
            Ok(())
        })
    }

    fn open(&self, _flags: OpenFlags) -> Result<(Qid, u32, Option<OwnedFd>)> {
        self.server.counters.opens.fetch_add(1, Ordering::Relaxed);
        let donate = self.server.donate_fds.load(Ordering::Relaxed);
        let ino = self.ino;
        let (qid, regular) = self.with_node(|node| {
            Ok((node.qid(ino), node.mode & MODE_TYPE_MASK == MODE_REGULAR))
        })?;
        let fd = if donate && regular {
            Some(self.server.donated_fd(self.ino).map_err(Error::Io)?)
        } else {
            None
        };
        Ok((qid, 0, fd))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.server.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            let start = (offset as usize).min(node.data.len());
            let end = start.saturating_add(buf.len()).min(node.data.len());
            buf[..end - start].copy_from_slice(&node.data[start..end]);
            Ok(end - start)
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.server.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            let end = offset as usize + buf.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        })
    }

    fn readdir(&self, offset: u64, _count: u32) -> Result<Vec<Dirent>> {
        self.server.counters.readdirs.fetch_add(1, Ordering::Relaxed);
        let nodes = self.server.nodes.lock().expect("fake server lock");
        let node = nodes.get(&self.ino).ok_or(Error::Remote(libc::EIO))?;
        Ok(node
            .children
            .iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(i, (name, &child_ino))| {
                let child = &nodes[&child_ino];
                Dirent {
                    qid: child.qid(child_ino),
                    offset: i as u64 + 1,
                    type_: (child.mode >> 12) as u8,
                    name: name.clone(),
                }
            })
            .collect())
    }

    fn read_link(&self) -> Result<String> {
        self.server.counters.readlinks.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| Ok(node.target.clone()))
    }

    fn unlink_at(&self, name: &str, _flags: u32) -> Result<()> {
        self.server.counters.unlinks.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            node.children
                .remove(name)
                .map(|_| ())
                .ok_or(Error::Remote(libc::ENOENT))
        })
    }

    fn rename_at(&self, old_name: &str, new_dir: &Arc<dyn File>, new_name: &str) -> Result<()> {
        self.server.counters.renames.fetch_add(1, Ordering::Relaxed);
        let new_dir = new_dir
            .as_any()
            .downcast_ref::<FakeFile>()
            .ok_or_else(|| Error::Protocol("foreign destination directory".into()))?;
        let mut nodes = self.server.nodes.lock().expect("fake server lock");
        let src = nodes.get_mut(&self.ino).ok_or(Error::Remote(libc::EIO))?;
        let moved = src
            .children
            .remove(old_name)
            .ok_or(Error::Remote(libc::ENOENT))?;
        let dst = nodes.get_mut(&new_dir.ino).ok_or(Error::Remote(libc::EIO))?;
        dst.children.insert(new_name.to_owned(), moved);
        Ok(())
    }

    fn fsync(&self) -> Result<()> {
        Ok(())
    }

    fn list_xattr(&self, _size: u64) -> Result<Vec<String>> {
        self.server.counters.xattr_ops.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| Ok(node.xattrs.keys().cloned().collect()))
    }

    fn get_xattr(&self, name: &str, _size: u64) -> Result<Vec<u8>> {
        self.server.counters.xattr_ops.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            node.xattrs
                .get(name)
                .cloned()
                .ok_or(Error::Remote(libc::ENODATA))
        })
    }

    fn set_xattr(&self, name: &str, value: &[u8], _flags: u32) -> Result<()> {
        self.server.counters.xattr_ops.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            node.xattrs.insert(name.to_owned(), value.to_vec());
            Ok(())
        })
    }

    fn remove_xattr(&self, name: &str) -> Result<()> {
        self.server.counters.xattr_ops.fetch_add(1, Ordering::Relaxed);
        self.with_node(|node| {
            node.xattrs.remove(name);
            Ok(())
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.server
            .clunks
            .lock()
            .expect("fake server lock")
            .push(self.ino);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for FakeFile {
    fn drop(&mut self) {
        self.close();
    }
}
