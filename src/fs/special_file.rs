//! Special-file descriptions.
//!
//! Sockets, pipes, devices — and, under `cache=none`, regular files — get a
//! private handle per open instead of the dentry's shared one. There is no
//! page cache and no shared mmap; every byte goes straight through the
//! handle. Open descriptions are registered with the filesystem so a global
//! sync can fsync them.

use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{FsError, Result};
use crate::fs::handle::Handle;
use crate::fs::{FileDescription, OpenOptions};

pub struct SpecialFileFd {
    id: u64,
    fd: FileDescription,
    /// This description's own handle; never shared, never upgraded.
    handle: Handle,
    opts: OpenOptions,
    /// Description offset; the per-open mutex at the top of the lock order.
    pos: Mutex<u64>,
}

impl SpecialFileFd {
    pub(crate) fn new(fd: FileDescription, handle: Handle, opts: OpenOptions) -> Arc<Self> {
        let id = fd.dentry().filesystem().next_fd_id();
        Arc::new(Self {
            id,
            fd,
            handle,
            opts,
            pos: Mutex::new(0),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &FileDescription {
        &self.fd
    }

    pub fn pread(&self, ctx: &dyn Context, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.opts.read {
            return Err(FsError::Invalid);
        }
        self.handle.read_at(ctx, buf, offset)
    }

    pub fn pwrite(&self, ctx: &dyn Context, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.opts.write {
            return Err(FsError::Invalid);
        }
        self.handle.write_at(ctx, buf, offset)
    }

    pub fn read(&self, ctx: &dyn Context, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock().expect("fd lock poisoned");
        let n = self.pread(ctx, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    pub fn write(&self, ctx: &dyn Context, buf: &[u8]) -> Result<usize> {
        let mut pos = self.pos.lock().expect("fd lock poisoned");
        let offset = if self.opts.append {
            self.fd.dentry().size()
        } else {
            *pos
        };
        let n = self.pwrite(ctx, buf, offset)?;
        *pos = offset + n as u64;
        Ok(n)
    }

    pub fn fsync(&self, ctx: &dyn Context) -> Result<()> {
        self.handle.fsync(ctx)
    }
}

impl Drop for SpecialFileFd {
    fn drop(&mut self) {
        let fs = Arc::clone(self.fd.dentry().filesystem());
        fs.unregister_special_fd(self.id);
        self.handle.close(fs.background_ctx());
    }
}
