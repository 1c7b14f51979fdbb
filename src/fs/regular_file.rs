//! Regular-file descriptions: the cached read/write paths.
//!
//! All descriptions of one regular file share the dentry's handle and page
//! cache. Reads fill the cache from the server a page at a time; writes
//! either land in the cache and are marked dirty (deferred flush) or go to
//! the server synchronously with the cache kept clean, per the coherence
//! policy. Under Shared mode the cache is bypassed entirely.
//!
//! I/O holds the handle lock's read half for its whole duration — the lock
//! order puts `handle_mu` above `data_mu`, and holding it keeps the shared
//! handle from being upgraded mid-operation.

use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{FsError, Result};
use crate::fs::handle::Handle;
use crate::fs::range_set::{CacheSegment, SegOrGap};
use crate::fs::{FileDescription, OpenOptions};
use crate::mem::{MappableRange, MemoryFile, page_round_down, page_round_up};

/// Seek origins, mirroring lseek(2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

pub struct RegularFileFd {
    fd: FileDescription,
    opts: OpenOptions,
    /// Description offset; the per-open mutex at the top of the lock order.
    pos: Mutex<u64>,
}

impl RegularFileFd {
    pub(crate) fn new(fd: FileDescription, opts: OpenOptions) -> Arc<Self> {
        Arc::new(Self {
            fd,
            opts,
            pos: Mutex::new(0),
        })
    }

    pub fn description(&self) -> &FileDescription {
        &self.fd
    }

    fn use_cache(&self) -> bool {
        self.fd.dentry().filesystem().interop().can_cache_data()
    }

    /// Positional read.
    pub fn pread(&self, ctx: &dyn Context, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.opts.read {
            return Err(FsError::Invalid);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let d = self.fd.dentry();
        let h = d.handle_state().read().expect("handle lock poisoned");
        if !self.use_cache() {
            return h.handle.read_at(ctx, buf, offset);
        }

        let size = d.size();
        if offset >= size {
            return Ok(0);
        }
        let end = size.min(offset + buf.len() as u64);
        let mf = d.filesystem().memfile();
        let mut off = offset;
        while off < end {
            // A concurrent truncate may have shrunk the file under us; the
            // cache beyond the new size can no longer be populated.
            if off >= d.size() {
                break;
            }
            let data = d.data_state().read().expect("data lock poisoned");
            match data.cache.lookup(off) {
                SegOrGap::Segment(seg) => {
                    // Copy with the data lock held so the frames cannot be
                    // freed under us.
                    let n = (seg.range.end.min(end) - off) as usize;
                    let dst = &mut buf[(off - offset) as usize..][..n];
                    mf.read(seg.frame_at(off), dst)?;
                    drop(data);
                    off += n as u64;
                }
                SegOrGap::Gap(gap) => {
                    let gap_end = gap.end.min(end);
                    drop(data);
                    self.populate_cache(ctx, &h.handle, off, gap_end)?;
                }
            }
        }
        Ok((off - offset) as usize)
    }

    /// Fill the cache with whole pages covering `[off, want_end)`, reading
    /// from the server through `handle`. Bytes past EOF stay zero.
    ///
    /// Preconditions: the handle lock's read half is held.
    fn populate_cache(
        &self,
        ctx: &dyn Context,
        handle: &Handle,
        off: u64,
        want_end: u64,
    ) -> Result<()> {
        let d = self.fd.dentry();
        let mf = d.filesystem().memfile();
        let mut data = d.data_state().write().expect("data lock poisoned");

        // Re-check under the write half: a racing read may have filled the
        // gap, and a racing truncate may have shrunk the file.
        let size = d.size();
        let gap = match data.cache.lookup(off) {
            SegOrGap::Segment(_) => return Ok(()),
            SegOrGap::Gap(gap) => gap,
        };
        let load_start = page_round_down(off);
        let load_end = page_round_up(want_end.min(gap.end)).min(page_round_up(size));
        if load_start >= load_end {
            return Ok(());
        }

        let mut pages = vec![0u8; (load_end - load_start) as usize];
        handle.read_full_at(ctx, &mut pages, load_start)?;
        let seg = data
            .cache
            .insert(MappableRange::new(load_start, load_end), mf)?;
        mf.write(seg.frames.start, &pages)?;
        Ok(())
    }

    /// Positional write. Returns the number of bytes written.
    pub fn pwrite(&self, ctx: &dyn Context, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.opts.write {
            return Err(FsError::Invalid);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let d = self.fd.dentry();
        if !self.use_cache() {
            let h = d.handle_state().read().expect("handle lock poisoned");
            return h.handle.write_at(ctx, buf, offset);
        }

        let interop = d.filesystem().interop();
        let mf = d.filesystem().memfile();
        let end = offset + buf.len() as u64;

        let _meta = d.metadata_mu().lock().expect("metadata lock poisoned");
        let h = d.handle_state().read().expect("handle lock poisoned");
        if interop.flush_is_synchronous() {
            // Writethrough: server first, then refresh any already-cached
            // pages so readers observe the new bytes; nothing becomes dirty.
            h.handle.write_all_at(ctx, buf, offset)?;
            let data = d.data_state().read().expect("data lock poisoned");
            let mut off = offset;
            while off < end {
                match data.cache.lookup(off) {
                    SegOrGap::Segment(seg) => {
                        let n = (seg.range.end.min(end) - off) as usize;
                        let src = &buf[(off - offset) as usize..][..n];
                        mf.write(seg.frame_at(off), src)?;
                        off += n as u64;
                    }
                    SegOrGap::Gap(gap) => off = gap.end.min(end),
                }
            }
        } else {
            // Exclusive: land the bytes in the cache and mark them dirty;
            // they reach the server on sync, release, or destruction.
            let mut data = d.data_state().write().expect("data lock poisoned");
            let mut off = offset;
            while off < end {
                match data.cache.lookup(off) {
                    SegOrGap::Segment(seg) => {
                        let n = (seg.range.end.min(end) - off) as usize;
                        let src = &buf[(off - offset) as usize..][..n];
                        mf.write(seg.frame_at(off), src)?;
                        off += n as u64;
                    }
                    SegOrGap::Gap(gap) => {
                        let load_start = page_round_down(off);
                        let load_end = page_round_up(end.min(gap.end));
                        let seg = data
                            .cache
                            .insert(MappableRange::new(load_start, load_end), mf)?;
                        // Page edges we are not overwriting must hold the
                        // file's current bytes before the pages go dirty.
                        fill_edges(ctx, d.size(), &h.handle, &seg, offset, end, mf)?;
                        let n = (seg.range.end.min(end) - off) as usize;
                        let src = &buf[(off - offset) as usize..][..n];
                        mf.write(seg.frame_at(off), src)?;
                        off += n as u64;
                    }
                }
            }
            data.dirty.mark_dirty(MappableRange::new(offset, end));
        }

        // Size extension and timestamps, still under the metadata lock.
        {
            let _data = d.data_state().write().expect("data lock poisoned");
            if end > d.size() {
                d.store_size(end);
            }
        }
        d.touch_cmtime_locked(ctx.now_nanos());
        Ok(buf.len())
    }

    /// Sequential read at the description offset.
    pub fn read(&self, ctx: &dyn Context, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock().expect("fd lock poisoned");
        let n = self.pread(ctx, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Sequential write at the description offset (or at EOF for append
    /// descriptions).
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

    /// Reposition the description offset. Regular files are treated as
    /// having no holes.
    pub fn seek(&self, whence: SeekFrom) -> Result<u64> {
        let mut pos = self.pos.lock().expect("fd lock poisoned");
        let (base, delta) = match whence {
            SeekFrom::Start(off) => (i64::try_from(off).map_err(|_| FsError::Invalid)?, 0),
            SeekFrom::Current(delta) => (
                i64::try_from(*pos).map_err(|_| FsError::Invalid)?,
                delta,
            ),
            SeekFrom::End(delta) => (
                i64::try_from(self.fd.dentry().size()).map_err(|_| FsError::Invalid)?,
                delta,
            ),
        };
        let target = base.checked_add(delta).ok_or(FsError::Invalid)?;
        if target < 0 {
            return Err(FsError::Invalid);
        }
        *pos = target as u64;
        Ok(*pos)
    }

    /// Flush this file's dirty pages and commit server-side state.
    pub fn fsync(&self, ctx: &dyn Context) -> Result<()> {
        let d = self.fd.dentry();
        d.flush_dirty(ctx);
        let h = d.handle_state().read().expect("handle lock poisoned");
        h.handle.fsync(ctx)
    }

    pub fn offset(&self) -> u64 {
        *self.pos.lock().expect("fd lock poisoned")
    }
}

/// Populate the non-overwritten edges of a freshly allocated segment with
/// the file's current bytes (zeros past EOF).
fn fill_edges(
    ctx: &dyn Context,
    size: u64,
    handle: &Handle,
    seg: &CacheSegment,
    write_start: u64,
    write_end: u64,
    mf: &dyn MemoryFile,
) -> Result<()> {
    let head_end = write_start.clamp(seg.range.start, seg.range.end);
    let tail_start = write_end.clamp(seg.range.start, seg.range.end);
    for edge in [
        MappableRange::new(seg.range.start, head_end),
        MappableRange::new(tail_start, seg.range.end),
    ] {
        if edge.is_empty() {
            continue;
        }
        let mut bytes = vec![0u8; edge.len() as usize];
        if edge.start < size {
            let want = (size.min(edge.end) - edge.start) as usize;
            handle.read_full_at(ctx, &mut bytes[..want], edge.start)?;
        }
        mf.write(seg.frame_at(edge.start), &bytes)?;
    }
    Ok(())
}
