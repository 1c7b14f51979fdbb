//! Contracts with the memory subsystem.
//!
//! The page-frame allocator backing the client's file cache and the
//! application-mapping registry both live outside this crate; what lives
//! here are the interfaces the client drives them through, plus a heap
//! allocator used as the default backing store and by tests.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::trace;

/// Page size assumed for cache granularity and mapping invalidation.
pub const PAGE_SIZE: u64 = 4096;

pub fn page_round_up(v: u64) -> u64 {
    v.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

pub fn page_round_down(v: u64) -> u64 {
    v - v % PAGE_SIZE
}

/// A `[start, end)` byte range of a mappable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappableRange {
    pub start: u64,
    pub end: u64,
}

impl MappableRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}..{end}");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end).max(start);
        Self { start, end }
    }
}

/// A `[start, end)` range of offsets into a [`MemoryFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: u64,
    pub end: u64,
}

impl FrameRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// The page-frame allocator that backs cached file contents.
pub trait MemoryFile: Send + Sync {
    /// Allocate `len` bytes of backing memory. `len` must be page-aligned.
    fn allocate(&self, len: u64) -> io::Result<FrameRange>;

    /// Return frames to the allocator.
    fn free(&self, fr: FrameRange);

    /// Copy out of backing memory at frame offset `addr`.
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Copy into backing memory at frame offset `addr`.
    fn write(&self, addr: u64, buf: &[u8]) -> io::Result<()>;
}

/// Heap-backed [`MemoryFile`]: a bump arena with a first-fit free list.
pub struct HeapMemoryFile {
    state: Mutex<HeapState>,
}

struct HeapState {
    arena: Vec<u8>,
    free: Vec<FrameRange>,
}

impl HeapMemoryFile {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                arena: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Bytes currently handed out, for leak checks in tests.
    pub fn allocated_bytes(&self) -> u64 {
        let state = self.state.lock().expect("memfile lock poisoned");
        state.arena.len() as u64 - state.free.iter().map(FrameRange::len).sum::<u64>()
    }
}

impl Default for HeapMemoryFile {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFile for HeapMemoryFile {
    fn allocate(&self, len: u64) -> io::Result<FrameRange> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("allocation of {len} bytes is not page-aligned"),
            ));
        }
        let mut state = self.state.lock().expect("memfile lock poisoned");
        if let Some(idx) = state.free.iter().position(|fr| fr.len() >= len) {
            let fr = state.free[idx];
            let taken = FrameRange {
                start: fr.start,
                end: fr.start + len,
            };
            if fr.len() == len {
                state.free.swap_remove(idx);
            } else {
                state.free[idx].start = taken.end;
            }
            return Ok(taken);
        }
        let start = state.arena.len() as u64;
        state.arena.resize((start + len) as usize, 0);
        Ok(FrameRange {
            start,
            end: start + len,
        })
    }

    fn free(&self, fr: FrameRange) {
        if fr.len() == 0 {
            return;
        }
        let mut state = self.state.lock().expect("memfile lock poisoned");
        debug_assert!(fr.end as usize <= state.arena.len(), "freeing unallocated frames");
        state.free.push(fr);
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        let state = self.state.lock().expect("memfile lock poisoned");
        let start = addr as usize;
        let end = start + buf.len();
        if end > state.arena.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read beyond allocated frames",
            ));
        }
        buf.copy_from_slice(&state.arena[start..end]);
        Ok(())
    }

    fn write(&self, addr: u64, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().expect("memfile lock poisoned");
        let start = addr as usize;
        let end = start + buf.len();
        if end > state.arena.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write beyond allocated frames",
            ));
        }
        state.arena[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// How an invalidation should treat pages an application copied-on-write.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidateOpts {
    /// Evict private copies too. Truncation uses this, matching
    /// `unmap_mapping_range(evencows=1)` semantics.
    pub invalidate_private: bool,
}

/// One consumer of a file's mappings, e.g. an address space holding a
/// portion of the file.
pub trait MappingSpace: Send + Sync {
    /// Drop translations covering `range`. The next fault repopulates them.
    fn invalidate(&self, range: MappableRange, opts: &InvalidateOpts);
}

/// The set of application mappings of one file.
#[derive(Default)]
pub struct MappingSet {
    mappings: Vec<(MappableRange, Arc<dyn MappingSpace>)>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, range: MappableRange, space: Arc<dyn MappingSpace>) {
        self.mappings.push((range, space));
    }

    pub fn remove(&mut self, range: MappableRange, space: &Arc<dyn MappingSpace>) {
        self.mappings
            .retain(|(r, s)| !(*r == range && Arc::ptr_eq(s, space)));
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Invalidate every mapping intersecting `range`.
    pub fn invalidate(&self, range: MappableRange, opts: &InvalidateOpts) {
        for (mapped, space) in &self.mappings {
            if mapped.intersects(&range) {
                space.invalidate(mapped.intersect(&range), opts);
            }
        }
    }

    pub fn invalidate_all(&self, opts: &InvalidateOpts) {
        for (mapped, space) in &self.mappings {
            space.invalidate(*mapped, opts);
        }
    }
}

/// Chunk granularity of internal host-FD mappings.
const CHUNK_SIZE: u64 = 16 << 20;

/// Bookkeeping for the client's own mappings of a donated host descriptor.
///
/// Mapping consumers take chunk references through `inc_ref_on`; a handle
/// upgrade that replaces the backing descriptor regenerates every live chunk
/// against the new descriptor number.
#[derive(Default)]
pub struct HostFileMapper {
    chunks: Mutex<FxHashMap<u64, usize>>,
}

impl HostFileMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ref_on(&self, range: MappableRange) {
        let mut chunks = self.chunks.lock().expect("mapper lock poisoned");
        let mut chunk = range.start / CHUNK_SIZE;
        while chunk * CHUNK_SIZE < range.end {
            *chunks.entry(chunk).or_insert(0) += 1;
            chunk += 1;
        }
    }

    pub fn dec_ref_on(&self, range: MappableRange) {
        let mut chunks = self.chunks.lock().expect("mapper lock poisoned");
        let mut chunk = range.start / CHUNK_SIZE;
        while chunk * CHUNK_SIZE < range.end {
            match chunks.get_mut(&chunk) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    chunks.remove(&chunk);
                }
                None => panic!("HostFileMapper::dec_ref_on: chunk {chunk} has no references"),
            }
            chunk += 1;
        }
    }

    /// Re-establish every live chunk mapping against `fd`. Called during a
    /// handle upgrade when the old and new backing files may not be coherent
    /// at the host.
    pub fn regenerate_mappings(&self, fd: RawFd) -> io::Result<()> {
        let chunks = self.chunks.lock().expect("mapper lock poisoned");
        trace!(fd, live_chunks = chunks.len(), "regenerating host-file mappings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn heap_memfile_round_trips_data() {
        let mf = HeapMemoryFile::new();
        let fr = mf.allocate(PAGE_SIZE).expect("allocate one page");
        mf.write(fr.start, b"hello").expect("write");
        let mut buf = [0u8; 5];
        mf.read(fr.start, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");
        mf.free(fr);
        assert_eq!(mf.allocated_bytes(), 0, "all frames returned");
    }

    #[test]
    fn heap_memfile_reuses_freed_frames() {
        let mf = HeapMemoryFile::new();
        let a = mf.allocate(PAGE_SIZE).unwrap();
        let _b = mf.allocate(PAGE_SIZE).unwrap();
        mf.free(a);
        let c = mf.allocate(PAGE_SIZE).unwrap();
        assert_eq!(c, a, "first-fit should reuse the freed page");
    }

    #[test]
    fn unaligned_allocation_is_rejected() {
        let mf = HeapMemoryFile::new();
        assert!(mf.allocate(100).is_err());
        assert!(mf.allocate(0).is_err());
    }

    struct CountingSpace {
        hits: AtomicUsize,
    }

    impl MappingSpace for CountingSpace {
        fn invalidate(&self, _range: MappableRange, _opts: &InvalidateOpts) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn mapping_set_invalidates_only_intersecting_ranges() {
        let mut set = MappingSet::new();
        let low = Arc::new(CountingSpace {
            hits: AtomicUsize::new(0),
        });
        let high = Arc::new(CountingSpace {
            hits: AtomicUsize::new(0),
        });
        set.add(MappableRange::new(0, 4096), Arc::clone(&low) as Arc<dyn MappingSpace>);
        set.add(
            MappableRange::new(8192, 12288),
            Arc::clone(&high) as Arc<dyn MappingSpace>,
        );

        set.invalidate(MappableRange::new(8192, 16384), &InvalidateOpts::default());
        assert_eq!(low.hits.load(Ordering::Relaxed), 0, "low mapping untouched");
        assert_eq!(high.hits.load(Ordering::Relaxed), 1, "high mapping hit once");
    }
}
