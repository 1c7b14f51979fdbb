//! Sparse file-range containers: the page cache's offset map and the dirty
//! set that drives writeback.
//!
//! Both containers hold mutually disjoint `[start, end)` byte ranges in
//! ordered maps. The cache maps ranges to backing frames from the external
//! allocator; the dirty set only records membership.

use std::collections::BTreeMap;

use crate::error::{FsError, Result};
use crate::mem::{FrameRange, MappableRange, MemoryFile, page_round_up};

/// One cached extent: contiguous file bytes backed by contiguous frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSegment {
    pub range: MappableRange,
    pub frames: FrameRange,
}

impl CacheSegment {
    /// Frame address backing the file offset `offset`.
    pub fn frame_at(&self, offset: u64) -> u64 {
        debug_assert!(offset >= self.range.start && offset < self.range.end);
        self.frames.start + (offset - self.range.start)
    }
}

/// Result of a cache lookup: either the covering segment or the gap before
/// the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegOrGap {
    Segment(CacheSegment),
    Gap(MappableRange),
}

/// Sparse map from file offsets to allocator frames.
#[derive(Default)]
pub struct FileRangeCache {
    segs: BTreeMap<u64, CacheSegment>,
}

impl FileRangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// The segment covering `offset`, or the gap `[offset, next segment)`.
    pub fn lookup(&self, offset: u64) -> SegOrGap {
        if let Some((_, seg)) = self.segs.range(..=offset).next_back()
            && seg.range.end > offset
        {
            return SegOrGap::Segment(*seg);
        }
        let gap_end = self
            .segs
            .range(offset + 1..)
            .next()
            .map_or(u64::MAX, |(&start, _)| start);
        SegOrGap::Gap(MappableRange::new(offset, gap_end))
    }

    /// Allocate backing frames for `range` and insert it. `range` must be
    /// page-aligned and must lie in a gap.
    pub fn insert(&mut self, range: MappableRange, mf: &dyn MemoryFile) -> Result<CacheSegment> {
        debug_assert!(
            matches!(self.lookup(range.start), SegOrGap::Gap(gap) if gap.end >= range.end),
            "cache insert into occupied range {range:?}"
        );
        let frames = mf.allocate(range.len())?;
        let seg = CacheSegment { range, frames };
        self.segs.insert(range.start, seg);
        Ok(seg)
    }

    /// Drop every cached range, returning all frames to the allocator.
    pub fn drop_all(&mut self, mf: &dyn MemoryFile) {
        for (_, seg) in std::mem::take(&mut self.segs) {
            mf.free(seg.frames);
        }
    }

    /// Drop cached ranges at and beyond `size` (rounded up to a page
    /// boundary), returning the freed frames to the allocator.
    pub fn truncate(&mut self, size: u64, mf: &dyn MemoryFile) {
        let pgend = page_round_up(size);
        // Whole segments past the boundary.
        let doomed: Vec<u64> = self.segs.range(pgend..).map(|(&s, _)| s).collect();
        for start in doomed {
            let seg = self.segs.remove(&start).expect("key just observed");
            mf.free(seg.frames);
        }
        // A segment straddling the boundary keeps its head.
        if let Some((&start, seg)) = self.segs.range_mut(..pgend).next_back()
            && seg.range.end > pgend
        {
            let keep = pgend - start;
            let freed = FrameRange {
                start: seg.frames.start + keep,
                end: seg.frames.end,
            };
            seg.range.end = pgend;
            seg.frames.end = seg.frames.start + keep;
            mf.free(freed);
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &CacheSegment> {
        self.segs.values()
    }

    /// Highest cached offset, for assertions.
    pub fn max_extent(&self) -> u64 {
        self.segs.values().next_back().map_or(0, |seg| seg.range.end)
    }
}

/// Disjoint set of ranges carrying writes the server has not seen.
#[derive(Default)]
pub struct DirtySet {
    segs: BTreeMap<u64, u64>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn mark_dirty(&mut self, range: MappableRange) {
        if range.is_empty() {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;
        // Absorb a predecessor that touches or overlaps.
        if let Some((&s, &e)) = self.segs.range(..=start).next_back()
            && e >= start
        {
            start = s;
            end = end.max(e);
            self.segs.remove(&s);
        }
        // Absorb everything starting inside (or adjacent to) the new range.
        let absorbed: Vec<u64> = self.segs.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            let e = self.segs.remove(&s).expect("key just observed");
            end = end.max(e);
        }
        self.segs.insert(start, end);
    }

    /// Remove `range` from the dirty set, splitting segments that straddle
    /// its edges.
    pub fn keep_clean(&mut self, range: MappableRange) {
        if range.is_empty() {
            return;
        }
        if let Some((&s, &e)) = self.segs.range(..range.start).next_back()
            && e > range.start
        {
            *self.segs.get_mut(&s).expect("key just observed") = range.start;
            if e > range.end {
                self.segs.insert(range.end, e);
            }
        }
        let inside: Vec<u64> = self.segs.range(range.start..range.end).map(|(&s, _)| s).collect();
        for s in inside {
            let e = self.segs.remove(&s).expect("key just observed");
            if e > range.end {
                self.segs.insert(range.end, e);
            }
        }
    }

    pub fn remove_all(&mut self) {
        self.segs.clear();
    }

    pub fn is_dirty(&self, offset: u64) -> bool {
        matches!(self.segs.range(..=offset).next_back(), Some((_, &e)) if e > offset)
    }

    /// Dirty ranges clipped to `[0, limit)`.
    pub fn ranges_below(&self, limit: u64) -> Vec<MappableRange> {
        self.segs
            .iter()
            .filter(|&(&s, _)| s < limit)
            .map(|(&s, &e)| MappableRange::new(s, e.min(limit)))
            .collect()
    }
}

/// Write every dirty range within `[0, size)` back to the server.
///
/// Cached bytes are fetched from `cache` and handed to `writer` as
/// `(offset, bytes)`; ranges are marked clean only once fully transmitted,
/// so a partial failure leaves the untransmitted remainder dirty.
pub fn sync_dirty_all(
    cache: &FileRangeCache,
    dirty: &mut DirtySet,
    size: u64,
    mf: &dyn MemoryFile,
    writer: &mut dyn FnMut(u64, &[u8]) -> Result<usize>,
) -> Result<()> {
    for dr in dirty.ranges_below(size) {
        let mut off = dr.start;
        while off < dr.end {
            match cache.lookup(off) {
                SegOrGap::Segment(seg) => {
                    let chunk_end = seg.range.end.min(dr.end);
                    let mut buf = vec![0u8; (chunk_end - off) as usize];
                    mf.read(seg.frame_at(off), &mut buf)?;
                    let mut sent = 0usize;
                    while sent < buf.len() {
                        match writer(off + sent as u64, &buf[sent..]) {
                            Ok(0) => {
                                dirty.keep_clean(MappableRange::new(dr.start, off + sent as u64));
                                return Err(FsError::Io(std::io::Error::new(
                                    std::io::ErrorKind::WriteZero,
                                    "writeback made no progress",
                                )));
                            }
                            Ok(n) => sent += n,
                            Err(err) => {
                                dirty.keep_clean(MappableRange::new(dr.start, off + sent as u64));
                                return Err(err);
                            }
                        }
                    }
                    off = chunk_end;
                }
                // Dirty bytes with no backing pages have nothing left to
                // transmit (the cache was truncated under them).
                SegOrGap::Gap(gap) => off = gap.end.min(dr.end),
            }
        }
        dirty.keep_clean(dr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapMemoryFile;

    fn mr(start: u64, end: u64) -> MappableRange {
        MappableRange::new(start, end)
    }

    #[test]
    fn lookup_distinguishes_segments_from_gaps() {
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        cache.insert(mr(4096, 8192), &mf).expect("insert");

        match cache.lookup(5000) {
            SegOrGap::Segment(seg) => assert_eq!(seg.range, mr(4096, 8192)),
            other => panic!("expected a segment, got {other:?}"),
        }
        match cache.lookup(0) {
            SegOrGap::Gap(gap) => assert_eq!(gap, mr(0, 4096)),
            other => panic!("expected the leading gap, got {other:?}"),
        }
        match cache.lookup(8192) {
            SegOrGap::Gap(gap) => assert_eq!(gap.start, 8192),
            other => panic!("expected the trailing gap, got {other:?}"),
        }
    }

    #[test]
    fn cached_bytes_round_trip_through_frames() {
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        let seg = cache.insert(mr(0, 4096), &mf).expect("insert");
        mf.write(seg.frame_at(100), b"cached").expect("frame write");

        let SegOrGap::Segment(seg) = cache.lookup(100) else {
            panic!("offset 100 should be cached");
        };
        let mut buf = [0u8; 6];
        mf.read(seg.frame_at(100), &mut buf).expect("frame read");
        assert_eq!(&buf, b"cached");
    }

    #[test]
    fn truncate_frees_tail_segments_and_splits_straddlers() {
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        cache.insert(mr(0, 8192), &mf).expect("insert head");
        cache.insert(mr(12288, 16384), &mf).expect("insert tail");

        cache.truncate(3000, &mf);
        assert_eq!(cache.max_extent(), 4096, "head keeps its first page");
        assert_eq!(cache.segments().count(), 1, "tail segment dropped");
        // 4096 bytes kept out of 12288 allocated.
        assert_eq!(mf.allocated_bytes(), 4096);
    }

    #[test]
    fn drop_all_returns_every_frame() {
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        cache.insert(mr(0, 4096), &mf).expect("insert");
        cache.insert(mr(8192, 12288), &mf).expect("insert");
        cache.drop_all(&mf);
        assert!(cache.is_empty());
        assert_eq!(mf.allocated_bytes(), 0);
    }

    #[test]
    fn mark_dirty_coalesces_touching_ranges() {
        let mut dirty = DirtySet::new();
        dirty.mark_dirty(mr(0, 100));
        dirty.mark_dirty(mr(200, 300));
        dirty.mark_dirty(mr(100, 200));
        assert_eq!(dirty.ranges_below(u64::MAX), vec![mr(0, 300)]);
    }

    #[test]
    fn keep_clean_splits_straddling_ranges() {
        let mut dirty = DirtySet::new();
        dirty.mark_dirty(mr(0, 1000));
        dirty.keep_clean(mr(200, 800));
        assert_eq!(dirty.ranges_below(u64::MAX), vec![mr(0, 200), mr(800, 1000)]);
        assert!(dirty.is_dirty(100));
        assert!(!dirty.is_dirty(500));
    }

    #[test]
    fn sync_writes_only_dirty_bytes() {
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        let seg = cache.insert(mr(0, 8192), &mf).expect("insert");
        mf.write(seg.frames.start, &vec![7u8; 8192]).expect("fill");

        let mut dirty = DirtySet::new();
        dirty.mark_dirty(mr(1000, 2000));

        let mut written = Vec::new();
        sync_dirty_all(&cache, &mut dirty, 8192, &mf, &mut |off, buf| {
            written.push((off, buf.len()));
            Ok(buf.len())
        })
        .expect("sync");
        assert_eq!(written, vec![(1000, 1000)]);
        assert!(dirty.is_empty(), "transmitted range becomes clean");
    }

    #[test]
    fn unmodified_pages_transmit_nothing() {
        // Reading populates the cache but never the dirty set; writeback of
        // an all-clean file must not touch the server.
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        cache.insert(mr(0, 4096), &mf).expect("insert");
        let mut dirty = DirtySet::new();

        let mut calls = 0;
        sync_dirty_all(&cache, &mut dirty, 4096, &mf, &mut |_, buf| {
            calls += 1;
            Ok(buf.len())
        })
        .expect("sync");
        assert_eq!(calls, 0, "clean pages must not be transmitted");
    }

    #[test]
    fn partial_failure_leaves_untransmitted_ranges_dirty() {
        let mf = HeapMemoryFile::new();
        let mut cache = FileRangeCache::new();
        let seg = cache.insert(mr(0, 8192), &mf).expect("insert");
        mf.write(seg.frames.start, &vec![1u8; 8192]).expect("fill");

        let mut dirty = DirtySet::new();
        dirty.mark_dirty(mr(0, 1000));
        dirty.mark_dirty(mr(4096, 5000));

        let mut first = true;
        let result = sync_dirty_all(&cache, &mut dirty, 8192, &mf, &mut |_, buf| {
            if first {
                first = false;
                Ok(buf.len())
            } else {
                Err(FsError::Remote(p9::Error::Remote(libc::EIO)))
            }
        });
        assert!(result.is_err(), "second write fails");
        assert!(!dirty.is_dirty(500), "first range was transmitted");
        assert!(dirty.is_dirty(4500), "failed range stays dirty");
    }

    #[test]
    fn sync_ignores_dirty_ranges_past_the_size() {
        let mf = HeapMemoryFile::new();
        let cache = FileRangeCache::new();
        let mut dirty = DirtySet::new();
        dirty.mark_dirty(mr(10000, 20000));

        let mut calls = 0;
        sync_dirty_all(&cache, &mut dirty, 4096, &mf, &mut |_, buf| {
            calls += 1;
            Ok(buf.len())
        })
        .expect("sync");
        assert_eq!(calls, 0, "ranges beyond size are not transmitted");
    }
}
