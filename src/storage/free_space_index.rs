//! In-memory free-space index: buckets pages by their free-space size so
//! `Insert` can pick a candidate page without scanning the whole heap.

use parking_lot::Mutex;

use super::page::PageNo;
use super::page_cache::PageCache;

pub const INTERVALS_NO: usize = 40;
pub const THRESHOLD: usize = super::page::PAGE_SIZE / INTERVALS_NO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub pgno: PageNo,
    pub free_space: usize,
}

pub struct FreeSpaceIndex {
    buckets: Mutex<Vec<Vec<PageInfo>>>,
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        FreeSpaceIndex {
            buckets: Mutex::new(vec![Vec::new(); INTERVALS_NO + 1]),
        }
    }

    pub fn add(&self, pgno: PageNo, free_space: usize) {
        let bucket = (free_space / THRESHOLD).min(INTERVALS_NO);
        self.buckets.lock()[bucket].push(PageInfo { pgno, free_space });
    }

    /// Find a page whose free space covers `required_bytes`, removing it
    /// from the index. The bucket index is bumped by one (when below the
    /// top bucket) before scanning so the chosen bucket's minimum free
    /// space always covers the request, including when `required_bytes` is
    /// an exact multiple of `THRESHOLD`.
    pub fn select(&self, required_bytes: usize) -> Option<PageInfo> {
        let mut number = required_bytes / THRESHOLD;
        if number < INTERVALS_NO {
            number += 1;
        }
        let mut buckets = self.buckets.lock();
        while number <= INTERVALS_NO {
            if let Some(page) = buckets[number].first().copied() {
                buckets[number].remove(0);
                return Some(page);
            }
            number += 1;
        }
        None
    }

    /// Populate the index from every heap page except the sentinel page,
    /// used when opening an existing store.
    pub fn fill(&self, pc: &PageCache) -> crate::error::Result<()> {
        for pgno in 2..=pc.page_count() {
            let pin = pc.get_page(pgno)?;
            self.add(pgno, pin.free_space());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_none_when_empty() {
        let fsi = FreeSpaceIndex::new();
        assert!(fsi.select(100).is_none());
    }

    #[test]
    fn select_removes_the_entry_it_returns() {
        let fsi = FreeSpaceIndex::new();
        fsi.add(3, PAGE_SIZE_FOR_TEST);
        let got = fsi.select(10).unwrap();
        assert_eq!(got.pgno, 3);
        assert!(fsi.select(10).is_none());
    }

    #[test]
    fn select_always_bumps_past_the_floor_bucket() {
        let fsi = FreeSpaceIndex::new();
        // A page whose free space is exactly 2*THRESHOLD sits in bucket 2.
        // select() for a request of exactly 2*THRESHOLD bytes always scans
        // from bucket 3 onward, so this exact-fit page is not returned...
        fsi.add(7, 2 * THRESHOLD);
        assert!(fsi.select(2 * THRESHOLD).is_none());
        // ...but a page in the next bucket up is found, and every returned
        // page's free space covers the request.
        fsi.add(8, 3 * THRESHOLD);
        let got = fsi.select(2 * THRESHOLD).unwrap();
        assert_eq!(got.pgno, 8);
        assert!(got.free_space >= 2 * THRESHOLD);
    }

    #[test]
    fn select_skips_buckets_that_are_too_small() {
        let fsi = FreeSpaceIndex::new();
        fsi.add(1, THRESHOLD / 2);
        assert!(fsi.select(THRESHOLD).is_none());
    }

    const PAGE_SIZE_FOR_TEST: usize = super::THRESHOLD * 3;
}
