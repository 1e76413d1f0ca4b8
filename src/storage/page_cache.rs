//! Page cache: a fixed-capacity, reference-counted buffer pool over the
//! heap file. A specialization of [`crate::cache::ResourceCache`].

use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::ResourceCache;
use crate::error::{Error, Result};
use crate::pathutil::with_suffix;

use super::page::{Page, PageNo, PageRef, PAGE_SIZE};

pub const DB_SUFFIX: &str = "db";
pub const MEM_MIN_LIM: u64 = 10;

struct FileCtx {
    file: File,
    lock: Mutex<()>,
}

fn page_offset(pgno: PageNo) -> u64 {
    (pgno - 1) as u64 * PAGE_SIZE as u64
}

struct Inner {
    cache: ResourceCache<PageNo, PageRef>,
    file_ctx: Arc<FileCtx>,
    page_count: Mutex<PageNo>,
}

/// Reference-counted, bounded buffer pool. Cheaply cloneable: clones share
/// the same underlying pool.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<Inner>,
}

impl PageCache {
    fn open_file(path: &Path, create: bool) -> Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if create {
            opts.create_new(true);
        }
        match opts.open(path) {
            Ok(f) => Ok(f),
            Err(e) if create && e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::FileExists)
            }
            Err(e) if !create && e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::FileNotExists)
            }
            Err(e) if !create && e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(Error::FileUnreadable)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn new(file: File, max_resource: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        let page_count = (len / PAGE_SIZE as u64) as PageNo;

        let file_ctx = Arc::new(FileCtx {
            file,
            lock: Mutex::new(()),
        });

        let loader_ctx = file_ctx.clone();
        let releaser_ctx = file_ctx.clone();

        let cache = ResourceCache::new(
            max_resource,
            move |pgno: &PageNo| -> Result<PageRef> {
                let mut buf = vec![0u8; PAGE_SIZE];
                let _guard = loader_ctx.lock.lock();
                loader_ctx.file.read_exact_at(&mut buf, page_offset(*pgno))?;
                Ok(Page::from_raw(*pgno, buf))
            },
            move |_pgno: &PageNo, page: &PageRef| -> Result<()> {
                if page.is_dirty() {
                    let data = page.snapshot();
                    let _guard = releaser_ctx.lock.lock();
                    releaser_ctx.file.write_all_at(&data, page_offset(page.pgno()))?;
                    releaser_ctx.file.sync_all()?;
                    page.set_dirty(false);
                }
                Ok(())
            },
        );

        Ok(PageCache {
            inner: Arc::new(Inner {
                cache,
                file_ctx,
                page_count: Mutex::new(page_count),
            }),
        })
    }

    pub fn create<P: AsRef<Path>>(base: P, memory_budget: u64) -> Result<Self> {
        let capacity = memory_budget / PAGE_SIZE as u64;
        if capacity < MEM_MIN_LIM {
            return Err(Error::MemTooSmall {
                min: MEM_MIN_LIM as usize,
                got: capacity as usize,
            });
        }
        let path = db_path(base.as_ref());
        let file = Self::open_file(&path, true)?;
        Self::new(file, capacity as usize)
    }

    pub fn open<P: AsRef<Path>>(base: P, memory_budget: u64) -> Result<Self> {
        let capacity = memory_budget / PAGE_SIZE as u64;
        if capacity < MEM_MIN_LIM {
            return Err(Error::MemTooSmall {
                min: MEM_MIN_LIM as usize,
                got: capacity as usize,
            });
        }
        let path = db_path(base.as_ref());
        let file = Self::open_file(&path, false)?;
        Self::new(file, capacity as usize)
    }

    /// Allocate a new page at the end of the file, writing `init_data`
    /// (exactly `PAGE_SIZE` bytes) as its initial image. Does not cache the
    /// new page.
    pub fn new_page(&self, init_data: &[u8]) -> Result<PageNo> {
        debug_assert_eq!(init_data.len(), PAGE_SIZE);
        let mut count = self.inner.page_count.lock();
        let pgno = *count + 1;
        let offset = page_offset(pgno);
        {
            let _guard = self.inner.file_ctx.lock.lock();
            self.inner.file_ctx.file.write_all_at(init_data, offset)?;
            self.inner.file_ctx.file.sync_all()?;
        }
        *count = pgno;
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: PageNo) -> Result<PagePin> {
        let page = self.inner.cache.get(pgno)?;
        Ok(PagePin {
            page,
            cache: self.clone(),
        })
    }

    fn release(&self, pgno: PageNo) -> Result<()> {
        self.inner.cache.release(&pgno)
    }

    /// Write-through a page's current image to disk and fsync, regardless
    /// of its dirty bit.
    pub fn flush_page(&self, page: &PageRef) -> Result<()> {
        let data = page.snapshot();
        let _guard = self.inner.file_ctx.lock.lock();
        self.inner
            .file_ctx
            .file
            .write_all_at(&data, page_offset(page.pgno()))?;
        self.inner.file_ctx.file.sync_all()?;
        Ok(())
    }

    pub fn truncate_by_pgno(&self, max_pgno: PageNo) -> Result<()> {
        let mut count = self.inner.page_count.lock();
        let size = page_offset(max_pgno + 1) as u64;
        {
            let _guard = self.inner.file_ctx.lock.lock();
            self.inner.file_ctx.file.set_len(size)?;
        }
        *count = max_pgno;
        Ok(())
    }

    pub fn page_count(&self) -> PageNo {
        *self.inner.page_count.lock()
    }

    /// Flush any still-cached dirty pages and fsync the heap file.
    pub fn close(&self) -> Result<()> {
        self.inner.cache.for_each(|_pgno, page| {
            if page.is_dirty() {
                self.flush_page(page)?;
                page.set_dirty(false);
            }
            Ok(())
        })?;
        self.inner.file_ctx.file.sync_all()?;
        Ok(())
    }
}

fn db_path(base: &Path) -> PathBuf {
    with_suffix(base, DB_SUFFIX)
}

/// An owned pin on a cached page. Releases the pin (decrementing the page
/// cache's refcount) when dropped.
pub struct PagePin {
    page: PageRef,
    cache: PageCache,
}

impl Deref for PagePin {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PagePin {
    fn drop(&mut self) {
        let _ = self.cache.release(self.page.pgno());
    }
}

impl PagePin {
    pub fn page_ref(&self) -> &PageRef {
        &self.page
    }
}
