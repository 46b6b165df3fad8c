//! Page cache for one table space.
//!
//! The cache never writes a dirty page on its own: dirty pages stay
//! resident until [`PageCache::flush_all`] runs as part of a checkpoint,
//! or until a caller writes a page through with [`PageCache::write_through`].
//! Pages reach disk only after the log records describing them, and
//! dropping the cache without a flush behaves like a crash.
//!
//! Clean pages are evicted in LRU order once more than `capacity` pages
//! are resident.

mod eviction;

pub use eviction::LruEvictionQueue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::page::{DiskManager, Page, PageId};
use crate::types::{PageNumber, TableSpaceId};

struct CachedPage {
    page: Box<Page>,
    dirty: bool,
}

struct CacheInner {
    pages: HashMap<PageNumber, CachedPage>,
    lru: LruEvictionQueue,
    disk_manager: DiskManager,
}

/// Write-back page cache over a [`DiskManager`].
pub struct PageCache {
    table_space_id: TableSpaceId,
    capacity: usize,
    inner: Mutex<CacheInner>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions: AtomicU64,
    pages_written: AtomicU64,
}

impl PageCache {
    /// Creates a cache keeping up to `capacity` clean pages resident.
    #[must_use]
    pub fn new(capacity: usize, disk_manager: DiskManager, table_space_id: TableSpaceId) -> Self {
        Self {
            table_space_id,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                pages: HashMap::new(),
                lru: LruEvictionQueue::new(),
                disk_manager,
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
        }
    }

    /// Returns a copy of a page, reading and verifying it on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the page checksum does not match.
    pub fn fetch(&self, page_number: PageNumber) -> Result<Page> {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.pages.get(&page_number) {
            let page = (*cached.page).clone();
            inner.lru.touch(page_number);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let page = inner.disk_manager.read_page(page_number)?;
        page.verify()?;
        inner.pages.insert(
            page_number,
            CachedPage {
                page: Box::new(page.clone()),
                dirty: false,
            },
        );
        inner.lru.touch(page_number);
        self.evict_clean(&mut inner);
        Ok(page)
    }

    /// Replaces a page in the cache and marks it dirty.
    pub fn put(&self, page: Page) {
        let mut inner = self.inner.lock();
        let page_number = page.id.page_number;
        inner.pages.insert(
            page_number,
            CachedPage {
                page: Box::new(page),
                dirty: true,
            },
        );
        inner.lru.remove(page_number);
    }

    /// Writes a page to disk immediately and keeps a clean copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_through(&self, mut page: Page) -> Result<()> {
        page.seal();
        let mut inner = self.inner.lock();
        inner.disk_manager.write_page(&page)?;
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        let page_number = page.id.page_number;
        inner.pages.insert(
            page_number,
            CachedPage {
                page: Box::new(page),
                dirty: false,
            },
        );
        inner.lru.touch(page_number);
        self.evict_clean(&mut inner);
        Ok(())
    }

    /// Writes every dirty page and syncs the file.
    ///
    /// # Errors
    ///
    /// Returns an error if any write or the sync fails.
    pub fn flush_all(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut dirty: Vec<PageNumber> = inner
            .pages
            .iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|(&number, _)| number)
            .collect();
        dirty.sort_unstable();

        for &page_number in &dirty {
            let CacheInner {
                pages, disk_manager, ..
            } = &mut *inner;
            if let Some(cached) = pages.get_mut(&page_number) {
                cached.page.seal();
                disk_manager.write_page(&cached.page)?;
                cached.dirty = false;
            }
            inner.lru.touch(page_number);
        }
        inner.disk_manager.sync()?;
        self.pages_written
            .fetch_add(dirty.len() as u64, Ordering::Relaxed);
        self.evict_clean(&mut inner);
        Ok(dirty.len())
    }

    /// Syncs the underlying file.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().disk_manager.sync()
    }

    /// Returns the page id for `page_number` in this table space.
    #[must_use]
    pub fn page_id(&self, page_number: PageNumber) -> PageId {
        PageId::new(self.table_space_id, page_number)
    }

    fn evict_clean(&self, inner: &mut CacheInner) {
        while inner.pages.len() > self.capacity {
            let CacheInner { pages, lru, .. } = &mut *inner;
            let victim = lru.pop_where(|p| pages.get(&p).is_some_and(|c| !c.dirty));
            let Some(victim) = victim else {
                break;
            };
            pages.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns cache statistics.
    #[must_use]
    pub fn stats(&self) -> PageCacheStats {
        let inner = self.inner.lock();
        PageCacheStats {
            capacity: self.capacity,
            pages_used: inner.pages.len(),
            dirty_pages: inner.pages.values().filter(|c| c.dirty).count(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the page cache state.
#[derive(Debug, Clone)]
pub struct PageCacheStats {
    /// Clean pages kept resident before eviction starts.
    pub capacity: usize,
    /// Current number of resident pages.
    pub pages_used: usize,
    /// Number of dirty pages.
    pub dirty_pages: usize,
    /// Number of cache hits.
    pub cache_hits: u64,
    /// Number of cache misses.
    pub cache_misses: u64,
    /// Number of clean pages evicted.
    pub evictions: u64,
    /// Number of pages written to disk.
    pub pages_written: u64,
}

impl PageCacheStats {
    /// Cache hit rate between 0.0 and 1.0, `None` before any access.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        (total > 0).then(|| self.cache_hits as f64 / total as f64)
    }
}
