//! Write-back cache over logical-block windows.
//!
//! Mirrors `flash_cache_item_tag`/`flash_cache_tag` from the original
//! driver: a small fixed set of items, each covering a contiguous window of
//! one logical block's pages, with a saturating LRU counter and a dirty
//! flag.

/// One cached window of pages belonging to a single logical block.
#[derive(Clone, Debug)]
pub struct CacheItem {
    /// Logical block this item currently caches, if any.
    pub logical_block: Option<u32>,
    /// Saturating LRU age counter; higher means more recently used.
    pub lru: u8,
    /// Whether `content` has been written since it was last flushed.
    pub dirty: bool,
    /// Cached page bytes, `window_pages * page_data_size` long.
    pub content: Vec<u8>,
}

impl CacheItem {
    fn empty(window_bytes: usize) -> Self {
        Self {
            logical_block: None,
            lru: 0,
            dirty: false,
            content: vec![0xFF; window_bytes],
        }
    }
}

/// The cache: a fixed set of [`CacheItem`]s plus the geometry needed to
/// translate a logical byte address into an item + offset.
#[derive(Clone, Debug)]
pub struct Cache {
    items: Vec<CacheItem>,
    /// Pages covered by each item; `0` is translated to the whole block by
    /// the caller at construction time.
    window_pages: u16,
    page_data_size: u16,
}

impl Cache {
    pub fn new(item_count: u8, window_pages: u16, page_data_size: u16) -> Self {
        let window_bytes = window_pages as usize * page_data_size as usize;
        Self {
            items: (0..item_count)
                .map(|_| CacheItem::empty(window_bytes))
                .collect(),
            window_pages,
            page_data_size,
        }
    }

    pub fn window_pages(&self) -> u16 {
        self.window_pages
    }

    pub fn items(&self) -> &[CacheItem] {
        &self.items
    }

    /// Find the item currently caching `logical_block`, if any.
    pub fn find(&self, logical_block: u32) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.logical_block == Some(logical_block))
    }

    /// Touch an item's LRU counter on access (saturating increment), then
    /// normalize every other non-zero counter downward by the touched
    /// item's pre-touch value so counters stay comparable (the "reset
    /// window" behavior of the original cache).
    pub fn touch(&mut self, index: usize) {
        let before = self.items[index].lru;
        self.items[index].lru = self.items[index].lru.saturating_add(1);
        if before > 0 {
            for (i, item) in self.items.iter_mut().enumerate() {
                if i != index && item.lru > 0 {
                    item.lru = item.lru.saturating_sub(before);
                }
            }
        }
    }

    /// Index of the least-recently-used item, used as the eviction victim.
    pub fn lru_victim(&self) -> usize {
        self.items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| item.lru)
            .map(|(i, _)| i)
            .expect("cache has at least one item")
    }

    /// Install `content` into `index`, marking it clean and pointing at
    /// `logical_block`.
    pub fn install(&mut self, index: usize, logical_block: u32, content: Vec<u8>) {
        let item = &mut self.items[index];
        item.logical_block = Some(logical_block);
        item.content = content;
        item.dirty = false;
    }

    pub fn mark_dirty(&mut self, index: usize) {
        self.items[index].dirty = true;
    }

    /// Overwrite `bytes` into `index`'s content at `offset` (used by
    /// `Ftl::page_write` to place one page within a cached window).
    pub fn write_into(&mut self, index: usize, offset: usize, bytes: &[u8]) {
        self.items[index].content[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn invalidate(&mut self, index: usize) {
        let item = &mut self.items[index];
        item.logical_block = None;
        item.dirty = false;
        item.lru = 0;
    }

    /// Invalidate every item caching `logical_block` (used when a block is
    /// discovered bad out from under the cache, or after an ECC failure
    /// that makes cached bytes untrustworthy).
    pub fn invalidate_block(&mut self, logical_block: u32) {
        for i in 0..self.items.len() {
            if self.items[i].logical_block == Some(logical_block) {
                self.invalidate(i);
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        for i in 0..self.items.len() {
            self.invalidate(i);
        }
    }

    pub fn page_data_size(&self) -> u16 {
        self.page_data_size
    }

    /// Indices of every dirty item, oldest-touched first is not guaranteed;
    /// callers write back in whatever order is returned.
    pub fn dirty_indices(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.dirty)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_is_all_unmapped() {
        let cache = Cache::new(2, 4, 512);
        assert!(cache.find(0).is_none());
        assert_eq!(cache.items().len(), 2);
    }

    #[test]
    fn touch_normalizes_other_counters() {
        let mut cache = Cache::new(3, 1, 8);
        cache.touch(0);
        cache.touch(0);
        cache.touch(1);
        // item 0 was at 2 before touching item 1; touching item 1
        // subtracts item 1's pre-touch LRU (0) from the others, so item 0
        // is untouched by that specific touch.
        assert_eq!(cache.items()[0].lru, 2);
        assert_eq!(cache.items()[1].lru, 1);
    }

    #[test]
    fn lru_victim_picks_minimum() {
        let mut cache = Cache::new(3, 1, 8);
        cache.touch(0);
        cache.touch(0);
        cache.touch(1);
        assert_eq!(cache.lru_victim(), 2);
    }

    #[test]
    fn install_clears_dirty_and_sets_mapping() {
        let mut cache = Cache::new(1, 1, 4);
        cache.mark_dirty(0);
        cache.install(0, 7, vec![1, 2, 3, 4]);
        assert_eq!(cache.items()[0].logical_block, Some(7));
        assert!(!cache.items()[0].dirty);
    }

    #[test]
    fn invalidate_block_clears_matching_items_only() {
        let mut cache = Cache::new(2, 1, 4);
        cache.install(0, 1, vec![0; 4]);
        cache.install(1, 2, vec![0; 4]);
        cache.invalidate_block(1);
        assert_eq!(cache.items()[0].logical_block, None);
        assert_eq!(cache.items()[1].logical_block, Some(2));
    }
}
