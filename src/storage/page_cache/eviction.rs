//! Least-recently-used order of resident pages.
//!
//! Only clean pages are ever taken from the queue; dirty pages stay
//! resident until the next checkpoint writes them.

use std::collections::VecDeque;

use crate::types::PageNumber;

/// LRU order of cached page numbers, oldest first.
#[derive(Debug, Default)]
pub struct LruEvictionQueue {
    queue: VecDeque<PageNumber>,
}

impl LruEvictionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `page` as most recently used.
    pub fn touch(&mut self, page: PageNumber) {
        self.remove(page);
        self.queue.push_back(page);
    }

    /// Removes `page` from the queue.
    pub fn remove(&mut self, page: PageNumber) {
        if let Some(position) = self.queue.iter().position(|&p| p == page) {
            self.queue.remove(position);
        }
    }

    /// Removes and returns the oldest page accepted by `evictable`.
    pub fn pop_where(&mut self, mut evictable: impl FnMut(PageNumber) -> bool) -> Option<PageNumber> {
        let position = self.queue.iter().position(|&p| evictable(p))?;
        self.queue.remove(position)
    }

    /// Number of pages in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Forgets every page.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_moves_to_back() {
        let mut queue = LruEvictionQueue::new();

        queue.touch(5);
        queue.touch(6);
        queue.touch(7);
        queue.touch(5);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_where(|_| true), Some(6));
        assert_eq!(queue.pop_where(|_| true), Some(7));
        assert_eq!(queue.pop_where(|_| true), Some(5));
        assert_eq!(queue.pop_where(|_| true), None);
    }

    #[test]
    fn test_pop_skips_rejected_pages() {
        let mut queue = LruEvictionQueue::new();
        queue.touch(1);
        queue.touch(2);
        queue.touch(3);

        assert_eq!(queue.pop_where(|p| p != 1), Some(2));
        assert_eq!(queue.len(), 2);

        queue.remove(1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
