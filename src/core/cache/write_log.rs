//! Ordered log of dirty pages
//!
//! Newest write at the head, at most one entry per page. Flushing walks the
//! log from the tail so pages are committed in the order they were written.

use crate::core::page::PageId;
use std::collections::VecDeque;

#[derive(Debug, Default, Clone)]
pub struct WriteLog {
    /// Front = head (newest), back = tail (oldest)
    entries: VecDeque<PageId>,
}

impl WriteLog {
    pub fn new() -> Self {
        WriteLog {
            entries: VecDeque::new(),
        }
    }

    /// Move `page` to the head, inserting it if absent
    pub fn push(&mut self, page: PageId) {
        self.remove(page);
        self.entries.push_front(page);
    }

    /// Take `page` off the log; false when it was not on it
    pub fn remove(&mut self, page: PageId) -> bool {
        match self.entries.iter().position(|&p| p == page) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.entries.contains(&page)
    }

    /// Snapshot of the log, tail to head
    pub fn oldest_first(&self) -> Vec<PageId> {
        self.entries.iter().rev().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_orders_newest_first() {
        let mut log = WriteLog::new();
        log.push(PageId(1));
        log.push(PageId(2));
        log.push(PageId(3));
        assert_eq!(log.oldest_first(), vec![PageId(1), PageId(2), PageId(3)]);
    }

    #[test]
    fn test_duplicate_collapses_to_head() {
        let mut log = WriteLog::new();
        log.push(PageId(1));
        log.push(PageId(2));
        log.push(PageId(1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest_first(), vec![PageId(2), PageId(1)]);
    }

    #[test]
    fn test_remove() {
        let mut log = WriteLog::new();
        log.push(PageId(4));
        assert!(log.remove(PageId(4)));
        assert!(!log.remove(PageId(4)));
        assert!(log.is_empty());
    }
}
