//! Fixed-capacity, insertion-ordered, overwrite-oldest ring buffer for
//! captured HTTP exchanges (§3, §8 invariant 9).
//!
//! Grounded on `safe_dns::DnsCache`, which is the same
//! shape (capacity-bounded, evict-oldest) guarded by a single lock;
//! generalized from a `HashMap` with manual LRU bookkeeping to a
//! `VecDeque` since insertion order here doubles as recency order.

use std::collections::VecDeque;
use std::sync::RwLock;

pub trait HasId {
    fn id(&self) -> &str;
}

pub struct RingBuffer<T> {
    capacity: usize,
    items: RwLock<VecDeque<T>>,
}

impl<T: Clone + HasId> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            capacity,
            items: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append `item`, evicting the oldest entry first if at capacity.
    pub fn append(&self, item: T) {
        let mut items = self.items.write().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    pub fn lookup(&self, id: &str) -> Option<T> {
        self.items
            .read()
            .unwrap()
            .iter()
            .find(|item| item.id() == id)
            .cloned()
    }

    /// Snapshot of `[offset, offset+limit)` ordered newest-first.
    pub fn snapshot_range(&self, offset: usize, limit: usize) -> Vec<T> {
        let items = self.items.read().unwrap();
        items
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn snapshot_all(&self) -> Vec<T> {
        self.items.read().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.items.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        id: String,
        seq: u32,
    }

    impl HasId for Item {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn item(id: &str, seq: u32) -> Item {
        Item {
            id: id.into(),
            seq,
        }
    }

    #[test]
    fn appends_beyond_capacity_drop_the_oldest() {
        let buffer = RingBuffer::new(3);
        buffer.append(item("a", 1));
        buffer.append(item("b", 2));
        buffer.append(item("c", 3));
        buffer.append(item("d", 4));

        assert_eq!(buffer.len(), 3);
        assert!(buffer.lookup("a").is_none());
        assert!(buffer.lookup("d").is_some());
    }

    #[test]
    fn snapshot_range_is_newest_first() {
        let buffer = RingBuffer::new(5);
        for i in 1..=5 {
            buffer.append(item(&format!("id{i}"), i));
        }
        let page = buffer.snapshot_range(0, 2);
        assert_eq!(page.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[test]
    fn clear_empties_the_buffer() {
        let buffer = RingBuffer::new(2);
        buffer.append(item("a", 1));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
