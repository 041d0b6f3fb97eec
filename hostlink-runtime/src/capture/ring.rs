use std::collections::VecDeque;

/// Bounded FIFO that drops its oldest item when full.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Push to the back. Returns the evicted item when the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_evicts_oldest_and_counts() {
        let mut ring = RingBuffer::new(3);
        for n in 1..=3 {
            assert_eq!(ring.push(n), None);
        }
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(ring.dropped(), 2);
    }

    #[test]
    fn retain_keeps_order() {
        let mut ring = RingBuffer::new(8);
        for n in 1..=6 {
            ring.push(n);
        }
        ring.retain(|n| n % 2 == 0);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 4, 6]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut ring = RingBuffer::new(0);
        ring.push('a');
        ring.push('b');
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec!['b']);
    }
}
