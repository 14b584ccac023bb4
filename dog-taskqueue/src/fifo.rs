use std::collections::VecDeque;

use parking_lot::Mutex;

/// Thread-safe FIFO queue with O(1) enqueue and dequeue.
///
/// Every operation takes the internal lock, so concurrent producers and
/// consumers never lose or duplicate an item.
#[derive(Debug)]
pub struct FifoQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append to the tail
    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Remove and return the head, `None` when empty
    pub fn dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Current number of items
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Keep only the items matching `keep`, preserving order. O(n).
    ///
    /// Returns the number of items removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| keep(item));
        before - items.len()
    }

    /// Remove everything, head first
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

impl<T: Clone> FifoQueue<T> {
    /// Copy of the head without removing it
    pub fn peek(&self) -> Option<T> {
        self.items.lock().front().cloned()
    }

    /// Ordered copy of the contents, head first
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = FifoQueue::new();
        for i in 1..=5 {
            queue.enqueue(format!("job_{}", i));
        }

        assert_eq!(queue.size(), 5);
        assert_eq!(queue.peek().as_deref(), Some("job_1"));

        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec!["job_1", "job_2", "job_3", "job_4", "job_5"]);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_retain_preserves_order() {
        let queue = FifoQueue::new();
        for i in 0..6 {
            queue.enqueue(i);
        }

        let removed = queue.retain(|i| i % 2 == 0);
        assert_eq!(removed, 3);
        assert_eq!(queue.snapshot(), vec![0, 2, 4]);
        assert_eq!(queue.drain(), vec![0, 2, 4]);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let queue = Arc::new(FifoQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        queue.enqueue(p * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(item) = queue.dequeue() {
                        taken.push(item);
                    }
                    taken
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in consumers {
            for item in handle.join().unwrap() {
                assert!(seen.insert(item), "item {} dequeued twice", item);
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
