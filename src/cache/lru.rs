//! Recency List Module
//!
//! Doubly linked list over a slab, giving O(1) push, unlink and tail eviction.

// == Recency List ==
/// Orders items from most recently touched (front) to least (back).
///
/// Items live in a slab of slots; the handle returned by [`push_front`] is the
/// slot index and stays valid until the item is removed. Freed slots are
/// reused.
///
/// [`push_front`]: RecencyList::push_front
#[derive(Debug)]
pub struct RecencyList<T> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct Node<T> {
    item: T,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<T> Default for RecencyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecencyList<T> {
    // == Constructor ==
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    // == Push Front ==
    /// Inserts `item` as the most recent entry and returns its handle.
    pub fn push_front(&mut self, item: T) -> usize {
        let node = Node {
            item,
            prev: None,
            next: self.head,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        if let Some(old_head) = self.head {
            if let Some(n) = self.slots[old_head].as_mut() {
                n.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.len += 1;
        idx
    }

    // == Remove ==
    /// Unlinks and returns the item behind `idx`, if it is live.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let node = self.slots.get_mut(idx)?.take()?;

        match node.prev {
            Some(prev) => {
                if let Some(n) = self.slots[prev].as_mut() {
                    n.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.slots[next].as_mut() {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        self.free.push(idx);
        self.len -= 1;
        Some(node.item)
    }

    // == Pop Back ==
    /// Removes and returns the least recently touched item.
    pub fn pop_back(&mut self) -> Option<T> {
        let tail = self.tail?;
        self.remove(tail)
    }

    pub fn back(&self) -> Option<&T> {
        self.tail.and_then(|idx| self.get(idx))
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref().map(|n| &n.item)
    }

    /// Iterates from most to least recent, yielding handles with items.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every item and releases the slab.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }
}

/// Front-to-back iterator over a [`RecencyList`].
pub struct Iter<'a, T> {
    list: &'a RecencyList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.list.slots.get(idx)?.as_ref()?;
        self.cursor = node.next;
        Some((idx, &node.item))
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn items(list: &RecencyList<&'static str>) -> Vec<&'static str> {
        list.iter().map(|(_, item)| *item).collect()
    }

    #[test]
    fn test_list_new() {
        let list: RecencyList<u32> = RecencyList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.back().is_none());
    }

    #[test]
    fn test_push_front_orders_newest_first() {
        let mut list = RecencyList::new();
        list.push_front("a");
        list.push_front("b");
        list.push_front("c");

        assert_eq!(list.len(), 3);
        assert_eq!(items(&list), vec!["c", "b", "a"]);
        assert_eq!(list.back(), Some(&"a"));
    }

    #[test]
    fn test_pop_back_evicts_oldest() {
        let mut list = RecencyList::new();
        list.push_front("a");
        list.push_front("b");
        list.push_front("c");

        assert_eq!(list.pop_back(), Some("a"));
        assert_eq!(list.pop_back(), Some("b"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop_back(), Some("c"));
        assert_eq!(list.pop_back(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_middle_relinks() {
        let mut list = RecencyList::new();
        list.push_front("a");
        let b = list.push_front("b");
        list.push_front("c");

        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(items(&list), vec!["c", "a"]);

        // Stale handle is a no-op
        assert_eq!(list.remove(b), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_remove_head_and_tail() {
        let mut list = RecencyList::new();
        let a = list.push_front("a");
        list.push_front("b");
        let c = list.push_front("c");

        list.remove(c);
        assert_eq!(items(&list), vec!["b", "a"]);
        list.remove(a);
        assert_eq!(items(&list), vec!["b"]);
        assert_eq!(list.back(), Some(&"b"));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut list = RecencyList::new();
        let a = list.push_front("a");
        list.remove(a);
        let b = list.push_front("b");
        assert_eq!(a, b);
        assert_eq!(list.get(b), Some(&"b"));
    }

    #[test]
    fn test_reinsert_moves_to_front() {
        let mut list = RecencyList::new();
        let a = list.push_front("a");
        list.push_front("b");
        list.push_front("c");

        // Overwrite of "a": unlink then push again
        let item = list.remove(a).unwrap();
        list.push_front(item);

        assert_eq!(items(&list), vec!["a", "c", "b"]);
        assert_eq!(list.pop_back(), Some("b"));
    }

    #[test]
    fn test_clear() {
        let mut list = RecencyList::new();
        list.push_front(1);
        list.push_front(2);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.iter().count(), 0);
        list.push_front(3);
        assert_eq!(list.back(), Some(&3));
    }
}
