//! # Index List
//!
//! Doubly-linked list stored in a slab. Nodes are addressed by
//! [`ListIndex`], so an element can be unlinked in O(1) by whoever holds
//! its index, without pointers between nodes.
//!
//! ```text
//!   nodes: [ A | free | C | B ]      head -> 0 -> 3 -> 2 <- tail
//!   free:  [1]
//! ```

/// Stable position of an element in an [`IndexList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListIndex(usize);

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Slab-backed doubly-linked list with O(1) push, unlink and reuse of
/// freed slots.
///
/// # Thread Safety
///
/// Not thread-safe. Wrap in a mutex.
#[derive(Debug)]
pub struct IndexList<T> {
    nodes: Vec<Node<T>>,
    free_list: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for IndexList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexList<T> {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self { nodes: Vec::new(), free_list: Vec::new(), head: None, tail: None, len: 0 }
    }

    /// Number of linked elements.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if no element is linked.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `value` at the tail.
    pub fn push_back(&mut self, value: T) -> ListIndex {
        let node = Node { value: Some(value), prev: self.tail, next: None };
        let index = if let Some(index) = self.free_list.pop() {
            self.nodes[index] = node;
            index
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        ListIndex(index)
    }

    /// Element at `index`, if still linked.
    #[must_use]
    pub fn get(&self, index: ListIndex) -> Option<&T> {
        self.nodes.get(index.0).and_then(|node| node.value.as_ref())
    }

    /// Unlinks and returns the element at `index`.
    ///
    /// Returns `None` for an index that is not linked.
    pub fn remove(&mut self, index: ListIndex) -> Option<T> {
        let node = self.nodes.get_mut(index.0)?;
        let value = node.value.take()?;
        let (prev, next) = (node.prev.take(), node.next.take());

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        self.free_list.push(index.0);
        self.len -= 1;
        Some(value)
    }

    /// Iterates from head to tail.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { list: self, cursor: self.head }
    }

    /// Unlinks the first element (from the head) matching `predicate`.
    pub fn remove_first(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.iter().find(|(_, value)| predicate(value)).map(|(index, _)| index)?;
        self.remove(index)
    }

    /// Unlinks every element matching `predicate`, in list order.
    pub fn remove_matching(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let indices: Vec<ListIndex> = self
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(index, _)| index)
            .collect();
        indices.into_iter().filter_map(|index| self.remove(index)).collect()
    }

    /// Unlinks everything, in list order.
    pub fn take_all(&mut self) -> Vec<T> {
        self.remove_matching(|_| true)
    }
}

/// Head-to-tail iterator over an [`IndexList`].
pub struct Iter<'a, T> {
    list: &'a IndexList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (ListIndex, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.list.nodes[index];
        self.cursor = node.next;
        node.value.as_ref().map(|value| (ListIndex(index), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &IndexList<u32>) -> Vec<u32> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_push_and_iterate_in_order() {
        let mut list = IndexList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        assert_eq!(values(&list), vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut list = IndexList::new();
        let a = list.push_back(1);
        let b = list.push_back(2);
        let c = list.push_back(3);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(values(&list), vec![1, 3]);
        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert_eq!(list.remove(c), None);
    }

    #[test]
    fn test_slots_are_reused() {
        let mut list = IndexList::new();
        let a = list.push_back(10);
        list.push_back(20);
        list.remove(a);
        let d = list.push_back(30);

        assert_eq!(d, a);
        assert_eq!(values(&list), vec![20, 30]);
    }

    #[test]
    fn test_remove_first_is_first_match() {
        let mut list = IndexList::new();
        for v in [5, 8, 9, 12] {
            list.push_back(v);
        }
        assert_eq!(list.remove_first(|v| *v > 6), Some(8));
        assert_eq!(values(&list), vec![5, 9, 12]);
    }

    #[test]
    fn test_remove_matching() {
        let mut list = IndexList::new();
        for v in 0..6 {
            list.push_back(v);
        }
        assert_eq!(list.remove_matching(|v| v % 2 == 0), vec![0, 2, 4]);
        assert_eq!(values(&list), vec![1, 3, 5]);
        assert_eq!(list.take_all(), vec![1, 3, 5]);
        assert!(list.is_empty());
    }
}
