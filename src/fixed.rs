//! Fixed-capacity dense list used on the render path.
//!
//! Storage is allocated once when the list is created; inserting and removing never
//! touch the allocator. Removal shifts later entries down to keep the list dense,
//! which costs O(n) moves. With the small capacities used here (15 callbacks, 100
//! channels) that is cheaper than any indirection and keeps iteration order equal to
//! insertion order.

/// A dense list of at most `N` items.
///
/// Slots `0..len` are always occupied and slots `len..N` are always empty, so a
/// reader that observes the list between two mutations sees a consistent count.
pub struct FixedList<T, const N: usize> {
    slots: Box<[Option<T>; N]>,
    len: usize,
}

impl<T, const N: usize> FixedList<T, N> {
    pub fn new() -> Self {
        Self {
            slots: Box::new(std::array::from_fn(|_| None)),
            len: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Appends an item, handing it back if the list is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.len == N {
            return Err(item);
        }
        self.slots[self.len] = Some(item);
        self.len += 1;
        Ok(())
    }

    /// Inserts an item at `index`, shifting later items up.
    pub fn insert(&mut self, index: usize, item: T) -> Result<(), T> {
        if self.len == N || index > self.len {
            return Err(item);
        }
        self.slots[index..=self.len].rotate_right(1);
        self.slots[index] = Some(item);
        self.len += 1;
        Ok(())
    }

    /// Removes the item at `index`, shifting later items down.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let item = self.slots[index].take();
        self.slots[index..self.len].rotate_left(1);
        self.len -= 1;
        debug_assert!(self.slots[self.len].is_none());
        item
    }

    /// Removes the first item matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.position(|item| predicate(item))?;
        self.remove(index)
    }

    pub fn position(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter().position(|item| predicate(item))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        self.slots[index].as_mut()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.slots[..self.len].iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.slots[..self.len].iter_mut().flatten()
    }

    /// Whether slots `0..len` are all occupied and the rest all empty.
    pub fn is_dense(&self) -> bool {
        self.slots[..self.len].iter().all(Option::is_some)
            && self.slots[self.len..].iter().all(Option::is_none)
    }

    /// Occupied slots as a slice, for split borrows on the render path.
    pub(crate) fn as_mut_slots(&mut self) -> &mut [Option<T>] {
        &mut self.slots[..self.len]
    }
}

impl<T, const N: usize> Default for FixedList<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug, const N: usize> std::fmt::Debug for FixedList<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_until_full() {
        let mut list = FixedList::<u32, 3>::new();
        assert!(list.push(1).is_ok());
        assert!(list.push(2).is_ok());
        assert!(list.push(3).is_ok());
        assert_eq!(list.push(4), Err(4));
        assert_eq!(list.len(), 3);
        assert!(list.is_full());
    }

    #[test]
    fn test_remove_keeps_list_dense() {
        let mut list = FixedList::<u32, 4>::new();
        for i in 0..4 {
            list.push(i).unwrap();
        }
        assert_eq!(list.remove(1), Some(1));
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(list.get(3), None);
        assert_eq!(list.remove(7), None);
        assert_eq!(list.remove_where(|v| *v == 3), Some(3));
        assert_eq!(list.len(), 2);
        assert!(list.is_dense());
    }

    #[test]
    fn test_insert_shifts_up() {
        let mut list = FixedList::<u32, 4>::new();
        list.push(1).unwrap();
        list.push(3).unwrap();
        list.insert(1, 2).unwrap();
        list.insert(0, 0).unwrap();
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(list.insert(0, 9), Err(9));
    }
}
