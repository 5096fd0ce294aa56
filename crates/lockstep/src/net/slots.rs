/// Fixed-capacity arena. Slots are addressed by index and recycled through
/// a free-list, so nothing allocates after construction.
#[derive(Debug)]
pub struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slots<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries,
            // Popped from the back, so the lowest index is handed out first.
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Stores `value` in a free slot. Hands the value back when full.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        self.entries[index] = Some(value);
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.entries.get_mut(index)?.take()?;
        self.free.push(index);
        Some(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index)?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.as_mut().map(|v| (i, v)))
    }

    pub fn position(&self, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter().find(|(_, v)| pred(v)).map(|(i, _)| i)
    }

    /// Removes every entry the predicate rejects and returns them.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        for index in 0..self.entries.len() {
            if self.entries[index].as_ref().is_some_and(|v| !keep(v)) {
                if let Some(value) = self.remove(index) {
                    removed.push(value);
                }
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        for index in 0..self.entries.len() {
            self.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let mut slots = Slots::with_capacity(2);
        assert_eq!(slots.insert("a"), Ok(0));
        assert_eq!(slots.insert("b"), Ok(1));
        assert!(slots.is_full());
        assert_eq!(slots.insert("c"), Err("c"));
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let mut slots = Slots::with_capacity(3);
        slots.insert(1).unwrap();
        slots.insert(2).unwrap();
        assert_eq!(slots.remove(0), Some(1));
        assert_eq!(slots.remove(0), None);
        assert_eq!(slots.insert(3), Ok(0));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_retain_returns_removed() {
        let mut slots = Slots::with_capacity(4);
        for v in 0..4 {
            slots.insert(v).unwrap();
        }
        let removed = slots.retain(|v| v % 2 == 0);
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(slots.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![0, 2]);
    }
}
