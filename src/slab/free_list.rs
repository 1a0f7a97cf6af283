use std::sync::atomic::{AtomicU32, Ordering};

/// Marks the end of a slot list.
pub const NIL: u32 = u32::MAX;

/// Singly linked list of slot indices.
///
/// The links live in a side table owned by the run (`links[i]` is the successor of slot `i`),
/// so freed slot memory stays zeroed. `USE_TAIL` lists keep their last element, which lets them
/// be spliced onto another list in constant time.
#[derive(Debug)]
pub struct SlotFreeList<const USE_TAIL: bool> {
    head: u32,
    tail: u32,
    size: u32,
}

impl<const USE_TAIL: bool> SlotFreeList<USE_TAIL> {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            size: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
    #[inline]
    pub fn head(&self) -> u32 {
        self.head
    }
    #[inline]
    pub fn tail(&self) -> u32 {
        debug_assert!(USE_TAIL);
        self.tail
    }

    /// Pops the first slot.
    #[inline]
    pub fn remove(&mut self, links: &[AtomicU32]) -> Option<u32> {
        let slot = self.head;
        if slot == NIL {
            return None;
        }
        let next = links[slot as usize].swap(NIL, Ordering::Relaxed);
        self.head = next;
        if USE_TAIL && slot == self.tail {
            debug_assert_eq!(next, NIL);
            self.tail = NIL;
        }
        self.size -= 1;
        Some(slot)
    }

    /// Pushes `slot` at the head.
    #[inline]
    pub fn add(&mut self, links: &[AtomicU32], slot: u32) {
        debug_assert_ne!(slot, NIL);
        let old_head = self.head;
        if old_head == NIL && USE_TAIL {
            self.tail = slot;
        }
        links[slot as usize].store(old_head, Ordering::Relaxed);
        self.head = slot;
        self.size += 1;
    }

    /// Moves every slot of `list` in front of this list's slots and empties `list`.
    pub fn merge(&mut self, links: &[AtomicU32], list: &mut SlotFreeList<true>) {
        if list.size == 0 {
            return;
        }
        let old_head = self.head;
        if old_head == NIL {
            self.head = list.head;
            if USE_TAIL {
                self.tail = list.tail;
            }
            self.size = list.size;
        } else {
            debug_assert_ne!(list.tail, NIL);
            links[list.tail as usize].store(old_head, Ordering::Relaxed);
            self.head = list.head;
            self.size += list.size;
        }
        list.reset();
    }

    pub fn reset(&mut self) {
        self.head = NIL;
        if USE_TAIL {
            self.tail = NIL;
        }
        self.size = 0;
    }

    /// Walks the list and calls `f` on every slot.
    pub fn for_each(&self, links: &[AtomicU32], mut f: impl FnMut(u32)) {
        let mut slot = self.head;
        while slot != NIL {
            f(slot);
            slot = links[slot as usize].load(Ordering::Relaxed);
        }
    }

    /// Checks the recorded size and tail against the links.
    pub fn verify(&self, links: &[AtomicU32]) {
        let mut count = 0u32;
        let mut last = NIL;
        self.for_each(links, |slot| {
            assert!((slot as usize) < links.len(), "slot {} out of run", slot);
            count += 1;
            assert!(count <= links.len() as u32, "cycle in slot list");
            last = slot;
        });
        assert_eq!(count, self.size, "slot list size mismatch");
        if USE_TAIL {
            assert_eq!(last, self.tail, "slot list tail mismatch");
        }
    }
}

impl<const USE_TAIL: bool> Default for SlotFreeList<USE_TAIL> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(n: usize) -> Vec<AtomicU32> {
        (0..n).map(|_| AtomicU32::new(NIL)).collect()
    }

    #[test]
    fn test_lifo_order() {
        let links = links(8);
        let mut list = SlotFreeList::<false>::new();
        for slot in (0..8).rev() {
            list.add(&links, slot);
        }
        list.verify(&links);
        assert_eq!(list.remove(&links), Some(0));
        assert_eq!(list.remove(&links), Some(1));
        list.add(&links, 0);
        assert_eq!(list.remove(&links), Some(0));
        assert_eq!(list.size(), 6);
        list.verify(&links);
    }

    #[test]
    fn test_merge() {
        let links = links(8);
        let mut free = SlotFreeList::<false>::new();
        let mut bulk = SlotFreeList::<true>::new();
        free.add(&links, 7);
        bulk.add(&links, 3);
        bulk.add(&links, 2);
        assert_eq!(bulk.tail(), 3);
        free.merge(&links, &mut bulk);
        assert!(bulk.is_empty());
        assert_eq!(free.size(), 3);
        free.verify(&links);
        let mut order = vec![];
        free.for_each(&links, |slot| order.push(slot));
        assert_eq!(order, vec![2, 3, 7]);

        let mut tl = SlotFreeList::<true>::new();
        let mut other = SlotFreeList::<true>::new();
        other.add(&links, 5);
        tl.merge(&links, &mut other);
        assert_eq!(tl.tail(), 5);
        tl.verify(&links);
        assert_eq!(tl.remove(&links), Some(5));
        assert_eq!(tl.tail, NIL);
    }
}
