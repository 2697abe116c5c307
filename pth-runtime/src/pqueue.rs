//! Priority queues of threads.
//!
//! Entries are kept sorted by descending queue priority; within one priority
//! band insertion order is preserved, so `dequeue_max` is FIFO among equals.
//! Queue priority starts at the thread's priority and is raised by aging.

use std::collections::VecDeque;

use crate::error::{PthError, Result};
use crate::tcb::PRIO_MAX;

#[derive(Debug)]
pub(crate) struct PQueue<T> {
    name: &'static str,
    entries: VecDeque<(T, i32)>,
}

impl<T: Copy + PartialEq> PQueue<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        PQueue {
            name,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert at the tail of the `prio` band.
    pub(crate) fn insert(&mut self, item: T, prio: i32) {
        let at = self
            .entries
            .iter()
            .position(|&(_, p)| p < prio)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, (item, prio));
    }

    /// Insert at the head of the `prio` band.
    pub(crate) fn insert_head(&mut self, item: T, prio: i32) {
        let at = self
            .entries
            .iter()
            .position(|&(_, p)| p <= prio)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, (item, prio));
    }

    /// Priority that would place an entry in front of everything queued.
    pub(crate) fn favourite_prio(&self) -> i32 {
        self.entries.front().map_or(PRIO_MAX, |&(_, p)| p + 1)
    }

    /// Insert in front of everything queued.
    pub(crate) fn insert_favourite(&mut self, item: T) {
        let prio = self.favourite_prio();
        self.insert_head(item, prio);
    }

    /// Move a resident entry to the front.
    pub(crate) fn favourite(&mut self, item: T) -> Result<()> {
        self.delete(item)?;
        self.insert_favourite(item);
        Ok(())
    }

    /// Remove the highest-priority, oldest entry.
    pub(crate) fn dequeue_max(&mut self) -> Option<T> {
        self.entries.pop_front().map(|(item, _)| item)
    }

    /// Remove the lowest-priority, newest entry.
    pub(crate) fn pop_tail(&mut self) -> Option<T> {
        self.entries.pop_back().map(|(item, _)| item)
    }

    pub(crate) fn contains(&self, item: T) -> bool {
        self.entries.iter().any(|&(t, _)| t == item)
    }

    /// Queue priority of a resident entry.
    pub(crate) fn prio_of(&self, item: T) -> Option<i32> {
        self.entries.iter().find(|&&(t, _)| t == item).map(|&(_, p)| p)
    }

    pub(crate) fn delete(&mut self, item: T) -> Result<()> {
        let at = self
            .entries
            .iter()
            .position(|&(t, _)| t == item)
            .ok_or(PthError::InvalidHandle(self.name))?;
        self.entries.remove(at);
        Ok(())
    }

    /// Raise every entry below the ceiling by one. Entries at or above
    /// [`PRIO_MAX`] keep their priority, so the order stays sorted.
    pub(crate) fn age(&mut self) {
        for (_, p) in &mut self.entries {
            if *p < PRIO_MAX {
                *p += 1;
            }
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.entries.iter().map(|&(item, _)| item)
    }

    /// Entries with their queue priorities, front to back.
    pub(crate) fn iter_with_prio(&self) -> impl Iterator<Item = (T, i32)> + '_ {
        self.entries.iter().copied()
    }

    /// Remove and return every entry matching `pred`.
    pub(crate) fn drain_where(&mut self, mut pred: impl FnMut(T) -> bool) -> Vec<T> {
        let mut out = Vec::new();
        self.entries.retain(|&(t, _)| {
            if pred(t) {
                out.push(t);
                false
            } else {
                true
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcb::{PRIO_MIN, PRIO_STD};

    fn drain(q: &mut PQueue<u32>) -> Vec<u32> {
        std::iter::from_fn(|| q.dequeue_max()).collect()
    }

    #[test]
    fn fifo_within_a_priority() {
        let mut q = PQueue::new("ready");
        for i in 1..=4 {
            q.insert(i, PRIO_STD);
        }
        assert_eq!(drain(&mut q), vec![1, 2, 3, 4]);
    }

    #[test]
    fn higher_priority_first() {
        let mut q = PQueue::new("ready");
        q.insert(1, PRIO_MIN);
        q.insert(2, PRIO_STD);
        q.insert(3, PRIO_MAX);
        q.insert(4, PRIO_STD);
        assert_eq!(drain(&mut q), vec![3, 2, 4, 1]);
    }

    #[test]
    fn favourite_goes_first() {
        let mut q = PQueue::new("ready");
        q.insert(1, PRIO_MAX);
        q.insert(2, PRIO_STD);
        q.favourite(2).unwrap();
        assert_eq!(q.prio_of(2), Some(PRIO_MAX + 1));
        q.insert_favourite(3);
        assert_eq!(drain(&mut q), vec![3, 2, 1]);
    }

    #[test]
    fn favourite_of_empty_queue_is_max() {
        let q: PQueue<u32> = PQueue::new("ready");
        assert_eq!(q.favourite_prio(), PRIO_MAX);
    }

    #[test]
    fn head_insert_precedes_band() {
        let mut q = PQueue::new("ready");
        q.insert(1, PRIO_STD);
        q.insert_head(2, PRIO_STD);
        assert_eq!(drain(&mut q), vec![2, 1]);
    }

    #[test]
    fn delete_missing_is_invalid_handle() {
        let mut q = PQueue::new("waiting");
        q.insert(1, PRIO_STD);
        assert!(matches!(q.delete(2), Err(PthError::InvalidHandle("waiting"))));
        q.delete(1).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn aging_lifts_low_priority_to_the_ceiling() {
        let mut q = PQueue::new("ready");
        q.insert(1, PRIO_MIN);
        for _ in 0..100 {
            q.age();
        }
        assert_eq!(q.prio_of(1), Some(PRIO_MAX));
        // A newcomer at the ceiling queues behind the aged entry.
        q.insert(2, PRIO_MAX);
        assert_eq!(drain(&mut q), vec![1, 2]);
    }

    #[test]
    fn aging_keeps_order_sorted() {
        let mut q = PQueue::new("ready");
        q.insert(1, PRIO_MAX + 2);
        q.insert(2, PRIO_MAX);
        q.insert(3, PRIO_MAX - 1);
        q.age();
        assert_eq!(
            q.iter_with_prio().collect::<Vec<_>>(),
            vec![(1, PRIO_MAX + 2), (2, PRIO_MAX), (3, PRIO_MAX)]
        );
    }

    #[test]
    fn tail_and_drain() {
        let mut q = PQueue::new("new");
        q.insert(1, PRIO_MAX);
        q.insert(2, PRIO_STD);
        q.insert(3, PRIO_STD);
        assert_eq!(q.pop_tail(), Some(3));
        assert_eq!(q.drain_where(|t| t == 1), vec![1]);
        assert!(q.contains(2));
        assert_eq!(q.len(), 1);
    }
}
