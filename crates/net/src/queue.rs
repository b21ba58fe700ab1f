use std::collections::VecDeque;
use std::collections::vec_deque;

use crate::sequence::sequence_more_recent;

/// Bookkeeping for one packet. No payload is kept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketRecord {
    pub sequence: u32,
    /// Seconds since the record was queued.
    pub time: f32,
    pub size: usize,
}

impl PacketRecord {
    pub fn new(sequence: u32, time: f32, size: usize) -> Self {
        Self {
            sequence,
            time,
            size,
        }
    }
}

/// Records ordered oldest to most recent under wrapping sequence comparison.
#[derive(Debug, Clone, Default)]
pub struct PacketQueue {
    records: VecDeque<PacketRecord>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, sequence: u32) -> bool {
        self.records.iter().any(|r| r.sequence == sequence)
    }

    pub fn insert_sorted(&mut self, record: PacketRecord, max_sequence: u32) {
        let Some(back) = self.records.back() else {
            self.records.push_back(record);
            return;
        };

        if sequence_more_recent(record.sequence, back.sequence, max_sequence) {
            self.records.push_back(record);
            return;
        }

        if let Some(front) = self.records.front() {
            if !sequence_more_recent(record.sequence, front.sequence, max_sequence) {
                self.records.push_front(record);
                return;
            }
        }

        debug_assert!(!self.exists(record.sequence));

        let position = self
            .records
            .iter()
            .rposition(|r| !sequence_more_recent(r.sequence, record.sequence, max_sequence))
            .map_or(0, |index| index + 1);
        self.records.insert(position, record);
    }

    pub fn verify_sorted(&self, max_sequence: u32) -> bool {
        self.records
            .iter()
            .zip(self.records.iter().skip(1))
            .all(|(earlier, later)| {
                sequence_more_recent(later.sequence, earlier.sequence, max_sequence)
            })
    }

    /// Removes records matching `predicate`, returning them oldest first.
    pub fn extract_if<F>(&mut self, mut predicate: F) -> Vec<PacketRecord>
    where
        F: FnMut(&PacketRecord) -> bool,
    {
        let mut extracted = Vec::new();
        self.records.retain(|record| {
            if predicate(record) {
                extracted.push(*record);
                false
            } else {
                true
            }
        });
        extracted
    }

    pub fn advance_time(&mut self, dt: f32) {
        for record in &mut self.records {
            record.time += dt;
        }
    }

    pub fn front(&self) -> Option<&PacketRecord> {
        self.records.front()
    }

    pub fn back(&self) -> Option<&PacketRecord> {
        self.records.back()
    }

    pub fn pop_front(&mut self) -> Option<PacketRecord> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, PacketRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a PacketQueue {
    type Item = &'a PacketRecord;
    type IntoIter = vec_deque::Iter<'a, PacketRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 255;

    fn sequences(queue: &PacketQueue) -> Vec<u32> {
        queue.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn test_insert_in_order() {
        let mut queue = PacketQueue::new();
        for seq in 0..100 {
            queue.insert_sorted(PacketRecord::new(seq, 0.0, 0), MAX);
            assert!(queue.verify_sorted(MAX));
        }
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_insert_out_of_order() {
        let mut queue = PacketQueue::new();
        for seq in [5, 1, 9, 3, 7, 0, 8, 2, 6, 4] {
            queue.insert_sorted(PacketRecord::new(seq, 0.0, 0), MAX);
            assert!(queue.verify_sorted(MAX));
        }
        assert_eq!(sequences(&queue), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_insert_across_wrap() {
        let mut queue = PacketQueue::new();
        for seq in [250, 2, 255, 0, 252, 1, 251, 254, 253] {
            queue.insert_sorted(PacketRecord::new(seq, 0.0, 0), MAX);
            assert!(queue.verify_sorted(MAX));
        }
        assert_eq!(
            sequences(&queue),
            vec![250, 251, 252, 253, 254, 255, 0, 1, 2]
        );
    }

    #[test]
    fn test_exists() {
        let mut queue = PacketQueue::new();
        queue.insert_sorted(PacketRecord::new(10, 0.0, 0), MAX);
        queue.insert_sorted(PacketRecord::new(12, 0.0, 0), MAX);

        assert!(queue.exists(10));
        assert!(!queue.exists(11));
        assert!(queue.exists(12));
    }

    #[test]
    fn test_extract_if_preserves_order() {
        let mut queue = PacketQueue::new();
        for seq in 0..10 {
            queue.insert_sorted(PacketRecord::new(seq, 0.0, 0), MAX);
        }

        let even = queue.extract_if(|r| r.sequence % 2 == 0);
        assert_eq!(
            even.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![0, 2, 4, 6, 8]
        );
        assert_eq!(sequences(&queue), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_advance_time() {
        let mut queue = PacketQueue::new();
        queue.insert_sorted(PacketRecord::new(0, 0.0, 10), MAX);
        queue.insert_sorted(PacketRecord::new(1, 0.5, 10), MAX);
        queue.advance_time(0.25);

        let times: Vec<f32> = queue.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![0.25, 0.75]);
    }
}
