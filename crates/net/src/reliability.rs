use crate::queue::{PacketQueue, PacketRecord};
use crate::sequence::{
    DEFAULT_MAX_SEQUENCE, bit_index_for_sequence, next_sequence, sequence_more_recent,
    sequence_sub,
};
use crate::stats::LinkStats;

/// Number of most recent received sequences kept for ack bit generation.
const RECEIVED_WINDOW: u32 = 34;
const DEFAULT_RTT_MAXIMUM: f32 = 1.0;
const RTT_SMOOTHING: f32 = 0.1;
const QUEUE_EPSILON: f32 = 0.001;

/// Ack bitfield for everything in `received` older than `ack`.
pub fn generate_ack_bits(ack: u32, received: &PacketQueue, max_sequence: u32) -> u32 {
    let mut ack_bits = 0u32;

    for record in received {
        if record.sequence == ack || sequence_more_recent(record.sequence, ack, max_sequence) {
            break;
        }
        let bit_index = bit_index_for_sequence(record.sequence, ack, max_sequence);
        if bit_index <= 31 {
            ack_bits |= 1 << bit_index;
        }
    }

    ack_bits
}

/// Moves every record of `pending` acknowledged by `(ack, ack_bits)` into
/// `acked`. Returns the acknowledged records in the order they were pending.
pub fn process_ack(
    ack: u32,
    ack_bits: u32,
    pending: &mut PacketQueue,
    acked: &mut PacketQueue,
    max_sequence: u32,
) -> Vec<PacketRecord> {
    let newly_acked = pending.extract_if(|record| {
        if record.sequence == ack {
            return true;
        }
        if sequence_more_recent(record.sequence, ack, max_sequence) {
            return false;
        }
        let bit_index = bit_index_for_sequence(record.sequence, ack, max_sequence);
        bit_index <= 31 && (ack_bits >> bit_index) & 1 == 1
    });

    for record in &newly_acked {
        acked.insert_sorted(*record, max_sequence);
    }

    newly_acked
}

/// Sequence numbering, acknowledgement bookkeeping and link statistics for
/// one peer. Loss is detected only by pending-ack timeout.
#[derive(Debug)]
pub struct ReliabilitySystem {
    max_sequence: u32,
    local_sequence: u32,
    remote_sequence: u32,

    sent_packets: u32,
    recv_packets: u32,
    lost_packets: u32,
    acked_packets: u32,

    sent_bandwidth: f32,
    acked_bandwidth: f32,
    rtt: f32,
    rtt_maximum: f32,

    acks: Vec<u32>,

    sent_queue: PacketQueue,
    pending_ack_queue: PacketQueue,
    received_queue: PacketQueue,
    acked_queue: PacketQueue,
}

impl Default for ReliabilitySystem {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEQUENCE)
    }
}

impl ReliabilitySystem {
    pub fn new(max_sequence: u32) -> Self {
        Self {
            max_sequence,
            local_sequence: 0,
            remote_sequence: 0,
            sent_packets: 0,
            recv_packets: 0,
            lost_packets: 0,
            acked_packets: 0,
            sent_bandwidth: 0.0,
            acked_bandwidth: 0.0,
            rtt: 0.0,
            rtt_maximum: DEFAULT_RTT_MAXIMUM,
            acks: Vec::new(),
            sent_queue: PacketQueue::new(),
            pending_ack_queue: PacketQueue::new(),
            received_queue: PacketQueue::new(),
            acked_queue: PacketQueue::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self {
            rtt_maximum: self.rtt_maximum,
            ..Self::new(self.max_sequence)
        };
    }

    pub fn packet_sent(&mut self, size: usize) {
        debug_assert!(!self.sent_queue.exists(self.local_sequence));
        debug_assert!(!self.pending_ack_queue.exists(self.local_sequence));

        let record = PacketRecord::new(self.local_sequence, 0.0, size);
        self.sent_queue.insert_sorted(record, self.max_sequence);
        self.pending_ack_queue.insert_sorted(record, self.max_sequence);

        self.sent_packets = self.sent_packets.wrapping_add(1);
        self.local_sequence = next_sequence(self.local_sequence, self.max_sequence);
    }

    /// Sequences above `max_sequence` are ignored.
    pub fn packet_received(&mut self, sequence: u32, size: usize) {
        if sequence > self.max_sequence {
            return;
        }
        self.recv_packets = self.recv_packets.wrapping_add(1);

        if self.received_queue.exists(sequence) {
            return;
        }

        self.received_queue
            .insert_sorted(PacketRecord::new(sequence, 0.0, size), self.max_sequence);

        if sequence_more_recent(sequence, self.remote_sequence, self.max_sequence) {
            self.remote_sequence = sequence;
        }
    }

    pub fn generate_ack_bits(&self) -> u32 {
        generate_ack_bits(self.remote_sequence, &self.received_queue, self.max_sequence)
    }

    pub fn process_ack(&mut self, ack: u32, ack_bits: u32) {
        if ack > self.max_sequence || self.pending_ack_queue.is_empty() {
            return;
        }

        let newly_acked = process_ack(
            ack,
            ack_bits,
            &mut self.pending_ack_queue,
            &mut self.acked_queue,
            self.max_sequence,
        );

        for record in newly_acked {
            self.rtt += (record.time - self.rtt) * RTT_SMOOTHING;
            self.acks.push(record.sequence);
            self.acked_packets = self.acked_packets.wrapping_add(1);
        }
    }

    pub fn update(&mut self, dt: f32) {
        self.acks.clear();
        self.advance_queue_time(dt);
        self.update_queues();
        self.update_stats();

        if cfg!(debug_assertions) {
            self.validate();
        }
    }

    fn advance_queue_time(&mut self, dt: f32) {
        self.sent_queue.advance_time(dt);
        self.received_queue.advance_time(dt);
        self.pending_ack_queue.advance_time(dt);
        self.acked_queue.advance_time(dt);
    }

    fn update_queues(&mut self) {
        while self
            .sent_queue
            .front()
            .is_some_and(|r| r.time > self.rtt_maximum + QUEUE_EPSILON)
        {
            self.sent_queue.pop_front();
        }

        if let Some(latest) = self.received_queue.back().map(|r| r.sequence) {
            let minimum_sequence = sequence_sub(latest, RECEIVED_WINDOW, self.max_sequence);
            while self.received_queue.front().is_some_and(|r| {
                !sequence_more_recent(r.sequence, minimum_sequence, self.max_sequence)
            }) {
                self.received_queue.pop_front();
            }
        }

        while self
            .acked_queue
            .front()
            .is_some_and(|r| r.time > self.rtt_maximum * 2.0 - QUEUE_EPSILON)
        {
            self.acked_queue.pop_front();
        }

        while self
            .pending_ack_queue
            .front()
            .is_some_and(|r| r.time > self.rtt_maximum + QUEUE_EPSILON)
        {
            self.pending_ack_queue.pop_front();
            self.lost_packets = self.lost_packets.wrapping_add(1);
        }
    }

    fn update_stats(&mut self) {
        let sent_bytes: usize = self.sent_queue.iter().map(|r| r.size).sum();
        let acked_bytes: usize = self
            .acked_queue
            .iter()
            .filter(|r| r.time >= self.rtt_maximum)
            .map(|r| r.size)
            .sum();

        let sent_bytes_per_second = sent_bytes as f32 / self.rtt_maximum;
        let acked_bytes_per_second = acked_bytes as f32 / self.rtt_maximum;

        self.sent_bandwidth = sent_bytes_per_second * (8.0 / 1000.0);
        self.acked_bandwidth = acked_bytes_per_second * (8.0 / 1000.0);
    }

    fn validate(&self) {
        debug_assert!(self.sent_queue.len() <= self.max_sequence as usize + 1);
        debug_assert!(self.received_queue.len() <= RECEIVED_WINDOW as usize + 1);
        debug_assert!(self.pending_ack_queue.verify_sorted(self.max_sequence));
    }

    pub fn acks(&self) -> &[u32] {
        &self.acks
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn max_sequence(&self) -> u32 {
        self.max_sequence
    }

    pub fn sent_packets(&self) -> u32 {
        self.sent_packets
    }

    pub fn received_packets(&self) -> u32 {
        self.recv_packets
    }

    pub fn lost_packets(&self) -> u32 {
        self.lost_packets
    }

    pub fn acked_packets(&self) -> u32 {
        self.acked_packets
    }

    pub fn sent_bandwidth(&self) -> f32 {
        self.sent_bandwidth
    }

    pub fn acked_bandwidth(&self) -> f32 {
        self.acked_bandwidth
    }

    pub fn round_trip_time(&self) -> f32 {
        self.rtt
    }

    pub fn rtt_maximum(&self) -> f32 {
        self.rtt_maximum
    }

    pub fn set_rtt_maximum(&mut self, rtt_maximum: f32) {
        self.rtt_maximum = rtt_maximum.max(QUEUE_EPSILON);
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_ack_queue.len()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats::from_counters(
            self.sent_packets,
            self.recv_packets,
            self.lost_packets,
            self.acked_packets,
            self.rtt,
            self.sent_bandwidth,
            self.acked_bandwidth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 255;

    fn queue_of(sequences: impl IntoIterator<Item = u32>) -> PacketQueue {
        let mut queue = PacketQueue::new();
        for seq in sequences {
            queue.insert_sorted(PacketRecord::new(seq, 0.0, 0), MAX);
        }
        queue
    }

    fn sequences(queue: &PacketQueue) -> Vec<u32> {
        queue.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn test_generate_ack_bits() {
        let received = queue_of(0..32);
        assert_eq!(generate_ack_bits(32, &received, MAX), 0xFFFF_FFFF);
        assert_eq!(generate_ack_bits(31, &received, MAX), 0x7FFF_FFFF);
        assert_eq!(generate_ack_bits(33, &received, MAX), 0xFFFF_FFFE);
        assert_eq!(generate_ack_bits(16, &received, MAX), 0x0000_FFFF);
        assert_eq!(generate_ack_bits(48, &received, MAX), 0xFFFF_0000);
    }

    #[test]
    fn test_generate_ack_bits_with_wrap() {
        let received = queue_of(224..=255);
        assert_eq!(received.len(), 32);
        assert_eq!(generate_ack_bits(0, &received, MAX), 0xFFFF_FFFF);
        assert_eq!(generate_ack_bits(255, &received, MAX), 0x7FFF_FFFF);
        assert_eq!(generate_ack_bits(1, &received, MAX), 0xFFFF_FFFE);
        assert_eq!(generate_ack_bits(240, &received, MAX), 0x0000_FFFF);
        assert_eq!(generate_ack_bits(16, &received, MAX), 0xFFFF_0000);
    }

    #[test]
    fn test_process_ack_all() {
        let mut pending = queue_of(0..33);
        let mut acked = PacketQueue::new();

        let newly_acked = process_ack(32, 0xFFFF_FFFF, &mut pending, &mut acked, MAX);

        assert_eq!(newly_acked.len(), 33);
        assert_eq!(acked.len(), 33);
        assert!(pending.is_empty());
        assert!(acked.verify_sorted(MAX));
        assert_eq!(
            newly_acked.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            (0..33).collect::<Vec<_>>()
        );
        assert_eq!(sequences(&acked), (0..33).collect::<Vec<_>>());
    }

    #[test]
    fn test_process_ack_lower_half() {
        let mut pending = queue_of(0..33);
        let mut acked = PacketQueue::new();

        let newly_acked = process_ack(32, 0x0000_FFFF, &mut pending, &mut acked, MAX);

        assert_eq!(newly_acked.len(), 17);
        assert_eq!(pending.len(), 33 - 17);
        assert!(acked.verify_sorted(MAX));
        assert_eq!(sequences(&pending), (0..16).collect::<Vec<_>>());
        assert_eq!(sequences(&acked), (16..33).collect::<Vec<_>>());
    }

    #[test]
    fn test_process_ack_upper_half() {
        let mut pending = queue_of(0..32);
        let mut acked = PacketQueue::new();

        let newly_acked = process_ack(48, 0xFFFF_0000, &mut pending, &mut acked, MAX);

        assert_eq!(newly_acked.len(), 16);
        assert_eq!(sequences(&pending), (0..16).collect::<Vec<_>>());
        assert_eq!(sequences(&acked), (16..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_process_ack_wrap_all() {
        let mut pending = queue_of((224..=256).map(|s| s & 0xFF));
        assert_eq!(pending.len(), 33);
        assert!(pending.verify_sorted(MAX));
        let mut acked = PacketQueue::new();

        let newly_acked = process_ack(0, 0xFFFF_FFFF, &mut pending, &mut acked, MAX);

        assert_eq!(newly_acked.len(), 33);
        assert!(pending.is_empty());
        assert!(acked.verify_sorted(MAX));
        let expected: Vec<u32> = (0..33).map(|i| (i + 224) & 0xFF).collect();
        assert_eq!(
            newly_acked.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            expected
        );
        assert_eq!(sequences(&acked), expected);
    }

    #[test]
    fn test_process_ack_wrap_lower_half() {
        let mut pending = queue_of((224..=256).map(|s| s & 0xFF));
        let mut acked = PacketQueue::new();

        let newly_acked = process_ack(0, 0x0000_FFFF, &mut pending, &mut acked, MAX);

        assert_eq!(newly_acked.len(), 17);
        assert_eq!(sequences(&pending), (224..240).collect::<Vec<_>>());
        let expected: Vec<u32> = (0..17).map(|i| (i + 240) & 0xFF).collect();
        assert_eq!(sequences(&acked), expected);
    }

    #[test]
    fn test_process_ack_wrap_upper_half() {
        let mut pending = queue_of(224..=255);
        let mut acked = PacketQueue::new();

        let newly_acked = process_ack(16, 0xFFFF_0000, &mut pending, &mut acked, MAX);

        assert_eq!(newly_acked.len(), 16);
        assert_eq!(sequences(&pending), (224..240).collect::<Vec<_>>());
        assert_eq!(sequences(&acked), (240..=255).collect::<Vec<_>>());
    }

    #[test]
    fn test_packet_sent_advances_and_wraps() {
        let mut system = ReliabilitySystem::new(3);
        for _ in 0..3 {
            system.packet_sent(10);
        }
        assert_eq!(system.local_sequence(), 3);
        system.update(2.0);
        system.packet_sent(10);
        assert_eq!(system.local_sequence(), 0);
        assert_eq!(system.sent_packets(), 4);
    }

    #[test]
    fn test_packet_received_tracks_remote_sequence() {
        let mut system = ReliabilitySystem::new(MAX);
        system.packet_received(5, 10);
        system.packet_received(3, 10);
        system.packet_received(5, 10);

        assert_eq!(system.remote_sequence(), 5);
        assert_eq!(system.received_packets(), 3);
        assert_eq!(system.generate_ack_bits(), 0b10);
    }

    #[test]
    fn test_ack_updates_rtt_and_acks() {
        let mut system = ReliabilitySystem::new(MAX);
        system.packet_sent(32);
        system.packet_sent(32);
        system.update(0.1);

        system.process_ack(1, 0b1);

        assert_eq!(system.acks(), &[0, 1]);
        assert_eq!(system.acked_packets(), 2);
        assert_eq!(system.pending_ack_count(), 0);
        assert!(system.round_trip_time() > 0.0);

        system.update(0.0);
        assert!(system.acks().is_empty());
    }

    #[test]
    fn test_loss_only_on_pending_timeout() {
        let mut system = ReliabilitySystem::new(MAX);
        for _ in 0..4 {
            system.packet_sent(32);
        }

        // gaps in the bitfield are not treated as loss
        system.process_ack(3, 0b010);
        assert_eq!(system.lost_packets(), 0);
        assert_eq!(system.pending_ack_count(), 2);

        system.update(0.5);
        assert_eq!(system.lost_packets(), 0);

        system.update(0.6);
        assert_eq!(system.lost_packets(), 2);
        assert_eq!(system.pending_ack_count(), 0);
    }

    #[test]
    fn test_received_queue_keeps_recent_window() {
        let mut system = ReliabilitySystem::new(MAX);
        for seq in 0..100 {
            system.packet_received(seq, 0);
        }
        system.update(0.0);

        assert!(system.received_queue.len() <= RECEIVED_WINDOW as usize);
        assert_eq!(system.received_queue.back().map(|r| r.sequence), Some(99));
        assert_eq!(system.generate_ack_bits(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_bandwidth_stats() {
        let mut system = ReliabilitySystem::new(MAX);
        for _ in 0..10 {
            system.packet_sent(100);
        }
        system.update(0.5);

        // 1000 bytes over a one second window
        assert!((system.sent_bandwidth() - 8.0).abs() < 0.001);
        assert_eq!(system.acked_bandwidth(), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut system = ReliabilitySystem::new(MAX);
        system.packet_sent(10);
        system.packet_received(4, 10);
        system.reset();

        assert_eq!(system.local_sequence(), 0);
        assert_eq!(system.remote_sequence(), 0);
        assert_eq!(system.sent_packets(), 0);
        assert_eq!(system.pending_ack_count(), 0);
        assert_eq!(system.max_sequence(), MAX);
    }

    #[test]
    fn test_sequences_outside_space_are_ignored() {
        let mut system = ReliabilitySystem::new(31);
        system.packet_received(4, 10);
        system.packet_received(5, 10);
        system.packet_received(1000, 10);

        assert_eq!(system.remote_sequence(), 5);
        assert_eq!(system.received_packets(), 2);
        assert_eq!(system.generate_ack_bits(), 1);

        system.packet_sent(10);
        system.process_ack(1000, 0xFFFF_FFFF);
        assert_eq!(system.pending_ack_count(), 1);
        assert!(system.acks().is_empty());
    }
}
