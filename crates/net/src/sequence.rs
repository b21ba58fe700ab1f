pub const DEFAULT_MAX_SEQUENCE: u32 = u32::MAX;

/// Half-range comparison over `[0, max_sequence]`: `s1` is more recent than
/// `s2` when it is ahead by at most half the sequence space.
#[inline]
pub fn sequence_more_recent(s1: u32, s2: u32, max_sequence: u32) -> bool {
    let half = max_sequence / 2;
    ((s1 > s2) && (s1 - s2 <= half)) || ((s2 > s1) && (s2 - s1 > half))
}

/// Bit position of `sequence` in an ack bitfield anchored at `ack`.
/// `sequence` must be older than `ack`.
#[inline]
pub fn bit_index_for_sequence(sequence: u32, ack: u32, max_sequence: u32) -> u32 {
    debug_assert_ne!(sequence, ack);
    debug_assert!(!sequence_more_recent(sequence, ack, max_sequence));

    if sequence > ack {
        // ack has wrapped past zero
        ack + (max_sequence - sequence)
    } else {
        ack - 1 - sequence
    }
}

#[inline]
pub fn next_sequence(sequence: u32, max_sequence: u32) -> u32 {
    if sequence >= max_sequence {
        0
    } else {
        sequence + 1
    }
}

/// `sequence - distance` modulo `max_sequence + 1`.
pub fn sequence_sub(sequence: u32, distance: u32, max_sequence: u32) -> u32 {
    let modulus = max_sequence as u64 + 1;
    let distance = distance as u64 % modulus;
    ((sequence as u64 + modulus - distance) % modulus) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 255;

    #[test]
    fn test_more_recent_plain() {
        assert!(sequence_more_recent(2, 1, MAX));
        assert!(!sequence_more_recent(1, 2, MAX));
        assert!(!sequence_more_recent(7, 7, MAX));
    }

    #[test]
    fn test_more_recent_wraps_at_boundary() {
        assert!(sequence_more_recent(0, 255, MAX));
        assert!(!sequence_more_recent(255, 0, MAX));
        assert!(sequence_more_recent(1, 255, MAX));
        assert!(!sequence_more_recent(255, 1, MAX));
    }

    #[test]
    fn test_more_recent_half_range_split() {
        assert!(sequence_more_recent(128, 1, MAX));
        assert!(!sequence_more_recent(1, 128, MAX));
        assert!(!sequence_more_recent(129, 1, MAX));
        assert!(sequence_more_recent(1, 129, MAX));
    }

    #[test]
    fn test_more_recent_full_u32_range() {
        let max = DEFAULT_MAX_SEQUENCE;
        assert!(sequence_more_recent(0, u32::MAX, max));
        assert!(!sequence_more_recent(u32::MAX, 0, max));
        assert!(sequence_more_recent(1000, 10, max));
    }

    #[test]
    fn test_bit_index_for_sequence() {
        assert_eq!(bit_index_for_sequence(99, 100, MAX), 0);
        assert_eq!(bit_index_for_sequence(90, 100, MAX), 9);
        assert_eq!(bit_index_for_sequence(0, 1, MAX), 0);
        assert_eq!(bit_index_for_sequence(255, 0, MAX), 0);
        assert_eq!(bit_index_for_sequence(255, 1, MAX), 1);
        assert_eq!(bit_index_for_sequence(254, 1, MAX), 2);
        assert_eq!(bit_index_for_sequence(254, 2, MAX), 3);
    }

    #[test]
    fn test_next_sequence_wraps() {
        assert_eq!(next_sequence(0, MAX), 1);
        assert_eq!(next_sequence(255, MAX), 0);
        assert_eq!(next_sequence(31, 31), 0);
        assert_eq!(next_sequence(u32::MAX, u32::MAX), 0);
    }

    #[test]
    fn test_sequence_sub_wraps() {
        assert_eq!(sequence_sub(40, 34, MAX), 6);
        assert_eq!(sequence_sub(10, 34, MAX), 232);
        assert_eq!(sequence_sub(5, 34, 31), 3);
        assert_eq!(sequence_sub(3, 34, u32::MAX), u32::MAX - 30);
    }
}
