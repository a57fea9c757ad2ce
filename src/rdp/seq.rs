// Sequence numbers are 32 bit and wrap, so they are compared by the sign of
// their difference. Only meaningful for windows smaller than 2^31.

// true if seq1 < seq2
pub fn precedes(seq1: u32, seq2: u32) -> bool {
    (seq2.wrapping_sub(seq1) as i32) > 0
}

// number of steps from seq1 forward to seq2
pub fn distance(seq1: u32, seq2: u32) -> u32 {
    seq2.wrapping_sub(seq1)
}

// true if seq1 <= seq2
pub fn seq_less_equal(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || precedes(seq1, seq2)
}

// true if min <= target <= max
pub fn seq_in_range(min: u32, max: u32, target: u32) -> bool {
    distance(min, target) <= distance(min, max)
}
