use std::fmt;

/// A fixed-length bit vector over piece indices.
///
/// Bits are numbered from the high bit of the first byte, matching the
/// Bitfield message payload. The number of set bits is tracked so that
/// `true_count` is O(1).
#[derive(Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
    true_count: usize,
}

impl Bitfield {
    /// Creates a bitfield of `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
            true_count: 0,
        }
    }

    /// Creates a bitfield with every bit set.
    pub fn full(len: usize) -> Self {
        let mut bf = Self::new(len);
        bf.set_all(true);
        bf
    }

    /// Creates a bitfield from a packed payload.
    ///
    /// Short payloads are zero-padded and bits past `len` are ignored.
    pub fn from_bytes(data: &[u8], len: usize) -> Self {
        let byte_count = len.div_ceil(8);
        let mut bits = vec![0u8; byte_count];
        let copy = data.len().min(byte_count);
        bits[..copy].copy_from_slice(&data[..copy]);

        let mut bf = Self {
            bits,
            len,
            true_count: 0,
        };
        bf.clear_spare_bits();
        bf.recount();
        bf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn true_count(&self) -> usize {
        self.true_count
    }

    pub fn all_true(&self) -> bool {
        self.true_count == self.len
    }

    pub fn all_false(&self) -> bool {
        self.true_count == 0
    }

    /// Fraction of set bits, in the range 0.0..=100.0.
    pub fn percent_complete(&self) -> f64 {
        if self.len == 0 {
            return 100.0;
        }
        self.true_count as f64 * 100.0 / self.len as f64
    }

    /// Returns the bit at `index`; out of range reads as unset.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Sets or clears the bit at `index`. Out of range writes are ignored.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.len {
            return;
        }
        let mask = 0x80 >> (index % 8);
        let byte = &mut self.bits[index / 8];
        let was = *byte & mask != 0;
        if was == value {
            return;
        }
        if value {
            *byte |= mask;
            self.true_count += 1;
        } else {
            *byte &= !mask;
            self.true_count -= 1;
        }
    }

    /// Sets every bit in `start..=end` to `value`.
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        let end = end.min(self.len.saturating_sub(1));
        for index in start..=end {
            self.set(index, value);
        }
    }

    pub fn set_all(&mut self, value: bool) {
        let fill = if value { 0xFF } else { 0x00 };
        self.bits.iter_mut().for_each(|b| *b = fill);
        self.clear_spare_bits();
        self.recount();
    }

    /// `self &= other`. `other` is left untouched.
    pub fn and(&mut self, other: &Bitfield) -> &mut Self {
        self.zip_with(other, |a, b| a & b)
    }

    /// `self &= !other`.
    pub fn and_not(&mut self, other: &Bitfield) -> &mut Self {
        self.zip_with(other, |a, b| a & !b)
    }

    /// `self |= other`.
    pub fn or(&mut self, other: &Bitfield) -> &mut Self {
        self.zip_with(other, |a, b| a | b)
    }

    /// `self ^= other`.
    pub fn xor(&mut self, other: &Bitfield) -> &mut Self {
        self.zip_with(other, |a, b| a ^ b)
    }

    pub fn not(&mut self) -> &mut Self {
        self.bits.iter_mut().for_each(|b| *b = !*b);
        self.clear_spare_bits();
        self.recount();
        self
    }

    /// First set bit in `start..end`.
    pub fn first_true(&self, start: usize, end: usize) -> Option<usize> {
        (start..end.min(self.len)).find(|&i| self.get(i))
    }

    /// First cleared bit in `start..end`.
    pub fn first_false(&self, start: usize, end: usize) -> Option<usize> {
        (start..end.min(self.len)).find(|&i| !self.get(i))
    }

    /// Iterates over the indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    /// Number of bytes in the packed form.
    pub fn length_in_bytes(&self) -> usize {
        self.bits.len()
    }

    /// The packed form, spare bits zeroed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn zip_with(&mut self, other: &Bitfield, op: impl Fn(u8, u8) -> u8) -> &mut Self {
        for (i, byte) in self.bits.iter_mut().enumerate() {
            let rhs = other.bits.get(i).copied().unwrap_or(0);
            *byte = op(*byte, rhs);
        }
        self.clear_spare_bits();
        self.recount();
        self
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.len;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }

    fn recount(&mut self) {
        self.true_count = self.bits.iter().map(|b| b.count_ones() as usize).sum();
    }
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitfield({}/{} ", self.true_count, self.len)?;
        for i in 0..self.len.min(64) {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        if self.len > 64 {
            f.write_str("..")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bitfield {
        // 1010 1011 1001
        let mut bf = Bitfield::new(12);
        for (i, bit) in [1, 0, 1, 0, 1, 0, 1, 1, 1, 0, 0, 1].iter().enumerate() {
            bf.set(i, *bit == 1);
        }
        bf
    }

    #[test]
    fn test_new_is_clear() {
        let bf = Bitfield::new(100);
        assert_eq!(bf.len(), 100);
        assert_eq!(bf.length_in_bytes(), 13);
        assert!(bf.all_false());
        assert!(!bf.get(0));
    }

    #[test]
    fn test_set_maintains_true_count() {
        let mut bf = Bitfield::new(20);
        bf.set(3, true);
        bf.set(3, true);
        bf.set(19, true);
        assert_eq!(bf.true_count(), 2);

        bf.set(3, false);
        bf.set(3, false);
        assert_eq!(bf.true_count(), 1);

        bf.set(20, true);
        assert_eq!(bf.true_count(), 1);
        assert!(!bf.get(20));
    }

    #[test]
    fn test_byte_roundtrip() {
        let bf = sample();
        assert_eq!(bf.as_bytes(), &[171, 144]);
        assert_eq!(bf.true_count(), 7);

        let decoded = Bitfield::from_bytes(&[171, 144], 12);
        assert_eq!(decoded, bf);
    }

    #[test]
    fn test_from_bytes_ignores_trailing_bits() {
        let bf = Bitfield::from_bytes(&[0xFF, 0xFF], 12);
        assert_eq!(bf.true_count(), 12);
        assert_eq!(bf.as_bytes(), &[0xFF, 0xF0]);
    }

    #[test]
    fn test_from_bytes_pads_short_payload() {
        let bf = Bitfield::from_bytes(&[0x80], 20);
        assert_eq!(bf.length_in_bytes(), 3);
        assert!(bf.get(0));
        assert_eq!(bf.true_count(), 1);
    }

    #[test]
    fn test_full_and_not() {
        let mut bf = Bitfield::full(10);
        assert!(bf.all_true());
        assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);

        bf.not();
        assert!(bf.all_false());
        assert_eq!(bf.as_bytes(), &[0x00, 0x00]);
    }

    #[test]
    fn test_and_leaves_operand_untouched() {
        let mut a = sample();
        let b = Bitfield::full(12);
        let snapshot = b.clone();

        a.and(&b);
        assert_eq!(b, snapshot);
        assert_eq!(a, sample());

        let mut c = Bitfield::new(12);
        c.and(&snapshot);
        assert!(c.all_false());
    }

    #[test]
    fn test_or_and_xor() {
        let mut a = sample();
        let mut mask = Bitfield::new(12);
        mask.set(1, true);
        mask.set(2, true);

        a.or(&mask);
        assert!(a.get(1));
        assert_eq!(a.true_count(), 8);

        a.xor(&mask);
        assert!(!a.get(1));
        assert!(!a.get(2));
        assert_eq!(a.true_count(), 6);
        assert_eq!(mask.true_count(), 2);
    }

    #[test]
    fn test_and_not() {
        let mut a = Bitfield::full(8);
        let mut have = Bitfield::new(8);
        have.set(0, true);
        have.set(7, true);

        a.and_not(&have);
        assert_eq!(a.true_count(), 6);
        assert!(!a.get(0));
        assert!(a.get(1));
    }

    #[test]
    fn test_first_true_and_first_false() {
        let bf = sample();
        assert_eq!(bf.first_true(0, 12), Some(0));
        assert_eq!(bf.first_true(1, 12), Some(2));
        assert_eq!(bf.first_false(6, 12), Some(9));
        assert_eq!(bf.first_true(9, 11), None);
        assert_eq!(Bitfield::full(5).first_false(0, 5), None);
    }

    #[test]
    fn test_set_range() {
        let mut bf = Bitfield::new(16);
        bf.set_range(3, 6, true);
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![3, 4, 5, 6]);

        bf.set_range(10, 100, true);
        assert_eq!(bf.true_count(), 10);
    }
}
