// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 802.11 sequence-number arithmetic and the per-aggregate sequence bitmap.
//!
//! Sequence numbers occupy a 12-bit modular space. An aggregate covers at
//! most 256 consecutive sequence numbers, tracked as a 256-bit bitmap whose
//! bit `i` corresponds to sequence number `start_seq + i` (mod 4096).

/// Size of the 12-bit sequence-number space.
pub const SEQ_MAX: u16 = 4096;

/// Number of `u32` words in a 256-bit sequence bitmap.
pub const BITMAP_WORDS: usize = 8;

/// Number of sequence slots covered by one bitmap.
pub const BITMAP_BITS: usize = BITMAP_WORDS * 32;

/// Signed smallest-magnitude distance from `base` to `seq` in the 12-bit
/// modular space. Positive when `seq` is ahead of `base`.
pub fn seq_delta(base: u16, seq: u16) -> i32 {
    let fwd = seq.wrapping_sub(base) & (SEQ_MAX - 1);
    if fwd > SEQ_MAX / 2 {
        i32::from(fwd) - i32::from(SEQ_MAX)
    } else {
        i32::from(fwd)
    }
}

/// Offset of `seq` within a window beginning at `start_seq`, mod 4096.
pub fn seq_offset(start_seq: u16, seq: u16) -> usize {
    usize::from(seq.wrapping_sub(start_seq) & (SEQ_MAX - 1))
}

/// 256-bit bitmap over the sequence slots of one aggregate.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SeqBitmap([u32; BITMAP_WORDS]);

impl SeqBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words(words: [u32; BITMAP_WORDS]) -> Self {
        Self(words)
    }

    pub fn words(&self) -> &[u32; BITMAP_WORDS] {
        &self.0
    }

    pub fn get(&self, bit: usize) -> bool {
        bit < BITMAP_BITS && self.0[bit / 32] & (1 << (bit % 32)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        if bit < BITMAP_BITS {
            self.0[bit / 32] |= 1 << (bit % 32);
        }
    }

    pub fn clear(&mut self, bit: usize) {
        if bit < BITMAP_BITS {
            self.0[bit / 32] &= !(1 << (bit % 32));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    /// Index of the highest set bit, if any.
    pub fn highest_set_bit(&self) -> Option<usize> {
        for i in (0..BITMAP_WORDS).rev() {
            if self.0[i] != 0 {
                return Some(i * 32 + 31 - self.0[i].leading_zeros() as usize);
            }
        }
        None
    }

    /// Shift every bit toward higher indices by `n`, carrying across words.
    /// Bits shifted past index 255 are lost.
    pub fn shifted_up(&self, n: usize) -> Self {
        if n >= BITMAP_BITS {
            return Self::default();
        }
        let (word, bit) = (n / 32, n % 32);
        let mut out = [0u32; BITMAP_WORDS];
        for i in word..BITMAP_WORDS {
            let src = i - word;
            out[i] = self.0[src] << bit;
            if bit > 0 && src > 0 {
                out[i] |= self.0[src - 1] >> (32 - bit);
            }
        }
        Self(out)
    }

    /// Shift every bit toward lower indices by `n`, carrying across words.
    /// Bits shifted below index 0 are lost.
    pub fn shifted_down(&self, n: usize) -> Self {
        if n >= BITMAP_BITS {
            return Self::default();
        }
        let (word, bit) = (n / 32, n % 32);
        let mut out = [0u32; BITMAP_WORDS];
        for i in 0..BITMAP_WORDS - word {
            let src = i + word;
            out[i] = self.0[src] >> bit;
            if bit > 0 && src + 1 < BITMAP_WORDS {
                out[i] |= self.0[src + 1] << (32 - bit);
            }
        }
        Self(out)
    }

    pub fn and(&self, other: &Self) -> Self {
        let mut out = [0u32; BITMAP_WORDS];
        for i in 0..BITMAP_WORDS {
            out[i] = self.0[i] & other.0[i];
        }
        Self(out)
    }

    pub fn and_not(&self, other: &Self) -> Self {
        let mut out = [0u32; BITMAP_WORDS];
        for i in 0..BITMAP_WORDS {
            out[i] = self.0[i] & !other.0[i];
        }
        Self(out)
    }
}

impl std::fmt::Debug for SeqBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SeqBitmap[")?;
        for w in self.0.iter().rev() {
            write!(f, "{:08x}", w)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_from_bits(bits: &[usize]) -> SeqBitmap {
        let mut b = SeqBitmap::new();
        for &i in bits {
            b.set(i);
        }
        b
    }

    #[test]
    fn delta_simple() {
        assert_eq!(seq_delta(100, 104), 4);
        assert_eq!(seq_delta(104, 100), -4);
        assert_eq!(seq_delta(100, 100), 0);
    }

    #[test]
    fn delta_across_wraparound() {
        // 4094 -> 2 is four steps forward through the wrap.
        assert_eq!(seq_delta(4094, 2), 4);
        // 2 -> 4094 is four steps backward.
        assert_eq!(seq_delta(2, 4094), -4);
        assert_eq!(seq_delta(0, 4095), -1);
        assert_eq!(seq_delta(4095, 0), 1);
    }

    #[test]
    fn shift_up_within_word() {
        let b = bitmap_from_bits(&[0, 1, 3]);
        let s = b.shifted_up(4);
        assert_eq!(s, bitmap_from_bits(&[4, 5, 7]));
    }

    #[test]
    fn shift_carries_across_words() {
        let b = bitmap_from_bits(&[30, 31, 32, 65]);
        let up = b.shifted_up(3);
        assert_eq!(up, bitmap_from_bits(&[33, 34, 35, 68]));
        let down = b.shifted_down(3);
        assert_eq!(down, bitmap_from_bits(&[27, 28, 29, 62]));
    }

    #[test]
    fn shift_by_whole_words() {
        let b = bitmap_from_bits(&[0, 33, 200]);
        assert_eq!(b.shifted_up(64), bitmap_from_bits(&[64, 97]));
        assert_eq!(b.shifted_down(32), bitmap_from_bits(&[1, 168]));
    }

    #[test]
    fn shift_loses_overflow_bits() {
        let b = bitmap_from_bits(&[250, 255]);
        assert_eq!(b.shifted_up(10), SeqBitmap::new());
        let b = bitmap_from_bits(&[0, 5]);
        assert_eq!(b.shifted_down(6), SeqBitmap::new());
        assert!(b.shifted_up(BITMAP_BITS).is_empty());
    }

    #[test]
    fn shift_matches_per_bit_reference() {
        // Brute-force equivalence against a per-bit model for every shift.
        let b = bitmap_from_bits(&[0, 7, 31, 32, 63, 64, 100, 199, 255]);
        for n in 0..=BITMAP_BITS {
            let up = b.shifted_up(n);
            let down = b.shifted_down(n);
            for i in 0..BITMAP_BITS {
                assert_eq!(up.get(i), i >= n && b.get(i - n), "up {} bit {}", n, i);
                assert_eq!(down.get(i), i + n < BITMAP_BITS && b.get(i + n), "down {} bit {}", n, i);
            }
        }
    }

    #[test]
    fn highest_and_count() {
        assert_eq!(SeqBitmap::new().highest_set_bit(), None);
        assert_eq!(SeqBitmap::new().count_ones(), 0);
        let b = bitmap_from_bits(&[3, 64, 130]);
        assert_eq!(b.highest_set_bit(), Some(130));
        assert_eq!(b.count_ones(), 3);
    }

    #[test]
    fn combinators() {
        let a = bitmap_from_bits(&[1, 2, 3]);
        let b = bitmap_from_bits(&[2, 3, 4]);
        assert_eq!(a.and(&b), bitmap_from_bits(&[2, 3]));
        assert_eq!(a.and_not(&b), bitmap_from_bits(&[1]));
    }
}
