//! Allele mismatch counts between a haplotype pair and a genotype.
//!
//! For each 64-bit word, with genotype planes `s1`, `s2`, presence `m` and haplotype
//! words `a`, `b`:
//!
//! ```text
//! mask = ((a ^ s2) | (b ^ s1)) & m
//! dist = popcount((a ^ s1) & mask) + popcount((b ^ s2) & mask)
//! ```
//!
//! which equals `|a + b - g|` summed over the non-missing markers.

use super::{Genotype, Haplotype};
use crate::config::{N_WORDS, WORD_BITS};

pub trait PopCount {
    fn popcount(word: u64) -> u32;
}

/// Bit-parallel reference population count.
pub struct Portable;

impl PopCount for Portable {
    #[inline]
    fn popcount(word: u64) -> u32 {
        let mut v = word;
        v -= (v >> 1) & 0x5555_5555_5555_5555;
        v = (v & 0x3333_3333_3333_3333) + ((v >> 2) & 0x3333_3333_3333_3333);
        (((v + (v >> 4)) & 0x0F0F_0F0F_0F0F_0F0F).wrapping_mul(0x0101_0101_0101_0101) >> 56) as u32
    }
}

/// Population count through the compiler intrinsic (POPCNT where the target has it).
pub struct Native;

impl PopCount for Native {
    #[inline]
    fn popcount(word: u64) -> u32 {
        word.count_ones()
    }
}

#[inline]
fn n_words(len: usize) -> usize {
    (len + WORD_BITS - 1) / WORD_BITS
}

/// Mask of the valid bits in word `w` of a `len`-bit panel.
#[inline]
fn word_mask(w: usize, len: usize) -> u64 {
    let remaining = len - w * WORD_BITS;
    if remaining >= WORD_BITS {
        !0
    } else {
        !(!0u64 << remaining)
    }
}

#[inline]
fn word_distance<P: PopCount>(a: u64, b: u64, s1: u64, s2: u64, m: u64) -> u32 {
    let mask = ((a ^ s2) | (b ^ s1)) & m;
    P::popcount((a ^ s1) & mask) + P::popcount((b ^ s2) & mask)
}

pub fn hamming_distance_with<P: PopCount>(
    len: usize,
    h1: &Haplotype,
    h2: &Haplotype,
    genotype: &Genotype,
) -> u32 {
    debug_assert!(n_words(len) <= N_WORDS);
    let (s1, s2, present) = genotype.planes();
    let (s1, s2, present) = (s1.words(), s2.words(), present.words());
    let (a, b) = (h1.bits.words(), h2.bits.words());
    (0..n_words(len))
        .map(|w| {
            word_distance::<P>(a[w], b[w], s1[w], s2[w], present[w] & word_mask(w, len))
        })
        .sum()
}

#[inline]
pub fn hamming_distance(len: usize, h1: &Haplotype, h2: &Haplotype, genotype: &Genotype) -> u32 {
    hamming_distance_with::<Native>(len, h1, h2, genotype)
}

/// Distances of `h1` paired with each of the eight haplotypes `h2[..8]`.
pub fn hamming_distance8_with<P: PopCount>(
    len: usize,
    h1: &Haplotype,
    h2: &[Haplotype],
    genotype: &Genotype,
) -> [u32; 8] {
    debug_assert!(h2.len() >= 8);
    let (s1, s2, present) = genotype.planes();
    let (s1, s2, present) = (s1.words(), s2.words(), present.words());
    let a = h1.bits.words();
    let mut out = [0u32; 8];
    for w in 0..n_words(len) {
        let m = present[w] & word_mask(w, len);
        let (aw, s1w, s2w) = (a[w], s1[w], s2[w]);
        for (dist, other) in out.iter_mut().zip(&h2[..8]) {
            *dist += word_distance::<P>(aw, other.bits.words()[w], s1w, s2w, m);
        }
    }
    out
}

#[inline]
pub fn hamming_distance8(
    len: usize,
    h1: &Haplotype,
    h2: &[Haplotype],
    genotype: &Genotype,
) -> [u32; 8] {
    hamming_distance8_with::<Native>(len, h1, h2, genotype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_MARKERS;
    use rand::prelude::*;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn random_haplotype(rng: &mut Xoshiro256PlusPlus, len: usize) -> Haplotype {
        let bits: String = (0..len)
            .map(|_| if rng.gen::<bool>() { '1' } else { '0' })
            .collect();
        Haplotype::from_bit_string(&bits, 0.0).unwrap()
    }

    fn random_genotype(rng: &mut Xoshiro256PlusPlus, len: usize) -> Genotype {
        let calls: String = (0..len)
            .map(|_| match rng.gen_range(0..4) {
                0 => '0',
                1 => '1',
                2 => '2',
                _ => '?',
            })
            .collect();
        Genotype::from_call_string(&calls).unwrap()
    }

    fn naive_distance(len: usize, h1: &Haplotype, h2: &Haplotype, g: &Genotype) -> u32 {
        (0..len)
            .filter_map(|i| {
                g.call(i).map(|call| {
                    let sum = (h1.allele(i) + h2.allele(i)) as i32;
                    (sum - call as i32).abs() as u32
                })
            })
            .sum()
    }

    #[test]
    fn portable_popcount_matches_native() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        for word in [0u64, 1, !0, 0x8000_0000_0000_0001].iter() {
            assert_eq!(Portable::popcount(*word), Native::popcount(*word));
        }
        for _ in 0..10_000 {
            let word: u64 = rng.gen();
            assert_eq!(Portable::popcount(word), Native::popcount(word));
        }
    }

    #[test]
    fn kernels_agree_with_naive_count() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        for &len in [0, 1, 7, 63, 64, 65, 100, MAX_MARKERS].iter() {
            for _ in 0..50 {
                let h1 = random_haplotype(&mut rng, MAX_MARKERS);
                let h2 = random_haplotype(&mut rng, MAX_MARKERS);
                let g = random_genotype(&mut rng, MAX_MARKERS);
                let expected = naive_distance(len, &h1, &h2, &g);
                assert_eq!(hamming_distance_with::<Portable>(len, &h1, &h2, &g), expected);
                assert_eq!(hamming_distance_with::<Native>(len, &h1, &h2, &g), expected);
            }
        }
    }

    #[test]
    fn batched_kernel_matches_single() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        for &len in [1, 64, 77, MAX_MARKERS].iter() {
            let h1 = random_haplotype(&mut rng, len);
            let others: Vec<Haplotype> = (0..8).map(|_| random_haplotype(&mut rng, len)).collect();
            let g = random_genotype(&mut rng, len);
            let batched_native = hamming_distance8_with::<Native>(len, &h1, &others, &g);
            let batched_portable = hamming_distance8_with::<Portable>(len, &h1, &others, &g);
            for k in 0..8 {
                let single = hamming_distance_with::<Portable>(len, &h1, &others[k], &g);
                assert_eq!(batched_native[k], single);
                assert_eq!(batched_portable[k], single);
            }
        }
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_match() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let len = 90;
        for _ in 0..100 {
            let h1 = random_haplotype(&mut rng, len);
            let h2 = random_haplotype(&mut rng, len);
            let g = random_genotype(&mut rng, len);
            assert_eq!(
                hamming_distance(len, &h1, &h2, &g),
                hamming_distance(len, &h2, &h1, &g)
            );
        }
        let h1 = Haplotype::from_bit_string("0110", 0.0).unwrap();
        let h2 = Haplotype::from_bit_string("0011", 0.0).unwrap();
        let exact = Genotype::from_call_string("0121").unwrap();
        assert_eq!(hamming_distance(4, &h1, &h2, &exact), 0);
        let with_missing = Genotype::from_call_string("2??1").unwrap();
        assert_eq!(hamming_distance(4, &h1, &h2, &with_missing), 2);
        let one_off = Genotype::from_call_string("0111").unwrap();
        assert_eq!(hamming_distance(4, &h1, &h2, &one_off), 1);
    }

    #[test]
    fn bits_beyond_length_are_ignored() {
        let h1 = Haplotype::from_bit_string("0001", 0.0).unwrap();
        let h2 = Haplotype::from_bit_string("0001", 0.0).unwrap();
        let g = Genotype::from_call_string("0000").unwrap();
        assert_eq!(hamming_distance(3, &h1, &h2, &g), 0);
        assert_eq!(hamming_distance(4, &h1, &h2, &g), 2);
    }
}
