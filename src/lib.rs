//! Parallel improved-two-stage (ITS) suffix sorting for byte strings, with
//! forward and reverse Burrows-Wheeler transforms as by-products.
//!
//! Only the B* suffixes are sorted directly, by a multikey three-pivot
//! quicksort with a tandem-repeat escape; the remaining suffixes are induced
//! by two bucket-anchored linear passes. All stages run over a fixed worker
//! pool sized by the caller.

#[cfg(test)]
#[macro_use]
extern crate quickcheck_macros;

#[macro_use]
extern crate log;

mod bwt;
mod classify;
mod common;
mod induce;
mod pool;
mod quicksort;
mod types;

use std::time::Instant;

use crate::classify::FirstStage;
use crate::common::{saca_tiny, Text};
use crate::pool::WorkerPool;

pub use crate::types::{Error, Result};

/// Compute the suffix array of `input` using up to `num_threads` threads.
///
/// The result has `input.len() + 1` entries: `sa[0]` is the implicit
/// sentinel (the input length) and the rest list every suffix position in
/// lexicographic order against a sentinel smaller than every byte.
pub fn make_suffix_array(input: &[u8], num_threads: usize) -> Result<Vec<u32>> {
    let n = input.len();
    let mut sa = allocate_suffix_array(n)?;
    if n <= 3 {
        saca_tiny(input, &mut sa[..]);
        return Ok(sa);
    }

    let text = Text::new(input);
    let mut pool = WorkerPool::new(num_threads)?;
    let mut stage = first_stage(&text, &mut sa[..], &mut pool);

    let started = Instant::now();
    induce::right_to_left(&text, &mut sa[..], &stage.counts, &mut stage.buckets, &mut pool);
    induce::left_to_right(&text, &mut sa[..], &mut stage.buckets, &mut pool);
    debug!("second stage induced in {:?}", started.elapsed());
    Ok(sa)
}

/// Rewrite `input` in place with its Burrows-Wheeler transform and return
/// the index at which the elided sentinel character would appear.
pub fn forward_bwt(input: &mut [u8], num_threads: usize) -> Result<u32> {
    let n = input.len();
    let mut sa = allocate_suffix_array(n)?;
    if n == 0 {
        return Ok(0);
    }
    if n <= 3 {
        saca_tiny(input, &mut sa[..]);
        return Ok(collapse_to_bwt(input, &sa[..]));
    }

    let sentinel;
    {
        let text = Text::new(&input[..]);
        let mut pool = WorkerPool::new(num_threads)?;
        let mut stage = first_stage(&text, &mut sa[..], &mut pool);

        let started = Instant::now();
        bwt::right_to_left_bwt(&text, &mut sa[..], &stage.counts, &mut stage.buckets, &mut pool);
        sentinel = bwt::left_to_right_bwt(&text, &mut sa[..], &mut stage.buckets, &mut pool);
        debug!("second stage (bwt) induced in {:?}", started.elapsed());
    }

    let mut w = 0;
    for (k, &v) in sa.iter().enumerate() {
        if k != sentinel {
            input[w] = v as u8;
            w += 1;
        }
    }
    Ok(sentinel as u32)
}

/// Rewrite `input` (a BWT produced by [`forward_bwt`]) in place with the
/// original string.
pub fn reverse_bwt(input: &mut [u8], sentinel_index: u32, num_threads: usize) -> Result<()> {
    let n = input.len();
    if n > i32::MAX as usize {
        return Err(Error::InputTooLarge(n));
    }
    if sentinel_index as usize > n {
        return Err(Error::InvalidSentinel(sentinel_index));
    }
    if n == 0 {
        return Ok(());
    }
    let mut pool = WorkerPool::new(num_threads)?;
    let started = Instant::now();
    bwt::reverse_bwt(input, sentinel_index, &mut pool)?;
    debug!("reverse bwt of {} bytes in {:?}", n, started.elapsed());
    Ok(())
}

fn allocate_suffix_array(n: usize) -> Result<Vec<u32>> {
    if n > i32::MAX as usize {
        return Err(Error::InputTooLarge(n));
    }
    let mut sa = Vec::new();
    sa.try_reserve_exact(n + 1)
        .map_err(|_| Error::OutOfMemory(4 * (n + 1)))?;
    sa.resize(n + 1, 0);
    Ok(sa)
}

/// Stage 1: classify, sort every B* partition, and spread the sorted B*
/// suffixes into their final bucket positions.
fn first_stage(text: &Text<'_>, sa: &mut [u32], pool: &mut WorkerPool) -> FirstStage {
    let started = Instant::now();
    let mut stage = classify::classify_and_partition(text, sa, pool);
    debug!(
        "classified {} B* suffixes into {} partitions in {:?}",
        stage.counts.b_star_total,
        stage.partitions.len(),
        started.elapsed()
    );

    let started = Instant::now();
    quicksort::sort_b_star_partitions(text, sa, &mut stage.partitions, pool);
    classify::spread_b_star(sa, &stage.counts);
    debug!("direct sort done in {:?}", started.elapsed());
    stage
}

// derive the BWT of a tiny input from its finished suffix array.
fn collapse_to_bwt(input: &mut [u8], sa: &[u32]) -> u32 {
    let mut bwt = [0u8; 3];
    let mut sentinel = 0;
    let mut w = 0;
    for (k, &p) in sa.iter().enumerate() {
        if p == 0 {
            sentinel = k as u32;
        } else {
            bwt[w] = input[p as usize - 1];
            w += 1;
        }
    }
    input.copy_from_slice(&bwt[..input.len()]);
    sentinel
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_suffix_array(text: &[u8], threads: usize) -> Vec<u32> {
        make_suffix_array(text, threads).unwrap()
    }

    fn calc_naive(text: &[u8]) -> Vec<u32> {
        let mut suf = vec![0u32; text.len() + 1];
        saca_tiny(text, &mut suf[..]);
        suf
    }

    fn roundtrip(text: &[u8], threads: usize) -> Vec<u8> {
        let mut data = text.to_vec();
        let sentinel = forward_bwt(&mut data[..], threads).unwrap();
        reverse_bwt(&mut data[..], sentinel, threads).unwrap();
        data
    }

    #[test]
    fn tablecheck_scenarios() {
        assert_eq!(calc_suffix_array(b"banana", 1), vec![6, 5, 3, 1, 0, 4, 2]);
        assert_eq!(
            calc_suffix_array(b"mississippi", 1),
            vec![11, 10, 7, 4, 1, 0, 9, 8, 6, 3, 5, 2]
        );
        assert_eq!(
            calc_suffix_array(b"aaaaaaaa", 1),
            vec![8, 7, 6, 5, 4, 3, 2, 1, 0]
        );
        assert_eq!(
            calc_suffix_array(b"abababab", 1),
            vec![8, 6, 4, 2, 0, 7, 5, 3, 1]
        );
    }

    #[test]
    fn tablecheck_boundaries() {
        assert_eq!(calc_suffix_array(b"", 1), vec![0]);
        assert_eq!(calc_suffix_array(b"x", 1), vec![1, 0]);
        assert_eq!(calc_suffix_array(b"ba", 1), vec![2, 1, 0]);
        assert_eq!(calc_suffix_array(b"ab", 1), vec![2, 0, 1]);
    }

    #[test]
    fn tablecheck_forward_bwt_banana() {
        // canonical BWT of "banana$" is "annb$aa"; the sentinel slot is 4.
        let mut data = b"banana".to_vec();
        let sentinel = forward_bwt(&mut data[..], 1).unwrap();
        assert_eq!(&data[..], b"annbaa");
        assert_eq!(sentinel, 4);
    }

    #[test]
    fn tablecheck_bwt_roundtrip() {
        let cases: &[&[u8]] = &[
            b"",
            b"a",
            b"ab",
            b"banana",
            b"mississippi",
            b"abababab",
            b"aaaaaaaa",
            b"the quick brown fox jumps over the lazy dog",
        ];
        for &text in cases {
            assert_eq!(
                roundtrip(text, 1),
                text.to_vec(),
                "text {:?}",
                std::str::from_utf8(text)
            );
            assert_eq!(roundtrip(text, 4), text.to_vec());
        }
    }

    #[test]
    fn tablecheck_tandem_repeat_strings() {
        let mut ab = Vec::new();
        let mut abc = Vec::new();
        for _ in 0..40 {
            ab.extend_from_slice(b"ab");
            abc.extend_from_slice(b"abc");
        }
        let mut framed = b"a".to_vec();
        framed.extend_from_slice(&ab[..]);
        framed.push(b'c');
        for text in vec![ab, abc, framed] {
            assert_eq!(calc_suffix_array(&text[..], 1), calc_naive(&text[..]));
            assert_eq!(calc_suffix_array(&text[..], 4), calc_naive(&text[..]));
        }
    }

    #[test]
    fn invalid_sentinel_is_reported() {
        let mut data = b"abc".to_vec();
        assert_eq!(
            reverse_bwt(&mut data[..], 7, 1),
            Err(Error::InvalidSentinel(7))
        );
    }

    #[quickcheck]
    fn quickcheck_permutation(text: Vec<u8>) -> bool {
        let sa = calc_suffix_array(&text[..], 2);
        let mut seen = vec![false; text.len() + 1];
        for &p in &sa {
            if seen[p as usize] {
                return false;
            }
            seen[p as usize] = true;
        }
        seen.into_iter().all(|b| b)
    }

    #[quickcheck]
    fn quickcheck_lexicographic_order(text: Vec<u8>) -> bool {
        calc_suffix_array(&text[..], 2) == calc_naive(&text[..])
    }

    #[quickcheck]
    fn quickcheck_thread_count_invariance(text: Vec<u8>) -> bool {
        let reference = calc_suffix_array(&text[..], 1);
        (2..=4).all(|p| calc_suffix_array(&text[..], p) == reference)
    }

    #[quickcheck]
    fn quickcheck_bwt_roundtrip(text: Vec<u8>) -> bool {
        roundtrip(&text[..], 2) == text
    }

    #[quickcheck]
    fn quickcheck_forward_bwt_thread_count_invariance(text: Vec<u8>) -> bool {
        let mut serial = text.clone();
        let serial_sentinel = forward_bwt(&mut serial[..], 1).unwrap();
        (2..=4).all(|p| {
            let mut parallel = text.clone();
            let sentinel = forward_bwt(&mut parallel[..], p).unwrap();
            parallel == serial && sentinel == serial_sentinel
        })
    }

    #[quickcheck]
    fn quickcheck_small_alphabets(text: Vec<u8>, alphabet: u8) -> bool {
        let k: u32 = match alphabet % 3 {
            0 => 2,
            1 => 4,
            _ => 256,
        };
        let text: Vec<u8> = text.into_iter().map(|b| (b as u32 % k) as u8).collect();
        calc_suffix_array(&text[..], 3) == calc_naive(&text[..]) && roundtrip(&text[..], 3) == text
    }
}
