use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::classify::{Buckets, Counts};
use crate::common::{ceil_divide, Text};
use crate::induce::{InduceCache, MAX_CACHE_SIZE};
use crate::pool::WorkerPool;
use crate::types::{
    AtomicSlice, Error, Result, PRECEDING_SUFFIX_IS_TYPE_A_FLAG, SA_INDEX_MASK,
    UNSORTED_B_SENTINEL,
};

/// Right-to-left pass of the BWT-producing second stage: identical traversal
/// to the plain inducer, but every consumed slot collapses to the byte
/// preceding its suffix.
pub fn right_to_left_bwt(
    text: &Text<'_>,
    sa: &mut [u32],
    counts: &Counts,
    buckets: &mut Buckets,
    pool: &mut WorkerPool,
) {
    if pool.num_threads() == 1 {
        right_to_left_serial_bwt(text, sa, counts, buckets);
    } else {
        right_to_left_parallel_bwt(text, sa, counts, buckets, pool);
    }
}

/// Left-to-right pass of the BWT-producing second stage. Returns the SA slot
/// at which the (elided) sentinel character would appear.
pub fn left_to_right_bwt(
    text: &Text<'_>,
    sa: &mut [u32],
    buckets: &mut Buckets,
    pool: &mut WorkerPool,
) -> usize {
    if pool.num_threads() == 1 {
        left_to_right_serial_bwt(text, sa, buckets)
    } else {
        left_to_right_parallel_bwt(text, sa, buckets, pool)
    }
}

fn right_to_left_serial_bwt(text: &Text<'_>, sa: &mut [u32], counts: &Counts, buckets: &mut Buckets) {
    let bytes = text.bytes();
    let mut current = text.len();
    for symbol in (0..0x100).rev() {
        let bucket_end = current - counts.b_by_symbol[symbol] as usize;
        while current > bucket_end {
            let entry = sa[current];
            if entry & PRECEDING_SUFFIX_IS_TYPE_A_FLAG == 0 {
                let j = (entry & SA_INDEX_MASK) as usize - 1;
                let c = bytes[j];
                let flag = if j > 0 && bytes[j - 1] <= c {
                    0
                } else {
                    PRECEDING_SUFFIX_IS_TYPE_A_FLAG
                };
                let slot = (symbol << 8) | c as usize;
                buckets.back[slot] -= 1;
                sa[buckets.back[slot]] = j as u32 | flag;
                sa[current] = c as u32;
            }
            current -= 1;
        }
        current -= counts.a_by_symbol[symbol] as usize;
    }
}

fn left_to_right_serial_bwt(text: &Text<'_>, sa: &mut [u32], buckets: &mut Buckets) -> usize {
    let bytes = text.bytes();
    let mut sentinel = 0;
    for k in 0..sa.len() {
        let entry = sa[k];
        if entry & PRECEDING_SUFFIX_IS_TYPE_A_FLAG != 0 {
            let index = (entry & SA_INDEX_MASK) as usize;
            if index != 0 {
                let j = index - 1;
                let c = bytes[j];
                let flag = if j > 0 && bytes[j - 1] >= c {
                    PRECEDING_SUFFIX_IS_TYPE_A_FLAG
                } else {
                    0
                };
                // a preceding suffix of type B was already placed by the
                // right-to-left pass, so its slot takes the BWT byte now.
                let value = if flag != 0 {
                    j as u32 | flag
                } else if j > 0 {
                    bytes[j - 1] as u32
                } else {
                    PRECEDING_SUFFIX_IS_TYPE_A_FLAG
                };
                sa[buckets.front[c as usize]] = value;
                buckets.front[c as usize] += 1;
                sa[k] = c as u32;
            } else {
                sentinel = k;
            }
        }
    }
    sentinel
}

fn scan_b_slice_bwt(
    bytes: &[u8],
    shared: &AtomicSlice<'_, u32>,
    top: usize,
    bottom: usize,
    cache: &mut InduceCache,
) {
    cache.entries.clear();
    let mut k = top;
    while k > bottom {
        let entry = unsafe { shared.get(k) };
        if entry & PRECEDING_SUFFIX_IS_TYPE_A_FLAG == 0 {
            let j = (entry & SA_INDEX_MASK) as usize - 1;
            let c = bytes[j];
            let flag = if j > 0 && bytes[j - 1] <= c {
                0
            } else {
                PRECEDING_SUFFIX_IS_TYPE_A_FLAG
            };
            cache.entries.push((c, j as u32 | flag));
            cache.counts[c as usize] += 1;
            unsafe { shared.set(k, c as u32) };
        }
        k -= 1;
    }
}

fn right_to_left_parallel_bwt(
    text: &Text<'_>,
    sa: &mut [u32],
    counts: &Counts,
    buckets: &mut Buckets,
    pool: &mut WorkerPool,
) {
    let bytes = text.bytes();
    let threads = pool.num_threads();
    let mut caches: Vec<InduceCache> = (0..threads).map(|_| InduceCache::new()).collect();
    let shared = AtomicSlice::new(sa);

    let mut current = text.len();
    for symbol in (0..0x100).rev() {
        let bucket_end = current - counts.b_by_symbol[symbol] as usize;
        while current > bucket_end {
            let low = Ord::max(current.saturating_sub(MAX_CACHE_SIZE * threads), bucket_end);
            let mut boundary = current;
            while boundary > low && unsafe { shared.get(boundary) } != UNSORTED_B_SENTINEL {
                boundary -= 1;
            }
            if boundary == current {
                // a real flagged entry sharing the marker pattern; it is
                // consumed by the left-to-right pass.
                current -= 1;
                continue;
            }
            let per_thread = ceil_divide(current - boundary, threads);

            {
                let shared = &shared;
                let tasks: Vec<_> = caches
                    .iter_mut()
                    .enumerate()
                    .map(|(t, cache)| {
                        let top = Ord::max(current.saturating_sub(t * per_thread), boundary);
                        let bottom =
                            Ord::max(current.saturating_sub((t + 1) * per_thread), boundary);
                        move || scan_b_slice_bwt(bytes, shared, top, bottom, cache)
                    })
                    .collect();
                pool.broadcast(tasks);
            }

            for cache in caches.iter_mut() {
                for c in 0..0x100 {
                    let slot = (symbol << 8) | c;
                    cache.dest[c] = buckets.back[slot];
                    buckets.back[slot] -= cache.counts[c] as usize;
                    cache.counts[c] = 0;
                }
            }

            {
                let shared = &shared;
                let tasks: Vec<_> = caches
                    .iter_mut()
                    .map(|cache| {
                        move || {
                            for &(c, value) in &cache.entries {
                                let d = &mut cache.dest[c as usize];
                                *d -= 1;
                                unsafe { shared.set(*d, value) };
                            }
                        }
                    })
                    .collect();
                pool.broadcast(tasks);
            }

            current = boundary;
        }
        current -= counts.a_by_symbol[symbol] as usize;
    }
}

fn scan_a_slice_bwt(
    bytes: &[u8],
    shared: &AtomicSlice<'_, u32>,
    lo: usize,
    hi: usize,
    cache: &mut InduceCache,
    sentinel: &AtomicUsize,
) {
    cache.entries.clear();
    for k in lo..hi {
        let entry = unsafe { shared.get(k) };
        if entry & PRECEDING_SUFFIX_IS_TYPE_A_FLAG != 0 {
            let index = (entry & SA_INDEX_MASK) as usize;
            if index != 0 {
                let j = index - 1;
                let c = bytes[j];
                let flag = if j > 0 && bytes[j - 1] >= c {
                    PRECEDING_SUFFIX_IS_TYPE_A_FLAG
                } else {
                    0
                };
                let value = if flag != 0 {
                    j as u32 | flag
                } else if j > 0 {
                    bytes[j - 1] as u32
                } else {
                    PRECEDING_SUFFIX_IS_TYPE_A_FLAG
                };
                cache.entries.push((c, value));
                cache.counts[c as usize] += 1;
                unsafe { shared.set(k, c as u32) };
            } else {
                sentinel.store(k, Ordering::Relaxed);
            }
        }
    }
}

fn left_to_right_parallel_bwt(
    text: &Text<'_>,
    sa: &mut [u32],
    buckets: &mut Buckets,
    pool: &mut WorkerPool,
) -> usize {
    let bytes = text.bytes();
    let threads = pool.num_threads();
    let len = sa.len();
    let mut caches: Vec<InduceCache> = (0..threads).map(|_| InduceCache::new()).collect();
    let shared = AtomicSlice::new(sa);
    let sentinel = AtomicUsize::new(0);

    let mut current = 0;
    while current < len {
        let begin = current;
        let max_end = Ord::min(begin + MAX_CACHE_SIZE * threads, len);
        if current != max_end {
            current += 1;
        }
        while current != max_end
            && unsafe { shared.get(current) } != PRECEDING_SUFFIX_IS_TYPE_A_FLAG
        {
            current += 1;
        }
        let end = current;
        let per_thread = ceil_divide(end - begin, threads);

        {
            let shared = &shared;
            let sentinel = &sentinel;
            let tasks: Vec<_> = caches
                .iter_mut()
                .enumerate()
                .map(|(t, cache)| {
                    let lo = Ord::min(begin + t * per_thread, end);
                    let hi = Ord::min(lo + per_thread, end);
                    move || scan_a_slice_bwt(bytes, shared, lo, hi, cache, sentinel)
                })
                .collect();
            pool.broadcast(tasks);
        }

        for cache in caches.iter_mut() {
            for c in 0..0x100 {
                cache.dest[c] = buckets.front[c];
                buckets.front[c] += cache.counts[c] as usize;
                cache.counts[c] = 0;
            }
        }

        {
            let shared = &shared;
            let tasks: Vec<_> = caches
                .iter_mut()
                .map(|cache| {
                    move || {
                        for &(c, value) in &cache.entries {
                            let d = &mut cache.dest[c as usize];
                            unsafe { shared.set(*d, value) };
                            *d += 1;
                        }
                    }
                })
                .collect();
            pool.broadcast(tasks);
        }
    }
    sentinel.load(Ordering::Relaxed)
}

/// One next-pointer of the inverse-BWT chain: the index of the following
/// entry (top bit doubles as the visited flag) and the byte to emit.
#[derive(Copy, Clone, Default)]
struct LfEntry {
    value: u32,
    symbol: u8,
}

/// A partition of the output space following one arc of the cyclic chain.
struct IbwtPartition {
    start_index: u32,
    current_index: u32,
    begin_output: usize,
    current_output: usize,
    end_output: usize,
    has_output: bool,
}

/// One decoded arc: output range plus the chain indices it connects.
struct DecodedSegment {
    begin: usize,
    end: usize,
    end_index: u32,
}

/// Reconstruct the original string from its BWT in place.
///
/// Builds the LF chain with the sentinel position skipped in both address
/// spaces, then decodes cooperatively: partitions follow the chain into
/// their own output slices until they run into a slice that is full or an
/// entry another partition has claimed, and freed slices are re-banked
/// between rounds.
pub fn reverse_bwt(input: &mut [u8], sentinel_index: u32, pool: &mut WorkerPool) -> Result<()> {
    let n = input.len();
    if n == 0 {
        return Ok(());
    }
    let threads = pool.num_threads();

    let mut entries: Vec<LfEntry> = Vec::new();
    entries
        .try_reserve_exact(n + 1)
        .map_err(|_| Error::OutOfMemory((n + 1) * std::mem::size_of::<LfEntry>()))?;
    entries.resize(n + 1, LfEntry::default());

    // per-thread symbol counts over the transformed text.
    let per_thread = ceil_divide(n, threads);
    let mut symbol_ranges: Vec<[usize; 256]> = input
        .par_chunks(per_thread)
        .map(|chunk| {
            let mut counts = [0usize; 256];
            for &c in chunk {
                counts[c as usize] += 1;
            }
            counts
        })
        .collect();

    // prefix sums interleaved per thread, offset by one for the sentinel.
    let mut cursor = 1;
    for c in 0..0x100 {
        for range in symbol_ranges.iter_mut() {
            let count = range[c];
            range[c] = cursor;
            cursor += count;
        }
    }

    let first_decode_index = sentinel_index;
    entries[0] = LfEntry {
        value: sentinel_index,
        symbol: input[0],
    };

    // fill the chain in parallel; each (thread, symbol) cursor range is
    // disjoint.
    {
        let shared = AtomicSlice::new(&mut entries[..]);
        let sentinel = sentinel_index as usize;
        let input = &input[..];
        let shared = &shared;
        let mut tasks = Vec::with_capacity(symbol_ranges.len());
        for (t, range) in symbol_ranges.iter_mut().enumerate() {
            let lo = Ord::min(t * per_thread, n);
            let hi = Ord::min(lo + per_thread, n);
            tasks.push(move || {
                for i in lo..hi {
                    let dst = (i + (i >= sentinel) as usize) as u32;
                    let c = input[i] as usize;
                    let k = range[c];
                    range[c] += 1;
                    let symbol = input[k - (k >= sentinel) as usize];
                    unsafe { shared.set(k, LfEntry { value: dst, symbol }) };
                }
            });
        }
        pool.broadcast(tasks);
    }

    // carve the output space into chain-following partitions and claim
    // their entry points.
    let partition_count = Ord::min(threads * 256, n + 1);
    let max_bytes_per_partition = (2 * (n + 1) - 1) / partition_count;
    let mut partitions: Vec<IbwtPartition> = Vec::new();
    let mut decoded: Vec<DecodedSegment> = Vec::new();
    let mut segments: HashMap<u32, usize> = HashMap::new();
    let mut free_space: Vec<(usize, usize)> = Vec::new();
    let mut decode_buf: Vec<u8> = Vec::new();
    decode_buf
        .try_reserve_exact(n)
        .map_err(|_| Error::OutOfMemory(n))?;
    decode_buf.resize(n, 0);

    let mut row = 0;
    let mut out = 0;
    while row < n + 1 {
        let size = Ord::min(max_bytes_per_partition, n + 1 - row);
        partitions.push(IbwtPartition {
            start_index: entries[row].value,
            current_index: entries[row].value,
            begin_output: out,
            current_output: out,
            end_output: Ord::min(out + size, n),
            has_output: true,
        });
        entries[row].value |= PRECEDING_SUFFIX_IS_TYPE_A_FLAG;
        row += size;
        out += size;
    }

    // cooperative rounds: chase, then reconcile on the submitting thread.
    let entries = &entries[..];
    while !partitions.is_empty() {
        {
            let shared_out = AtomicSlice::new(&mut decode_buf[..]);
            let shared_out = &shared_out;
            let sentinel = sentinel_index;
            let per = Ord::max(ceil_divide(partitions.len(), threads), 1);
            let tasks: Vec<_> = partitions
                .chunks_mut(per)
                .map(|chunk| {
                    move || {
                        for p in chunk {
                            while p.current_index & PRECEDING_SUFFIX_IS_TYPE_A_FLAG == 0
                                && p.current_output < p.end_output
                            {
                                let e = entries[p.current_index as usize];
                                unsafe { shared_out.set(p.current_output, e.symbol) };
                                p.current_output += (p.current_index != sentinel) as usize;
                                p.current_index = e.value;
                            }
                        }
                    }
                })
                .collect();
            pool.broadcast(tasks);
        }

        let mut still_running = Vec::with_capacity(partitions.len());
        for mut p in partitions {
            let finished = p.current_index & PRECEDING_SUFFIX_IS_TYPE_A_FLAG != 0;
            if p.has_output {
                let end_index = p.current_index & SA_INDEX_MASK;
                if finished || p.begin_output != p.current_output {
                    segments.insert(p.start_index, decoded.len());
                    decoded.push(DecodedSegment {
                        begin: p.begin_output,
                        end: p.current_output,
                        end_index,
                    });
                    p.start_index = end_index;
                }
            }
            if finished {
                if p.current_output < p.end_output {
                    free_space.push((p.current_output, p.end_output));
                }
            } else {
                still_running.push(p);
            }
        }
        partitions = still_running;

        for p in partitions.iter_mut() {
            if let Some((begin, end)) = free_space.pop() {
                p.begin_output = begin;
                p.current_output = begin;
                p.end_output = end;
                p.has_output = true;
            } else {
                p.begin_output = 0;
                p.current_output = 0;
                p.end_output = 0;
                p.has_output = false;
            }
        }
    }

    // stitch the segments back together in chain order.
    let mut written = 0;
    let mut key = first_decode_index;
    while written < n {
        let segment = match segments.get(&key) {
            Some(&i) => &decoded[i],
            None => break,
        };
        let len = segment.end - segment.begin;
        input[written..written + len].copy_from_slice(&decode_buf[segment.begin..segment.end]);
        written += len;
        key = segment.end_index;
    }
    debug_assert_eq!(written, n);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_bwt(text: &[u8]) -> (Vec<u8>, u32) {
        // sort all rotations of text + sentinel; the sentinel is smaller
        // than every byte.
        let n = text.len();
        let mut rotations: Vec<usize> = (0..=n).collect();
        rotations.sort_by(|&a, &b| {
            let row = |r: usize| {
                (0..=n).map(move |k| {
                    let p = (r + k) % (n + 1);
                    if p == n {
                        -1i32
                    } else {
                        text[p] as i32
                    }
                })
            };
            row(a).cmp(row(b))
        });
        let mut out = Vec::with_capacity(n);
        let mut sentinel = 0;
        for (k, &r) in rotations.iter().enumerate() {
            let last = (r + n) % (n + 1);
            if last == n {
                sentinel = k as u32;
            } else {
                out.push(text[last]);
            }
        }
        (out, sentinel)
    }

    fn run_reverse(bwt: &[u8], sentinel: u32, threads: usize) -> Vec<u8> {
        let mut data = bwt.to_vec();
        let mut pool = WorkerPool::new(threads).unwrap();
        reverse_bwt(&mut data[..], sentinel, &mut pool).unwrap();
        data
    }

    #[test]
    fn tablecheck_reverse_bwt() {
        let cases: &[&[u8]] = &[
            b"banana",
            b"mississippi",
            b"aaaaaaaa",
            b"abababab",
            b"the quick brown fox jumps over the lazy dog",
        ];
        for &text in cases {
            let (bwt, sentinel) = naive_bwt(text);
            assert_eq!(
                run_reverse(&bwt[..], sentinel, 1),
                text.to_vec(),
                "text {:?}",
                std::str::from_utf8(text)
            );
            assert_eq!(run_reverse(&bwt[..], sentinel, 4), text.to_vec());
        }
    }

    #[test]
    fn banana_bwt_fixture() {
        // "banana" + sentinel transforms to "annb$aa"; removing the
        // sentinel leaves "annbaa" with sentinel index 4.
        let (bwt, sentinel) = naive_bwt(b"banana");
        assert_eq!(bwt, b"annbaa".to_vec());
        assert_eq!(sentinel, 4);
        assert_eq!(run_reverse(&bwt[..], sentinel, 2), b"banana".to_vec());
    }

    #[quickcheck]
    fn quickcheck_reverse_of_naive_bwt(text: Vec<u8>) -> bool {
        let (bwt, sentinel) = naive_bwt(&text[..]);
        run_reverse(&bwt[..], sentinel, 3) == text
    }
}
