use crate::common::{ceil_divide, Text};
use crate::pool::WorkerPool;
use crate::types::{
    AtomicSlice, SuffixType, PRECEDING_SUFFIX_IS_TYPE_A_FLAG, UNSORTED_B_SENTINEL,
};

/// Global suffix counts after the counting sweep, keyed by the big-endian
/// 2-byte head `T[i]T[i+1]`. `b` includes the B* suffixes.
pub struct Counts {
    pub b: Vec<u32>,
    pub a: Vec<u32>,
    pub b_star: Vec<u32>,
    pub a_by_symbol: [u32; 256],
    pub b_by_symbol: [u32; 256],
    pub b_star_total: usize,
}

/// Cursor tables over the final SA layout. `front[c]` points at the head of
/// the 1-byte bucket `c`; `back[(c2 << 8) | c1]` points one past the tail of
/// the 2-byte bucket `(c1,c2)`.
pub struct Buckets {
    pub front: [usize; 256],
    pub back: Vec<usize>,
}

/// One non-empty B* partition staged in the head of the SA.
pub struct BStarPartition {
    pub start: usize,
    pub len: usize,
    pub head: u16,
}

/// First-stage output: counts, layout cursors, and the B* work units.
pub struct FirstStage {
    pub counts: Counts,
    pub buckets: Buckets,
    pub partitions: Vec<BStarPartition>,
}

/// Classify the suffix starting at `i` by walking its leading equal run.
pub fn suffix_type(text: &[u8], i: usize) -> SuffixType {
    let n = text.len();
    if i + 1 >= n {
        return SuffixType::A;
    }
    if text[i] >= text[i + 1] {
        let mut p = i + 1;
        while p < n && text[p] == text[i] {
            p += 1;
        }
        if p == n || text[i] > text[p] {
            return SuffixType::A;
        }
        return SuffixType::B;
    }
    let mut p = i + 2;
    while p < n && text[p] == text[i + 1] {
        p += 1;
    }
    if p == n || text[i + 1] > text[p] {
        return SuffixType::BStar;
    }
    SuffixType::B
}

#[inline(always)]
fn initial_state(text: &[u8], i: usize) -> u32 {
    match suffix_type(text, i) {
        SuffixType::B => 0,
        SuffixType::A => 1,
        SuffixType::BStar => 2,
    }
}

/// Count suffix types per 2-byte head over `text[end..=begin]`, scanning
/// right to left. `begin` is the high end of the range; the scan runs
/// backwards, so an empty range shows up as `begin < end`.
fn count_typed_suffixes(
    text: &[u8],
    begin: usize,
    end: usize,
    b: &mut [u32],
    a: &mut [u32],
    b_star: &mut [u32],
) {
    if begin < end {
        return;
    }
    let mut state = initial_state(text, begin);
    let mut i = begin;
    loop {
        let key = ((text[i] as usize) << 8) | text[i + 1] as usize;
        match state & 0x03 {
            0 => b[key] += 1,
            2 => b_star[key] += 1,
            _ => a[key] += 1,
        }
        if i == end {
            break;
        }
        i -= 1;
        state <<= (text[i] != text[i + 1]) as u32 | ((state & 1) == 0) as u32;
        state |= (text[i] > text[i + 1]) as u32;
    }
}

/// Write the absolute position of every B* suffix in `text[end..=begin]`
/// into the staging area of the SA, bucketed by 2-byte head. Same scan
/// orientation and state machine as the counting sweep.
fn scatter_b_star(
    text: &[u8],
    begin: usize,
    end: usize,
    sa: &AtomicSlice<'_, u32>,
    offsets: &mut [u32],
) {
    if begin < end {
        return;
    }
    let mut state = initial_state(text, begin);
    let mut i = begin;
    loop {
        if state & 0x03 == 2 {
            let key = ((text[i] as usize) << 8) | text[i + 1] as usize;
            let flag = if i > 0 && text[i - 1] <= text[i] {
                0
            } else {
                PRECEDING_SUFFIX_IS_TYPE_A_FLAG
            };
            // offset ranges are disjoint per (thread, key).
            unsafe { sa.set(offsets[key] as usize, i as u32 | flag) };
            offsets[key] += 1;
        }
        if i == end {
            break;
        }
        i -= 1;
        state <<= (text[i] != text[i + 1]) as u32 | ((state & 1) == 0) as u32;
        state |= (text[i] > text[i + 1]) as u32;
    }
}

/// Run the two classification sweeps and plan the bucket layout.
///
/// On return the head of `sa` holds all B* positions in 2-byte-bucket order
/// (buckets internally unsorted beyond their first two bytes), and the
/// returned tables describe the final layout of stage 2.
pub fn classify_and_partition(text: &Text<'_>, sa: &mut [u32], pool: &mut WorkerPool) -> FirstStage {
    let bytes = text.bytes();
    let n = bytes.len();
    debug_assert!(n >= 2);
    let threads = pool.num_threads();
    let per_thread = ceil_divide(n, threads);
    let chunk = |t: usize| {
        let lo = Ord::min(t * per_thread, n - 1);
        let hi = Ord::min(lo + per_thread, n - 1);
        (hi - 1, lo)
    };

    // sweep 1: per-thread typed counts.
    let mut thread_b: Vec<Vec<u32>> = (0..threads).map(|_| vec![0u32; 0x10000]).collect();
    let mut thread_a: Vec<Vec<u32>> = (0..threads).map(|_| vec![0u32; 0x10000]).collect();
    let mut thread_b_star: Vec<Vec<u32>> = (0..threads).map(|_| vec![0u32; 0x10000]).collect();
    {
        let tasks: Vec<_> = thread_b
            .iter_mut()
            .zip(thread_a.iter_mut())
            .zip(thread_b_star.iter_mut())
            .enumerate()
            .map(|(t, ((b, a), b_star))| {
                let (begin, end) = chunk(t);
                move || count_typed_suffixes(bytes, begin, end, b, a, b_star)
            })
            .collect();
        pool.broadcast(tasks);
    }

    // reduce to global counts; the final suffix is always type A (its
    // successor is the sentinel) and sits outside the worker ranges.
    let mut counts = Counts {
        b: vec![0; 0x10000],
        a: vec![0; 0x10000],
        b_star: vec![0; 0x10000],
        a_by_symbol: [0; 256],
        b_by_symbol: [0; 256],
        b_star_total: 0,
    };
    for t in 0..threads {
        for key in 0..0x10000 {
            counts.b[key] += thread_b[t][key] + thread_b_star[t][key];
            counts.a[key] += thread_a[t][key];
            counts.b_star[key] += thread_b_star[t][key];
        }
    }
    counts.a[(bytes[n - 1] as usize) << 8] += 1;
    for key in 0..0x10000 {
        counts.a_by_symbol[key >> 8] += counts.a[key];
        counts.b_by_symbol[key >> 8] += counts.b[key];
    }

    // plan the stage-1 staging offsets and the stage-2 bucket cursors.
    let mut buckets = Buckets {
        front: [0; 256],
        back: vec![0; 0x10000],
    };
    let mut offsets: Vec<Vec<u32>> = (0..threads).map(|_| vec![0u32; 0x10000]).collect();
    let mut partitions = Vec::new();
    let mut total = 1; // slot 0 is the sentinel
    let mut b_star_total = 0;
    for c1 in 0..0x100 {
        buckets.front[c1] = total;
        for c2 in 0..0x100 {
            let key = (c1 << 8) | c2;
            let start = b_star_total;
            for t in 0..threads {
                offsets[t][key] = b_star_total as u32;
                b_star_total += thread_b_star[t][key] as usize;
            }
            total += counts.b[key] as usize + counts.a[key] as usize;
            buckets.back[(c2 << 8) | c1] = total;
            if counts.b_star[key] > 0 {
                partitions.push(BStarPartition {
                    start,
                    len: counts.b_star[key] as usize,
                    head: key as u16,
                });
            }
        }
    }
    debug_assert_eq!(total, n + 1);
    counts.b_star_total = b_star_total;

    // sweep 2: scatter B* positions into the staging area.
    {
        let shared = AtomicSlice::new(sa);
        let tasks: Vec<_> = offsets
            .iter_mut()
            .enumerate()
            .map(|(t, offsets)| {
                let (begin, end) = chunk(t);
                let shared = &shared;
                move || scatter_b_star(bytes, begin, end, shared, &mut offsets[..])
            })
            .collect();
        pool.broadcast(tasks);
    }

    FirstStage {
        counts,
        buckets,
        partitions,
    }
}

/// Move the sorted B* suffixes from the staging area to their final bucket
/// positions, fill the pending A and B slots with their markers, and seat
/// the sentinel in `sa[0]`. Within each 2-byte bucket the final order is
/// `[A][B*][plain B]`; the back cursors close up exactly onto the B* block
/// during the right-to-left pass.
pub fn spread_b_star(sa: &mut [u32], counts: &Counts) {
    let n = sa.len() - 1;
    let mut dest = n + 1;
    let mut src = counts.b_star_total;
    for key in (0..0x10000).rev() {
        let b = counts.b[key] as usize;
        let a = counts.a[key] as usize;
        if a + b == 0 {
            continue;
        }
        let b_star = counts.b_star[key] as usize;
        dest -= b;
        src -= b_star;
        sa.copy_within(src..src + b_star, dest);
        for slot in &mut sa[dest + b_star..dest + b] {
            *slot = UNSORTED_B_SENTINEL;
        }
        dest -= a;
        for slot in &mut sa[dest..dest + a] {
            *slot = PRECEDING_SUFFIX_IS_TYPE_A_FLAG;
        }
    }
    sa[0] = n as u32 | PRECEDING_SUFFIX_IS_TYPE_A_FLAG;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SA_INDEX_MASK;

    fn classify(text: &[u8], threads: usize) -> (Vec<u32>, FirstStage) {
        let view = Text::new(text);
        let mut sa = vec![0u32; text.len() + 1];
        let mut pool = WorkerPool::new(threads).unwrap();
        let stage = classify_and_partition(&view, &mut sa[..], &mut pool);
        (sa, stage)
    }

    fn type_of(text: &[u8], i: usize) -> SuffixType {
        suffix_type(text, i)
    }

    #[test]
    fn tablecheck_suffix_types() {
        let text = b"mississippi";
        let expected = [
            SuffixType::A,     // mississippi
            SuffixType::BStar, // ississippi
            SuffixType::A,     // ssissippi
            SuffixType::A,     // sissippi
            SuffixType::BStar, // issippi
            SuffixType::A,     // ssippi
            SuffixType::A,     // sippi
            SuffixType::BStar, // ippi
            SuffixType::A,     // ppi
            SuffixType::A,     // pi
            SuffixType::A,     // i
        ];
        for (i, &t) in expected.iter().enumerate() {
            assert_eq!(type_of(text, i), t, "position {}", i);
        }
    }

    #[quickcheck]
    fn quickcheck_counts_partition_the_text(text: Vec<u8>) -> bool {
        if text.len() < 2 {
            return true;
        }
        let (_, stage) = classify(&text[..], 3);
        let total_a: u32 = stage.counts.a.iter().sum();
        let total_b: u32 = stage.counts.b.iter().sum();
        let total_b_star: u32 = stage.counts.b_star.iter().sum();
        total_a as usize + total_b as usize == text.len()
            && total_b_star as usize == stage.counts.b_star_total
            && total_b_star <= total_b
    }

    #[quickcheck]
    fn quickcheck_counts_match_direct_typing(text: Vec<u8>) -> bool {
        if text.len() < 2 {
            return true;
        }
        let (_, stage) = classify(&text[..], 2);
        let mut a = 0usize;
        let mut b = 0usize;
        let mut b_star = 0usize;
        for i in 0..text.len() {
            match type_of(&text[..], i) {
                SuffixType::A => a += 1,
                SuffixType::B => b += 1,
                SuffixType::BStar => {
                    b += 1;
                    b_star += 1;
                }
            }
        }
        stage.counts.a.iter().sum::<u32>() as usize == a
            && stage.counts.b.iter().sum::<u32>() as usize == b
            && stage.counts.b_star_total == b_star
    }

    #[quickcheck]
    fn quickcheck_scatter_is_bucket_ordered(text: Vec<u8>) -> bool {
        if text.len() < 2 {
            return true;
        }
        let (sa, stage) = classify(&text[..], 4);
        let staged = &sa[..stage.counts.b_star_total];
        // every staged entry is a B* position and buckets appear in order.
        let mut prev_key = 0usize;
        for &entry in staged {
            let i = (entry & SA_INDEX_MASK) as usize;
            if type_of(&text[..], i) != SuffixType::BStar {
                return false;
            }
            let key = ((text[i] as usize) << 8) | text[i + 1] as usize;
            if key < prev_key {
                return false;
            }
            prev_key = key;
        }
        true
    }

    #[quickcheck]
    fn quickcheck_classify_is_thread_count_invariant(text: Vec<u8>) -> bool {
        if text.len() < 2 {
            return true;
        }
        let (sa1, stage1) = classify(&text[..], 1);
        let (sa4, stage4) = classify(&text[..], 4);
        sa1[..stage1.counts.b_star_total] == sa4[..stage4.counts.b_star_total]
            && stage1.counts.b == stage4.counts.b
            && stage1.counts.a == stage4.counts.a
            && stage1.buckets.back == stage4.buckets.back
    }
}
