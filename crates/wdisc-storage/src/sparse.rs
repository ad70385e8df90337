//! Zero-run detection for sparse writes.
//!
//! A sparse write is split into data spans, which are written verbatim, and
//! hole spans, which are not written at all. A zero run becomes a hole only
//! when it is at least `min_hole` bytes long and lies at or beyond the
//! image's high-water mark: bytes below the mark may already hold data on
//! disk and are always rewritten. A run that straddles the mark is cut at the
//! mark and only the part beyond it is considered.
//!
//! Scanning compares whole machine words on the aligned middle of the buffer
//! and falls back to bytes for the unaligned head and tail. The produced
//! spans do not depend on the buffer's alignment.

const WORD: usize = std::mem::size_of::<u64>();
const LOW_BITS: u64 = u64::from_ne_bytes([0x01; WORD]);
const HIGH_BITS: u64 = u64::from_ne_bytes([0x80; WORD]);

/// Whether a span is written or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Must be written verbatim
    Data,
    /// Zero run that is not written
    Hole,
}

/// One piece of a sparse write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Virtual offset of the first byte
    pub offset: u64,
    /// Offset of the first byte inside the source buffer
    pub buf_offset: usize,
    /// Length in bytes
    pub len: usize,
    /// Data or hole
    pub kind: SpanKind,
}

impl Span {
    /// Range of the source buffer covered by this span.
    pub const fn buf_range(&self) -> std::ops::Range<usize> {
        self.buf_offset..self.buf_offset + self.len
    }
}

/// Splits sparse-write buffers into data and hole spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseSplitter {
    min_hole: usize,
}

impl SparseSplitter {
    /// Splitter eliding zero runs of at least `min_hole` bytes (minimum 1).
    pub const fn new(min_hole: usize) -> Self {
        Self {
            min_hole: if min_hole == 0 { 1 } else { min_hole },
        }
    }

    /// Elision threshold in bytes.
    pub const fn min_hole(&self) -> usize {
        self.min_hole
    }

    /// Split `data`, destined for virtual `offset`, given the current byte
    /// high-water mark.
    ///
    /// Spans are in buffer order, cover the buffer exactly, and adjacent
    /// spans never share a kind.
    pub fn split(&self, offset: u64, data: &[u8], high_water: u64) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let run_start = pos + first_zero(&data[pos..]);
            if run_start == data.len() {
                break;
            }
            let run_end = run_start + first_nonzero(&data[run_start..]);

            let run_virt_start = offset + run_start as u64;
            let run_virt_end = offset + run_end as u64;
            let hole_virt_start = run_virt_start.max(high_water);
            if hole_virt_start < run_virt_end && run_virt_end - hole_virt_start >= self.min_hole as u64 {
                let hole_start = (hole_virt_start - offset) as usize;
                push(&mut spans, offset, 0, hole_start, SpanKind::Data);
                push(&mut spans, offset, hole_start, run_end, SpanKind::Hole);
            }
            pos = run_end;
        }
        push(&mut spans, offset, 0, data.len(), SpanKind::Data);
        spans
    }
}

impl Default for SparseSplitter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MIN_HOLE_SIZE)
    }
}

/// Append the not yet covered part of `start..end`, merging with the
/// previous span when the kinds match.
fn push(spans: &mut Vec<Span>, offset: u64, start: usize, end: usize, kind: SpanKind) {
    let covered = spans.last().map_or(0, |s| s.buf_offset + s.len);
    let start = start.max(covered);
    if start >= end {
        return;
    }
    if let Some(last) = spans.last_mut()
        && last.kind == kind
    {
        last.len += end - start;
        return;
    }
    spans.push(Span {
        offset: offset + start as u64,
        buf_offset: start,
        len: end - start,
        kind,
    });
}

/// Whether every byte of `data` is zero.
pub fn is_zero(data: &[u8]) -> bool {
    first_nonzero(data) == data.len()
}

/// Index of the first non-zero byte, or `data.len()`.
pub fn first_nonzero(data: &[u8]) -> usize {
    scan(data, |word| word != 0, |byte| byte != 0)
}

/// Index of the first zero byte, or `data.len()`.
pub fn first_zero(data: &[u8]) -> usize {
    scan(data, has_zero_byte, |byte| byte == 0)
}

const fn has_zero_byte(word: u64) -> bool {
    word.wrapping_sub(LOW_BITS) & !word & HIGH_BITS != 0
}

/// Find the first byte matching `byte_hit`. `word_hit` must report whether a
/// word contains such a byte; it only decides where to look closer.
fn scan(data: &[u8], word_hit: impl Fn(u64) -> bool, byte_hit: impl Fn(u8) -> bool) -> usize {
    let head = data.as_ptr().align_offset(WORD).min(data.len());
    if let Some(i) = data[..head].iter().position(|&b| byte_hit(b)) {
        return i;
    }

    let (words, _) = data[head..].as_chunks::<WORD>();
    for (n, word) in words.iter().enumerate() {
        if word_hit(u64::from_ne_bytes(*word)) {
            let base = head + n * WORD;
            if let Some(i) = word.iter().position(|&b| byte_hit(b)) {
                return base + i;
            }
        }
    }

    let tail = head + words.len() * WORD;
    data[tail..]
        .iter()
        .position(|&b| byte_hit(b))
        .map_or(data.len(), |i| tail + i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn data(offset: u64, buf_offset: usize, len: usize) -> Span {
        Span {
            offset,
            buf_offset,
            len,
            kind: SpanKind::Data,
        }
    }

    fn hole(offset: u64, buf_offset: usize, len: usize) -> Span {
        Span {
            offset,
            buf_offset,
            len,
            kind: SpanKind::Hole,
        }
    }

    #[test]
    fn test_scan_helpers() {
        let mut buf = vec![0u8; 100];
        assert_eq!(first_nonzero(&buf), 100);
        assert_eq!(first_zero(&buf), 0);
        assert!(is_zero(&buf));
        buf[77] = 9;
        assert_eq!(first_nonzero(&buf), 77);
        assert_eq!(first_zero(&buf[77..]), 1);
        assert!(!is_zero(&buf));

        let ones = vec![0xFFu8; 50];
        assert_eq!(first_zero(&ones), 50);
        assert_eq!(first_nonzero(&[]), 0);
    }

    #[test]
    fn test_has_zero_byte_no_false_positive() {
        assert!(!has_zero_byte(u64::from_ne_bytes([0x80, 1, 2, 3, 4, 5, 6, 0x81])));
        assert!(has_zero_byte(u64::from_ne_bytes([0x80, 1, 0, 3, 4, 5, 6, 7])));
    }

    #[test]
    fn test_all_zero_beyond_mark_is_one_hole() {
        let splitter = SparseSplitter::new(16);
        let spans = splitter.split(0x1000, &[0u8; 64], 0);
        assert_eq!(spans, vec![hole(0x1000, 0, 64)]);
    }

    #[test]
    fn test_zeros_below_mark_are_data() {
        let splitter = SparseSplitter::new(16);
        let spans = splitter.split(0, &[0u8; 64], 64);
        assert_eq!(spans, vec![data(0, 0, 64)]);
    }

    #[test]
    fn test_run_straddling_mark_is_cut() {
        let splitter = SparseSplitter::new(16);
        let mut buf = vec![0u8; 64];
        buf[0] = 1;
        let spans = splitter.split(100, &buf, 120);
        assert_eq!(spans, vec![data(100, 0, 20), hole(120, 20, 44)]);

        // part beyond the mark too short
        let spans = splitter.split(100, &buf, 150);
        assert_eq!(spans, vec![data(100, 0, 64)]);
    }

    #[test]
    fn test_short_runs_stay_data() {
        let splitter = SparseSplitter::new(8);
        let mut buf = vec![7u8; 40];
        buf[4..10].fill(0);
        buf[20..30].fill(0);
        let spans = splitter.split(0, &buf, 0);
        assert_eq!(
            spans,
            vec![data(0, 0, 20), hole(20, 20, 10), data(30, 30, 10)]
        );
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let splitter = SparseSplitter::new(0);
        assert_eq!(splitter.min_hole(), 1);
        let spans = splitter.split(0, &[1, 0, 1], 0);
        assert_eq!(spans, vec![data(0, 0, 1), hole(1, 1, 1), data(2, 2, 1)]);
    }

    #[test]
    fn test_empty_buffer() {
        assert!(SparseSplitter::new(4).split(0, &[], 0).is_empty());
    }

    fn check_cover(spans: &[Span], offset: u64, buf: &[u8], high_water: u64, min_hole: usize) {
        let mut next = 0;
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.buf_offset, next);
            assert_eq!(span.offset, offset + span.buf_offset as u64);
            assert!(span.len > 0);
            if i > 0 {
                assert_ne!(spans[i - 1].kind, span.kind);
            }
            if span.kind == SpanKind::Hole {
                assert!(span.len >= min_hole);
                assert!(span.offset >= high_water);
                assert!(is_zero(&buf[span.buf_range()]));
            }
            next += span.len;
        }
        assert_eq!(next, buf.len());
    }

    proptest! {
        #[test]
        fn prop_split_independent_of_alignment(
            chunks in proptest::collection::vec((any::<bool>(), 1usize..40), 0..20),
            pad in 0usize..8,
            offset in 0u64..4096,
            high_water in 0u64..8192,
            min_hole in 1usize..24,
        ) {
            let mut buf = Vec::new();
            for (zero, len) in chunks {
                buf.extend(std::iter::repeat_n(if zero { 0u8 } else { 0xA5 }, len));
            }
            let mut padded = vec![0xEEu8; pad];
            padded.extend_from_slice(&buf);

            let splitter = SparseSplitter::new(min_hole);
            let aligned = splitter.split(offset, &buf, high_water);
            let shifted = splitter.split(offset, &padded[pad..], high_water);
            prop_assert_eq!(&aligned, &shifted);
            check_cover(&aligned, offset, &buf, high_water, min_hole);
        }

        #[test]
        fn prop_scan_matches_bytewise(
            buf in proptest::collection::vec(prop_oneof![Just(0u8), any::<u8>()], 0..200),
            start in 0usize..16,
        ) {
            let slice = &buf[start.min(buf.len())..];
            let expect_zero = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
            let expect_nonzero = slice.iter().position(|&b| b != 0).unwrap_or(slice.len());
            prop_assert_eq!(first_zero(slice), expect_zero);
            prop_assert_eq!(first_nonzero(slice), expect_nonzero);
        }
    }
}
