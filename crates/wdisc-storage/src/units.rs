//! Splitting byte ranges into per-unit pieces.

/// One piece of a byte range that falls inside a single allocation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitSpan {
    /// Virtual unit index
    pub unit: u64,
    /// Offset inside the unit
    pub offset: u64,
    /// Length of the piece
    pub len: usize,
    /// Offset of the piece inside the caller's buffer
    pub buf_offset: usize,
}

impl UnitSpan {
    /// Whether the piece covers the whole unit.
    pub const fn is_full(&self, unit_size: u64) -> bool {
        self.offset == 0 && self.len as u64 == unit_size
    }

    /// Range of the caller's buffer this piece maps to.
    pub const fn buf_range(&self) -> std::ops::Range<usize> {
        self.buf_offset..self.buf_offset + self.len
    }
}

/// Iterator over the unit pieces of `offset..offset + len`.
pub(crate) struct UnitSpans {
    unit_shift: u32,
    pos: u64,
    end: u64,
    start: u64,
}

impl UnitSpans {
    pub(crate) fn new(offset: u64, len: u64, unit_size: u64) -> Self {
        debug_assert!(unit_size.is_power_of_two());
        Self {
            unit_shift: unit_size.trailing_zeros(),
            pos: offset,
            end: offset.saturating_add(len),
            start: offset,
        }
    }
}

impl Iterator for UnitSpans {
    type Item = UnitSpan;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let unit_size = 1u64 << self.unit_shift;
        let unit = self.pos >> self.unit_shift;
        let offset = self.pos & (unit_size - 1);
        let len = (unit_size - offset).min(self.end - self.pos);
        let span = UnitSpan {
            unit,
            offset,
            len: len as usize,
            buf_offset: (self.pos - self.start) as usize,
        };
        self.pos += len;
        Some(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_unaligned_range() {
        let spans: Vec<_> = UnitSpans::new(100, 300, 128).collect();
        assert_eq!(
            spans,
            vec![
                UnitSpan { unit: 0, offset: 100, len: 28, buf_offset: 0 },
                UnitSpan { unit: 1, offset: 0, len: 128, buf_offset: 28 },
                UnitSpan { unit: 2, offset: 0, len: 128, buf_offset: 156 },
                UnitSpan { unit: 3, offset: 0, len: 16, buf_offset: 284 },
            ]
        );
        assert!(spans[1].is_full(128));
        assert!(!spans[0].is_full(128));
        assert_eq!(spans[3].buf_range(), 284..300);
    }

    #[test]
    fn test_empty_range() {
        assert_eq!(UnitSpans::new(5, 0, 64).count(), 0);
    }

    #[test]
    fn test_inside_one_unit() {
        let spans: Vec<_> = UnitSpans::new(3 * 64 + 7, 1, 64).collect();
        assert_eq!(spans, vec![UnitSpan { unit: 3, offset: 7, len: 1, buf_offset: 0 }]);
    }
}
