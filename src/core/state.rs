// Wraparound position arithmetic and the immutable ring state snapshot.
use tracing::warn;

/// A location in the ring's logical address space: a physical offset plus
/// the wrap count ("cycle") that disambiguates equal offsets from different
/// laps. Capacity is carried so positions stay meaningful across resizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingPosition {
    offset: usize,
    cycle: i64,
    capacity: usize,
}

/// One physical range touched by a ring operation, paired with the offset
/// of the bytes it covers inside the caller's buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Span {
    pub ring_offset: usize,
    pub buf_offset: usize,
    pub len: usize,
}

/// A ring range covers at most two physical spans (it wraps at most once).
#[derive(Clone, Copy, Debug)]
pub struct Spans {
    first: Option<Span>,
    second: Option<Span>,
}

impl Iterator for Spans {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        self.first.take().or_else(|| self.second.take())
    }
}

pub(crate) fn spans_at(start: usize, len: usize, capacity: usize) -> Spans {
    assert!(
        len <= capacity,
        "range length {len} exceeds capacity {capacity}"
    );
    if len == 0 {
        return Spans {
            first: None,
            second: None,
        };
    }
    let end = (start + len) & (capacity - 1);
    if end <= start {
        let tail = capacity - start;
        Spans {
            first: Some(Span {
                ring_offset: start,
                buf_offset: 0,
                len: tail,
            }),
            second: (end > 0).then_some(Span {
                ring_offset: 0,
                buf_offset: tail,
                len: end,
            }),
        }
    } else {
        Spans {
            first: Some(Span {
                ring_offset: start,
                buf_offset: 0,
                len,
            }),
            second: None,
        }
    }
}

impl RingPosition {
    pub fn new(offset: usize, cycle: i64, capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two, got {capacity}"
        );
        Self {
            offset,
            cycle,
            capacity,
        }
    }

    pub fn start(capacity: usize) -> Self {
        Self::new(0, 0, capacity)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn cycle(&self) -> i64 {
        self.cycle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wrap(&self, value: usize) -> usize {
        value & (self.capacity - 1)
    }

    /// Moves by `delta` bytes (either direction), bumping the cycle when the
    /// move crosses the physical origin.
    pub fn advance(&self, delta: isize) -> Self {
        assert!(
            delta.unsigned_abs() <= self.capacity,
            "advance by {delta} exceeds capacity {}",
            self.capacity
        );
        if delta == 0 {
            return *self;
        }
        let next = self.wrap(self.offset.wrapping_add_signed(delta));
        let mut cycle = self.cycle;
        if delta < 0 && next >= self.offset {
            cycle -= 1;
        } else if delta > 0 && next <= self.offset {
            cycle += 1;
        }
        Self {
            offset: next,
            cycle,
            capacity: self.capacity,
        }
    }

    /// Signed displacement from `other` to `self`. Exact within one cycle of
    /// separation; beyond that the intermediate cycles are assumed to have
    /// had this position's capacity, which is only an approximation when a
    /// resize happened in between.
    pub fn distance(&self, other: &RingPosition) -> i64 {
        if other.cycle == self.cycle {
            return self.offset as i64 - other.offset as i64;
        }
        if other.cycle > self.cycle {
            let mut behind = (self.capacity - self.offset) as i64;
            let full_cycles = other.cycle - self.cycle - 1;
            if full_cycles > 1 && self.capacity != other.capacity {
                warn!(
                    from = ?other,
                    to = ?self,
                    full_cycles,
                    "distance across resized cycles is approximate"
                );
            }
            behind += full_cycles * self.capacity as i64;
            behind += other.offset as i64;
            -behind
        } else {
            let mut before = (other.capacity - other.offset) as i64;
            let full_cycles = self.cycle - other.cycle - 1;
            if full_cycles > 1 && self.capacity != other.capacity {
                warn!(
                    from = ?other,
                    to = ?self,
                    full_cycles,
                    "distance across resized cycles is approximate"
                );
            }
            before += full_cycles * self.capacity as i64;
            before += self.offset as i64;
            before
        }
    }

    /// Strict (cycle, offset) ordering.
    pub fn after(&self, other: &RingPosition) -> bool {
        self.cycle > other.cycle || (self.cycle == other.cycle && self.offset > other.offset)
    }

    pub fn with_capacity(&self, capacity: usize) -> Self {
        Self::new(self.offset, self.cycle, capacity)
    }

    /// Remaps this position after an in-place growth from `from`. When the
    /// pre-growth state was wrapped, growth relocates the wrapped prefix
    /// `[0, write_offset)` to `[old_capacity, ...)`; positions inside that
    /// prefix (one cycle ahead of the head, at or before the write offset)
    /// move with it and rejoin the head's cycle.
    pub fn update_capacity(&self, new_capacity: usize, from: &RingState) -> Self {
        let mut offset = self.offset;
        let mut cycle = self.cycle;
        if from.wrapped()
            && self.cycle == from.position().cycle() + 1
            && self.offset <= from.write_offset()
        {
            offset += from.capacity();
            cycle -= 1;
        }
        Self::new(offset, cycle, new_capacity)
    }

    /// Rebases this position after a physical compaction that moved the
    /// head (`from`) to offset zero of a `new_capacity` ring. A position
    /// behind the head parks one cycle back so the next read reports it.
    pub fn shrink(&self, from: &RingPosition, new_capacity: usize) -> Self {
        let distance = self.distance(from);
        if distance < 0 {
            return Self::new(0, from.cycle() - 1, new_capacity);
        }
        let distance = distance as usize;
        if distance >= new_capacity {
            return Self::new(distance - new_capacity, from.cycle() + 1, new_capacity);
        }
        Self::new(distance, from.cycle(), new_capacity)
    }

    /// Physical spans covered by `len` bytes starting at this position.
    pub(crate) fn spans(&self, len: usize) -> Spans {
        spans_at(self.offset, len, self.capacity)
    }
}

/// What the ring currently holds: the eviction head plus the byte count.
/// Immutable; every mutation returns the successor state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingState {
    position: RingPosition,
    size: usize,
}

impl RingState {
    pub fn new(offset: usize, cycle: i64, capacity: usize, size: usize) -> Self {
        Self {
            position: RingPosition::new(offset, cycle, capacity),
            size,
        }
    }

    pub fn start(capacity: usize) -> Self {
        Self::new(0, 0, capacity, 0)
    }

    pub fn position(&self) -> RingPosition {
        self.position
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.position.capacity()
    }

    pub fn cycle(&self) -> i64 {
        self.position.cycle()
    }

    /// Physical offset one past the last published byte.
    pub fn write_offset(&self) -> usize {
        self.position.wrap(self.position.offset() + self.size)
    }

    /// Position `extra` bytes past the published tail, where the writer
    /// stages its next bytes.
    pub fn write_position(&self, extra: usize) -> RingPosition {
        self.position.advance((self.size + extra) as isize)
    }

    /// Head eviction: the position advances, the size shrinks.
    pub fn remove(&self, len: usize) -> Self {
        debug_assert!(len <= self.size);
        Self {
            position: self.position.advance(len as isize),
            size: self.size - len,
        }
    }

    /// Publish `len` staged bytes.
    pub fn increment_size(&self, len: usize) -> Self {
        debug_assert!(self.size + len <= self.capacity());
        Self {
            position: self.position,
            size: self.size + len,
        }
    }

    /// Bytes a reader at `from` may still read, or `None` when the bytes at
    /// `from` were already evicted (the reader fell behind the head).
    pub fn available_to_read(&self, from: &RingPosition) -> Option<usize> {
        let distance = from.distance(&self.position);
        if distance < 0 {
            return None;
        }
        Some((self.size as i64 - distance).max(0) as usize)
    }

    /// True when the live range spans the physical end of storage.
    pub fn wrapped(&self) -> bool {
        self.position.offset() + self.size > self.capacity()
    }

    pub fn update_capacity(&self, new_capacity: usize, from: &RingState) -> Self {
        Self {
            position: self.position.update_capacity(new_capacity, from),
            size: self.size,
        }
    }

    pub fn with_capacity(&self, new_capacity: usize) -> Self {
        Self {
            position: self.position.with_capacity(new_capacity),
            size: self.size,
        }
    }

    /// State after a physical compaction rebased the head to offset zero.
    pub fn shrink(&self, new_capacity: usize) -> Self {
        Self {
            position: RingPosition::new(0, self.position.cycle(), new_capacity),
            size: self.size,
        }
    }

    pub(crate) fn spans(&self, start: usize, len: usize) -> Spans {
        spans_at(start, len, self.capacity())
    }
}
