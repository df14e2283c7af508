//! Ring-buffer reassembly and the accumulated-trace size budget.

/// Reconstructs the bytes written to a physical ring buffer between two cursor
/// observations. `buf` is the full current contents of the ring
/// (length `trace_size`); `last_offset` is where the cursor was at the end of the
/// previous drain, `current_offset` is where it is now.
///
/// If the cursor advanced without wrapping, the new bytes are the plain slice between
/// the two offsets. If it wrapped (the current offset is behind the last one), the new
/// bytes are the tail of the buffer up to `trace_size` followed by the head up to the
/// current offset. Equal offsets mean nothing new was written since the last drain.
pub fn ring_delta(buf: &[u8], last_offset: usize, current_offset: usize, trace_size: usize) -> Vec<u8> {
    if current_offset > last_offset {
        buf.get(last_offset..current_offset).unwrap_or(&[]).to_vec()
    } else if current_offset < last_offset {
        let mut out = Vec::with_capacity((trace_size - last_offset) + current_offset);
        out.extend_from_slice(buf.get(last_offset..trace_size).unwrap_or(&[]));
        out.extend_from_slice(buf.get(..current_offset).unwrap_or(&[]));
        out
    } else {
        Vec::new()
    }
}

/// Accumulates drained trace bytes across a single fuzzing iteration up to a fixed
/// budget, refusing new data once full rather than growing without bound.
pub struct TraceAccumulator {
    buffer: Vec<u8>,
    max_size: usize,
    full: bool,
}

impl TraceAccumulator {
    pub fn new(max_size: usize) -> Self {
        TraceAccumulator { buffer: Vec::new(), max_size, full: false }
    }

    /// Appends as much of `data` as still fits within the budget. Returns `true` if
    /// the accumulator is at (or was already at) capacity after this call.
    pub fn append(&mut self, data: &[u8]) -> bool {
        let space_left = self.max_size.saturating_sub(self.buffer.len());
        if space_left == 0 {
            self.full = true;
            return true;
        }

        let take = data.len().min(space_left);
        self.buffer.extend_from_slice(&data[..take]);
        if self.buffer.len() >= self.max_size {
            self.full = true;
        }
        self.full
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.full = false;
    }
}

/// Tracks `last_ring_offset` across drains within a single iteration and folds every
/// header belonging to the fuzz thread into a `TraceAccumulator`. Reset to offset 0 at the start of each iteration.
#[derive(Default)]
pub struct RingDrainer {
    last_ring_offset: usize,
}

impl RingDrainer {
    pub fn new() -> Self {
        RingDrainer::default()
    }

    pub fn reset(&mut self) {
        self.last_ring_offset = 0;
    }

    pub fn last_ring_offset(&self) -> usize {
        self.last_ring_offset
    }

    /// Drains every header in `headers` whose `thread_id` matches `fuzz_thread_id`
    /// into `accumulator`, in order, advancing `last_ring_offset` after each one.
    /// Headers for other threads are ignored.
    pub fn drain(&mut self, headers: &[super::TraceHeader], fuzz_thread_id: u32, accumulator: &mut TraceAccumulator) {
        for header in headers {
            if header.thread_id != fuzz_thread_id {
                continue;
            }
            let delta = ring_delta(&header.trace, self.last_ring_offset, header.ring_buffer_offset, header.trace_size);
            accumulator.append(&delta);
            self.last_ring_offset = header.ring_buffer_offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::TraceHeader;
    use super::*;

    #[test]
    fn ring_delta_without_wrap_is_a_plain_window() {
        let buf = b"ABCDEFGH";
        assert_eq!(ring_delta(buf, 3, 7, buf.len()), b"DEFG");
    }

    #[test]
    fn ring_delta_with_wrap_stitches_tail_then_head() {
        // cursor started at offset 5 and wrapped back around to offset 3.
        let buf = b"ABCDEFGH";
        assert_eq!(ring_delta(buf, 5, 3, buf.len()), b"FGHABC");
    }

    #[test]
    fn ring_delta_with_equal_offsets_is_empty() {
        let buf = b"ABCDEFGH";
        assert_eq!(ring_delta(buf, 4, 4, buf.len()), b"");
    }

    fn header(thread_id: u32, trace_size: usize, ring_buffer_offset: usize, trace: Vec<u8>) -> TraceHeader {
        TraceHeader { thread_id, trace_size, ring_buffer_offset, trace }
    }

    #[test]
    fn ring_wrap_1024_writes_900_then_300() {
        let ring_size = 1024usize;
        let mut ring = vec![0u8; ring_size];
        for (i, b) in ring.iter_mut().enumerate().take(900) {
            *b = (i % 256) as u8;
        }

        let mut drainer = RingDrainer::new();
        let mut acc = TraceAccumulator::new(usize::MAX);

        drainer.drain(&[header(7, ring_size, 900, ring.clone())], 7, &mut acc);
        assert_eq!(drainer.last_ring_offset(), 900);
        assert_eq!(acc.bytes().len(), 900);

        // a further 300 bytes are written, wrapping the cursor from 900 back to 176.
        for i in 900..ring_size {
            ring[i] = (i % 256) as u8;
        }
        for i in 0..176 {
            ring[i] = ((1024 + i) % 256) as u8;
        }

        drainer.drain(&[header(7, ring_size, 176, ring.clone())], 7, &mut acc);
        assert_eq!(drainer.last_ring_offset(), 176);
        assert_eq!(acc.bytes().len(), 1200);
    }

    #[test]
    fn other_threads_headers_are_ignored() {
        let mut drainer = RingDrainer::new();
        let mut acc = TraceAccumulator::new(1024);
        drainer.drain(&[header(99, 16, 8, vec![1; 16])], 7, &mut acc);
        assert_eq!(acc.bytes(), b"");
        assert_eq!(drainer.last_ring_offset(), 0);
    }

    #[test]
    fn accumulator_stops_growing_once_full() {
        let mut acc = TraceAccumulator::new(4);
        assert!(!acc.append(b"AB"));
        assert!(acc.append(b"CDEF"));
        assert_eq!(acc.bytes(), b"ABCD");
        assert!(acc.is_full());

        // Further appends are silently dropped once full.
        acc.append(b"ZZ");
        assert_eq!(acc.bytes(), b"ABCD");
    }

    #[test]
    fn reset_clears_full_flag_for_the_next_iteration() {
        let mut acc = TraceAccumulator::new(2);
        acc.append(b"AB");
        assert!(acc.is_full());
        acc.reset();
        assert!(!acc.is_full());
        assert!(acc.bytes().is_empty());
    }
}
