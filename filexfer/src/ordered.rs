//! Sequencer applying out-of-order events in strict sequence order.
//!
//! Events are tagged with a monotonic `u64` sequence number. An event whose
//! number equals the watermark is applied at once, followed by any buffered
//! successors that became contiguous. Everything else waits in a dense buffer
//! indexed by `seq_no - offset`.
//!
//! ```text
//!  offset          begin           end
//!    │ applied ... │ waiting slots │
//!    ▼             ▼               ▼
//!    [ -, -, -, -, None, Some, Some ]
//! ```

/// Applies events in sequence-number order regardless of arrival order.
#[derive(Debug)]
pub struct OrderedEventsProcessor<T> {
    offset: u64,
    begin: u64,
    end: u64,
    buffer: Vec<Option<T>>,
}

/// Minimum number of applied slots before the buffer is compacted.
const COMPACT_THRESHOLD: usize = 5;

impl<T> OrderedEventsProcessor<T> {
    /// Creates a processor expecting `offset` as the first sequence number.
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            begin: offset,
            end: offset,
            buffer: Vec::new(),
        }
    }

    /// Adds an event, applying it and any unblocked successors through `apply`.
    ///
    /// # Panics
    ///
    /// Panics if `seq_no` is below the watermark or was already added.
    pub fn add<F>(&mut self, seq_no: u64, data: T, mut apply: F)
    where
        F: FnMut(u64, T),
    {
        assert!(
            seq_no >= self.begin,
            "sequence number {seq_no} is below watermark {}",
            self.begin
        );

        let pos = (seq_no - self.offset) as usize;
        if pos >= self.buffer.len() {
            self.buffer.resize_with(pos + 1, || None);
        }
        assert!(
            self.buffer[pos].is_none(),
            "sequence number {seq_no} added twice"
        );
        self.buffer[pos] = Some(data);
        self.end = self.end.max(seq_no + 1);

        let mut begin_pos = (self.begin - self.offset) as usize;
        while begin_pos < self.buffer.len() {
            let Some(item) = self.buffer[begin_pos].take() else {
                break;
            };
            apply(self.begin, item);
            self.begin += 1;
            begin_pos += 1;
        }

        if begin_pos > COMPACT_THRESHOLD && begin_pos * 2 > self.buffer.len() {
            self.buffer.drain(..begin_pos);
            self.offset = self.begin;
        }
    }

    /// Hands every buffered (not yet applied) event to `f` and resets the
    /// watermark past them.
    pub fn clear<F>(&mut self, mut f: F)
    where
        F: FnMut(T),
    {
        for item in self.buffer.drain(..).flatten() {
            f(item);
        }
        self.offset = self.end;
        self.begin = self.end;
    }

    /// Highest sequence number known to be applied, with everything before it.
    ///
    /// Returns `None` while nothing has been applied.
    pub fn max_finished_seq_no(&self) -> Option<u64> {
        self.begin.checked_sub(1)
    }

    /// Highest sequence number ever added, applied or not.
    pub fn max_unfinished_seq_no(&self) -> Option<u64> {
        self.end.checked_sub(1)
    }

    /// Next sequence number that will be applied.
    pub fn next_seq_no(&self) -> u64 {
        self.begin
    }

    /// Returns true when nothing is waiting.
    pub fn has_pending(&self) -> bool {
        self.begin != self.end
    }
}
