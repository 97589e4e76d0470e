/// Replication backlog: an offset-addressed buffer of the most recent
/// replicated-stream bytes.
///
/// Offsets are absolute stream positions; a partial resync is valid
/// exactly for offsets in `[begin_offset, current_offset)`. The
/// buffer is never trimmed in place — when it outgrows its ceiling
/// the coordinator replaces it wholesale at a capture boundary, so
/// consecutive segments are contiguous with no gap or overlap.
#[derive(Debug)]
pub struct Backlog {
    bytes: Vec<u8>,
    begin_offset: u64,
    current_offset: u64,
}

impl Backlog {
    /// Fresh backlog starting at stream offset zero
    pub fn new() -> Self {
        Self::continue_from(0)
    }

    /// Fresh backlog whose first byte will sit at `offset` — used at
    /// rotation, where `offset` is the old segment's current offset.
    pub fn continue_from(offset: u64) -> Self {
        Self {
            bytes: Vec::new(),
            begin_offset: offset,
            current_offset: offset,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        self.current_offset += bytes.len() as u64;
    }

    pub fn begin_offset(&self) -> u64 {
        self.begin_offset
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    pub fn len(&self) -> u64 {
        self.current_offset - self.begin_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_valid_offset(&self, offset: u64) -> bool {
        self.begin_offset <= offset && offset < self.current_offset
    }

    /// Everything buffered, plus the offset a reader starting here
    /// will have caught up to
    pub fn snapshot(&self) -> (Vec<u8>, u64) {
        (self.bytes.clone(), self.current_offset)
    }

    /// The suffix starting at `offset`; the caller must have checked
    /// validity (or be asking from exactly `current_offset`, which
    /// yields an empty suffix).
    pub fn snapshot_after(&self, offset: u64) -> Vec<u8> {
        let skip = offset.saturating_sub(self.begin_offset) as usize;
        self.bytes[skip.min(self.bytes.len())..].to_vec()
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new()
    }
}
