use std::collections::VecDeque;

/// Bounded byte ring addressed by absolute offsets. Offsets keep growing
/// when old bytes fall off the front or the buffer is cleared, so a reader
/// cursor stays meaningful across both.
#[derive(Debug)]
pub struct LogBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    start_offset: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSlice {
    pub text: String,
    pub next_offset: u64,
    /// Bytes between the requested offset and the oldest retained byte.
    pub skipped: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(8 * 1024)),
            capacity: capacity.max(1),
            start_offset: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let chunk = if chunk.len() > self.capacity {
            let overflow = chunk.len() - self.capacity;
            self.start_offset += (self.bytes.len() + overflow) as u64;
            self.bytes.clear();
            &chunk[overflow..]
        } else {
            chunk
        };

        let needed = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        if needed > 0 {
            self.bytes.drain(..needed);
            self.start_offset += needed as u64;
        }
        self.bytes.extend(chunk);
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.bytes.len() as u64
    }

    pub fn read_from(&self, offset: u64, limit: Option<usize>) -> LogSlice {
        let skipped = self.start_offset.saturating_sub(offset);
        let from = offset.max(self.start_offset);
        let index = (from - self.start_offset) as usize;
        let available = self.bytes.len().saturating_sub(index);
        let take = limit.map_or(available, |limit| limit.min(available));
        let raw: Vec<u8> = self.bytes.iter().skip(index).take(take).copied().collect();
        LogSlice {
            text: String::from_utf8_lossy(&raw).into_owned(),
            next_offset: from + take as u64,
            skipped,
        }
    }

    pub fn contents(&self) -> String {
        self.read_from(self.start_offset, None).text
    }

    pub fn clear(&mut self) {
        self.start_offset = self.end_offset();
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_beyond_capacity_drops_oldest_bytes() {
        let mut log = LogBuffer::new(5);
        log.push(b"abc");
        log.push(b"defg");
        assert_eq!(log.contents(), "cdefg");
        assert_eq!(log.start_offset(), 2);
        assert_eq!(log.end_offset(), 7);
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut log = LogBuffer::new(3);
        log.push(b"xy");
        log.push(b"abcdef");
        assert_eq!(log.contents(), "def");
        assert_eq!(log.end_offset(), 8);
    }

    #[test]
    fn read_from_reports_skipped_bytes_for_stale_cursor() {
        let mut log = LogBuffer::new(4);
        log.push(b"123456");
        let slice = log.read_from(0, None);
        assert_eq!(slice.text, "3456");
        assert_eq!(slice.skipped, 2);
        assert_eq!(slice.next_offset, 6);
    }

    #[test]
    fn clear_keeps_offsets_monotonic() {
        let mut log = LogBuffer::new(16);
        log.push(b"hello");
        log.clear();
        assert_eq!(log.contents(), "");
        log.push(b"!");
        let slice = log.read_from(5, None);
        assert_eq!(slice.text, "!");
        assert_eq!(slice.next_offset, 6);
    }

    #[test]
    fn read_from_honours_limit() {
        let mut log = LogBuffer::new(16);
        log.push(b"abcdef");
        let slice = log.read_from(1, Some(2));
        assert_eq!(slice.text, "bc");
        assert_eq!(slice.next_offset, 3);
    }
}
