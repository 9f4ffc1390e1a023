//! Incremental stream-to-records splitter.
//!
//! [`SplitBuffer`] decodes a byte stream into discrete textual records
//! given an ordered set of separator strings. It is fed chunks of
//! arbitrary size and shape; the emitted record sequence is identical
//! for every chunking of the same input. Used for line-splitting
//! human-readable engine output and for NUL-delimited record parsing.

/// Separators for human-readable text streams. `"\r\n"` is listed
/// first so a CRLF pair is never split into two records.
pub const LINE_SEPARATORS: &[&str] = &["\r\n", "\r", "\n"];

/// Separator for NUL-delimited record streams (`--format jsonz`).
pub const NUL_SEPARATOR: &[&str] = &["\0"];

/// Buffering state machine that splits a byte stream into records.
///
/// Feed with [`add_chunk`](Self::add_chunk), pull with
/// [`next_record`](Self::next_record), and call [`end`](Self::end)
/// exactly once at end-of-stream so the final unterminated record is
/// still emitted.
pub struct SplitBuffer {
    /// Separators in match-priority order; at any position the first
    /// matching separator wins.
    separators: Vec<String>,
    max_separator_len: usize,
    /// Decoded text not yet cut into records.
    buffer: String,
    /// Byte offset into `buffer` where separator search resumes.
    /// Positions before it are known separator-free.
    search_index: usize,
    /// Trailing bytes of an incomplete UTF-8 sequence, completed by
    /// the next chunk.
    carry: Vec<u8>,
    at_end: bool,
}

/// Length of the incomplete UTF-8 sequence at the end of `bytes`, or 0
/// if the input ends on a complete (or invalid) sequence.
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    let window_start = len.saturating_sub(3);
    for i in (window_start..len).rev() {
        let b = bytes[i];
        if b < 0x80 {
            return 0;
        }
        if b < 0xC0 {
            // Continuation byte; keep scanning back for the lead.
            continue;
        }
        let needed = if b >= 0xF0 {
            4
        } else if b >= 0xE0 {
            3
        } else {
            2
        };
        let have = len - i;
        return if have < needed { have } else { 0 };
    }
    0
}

impl SplitBuffer {
    /// Create a splitter with the given separator set, in priority
    /// order. Must be non-empty.
    #[must_use]
    pub fn new(separators: &[&str]) -> Self {
        assert!(!separators.is_empty(), "separator set must be non-empty");
        let max_separator_len = separators.iter().map(|s| s.len()).max().unwrap_or(0);
        Self {
            separators: separators.iter().map(|s| (*s).to_string()).collect(),
            max_separator_len,
            buffer: String::new(),
            search_index: 0,
            carry: Vec::new(),
            at_end: false,
        }
    }

    /// Append a chunk of raw bytes to the buffer.
    ///
    /// A multi-byte character split across chunk boundaries is held
    /// back and completed by the following chunk; invalid sequences
    /// are replaced with U+FFFD rather than failing the stream.
    pub fn add_chunk(&mut self, chunk: &[u8]) {
        debug_assert!(!self.at_end, "add_chunk after end");
        self.carry.extend_from_slice(chunk);
        let input = std::mem::take(&mut self.carry);
        let tail_len = incomplete_utf8_suffix(&input);
        let (complete, tail) = input.split_at(input.len() - tail_len);
        self.buffer.push_str(&String::from_utf8_lossy(complete));
        self.carry = tail.to_vec();
    }

    /// Signal end-of-stream.
    ///
    /// Flushes any held decoder bytes, then appends the first
    /// configured separator as a sentinel so the final record (which
    /// has no natural terminator) is emitted by the remaining
    /// [`next_record`](Self::next_record) calls. An empty stream stays
    /// empty: no sentinel is appended to an empty buffer, so no
    /// spurious empty record is produced.
    pub fn end(&mut self) {
        if self.at_end {
            return;
        }
        self.at_end = true;
        if !self.carry.is_empty() {
            let tail = std::mem::take(&mut self.carry);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        if !self.buffer.is_empty() {
            let sentinel = self.separators[0].clone();
            self.buffer.push_str(&sentinel);
        }
    }

    /// Extract the next complete record, separator stripped.
    ///
    /// Returns `None` when no complete record is available yet; more
    /// chunks (or [`end`](Self::end)) may produce further records.
    pub fn next_record(&mut self) -> Option<String> {
        let bytes_len = self.buffer.len();
        while self.scannable(bytes_len) {
            let rest = &self.buffer.as_bytes()[self.search_index..];
            if let Some(sep_len) = self
                .separators
                .iter()
                .find(|sep| rest.starts_with(sep.as_bytes()))
                .map(String::len)
            {
                // A separator match always lands on a char boundary:
                // UTF-8 lead and continuation byte ranges are disjoint.
                let after = self.buffer.split_off(self.search_index + sep_len);
                let mut record = std::mem::replace(&mut self.buffer, after);
                record.truncate(self.search_index);
                self.search_index = 0;
                return Some(record);
            }
            self.search_index += 1;
        }
        None
    }

    /// Whether `search_index` may be tested for a separator match.
    ///
    /// While the stream is still open, positions closer than
    /// `max_separator_len` to the end are deferred: a short separator
    /// there could be the prefix of a longer one completed by the next
    /// chunk. After `end` no more bytes are coming, so every position
    /// is fair game.
    fn scannable(&self, buffer_len: usize) -> bool {
        if self.at_end {
            self.search_index < buffer_len
        } else {
            self.search_index + self.max_separator_len <= buffer_len
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `input` through a splitter in the given chunking and
    /// collect every record.
    fn split_chunked(separators: &[&str], chunks: &[&[u8]]) -> Vec<String> {
        let mut buf = SplitBuffer::new(separators);
        let mut records = Vec::new();
        for chunk in chunks {
            buf.add_chunk(chunk);
            while let Some(r) = buf.next_record() {
                records.push(r);
            }
        }
        buf.end();
        while let Some(r) = buf.next_record() {
            records.push(r);
        }
        records
    }

    fn split_whole(separators: &[&str], input: &[u8]) -> Vec<String> {
        split_chunked(separators, &[input])
    }

    #[test]
    fn test_separator_precedence() {
        assert_eq!(
            split_whole(LINE_SEPARATORS, b"a\r\nb\rc\nd"),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn test_sentinel_flush_emits_unterminated_record() {
        assert_eq!(split_whole(LINE_SEPARATORS, b"only-record"), vec![
            "only-record"
        ]);
    }

    #[test]
    fn test_empty_stream_emits_nothing() {
        assert!(split_whole(LINE_SEPARATORS, b"").is_empty());
        assert!(split_chunked(LINE_SEPARATORS, &[]).is_empty());
    }

    #[test]
    fn test_chunking_invariance() {
        // Every 2-partition and 3-partition of the input must produce
        // the same records as the unchunked stream.
        let input = b"alpha\r\nbeta\rgamma\ndelta\r\n";
        let expected = split_whole(LINE_SEPARATORS, input);
        for i in 0..=input.len() {
            let (a, b) = input.split_at(i);
            assert_eq!(
                split_chunked(LINE_SEPARATORS, &[a, b]),
                expected,
                "2-partition at {i}"
            );
            for j in i..=input.len() {
                let (b, c) = input[i..].split_at(j - i);
                assert_eq!(
                    split_chunked(LINE_SEPARATORS, &[a, b, c]),
                    expected,
                    "3-partition at {i},{j}"
                );
            }
        }
    }

    #[test]
    fn test_crlf_split_across_chunks_is_one_separator() {
        assert_eq!(split_chunked(LINE_SEPARATORS, &[b"a\r", b"\nb"]), vec![
            "a", "b"
        ]);
    }

    #[test]
    fn test_nul_separated_records() {
        assert_eq!(split_whole(NUL_SEPARATOR, b"{\"a\":1}\0{\"b\":2}\0"), vec![
            "{\"a\":1}",
            "{\"b\":2}"
        ]);
    }

    #[test]
    fn test_nul_trailing_partial_record() {
        assert_eq!(split_whole(NUL_SEPARATOR, b"one\0two"), vec!["one", "two"]);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        // U+1F600 is four bytes; split it 2+2.
        let emoji = "\u{1F600}".as_bytes();
        let records = split_chunked(NUL_SEPARATOR, &[&emoji[..2], &emoji[2..], b"\0"]);
        assert_eq!(records, vec!["\u{1F600}"]);
    }

    #[test]
    fn test_multibyte_incomplete_at_eof_is_replaced() {
        let emoji = "\u{1F600}".as_bytes();
        let records = split_whole(NUL_SEPARATOR, &emoji[..2]);
        assert_eq!(records, vec!["\u{FFFD}"]);
    }

    #[test]
    fn test_empty_records_between_separators() {
        assert_eq!(split_whole(NUL_SEPARATOR, b"a\0\0b\0"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_interior_invalid_bytes_are_replaced() {
        let records = split_whole(NUL_SEPARATOR, b"a\xFFb\0");
        assert_eq!(records, vec!["a\u{FFFD}b"]);
    }

    #[test]
    fn test_cursor_does_not_rescan_after_append() {
        // A record spanning many chunks with no separator until late.
        let mut buf = SplitBuffer::new(LINE_SEPARATORS);
        for _ in 0..100 {
            buf.add_chunk(b"x");
            assert!(buf.next_record().is_none());
        }
        buf.add_chunk(b"\n");
        buf.end();
        assert_eq!(buf.next_record().unwrap(), "x".repeat(100));
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut buf = SplitBuffer::new(LINE_SEPARATORS);
        buf.add_chunk(b"tail");
        buf.end();
        buf.end();
        assert_eq!(buf.next_record().unwrap(), "tail");
        assert!(buf.next_record().is_none());
    }
}
