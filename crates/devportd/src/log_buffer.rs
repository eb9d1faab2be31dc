use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

const DEFAULT_MAX_LINES: usize = 1000;

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub fn log_max_lines() -> usize {
    env_usize("DEVPORT_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_MAX_LINES)
}

/// Bounded in-memory capture of one server's interleaved stdout/stderr.
///
/// Lines carry monotonically increasing sequence numbers so pollers can
/// resume from a cursor; on overflow the oldest lines are dropped first and
/// the writer never waits.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Point-in-time copy of every retained line, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().map(|(_, line)| line.clone()).collect()
    }

    /// Lines with sequence numbers greater than `cursor`, up to `limit`,
    /// plus the cursor to resume from. Cursor 0 returns the most recent
    /// `limit` lines instead, which is what a UI wants on first poll.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(log_max_lines())
    }
}

/// Shared write handle to a buffer; clones are handed to the output pumps
/// and to the supervisor for its own control lines.
#[derive(Clone)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogSink {
    pub fn new(buffer: Arc<Mutex<LogBuffer>>) -> Self {
        Self { buffer }
    }

    pub async fn emit(&self, line: impl Into<String>) {
        self.buffer.lock().await.push_line(line.into());
    }
}

/// Splits a raw byte stream into complete lines.
///
/// A chunk that ends mid-line is carried until a later chunk supplies the
/// terminator, so nothing downstream ever sees a truncated line. Bytes are
/// decoded lossily per complete line, which keeps multi-byte sequences that
/// straddle chunk boundaries intact. A trailing `\r` is stripped for CRLF
/// output.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                out.push(Self::take_line(&mut self.partial));
            } else {
                self.partial.push(byte);
            }
        }
        out
    }

    /// Flush the carried partial line at stream EOF, if any.
    pub fn finish(mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(Self::take_line(&mut self.partial))
        }
    }

    fn take_line(partial: &mut Vec<u8>) -> String {
        if partial.last() == Some(&b'\r') {
            partial.pop();
        }
        let line = String::from_utf8_lossy(partial).into_owned();
        partial.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_first() {
        let mut buf = LogBuffer::new(3);
        for i in 1..=4 {
            buf.push_line(format!("line {i}"));
        }
        assert_eq!(buf.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn snapshot_is_oldest_first() {
        let mut buf = LogBuffer::new(10);
        buf.push_line("a".to_string());
        buf.push_line("b".to_string());
        assert_eq!(buf.snapshot(), vec!["a", "b"]);
    }

    #[test]
    fn tail_after_resumes_from_cursor() {
        let mut buf = LogBuffer::new(10);
        for i in 1..=5 {
            buf.push_line(format!("line {i}"));
        }
        let (lines, cursor) = buf.tail_after(0, 2);
        assert_eq!(lines, vec!["line 4", "line 5"]);
        assert_eq!(cursor, 5);

        buf.push_line("line 6".to_string());
        let (lines, cursor) = buf.tail_after(cursor, 10);
        assert_eq!(lines, vec!["line 6"]);
        assert_eq!(cursor, 6);

        let (lines, cursor2) = buf.tail_after(cursor, 10);
        assert!(lines.is_empty());
        assert_eq!(cursor2, cursor);
    }

    #[test]
    fn tail_after_survives_eviction() {
        let mut buf = LogBuffer::new(2);
        for i in 1..=4 {
            buf.push_line(format!("line {i}"));
        }
        // Cursor 1 points at an evicted line; only retained lines come back.
        let (lines, cursor) = buf.tail_after(1, 10);
        assert_eq!(lines, vec!["line 3", "line 4"]);
        assert_eq!(cursor, 4);
    }

    #[test]
    fn assembler_holds_partial_line_until_terminated() {
        let mut asm = LineAssembler::default();
        assert!(asm.push_chunk(b"par").is_empty());
        let lines = asm.push_chunk(b"tial\nnext");
        assert_eq!(lines, vec!["partial"]);
        assert_eq!(asm.finish(), Some("next".to_string()));
    }

    #[test]
    fn assembler_splits_multiple_lines_per_chunk() {
        let mut asm = LineAssembler::default();
        let lines = asm.push_chunk(b"one\ntwo\nthree\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn assembler_strips_carriage_returns() {
        let mut asm = LineAssembler::default();
        let lines = asm.push_chunk(b"crlf line\r\n");
        assert_eq!(lines, vec!["crlf line"]);
    }

    #[test]
    fn assembler_keeps_split_utf8_sequences_intact() {
        let mut asm = LineAssembler::default();
        let bytes = "héllo\n".as_bytes();
        assert!(asm.push_chunk(&bytes[..2]).is_empty());
        let lines = asm.push_chunk(&bytes[2..]);
        assert_eq!(lines, vec!["héllo"]);
    }
}
