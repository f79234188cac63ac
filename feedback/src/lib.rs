//! Bounded line ring for captured process output.
//!
//! Keeps the most recent lines up to a fixed capacity; the oldest line
//! is dropped when a new one arrives at capacity. Readers only get a
//! bounded tail copy, never the live buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Default number of lines retained.
pub const DEFAULT_MAX_LINES: usize = 500;

/// Thread-safe, cloneable handle to a shared line ring.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<RingBuffer>>,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRing {
    /// Create a ring with the default capacity (500 lines).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_LINES)
    }

    /// Create a ring holding at most `max_lines` lines.
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingBuffer::new(max_lines))),
        }
    }

    /// Append one line. Trailing `\r`/`\n` are stripped.
    pub fn push_line(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        self.lock().push(line.to_string());
    }

    /// Append every line of `chunk`.
    pub fn push_text(&self, chunk: &str) {
        let mut ring = self.lock();
        for line in chunk.lines() {
            ring.push(line.to_string());
        }
    }

    /// Copy of the last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.lock().tail(n)
    }

    pub fn capacity(&self) -> usize {
        self.lock().max
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().lines.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-capacity line buffer that evicts the oldest line when full.
struct RingBuffer {
    max: usize,
    lines: VecDeque<String>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            max: capacity,
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    fn push(&mut self, line: String) {
        if self.max == 0 {
            return;
        }
        if self.lines.len() == self.max {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ring_drops_oldest_when_full() {
        let ring = LogRing::with_capacity(3);
        for i in 0..5 {
            ring.push_line(&format!("line {i}"));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.tail(10), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn tail_is_bounded_and_ordered() {
        let ring = LogRing::with_capacity(10);
        ring.push_text("a\nb\nc\nd\n");
        assert_eq!(ring.tail(2), vec!["c", "d"]);
        assert_eq!(ring.tail(0), Vec::<String>::new());
    }

    #[test]
    fn push_line_strips_line_endings() {
        let ring = LogRing::with_capacity(4);
        ring.push_line("worker ready\r\n");
        assert_eq!(ring.tail(1), vec!["worker ready"]);
    }

    #[test]
    fn clones_share_storage() {
        let ring = LogRing::with_capacity(4);
        let writer = ring.clone();
        writer.push_line("from clone");
        assert_eq!(ring.tail(1), vec!["from clone"]);
        ring.clear();
        assert!(writer.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let ring = LogRing::with_capacity(0);
        ring.push_line("ignored");
        assert!(ring.is_empty());
    }
}
