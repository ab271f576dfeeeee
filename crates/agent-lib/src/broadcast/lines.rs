//! Log chunk to line splitting

use super::sanitize::sanitize;

/// Reassembles sanitised lines from arbitrarily split log chunks.
///
/// `\n` and `\r` both end a line, so carriage-return progress output is
/// delivered update by update. Text that never sees a terminator is cut
/// every `max_line_bytes`.
#[derive(Debug)]
pub(crate) struct LineSplitter {
    carry: String,
    max_line_bytes: usize,
}

impl LineSplitter {
    pub(crate) fn new(max_line_bytes: usize) -> Self {
        Self {
            carry: String::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Complete lines in `chunk`, empty ones dropped
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let normalised: Vec<u8> = chunk
            .iter()
            .map(|&b| if b == b'\r' { b'\n' } else { b })
            .collect();
        self.carry.push_str(&sanitize(&normalised));

        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            self.emit(line.trim_end_matches('\n'), &mut lines);
        }
        // Sanitised text is ASCII, so any byte offset is a char boundary
        while self.carry.len() >= self.max_line_bytes {
            let line: String = self.carry.drain(..self.max_line_bytes).collect();
            lines.push(line);
        }
        lines
    }

    /// Whatever is left once the upstream ends
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.carry))
        }
    }

    fn emit(&self, line: &str, lines: &mut Vec<String>) {
        let mut rest = line;
        while rest.len() > self.max_line_bytes {
            let (head, tail) = rest.split_at(self.max_line_bytes);
            lines.push(head.to_string());
            rest = tail;
        }
        if !rest.is_empty() {
            lines.push(rest.to_string());
        }
    }
}
