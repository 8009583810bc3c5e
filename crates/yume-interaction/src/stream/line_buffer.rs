//! Byte-level line framing with a bounded carry-over.

/// Splits an arbitrarily chunked byte stream into complete lines.
///
/// Bytes after the last newline are carried over to the next call. Lines are
/// split on raw `\n` bytes before UTF-8 decoding, so a chunk boundary inside a
/// multi-byte character is harmless.
#[derive(Debug)]
pub struct LineBuffer {
    carry: Vec<u8>,
    max_bytes: usize,
}

impl LineBuffer {
    /// Creates a buffer that force-flushes once the carry-over exceeds `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            carry: Vec::new(),
            max_bytes,
        }
    }

    /// Appends a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            if self.carry.is_empty() {
                push_line(&mut lines, head);
            } else {
                self.carry.extend_from_slice(head);
                let line = std::mem::take(&mut self.carry);
                push_line(&mut lines, &line);
            }
            rest = &tail[1..];
        }
        self.carry.extend_from_slice(rest);

        if self.carry.len() > self.max_bytes {
            lines.extend(self.force_flush());
        }
        lines
    }

    /// Flushes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.carry);
        let mut lines = Vec::new();
        push_line(&mut lines, &rest);
        lines.pop()
    }

    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    /// Salvages complete JSON objects from an oversized carry-over.
    fn force_flush(&mut self) -> Vec<String> {
        let carry = std::mem::take(&mut self.carry);
        let objects = extract_json_objects(&carry);
        let salvaged: usize = objects.iter().map(String::len).sum();
        tracing::warn!(
            buffered = carry.len(),
            limit = self.max_bytes,
            objects = objects.len(),
            discarded = carry.len().saturating_sub(salvaged),
            "Line buffer overflow, forcing flush"
        );
        objects
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    lines.push(String::from_utf8_lossy(raw).into_owned());
}

/// Returns every balanced top-level `{...}` in `bytes`.
///
/// Braces inside JSON strings are ignored. Text outside objects and a trailing
/// unbalanced object are dropped.
fn extract_json_objects(bytes: &[u8]) -> Vec<String> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    objects.push(String::from_utf8_lossy(&bytes[start..=i]).into_owned());
                }
            }
            _ => {}
        }
    }
    objects
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_carry() {
        let mut buffer = LineBuffer::new(1024);
        assert_eq!(buffer.push(b"{\"a\":1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buffer.pending_len(), 4);
        assert_eq!(buffer.push(b":2}\r\n\n"), vec!["{\"b\":2}"]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_multibyte_character_across_chunks() {
        let line = "{\"text\":\"こんにちは\"}\n".as_bytes();
        let mut buffer = LineBuffer::new(1024);
        let mut out = buffer.push(&line[..11]);
        out.extend(buffer.push(&line[11..]));
        assert_eq!(out, vec!["{\"text\":\"こんにちは\"}"]);
    }

    #[test]
    fn test_finish_returns_unterminated_tail() {
        let mut buffer = LineBuffer::new(1024);
        assert!(buffer.push(b"{\"done\":true}").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("{\"done\":true}"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_overflow_salvages_complete_objects() {
        let mut buffer = LineBuffer::new(1024);
        let mut chunk = b"{\"a\":\"}{\"}{\"b\":{\"c\":2}}".to_vec();
        chunk.extend(std::iter::repeat_n(b'x', 1100));
        chunk.extend(b"{\"partial\":");

        let lines = buffer.push(&chunk);

        assert_eq!(lines, vec!["{\"a\":\"}{\"}", "{\"b\":{\"c\":2}}"]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_escaped_quote_inside_string() {
        let objects = extract_json_objects(br#"{"a":"say \"}\" now"} junk {"b":1}"#);
        assert_eq!(objects, vec![r#"{"a":"say \"}\" now"}"#, r#"{"b":1}"#]);
    }
}
