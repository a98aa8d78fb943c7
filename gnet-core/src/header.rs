//! Handshake header block: ordered multimap of `Name: value` lines with continuation folding.

use std::fmt;

/// Default cap on the cumulative size of one header block.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Default cap on the number of lines in one header block.
pub const MAX_HEADER_LINES: usize = 128;

/// Outcome of appending one line to a [`HeaderBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Ok,
    /// The blank line terminating the block was seen.
    EndOfHeaders,
    TooLarge,
    TooManyLines,
    /// A continuation line arrived before any field.
    MalformedContinuation,
    /// A line without a `Name:` prefix.
    BadField,
    /// A line was appended after the block was already complete.
    AfterEnd,
}

impl HeaderStatus {
    /// Whether the connection must be dropped on this outcome.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            HeaderStatus::TooLarge | HeaderStatus::TooManyLines | HeaderStatus::AfterEnd
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeaderStatus::Ok => "OK",
            HeaderStatus::EndOfHeaders => "End of header",
            HeaderStatus::TooLarge => "Header too large",
            HeaderStatus::TooManyLines => "Header has too many lines",
            HeaderStatus::MalformedContinuation => "Continuation line without field",
            HeaderStatus::BadField => "Malformed header field",
            HeaderStatus::AfterEnd => "End of header already reached",
        }
    }
}

impl fmt::Display for HeaderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header fields in arrival order. Lookups are case-insensitive; repeated fields
/// are joined with `", "`.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    fields: Vec<(String, String)>,
    size: usize,
    lines: usize,
    max_size: usize,
    max_lines: usize,
    complete: bool,
}

impl HeaderBlock {
    pub fn new(max_size: usize, max_lines: usize) -> Self {
        Self {
            fields: Vec::new(),
            size: 0,
            lines: 0,
            max_size,
            max_lines,
            complete: false,
        }
    }

    pub fn append(&mut self, line: &str) -> HeaderStatus {
        if self.complete {
            return HeaderStatus::AfterEnd;
        }
        if line.is_empty() {
            self.complete = true;
            return HeaderStatus::EndOfHeaders;
        }

        self.lines += 1;
        if self.lines > self.max_lines {
            return HeaderStatus::TooManyLines;
        }
        self.size += line.len();
        if self.size > self.max_size {
            return HeaderStatus::TooLarge;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            return match self.fields.last_mut() {
                Some((_, value)) => {
                    let more = line.trim();
                    if !more.is_empty() {
                        if !value.is_empty() {
                            value.push(' ');
                        }
                        value.push_str(more);
                    }
                    HeaderStatus::Ok
                }
                None => HeaderStatus::MalformedContinuation,
            };
        }

        let Some((name, value)) = line.split_once(':') else {
            return HeaderStatus::BadField;
        };
        let name = name.trim_end();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return HeaderStatus::BadField;
        }
        self.fields.push((name.to_string(), value.trim().to_string()));
        HeaderStatus::Ok
    }

    /// Value of `name`, repeated occurrences joined with `", "`.
    pub fn get(&self, name: &str) -> Option<String> {
        let mut values = self
            .fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str());
        let first = values.next()?;
        Some(values.fold(first.to_string(), |mut acc, v| {
            acc.push_str(", ");
            acc.push_str(v);
            acc
        }))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Forget everything, keeping the limits. Used between the two header blocks of
    /// an inbound modern handshake.
    pub fn reset(&mut self) {
        self.fields.clear();
        self.size = 0;
        self.lines = 0;
        self.complete = false;
    }
}

impl Default for HeaderBlock {
    fn default() -> Self {
        Self::new(MAX_HEADER_SIZE, MAX_HEADER_LINES)
    }
}

impl fmt::Display for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::getline::{LineRead, LineReader};
    use proptest::prelude::*;

    #[test]
    fn fields_and_end() {
        let mut h = HeaderBlock::default();
        assert_eq!(h.append("User-Agent: gnet/0.1"), HeaderStatus::Ok);
        assert_eq!(h.append("Pong-Caching:0.1"), HeaderStatus::Ok);
        assert_eq!(h.append(""), HeaderStatus::EndOfHeaders);
        assert_eq!(h.get("user-agent").as_deref(), Some("gnet/0.1"));
        assert_eq!(h.get("PONG-CACHING").as_deref(), Some("0.1"));
        assert!(h.is_complete());
        assert_eq!(h.append("Late: x"), HeaderStatus::AfterEnd);
    }

    #[test]
    fn continuation_folds_into_previous_field() {
        let mut h = HeaderBlock::default();
        h.append("X-Try: 1.2.3.4:6346, 5.6.7.8:6347,");
        h.append("    9.9.9.9:6346");
        assert_eq!(
            h.get("X-Try").as_deref(),
            Some("1.2.3.4:6346, 5.6.7.8:6347, 9.9.9.9:6346")
        );
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn continuation_without_field() {
        let mut h = HeaderBlock::default();
        assert_eq!(h.append("  orphan"), HeaderStatus::MalformedContinuation);
        assert!(!HeaderStatus::MalformedContinuation.is_fatal());
    }

    #[test]
    fn repeated_fields_are_joined() {
        let mut h = HeaderBlock::default();
        h.append("X-Try: a:1");
        h.append("Other: z");
        h.append("x-try: b:2");
        assert_eq!(h.get("X-Try").as_deref(), Some("a:1, b:2"));
    }

    #[test]
    fn bad_field() {
        let mut h = HeaderBlock::default();
        assert_eq!(h.append("no colon here"), HeaderStatus::BadField);
        assert_eq!(h.append("bad name: v"), HeaderStatus::BadField);
        assert!(h.is_empty());
    }

    #[test]
    fn limits() {
        let mut h = HeaderBlock::new(20, 3);
        assert_eq!(h.append("A: 1"), HeaderStatus::Ok);
        assert_eq!(h.append("B: 2"), HeaderStatus::Ok);
        assert_eq!(h.append("C: 3"), HeaderStatus::Ok);
        assert_eq!(h.append("D: 4"), HeaderStatus::TooManyLines);

        let mut h = HeaderBlock::new(10, 100);
        assert_eq!(h.append("Abc: 12345"), HeaderStatus::Ok);
        assert_eq!(h.append("D: 1"), HeaderStatus::TooLarge);
        assert!(HeaderStatus::TooLarge.is_fatal());
    }

    #[test]
    fn reset_keeps_limits() {
        let mut h = HeaderBlock::new(100, 1);
        h.append("A: 1");
        h.append("");
        h.reset();
        assert!(!h.is_complete());
        assert_eq!(h.append("B: 2"), HeaderStatus::Ok);
        assert_eq!(h.append("C: 3"), HeaderStatus::TooManyLines);
    }

    /// Feed raw bytes through a line reader into a header block, `chunk` bytes at a
    /// time, returning the terminal status and the header rendering.
    fn parse(data: &[u8], chunk: usize) -> (Option<HeaderStatus>, String) {
        let mut lines = LineReader::new(64);
        let mut header = HeaderBlock::new(256, 8);
        for piece in data.chunks(chunk.max(1)) {
            let mut rest = piece;
            while !rest.is_empty() {
                match lines.feed(rest) {
                    LineRead::NeedMore => break,
                    LineRead::Overflow => return (None, header.to_string()),
                    LineRead::Done(n) => {
                        rest = &rest[n..];
                        let line = lines.take();
                        match header.append(&line) {
                            HeaderStatus::Ok
                            | HeaderStatus::BadField
                            | HeaderStatus::MalformedContinuation => {}
                            status => return (Some(status), header.to_string()),
                        }
                    }
                }
            }
        }
        (Some(HeaderStatus::Ok), header.to_string())
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_header(
            lines in proptest::collection::vec("[A-Za-z-]{1,8}: [ -~]{0,20}|  [a-z]{1,5}", 0..10),
            chunk in 1usize..12,
        ) {
            let mut data = String::new();
            for l in &lines {
                data.push_str(l);
                data.push_str("\r\n");
            }
            data.push_str("\r\n");
            let whole = parse(data.as_bytes(), data.len());
            let split = parse(data.as_bytes(), chunk);
            prop_assert_eq!(whole, split);
        }
    }
}
