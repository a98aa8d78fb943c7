//! Incremental line extraction for the text handshake.

/// Default maximum line length, terminator excluded.
pub const MAX_LINE_SIZE: usize = 1024;

/// Outcome of feeding bytes to a [`LineReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A full line is available; the value is how many input bytes were consumed
    /// (terminator included).
    Done(usize),
    /// All input was consumed and the line is still incomplete.
    NeedMore,
    /// The line grew past the configured maximum. Fatal for the connection.
    Overflow,
}

/// Accumulates one LF- or CRLF-terminated line across partial reads.
#[derive(Debug, Clone)]
pub struct LineReader {
    line: Vec<u8>,
    max: usize,
    complete: bool,
}

impl LineReader {
    pub fn new(max: usize) -> Self {
        Self {
            line: Vec::new(),
            max,
            complete: false,
        }
    }

    /// Consume bytes until a line terminator is seen. Once a line is complete, further
    /// calls return `Done(0)` until [`reset`](Self::reset).
    pub fn feed(&mut self, buf: &[u8]) -> LineRead {
        if self.complete {
            return LineRead::Done(0);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(eol) => {
                if self.line.len() + eol > self.max + 1 {
                    return LineRead::Overflow;
                }
                self.line.extend_from_slice(&buf[..eol]);
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                if self.line.len() > self.max {
                    return LineRead::Overflow;
                }
                self.complete = true;
                LineRead::Done(eol + 1)
            }
            None => {
                // A trailing CR may still be followed by LF, hence the +1 slack.
                if self.line.len() + buf.len() > self.max + 1 {
                    return LineRead::Overflow;
                }
                self.line.extend_from_slice(buf);
                LineRead::NeedMore
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The line read so far, terminator stripped.
    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }

    pub fn len(&self) -> usize {
        self.line.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }

    pub fn reset(&mut self) {
        self.line.clear();
        self.complete = false;
    }

    /// Take the completed line and get ready for the next one.
    pub fn take(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.line).into_owned();
        self.reset();
        s
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new(MAX_LINE_SIZE)
    }
}
