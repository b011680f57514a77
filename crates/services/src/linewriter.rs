//! Line-oriented buffering for child-process output.
//!
//! Child stdio arrives in arbitrary chunks. [`LineWriter`] reassembles the
//! chunks and forwards exactly the complete, non-empty lines to a
//! [`LineSink`], holding any unterminated tail until a later chunk (or
//! [`LineWriter::finish`]) completes it.
//!
//! Two sinks cover the node's needs: [`TracingSink`] turns each line into
//! a structured log event, and [`BoundPortScanner`] additionally watches
//! the stream for a "bound to port N" announcement, which is how the
//! machine manager reports a dynamically-chosen listen port.

use tracing::info;

/// Marker the machine manager prints when it has picked a listen port.
pub const PORT_ANNOUNCEMENT: &str = "bound to port";

// ════════════════════════════════════════════════════════════════════════════
// SINKS
// ════════════════════════════════════════════════════════════════════════════

/// Consumer of complete lines, newline stripped.
pub trait LineSink: Send {
    fn write_line(&mut self, line: &str);
}

/// Logs every line as an info event tagged with the service name and
/// stream it came from.
#[derive(Debug)]
pub struct TracingSink {
    service: String,
    stream: &'static str,
}

impl TracingSink {
    pub fn new(service: impl Into<String>, stream: &'static str) -> Self {
        Self {
            service: service.into(),
            stream,
        }
    }
}

impl LineSink for TracingSink {
    fn write_line(&mut self, line: &str) {
        info!(service = %self.service, stream = self.stream, "{line}");
    }
}

/// Forwards lines to an inner sink while watching for the first port
/// announcement; the hook fires at most once.
pub struct BoundPortScanner<S: LineSink, F: FnOnce(u16) + Send> {
    inner: S,
    on_port: Option<F>,
}

impl<S: LineSink, F: FnOnce(u16) + Send> BoundPortScanner<S, F> {
    pub fn new(inner: S, on_port: F) -> Self {
        Self {
            inner,
            on_port: Some(on_port),
        }
    }
}

impl<S: LineSink, F: FnOnce(u16) + Send> LineSink for BoundPortScanner<S, F> {
    fn write_line(&mut self, line: &str) {
        self.inner.write_line(line);
        if self.on_port.is_some() {
            if let Some(port) = parse_bound_port(line) {
                if let Some(hook) = self.on_port.take() {
                    hook(port);
                }
            }
        }
    }
}

/// Extracts the port from an announcement line such as
/// `remote machine manager bound to port 36187`.
pub fn parse_bound_port(line: &str) -> Option<u16> {
    let at = line.find(PORT_ANNOUNCEMENT)?;
    let rest = line[at + PORT_ANNOUNCEMENT.len()..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// ════════════════════════════════════════════════════════════════════════════
// LINE WRITER
// ════════════════════════════════════════════════════════════════════════════

/// Buffering filter that emits only complete, non-empty lines.
#[derive(Debug)]
pub struct LineWriter<S: LineSink> {
    sink: S,
    buffer: Vec<u8>,
}

impl<S: LineSink> LineWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            buffer: Vec::new(),
        }
    }

    /// Feeds a chunk, forwarding every line it completes.
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = &line[..newline];
            if !line.is_empty() {
                self.sink.write_line(&String::from_utf8_lossy(line));
            }
        }
    }

    /// Flushes any unterminated tail as a final line and returns the sink.
    pub fn finish(mut self) -> S {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.sink.write_line(&String::from_utf8_lossy(&tail));
        }
        self.sink
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        lines: Vec<String>,
    }

    impl LineSink for RecordingSink {
        fn write_line(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // A. Line assembly
    // ────────────────────────────────────────────────────────────────────────

    #[test]
    fn reassembles_lines_across_chunks() {
        let mut writer = LineWriter::new(RecordingSink::default());
        writer.write(b"hel");
        writer.write(b"lo\nwor");
        writer.write(b"ld\n");
        let sink = writer.finish();
        assert_eq!(sink.lines, vec!["hello", "world"]);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut writer = LineWriter::new(RecordingSink::default());
        writer.write(b"one\ntwo\nthree\n");
        let sink = writer.finish();
        assert_eq!(sink.lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn empty_lines_are_dropped() {
        let mut writer = LineWriter::new(RecordingSink::default());
        writer.write(b"a\n\n\nb\n");
        let sink = writer.finish();
        assert_eq!(sink.lines, vec!["a", "b"]);
    }

    #[test]
    fn trailing_partial_is_held_until_completed() {
        let mut writer = LineWriter::new(RecordingSink::default());
        writer.write(b"started but");
        assert!(writer.sink_lines_empty());
        writer.write(b" finished\n");
        let sink = writer.finish();
        assert_eq!(sink.lines, vec!["started but finished"]);
    }

    #[test]
    fn finish_flushes_the_remainder() {
        let mut writer = LineWriter::new(RecordingSink::default());
        writer.write(b"no newline at end");
        let sink = writer.finish();
        assert_eq!(sink.lines, vec!["no newline at end"]);
    }

    impl LineWriter<RecordingSink> {
        fn sink_lines_empty(&self) -> bool {
            self.sink.lines.is_empty()
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // B. Port scanning
    // ────────────────────────────────────────────────────────────────────────

    #[test]
    fn parses_port_announcements() {
        assert_eq!(
            parse_bound_port("remote machine manager bound to port 36187"),
            Some(36187)
        );
        assert_eq!(parse_bound_port("bound to port 80 (http)"), Some(80));
        assert_eq!(parse_bound_port("nothing of interest"), None);
        assert_eq!(parse_bound_port("bound to port next-door"), None);
    }

    #[test]
    fn scanner_fires_once_and_keeps_forwarding() {
        let mut seen = Vec::new();
        {
            let scanner = BoundPortScanner::new(RecordingSink::default(), |port| {
                seen.push(port);
            });
            let mut writer = LineWriter::new(scanner);
            writer.write(b"starting up\n");
            writer.write(b"manager bound to port 4444\n");
            writer.write(b"manager bound to port 5555\n");
            let scanner = writer.finish();
            assert_eq!(scanner.inner.lines.len(), 3);
        }
        assert_eq!(seen, vec![4444]);
    }
}
