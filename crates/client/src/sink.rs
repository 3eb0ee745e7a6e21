use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Body of a successful command response.
    Response,
    /// Body of a rejected command.
    Failure,
    /// Untagged engine output.
    Engine,
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Response => "response",
            Self::Failure => "failure",
            Self::Engine => "engine",
            Self::Error => "error",
        })
    }
}

/// User-visible transcript of the session. Separate from `tracing`, which is
/// for operators.
pub trait LogSink: Send {
    fn log(&mut self, kind: LogKind, text: &str);
}

pub struct TranscriptSink<W> {
    out: W,
}

impl<W: Write + Send> TranscriptSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> LogSink for TranscriptSink<W> {
    fn log(&mut self, kind: LogKind, text: &str) {
        let stamp = now_rfc3339();
        for line in text.lines() {
            // A closed stdout is not worth taking the session down for.
            let _ = writeln!(self.out, "{stamp} {kind} {line}");
        }
        let _ = self.out.flush();
    }
}

/// Keeps entries in memory for embedders that render the transcript themselves.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<(LogKind, String)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogKind, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn log(&mut self, kind: LogKind, text: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((kind, text.to_string()));
        }
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_prefixes_every_line() {
        let mut sink = TranscriptSink::new(Vec::new());
        sink.log(LogKind::Response, "play\ngenmove");
        sink.log(LogKind::Failure, "unknown command");
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" response play"));
        assert!(lines[1].ends_with(" response genmove"));
        assert!(lines[2].ends_with(" failure unknown command"));
        // RFC 3339 stamps start with the year.
        assert!(lines[0].starts_with("20"));
    }

    #[test]
    fn memory_sink_shares_entries_between_clones() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.log(LogKind::Error, "tree diverged");
        assert_eq!(sink.entries(), vec![(LogKind::Error, "tree diverged".to_string())]);
    }
}
