//! Captured job output.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// One line of job output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job: String,
    pub attempt: u32,
    pub stream: OutputStream,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Live receiver of job output, for example a terminal printer.
pub type LogSink = mpsc::UnboundedSender<OutputLine>;

/// Collects output lines and forwards them to an optional sink.
pub(crate) struct LogCollector {
    job: String,
    attempt: u32,
    lines: Vec<String>,
    sink: Option<LogSink>,
}

impl LogCollector {
    pub fn new(job: &str, attempt: u32, sink: Option<LogSink>) -> Self {
        Self {
            job: job.to_string(),
            attempt,
            lines: Vec::new(),
            sink,
        }
    }

    pub fn push(&mut self, stream: OutputStream, content: String) {
        if let Some(sink) = &self.sink {
            let line = OutputLine {
                job: self.job.clone(),
                attempt: self.attempt,
                stream,
                content: content.clone(),
                timestamp: Utc::now(),
            };
            // A closed sink only stops live output.
            if sink.send(line).is_err() {
                self.sink = None;
            }
        }
        self.lines.push(content);
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Forward every line of `reader` to `tx` until EOF.
pub(crate) async fn pump_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_forwards_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut collector = LogCollector::new("build", 2, Some(tx));
        collector.push(OutputStream::Stdout, "compiling".into());
        collector.push(OutputStream::Stderr, "warning".into());

        let first = rx.try_recv().unwrap();
        assert_eq!(first.job, "build");
        assert_eq!(first.attempt, 2);
        assert_eq!(first.content, "compiling");
        assert_eq!(rx.try_recv().unwrap().stream, OutputStream::Stderr);
        assert_eq!(collector.into_lines(), vec!["compiling", "warning"]);
    }

    #[test]
    fn test_closed_sink_keeps_collecting() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut collector = LogCollector::new("build", 1, Some(tx));
        collector.push(OutputStream::Stdout, "one".into());
        collector.push(OutputStream::Stdout, "two".into());
        assert_eq!(collector.into_lines().len(), 2);
    }
}
