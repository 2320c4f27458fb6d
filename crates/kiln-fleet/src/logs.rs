//! Instance log capture.
//!
//! A [`LogSink`] tees everything an instance prints into an in-memory
//! buffer, the instance's `kiln.log` and, optionally, stdout with a
//! `"<name>: "` prefix on every line. [`LogFilter`] strips known-benign
//! noise from the buffered copy when a failure is reported; the log file is
//! never filtered.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing_subscriber::fmt::MakeWriter;

/// Substrings of log lines that are dropped from failure reports.
pub const DEFAULT_DENYLIST: &[&str] = &["failed to connect to embedded store"];

#[derive(Debug)]
struct SinkInner {
    buffer: Mutex<Vec<u8>>,
    file: Mutex<File>,
    console: Option<Console>,
}

#[derive(Debug)]
struct Console {
    prefix: String,
    partial: Mutex<Vec<u8>>,
}

impl Console {
    fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut partial = self.partial.lock().unwrap_or_else(PoisonError::into_inner);
        partial.extend_from_slice(buf);
        let Some(last_newline) = partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };
        let complete: Vec<u8> = partial.drain(..=last_newline).collect();
        drop(partial);

        let mut out = io::stdout().lock();
        for line in complete.split_inclusive(|b| *b == b'\n') {
            out.write_all(self.prefix.as_bytes())?;
            out.write_all(line)?;
        }
        out.flush()
    }
}

/// Shared, cloneable log destination of one instance.
#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    /// Creates (truncating) `log_file`. With `console_name`, lines are also
    /// echoed to stdout prefixed by `"<name>: "`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the log file cannot be created.
    pub fn create(log_file: &Path, console_name: Option<&str>) -> io::Result<Self> {
        let file = File::create(log_file)?;
        Ok(Self {
            inner: Arc::new(SinkInner {
                buffer: Mutex::new(Vec::new()),
                file: Mutex::new(file),
                console: console_name.map(|name| Console {
                    prefix: format!("{name}: "),
                    partial: Mutex::new(Vec::new()),
                }),
            }),
        })
    }

    /// Everything captured so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        let buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Copies `reader` into the sink line by line until EOF.
    pub async fn pump<R>(self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let mut sink = self.clone();
                    if sink.write_all(&line).is_err() {
                        break;
                    }
                },
            }
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        self.inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(buf)?;
        if let Some(console) = &self.inner.console {
            console.write(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Removes denylisted lines from a log report.
#[derive(Debug, Clone)]
pub struct LogFilter {
    denylist: Vec<String>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DENYLIST.iter().map(ToString::to_string))
    }
}

impl LogFilter {
    /// Filter dropping lines that contain any of `patterns`.
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            denylist: patterns.into_iter().collect(),
        }
    }

    /// `logs` without the denylisted lines. Every kept line ends in `\n`.
    #[must_use]
    pub fn filter(&self, logs: &str) -> String {
        let mut output = String::with_capacity(logs.len());
        for line in logs.lines() {
            if self.denylist.iter().any(|pattern| line.contains(pattern.as_str())) {
                continue;
            }
            output.push_str(line);
            output.push('\n');
        }
        output
    }
}
