// src/exec/logs.rs

//! Log multiplexer: copies each container's output to an append-only file
//! and to a prefixed console writer.
//!
//! One Tokio task per container. A failing copy is reported on the
//! multiplexer's error channel and never aborts sibling copies or the
//! supervising loop.

use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Byte stream of one container's output, as handed out by a transport.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// Structured end-of-stream marker.
///
/// Transports wrap this in an `io::Error` when the server closes a stream
/// underneath a reader (pod deleted, container removed). The copy loop
/// treats it exactly like EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("log stream closed by the transport")
    }
}

impl std::error::Error for StreamClosed {}

pub fn stream_closed() -> io::Error {
    io::Error::other(StreamClosed)
}

pub fn is_stream_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|e| e.is::<StreamClosed>())
}

/// Error reported on the side channel; never part of the run's result.
#[derive(Error, Debug)]
pub enum LogCopyError {
    #[error("failed to open log file {path:?} for {unit}/{container}: {source}")]
    Open {
        unit: String,
        container: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start log stream for {unit}/{container}: {reason}")]
    Stream {
        unit: String,
        container: String,
        reason: String,
    },

    #[error("log copy for {unit}/{container} failed: {source}")]
    Copy {
        unit: String,
        container: String,
        #[source]
        source: io::Error,
    },
}

/// Shared console target. Each prefixed line is written under one lock so
/// lines from different containers never interleave mid-line.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<dyn Write + Send>>,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

impl Console {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(writer)),
        }
    }

    fn write_prefixed(&self, prefix: &str, since: Duration, line: &[u8]) -> io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        write!(out, "{prefix} [+{since:?}]: ")?;
        out.write_all(line)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Console writer prefixing every line with the container name and the
/// elapsed time since the writer was created, truncated to milliseconds.
#[derive(Debug, Clone)]
pub struct ConsoleLogWriter {
    prefix: String,
    started: Instant,
    console: Console,
}

impl ConsoleLogWriter {
    pub fn new(prefix: impl Into<String>, console: Console) -> Self {
        Self {
            prefix: prefix.into(),
            started: Instant::now(),
            console,
        }
    }

    pub fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let since = truncate_to_millis(self.started.elapsed());
        self.console.write_prefixed(&self.prefix, since, line)
    }
}

pub fn truncate_to_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Per-container, per-run pair of sinks.
pub struct LogSink {
    path: PathBuf,
    file: File,
    console: ConsoleLogWriter,
}

impl LogSink {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line as received to the file and, without its line
    /// terminator, to the console.
    pub async fn write_line(&mut self, raw: &[u8]) -> io::Result<()> {
        self.file.write_all(raw).await?;
        self.console.write_line(strip_line_ending(raw))
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

fn strip_line_ending(raw: &[u8]) -> &[u8] {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// How a copy loop ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// The stream ended, normally or through a [`StreamClosed`] signal.
    EndOfStream,
    /// The stop token fired.
    Stopped,
}

/// Longest line handed to the sinks in one piece; longer lines are
/// flushed in chunks of this size.
pub const MAX_LINE_LEN: u64 = 64 * 1024;

/// Copy `reader` line by line into `sink` until EOF, a benign close, an
/// error, or `stop` firing.
pub async fn copy_lines<R>(reader: R, sink: &mut LogSink, stop: &CancellationToken) -> io::Result<CopyEnd>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(4096);

    loop {
        if stop.is_cancelled() {
            return Ok(CopyEnd::Stopped);
        }

        buf.clear();
        let mut line = (&mut reader).take(MAX_LINE_LEN);
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(CopyEnd::Stopped),
            read = line.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => return Ok(CopyEnd::EndOfStream),
            Ok(_) => sink.write_line(&buf).await?,
            Err(e) if is_stream_closed(&e) => return Ok(CopyEnd::EndOfStream),
            Err(e) => return Err(e),
        }
    }
}

/// Fans container output out to disk and console.
#[derive(Debug, Clone)]
pub struct LogMultiplexer {
    logs_dir: PathBuf,
    console: Console,
    errors: mpsc::UnboundedSender<LogCopyError>,
}

impl LogMultiplexer {
    /// Create a multiplexer writing under `logs_dir`, plus the receiving end
    /// of its error side channel.
    pub fn new(
        logs_dir: impl Into<PathBuf>,
        console: Console,
    ) -> (Self, mpsc::UnboundedReceiver<LogCopyError>) {
        let (errors, errors_rx) = mpsc::unbounded_channel();
        (
            Self {
                logs_dir: logs_dir.into(),
                console,
                errors,
            },
            errors_rx,
        )
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// `<logs-dir>/<unit>-<container>.log`
    pub fn log_path(&self, unit: &str, container: &str) -> PathBuf {
        self.logs_dir.join(format!("{unit}-{container}.log"))
    }

    pub async fn open_sink(&self, unit: &str, container: &str) -> Result<LogSink, LogCopyError> {
        let path = self.log_path(unit, container);
        let open_err = |source| LogCopyError::Open {
            unit: unit.to_string(),
            container: container.to_string(),
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.logs_dir).await.map_err(open_err)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_err)?;

        Ok(LogSink {
            path: path.clone(),
            file,
            console: ConsoleLogWriter::new(container, self.console.clone()),
        })
    }

    /// Report a copy failure on the side channel.
    pub fn report(&self, err: LogCopyError) {
        warn!(error = %err, "log copy error");
        if self.errors.send(err).is_err() {
            debug!("log error receiver dropped; error only logged");
        }
    }

    /// Spawn the copy task for one container.
    ///
    /// `open` yields the container's output stream; the sink is opened
    /// first so the log file exists even if the stream cannot be started.
    pub fn spawn<F, R>(
        &self,
        unit: String,
        container: String,
        open: F,
        stop: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Future<Output = crate::errors::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mux = self.clone();

        tokio::spawn(async move {
            let mut sink = match mux.open_sink(&unit, &container).await {
                Ok(sink) => sink,
                Err(err) => {
                    mux.report(err);
                    return;
                }
            };

            let stream = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                opened = open => match opened {
                    Ok(stream) => Some(stream),
                    Err(err) => {
                        mux.report(LogCopyError::Stream {
                            unit: unit.clone(),
                            container: container.clone(),
                            reason: err.to_string(),
                        });
                        None
                    }
                },
            };

            if let Some(stream) = stream {
                info!(unit = %unit, container = %container, logfile = ?sink.path(), "logging started");
                match copy_lines(stream, &mut sink, &stop).await {
                    Ok(end) => debug!(unit = %unit, container = %container, ?end, "log copy ended"),
                    Err(source) => mux.report(LogCopyError::Copy {
                        unit: unit.clone(),
                        container: container.clone(),
                        source,
                    }),
                }
                // The stream handle is dropped here, closing it on every path.
            }

            if let Err(e) = sink.close().await {
                warn!(unit = %unit, container = %container, error = %e, "failed closing log file");
            }
            info!(unit = %unit, container = %container, "logging terminated");
        })
    }
}

/// Give copy tasks `window` to reach end of stream, then fire `stop` and
/// reap whatever is left.
pub async fn drain_copies(mut tasks: Vec<JoinHandle<()>>, window: Duration, stop: &CancellationToken) {
    if tasks.is_empty() {
        stop.cancel();
        return;
    }

    let drained = tokio::time::timeout(window, async {
        for task in tasks.iter_mut() {
            if let Err(e) = task.await {
                warn!(error = %e, "log copy task failed");
            }
        }
    })
    .await;

    stop.cancel();
    if drained.is_err() {
        debug!("log copies still running after drain window; stopping them");
        for mut task in tasks.into_iter().filter(|t| !t.is_finished()) {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                warn!("log copy did not stop in time; aborting");
                task.abort();
            }
        }
    }
}
