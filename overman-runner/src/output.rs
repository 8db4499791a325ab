// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output destinations for reporters and for internal errors.

use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fmt, io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Where an [`OutputSink`] writes to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SinkKind {
    /// The process's standard output.
    Stdout,

    /// The process's standard error.
    Stderr,

    /// A file on disk.
    File(Utf8PathBuf),

    /// An in-memory buffer, see [`OutputSink::buffer`].
    Buffer,

    /// An arbitrary writer.
    Writer,
}

/// A shared, asynchronous output destination.
///
/// Clones write to the same destination. Each call to [`write_all`](Self::write_all) is written
/// out as a unit, so concurrent writers interleave at chunk boundaries only.
#[derive(Clone)]
pub struct OutputSink {
    kind: SinkKind,
    inner: Arc<tokio::sync::Mutex<SinkInner>>,
}

struct SinkInner {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
    closed: bool,
}

impl OutputSink {
    /// Creates a sink writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::with_kind(SinkKind::Stdout, tokio::io::stdout())
    }

    /// Creates a sink writing to the process's standard error.
    pub fn stderr() -> Self {
        Self::with_kind(SinkKind::Stderr, tokio::io::stderr())
    }

    /// Creates a sink writing to an arbitrary writer.
    pub fn from_writer(writer: impl AsyncWrite + Send + 'static) -> Self {
        Self::with_kind(SinkKind::Writer, writer)
    }

    /// Creates a sink writing to a file, creating parent directories as required.
    pub async fn create_file(path: impl Into<Utf8PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self::with_kind(SinkKind::File(path), file))
    }

    /// Creates a sink writing to memory, along with a handle to read what was written.
    pub fn buffer() -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        let sink = Self::with_kind(
            SinkKind::Buffer,
            CaptureWriter {
                buf: captured.buf.clone(),
            },
        );
        (sink, captured)
    }

    fn with_kind(kind: SinkKind, writer: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            kind,
            inner: Arc::new(tokio::sync::Mutex::new(SinkInner {
                writer: Box::pin(writer),
                closed: false,
            })),
        }
    }

    /// Returns where this sink writes to.
    pub fn kind(&self) -> &SinkKind {
        &self.kind
    }

    /// Returns the path if this sink writes to a file.
    pub fn path(&self) -> Option<&Utf8Path> {
        match &self.kind {
            SinkKind::File(path) => Some(path),
            _ => None,
        }
    }

    /// Writes all of `bytes` to the sink.
    ///
    /// Returns a `BrokenPipe` error if the sink was shut down.
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "output sink was shut down",
            ));
        }
        inner.writer.write_all(bytes).await
    }

    /// Flushes buffered output.
    pub async fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.writer.flush().await
    }

    /// Flushes and shuts down the sink. Later writes fail; shutting down again is a no-op.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.writer.flush().await?;
        inner.writer.shutdown().await
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A handle to the contents of a sink created by [`OutputSink::buffer`].
#[derive(Clone, Debug, Default)]
pub struct CapturedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    /// Returns a copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns everything written so far, converting invalid UTF-8 lossily.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
