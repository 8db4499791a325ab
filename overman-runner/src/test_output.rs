// Copyright (c) The overman Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Captured standard output and standard error of running tests.
//!
//! Each attempt of a test gets two streams. A stream is written to by the test (or by the task
//! forwarding a child process's pipe) and read by every reporter, each through its own
//! [`StdioReader`]. Chunks are kept only until every live reader has seen them, and a writer
//! waits while the slowest reader lags too far behind. Streams are independent of each other, so
//! a test producing a lot of output never holds up another test.

use bytes::Bytes;
use futures::Stream;
use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::Notify;

/// The default number of bytes a stream buffers before writers wait for readers.
pub const DEFAULT_STDIO_BUFFER: usize = 64 * 1024;

/// Creates a new stream, returning the writer and the first reader.
///
/// `capacity` is the number of bytes that may be buffered for the slowest reader before writes
/// wait. A single chunk is always accepted, even if it is larger than `capacity`.
pub fn stdio_channel(capacity: usize) -> (StdioWriter, StdioReader) {
    let mut state = StreamState::default();
    state.readers.insert(0, 0);
    state.next_reader_id = 1;
    state.writers = 1;

    let shared = Arc::new(Shared {
        state: Mutex::new(state),
        readable: Notify::new(),
        writable: Notify::new(),
    });

    let writer = StdioWriter {
        shared: shared.clone(),
        capacity,
    };
    let reader = StdioReader { shared, id: 0 };
    (writer, reader)
}

struct Shared {
    state: Mutex<StreamState>,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        // The state is always left consistent, so a panic elsewhere doesn't invalidate it.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct StreamState {
    chunks: VecDeque<Bytes>,
    // The sequence number of chunks[0].
    base: u64,
    buffered: usize,
    // Reader ID -> sequence number of the next chunk it will read.
    readers: HashMap<u64, u64>,
    next_reader_id: u64,
    writers: usize,
    closed: bool,
}

impl StreamState {
    fn end(&self) -> u64 {
        self.base + self.chunks.len() as u64
    }

    /// Drops chunks every reader has seen. Returns true if anything was dropped.
    fn collect(&mut self) -> bool {
        let min = self.readers.values().copied().min().unwrap_or(self.end());
        let mut freed = false;
        while self.base < min {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    self.buffered -= chunk.len();
                    self.base += 1;
                    freed = true;
                }
                None => break,
            }
        }
        freed
    }
}

/// The writing half of a captured output stream.
///
/// Writers can be cloned; all clones append to the same stream. The stream is closed once the
/// last writer is dropped.
pub struct StdioWriter {
    shared: Arc<Shared>,
    capacity: usize,
}

impl StdioWriter {
    /// Appends a chunk to the stream.
    ///
    /// Waits while the slowest reader lags by more than the stream's capacity. If no readers are
    /// left, the chunk is discarded. Returns a `BrokenPipe` error if the stream was closed.
    pub async fn write(&self, bytes: impl Into<Bytes>) -> io::Result<()> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Ok(());
        }

        loop {
            let notified = self.shared.writable.notified();
            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "output stream is closed",
                    ));
                }
                if state.readers.is_empty() {
                    return Ok(());
                }
                if state.buffered < self.capacity || state.chunks.is_empty() {
                    state.buffered += bytes.len();
                    state.chunks.push_back(bytes);
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Ends the stream. Readers see the remaining buffered chunks, then the end of the stream.
    ///
    /// Closing is idempotent.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// Returns true if the stream was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Clone for StdioWriter {
    fn clone(&self) -> Self {
        self.shared.lock().writers += 1;
        Self {
            shared: self.shared.clone(),
            capacity: self.capacity,
        }
    }
}

impl Drop for StdioWriter {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.lock();
            state.writers -= 1;
            state.writers == 0
        };
        if last {
            self.close();
        }
    }
}

impl fmt::Debug for StdioWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioWriter")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// A reading view of a captured output stream.
///
/// Each reader has its own position. Use [`fork`](Self::fork) to get another view that starts at
/// the same position. Dropping a reader unsubscribes it.
pub struct StdioReader {
    shared: Arc<Shared>,
    id: u64,
}

impl StdioReader {
    /// Creates an independent reader positioned where this one is.
    pub fn fork(&self) -> Self {
        let mut state = self.shared.lock();
        let id = state.next_reader_id;
        state.next_reader_id += 1;
        let position = state.readers.get(&self.id).copied().unwrap_or(state.base);
        state.readers.insert(id, position);
        Self {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Receives the next chunk, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut state = self.shared.lock();
                let position = *state.readers.get(&self.id)?;
                if position < state.end() {
                    let chunk = state.chunks[(position - state.base) as usize].clone();
                    state.readers.insert(self.id, position + 1);
                    let freed = state.collect();
                    drop(state);
                    if freed {
                        self.shared.writable.notify_waiters();
                    }
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Reads the rest of the stream into a buffer.
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Converts this reader into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures::stream::unfold(self, |mut reader| async move {
            let chunk = reader.recv().await?;
            Some((chunk, reader))
        })
    }
}

impl Drop for StdioReader {
    fn drop(&mut self) {
        let freed = {
            let mut state = self.shared.lock();
            state.readers.remove(&self.id);
            state.collect()
        };
        if freed {
            self.shared.writable.notify_waiters();
        }
    }
}

impl fmt::Debug for StdioReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioReader")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
