//! Exposes a blocking whole-transfer call as an incremental byte stream.
//!
//! The transfer runs on its own thread against one end of a bounded chunk
//! channel; the caller gets the other end. Closing the caller's end joins the
//! transfer thread, so a closed stream never has a transfer in flight.

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::errors::{FsError, FsResult};
use crate::handle::{ReadStream, WriteStream};

const PIPE_DEPTH: usize = 8;

type Transfer = thread::JoinHandle<io::Result<u64>>;

/// Runs `transfer` on a worker thread, handing it a writer whose bytes become
/// readable from the returned stream.
pub fn spawn_download<F>(label: String, transfer: F) -> PipeReader
where
    F: FnOnce(&mut dyn Write) -> io::Result<u64> + Send + 'static,
{
    let (chunk_tx, chunk_rx) = bounded::<Vec<u8>>(PIPE_DEPTH);
    let worker = thread::spawn(move || {
        let mut sink = ChunkSink { tx: chunk_tx };
        transfer(&mut sink)
    });
    debug!(target_path = label.as_str(), "download started");

    PipeReader {
        label,
        source: ChunkSource::new(chunk_rx),
        worker: Some(worker),
    }
}

/// Runs `transfer` on a worker thread, handing it a reader that yields the
/// bytes written to the returned stream until that stream is closed.
pub fn spawn_upload<F>(label: String, transfer: F) -> PipeWriter
where
    F: FnOnce(&mut dyn Read) -> io::Result<u64> + Send + 'static,
{
    let (chunk_tx, chunk_rx) = bounded::<Vec<u8>>(PIPE_DEPTH);
    let worker = thread::spawn(move || {
        let mut source = ChunkSource::new(chunk_rx);
        transfer(&mut source)
    });
    debug!(target_path = label.as_str(), "upload started");

    PipeWriter {
        label,
        tx: Some(chunk_tx),
        worker: Some(worker),
    }
}

pub struct PipeReader {
    label: String,
    source: ChunkSource,
    worker: Option<Transfer>,
}

impl PipeReader {
    /// Disconnects the pipe and waits for the transfer thread.
    fn finish(&mut self) -> FsResult<()> {
        self.source.disconnect();
        join_transfer(self.label.as_str(), "download", self.worker.take())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

impl ReadStream for PipeReader {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        self.finish()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.finish();
        }
    }
}

pub struct PipeWriter {
    label: String,
    tx: Option<Sender<Vec<u8>>>,
    worker: Option<Transfer>,
}

impl PipeWriter {
    fn finish(&mut self) -> FsResult<()> {
        self.tx.take();
        join_transfer(self.label.as_str(), "upload", self.worker.take())
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"))?;
        tx.send(buf.to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "transfer ended before stream close")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteStream for PipeWriter {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        self.finish()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.finish();
        }
    }
}

/// Failures are logged here because a dropped stream has no one to report to;
/// an explicit `close` also returns them.
fn join_transfer(label: &str, direction: &'static str, worker: Option<Transfer>) -> FsResult<()> {
    let Some(worker) = worker else {
        return Ok(());
    };

    match worker.join() {
        Ok(Ok(bytes)) => {
            debug!(target_path = label, direction, bytes, "transfer finished");
            Ok(())
        }
        Ok(Err(err)) if is_reader_closed(&err) => {
            debug!(target_path = label, direction, "transfer stopped after reader closed");
            Ok(())
        }
        Ok(Err(err)) => {
            warn!(target_path = label, direction, "transfer failed: {err}");
            Err(FsError::remote(direction, label, err))
        }
        Err(_) => {
            warn!(target_path = label, direction, "transfer thread panicked");
            Err(FsError::remote(
                direction,
                label,
                io::Error::other("transfer thread panicked"),
            ))
        }
    }
}

/// Raised inside a download when the caller closed its end of the pipe.
#[derive(Debug)]
struct ReaderClosed;

impl fmt::Display for ReaderClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("reader closed")
    }
}

impl Error for ReaderClosed {}

fn is_reader_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ReaderClosed>())
}

struct ChunkSink {
    tx: Sender<Vec<u8>>,
}

impl Write for ChunkSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, ReaderClosed))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChunkSource {
    rx: Option<Receiver<Vec<u8>>>,
    chunk: Vec<u8>,
    offset: usize,
}

impl ChunkSource {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx: Some(rx),
            chunk: Vec::new(),
            offset: 0,
        }
    }

    fn disconnect(&mut self) {
        self.rx.take();
    }
}

impl Read for ChunkSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.chunk.len() {
            let Some(rx) = self.rx.as_ref() else {
                return Ok(0);
            };
            match rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                // Sender gone: the transfer has written everything it will.
                Err(_) => return Ok(0),
            }
        }

        let available = &self.chunk[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}
