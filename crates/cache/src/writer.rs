//! Sources of entry content handed to store operations

use crate::{Error, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Produces the bytes of one entry being stored
///
/// `write_to` is the primary path. `open_stream` defaults to buffering
/// `write_to` in memory; implementations backed by something readable
/// should override it.
pub trait EntryWriter: Send + Sync {
    /// Write the full content to `output`, returning the bytes written
    fn write_to(&self, output: &mut dyn Write) -> io::Result<u64>;

    /// Length of the content in bytes
    fn size(&self) -> u64;

    /// Open the content as a stream
    fn open_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        let mut buffer = Vec::with_capacity(usize::try_from(self.size()).unwrap_or(0));
        self.write_to(&mut buffer)?;
        Ok(Box::new(Cursor::new(buffer)))
    }
}

/// Collect the full content of a writer into memory
pub fn materialize(writer: &dyn EntryWriter) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(usize::try_from(writer.size()).unwrap_or(0));
    writer
        .write_to(&mut buffer)
        .map_err(|e| Error::io_no_path(e, "materialize entry"))?;
    Ok(Bytes::from(buffer))
}

/// In-memory entry content
#[derive(Debug, Clone)]
pub struct BytesWriter {
    data: Bytes,
}

impl BytesWriter {
    /// Wrap a buffer
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl EntryWriter for BytesWriter {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<u64> {
        output.write_all(&self.data)?;
        Ok(self.data.len() as u64)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn open_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// Entry content read from a file on disk
#[derive(Debug, Clone)]
pub struct FileWriter {
    path: PathBuf,
    size: u64,
}

impl FileWriter {
    /// Describe a file whose length is already known
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Describe a file, reading its length from metadata
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)
            .map_err(|e| Error::io(e, &path, "metadata"))?
            .len();
        Ok(Self { path, size })
    }
}

impl EntryWriter for FileWriter {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<u64> {
        let mut file = File::open(&self.path)?;
        io::copy(&mut file, output)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Tallies of entries actually written by [`CountingWriter`]s
#[derive(Debug, Default)]
pub struct WriteCounters {
    entries: AtomicU64,
    bytes: AtomicU64,
}

impl WriteCounters {
    /// Entries written so far
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Bytes written so far
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn mark(&self, size: u64) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }
}

/// Counts an entry as stored the first time its content is consumed
pub struct CountingWriter {
    inner: Box<dyn EntryWriter>,
    counters: Arc<WriteCounters>,
    marked: AtomicBool,
}

impl CountingWriter {
    /// Wrap a writer
    #[must_use]
    pub fn new(inner: Box<dyn EntryWriter>, counters: Arc<WriteCounters>) -> Self {
        Self {
            inner,
            counters,
            marked: AtomicBool::new(false),
        }
    }

    fn mark_stored(&self) {
        if !self.marked.swap(true, Ordering::Relaxed) {
            self.counters.mark(self.inner.size());
        }
    }
}

impl EntryWriter for CountingWriter {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<u64> {
        self.mark_stored();
        self.inner.write_to(output)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn open_stream(&self) -> io::Result<Box<dyn Read + Send>> {
        self.mark_stored();
        self.inner.open_stream()
    }
}
