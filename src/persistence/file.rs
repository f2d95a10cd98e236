//! Capture files: a plain sequence of framed records, written while tapping
//! and read back to replay through the produce loop.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::engine::{MessageSink, MessageSource};
use crate::message::{BrokerMessage, PersistentMessage, RecordReader, write_frame};
use crate::utils::error::{BoxError, Result};

/// Runs blocking file I/O from async code. On a multi-threaded runtime the
/// worker hands its other tasks off first; a current-thread runtime has no
/// other worker to hand them to, so the call just blocks it.
fn blocking_io<T>(io: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(io),
        _ => io(),
    }
}

/// Appends every message it is given to a capture file.
///
/// As a [`MessageSink`] every message is written and flushed before the
/// consume loop moves on.
#[derive(Debug)]
pub struct CaptureFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl CaptureFileSink {
    /// Creates (or truncates) `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::from_file(path.as_ref(), file))
    }

    /// Opens `path` for appending, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(path.as_ref(), file))
    }

    fn from_file(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            written: 0,
        }
    }

    /// Writes one record and flushes it, so a capture interrupted at any
    /// point ends on a frame boundary or with a single truncated frame.
    pub fn write(&mut self, message: &PersistentMessage) -> Result<()> {
        write_frame(&mut self.writer, message)?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageSink for CaptureFileSink {
    async fn on_message(&mut self, message: BrokerMessage) -> std::result::Result<(), BoxError> {
        let record = PersistentMessage::capture(&message);
        blocking_io(|| self.write(&record)).map_err(Into::into)
    }
}

/// Reads a capture file record by record.
///
/// By default a corrupt record fails the read. With
/// [`skip_corrupt`](Self::skip_corrupt) it is logged and the next record is
/// returned instead.
#[derive(Debug)]
pub struct CaptureFileSource {
    records: RecordReader<BufReader<File>>,
    skip_corrupt: bool,
    skipped: usize,
}

impl CaptureFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "replaying capture file");
        Ok(Self {
            records: RecordReader::new(BufReader::new(file)),
            skip_corrupt: false,
            skipped: 0,
        })
    }

    pub fn skip_corrupt(mut self, skip: bool) -> Self {
        self.skip_corrupt = skip;
        self
    }

    /// Records dropped because they could not be decoded.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn next_record(&mut self) -> Result<Option<PersistentMessage>> {
        loop {
            match self.records.next() {
                None => return Ok(None),
                Some(Ok(message)) => return Ok(Some(message)),
                Some(Err(err)) if self.skip_corrupt => {
                    self.skipped += 1;
                    warn!(error = %err, "skipping corrupt record");
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl MessageSource for CaptureFileSource {
    async fn next_message(&mut self) -> std::result::Result<Option<PersistentMessage>, BoxError> {
        blocking_io(|| self.next_record()).map_err(Into::into)
    }
}
