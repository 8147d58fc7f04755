use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

/// Source side of a transfer: hands out the file in chunks.
pub struct FileChunker<R = File> {
    reader: R,
    total_size: Option<u64>,
    bytes_read: u64,
    exhausted: bool,
}

impl FileChunker<File> {
    /// Open a file for streaming
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "is a directory, not a file",
            ));
        }
        let mut chunker = Self::new(file);
        chunker.total_size = Some(metadata.len());
        Ok(chunker)
    }
}

impl<R: Read> FileChunker<R> {
    /// Stream from any reader of unknown length
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            total_size: None,
            bytes_read: 0,
            exhausted: false,
        }
    }

    /// Read up to `max_len` bytes. Short reads from the underlying reader
    /// are retried, so a result shorter than `max_len` means end of file.
    pub fn read_chunk(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; max_len];
        let mut filled = 0;

        while filled < max_len && !self.exhausted {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => self.exhausted = true,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        buffer.truncate(filled);
        self.bytes_read += filled as u64;
        Ok(buffer)
    }

    /// Size reported by the filesystem when the file was opened
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Sink side of a transfer: file or stdout.
pub struct FileWriter<W = File> {
    sink: W,
    bytes_written: u64,
}

impl FileWriter<File> {
    /// Create (or truncate) the destination file
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(File::create(path)?))
    }

    /// Flush and sync to disk
    pub fn finalize(mut self) -> io::Result<()> {
        self.sink.flush()?;
        self.sink.sync_all()
    }
}

impl<W: Write> FileWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            bytes_written: 0,
        }
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.sink.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and hand back the sink
    pub fn into_inner(mut self) -> io::Result<W> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}
