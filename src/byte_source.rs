//! Lazy producers of one file's (or one file block's) content

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One logical unit of work handed to a sender connection.
///
/// A source is owned by exactly one place at a time: the queue, a single
/// connection, or nobody once it is consumed.
pub trait ByteSource: Send {
    /// Identifier written into the header ('/'-separated relative path).
    fn identifier(&self) -> &str;

    /// Number of data bytes this source produces.
    fn size(&self) -> u64;

    /// Position of this source's first byte within the destination file.
    fn offset(&self) -> u64 {
        0
    }

    /// Length of the whole file this source belongs to.
    fn file_size(&self) -> u64 {
        self.offset() + self.size()
    }

    /// No more data will be produced. May be true together with
    /// `has_error()`.
    fn finished(&self) -> bool;

    fn has_error(&self) -> bool;

    /// Produce the next chunk and return its length. The bytes are
    /// available from `chunk()` until the next call. Must not be called
    /// once `finished()` is true, unless `reset()` ran.
    ///
    /// A source may report bytes and `has_error()` from the same read.
    /// Callers must not use such a chunk.
    fn read(&mut self) -> io::Result<usize>;

    /// Bytes produced by the last `read`.
    fn chunk(&self) -> &[u8];

    /// Rewind to the first byte so the source can be sent again.
    fn reset(&mut self);
}

/// File-backed source. The file is opened on first read and closed as soon
/// as the last byte was produced, so a large queue does not hold open
/// descriptors.
pub struct FileByteSource {
    path: PathBuf,
    id: String,
    offset: u64,
    size: u64,
    file_size: u64,
    buffer_size: usize,
    file: Option<File>,
    buf: Vec<u8>,
    len: usize,
    bytes_read: u64,
    error: bool,
}

impl FileByteSource {
    pub fn new(path: &Path, id: &str, size: u64, offset: u64, buffer_size: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            id: id.to_string(),
            offset,
            size,
            file_size: offset + size,
            buffer_size: buffer_size.max(1),
            file: None,
            buf: Vec::new(),
            len: 0,
            bytes_read: 0,
            error: false,
        }
    }

    /// Mark this source as one block of a file `file_size` bytes long.
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    fn open(&mut self) -> io::Result<()> {
        let mut f = File::open(&self.path)?;
        if self.offset > 0 {
            f.seek(SeekFrom::Start(self.offset))?;
        }
        self.file = Some(f);
        Ok(())
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.error = true;
        self.file = None;
        self.len = 0;
        err
    }
}

impl ByteSource for FileByteSource {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn finished(&self) -> bool {
        self.error || self.bytes_read >= self.size
    }

    fn has_error(&self) -> bool {
        self.error
    }

    fn read(&mut self) -> io::Result<usize> {
        self.len = 0;
        if self.finished() {
            return Ok(0);
        }
        if self.file.is_none() {
            if let Err(e) = self.open() {
                return Err(self.fail(e));
            }
        }
        let want = (self.size - self.bytes_read).min(self.buffer_size as u64) as usize;
        if self.buf.len() < want {
            self.buf.resize(want, 0);
        }
        let result = loop {
            let Some(file) = self.file.as_mut() else {
                break Err(io::Error::other("file handle missing"));
            };
            match file.read(&mut self.buf[..want]) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} ended after {} of {} bytes",
                            self.path.display(),
                            self.bytes_read,
                            self.size
                        ),
                    ))
                }
                Ok(n) => break Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        let n = match result {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };
        self.bytes_read += n as u64;
        self.len = n;
        if self.bytes_read >= self.size {
            self.file = None;
        }
        Ok(n)
    }

    fn chunk(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn reset(&mut self) {
        self.file = None;
        self.len = 0;
        self.bytes_read = 0;
        self.error = false;
    }
}

/// Source over an owned buffer, handed out in fixed-size chunks.
pub struct MemoryByteSource {
    id: String,
    data: Vec<u8>,
    chunk_size: usize,
    start: usize,
    pos: usize,
}

impl MemoryByteSource {
    pub fn new(id: &str, data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            id: id.to_string(),
            data,
            chunk_size: chunk_size.max(1),
            start: 0,
            pos: 0,
        }
    }
}

impl ByteSource for MemoryByteSource {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn has_error(&self) -> bool {
        false
    }

    fn read(&mut self) -> io::Result<usize> {
        self.start = self.pos;
        self.pos = (self.start + self.chunk_size).min(self.data.len());
        Ok(self.pos - self.start)
    }

    fn chunk(&self) -> &[u8] {
        &self.data[self.start..self.pos]
    }

    fn reset(&mut self) {
        self.start = 0;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn drain(source: &mut dyn ByteSource) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while !source.finished() {
            source.read()?;
            out.extend_from_slice(source.chunk());
        }
        Ok(out)
    }

    #[test]
    fn file_source_reads_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&content).unwrap();

        let mut src = FileByteSource::new(&path, "data.bin", content.len() as u64, 0, 4096);
        assert_eq!(src.read().unwrap(), 4096);
        src.reset();
        assert_eq!(drain(&mut src).unwrap(), content);
        assert!(!src.has_error());
    }

    #[test]
    fn file_source_block_reads_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        File::create(&path).unwrap().write_all(b"0123456789").unwrap();

        let mut src = FileByteSource::new(&path, "data.bin", 4, 3, 1024).with_file_size(10);
        assert_eq!(src.offset(), 3);
        assert_eq!(src.file_size(), 10);
        assert_eq!(drain(&mut src).unwrap(), b"3456");
    }

    #[test]
    fn file_source_errors_when_file_shrank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        File::create(&path).unwrap().write_all(b"abc").unwrap();

        let mut src = FileByteSource::new(&path, "short.bin", 10, 0, 1024);
        assert_eq!(src.read().unwrap(), 3);
        assert_eq!(src.chunk(), b"abc");
        assert!(src.read().is_err());
        assert!(src.has_error());
        assert!(src.chunk().is_empty());
        assert!(src.finished());
    }

    #[test]
    fn file_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = FileByteSource::new(&dir.path().join("nope"), "nope", 5, 0, 16);
        assert!(src.read().is_err());
        assert!(src.has_error());
        src.reset();
        assert!(!src.has_error());
    }

    #[test]
    fn empty_source_is_finished_immediately() {
        let src = MemoryByteSource::new("empty", Vec::new(), 8);
        assert!(src.finished());
        assert_eq!(src.size(), 0);
    }

    #[test]
    fn memory_source_chunks() {
        let mut src = MemoryByteSource::new("m", b"abcdefg".to_vec(), 3);
        for want in [&b"abc"[..], b"def", b"g"] {
            src.read().unwrap();
            assert_eq!(src.chunk(), want);
        }
        assert!(src.finished());
    }
}
