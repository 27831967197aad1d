//! Wire format shared by the sender and the receiver
//!
//! Per byte source:
//! `FILE_CMD | id_len u16 | id | offset u64 | size u64 | file_size u64`
//! followed by exactly `size` raw data bytes. All integers little endian.
//! `file_size` is the length of the whole destination file, so a block
//! knows where the file ends.
//! A connection ends with a single `DONE_CMD` byte from the sender, which
//! the receiver answers with `DONE_CMD` before closing its side.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

pub const FILE_CMD: u8 = 0x44;
pub const DONE_CMD: u8 = 0x4C;

/// Fixed part of a file header: cmd + id_len + offset + size + file_size
pub const HEADER_FIXED_LEN: usize = 1 + 2 + 8 + 8 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub id: String,
    pub offset: u64,
    pub size: u64,
    pub file_size: u64,
}

impl FileHeader {
    /// Header for a source that ends its file.
    pub fn new(id: &str, offset: u64, size: u64) -> Self {
        Self {
            id: id.to_string(),
            offset,
            size,
            file_size: offset + size,
        }
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_LEN + self.id.len()
    }
}

/// Encode a header, including the leading `FILE_CMD` byte.
pub fn encode_header(header: &FileHeader) -> Result<Vec<u8>> {
    let id_len = u16::try_from(header.id.len())
        .with_context(|| format!("identifier too long: {} bytes", header.id.len()))?;
    let mut buf = Vec::with_capacity(header.encoded_len());
    buf.push(FILE_CMD);
    buf.extend_from_slice(&id_len.to_le_bytes());
    buf.extend_from_slice(header.id.as_bytes());
    buf.extend_from_slice(&header.offset.to_le_bytes());
    buf.extend_from_slice(&header.size.to_le_bytes());
    buf.extend_from_slice(&header.file_size.to_le_bytes());
    Ok(buf)
}

/// Decode the remainder of a header after its `FILE_CMD` byte was consumed.
pub fn read_header_body<R: Read>(reader: &mut R) -> Result<FileHeader> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len).context("reading id length")?;
    let mut id = vec![0u8; u16::from_le_bytes(len) as usize];
    reader.read_exact(&mut id).context("reading id")?;
    let id = String::from_utf8(id).context("id is not valid UTF-8")?;
    let mut word = [0u8; 8];
    reader.read_exact(&mut word).context("reading offset")?;
    let offset = u64::from_le_bytes(word);
    reader.read_exact(&mut word).context("reading size")?;
    let size = u64::from_le_bytes(word);
    reader.read_exact(&mut word).context("reading file size")?;
    let file_size = u64::from_le_bytes(word);
    match offset.checked_add(size) {
        Some(end) if end <= file_size => {}
        _ => bail!("{id}: block {offset}+{size} lies past file end {file_size}"),
    }
    Ok(FileHeader {
        id,
        offset,
        size,
        file_size,
    })
}

/// Resolve a wire identifier to a path under `root`.
///
/// Rejects absolute paths, `..`, NUL bytes and anything else that could
/// land outside `root`.
pub fn normalize_under_root(root: &Path, id: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if id.contains('\0') {
        bail!("identifier contains NUL byte");
    }
    let mut safe = PathBuf::new();
    for component in Path::new(id).components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("identifier {:?} has disallowed component {:?}", id, component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty identifier");
    }
    Ok(root.join(safe))
}

/// Wire identifier for `path` relative to `root`, always '/'-separated.
pub fn identifier_for(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
