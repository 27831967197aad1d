//! Thread-safe queue of byte sources shared by all sender connections

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

use crate::byte_source::{ByteSource, FileByteSource};
use crate::fs_enum::{walk_directory, FileEntry, FileFilter};

/// Work distribution seam between the sender connections and whatever
/// produces byte sources.
pub trait SourceQueue: Send + Sync {
    /// Take the next pending source. `None` means no more work will ever
    /// be available to this caller.
    fn get_next_source(&self) -> Option<Box<dyn ByteSource>>;

    /// Give back a source that could not be sent completely. It is rewound
    /// and will be handed out again.
    fn return_to_queue(&self, source: Box<dyn ByteSource>);

    /// The caller is done with a source it took (sent, or abandoned).
    fn mark_consumed(&self) {}
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Box<dyn ByteSource>>,
    checked_out: usize,
    enumeration_done: bool,
    sources_added: u64,
    bytes_added: u64,
}

/// Queue of file-backed sources, fed by directory enumeration (possibly
/// while connections are already draining it).
///
/// `get_next_source` blocks while the queue is empty but more work may
/// still show up: enumeration is running, or another connection holds a
/// source it might return after a failure.
pub struct DirectorySourceQueue {
    root: PathBuf,
    buffer_size: usize,
    block_size: u64,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl DirectorySourceQueue {
    /// `block_size == 0` sends every file as one source.
    pub fn new(root: &Path, buffer_size: usize, block_size: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            buffer_size,
            block_size,
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn add_source(&self, source: Box<dyn ByteSource>) {
        let mut st = self.state.lock();
        st.sources_added += 1;
        st.bytes_added += source.size();
        st.pending.push_back(source);
        drop(st);
        self.cond.notify_one();
    }

    /// Queue a file, split into blocks if a block size is configured.
    pub fn add_file(&self, entry: &FileEntry) {
        if self.block_size == 0 || entry.size <= self.block_size {
            self.add_source(Box::new(FileByteSource::new(
                &entry.path,
                &entry.id,
                entry.size,
                0,
                self.buffer_size,
            )));
            return;
        }
        let mut offset = 0u64;
        while offset < entry.size {
            let len = self.block_size.min(entry.size - offset);
            self.add_source(Box::new(
                FileByteSource::new(&entry.path, &entry.id, len, offset, self.buffer_size)
                    .with_file_size(entry.size),
            ));
            offset += len;
        }
    }

    /// No more sources will be added. Wakes every waiting connection.
    pub fn finish_enumeration(&self) {
        self.state.lock().enumeration_done = true;
        self.cond.notify_all();
    }

    /// Enumerate `root` on the calling thread, then mark enumeration done.
    pub fn build_synchronously(&self, filter: &FileFilter, follow_symlinks: bool) -> Result<u64> {
        let res = walk_directory(&self.root, filter, follow_symlinks, |e| self.add_file(&e));
        self.finish_enumeration();
        let n = res?;
        info!(files = n, root = %self.root.display(), "enumeration complete");
        Ok(n)
    }

    /// Enumerate on a background thread so sending can start right away.
    pub fn spawn_enumeration(
        self: &Arc<Self>,
        filter: FileFilter,
        follow_symlinks: bool,
    ) -> Result<thread::JoinHandle<Result<u64>>> {
        let queue = Arc::clone(self);
        thread::Builder::new()
            .name("enumerate".to_string())
            .spawn(move || queue.build_synchronously(&filter, follow_symlinks))
            .context("spawning enumeration thread")
    }

    /// Sources and bytes queued so far (including blocks).
    pub fn totals(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.sources_added, st.bytes_added)
    }
}

impl SourceQueue for DirectorySourceQueue {
    fn get_next_source(&self) -> Option<Box<dyn ByteSource>> {
        let mut st = self.state.lock();
        loop {
            if let Some(source) = st.pending.pop_front() {
                st.checked_out += 1;
                return Some(source);
            }
            if st.enumeration_done && st.checked_out == 0 {
                return None;
            }
            self.cond.wait(&mut st);
        }
    }

    fn return_to_queue(&self, mut source: Box<dyn ByteSource>) {
        source.reset();
        debug!(id = source.identifier(), "source returned to queue");
        let mut st = self.state.lock();
        st.checked_out = st.checked_out.saturating_sub(1);
        st.pending.push_back(source);
        drop(st);
        self.cond.notify_one();
    }

    fn mark_consumed(&self) {
        let mut st = self.state.lock();
        st.checked_out = st.checked_out.saturating_sub(1);
        let drained = st.checked_out == 0 && st.pending.is_empty() && st.enumeration_done;
        drop(st);
        if drained {
            self.cond.notify_all();
        }
    }
}
