//! Caller-facing open-file and open-directory handles.
//!
//! Grounded in the teacher's `VirtFile`/`VirtDir` (`vfs.rs`): a thin handle
//! wrapping a shared node plus a private seek position and open-mode flags,
//! so two handles on the same file can each seek independently while still
//! sharing the same [`Node`] (and therefore the same cluster chain cache)
//! underneath.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dirops;
use crate::entry::ShortDirEntry;
use crate::error::{Error, FsResult};
use crate::node::Node;
use crate::time::FatTimestamp;
use crate::vfs::FsInner;
use crate::ATTR_DIRECTORY;

/// Mode flags an `open` call is made with.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn read() -> Self {
        OpenFlags {
            read: true,
            ..Default::default()
        }
    }

    pub fn create_write() -> Self {
        OpenFlags {
            write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn append_write() -> Self {
        OpenFlags {
            write: true,
            create: true,
            append: true,
            ..Default::default()
        }
    }
}

/// Metadata about a file or directory, returned by [`File::stat`] and
/// listed by [`Directory::entries`].
#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub mtime: FatTimestamp,
    pub ctime: FatTimestamp,
}

/// An open file: a shared [`Node`] plus a private seek cursor.
pub struct File {
    inner: Arc<FsInner>,
    node: Arc<Node>,
    flags: OpenFlags,
    position: AtomicU64,
}

impl File {
    pub(crate) fn new(inner: Arc<FsInner>, node: Arc<Node>, flags: OpenFlags) -> Self {
        let position = if flags.append { node.size() } else { 0 };
        File {
            inner,
            node,
            flags,
            position: AtomicU64::new(position),
        }
    }

    fn check_not_deleted(&self) -> FsResult<()> {
        if self.node.is_deleted() {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Reads from the current position, advancing it by the number of
    /// bytes actually read.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.check_not_deleted()?;
        if !self.flags.read {
            return Err(Error::PermissionDenied);
        }
        let fat = self.inner.fat.lock().unwrap();
        let pos = self.position.load(Ordering::SeqCst);
        let n = self.node.read_at(
            buf,
            pos,
            &fat,
            &self.inner.cache,
            self.inner.bpb.cluster_size(),
            |c| self.inner.cluster_offset(c),
        )?;
        self.position.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    /// Writes at the current position (or at EOF, if opened with append),
    /// advancing it by the number of bytes actually written.
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        self.check_not_deleted()?;
        if !self.flags.write {
            return Err(Error::PermissionDenied);
        }
        self.inner.check_writable()?;
        let mut fat = self.inner.fat.lock().unwrap();
        let pos = if self.flags.append {
            self.node.size()
        } else {
            self.position.load(Ordering::SeqCst)
        };
        let outcome = self.node.write_at(
            buf,
            pos,
            &mut fat,
            &self.inner.cache,
            self.inner.bpb.cluster_size(),
            |c| self.inner.cluster_offset(c),
        )?;
        self.position
            .store(pos + outcome.bytes_written as u64, Ordering::SeqCst);
        drop(fat);
        self.sync_dirent()?;
        outcome.into_result()
    }

    /// Moves the seek cursor to `offset` from the start of the file.
    pub fn seek(&self, offset: u64) {
        self.position.store(offset, Ordering::SeqCst);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    /// Resizes the file, zero-extending if `new_size` is larger than the
    /// current size.
    pub fn truncate(&self, new_size: u64) -> FsResult<()> {
        self.check_not_deleted()?;
        self.inner.check_writable()?;
        let mut fat = self.inner.fat.lock().unwrap();
        self.node
            .set_size(new_size, &mut fat, &self.inner.cache, self.inner.bpb.cluster_size())?;
        drop(fat);
        self.sync_dirent()
    }

    /// Stamps `mtime` to now and writes it back to the parent directory
    /// entry, without touching content.
    pub fn touch(&self) -> FsResult<()> {
        self.inner.check_writable()?;
        self.node.touch_mtime();
        self.sync_dirent()
    }

    pub fn stat(&self) -> Metadata {
        Metadata {
            name: String::new(),
            is_directory: self.node.is_directory(),
            size: self.node.size(),
            mtime: self.node.mtime(),
            ctime: self.node.ctime(),
        }
    }

    /// Flushes the block cache; every open handle shares the same
    /// underlying cache, so this syncs the whole mount, not just this file.
    pub fn sync(&self) -> FsResult<()> {
        self.inner.cache.sync()
    }

    /// Creates an independent handle sharing this file's node but with its
    /// own seek position.
    pub fn dup(&self) -> File {
        File {
            inner: Arc::clone(&self.inner),
            node: Arc::clone(&self.node),
            flags: self.flags,
            position: AtomicU64::new(self.position.load(Ordering::SeqCst)),
        }
    }

    /// Drops this handle. File nodes are interned through their parent
    /// directory's child map, not the dcache, so there is no refcount to
    /// release here — dropping `self.node` just lets that `Arc` go, and
    /// the parent's weak entry goes stale on its own once nothing else
    /// holds it. Content already written is visible to other handles;
    /// nothing further is flushed here beyond what `write`/`sync` already did.
    pub fn close(self) -> FsResult<()> {
        Ok(())
    }

    fn sync_dirent(&self) -> FsResult<()> {
        let Some((parent_weak, offset)) = self.node.parent_entry_offset() else {
            return Ok(());
        };
        let Some(parent) = parent_weak.upgrade() else {
            return Ok(());
        };
        let mtime = self.node.mtime();
        let mut short =
            ShortDirEntry::new_file([b' '; 11], self.node.first_cluster(), (mtime.time, mtime.date));
        short.file_size = self.node.size() as u32;
        short.attr = if self.node.is_directory() {
            ATTR_DIRECTORY
        } else {
            crate::ATTR_ARCHIVE
        };

        let mut fat = self.inner.fat.lock().unwrap();
        let io = self.inner.dir_io();
        let mut name_bytes = None;
        dirops::for_each_entry(&parent, &fat, &io, |e| {
            if e.short_entry_offset == offset {
                name_bytes = Some(e.short.name);
                return Ok(false);
            }
            Ok(true)
        })?;
        if let Some(name) = name_bytes {
            short.name = name;
        }
        dirops::update_entry(&parent, &mut fat, &io, offset, &short)
    }
}

/// An open directory, listable via [`Directory::entries`].
pub struct Directory {
    inner: Arc<FsInner>,
    node: Arc<Node>,
}

impl Directory {
    pub(crate) fn new(inner: Arc<FsInner>, node: Arc<Node>) -> Self {
        Directory { inner, node }
    }

    /// Lists every entry in this directory, `.`/`..` included.
    pub fn entries(&self) -> FsResult<Vec<Metadata>> {
        let fat = self.inner.fat.lock().unwrap();
        let io = self.inner.dir_io();
        let mut out = Vec::new();
        dirops::for_each_entry(&self.node, &fat, &io, |e| {
            out.push(Metadata {
                name: e.display_name,
                is_directory: e.short.is_directory(),
                size: e.short.file_size as u64,
                mtime: FatTimestamp {
                    time: e.short.write_time,
                    date: e.short.write_date,
                },
                ctime: FatTimestamp {
                    time: e.short.create_time,
                    date: e.short.create_date,
                },
            });
            Ok(true)
        })?;
        Ok(out)
    }

    pub fn close(self) -> FsResult<()> {
        self.inner.dcache.release(self.node.start_cluster());
        Ok(())
    }
}
