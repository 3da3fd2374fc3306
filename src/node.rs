//! In-memory node (inode) layer: one [`Node`] per live file or directory,
//! caching its cluster chain, size, and directory-entry location so
//! repeated operations don't re-walk the FAT or re-scan the parent
//! directory.
//!
//! Grounded in the teacher's `VirtFile` (`vfs.rs`), which bundles a name,
//! a directory-entry position, an `Arc<RwLock<FileSystem>>`, and an
//! `Arc<RwLock<ClusterChain>>` behind one handle. Here that's split: the
//! stable identity (`start_cluster`, `kind`) lives outside any lock for
//! lock-ordering purposes (the hierarchy orders node locks by
//! `start_cluster`), and everything mutable lives in one `RwLock<NodeState>`
//! per node. `Node` holds a `Weak` reference to its parent, never a strong
//! one, so the dcache (which owns the strong references) is the only
//! thing keeping a directory's ancestors alive — avoiding the reference
//! cycle an `Arc<RwLock<FileSystem>>` back-pointer would create.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::block_cache::BlockCache;
use crate::error::{Error, FsResult, WriteOutcome};
use crate::fat::FatManager;
use crate::time::FatTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Root,
}

pub(crate) struct NodeState {
    pub first_cluster: u32,
    pub clusters: Vec<u32>,
    pub size: u64,
    pub mtime: FatTimestamp,
    pub ctime: FatTimestamp,
    /// The directory this node is listed in, and the byte offset (from
    /// the start of that directory's data) of its short entry. `None` for
    /// the root, which has no parent entry.
    pub parent: Option<(Weak<Node>, u64)>,
    /// Set only for the root directory of a FAT12/16 volume: a fixed
    /// on-disk region (byte offset, byte length) instead of a cluster
    /// chain. FAT12/16 roots cannot grow past this region.
    pub fixed_region: Option<(u64, u64)>,
}

/// A live file or directory.
///
/// `start_cluster` is the node's identity for both the dcache key and the
/// lock-ordering rule (rename acquires two node locks in ascending
/// `start_cluster` order). For a zero-length file this is the cluster
/// that *will* be allocated on first write — until then it is 0 and the
/// node has no cluster chain at all.
pub struct Node {
    pub kind: NodeKind,
    start_cluster: AtomicUsizeCluster,
    state: RwLock<NodeState>,
    refcount: AtomicUsize,
    deleted: AtomicBool,
    /// Interns this directory's file children by directory-entry offset,
    /// so two opens of the same file share one `Node` without the dcache's
    /// `start_cluster` key (every zero-length file shares cluster 0, so
    /// that key cannot distinguish them). Unused on `File`-kind nodes.
    children: Mutex<HashMap<u64, Weak<Node>>>,
}

/// Cluster numbers are logically u32 but compared/ordered as usize for
/// lock-hierarchy bookkeeping; wrapping it avoids sprinkling casts at
/// every call site that just wants a stable sort key.
struct AtomicUsizeCluster(std::sync::atomic::AtomicU32);

impl AtomicUsizeCluster {
    fn new(v: u32) -> Self {
        AtomicUsizeCluster(std::sync::atomic::AtomicU32::new(v))
    }
    fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
    fn store(&self, v: u32) {
        self.0.store(v, Ordering::SeqCst)
    }
}

impl Node {
    pub fn new_root(first_cluster: u32, now: FatTimestamp) -> Arc<Node> {
        Arc::new(Node {
            kind: NodeKind::Root,
            start_cluster: AtomicUsizeCluster::new(first_cluster),
            state: RwLock::new(NodeState {
                first_cluster,
                clusters: Vec::new(),
                size: 0,
                mtime: now,
                ctime: now,
                parent: None,
                fixed_region: None,
            }),
            refcount: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Builds the root node for a FAT12/16 volume, whose directory lives
    /// in a fixed disk region rather than a cluster chain.
    pub fn new_fixed_root(region_offset: u64, region_len: u64, now: FatTimestamp) -> Arc<Node> {
        Arc::new(Node {
            kind: NodeKind::Root,
            start_cluster: AtomicUsizeCluster::new(0),
            state: RwLock::new(NodeState {
                first_cluster: 0,
                clusters: Vec::new(),
                size: region_len,
                mtime: now,
                ctime: now,
                parent: None,
                fixed_region: Some((region_offset, region_len)),
            }),
            refcount: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn new(
        kind: NodeKind,
        first_cluster: u32,
        size: u64,
        timestamp: FatTimestamp,
        parent: Weak<Node>,
        parent_entry_offset: u64,
    ) -> Arc<Node> {
        Arc::new(Node {
            kind,
            start_cluster: AtomicUsizeCluster::new(first_cluster),
            state: RwLock::new(NodeState {
                first_cluster,
                clusters: Vec::new(),
                size,
                mtime: timestamp,
                ctime: timestamp,
                parent: Some((parent, parent_entry_offset)),
                fixed_region: None,
            }),
            refcount: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the cached file child at `offset`, if still live and not
    /// deleted. A deleted-but-still-referenced node (another handle keeps
    /// it open after an unlink) is treated as stale so a new entry written
    /// at the same offset gets its own node.
    pub fn child_for_offset(&self, offset: u64) -> Option<Arc<Node>> {
        let mut children = self.children.lock().unwrap();
        if let Some(weak) = children.get(&offset) {
            if let Some(node) = weak.upgrade() {
                if !node.is_deleted() {
                    return Some(node);
                }
            }
            children.remove(&offset);
        }
        None
    }

    /// Returns the existing file child at `offset`, or builds one with
    /// `ctor` and interns it. Unlike the dcache, this is keyed by
    /// directory-entry offset rather than `start_cluster`, so two distinct
    /// zero-length files (both reporting `start_cluster() == 0`) never
    /// collide.
    pub fn intern_child(&self, offset: u64, ctor: impl FnOnce() -> Arc<Node>) -> Arc<Node> {
        if let Some(existing) = self.child_for_offset(offset) {
            return existing;
        }
        let node = ctor();
        self.children.lock().unwrap().insert(offset, Arc::downgrade(&node));
        node
    }

    /// Drops the cached child at `offset`, used when an entry is freed or
    /// moved away during unlink/rename.
    pub fn remove_child(&self, offset: u64) {
        self.children.lock().unwrap().remove(&offset);
    }

    /// Registers (or re-registers, after a rename) a file child at `offset`.
    pub fn insert_child(&self, offset: u64, node: Weak<Node>) {
        self.children.lock().unwrap().insert(offset, node);
    }

    /// The lock-ordering key: the first cluster ever assigned to this
    /// node. Stable even after the node's data is truncated to zero,
    /// because a zero-length file keeps its allocated-on-write identity
    /// of 0 until data is actually written, at which point dcache lookup
    /// keys switch atomically alongside `set_first_cluster`.
    pub fn start_cluster(&self) -> u32 {
        self.start_cluster.load()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory | NodeKind::Root)
    }

    pub fn ref_up(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the refcount after decrementing; callers (the dcache) drop
    /// the node from their table when this reaches zero.
    pub fn ref_down(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u64 {
        self.state.read().unwrap().size
    }

    pub fn first_cluster(&self) -> u32 {
        self.state.read().unwrap().first_cluster
    }

    pub fn mtime(&self) -> FatTimestamp {
        self.state.read().unwrap().mtime
    }

    pub fn ctime(&self) -> FatTimestamp {
        self.state.read().unwrap().ctime
    }

    pub fn parent_entry_offset(&self) -> Option<(Weak<Node>, u64)> {
        self.state.read().unwrap().parent.clone()
    }

    /// Stamps `mtime` to now without touching content or size, for an
    /// explicit touch operation.
    pub fn touch_mtime(&self) {
        self.state.write().unwrap().mtime = FatTimestamp::now();
    }

    pub fn set_parent_entry_offset(&self, parent: Weak<Node>, offset: u64) {
        self.state.write().unwrap().parent = Some((parent, offset));
    }

    /// Collects the cluster chain on first access. For directories (whose
    /// on-disk short entry always stores `file_size == 0`) this also
    /// derives `size` from the chain length rather than trusting the
    /// dirent, since directory content is read and written bounded by
    /// `size` just like file content is.
    fn ensure_clusters(
        &self,
        state: &mut NodeState,
        fat: &FatManager,
        cache: &BlockCache,
        cluster_size: usize,
    ) -> FsResult<()> {
        if state.clusters.is_empty() && state.first_cluster != 0 {
            state.clusters = fat.collect(cache, state.first_cluster)?;
            if self.kind != NodeKind::File {
                state.size = state.clusters.len() as u64 * cluster_size as u64;
            }
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset` into the
    /// node's content, clamped to the node's recorded size. Returns the
    /// number of bytes actually read (short of `buf.len()` at EOF).
    pub fn read_at(
        &self,
        buf: &mut [u8],
        offset: u64,
        fat: &FatManager,
        cache: &BlockCache,
        cluster_size: usize,
        cluster_offset: impl Fn(u32) -> FsResult<u64>,
    ) -> FsResult<usize> {
        let mut state = self.state.write().unwrap();
        if let Some((region_offset, region_len)) = state.fixed_region {
            if offset >= region_len {
                return Ok(0);
            }
            let to_read = buf.len().min((region_len - offset) as usize);
            cache.read_at(&mut buf[..to_read], region_offset + offset)?;
            return Ok(to_read);
        }
        self.ensure_clusters(&mut state, fat, cache, cluster_size)?;
        if offset >= state.size {
            return Ok(0);
        }
        let available = (state.size - offset) as usize;
        let to_read = buf.len().min(available);
        let mut done = 0usize;
        while done < to_read {
            let pos = offset + done as u64;
            let cluster_idx = (pos / cluster_size as u64) as usize;
            let in_cluster = (pos % cluster_size as u64) as usize;
            let cluster = *state
                .clusters
                .get(cluster_idx)
                .ok_or_else(|| Error::corrupt("read past end of cluster chain"))?;
            let dev_offset = cluster_offset(cluster)? + in_cluster as u64;
            let take = (cluster_size - in_cluster).min(to_read - done);
            cache.read_at(&mut buf[done..done + take], dev_offset)?;
            done += take;
        }
        Ok(done)
    }

    /// Writes `buf` starting at `offset`, growing the cluster chain (via
    /// `fat.extend`/`fat.allocate`) as needed and updating `size` when the
    /// write extends past the current end. On an out-of-space error
    /// partway through, returns how many bytes actually landed.
    #[allow(clippy::too_many_arguments)]
    pub fn write_at(
        &self,
        buf: &[u8],
        offset: u64,
        fat: &mut FatManager,
        cache: &BlockCache,
        cluster_size: usize,
        cluster_offset: impl Fn(u32) -> FsResult<u64>,
    ) -> FsResult<WriteOutcome> {
        let mut state = self.state.write().unwrap();
        if let Some((region_offset, region_len)) = state.fixed_region {
            let end = offset + buf.len() as u64;
            if end > region_len {
                return Ok(WriteOutcome::partial(0, Error::NoSpace));
            }
            cache.write_at(buf, region_offset + offset)?;
            state.mtime = FatTimestamp::now();
            return Ok(WriteOutcome::complete(buf.len()));
        }
        self.ensure_clusters(&mut state, fat, cache, cluster_size)?;

        if offset >= crate::MAX_FILE_SIZE {
            return Ok(WriteOutcome::partial(0, Error::NoSpace));
        }
        let original_len = buf.len();
        let writable_len = ((crate::MAX_FILE_SIZE - offset) as usize).min(original_len);
        let buf = &buf[..writable_len];

        let end = offset + buf.len() as u64;
        let needed_clusters = ((end as usize) + cluster_size - 1) / cluster_size.max(1);
        if needed_clusters > state.clusters.len() {
            let to_add = needed_clusters - state.clusters.len();
            let allocated = if state.clusters.is_empty() {
                match fat.allocate(cache, to_add) {
                    Ok(c) => c,
                    Err(e) => return Ok(WriteOutcome::partial(0, e)),
                }
            } else {
                let tail = *state.clusters.last().unwrap();
                match fat.extend(cache, tail, to_add) {
                    Ok(c) => c,
                    Err(e) => return Ok(WriteOutcome::partial(0, e)),
                }
            };
            if state.clusters.is_empty() {
                state.first_cluster = allocated[0];
                self.start_cluster.store(allocated[0]);
            }
            state.clusters.extend(allocated);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let cluster_idx = (pos / cluster_size as u64) as usize;
            let in_cluster = (pos % cluster_size as u64) as usize;
            let cluster = match state.clusters.get(cluster_idx) {
                Some(&c) => c,
                None => return Ok(WriteOutcome::partial(done, Error::NoSpace)),
            };
            let dev_offset = match cluster_offset(cluster) {
                Ok(o) => o + in_cluster as u64,
                Err(e) => return Ok(WriteOutcome::partial(done, e)),
            };
            let take = (cluster_size - in_cluster).min(buf.len() - done);
            if let Err(e) = cache.write_at(&buf[done..done + take], dev_offset) {
                return Ok(WriteOutcome::partial(done, e));
            }
            done += take;
        }

        if end > state.size {
            state.size = end;
        }
        state.mtime = FatTimestamp::now();
        if done < original_len {
            Ok(WriteOutcome::partial(done, Error::NoSpace))
        } else {
            Ok(WriteOutcome::complete(done))
        }
    }

    /// Truncates or grows-with-zeros the node to exactly `new_size` bytes,
    /// freeing or allocating clusters as needed. Per the truncate/delete
    /// boundary: truncating a non-empty chain down to 0 bytes still keeps
    /// one cluster allocated (truncate, not delete) unless the caller goes
    /// through [`Node::clear`], which fully deletes the chain.
    pub fn set_size(
        &self,
        new_size: u64,
        fat: &mut FatManager,
        cache: &BlockCache,
        cluster_size: usize,
    ) -> FsResult<()> {
        let mut state = self.state.write().unwrap();
        if state.fixed_region.is_some() {
            return Err(Error::invalid("cannot resize a fixed-region root directory"));
        }
        if new_size > crate::MAX_FILE_SIZE {
            return Err(Error::NoSpace);
        }
        self.ensure_clusters(&mut state, fat, cache, cluster_size)?;

        let needed = fat.cluster_count_for_size(new_size, cluster_size).max(1);
        if state.clusters.is_empty() {
            if new_size > 0 {
                let allocated = fat.allocate(cache, needed)?;
                state.first_cluster = allocated[0];
                self.start_cluster.store(allocated[0]);
                state.clusters = allocated;
            }
        } else if needed < state.clusters.len() {
            fat.truncate(cache, state.first_cluster, needed)?;
            state.clusters.truncate(needed);
        } else if needed > state.clusters.len() {
            let to_add = needed - state.clusters.len();
            let tail = *state.clusters.last().unwrap();
            let allocated = fat.extend(cache, tail, to_add)?;
            state.clusters.extend(allocated);
        }
        state.size = new_size;
        state.mtime = FatTimestamp::now();
        Ok(())
    }

    /// Fully releases this node's cluster chain (used on unlink, not on
    /// truncate).
    pub fn clear(&self, fat: &mut FatManager, cache: &BlockCache) -> FsResult<()> {
        let mut state = self.state.write().unwrap();
        if state.first_cluster != 0 {
            fat.delete(cache, state.first_cluster)?;
        }
        state.clusters.clear();
        state.first_cluster = 0;
        state.size = 0;
        self.start_cluster.store(0);
        Ok(())
    }

    /// Re-parents this node after a rename: updates its recorded parent
    /// directory and dirent offset. Does not touch the on-disk entry;
    /// callers write the new directory entry separately.
    pub fn move_to(&self, new_parent: Weak<Node>, new_entry_offset: u64) {
        let mut state = self.state.write().unwrap();
        state.parent = Some((new_parent, new_entry_offset));
    }
}
