//! The mounted filesystem and its Unix-style surface: path resolution,
//! open/create, mkdir, unlink, rename, readdir, sync, and touch.
//!
//! Grounded in the teacher's `fs.rs` (`FileSystem`: device + FAT + free
//! cluster bookkeeping) and `vfs.rs` (`VirtFile`: the per-open-file
//! handle), generalized from a single hard-coded FAT32 layout and a
//! process-global block cache to a per-mount `Filesystem` holding its own
//! `BlockCache`, `FatManager`, and `DirectoryCache`, per the lock
//! hierarchy: mount lock above the FAT manager lock, above the dcache
//! lock, above per-node locks ordered by `start_cluster`, above the block
//! cache's own internal lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::block_cache::BlockCache;
use crate::block_device::BlockDevice;
use crate::bpb::{BiosParameterBlock, RootLocation};
use crate::dcache::DirectoryCache;
use crate::dirops::{self, DirIo};
use crate::entry::ShortDirEntry;
use crate::error::{Error, FsResult};
use crate::fat::FatManager;
use crate::handle::{Directory, File, OpenFlags};
use crate::node::{Node, NodeKind};
use crate::time::FatTimestamp;
use crate::ATTR_DIRECTORY;

/// Mount-time configuration.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    /// Budget for the block cache, in bytes. Defaults to 256 KiB — large
    /// enough to hold a FAT32 directory's worth of clusters without
    /// thrashing, resolving the cache-sizing Open Question in favor of a
    /// real working set rather than a handful of sectors.
    pub block_cache_capacity_bytes: usize,
    /// Used only to sanity-check the parsed BPB against caller
    /// expectations; has no effect on parsing itself.
    pub sector_size_hint: Option<usize>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            read_only: false,
            block_cache_capacity_bytes: 256 * 1024,
            sector_size_hint: None,
        }
    }
}

pub(crate) struct FsInner {
    pub(crate) bpb: BiosParameterBlock,
    pub(crate) cache: BlockCache,
    pub(crate) fat: Mutex<FatManager>,
    pub(crate) dcache: DirectoryCache,
    pub(crate) read_only: bool,
    pub(crate) mount_lock: RwLock<()>,
    pub(crate) unmounted: AtomicBool,
    pub(crate) root: Arc<Node>,
}

impl FsInner {
    pub(crate) fn cluster_offset(&self, cluster: u32) -> FsResult<u64> {
        self.bpb.cluster_offset(cluster)
    }

    pub(crate) fn dir_io(&self) -> DirIo<'_> {
        DirIo {
            cache: &self.cache,
            cluster_size: self.bpb.cluster_size(),
            cluster_offset: &|c| self.cluster_offset(c),
        }
    }

    pub(crate) fn check_mounted(&self) -> FsResult<()> {
        if self.unmounted.load(Ordering::SeqCst) {
            return Err(Error::Unmounted);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    /// Acquires or builds the node for a directory entry just looked up.
    ///
    /// Directories go through the dcache, keyed by `start_cluster`, which
    /// is always a real, distinct allocation for a directory. Files are
    /// instead interned through their parent's own child map, keyed by
    /// directory-entry offset: every zero-length file reports
    /// `start_cluster() == 0`, so keying files by cluster in a shared table
    /// would hand two unrelated empty files the same node.
    pub(crate) fn node_for_entry(&self, parent: &Arc<Node>, entry: &dirops::DirEntryView) -> Arc<Node> {
        let kind = if entry.short.is_directory() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        let cluster = entry.short.first_cluster();
        let ctor = || {
            Node::new(
                kind,
                cluster,
                entry.short.file_size as u64,
                FatTimestamp {
                    time: entry.short.write_time,
                    date: entry.short.write_date,
                },
                Arc::downgrade(parent),
                entry.short_entry_offset,
            )
        };
        if kind == NodeKind::Directory {
            self.dcache.create_or_acquire(cluster, ctor)
        } else {
            parent.intern_child(entry.short_entry_offset, ctor)
        }
    }
}

/// A mounted FAT volume.
pub struct Filesystem {
    pub(crate) inner: Arc<FsInner>,
}

impl Filesystem {
    /// Parses the boot sector, validates the FSInfo sector if present, and
    /// builds the per-mount caches. Does not format anything — the device
    /// must already carry a valid FAT image.
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> FsResult<Filesystem> {
        let mut boot_sector = vec![0u8; 512];
        device.read_at(&mut boot_sector, 0)?;
        let bpb = BiosParameterBlock::parse(&boot_sector)?;

        if let Some(hint) = options.sector_size_hint {
            if hint != bpb.bytes_per_sector() {
                log::warn!(
                    "sector_size_hint {hint} does not match on-disk bytes_per_sector {}",
                    bpb.bytes_per_sector()
                );
            }
        }

        if let Some(fsinfo_sector) = bpb.fs_info_sector() {
            let mut sector = vec![0u8; bpb.bytes_per_sector()];
            device.read_at(&mut sector, (fsinfo_sector * bpb.bytes_per_sector()) as u64)?;
            if let Err(e) = crate::bpb::FsInfo::parse(&sector) {
                log::warn!("FSInfo sector failed validation, ignoring its hints: {e}");
            }
        }

        let cache = BlockCache::new(
            Arc::clone(&device),
            bpb.bytes_per_sector(),
            options.block_cache_capacity_bytes,
        );
        let fat = FatManager::new(&bpb);
        let now = FatTimestamp::now();
        let root = match bpb.root_location() {
            RootLocation::Cluster(c) => Node::new_root(c, now),
            RootLocation::FixedRegion {
                first_sector,
                sector_count,
            } => Node::new_fixed_root(
                (first_sector * bpb.bytes_per_sector()) as u64,
                (sector_count * bpb.bytes_per_sector()) as u64,
                now,
            ),
        };

        log::debug!(
            "mounted {:?} volume, cluster_size={} read_only={}",
            bpb.variant(),
            bpb.cluster_size(),
            options.read_only
        );

        Ok(Filesystem {
            inner: Arc::new(FsInner {
                bpb,
                cache,
                fat: Mutex::new(fat),
                dcache: DirectoryCache::new(),
                read_only: options.read_only,
                mount_lock: RwLock::new(()),
                unmounted: AtomicBool::new(false),
                root,
            }),
        })
    }

    fn split_path(path: &str) -> FsResult<Vec<&str>> {
        if path.contains('\0') {
            return Err(Error::invalid("path contains a NUL byte"));
        }
        let mut components = Vec::new();
        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            if part == ".." || part == "." {
                return Err(Error::invalid("relative path components are not allowed"));
            }
            components.push(part);
        }
        Ok(components)
    }

    /// Resolves `path` component by component from the root. `""` or `"/"`
    /// resolves to the root with no parent and an empty final-component
    /// name.
    fn resolve(&self, path: &str) -> FsResult<(Option<Arc<Node>>, Arc<Node>, String)> {
        self.inner.check_mounted()?;
        let components = Self::split_path(path)?;
        if components.is_empty() {
            return Ok((None, Arc::clone(&self.inner.root), String::new()));
        }

        let io = self.inner.dir_io();
        let mut current = Arc::clone(&self.inner.root);

        for (i, component) in components.iter().enumerate() {
            if !current.is_directory() {
                return Err(Error::NotADir);
            }
            let fat = self.inner.fat.lock().unwrap();
            let found = dirops::lookup(&current, &fat, &io, component)?;
            drop(fat);
            let entry = found.ok_or(Error::NotFound)?;
            let node = self.inner.node_for_entry(&current, &entry);
            if i + 1 == components.len() {
                return Ok((Some(current), node, component.to_string()));
            }
            current = node;
        }
        unreachable!("loop above always returns on its final iteration")
    }

    fn last_component(path: &str) -> FsResult<String> {
        Self::split_path(path)?
            .last()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::invalid("path has no final component"))
    }

    fn parent_path(path: &str) -> String {
        match path.rsplit_once('/') {
            Some((head, _)) => head.to_string(),
            None => String::new(),
        }
    }

    /// Opens, and optionally creates, a file at `path`. Fails with
    /// `Error::NotAFile` if `path` names a directory.
    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<File> {
        self.inner.check_mounted()?;
        if flags.write && self.inner.read_only {
            return Err(Error::PermissionDenied);
        }

        match self.resolve(path) {
            Ok((_, node, _)) => {
                if node.is_directory() {
                    return Err(Error::NotAFile);
                }
                if flags.create && flags.exclusive {
                    return Err(Error::AlreadyExists);
                }
                if flags.truncate {
                    self.inner.check_writable()?;
                    let mut fat = self.inner.fat.lock().unwrap();
                    node.set_size(0, &mut fat, &self.inner.cache, self.inner.bpb.cluster_size())?;
                }
                Ok(File::new(Arc::clone(&self.inner), node, flags))
            }
            Err(Error::NotFound) if flags.create => {
                self.inner.check_writable()?;
                let name = Self::last_component(path)?;
                let parent_path = Self::parent_path(path);
                let (_, parent, _) = self.resolve(&parent_path)?;
                if !parent.is_directory() {
                    return Err(Error::NotADir);
                }

                let now = FatTimestamp::now();
                let short = ShortDirEntry::new_file([b' '; 11], 0, (now.time, now.date));
                let mut fat = self.inner.fat.lock().unwrap();
                let io = self.inner.dir_io();
                if dirops::lookup(&parent, &fat, &io, &name)?.is_some() {
                    return Err(Error::AlreadyExists);
                }
                let written = dirops::allocate_entry(&parent, &mut fat, &io, &name, short)?;
                drop(fat);
                let node = self.inner.node_for_entry(&parent, &written);
                Ok(File::new(Arc::clone(&self.inner), node, flags))
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a directory for listing.
    pub fn open_dir(&self, path: &str) -> FsResult<Directory> {
        let (_, node, _) = self.resolve(path)?;
        if !node.is_directory() {
            return Err(Error::NotADir);
        }
        Ok(Directory::new(Arc::clone(&self.inner), node))
    }

    /// Creates a new, empty directory at `path`.
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        self.inner.check_mounted()?;
        self.inner.check_writable()?;
        let name = Self::last_component(path)?;
        let parent_path = Self::parent_path(path);
        let (_, parent, _) = self.resolve(&parent_path)?;
        if !parent.is_directory() {
            return Err(Error::NotADir);
        }

        let mut fat = self.inner.fat.lock().unwrap();
        let io = self.inner.dir_io();
        if dirops::lookup(&parent, &fat, &io, &name)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let clusters = fat.allocate(&self.inner.cache, 1)?;
        let self_cluster = clusters[0];
        let now = FatTimestamp::now();
        let short = ShortDirEntry::new_dir([b' '; 11], self_cluster, (now.time, now.date));

        let new_dir_node = Node::new(NodeKind::Directory, self_cluster, 0, now, Arc::downgrade(&parent), 0);
        dirops::write_dot_and_dotdot(&new_dir_node, &mut fat, &io, self_cluster, parent.start_cluster())?;
        dirops::allocate_entry(&parent, &mut fat, &io, &name, short)?;
        Ok(())
    }

    /// Removes a file, or an empty directory, at `path`.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.inner.check_mounted()?;
        self.inner.check_writable()?;
        let (parent, node, name) = self.resolve(path)?;
        let parent = parent.ok_or_else(|| Error::invalid("cannot unlink the root"))?;

        let mut fat = self.inner.fat.lock().unwrap();
        let io = self.inner.dir_io();
        if node.is_directory() && !dirops::is_directory_empty(&node, &fat, &io)? {
            return Err(Error::NotEmpty);
        }

        let entry = dirops::lookup(&parent, &fat, &io, &name)?.ok_or(Error::NotFound)?;
        dirops::free_entry(&parent, &mut fat, &io, &entry)?;
        let freed_cluster = entry.short.first_cluster();
        node.clear(&mut fat, &self.inner.cache)?;
        node.mark_deleted();
        drop(fat);
        if node.is_directory() {
            self.inner.dcache.release(freed_cluster);
        } else {
            parent.remove_child(entry.short_entry_offset);
        }
        Ok(())
    }

    /// Renames/moves `from` to `to`. Both the removal from the old
    /// directory and the insertion into the new one happen while holding
    /// the single FAT manager lock, so no other mutation can observe the
    /// entry as present in both, or in neither.
    ///
    /// If `to` already names an entry distinct from `from`, it is replaced:
    /// an existing directory must be empty, and the two entries must agree
    /// on file-vs-directory. If `from` names a directory and it is actually
    /// moving to a new parent, that directory's `..` entry is rewritten to
    /// point at the new parent.
    pub fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.inner.check_mounted()?;
        self.inner.check_writable()?;
        let (old_parent, node, old_name) = self.resolve(from)?;
        let old_parent = old_parent.ok_or_else(|| Error::invalid("cannot rename the root"))?;

        let new_name = Self::last_component(to)?;
        let new_parent_path = Self::parent_path(to);
        let (_, new_parent, _) = self.resolve(&new_parent_path)?;
        if !new_parent.is_directory() {
            return Err(Error::NotADir);
        }

        let mut fat = self.inner.fat.lock().unwrap();
        let io = self.inner.dir_io();
        let old_entry = dirops::lookup(&old_parent, &fat, &io, &old_name)?.ok_or(Error::NotFound)?;

        if let Some(existing) = dirops::lookup(&new_parent, &fat, &io, &new_name)? {
            let same_entry =
                Arc::ptr_eq(&old_parent, &new_parent) && existing.short_entry_offset == old_entry.short_entry_offset;
            if !same_entry {
                if existing.short.is_directory() != node.is_directory() {
                    return Err(if node.is_directory() {
                        Error::NotADir
                    } else {
                        Error::NotAFile
                    });
                }
                let existing_node = self.inner.node_for_entry(&new_parent, &existing);
                if existing_node.is_directory() && !dirops::is_directory_empty(&existing_node, &fat, &io)? {
                    return Err(Error::NotEmpty);
                }
                existing_node.clear(&mut fat, &self.inner.cache)?;
                existing_node.mark_deleted();
                dirops::free_entry(&new_parent, &mut fat, &io, &existing)?;
                if existing_node.is_directory() {
                    self.inner.dcache.release(existing.short.first_cluster());
                } else {
                    new_parent.remove_child(existing.short_entry_offset);
                }
            }
        }

        let written = dirops::allocate_entry(&new_parent, &mut fat, &io, &new_name, old_entry.short)?;
        dirops::free_entry(&old_parent, &mut fat, &io, &old_entry)?;

        let parent_changed = !Arc::ptr_eq(&old_parent, &new_parent);
        if node.is_directory() {
            if parent_changed {
                dirops::write_dot_and_dotdot(&node, &mut fat, &io, node.start_cluster(), new_parent.start_cluster())?;
            }
        } else {
            old_parent.remove_child(old_entry.short_entry_offset);
            new_parent.insert_child(written.short_entry_offset, Arc::downgrade(&node));
        }
        node.move_to(Arc::downgrade(&new_parent), written.short_entry_offset);
        Ok(())
    }

    /// Flushes all dirty blocks (including FAT and directory metadata) to
    /// the device.
    pub fn sync(&self) -> FsResult<()> {
        self.inner.check_mounted()?;
        self.inner.cache.sync()
    }

    /// Updates a file or directory's modification timestamp to now and
    /// writes it back to its parent's directory entry.
    pub fn touch(&self, path: &str) -> FsResult<()> {
        self.inner.check_mounted()?;
        self.inner.check_writable()?;
        let (_, node, _) = self.resolve(path)?;
        node.touch_mtime();

        let Some((parent_weak, offset)) = node.parent_entry_offset() else {
            return Ok(());
        };
        let Some(parent) = parent_weak.upgrade() else {
            return Ok(());
        };
        let mtime = node.mtime();
        let mut short = ShortDirEntry::new_file([b' '; 11], node.first_cluster(), (mtime.time, mtime.date));
        short.file_size = node.size() as u32;
        short.attr = if node.is_directory() {
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

    /// Unmounts the filesystem: syncs everything, then marks the mount
    /// dead so further operations return `Error::Unmounted`.
    pub fn close(&self) -> FsResult<()> {
        let _guard = self.inner.mount_lock.write().unwrap();
        self.sync()?;
        self.inner.unmounted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if !self.inner.unmounted.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.cache.sync() {
                log::error!("sync on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_fat32_image;

    fn mounted() -> Filesystem {
        let image = format_fat32_image(64 * 1024 * 1024);
        let device = Arc::new(crate::block_device::MemoryDevice::from_vec(image));
        Filesystem::mount(device, MountOptions::default()).unwrap()
    }

    #[test]
    fn mount_succeeds_on_a_blank_image() {
        let _fs = mounted();
    }

    #[test]
    fn create_write_read_round_trips() {
        let fs = mounted();
        let f = fs.open("/hello.txt", OpenFlags::create_write()).unwrap();
        f.write(b"hello world").unwrap();
        f.sync().unwrap();
        drop(f);

        let f = fs.open("/hello.txt", OpenFlags::read()).unwrap();
        let mut buf = vec![0u8; 11];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn mkdir_then_readdir_lists_the_new_entry() {
        let fs = mounted();
        fs.mkdir("/sub").unwrap();
        let dir = fs.open_dir("/").unwrap();
        let names: Vec<String> = dir.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.iter().any(|n| n.eq_ignore_ascii_case("sub")));
    }

    #[test]
    fn unlink_removes_a_file() {
        let fs = mounted();
        fs.open("/a.txt", OpenFlags::create_write()).unwrap();
        fs.unlink("/a.txt").unwrap();
        assert!(matches!(fs.open("/a.txt", OpenFlags::read()), Err(Error::NotFound)));
    }

    #[test]
    fn unlink_nonempty_directory_fails() {
        let fs = mounted();
        fs.mkdir("/sub").unwrap();
        fs.open("/sub/child.txt", OpenFlags::create_write()).unwrap();
        assert!(matches!(fs.unlink("/sub"), Err(Error::NotEmpty)));
    }

    #[test]
    fn rename_moves_a_file_to_a_new_name() {
        let fs = mounted();
        fs.open("/old.txt", OpenFlags::create_write()).unwrap();
        fs.rename("/old.txt", "/new.txt").unwrap();
        assert!(matches!(fs.open("/old.txt", OpenFlags::read()), Err(Error::NotFound)));
        assert!(fs.open("/new.txt", OpenFlags::read()).is_ok());
    }

    #[test]
    fn rename_directory_to_a_new_parent_rewrites_dotdot() {
        let fs = mounted();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        fs.mkdir("/a/moved").unwrap();
        fs.rename("/a/moved", "/b/moved").unwrap();

        let (_, moved_node, _) = fs.resolve("/b/moved").unwrap();
        let (_, b_node, _) = fs.resolve("/b").unwrap();
        let fat = fs.inner.fat.lock().unwrap();
        let io = fs.inner.dir_io();
        let dotdot = dirops::lookup(&moved_node, &fat, &io, "..").unwrap().unwrap();
        assert_eq!(dotdot.short.first_cluster(), b_node.start_cluster());
    }

    #[test]
    fn rename_onto_an_existing_file_overwrites_it() {
        let fs = mounted();
        fs.open("/one.txt", OpenFlags::create_write()).unwrap();
        fs.open("/two.txt", OpenFlags::create_write()).unwrap();
        fs.rename("/one.txt", "/two.txt").unwrap();
        assert!(matches!(fs.open("/one.txt", OpenFlags::read()), Err(Error::NotFound)));
        assert!(fs.open("/two.txt", OpenFlags::read()).is_ok());
    }

    #[test]
    fn read_only_mount_rejects_writes() {
        let image = format_fat32_image(64 * 1024 * 1024);
        let device = Arc::new(crate::block_device::MemoryDevice::from_vec(image));
        let fs = Filesystem::mount(
            device,
            MountOptions {
                read_only: true,
                ..MountOptions::default()
            },
        )
        .unwrap();
        assert!(matches!(
            fs.open("/a.txt", OpenFlags::create_write()),
            Err(Error::PermissionDenied)
        ));
    }
}
