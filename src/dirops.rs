//! Directory content operations: walking a directory's entries, looking a
//! name up, allocating a fresh slot run for a new name, freeing one, and
//! writing the synthetic `.`/`..` entries a non-root directory starts
//! with.
//!
//! These operate purely on byte buffers read through a [`Node`]'s
//! `read_at`/`write_at` — the same "pure function over the directory's
//! bytes" shape the teacher's `dir.rs` uses (`find`/`create`/`ls`/`remove`
//! on `VirtFile`), generalized to also produce/consume long-name slot runs
//! via `entry.rs`. The FAT manager is threaded through explicitly rather
//! than bundled into [`DirIo`]: read-only walks take `&FatManager`,
//! mutating operations take `&mut FatManager`, mirroring the split between
//! `Node::read_at` and `Node::write_at`.

use crate::block_cache::BlockCache;
use crate::entry::{
    needs_long_name, pack_component, short_name_checksum, LongDirEntry, ShortDirEntry,
};
use crate::error::{Error, FsResult};
use crate::fat::FatManager;
use crate::node::Node;
use crate::time::FatTimestamp;
use crate::{DIRENT_SIZE, DIR_ENTRY_FREE, DIR_ENTRY_LAST_FREE, MAX_DIR_SIZE, MAX_NAME_LEN};

/// One resolved directory entry: a short entry plus, if present, its long
/// display name.
#[derive(Debug, Clone)]
pub struct DirEntryView {
    pub display_name: String,
    pub short: ShortDirEntry,
    /// Byte offset, within the directory's content, of the short entry.
    pub short_entry_offset: u64,
    /// Byte offset of the first (long-name, if any) slot belonging to
    /// this entry — the start of the run that must be freed together.
    pub run_start_offset: u64,
}

/// Context bundling what every directory operation needs to turn a
/// `Node` into raw bytes on disk, aside from the FAT manager itself.
pub struct DirIo<'a> {
    pub cache: &'a BlockCache,
    pub cluster_size: usize,
    pub cluster_offset: &'a dyn Fn(u32) -> FsResult<u64>,
}

fn read_slot(
    dir: &Node,
    fat: &FatManager,
    io: &DirIo,
    offset: u64,
) -> FsResult<Option<[u8; DIRENT_SIZE]>> {
    let mut buf = [0u8; DIRENT_SIZE];
    let n = dir.read_at(&mut buf, offset, fat, io.cache, io.cluster_size, io.cluster_offset)?;
    if n < DIRENT_SIZE {
        return Ok(None);
    }
    Ok(Some(buf))
}

/// Iterates every occupied run (long slots + short entry) in `dir`,
/// calling `visit` with the resolved view. Stops at the end-of-directory
/// marker or the end of the directory's content, whichever comes first.
pub fn for_each_entry(
    dir: &Node,
    fat: &FatManager,
    io: &DirIo,
    mut visit: impl FnMut(DirEntryView) -> FsResult<bool>,
) -> FsResult<()> {
    let mut offset = 0u64;
    let mut pending_lfn: Vec<LongDirEntry> = Vec::new();
    let mut run_start = 0u64;
    loop {
        let slot = match read_slot(dir, fat, io, offset)? {
            Some(s) => s,
            None => break,
        };
        if slot[0] == DIR_ENTRY_LAST_FREE {
            break;
        }
        if slot[0] == DIR_ENTRY_FREE {
            pending_lfn.clear();
            offset += DIRENT_SIZE as u64;
            continue;
        }
        if slot[11] == crate::ATTR_LONG_NAME {
            if pending_lfn.is_empty() {
                run_start = offset;
            }
            pending_lfn.push(LongDirEntry::from_bytes(&slot));
            offset += DIRENT_SIZE as u64;
            continue;
        }

        let short = ShortDirEntry::from_bytes(&slot);
        let run_start_offset = if pending_lfn.is_empty() {
            offset
        } else {
            run_start
        };
        let display_name = if !pending_lfn.is_empty()
            && pending_lfn.iter().all(|e| e.checksum == short.checksum())
        {
            crate::entry::decode_long_name(&pending_lfn)
        } else {
            short.decode_short_name()
        };
        pending_lfn.clear();

        let keep_going = visit(DirEntryView {
            display_name,
            short,
            short_entry_offset: offset,
            run_start_offset,
        })?;
        offset += DIRENT_SIZE as u64;
        if !keep_going {
            break;
        }
    }
    Ok(())
}

/// Looks a name up case-insensitively (FAT has no case-sensitive lookup).
pub fn lookup(dir: &Node, fat: &FatManager, io: &DirIo, name: &str) -> FsResult<Option<DirEntryView>> {
    let mut found = None;
    let wanted = name.to_uppercase();
    for_each_entry(dir, fat, io, |entry| {
        if entry.display_name.to_uppercase() == wanted {
            found = Some(entry);
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(found)
}

fn short_name_bytes(display_name: &str, suffix: Option<u32>) -> [u8; 11] {
    let (base, ext) = match display_name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (display_name, ""),
    };
    let mut base_bytes = pack_component(base, 8);
    if let Some(n) = suffix {
        let tag = format!("~{n}");
        let tag_bytes = tag.as_bytes();
        let keep = 8 - tag_bytes.len();
        for (i, &b) in tag_bytes.iter().enumerate() {
            base_bytes[keep + i] = b;
        }
    }
    let ext_bytes = pack_component(ext, 3);
    let mut out = [0u8; 11];
    out[0..8].copy_from_slice(&base_bytes);
    out[8..11].copy_from_slice(&ext_bytes);
    out
}

/// Generates a short alias for `display_name` that does not collide with
/// any name already present in `dir`, probing `~1`, `~2`, ... as the
/// teacher's `is_valid_name`/uniqueness checks imply (8.3 short names must
/// be unique within a directory).
fn generate_unique_short_name(
    dir: &Node,
    fat: &FatManager,
    io: &DirIo,
    display_name: &str,
) -> FsResult<[u8; 11]> {
    if !needs_long_name(display_name) {
        return Ok(short_name_bytes(display_name, None));
    }
    for suffix in 1..=999_999u32 {
        let candidate = short_name_bytes(display_name, Some(suffix));
        let mut collision = false;
        for_each_entry(dir, fat, io, |entry| {
            if entry.short.name == candidate {
                collision = true;
                return Ok(false);
            }
            Ok(true)
        })?;
        if !collision {
            return Ok(candidate);
        }
    }
    Err(Error::invalid("exhausted short-name suffixes"))
}

/// Finds `slot_count` contiguous free slots, growing the directory by one
/// cluster if none are found (directories never fail a grow with a
/// partial write — unlike file content, per the node layer invariants).
fn find_free_run(dir: &Node, fat: &mut FatManager, io: &DirIo, slot_count: usize) -> FsResult<u64> {
    let mut offset = 0u64;
    let mut run_start = 0u64;
    let mut run_len = 0usize;
    loop {
        let slot = read_slot(dir, fat, io, offset)?;
        match slot {
            None => break,
            Some(bytes) => {
                if bytes[0] == DIR_ENTRY_FREE || bytes[0] == DIR_ENTRY_LAST_FREE {
                    if run_len == 0 {
                        run_start = offset;
                    }
                    run_len += 1;
                    if run_len >= slot_count {
                        return Ok(run_start);
                    }
                } else {
                    run_len = 0;
                }
            }
        }
        offset += DIRENT_SIZE as u64;
    }
    // No free run of the right length: grow the directory by one cluster
    // (freshly allocated clusters read as zero, i.e. all DIR_ENTRY_LAST_FREE)
    // and place the run at its start.
    let grow_start = dir.size();
    let new_size = dir.size() + io.cluster_size as u64;
    if new_size > MAX_DIR_SIZE {
        return Err(Error::NoSpace);
    }
    dir.set_size(new_size, fat, io.cache, io.cluster_size)
        .map_err(|_| Error::NoSpace)?;
    // Newly allocated clusters are not guaranteed zeroed by the cache;
    // directory scanning relies on a fresh run reading as free.
    let zeros = vec![0u8; io.cluster_size];
    dir.write_at(&zeros, grow_start, fat, io.cache, io.cluster_size, io.cluster_offset)?
        .into_result()?;
    Ok(grow_start)
}

fn write_slot(
    dir: &Node,
    fat: &mut FatManager,
    io: &DirIo,
    offset: u64,
    bytes: &[u8; DIRENT_SIZE],
) -> FsResult<()> {
    dir.write_at(bytes, offset, fat, io.cache, io.cluster_size, io.cluster_offset)?
        .into_result()?;
    Ok(())
}

/// Writes a new short entry (plus long-name slots if the display name
/// needs them) into the first free run, returning the written view.
pub fn allocate_entry(
    dir: &Node,
    fat: &mut FatManager,
    io: &DirIo,
    display_name: &str,
    mut short: ShortDirEntry,
) -> FsResult<DirEntryView> {
    if display_name.chars().count() > MAX_NAME_LEN {
        return Err(Error::invalid(format!(
            "name exceeds the {MAX_NAME_LEN}-code-point limit"
        )));
    }
    short.name = generate_unique_short_name(dir, fat, io, display_name)?;
    let checksum = short_name_checksum(&short.name);
    let lfn_slots = if needs_long_name(display_name) {
        LongDirEntry::slots_for_name(display_name, checksum)
    } else {
        Vec::new()
    };
    let total_slots = lfn_slots.len() + 1;
    let run_start = find_free_run(dir, fat, io, total_slots)?;

    let mut offset = run_start;
    for slot in &lfn_slots {
        write_slot(dir, fat, io, offset, &slot.to_bytes())?;
        offset += DIRENT_SIZE as u64;
    }
    write_slot(dir, fat, io, offset, &short.to_bytes())?;

    Ok(DirEntryView {
        display_name: display_name.to_string(),
        short,
        short_entry_offset: offset,
        run_start_offset: run_start,
    })
}

/// Frees every slot in `[run_start_offset, short_entry_offset]`, using the
/// 0x00 end marker only when every subsequent slot in the directory is
/// already free (matching the on-disk invariant that 0x00 means "nothing
/// allocated after this point").
pub fn free_entry(dir: &Node, fat: &mut FatManager, io: &DirIo, entry: &DirEntryView) -> FsResult<()> {
    let is_tail = {
        let mut tail = true;
        let mut offset = entry.short_entry_offset + DIRENT_SIZE as u64;
        loop {
            match read_slot(dir, fat, io, offset)? {
                None => break,
                Some(bytes) => {
                    if bytes[0] != DIR_ENTRY_FREE && bytes[0] != DIR_ENTRY_LAST_FREE {
                        tail = false;
                        break;
                    }
                }
            }
            offset += DIRENT_SIZE as u64;
        }
        tail
    };

    let mut offset = entry.run_start_offset;
    while offset <= entry.short_entry_offset {
        let marker = if is_tail && offset == entry.short_entry_offset {
            DIR_ENTRY_LAST_FREE
        } else {
            DIR_ENTRY_FREE
        };
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes[0] = marker;
        write_slot(dir, fat, io, offset, &bytes)?;
        offset += DIRENT_SIZE as u64;
    }
    Ok(())
}

/// Updates the short entry at `entry_offset` in place (first-cluster, size,
/// or timestamp changes) without touching its long-name slots.
pub fn update_entry(
    dir: &Node,
    fat: &mut FatManager,
    io: &DirIo,
    entry_offset: u64,
    short: &ShortDirEntry,
) -> FsResult<()> {
    write_slot(dir, fat, io, entry_offset, &short.to_bytes())
}

/// Writes the `.` and `..` entries that open every non-root directory's
/// data: both point at `self_cluster`/`parent_cluster` respectively, with
/// `parent_cluster == 0` meaning "the root".
pub fn write_dot_and_dotdot(
    dir: &Node,
    fat: &mut FatManager,
    io: &DirIo,
    self_cluster: u32,
    parent_cluster: u32,
) -> FsResult<()> {
    let now = FatTimestamp::now();
    let mut dot_name = [b' '; 11];
    dot_name[0] = b'.';
    let mut dot = ShortDirEntry::new_dir(dot_name, self_cluster, (now.time, now.date));
    dot.attr = crate::ATTR_DIRECTORY;

    let mut dotdot_name = [b' '; 11];
    dotdot_name[0] = b'.';
    dotdot_name[1] = b'.';
    let mut dotdot = ShortDirEntry::new_dir(dotdot_name, parent_cluster, (now.time, now.date));
    dotdot.attr = crate::ATTR_DIRECTORY;

    write_slot(dir, fat, io, 0, &dot.to_bytes())?;
    write_slot(dir, fat, io, DIRENT_SIZE as u64, &dotdot.to_bytes())?;
    Ok(())
}

/// Checks whether a directory's content contains only `.`/`..` (or
/// nothing, for a FAT12/16 root), required before unlinking it.
pub fn is_directory_empty(dir: &Node, fat: &FatManager, io: &DirIo) -> FsResult<bool> {
    let mut empty = true;
    for_each_entry(dir, fat, io, |entry| {
        if entry.display_name != "." && entry.display_name != ".." {
            empty = false;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(empty)
}
