//! The FAT (File Allocation Table) itself: a singly-linked list of cluster
//! numbers, stored as a flat array of fixed-width entries, replicated
//! across `num_fats` identical copies.
//!
//! Given any valid cluster number N, the entry for that cluster lives at
//! bit offset `N * entry_bits` into the FAT; reads always come from the
//! first copy, writes go to every copy so a damaged primary FAT can still
//! be repaired from a backup.
//!
//! All public methods here are the single point of serialization for FAT
//! mutation: per the lock hierarchy, callers hold the FAT manager's own
//! mutex (see `vfs::Filesystem`) before calling any `&mut self` method.

use crate::block_cache::BlockCache;
use crate::bpb::{BiosParameterBlock, FatVariant};
use crate::error::{Error, FsResult};
use crate::{read_le_u16, read_le_u32, write_le_u16, write_le_u32, FIRST_DATA_CLUSTER};

pub struct FatManager {
    variant: FatVariant,
    fat_offsets: Vec<u64>,
    entry_count: u32,
    /// Rotating allocation hint: the cluster after which the next
    /// first-fit scan starts, so repeated allocations don't all re-scan
    /// from cluster 2.
    next_free_hint: u32,
}

impl FatManager {
    pub fn new(bpb: &BiosParameterBlock) -> Self {
        let fat_offsets = (0..bpb.fat_count())
            .map(|i| bpb.fat_offset(i) as u64)
            .collect();
        FatManager {
            variant: bpb.variant(),
            fat_offsets,
            entry_count: bpb.data_cluster_count() + FIRST_DATA_CLUSTER,
            next_free_hint: FIRST_DATA_CLUSTER,
        }
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    fn check_cluster(&self, cluster: u32) -> FsResult<()> {
        if cluster < FIRST_DATA_CLUSTER || cluster >= self.entry_count {
            return Err(Error::invalid(format!("cluster {cluster} out of range")));
        }
        Ok(())
    }

    /// Bit offset into the FAT region, in bytes (floor) and whether
    /// `cluster` occupies the high or low nibble of a FAT12 byte pair.
    fn fat12_byte_offset(cluster: u32) -> u64 {
        (cluster as u64 * 3) / 2
    }

    pub fn read_entry(&self, cache: &BlockCache, cluster: u32) -> FsResult<u32> {
        self.check_cluster(cluster)?;
        let base = self.fat_offsets[0];
        let raw = match self.variant {
            FatVariant::Fat12 => {
                let byte_off = Self::fat12_byte_offset(cluster);
                let mut buf = [0u8; 2];
                cache.read_at(&mut buf, base + byte_off)?;
                let word = read_le_u16(&buf);
                if cluster % 2 == 0 {
                    (word & 0x0FFF) as u32
                } else {
                    (word >> 4) as u32
                }
            }
            FatVariant::Fat16 => {
                let mut buf = [0u8; 2];
                cache.read_at(&mut buf, base + cluster as u64 * 2)?;
                read_le_u16(&buf) as u32
            }
            FatVariant::Fat32 => {
                let mut buf = [0u8; 4];
                cache.read_at(&mut buf, base + cluster as u64 * 4)?;
                read_le_u32(&buf) & 0x0FFF_FFFF
            }
        };
        Ok(raw)
    }

    pub fn write_entry(&self, cache: &BlockCache, cluster: u32, value: u32) -> FsResult<()> {
        self.check_cluster(cluster)?;
        for &base in &self.fat_offsets {
            match self.variant {
                FatVariant::Fat12 => {
                    let byte_off = Self::fat12_byte_offset(cluster);
                    let mut buf = [0u8; 2];
                    cache.read_at(&mut buf, base + byte_off)?;
                    let old = read_le_u16(&buf);
                    let new_word = if cluster % 2 == 0 {
                        (old & 0xF000) | (value as u16 & 0x0FFF)
                    } else {
                        (old & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                    };
                    write_le_u16(&mut buf, new_word);
                    cache.write_at(&buf, base + byte_off)?;
                }
                FatVariant::Fat16 => {
                    let mut buf = [0u8; 2];
                    write_le_u16(&mut buf, value as u16);
                    cache.write_at(&buf, base + cluster as u64 * 2)?;
                }
                FatVariant::Fat32 => {
                    let mut old = [0u8; 4];
                    cache.read_at(&mut old, base + cluster as u64 * 4)?;
                    let preserved = read_le_u32(&old) & 0xF000_0000;
                    let mut buf = [0u8; 4];
                    write_le_u32(&mut buf, preserved | (value & 0x0FFF_FFFF));
                    cache.write_at(&buf, base + cluster as u64 * 4)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_eof(&self, raw: u32) -> bool {
        self.variant.is_eof(raw)
    }

    fn is_bad(&self, raw: u32) -> bool {
        raw == self.variant.bad_marker()
    }

    fn is_free(&self, raw: u32) -> bool {
        raw == 0
    }

    /// Follows the chain starting at `start_cluster`, returning every
    /// cluster number visited in order. Bounded by `entry_count` so a
    /// corrupted chain that loops back on itself is reported instead of
    /// spinning forever.
    pub fn collect(&self, cache: &BlockCache, start_cluster: u32) -> FsResult<Vec<u32>> {
        let mut chain = Vec::new();
        let mut current = start_cluster;
        loop {
            self.check_cluster(current)?;
            chain.push(current);
            if chain.len() as u32 > self.entry_count {
                return Err(Error::corrupt("cluster chain cycle detected"));
            }
            let raw = self.read_entry(cache, current)?;
            if self.is_eof(raw) {
                break;
            }
            if self.is_bad(raw) || self.is_free(raw) {
                return Err(Error::corrupt(format!(
                    "cluster {current} points at a bad/free entry mid-chain"
                )));
            }
            current = raw;
        }
        Ok(chain)
    }

    /// Finds `count` free clusters via rotating first-fit, without
    /// claiming them yet. Bounded by the number of valid data clusters
    /// rather than by comparing against the starting cluster, since the
    /// hint can itself land out of range (`allocate` advances it to
    /// `last_cluster + 1`, which equals `entry_count` when the last
    /// cluster in the volume was just taken) and would otherwise never
    /// re-hit its own start, spinning forever on a full volume.
    fn find_free(&mut self, cache: &BlockCache, count: usize) -> FsResult<Vec<u32>> {
        let mut found = Vec::with_capacity(count);
        let total = self.entry_count.saturating_sub(FIRST_DATA_CLUSTER);
        let mut cluster = if (FIRST_DATA_CLUSTER..self.entry_count).contains(&self.next_free_hint) {
            self.next_free_hint
        } else {
            FIRST_DATA_CLUSTER
        };
        let mut scanned = 0u32;
        while found.len() < count && scanned < total {
            let raw = self.read_entry(cache, cluster)?;
            if self.is_free(raw) {
                found.push(cluster);
            }
            scanned += 1;
            cluster += 1;
            if cluster >= self.entry_count {
                cluster = FIRST_DATA_CLUSTER;
            }
        }
        if found.len() < count {
            return Err(Error::NoSpace);
        }
        Ok(found)
    }

    /// Allocates `count` new clusters, chaining them together and
    /// terminating the chain with an EOF marker. Returns the clusters in
    /// chain order.
    pub fn allocate(&mut self, cache: &BlockCache, count: usize) -> FsResult<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let clusters = self.find_free(cache, count)?;
        for window in clusters.windows(2) {
            self.write_entry(cache, window[0], window[1])?;
        }
        self.write_entry(cache, *clusters.last().unwrap(), self.variant.eof_marker())?;
        self.next_free_hint = clusters
            .last()
            .map(|&c| c + 1)
            .unwrap_or(self.next_free_hint);
        Ok(clusters)
    }

    /// Extends the chain whose current tail is `tail_cluster` by `count`
    /// clusters, linking the first new cluster onto the old tail.
    pub fn extend(&mut self, cache: &BlockCache, tail_cluster: u32, count: usize) -> FsResult<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let new_clusters = self.allocate(cache, count)?;
        self.write_entry(cache, tail_cluster, new_clusters[0])?;
        Ok(new_clusters)
    }

    /// Frees every cluster in `clusters`, marking each entry 0 (free).
    fn free_all(&self, cache: &BlockCache, clusters: &[u32]) -> FsResult<()> {
        for &c in clusters {
            self.write_entry(cache, c, 0)?;
        }
        Ok(())
    }

    /// Truncates the chain so only the first `keep_clusters` remain
    /// allocated, freeing the rest. Per the truncate/delete boundary rule:
    /// this is only called when `keep_clusters >= 1`; truncating to zero
    /// clusters is a delete, handled by [`FatManager::delete`].
    pub fn truncate(
        &mut self,
        cache: &BlockCache,
        start_cluster: u32,
        keep_clusters: usize,
    ) -> FsResult<()> {
        assert!(keep_clusters >= 1, "truncate to zero clusters is a delete");
        let chain = self.collect(cache, start_cluster)?;
        if keep_clusters >= chain.len() {
            return Ok(());
        }
        let new_tail = chain[keep_clusters - 1];
        let to_free = &chain[keep_clusters..];
        self.write_entry(cache, new_tail, self.variant.eof_marker())?;
        self.free_all(cache, to_free)?;
        Ok(())
    }

    /// Frees an entire chain, used when a file/directory is removed or
    /// truncated to zero length.
    pub fn delete(&mut self, cache: &BlockCache, start_cluster: u32) -> FsResult<()> {
        let chain = self.collect(cache, start_cluster)?;
        self.free_all(cache, &chain)
    }

    pub fn cluster_count_for_size(&self, size: u64, cluster_size: usize) -> usize {
        ((size as usize) + cluster_size - 1) / cluster_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_fat32_image;
    use std::sync::Arc;

    fn fat32_fixture() -> (BiosParameterBlock, Arc<BlockCache>) {
        let image = format_fat32_image(64 * 1024 * 1024);
        let bpb = BiosParameterBlock::parse(&image[0..512]).unwrap();
        let device = Arc::new(crate::block_device::MemoryDevice::from_vec(image));
        let cache = Arc::new(BlockCache::new(device, bpb.bytes_per_sector(), 64 * 1024));
        (bpb, cache)
    }

    #[test]
    fn allocate_then_collect_round_trips() {
        let (bpb, cache) = fat32_fixture();
        let mut fat = FatManager::new(&bpb);
        let clusters = fat.allocate(&cache, 3).unwrap();
        assert_eq!(clusters.len(), 3);
        let collected = fat.collect(&cache, clusters[0]).unwrap();
        assert_eq!(collected, clusters);
    }

    #[test]
    fn extend_appends_to_existing_chain() {
        let (bpb, cache) = fat32_fixture();
        let mut fat = FatManager::new(&bpb);
        let first = fat.allocate(&cache, 1).unwrap();
        let more = fat.extend(&cache, first[0], 2).unwrap();
        let chain = fat.collect(&cache, first[0]).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(&chain[1..], &more[..]);
    }

    #[test]
    fn truncate_frees_trailing_clusters_and_keeps_head() {
        let (bpb, cache) = fat32_fixture();
        let mut fat = FatManager::new(&bpb);
        let clusters = fat.allocate(&cache, 4).unwrap();
        fat.truncate(&cache, clusters[0], 2).unwrap();
        let remaining = fat.collect(&cache, clusters[0]).unwrap();
        assert_eq!(remaining, &clusters[0..2]);
        for &c in &clusters[2..] {
            assert_eq!(fat.read_entry(&cache, c).unwrap(), 0);
        }
    }

    #[test]
    fn delete_frees_the_whole_chain() {
        let (bpb, cache) = fat32_fixture();
        let mut fat = FatManager::new(&bpb);
        let clusters = fat.allocate(&cache, 3).unwrap();
        fat.delete(&cache, clusters[0]).unwrap();
        for &c in &clusters {
            assert_eq!(fat.read_entry(&cache, c).unwrap(), 0);
        }
    }

    #[test]
    fn allocate_beyond_capacity_fails_with_no_space() {
        let (bpb, cache) = fat32_fixture();
        let mut fat = FatManager::new(&bpb);
        let huge = fat.entry_count as usize * 2;
        assert!(matches!(fat.allocate(&cache, huge), Err(Error::NoSpace)));
    }

    #[test]
    fn allocate_when_volume_is_exactly_full_returns_no_space_without_hanging() {
        let (bpb, cache) = fat32_fixture();
        let mut fat = FatManager::new(&bpb);
        let total = (fat.entry_count - FIRST_DATA_CLUSTER) as usize;
        fat.allocate(&cache, total).unwrap();
        // `next_free_hint` now sits at `entry_count` (one past the last
        // cluster just taken); this must still terminate.
        assert!(matches!(fat.allocate(&cache, 1), Err(Error::NoSpace)));
    }
}
