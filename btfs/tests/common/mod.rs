#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use block_dev::MemDisk;
use btfs::dir::{DePos, ENTRY_SIZE, ShortDirEntry};
use btfs::{CacheConfig, FormatOptions, MountOptions, SectorCache, Volume, VolumeId};

static IDS: AtomicU32 = AtomicU32::new(1);

pub struct Fixture {
    pub disk: Arc<MemDisk>,
    pub vol: Volume,
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fixture(bytes: usize, cluster_sectors: usize, cache_entries: usize) -> Fixture {
    init_log();
    let disk = Arc::new(MemDisk::new(bytes));
    let opts = FormatOptions {
        cluster_sectors: Some(cluster_sectors),
        ..Default::default()
    };
    btfs::format(&*disk, bytes, opts).unwrap();
    let cache = Arc::new(SectorCache::new(CacheConfig {
        entries: cache_entries,
        ..Default::default()
    }));
    let id = VolumeId::new(IDS.fetch_add(1, Ordering::Relaxed));
    let vol = Volume::mount(id, disk.clone(), cache, MountOptions::default()).unwrap();
    Fixture { disk, vol }
}

/// 1 MiB，每簇一个扇区
pub fn small() -> Fixture {
    fixture(1 << 20, 1, 64)
}

impl Fixture {
    /// 目录项所在的块
    pub fn entry_block(&self, pos: DePos) -> usize {
        pos.location(&self.vol).0.block(self.vol.geometry().sector_bytes)
    }

    /// 介质上的短目录项，不经过缓存
    pub fn entry_on_disk(&self, pos: DePos) -> ShortDirEntry {
        let (sid, at) = pos.location(&self.vol);
        let block = self.disk.snapshot(sid.block(self.vol.geometry().sector_bytes));
        let mut raw = [0; ENTRY_SIZE];
        raw.copy_from_slice(&block[at..at + ENTRY_SIZE]);
        ShortDirEntry::decode(&raw)
    }

    pub fn free_clusters(&self) -> usize {
        self.vol.allocator().free_count(&self.vol).unwrap()
    }

    pub fn chain_len(&self, first: btfs::ClusterId) -> usize {
        self.vol.allocator().chain(&self.vol, first).unwrap().len()
    }
}
