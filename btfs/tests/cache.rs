mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use block_dev::{BlockDevice, DevError, MemDisk};
use btfs::{
    CacheConfig, CacheFlag, CacheFlags, CreateFlags, Error, FormatOptions, MountOptions,
    OwnerTag, SectorCache, SectorId, Volume, VolumeId,
};
use common::{fixture, init_log, small};

fn fill(vol: &Volume, sid: SectorId, byte: u8) {
    fill_as(vol, sid, byte, None);
}

fn fill_as(vol: &Volume, sid: SectorId, byte: u8, owner: Option<OwnerTag>) {
    let mut sector = vol
        .cache()
        .get_sector(vol, sid, CacheFlag::User | CacheFlag::NoRead)
        .unwrap();
    sector.map_mut(|buf| buf.fill(byte));
    sector.put(CacheFlag::Dirty.into(), owner).unwrap();
}

fn first_byte(vol: &Volume, sid: SectorId) -> u8 {
    vol.cache()
        .get_sector(vol, sid, CacheFlag::User.into())
        .unwrap()
        .map(|buf| buf[0])
}

#[test]
fn threads_see_their_last_write() {
    // 缓存小于工作集，淘汰与写回交替发生
    let fx = fixture(1 << 20, 1, 16);
    let vol = &fx.vol;
    let base = vol.geometry().data_start + 100;

    thread::scope(|s| {
        for t in 0..4usize {
            s.spawn(move || {
                for round in 0..20u8 {
                    for k in 0..8 {
                        let sid = base + (t * 8 + k);
                        fill(vol, sid, round.wrapping_mul(7).wrapping_add(k as u8));
                        if round % 5 == 0 {
                            vol.cache().sync_entry(vol, sid, CacheFlags::empty()).unwrap();
                        }
                    }
                }
                for k in 0..8 {
                    let sid = base + (t * 8 + k);
                    assert_eq!(19u8.wrapping_mul(7).wrapping_add(k as u8), first_byte(vol, sid));
                }
            });
        }
    });

    vol.sync(CacheFlags::empty()).unwrap();
    assert_eq!(0, vol.cache().dirty_count(vol));
    for i in 0..32 {
        let sid = base + i;
        let expect = 19u8.wrapping_mul(7).wrapping_add((i % 8) as u8);
        assert!(fx.disk.snapshot(sid.block(512)).iter().all(|&b| b == expect));
    }
}

#[test]
fn sync_volume_writes_everything() {
    let fx = small();
    let vol = &fx.vol;
    let base = vol.geometry().data_start + 10;
    for i in 0..40 {
        fill(vol, base + i, i as u8 + 1);
    }
    assert_eq!(40, vol.cache().dirty_count(vol));

    vol.sync(CacheFlags::empty()).unwrap();
    assert_eq!(0, vol.cache().dirty_count(vol));
    for i in 0..40 {
        let block = fx.disk.snapshot((base + i).block(512));
        assert!(block.iter().all(|&b| b == i as u8 + 1));
    }
}

#[test]
fn failed_write_back_stays_dirty() {
    let fx = small();
    let vol = &fx.vol;
    let sid = vol.geometry().data_start + 3;
    fill(vol, sid, 0x5A);

    fx.disk.fail_writes(true);
    assert_eq!(Err(Error::Io), vol.sync(CacheFlags::empty()));
    assert!(vol.cache().is_dirty(vol, sid));

    fx.disk.fail_writes(false);
    vol.sync(CacheFlags::empty()).unwrap();
    assert!(!vol.cache().is_dirty(vol, sid));
    assert!(fx.disk.snapshot(sid.block(512)).iter().all(|&b| b == 0x5A));
}

#[test]
fn forced_sync_continues_past_failures() {
    let fx = small();
    let vol = &fx.vol;
    let base = vol.geometry().data_start + 20;
    for i in 0..3 {
        fill(vol, base + i, 9);
    }

    fx.disk.fail_writes(true);
    assert_eq!(Err(Error::Io), vol.sync(CacheFlag::Force.into()));
    // 每个条目都尝试过，全部仍为脏
    assert_eq!(3, vol.cache().dirty_count(vol));
    fx.disk.fail_writes(false);
}

#[test]
fn pinned_pool_is_exhausted() {
    let fx = fixture(1 << 20, 1, 4);
    let vol = &fx.vol;
    let base = vol.geometry().data_start;
    let held: Vec<_> = (0..4)
        .map(|i| {
            vol.cache()
                .get_sector(vol, base + i, CacheFlag::User.into())
                .unwrap()
        })
        .collect();

    let res = vol.cache().get_sector(vol, base + 4, CacheFlag::User.into());
    assert_eq!(Some(Error::NoFreeCacheEntry), res.err());

    drop(held);
    assert!(vol.cache().get_sector(vol, base + 4, CacheFlag::User.into()).is_ok());
}

#[test]
fn dirty_victim_is_written_back_not_dropped() {
    let fx = fixture(1 << 20, 1, 4);
    let vol = &fx.vol;
    let base = vol.geometry().data_start + 50;
    for i in 0..4 {
        fill(vol, base + i, 0x10 + i as u8);
    }

    fill(vol, base + 4, 0x14);

    // 最久未用的脏条目先写回再被淘汰
    assert_eq!(1, fx.disk.writes_to(base.block(512)));
    assert!(!vol.cache().is_resident(vol, base));
    assert!(fx.disk.snapshot(base.block(512)).iter().all(|&b| b == 0x10));
    for i in 1..5 {
        assert!(vol.cache().is_dirty(vol, base + i));
    }
}

#[test]
fn read_failure_leaves_no_entry() {
    let fx = small();
    let vol = &fx.vol;
    let sid = vol.geometry().data_start + 7;

    fx.disk.fail_reads(true);
    let res = vol.cache().get_sector(vol, sid, CacheFlag::User.into());
    assert_eq!(Some(Error::Io), res.err());
    assert!(!vol.cache().is_resident(vol, sid));
    fx.disk.fail_reads(false);
}

#[test]
fn stale_entries_are_discarded_unwritten() {
    let fx = small();
    let vol = &fx.vol;
    let sid = vol.geometry().data_start + 30;
    fill(vol, sid, 0xEE);

    vol.remount(false);
    vol.sync(CacheFlags::empty()).unwrap();
    assert_eq!(0, fx.disk.writes_to(sid.block(512)));
    assert_eq!(0, vol.cache().dirty_count(vol));
    // 新一代读到的是介质上的内容
    assert_eq!(0, first_byte(vol, sid));
}

#[test]
fn fat_writes_are_mirrored() {
    let fx = small();
    let vol = &fx.vol;
    let geo = *vol.geometry();
    let mut sector = vol
        .cache()
        .get_sector(vol, geo.fat_start, CacheFlag::Fat.into())
        .unwrap();
    sector.map_mut(|buf| buf[100] = 0x77);
    sector.put(CacheFlag::Dirty | CacheFlag::Sync, None).unwrap();

    let mirror = geo.fat_start + geo.fat_sectors;
    assert_eq!(0x77, fx.disk.snapshot(geo.fat_start.block(512))[100]);
    assert_eq!(0x77, fx.disk.snapshot(mirror.block(512))[100]);
}

#[test]
fn node_sync_takes_its_own_and_shared_entries() {
    let fx = small();
    let vol = &fx.vol;
    let (one, two) = (OwnerTag::new(1), OwnerTag::new(2));
    let base = vol.geometry().data_start + 200;
    let (mine, theirs, shared) = (base, base + 1, base + 2);

    fill_as(vol, mine, 1, Some(one));
    fill_as(vol, theirs, 2, Some(two));
    fill_as(vol, shared, 3, Some(two));
    fill_as(vol, shared, 4, Some(one));
    fill_as(vol, shared, 5, Some(two));

    vol.cache().sync_node(vol, one, CacheFlags::empty()).unwrap();
    assert!(!vol.cache().is_dirty(vol, mine));
    assert!(vol.cache().is_dirty(vol, theirs));
    // 最后一次由属主2弄脏，但共享条目总会随任一属主写回
    assert!(!vol.cache().is_dirty(vol, shared));
    assert!(fx.disk.snapshot(mine.block(512)).iter().all(|&b| b == 1));
    assert!(fx.disk.snapshot(shared.block(512)).iter().all(|&b| b == 5));
    assert_eq!(0, fx.disk.writes_to(theirs.block(512)));

    vol.cache().sync_node(vol, two, CacheFlags::empty()).unwrap();
    assert_eq!(0, vol.cache().dirty_count(vol));
}

#[test]
fn dirty_update_joins_the_dirty_list() {
    let fx = small();
    let vol = &fx.vol;
    let sid = vol.geometry().data_start + 210;
    first_byte(vol, sid);
    assert_eq!(0, vol.cache().dirty_count(vol));

    let owner = OwnerTag::new(9);
    vol.cache()
        .update(vol, sid, &[0x5A; 512], 1, CacheFlag::Dirty.into(), Some(owner));
    assert!(vol.cache().is_dirty(vol, sid));
    assert_eq!(1, vol.cache().dirty_count(vol));
    assert_eq!(0x5A, first_byte(vol, sid));
    assert_eq!(0, fx.disk.writes_to(sid.block(512)));

    vol.sync(CacheFlags::empty()).unwrap();
    assert!(!vol.cache().is_dirty(vol, sid));
    assert!(fx.disk.snapshot(sid.block(512)).iter().all(|&b| b == 0x5A));

    // 非驻留扇区不受影响
    vol.cache()
        .update(vol, sid + 1, &[1; 512], 1, CacheFlag::Dirty.into(), Some(owner));
    assert!(!vol.cache().is_resident(vol, sid + 1));
}

#[test]
fn write_through_refreshes_resident_entries() {
    let fx = small();
    let vol = &fx.vol;
    let base = vol.geometry().data_start + 220;
    fill(vol, base, 0x11);
    let data: Vec<u8> = [0x22; 512].into_iter().chain([0x33; 512]).collect();

    vol.cache().write_through(vol, base, &data, 2).unwrap();
    assert!(!vol.cache().is_dirty(vol, base));
    assert!(!vol.cache().is_resident(vol, base + 1));
    assert_eq!(0x22, first_byte(vol, base));
    assert!(fx.disk.snapshot(base.block(512)).iter().all(|&b| b == 0x22));
    assert!(fx.disk.snapshot((base + 1).block(512)).iter().all(|&b| b == 0x33));

    // 写入失败后缓存不再声称与介质一致
    fx.disk.fail_writes(true);
    let res = vol.cache().write_through(vol, base, &[0x44; 512], 1);
    fx.disk.fail_writes(false);
    assert_eq!(Err(Error::Io), res);
    assert!(!vol.cache().is_resident(vol, base));
}

/// 对指定块的下一次写入停在闸门前，直到闸门打开
struct GatedDisk {
    disk: MemDisk,
    gated: AtomicUsize,
    waiting: AtomicBool,
    open: AtomicBool,
}

impl GatedDisk {
    const NONE: usize = usize::MAX;

    fn new(bytes: usize) -> Self {
        Self {
            disk: MemDisk::new(bytes),
            gated: AtomicUsize::new(Self::NONE),
            waiting: AtomicBool::new(false),
            open: AtomicBool::new(false),
        }
    }

    fn gate(&self, block_id: usize) {
        self.open.store(false, Ordering::SeqCst);
        self.gated.store(block_id, Ordering::SeqCst);
    }

    fn wait_until_held(&self) {
        while !self.waiting.load(Ordering::SeqCst) {
            thread::yield_now();
        }
    }

    fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

impl BlockDevice for GatedDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        self.disk.read_block(block_id, buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        let hit = self
            .gated
            .compare_exchange(block_id, Self::NONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if hit {
            self.waiting.store(true, Ordering::SeqCst);
            while !self.open.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        }
        self.disk.write_block(block_id, buf)
    }
}

#[test]
fn direct_cluster_write_survives_concurrent_write_back() {
    init_log();
    let bytes = 1 << 20;
    let disk = Arc::new(GatedDisk::new(bytes));
    let opts = FormatOptions {
        cluster_sectors: Some(1),
        ..Default::default()
    };
    btfs::format(&disk.disk, bytes, opts).unwrap();
    let cache = Arc::new(SectorCache::new(CacheConfig::default()));
    let vol = &Volume::mount(VolumeId::new(9000), disk.clone(), cache, MountOptions::default()).unwrap();

    let root = vol.root();
    let node = root.create(vol, "race", CreateFlags::empty()).unwrap();
    node.open(vol, 1).unwrap();
    node.write_at(vol, 0, &[0xAA; 100]).unwrap();
    let sid = vol.geometry().cluster_sector(node.cluster());
    let block = sid.block(512);
    assert!(vol.cache().is_dirty(vol, sid));

    disk.gate(block);
    thread::scope(|s| {
        // 写回旧内容的过程停在设备上
        let syncer = s.spawn(|| vol.sync(CacheFlags::empty()));
        disk.wait_until_held();

        let writer = s.spawn(|| node.write_at(vol, 0, &[0xBB; 512]));
        thread::sleep(Duration::from_millis(50));
        disk.release();

        syncer.join().unwrap().unwrap();
        assert_eq!(512, writer.join().unwrap().unwrap());
    });

    vol.sync(CacheFlags::empty()).unwrap();
    assert!(!vol.cache().is_dirty(vol, sid));
    assert!(disk.disk.snapshot(block).iter().all(|&b| b == 0xBB));
    let mut buf = [0; 512];
    node.read_at(vol, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xBB));
}
