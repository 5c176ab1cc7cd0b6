//! # 卷
//!
//! 保留区 | FAT区(×fat_count) | 数据区
//!
//! 卷持有挂载代：每次挂载或重新挂载都会换成一个新的值，
//! 之前的节点句柄与缓存条目因此失效。

mod bpb;
pub mod fat;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use block_dev::BlockDevice;
use derive_more::{Display, From, Into};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use self::bpb::Bpb;
pub use self::fat::{ClusterAllocator, FatAllocator};
use crate::cache::{CacheFlags, OwnerTag, SectorCache};
use crate::hooks::{Addon, Clock, FixedClock, Journal, NullAddon, NullJournal};
use crate::node::Node;
use crate::{ClusterId, Error, Result, SectorId};

/// 挂载代的来源，全局递增，保证不同挂载之间永不相同
static GENERATION: AtomicU32 = AtomicU32::new(1);

fn next_generation() -> u32 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct VolumeId(u32);

impl VolumeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub sector_bytes: usize,
    /// `None`表示按卷大小选取
    pub cluster_sectors: Option<usize>,
    pub fat_count: usize,
    /// 运行时把FAT修改复制到所有副本
    pub mirroring: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sector_bytes: 512,
            cluster_sectors: None,
            fat_count: 2,
            mirroring: true,
        }
    }
}

/// 由参数块导出的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_bytes: usize,
    pub cluster_sectors: usize,
    pub fat_start: SectorId,
    /// 单个FAT的扇区数
    pub fat_sectors: usize,
    pub fat_count: usize,
    pub mirroring: bool,
    pub data_start: SectorId,
    pub total_sectors: usize,
    /// 数据区的簇数
    pub cluster_count: usize,
    pub root_cluster: ClusterId,
}

impl From<&Bpb> for Geometry {
    fn from(bpb: &Bpb) -> Self {
        Self {
            sector_bytes: bpb.sector_bytes(),
            cluster_sectors: bpb.cluster_sectors(),
            fat_start: bpb.fat_area(),
            fat_sectors: bpb.fat_sectors(),
            fat_count: bpb.fat_count(),
            mirroring: bpb.mirroring(),
            data_start: bpb.data_area(),
            total_sectors: bpb.total_sectors(),
            cluster_count: bpb.total_clusters(),
            root_cluster: bpb.root_cluster(),
        }
    }
}

impl Geometry {
    pub const fn cluster_bytes(&self) -> usize {
        self.sector_bytes * self.cluster_sectors
    }

    /// 一个簇能容纳的目录项数
    pub const fn cluster_entries(&self) -> usize {
        self.cluster_bytes() / 32
    }

    /// 最大的有效簇编号
    pub const fn max_cluster(&self) -> ClusterId {
        ClusterId::new(self.cluster_count as u32 + 1)
    }

    pub fn contains(&self, cluster: ClusterId) -> bool {
        (ClusterId::MIN..=self.max_cluster()).contains(&cluster)
    }

    /// 簇的首个扇区
    ///
    /// 数据区不占有`ClusterId::MIN`前面的簇，所以需要偏移。
    pub fn cluster_sector(&self, cluster: ClusterId) -> SectorId {
        self.data_start + (usize::from(cluster) - 2) * self.cluster_sectors
    }

    /// 簇在第一个FAT中的位置（扇区号 + 扇区内字节偏移）
    pub fn fat_position(&self, cluster: ClusterId) -> (SectorId, usize) {
        let byte = usize::from(cluster) * 4;
        (
            self.fat_start + byte / self.sector_bytes,
            byte % self.sector_bytes,
        )
    }

    pub fn fat_sector_of(&self, cluster: ClusterId) -> SectorId {
        self.fat_position(cluster).0
    }

    /// 第一个FAT中的扇区在其余副本中的对应扇区；关闭镜像时为空
    pub fn fat_mirrors(&self, sector: SectorId) -> impl Iterator<Item = SectorId> + use<> {
        let in_fat = sector >= self.fat_start && sector < self.fat_start + self.fat_sectors;
        let copies = if in_fat && self.mirroring {
            self.fat_count
        } else {
            1
        };
        let step = self.fat_sectors;
        (1..copies).map(move |k| sector + k * step)
    }
}

/// 格式化设备，返回新卷的布局
pub fn format(dev: &dyn BlockDevice, total_bytes: usize, opts: FormatOptions) -> Result<Geometry> {
    let bpb = Bpb::new(
        total_bytes / opts.sector_bytes,
        opts.sector_bytes,
        opts.cluster_sectors,
        opts.fat_count,
        opts.mirroring,
    )?;
    let geo = Geometry::from(&bpb);
    let sb = geo.sector_bytes;
    log::info!(
        "Formatting {} sectors: {} clusters of {} bytes, {} FATs of {} sectors",
        geo.total_sectors,
        geo.cluster_count,
        geo.cluster_bytes(),
        geo.fat_count,
        geo.fat_sectors
    );

    let mut buf = vec![0; sb];
    bpb.encode(&mut buf);
    dev.write_blocks(SectorId::new(0).block(sb), &buf)?;
    dev.write_blocks(SectorId::new(bpb.bk_boot_sec as usize).block(sb), &buf)?;

    let zero = vec![0; sb];
    for sid in geo.fat_start.span(geo.fat_count * geo.fat_sectors) {
        dev.write_blocks(sid.block(sb), &zero)?;
    }

    // 两个保留条目，以及只有一个簇的根目录
    buf.fill(0);
    buf[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    buf[4..8].copy_from_slice(&ClusterId::EOF.raw().to_le_bytes());
    let (_, root_at) = geo.fat_position(geo.root_cluster);
    buf[root_at..root_at + 4].copy_from_slice(&ClusterId::EOF.raw().to_le_bytes());
    for copy in 0..geo.fat_count {
        let sid = geo.fat_start + copy * geo.fat_sectors;
        dev.write_blocks(sid.block(sb), &buf)?;
    }

    for sid in geo.cluster_sector(geo.root_cluster).span(geo.cluster_sectors) {
        dev.write_blocks(sid.block(sb), &zero)?;
    }

    Ok(geo)
}

/// 已挂载的卷
pub struct Volume {
    id: VolumeId,
    stamp: AtomicU32,
    read_only: AtomicBool,
    geometry: Geometry,
    dev: Arc<dyn BlockDevice>,
    cache: Arc<SectorCache>,
    /// 命名空间操作取写锁，其余取读锁
    lock: RwLock<()>,
    allocator: Box<dyn ClusterAllocator>,
    journal: Box<dyn Journal>,
    addon: Box<dyn Addon>,
    clock: Box<dyn Clock>,
    owners: AtomicU64,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("stamp", &self.stamp())
            .field("read_only", &self.is_read_only())
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl Volume {
    pub fn mount(
        id: VolumeId,
        dev: Arc<dyn BlockDevice>,
        cache: Arc<SectorCache>,
        opts: MountOptions,
    ) -> Result<Self> {
        let mut boot = [0; block_dev::BLOCK_SIZE];
        dev.read_block(0, &mut boot)?;
        let bpb = Bpb::parse(&boot)?;
        let geometry = Geometry::from(&bpb);

        if geometry.sector_bytes != cache.sector_bytes() {
            log::error!(
                "Volume sector size {} does not match cache sector size {}",
                geometry.sector_bytes,
                cache.sector_bytes()
            );
            return Err(Error::Invalid);
        }

        let vol = Self {
            id,
            stamp: AtomicU32::new(next_generation()),
            read_only: AtomicBool::new(opts.read_only),
            geometry,
            dev,
            cache,
            lock: RwLock::new(()),
            allocator: Box::new(FatAllocator::new()),
            journal: Box::new(NullJournal),
            addon: Box::new(NullAddon),
            clock: Box::new(FixedClock::default()),
            owners: AtomicU64::new(1),
        };
        log::info!("Mounted volume {id}: {:?}", vol.geometry);
        Ok(vol)
    }

    pub fn with_allocator(mut self, allocator: impl ClusterAllocator + 'static) -> Self {
        self.allocator = Box::new(allocator);
        self
    }

    pub fn with_journal(mut self, journal: impl Journal + 'static) -> Self {
        self.journal = Box::new(journal);
        self
    }

    pub fn with_addon(mut self, addon: impl Addon + 'static) -> Self {
        self.addon = Box::new(addon);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// 重新挂载。
    ///
    /// 换代之后，旧代的节点操作返回[`Error::StaleGeneration`]，
    /// 旧代的脏缓存条目在写回时被丢弃。需要保留修改的调用者应先[`Volume::sync`]。
    pub fn remount(&self, read_only: bool) {
        let _guard = self.lock.write();
        let stamp = next_generation();
        self.stamp.store(stamp, Ordering::Release);
        self.read_only.store(read_only, Ordering::Release);
        log::info!("Remounted volume {} as generation {stamp}", self.id);
    }

    /// 根目录节点
    pub fn root(&self) -> Node {
        Node::root(self)
    }

    pub fn sync(&self, flags: CacheFlags) -> Result<()> {
        self.cache.sync_volume(self, flags)
    }

    /// 写回全部脏数据并释放缓存条目。写回失败时条目保留。
    pub fn unmount(&self) -> Result<()> {
        let _guard = self.lock.write();
        self.cache.sync_volume(self, CacheFlags::empty())?;
        self.cache.release_volume(self);
        self.read_only.store(true, Ordering::Release);
        log::info!("Unmounted volume {}", self.id);
        Ok(())
    }

    pub const fn id(&self) -> VolumeId {
        self.id
    }

    pub fn stamp(&self) -> u32 {
        self.stamp.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn device(&self) -> &dyn BlockDevice {
        &*self.dev
    }

    pub fn cache(&self) -> &SectorCache {
        &self.cache
    }

    pub fn allocator(&self) -> &dyn ClusterAllocator {
        &*self.allocator
    }

    pub fn journal(&self) -> &dyn Journal {
        &*self.journal
    }

    pub fn addon(&self) -> &dyn Addon {
        &*self.addon
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// 为新节点分配写回属主标记
    pub fn next_owner(&self) -> OwnerTag {
        OwnerTag::new(self.owners.fetch_add(1, Ordering::Relaxed))
    }
}

impl Volume {
    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub(crate) fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }
}
