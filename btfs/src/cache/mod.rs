//! # 扇区缓存
//!
//! FAT表与目录项所在扇区的共享缓存。固定数量的条目在挂载时一次分配，
//! 多个卷可以共用同一个缓存池，条目以`(卷标识, 扇区号)`索引。
//!
//! 每个条目的状态转换：
//!
//! ```text
//! FREE -> get(读穿) -> 使用中(钉住) -> put -> 空闲(LRU)
//!                                  \-> put(DIRTY) -> 脏(卷脏链) -> sync_entry -> 空闲 | FREE(DISCARD)
//! ```
//!
//! 条目记录了填充时卷的挂载代，写回前若发现已与卷不一致，则直接丢弃而不写入，
//! 以免破坏重新挂载之后的介质内容。
//!
//! 池锁只保护索引与各条链表，绝不跨越设备I/O持有；
//! 条目缓冲区各自有锁，且只在条目被钉住时访问。

mod list;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec;
use alloc::vec::Vec;
use core::hint;

use enumflags2::{BitFlags, bitflags, make_bitflags};
use spin::Mutex;

use self::list::{Chain, Links, List};
use crate::config::{CACHE_ENTRIES, SYNC_BATCH};
use crate::volume::{Volume, VolumeId};
use crate::{Error, Result, SectorId};

#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlag {
    /// 内容比介质新
    Dirty = 1 << 0,
    /// 被多个属主弄脏过，任何属主的写回都要带上它
    Shared = 1 << 1,
    /// 放回时立即写回
    Sync = 1 << 2,
    /// 调用者将整体覆盖扇区，不必读介质
    NoRead = 1 << 3,
    /// 写回后直接回收条目
    Discard = 1 << 4,
    /// 批量写回遇错时继续
    Force = 1 << 5,
    Fat = 1 << 6,
    De = 1 << 7,
    Meta = 1 << 8,
    User = 1 << 9,
}

pub type CacheFlags = BitFlags<CacheFlag>;

/// 数据类别
const CLASS: CacheFlags = make_bitflags!(CacheFlag::{Fat | De | Meta | User});

/// 写回分组用的不透明属主标记，通常对应一个节点
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerTag(u64);

impl OwnerTag {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// 条目数
    pub entries: usize,
    /// 扇区字节数，挂载的卷必须与之一致
    pub sector_bytes: usize,
    /// 批量写回时每批的条目数
    pub sync_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entries: CACHE_ENTRIES,
            sector_bytes: 512,
            sync_batch: SYNC_BATCH,
        }
    }
}

type Key = (VolumeId, SectorId);

#[derive(Debug, Default)]
struct Entry {
    key: Option<Key>,
    /// 填充时卷的挂载代
    stamp: u32,
    flags: CacheFlags,
    owner: Option<OwnerTag>,
    /// 钉住次数，大于0时不得淘汰或复用
    pins: u32,
    /// 正在读穿
    reading: bool,
    /// 已从索引摘除，最后一个钉住者放手时回收
    orphan: bool,
    /// 每次弄脏都递增，用来发现写回期间的新修改
    dirty_seq: u64,
    /// LRU链或空闲链，二者互斥
    lru: Links,
    /// 所属卷的脏链
    dirty: Links,
}

#[derive(Debug)]
struct LruChain;

impl Chain for LruChain {
    type Node = Entry;

    fn links(node: &Entry) -> &Links {
        &node.lru
    }

    fn links_mut(node: &mut Entry) -> &mut Links {
        &mut node.lru
    }
}

#[derive(Debug)]
struct DirtyChain;

impl Chain for DirtyChain {
    type Node = Entry;

    fn links(node: &Entry) -> &Links {
        &node.dirty
    }

    fn links_mut(node: &mut Entry) -> &mut Links {
        &mut node.dirty
    }
}

#[derive(Debug)]
struct Pool {
    entries: Vec<Entry>,
    index: BTreeMap<Key, usize>,
    free: List<LruChain>,
    /// 头部最近使用
    lru: List<LruChain>,
    /// 头部最近弄脏
    dirty: BTreeMap<VolumeId, List<DirtyChain>>,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        let mut entries: Vec<Entry> = (0..capacity).map(|_| Entry::default()).collect();
        let mut free = List::new();
        for idx in 0..capacity {
            free.push_back(&mut entries, idx);
        }
        Self {
            entries,
            index: BTreeMap::new(),
            free,
            lru: List::new(),
            dirty: BTreeMap::new(),
        }
    }

    /// 取一个可用条目：先用空闲链，再从LRU尾部淘汰未钉住的干净条目
    fn take_slot(&mut self) -> Option<usize> {
        if let Some(idx) = self.free.front() {
            self.free.remove(&mut self.entries, idx);
            return Some(idx);
        }

        let victim = self.lru.iter_rev(&self.entries).find(|&idx| {
            let e = &self.entries[idx];
            e.pins == 0 && !e.reading && !e.flags.contains(CacheFlag::Dirty)
        })?;
        log::trace!("Evicting {:?}", self.entries[victim].key);
        if let Some(key) = self.entries[victim].key {
            self.index.remove(&key);
        }
        self.lru.remove(&mut self.entries, victim);
        self.entries[victim] = Entry::default();
        Some(victim)
    }

    fn unlink_dirty(&mut self, idx: usize) {
        let Self { entries, dirty, .. } = self;
        if !entries[idx].dirty.is_linked() {
            return;
        }
        if let Some((vol, _)) = entries[idx].key {
            if let Some(list) = dirty.get_mut(&vol) {
                list.remove(entries, idx);
                if list.is_empty() {
                    dirty.remove(&vol);
                }
            }
        }
    }

    fn mark_dirty(&mut self, idx: usize, owner: Option<OwnerTag>) {
        let Self { entries, dirty, .. } = self;
        let entry = &mut entries[idx];
        let Some((vol, _)) = entry.key else {
            return;
        };
        if entry.orphan {
            return;
        }

        entry.dirty_seq += 1;
        if entry.flags.contains(CacheFlag::Dirty) && entry.owner != owner {
            entry.flags |= CacheFlag::Shared;
        }
        entry.flags |= CacheFlag::Dirty;
        entry.owner = owner;

        dirty.entry(vol).or_default().move_to_front(entries, idx);
    }

    fn clean(&mut self, idx: usize) {
        self.unlink_dirty(idx);
        let entry = &mut self.entries[idx];
        entry.flags.remove(CacheFlag::Dirty | CacheFlag::Shared);
        entry.owner = None;
    }

    /// 不写回地丢弃条目
    fn forget(&mut self, idx: usize) {
        self.clean(idx);
        if let Some(key) = self.entries[idx].key {
            if self.index.get(&key) == Some(&idx) {
                self.index.remove(&key);
            }
        }
        if self.entries[idx].pins == 0 {
            self.release(idx);
        } else {
            self.entries[idx].orphan = true;
        }
    }

    fn release(&mut self, idx: usize) {
        self.lru.remove(&mut self.entries, idx);
        self.entries[idx] = Entry::default();
        self.free.push_back(&mut self.entries, idx);
    }

    fn unpin(&mut self, idx: usize) {
        let entry = &mut self.entries[idx];
        debug_assert!(entry.pins > 0, "unpinning an idle cache entry");
        entry.pins -= 1;
        if entry.pins == 0 && entry.orphan {
            self.release(idx);
        }
    }
}

/// 扇区缓存池
#[derive(Debug)]
pub struct SectorCache {
    config: CacheConfig,
    slots: Box<[Mutex<Box<[u8]>>]>,
    pool: Mutex<Pool>,
}

impl SectorCache {
    pub fn new(config: CacheConfig) -> Self {
        assert!(config.entries > 0, "empty sector cache");
        assert!(config.sync_batch > 0, "zero sync batch");
        let slots = (0..config.entries)
            .map(|_| Mutex::new(vec![0; config.sector_bytes].into_boxed_slice()))
            .collect();
        Self {
            config,
            slots,
            pool: Mutex::new(Pool::new(config.entries)),
        }
    }

    pub const fn sector_bytes(&self) -> usize {
        self.config.sector_bytes
    }

    pub const fn capacity(&self) -> usize {
        self.config.entries
    }

    /// 取得扇区并钉住。
    ///
    /// 未命中时先用空闲条目，否则淘汰最久未用、未钉住且干净的条目；
    /// 都不可得时写回本卷最久未用的脏条目后重试，脏条目绝不直接丢弃。
    /// 除非带有[`CacheFlag::NoRead`]，都会从介质读入。
    pub fn get_sector<'a>(
        &'a self,
        vol: &'a Volume,
        sector: SectorId,
        flags: CacheFlags,
    ) -> Result<SectorRef<'a>> {
        let key = (vol.id(), sector);
        let stamp = vol.stamp();
        let class = flags & CLASS;

        let idx = loop {
            let mut pool = self.pool.lock();

            if let Some(&idx) = pool.index.get(&key) {
                let entry = &mut pool.entries[idx];
                if entry.reading {
                    // 另一个调用者正在读穿
                    drop(pool);
                    hint::spin_loop();
                    continue;
                }
                if entry.stamp == stamp {
                    entry.pins += 1;
                    entry.flags |= class;
                    let Pool { entries, lru, .. } = &mut *pool;
                    lru.move_to_front(entries, idx);
                    break idx;
                }
                log::warn!(
                    "Dropping cached sector {sector} of volume {} from a previous generation",
                    vol.id()
                );
                pool.forget(idx);
            }

            let Some(idx) = pool.take_slot() else {
                // 没有干净条目可淘汰时，先写回本卷最久未用的脏条目
                let victim = pool.lru.iter_rev(&pool.entries).find(|&idx| {
                    let e = &pool.entries[idx];
                    e.pins == 0 && !e.reading && e.key.is_some_and(|(v, _)| v == key.0)
                });
                let Some(victim) = victim else {
                    log::error!(
                        "Sector cache exhausted: all {} entries are pinned or dirty",
                        self.capacity()
                    );
                    return Err(Error::NoFreeCacheEntry);
                };
                pool.entries[victim].pins += 1;
                drop(pool);

                log::debug!("Writing back a dirty entry under cache pressure");
                let res = self.sync_pinned(vol, victim, CacheFlags::empty());
                self.pool.lock().unpin(victim);
                res?;
                continue;
            };

            let no_read = flags.contains(CacheFlag::NoRead);
            {
                let entry = &mut pool.entries[idx];
                entry.key = Some(key);
                entry.stamp = stamp;
                entry.flags = class;
                entry.pins = 1;
                entry.reading = !no_read;
            }
            pool.index.insert(key, idx);
            let Pool { entries, lru, .. } = &mut *pool;
            lru.push_front(entries, idx);

            // 条目刚取出，没有其他人持有它的缓冲区
            let mut buf = self.slots[idx].lock();
            drop(pool);

            if no_read {
                buf.fill(0);
                break idx;
            }

            let res = vol
                .device()
                .read_blocks(sector.block(self.config.sector_bytes), &mut buf);
            drop(buf);

            let mut pool = self.pool.lock();
            pool.entries[idx].reading = false;
            match res {
                Ok(()) => {
                    log::trace!("Read sector {sector} of volume {}", vol.id());
                    break idx;
                }
                Err(e) => {
                    log::error!("Failed to read sector {sector}: {e:?}");
                    pool.index.remove(&key);
                    pool.entries[idx].pins = 0;
                    pool.release(idx);
                    return Err(e.into());
                }
            }
        };

        Ok(SectorRef {
            cache: self,
            vol,
            idx,
            sector,
            released: false,
        })
    }

    /// 按扇区号写回单个条目；未缓存时什么也不做
    pub fn sync_entry(&self, vol: &Volume, sector: SectorId, flags: CacheFlags) -> Result<()> {
        let Some(idx) = self.pin_resident(vol, sector) else {
            return Ok(());
        };
        let res = self.sync_pinned(vol, idx, flags);
        self.pool.lock().unpin(idx);
        res
    }

    /// 写回卷的全部脏条目
    pub fn sync_volume(&self, vol: &Volume, flags: CacheFlags) -> Result<()> {
        self.sync_where(vol, flags, |_| true)
    }

    /// 写回属于`owner`的脏条目，以及所有共享条目
    pub fn sync_node(&self, vol: &Volume, owner: OwnerTag, flags: CacheFlags) -> Result<()> {
        self.sync_where(vol, flags, |entry| {
            entry.owner == Some(owner) || entry.flags.contains(CacheFlag::Shared)
        })
    }

    /// 丢弃一段扇区的缓存而不写回
    pub fn discard(&self, vol: &Volume, sector: SectorId, count: usize) {
        let mut pool = self.pool.lock();
        for sid in sector.span(count) {
            if let Some(&idx) = pool.index.get(&(vol.id(), sid)) {
                log::trace!("Discarding cached sector {sid}");
                pool.forget(idx);
            }
        }
    }

    /// 用调用者绕过缓存写入的内容覆盖已缓存的扇区。
    ///
    /// 带[`CacheFlag::Dirty`]时条目进入脏链，否则视为已与介质一致。
    pub fn update(
        &self,
        vol: &Volume,
        sector: SectorId,
        buf: &[u8],
        count: usize,
        flags: CacheFlags,
        owner: Option<OwnerTag>,
    ) {
        let sb = self.config.sector_bytes;
        for (i, sid) in sector.span(count).enumerate() {
            let Some(idx) = self.pin_resident(vol, sid) else {
                continue;
            };
            self.slots[idx]
                .lock()
                .copy_from_slice(&buf[i * sb..(i + 1) * sb]);

            let mut pool = self.pool.lock();
            if flags.contains(CacheFlag::Dirty) {
                pool.mark_dirty(idx, owner);
            } else {
                pool.clean(idx);
            }
            pool.unpin(idx);
        }
    }

    /// 绕过缓存把`buf`写到从`sector`开始的`count`个扇区，已缓存的扇区一并更新。
    ///
    /// 设备写入期间持有这些条目缓冲区的锁：并发的写回要么在此之前完成，
    /// 要么之后写出的已是新内容。写入失败时这些条目被丢弃，不再声称与介质一致。
    pub fn write_through(&self, vol: &Volume, sector: SectorId, buf: &[u8], count: usize) -> Result<()> {
        let sb = self.config.sector_bytes;
        let resident: Vec<(usize, usize, u64)> = sector
            .span(count)
            .enumerate()
            .filter_map(|(i, sid)| {
                let idx = self.pin_resident(vol, sid)?;
                let seq = self.pool.lock().entries[idx].dirty_seq;
                Some((i, idx, seq))
            })
            .collect();

        let res = {
            let mut held = Vec::with_capacity(resident.len());
            for &(i, idx, _) in &resident {
                let mut slot = self.slots[idx].lock();
                slot.copy_from_slice(&buf[i * sb..(i + 1) * sb]);
                held.push(slot);
            }
            vol.device().write_blocks(sector.block(sb), &buf[..count * sb])
        };

        let mut pool = self.pool.lock();
        for &(_, idx, seq) in &resident {
            if res.is_err() {
                pool.forget(idx);
            } else if pool.entries[idx].dirty_seq == seq {
                pool.clean(idx);
            }
            pool.unpin(idx);
        }
        drop(pool);

        res.map_err(|e| {
            log::error!("Failed to write {count} sectors at {sector}: {e:?}");
            e.into()
        })
    }

    /// 将已缓存扇区的内容覆盖到`buf`，使绕过缓存的读取看得到尚未写回的修改
    pub fn copy_resident(&self, vol: &Volume, sector: SectorId, buf: &mut [u8], count: usize) {
        let sb = self.config.sector_bytes;
        for (i, sid) in sector.span(count).enumerate() {
            let Some(idx) = self.pin_resident(vol, sid) else {
                continue;
            };
            buf[i * sb..(i + 1) * sb].copy_from_slice(&self.slots[idx].lock());
            self.pool.lock().unpin(idx);
        }
    }

    /// 丢弃卷的全部条目，卸载时使用
    pub fn release_volume(&self, vol: &Volume) {
        let id = vol.id();
        let mut pool = self.pool.lock();
        let victims: Vec<usize> = pool
            .index
            .range((id, SectorId::new(0))..=(id, SectorId::new(usize::MAX)))
            .map(|(_, &idx)| idx)
            .collect();
        for idx in victims {
            pool.forget(idx);
        }
        pool.dirty.remove(&id);
    }

    pub fn dirty_count(&self, vol: &Volume) -> usize {
        self.pool.lock().dirty.get(&vol.id()).map_or(0, List::len)
    }

    pub fn is_dirty(&self, vol: &Volume, sector: SectorId) -> bool {
        let pool = self.pool.lock();
        pool.index
            .get(&(vol.id(), sector))
            .is_some_and(|&idx| pool.entries[idx].flags.contains(CacheFlag::Dirty))
    }

    pub fn is_resident(&self, vol: &Volume, sector: SectorId) -> bool {
        self.pool.lock().index.contains_key(&(vol.id(), sector))
    }
}

impl SectorCache {
    /// 钉住已缓存的条目；读穿中则等待，属于旧挂载代则丢弃
    fn pin_resident(&self, vol: &Volume, sector: SectorId) -> Option<usize> {
        let key = (vol.id(), sector);
        loop {
            let mut pool = self.pool.lock();
            let idx = *pool.index.get(&key)?;
            let entry = &mut pool.entries[idx];
            if entry.reading {
                drop(pool);
                hint::spin_loop();
                continue;
            }
            if entry.stamp != vol.stamp() {
                pool.forget(idx);
                return None;
            }
            entry.pins += 1;
            return Some(idx);
        }
    }

    fn put(
        &self,
        vol: &Volume,
        idx: usize,
        flags: CacheFlags,
        owner: Option<OwnerTag>,
    ) -> Result<()> {
        {
            let mut pool = self.pool.lock();
            if flags.contains(CacheFlag::Dirty) {
                pool.mark_dirty(idx, owner);
            }
            if !flags.contains(CacheFlag::Sync) {
                pool.unpin(idx);
                return Ok(());
            }
        }

        let res = self.sync_pinned(vol, idx, flags);
        self.pool.lock().unpin(idx);
        res
    }

    /// 写回一个已被调用者钉住的条目
    fn sync_pinned(&self, vol: &Volume, idx: usize, flags: CacheFlags) -> Result<()> {
        let (sector, class, seq, dirty) = {
            let mut pool = self.pool.lock();
            let entry = &pool.entries[idx];
            let Some((_, sector)) = entry.key else {
                return Ok(());
            };
            if entry.orphan {
                return Ok(());
            }
            if entry.stamp != vol.stamp() {
                log::warn!(
                    "Discarding sector {sector} of volume {} unwritten: volume was remounted",
                    vol.id()
                );
                pool.forget(idx);
                return Ok(());
            }
            (
                sector,
                entry.flags & CLASS,
                entry.dirty_seq,
                entry.flags.contains(CacheFlag::Dirty),
            )
        };

        if dirty {
            let buf = self.slots[idx].lock();
            self.write_out(vol, sector, class, &buf)?;
        }

        let mut pool = self.pool.lock();
        // 写回期间又被弄脏的条目保持为脏
        if dirty && pool.entries[idx].dirty_seq == seq {
            pool.clean(idx);
        }
        if flags.contains(CacheFlag::Discard) {
            pool.forget(idx);
        }
        Ok(())
    }

    fn write_out(&self, vol: &Volume, sector: SectorId, class: CacheFlags, buf: &[u8]) -> Result<()> {
        let sb = self.config.sector_bytes;
        vol.device()
            .write_blocks(sector.block(sb), buf)
            .inspect_err(|e| log::error!("Failed to write sector {sector}: {e:?}"))?;
        log::trace!("Wrote sector {sector} of volume {}", vol.id());

        if class.contains(CacheFlag::Fat) {
            for mirror in vol.geometry().fat_mirrors(sector) {
                vol.device()
                    .write_blocks(mirror.block(sb), buf)
                    .inspect_err(|e| log::error!("Failed to mirror FAT sector {mirror}: {e:?}"))?;
            }
        }
        Ok(())
    }

    fn sync_where(
        &self,
        vol: &Volume,
        flags: CacheFlags,
        pred: impl Fn(&Entry) -> bool,
    ) -> Result<()> {
        let mut first_err = None;
        let mut failed = BTreeSet::new();

        loop {
            let batch: Vec<usize> = {
                let mut pool = self.pool.lock();
                let Pool { entries, dirty, .. } = &mut *pool;
                let Some(list) = dirty.get(&vol.id()) else {
                    break;
                };
                let batch: Vec<usize> = list
                    .iter(entries)
                    .filter(|idx| !failed.contains(idx) && pred(&entries[*idx]))
                    .take(self.config.sync_batch)
                    .collect();
                for &idx in &batch {
                    entries[idx].pins += 1;
                }
                batch
            };
            if batch.is_empty() {
                break;
            }

            for (n, &idx) in batch.iter().enumerate() {
                let res = self.sync_pinned(vol, idx, flags);
                self.pool.lock().unpin(idx);
                if let Err(e) = res {
                    if !flags.contains(CacheFlag::Force) {
                        let mut pool = self.pool.lock();
                        for &rest in &batch[n + 1..] {
                            pool.unpin(rest);
                        }
                        return Err(e);
                    }
                    failed.insert(idx);
                    first_err.get_or_insert(e);
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

/// 被钉住的缓存扇区。
///
/// 通过[`SectorRef::put`]放回；直接丢弃等同于不带标志的放回。
pub struct SectorRef<'a> {
    cache: &'a SectorCache,
    vol: &'a Volume,
    idx: usize,
    sector: SectorId,
    released: bool,
}

impl SectorRef<'_> {
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    #[inline]
    pub fn map<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.cache.slots[self.idx].lock())
    }

    #[inline]
    pub fn map_mut<V>(&mut self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        f(&mut self.cache.slots[self.idx].lock())
    }

    /// 放回扇区。
    ///
    /// - [`CacheFlag::Dirty`]: 移到卷脏链头部并记录属主
    /// - [`CacheFlag::Sync`]: 立即写回
    pub fn put(mut self, flags: CacheFlags, owner: Option<OwnerTag>) -> Result<()> {
        self.released = true;
        self.cache.put(self.vol, self.idx, flags, owner)
    }
}

impl Drop for SectorRef<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.cache.pool.lock().unpin(self.idx);
        }
    }
}
