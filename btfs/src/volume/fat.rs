//! FAT区与簇分配器
//!
//! FAT条目存放着下一个簇的编号，其中`0`表示簇未分配，`1`保留，
//! 所以第一个可用的簇编号为2。

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::cache::{CacheFlag, CacheFlags, OwnerTag};
use crate::volume::Volume;
use crate::{ClusterError, ClusterId, ClusterVector, Error, Result, bitmap};

/// 簇分配协作者。
///
/// 调用者可能持有节点写锁，实现不得反过来等待节点锁。
pub trait ClusterAllocator: Send + Sync {
    /// 预留`count`个空闲簇，尽量从`hint`之后连续取得。
    /// 不足时返回[`Error::NoSpace`]且不预留任何簇。
    fn get_free_clusters(
        &self,
        vol: &Volume,
        hint: Option<ClusterId>,
        count: usize,
    ) -> Result<ClusterVector>;

    /// 把`vc`按顺序链接起来并以EOF结尾；`prev_last`给出时接在它后面
    fn make_cluster_chain(
        &self,
        vol: &Volume,
        prev_last: Option<ClusterId>,
        vc: &ClusterVector,
        owner: Option<OwnerTag>,
    ) -> Result<()>;

    /// 释放以`first`开始的整条链，返回释放的簇数
    fn deallocate_clusters(
        &self,
        vol: &Volume,
        first: ClusterId,
        owner: Option<OwnerTag>,
    ) -> Result<usize>;

    /// 撤销一次分配：归还`vc`，并让`prev_last`重新成为链尾
    fn release_clusters(
        &self,
        vol: &Volume,
        vc: &ClusterVector,
        prev_last: Option<ClusterId>,
        owner: Option<OwnerTag>,
    ) -> Result<()>;

    /// 以`first`开始的簇链
    fn chain(&self, vol: &Volume, first: ClusterId) -> Result<Vec<ClusterId>>;

    /// 保留链上前`keep`个簇，释放其余，返回释放的簇数
    fn truncate_chain(
        &self,
        vol: &Volume,
        first: ClusterId,
        keep: usize,
        owner: Option<OwnerTag>,
    ) -> Result<usize>;

    fn free_count(&self, vol: &Volume) -> Result<usize>;
}

/// 空闲簇位图，第`n`位对应簇`n`
#[derive(Debug)]
struct FreeMap {
    stamp: u32,
    bits: Vec<u8>,
    /// 位图的有效位数
    limit: usize,
    free: usize,
    /// 下一次搜索的起点
    cursor: usize,
}

/// 通过扇区缓存读写FAT的默认分配器
#[derive(Debug, Default)]
pub struct FatAllocator {
    map: Mutex<Option<FreeMap>>,
}

impl FatAllocator {
    pub const fn new() -> Self {
        Self {
            map: Mutex::new(None),
        }
    }

    /// 读取簇的FAT条目
    pub fn next(&self, vol: &Volume, id: ClusterId) -> Result<ClusterId> {
        let id = Self::validate_id(vol, id)?;
        let (sid, at) = vol.geometry().fat_position(id);
        let sector = vol.cache().get_sector(vol, sid, CacheFlag::Fat.into())?;
        Ok(sector.map(|buf| ClusterId::new(fat_entry(buf, at))))
    }

    fn set_next(
        &self,
        vol: &Volume,
        id: ClusterId,
        next: ClusterId,
        owner: Option<OwnerTag>,
    ) -> Result<()> {
        let id = Self::validate_id(vol, id)?;
        let (sid, at) = vol.geometry().fat_position(id);
        let mut sector = vol.cache().get_sector(vol, sid, CacheFlag::Fat.into())?;
        sector.map_mut(|buf| {
            // 高4位保留
            let raw = (fat_entry(buf, at) & !0x0FFF_FFFF) | next.raw();
            buf[at..at + 4].copy_from_slice(&raw.to_le_bytes());
        });
        sector.put(CacheFlag::Dirty.into(), owner)
    }

    fn validate_id(vol: &Volume, id: ClusterId) -> Result<ClusterId> {
        let id = id.validate()?;
        if vol.geometry().contains(id) {
            Ok(id)
        } else {
            Err(ClusterError::Reserved.into())
        }
    }

    /// 在位图上执行`f`，位图缺失或属于旧挂载代时先扫描FAT重建
    fn with_map<V>(&self, vol: &Volume, f: impl FnOnce(&mut FreeMap) -> V) -> Result<V> {
        {
            let mut map = self.map.lock();
            if let Some(map) = map.as_mut().filter(|map| map.stamp == vol.stamp()) {
                return Ok(f(map));
            }
        }

        let built = self.scan(vol)?;
        let mut guard = self.map.lock();
        let map = match guard.take() {
            // 扫描期间别人已经重建
            Some(map) if map.stamp == vol.stamp() => guard.insert(map),
            _ => guard.insert(built),
        };
        Ok(f(map))
    }

    fn scan(&self, vol: &Volume) -> Result<FreeMap> {
        let geo = vol.geometry();
        let limit = usize::from(geo.max_cluster()) + 1;
        let mut bits = vec![0; limit.div_ceil(8)];
        bitmap::set(&mut bits, 0);
        bitmap::set(&mut bits, 1);

        let per_sector = geo.sector_bytes / 4;
        for (i, sid) in geo.fat_start.span(limit.div_ceil(per_sector)).enumerate() {
            let sector = vol.cache().get_sector(vol, sid, CacheFlag::Fat.into())?;
            sector.map(|buf| {
                for slot in 0..per_sector {
                    let cluster = i * per_sector + slot;
                    if cluster < 2 || cluster >= limit {
                        continue;
                    }
                    if ClusterId::new(fat_entry(buf, slot * 4)) != ClusterId::FREE {
                        bitmap::set(&mut bits, cluster);
                    }
                }
            });
        }

        let free = limit - bitmap::count_ones(&bits, limit);
        log::debug!("Volume {} has {free} free clusters", vol.id());
        Ok(FreeMap {
            stamp: vol.stamp(),
            bits,
            limit,
            free,
            cursor: 2,
        })
    }

    fn free_in_map(&self, vol: &Volume, clusters: impl IntoIterator<Item = ClusterId>) -> Result<()> {
        self.with_map(vol, |map| {
            for cid in clusters {
                let bit = usize::from(cid);
                if bitmap::test(&map.bits, bit) {
                    bitmap::clear(&mut map.bits, bit);
                    map.free += 1;
                }
            }
        })
    }

    fn free_chain(
        &self,
        vol: &Volume,
        clusters: &[ClusterId],
        owner: Option<OwnerTag>,
    ) -> Result<()> {
        let geo = vol.geometry();
        for &cid in clusters {
            self.set_next(vol, cid, ClusterId::FREE, owner)?;
            // 已释放簇的缓存内容不再有意义
            vol.cache()
                .discard(vol, geo.cluster_sector(cid), geo.cluster_sectors);
        }
        self.free_in_map(vol, clusters.iter().copied())
    }
}

impl ClusterAllocator for FatAllocator {
    fn get_free_clusters(
        &self,
        vol: &Volume,
        hint: Option<ClusterId>,
        count: usize,
    ) -> Result<ClusterVector> {
        self.with_map(vol, |map| {
            if count > map.free {
                return Err(Error::NoSpace);
            }
            let mut from = hint.map_or(map.cursor, |h| usize::from(h) + 1);
            let mut vc = ClusterVector::new();
            for _ in 0..count {
                let bit = bitmap::find_zero_wrapping(&map.bits, from, map.limit)
                    .ok_or(Error::NoSpace)?;
                bitmap::set(&mut map.bits, bit);
                map.free -= 1;
                vc.push(ClusterId::new(bit as u32));
                from = bit + 1;
            }
            map.cursor = from;
            Ok(vc)
        })?
    }

    fn make_cluster_chain(
        &self,
        vol: &Volume,
        prev_last: Option<ClusterId>,
        vc: &ClusterVector,
        owner: Option<OwnerTag>,
    ) -> Result<()> {
        let clusters: Vec<ClusterId> = vc.clusters().collect();
        for pair in clusters.windows(2) {
            self.set_next(vol, pair[0], pair[1], owner)?;
        }
        if let Some(&last) = clusters.last() {
            self.set_next(vol, last, ClusterId::EOF, owner)?;
        }
        if let (Some(prev), Some(first)) = (prev_last, vc.first()) {
            self.set_next(vol, prev, first, owner)?;
        }
        Ok(())
    }

    fn deallocate_clusters(
        &self,
        vol: &Volume,
        first: ClusterId,
        owner: Option<OwnerTag>,
    ) -> Result<usize> {
        if first == ClusterId::FREE {
            return Ok(0);
        }
        let chain = self.chain(vol, first)?;
        self.free_chain(vol, &chain, owner)?;
        log::debug!("Freed {} clusters starting at {first}", chain.len());
        Ok(chain.len())
    }

    fn release_clusters(
        &self,
        vol: &Volume,
        vc: &ClusterVector,
        prev_last: Option<ClusterId>,
        owner: Option<OwnerTag>,
    ) -> Result<()> {
        if let Some(prev) = prev_last {
            self.set_next(vol, prev, ClusterId::EOF, owner)?;
        }
        let clusters: Vec<ClusterId> = vc.clusters().collect();
        self.free_chain(vol, &clusters, owner)
    }

    fn chain(&self, vol: &Volume, first: ClusterId) -> Result<Vec<ClusterId>> {
        let mut chain = Vec::new();
        let mut cur = Self::validate_id(vol, first)?;
        loop {
            chain.push(cur);
            if chain.len() > vol.geometry().cluster_count {
                log::error!("Cluster chain starting at {first} loops");
                return Err(Error::Corrupted);
            }
            let next = self.next(vol, cur)?;
            if next.is_eof() {
                return Ok(chain);
            }
            cur = Self::validate_id(vol, next)?;
        }
    }

    fn truncate_chain(
        &self,
        vol: &Volume,
        first: ClusterId,
        keep: usize,
        owner: Option<OwnerTag>,
    ) -> Result<usize> {
        if keep == 0 {
            return self.deallocate_clusters(vol, first, owner);
        }
        let chain = self.chain(vol, first)?;
        if keep >= chain.len() {
            return Ok(0);
        }
        self.set_next(vol, chain[keep - 1], ClusterId::EOF, owner)?;
        self.free_chain(vol, &chain[keep..], owner)?;
        Ok(chain.len() - keep)
    }

    fn free_count(&self, vol: &Volume) -> Result<usize> {
        self.with_map(vol, |map| map.free)
    }
}

fn fat_entry(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::tests::test_volume;

    #[test]
    fn allocate_link_and_free() {
        let (_disk, vol) = test_volume(8);
        let fat = vol.allocator();
        let before = fat.free_count(&vol).unwrap();

        let vc = fat.get_free_clusters(&vol, None, 3).unwrap();
        assert_eq!(1, vc.runs().len());
        fat.make_cluster_chain(&vol, None, &vc, None).unwrap();
        let first = vc.first().unwrap();
        assert_eq!(vc.clusters().collect::<Vec<_>>(), fat.chain(&vol, first).unwrap());
        assert_eq!(before - 3, fat.free_count(&vol).unwrap());

        assert_eq!(2, fat.truncate_chain(&vol, first, 1, None).unwrap());
        assert_eq!(vec![first], fat.chain(&vol, first).unwrap());
        assert_eq!(1, fat.deallocate_clusters(&vol, first, None).unwrap());
        assert_eq!(before, fat.free_count(&vol).unwrap());
    }

    #[test]
    fn fat_writes_reach_every_copy() {
        let (disk, vol) = test_volume(8);
        let fat = vol.allocator();
        let vc = fat.get_free_clusters(&vol, None, 1).unwrap();
        fat.make_cluster_chain(&vol, None, &vc, None).unwrap();
        vol.sync(CacheFlags::empty()).unwrap();

        let geo = vol.geometry();
        let (sid, _) = geo.fat_position(vc.first().unwrap());
        assert_eq!(disk.snapshot(sid.raw()), disk.snapshot((sid + geo.fat_sectors).raw()));
    }

    #[test]
    fn broken_chain_is_corruption() {
        let (_disk, vol) = test_volume(8);
        let fat = FatAllocator::new();
        // 指向空闲簇的链
        fat.set_next(&vol, ClusterId::new(5), ClusterId::new(6), None)
            .unwrap();
        assert_eq!(Err(Error::Corrupted), fat.chain(&vol, ClusterId::new(5)));
        assert_eq!(Err(Error::NoSpace), fat.get_free_clusters(&vol, None, usize::MAX));
    }
}
