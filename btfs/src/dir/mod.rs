//! # 目录
//!
//! 目录是存放在簇链上的目录项数组，根目录也不例外。
//! 目录项的位置以[`DePos`]表示：所在簇，以及相对目录开头的字节偏移。

mod entry;
mod name;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use vfs::{DirEntry, DirEntryType, DosTime};

pub use self::entry::{
    AttrFlag, DirEntryStatus, ENTRY_SIZE, LongDirEntry, RawEntry, ShortDirEntry,
    long_entries_for, name_to_entries,
};
pub use self::name::{canonical_name, names_equal, short_name_basis};
use self::entry::{FREE_MARK, is_long, longs_to_name, status};
use crate::cache::{CacheFlag, CacheFlags, OwnerTag};
use crate::volume::Volume;
use crate::{ClusterId, ClusterVector, Error, Result, SectorId};

/// 目录最多容纳的目录项数
pub const MAX_DIR_ENTRIES: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DePos {
    /// 目录项所在的簇
    pub cluster: ClusterId,
    /// 相对目录开头的字节偏移
    pub offset: u32,
}

impl DePos {
    pub const fn index(&self) -> usize {
        self.offset as usize / ENTRY_SIZE
    }

    /// 目录项所在扇区，以及扇区内的字节偏移
    pub fn location(&self, vol: &Volume) -> (SectorId, usize) {
        let geo = vol.geometry();
        let in_cluster = self.offset as usize % geo.cluster_bytes();
        (
            geo.cluster_sector(self.cluster) + in_cluster / geo.sector_bytes,
            in_cluster % geo.sector_bytes,
        )
    }

    /// 由位置导出的编号
    pub fn ino(&self) -> u64 {
        (u64::from(self.cluster.raw()) << 32) | u64::from(self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanCriteria<'a> {
    pub name: Option<&'a str>,
    /// 需要的连续空闲目录项数，0表示不找
    pub free_slots: usize,
}

/// 找到的整组目录项
#[derive(Debug, Clone)]
pub struct Found {
    /// 第一个长目录项（没有时即短目录项）的位置
    pub first: DePos,
    pub short: DePos,
    /// 目录项总数
    pub count: usize,
    pub name: String,
    pub entry: ShortDirEntry,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub found: Option<Found>,
    /// 第一段足够长的空闲目录项
    pub vacant: Option<DePos>,
}

/// 目录的簇链与位置换算
struct DirChain {
    clusters: Vec<ClusterId>,
    cluster_entries: usize,
}

impl DirChain {
    fn load(vol: &Volume, dir: ClusterId) -> Result<Self> {
        Ok(Self {
            clusters: vol.allocator().chain(vol, dir)?,
            cluster_entries: vol.geometry().cluster_entries(),
        })
    }

    fn len(&self) -> usize {
        self.clusters.len() * self.cluster_entries
    }

    fn pos(&self, index: usize) -> DePos {
        DePos {
            cluster: self.clusters[index / self.cluster_entries],
            offset: (index * ENTRY_SIZE) as u32,
        }
    }
}

/// 按顺序访问目录的每个目录项
fn walk(
    vol: &Volume,
    chain: &DirChain,
    mut visit: impl FnMut(usize, &RawEntry) -> ControlFlow<()>,
) -> Result<()> {
    let geo = vol.geometry();
    let per_sector = geo.sector_bytes / ENTRY_SIZE;
    let mut local = vec![0; geo.sector_bytes];

    for (ci, &cid) in chain.clusters.iter().enumerate() {
        for (si, sid) in geo.cluster_sector(cid).span(geo.cluster_sectors).enumerate() {
            vol.cache()
                .get_sector(vol, sid, CacheFlag::De.into())?
                .map(|buf| local.copy_from_slice(buf));

            for (k, chunk) in local.chunks_exact(ENTRY_SIZE).enumerate() {
                let mut raw = [0; ENTRY_SIZE];
                raw.copy_from_slice(chunk);
                let index = ci * chain.cluster_entries + si * per_sector + k;
                if visit(index, &raw).is_break() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// 长目录项累积器，短目录项到来时给出完整名称
#[derive(Default)]
struct NameAssembler {
    longs: Vec<(usize, LongDirEntry)>,
}

impl NameAssembler {
    fn reset(&mut self) {
        self.longs.clear();
    }

    fn push_long(&mut self, index: usize, raw: &RawEntry) {
        let long = LongDirEntry::decode(raw);
        if long.is_last() {
            self.longs.clear();
            self.longs.push((index, long));
        } else if !self.longs.is_empty() {
            self.longs.push((index, long));
        }
    }

    /// (名称, 第一项的序号, 目录项总数)
    fn finish(&mut self, index: usize, short: &ShortDirEntry) -> (String, usize, usize) {
        let longs: Vec<LongDirEntry> = self.longs.iter().map(|(_, long)| *long).collect();
        let res = match (longs_to_name(&longs, short), self.longs.first()) {
            (Some(name), Some(&(first, _))) => (name, first, longs.len() + 1),
            _ => (short.short_name(), index, 1),
        };
        self.longs.clear();
        res
    }
}

/// 目录中第`index`个目录项的位置
pub fn position(vol: &Volume, dir: ClusterId, index: usize) -> Result<DePos> {
    let chain = DirChain::load(vol, dir)?;
    if index >= chain.len() {
        log::error!("Directory entry {index} lies beyond directory {dir}");
        return Err(Error::Corrupted);
    }
    Ok(chain.pos(index))
}

/// 在目录中查找名称与空闲目录项
pub fn scan(vol: &Volume, dir: ClusterId, criteria: &ScanCriteria) -> Result<ScanResult> {
    let chain = DirChain::load(vol, dir)?;
    let need = criteria.free_slots;
    let mut result = ScanResult::default();
    let mut names = NameAssembler::default();
    // (起点, 长度)
    let mut run = (0, 0);
    let mut tail_at = None;

    walk(vol, &chain, |index, raw| {
        match status(raw) {
            DirEntryStatus::TailFree => {
                tail_at = Some(index);
                return ControlFlow::Break(());
            }
            DirEntryStatus::Free => {
                names.reset();
                if run.1 == 0 {
                    run.0 = index;
                }
                run.1 += 1;
            }
            DirEntryStatus::Occupied if is_long(raw) => {
                run.1 = 0;
                names.push_long(index, raw);
            }
            DirEntryStatus::Occupied => {
                run.1 = 0;
                let short = ShortDirEntry::decode(raw);
                let (name, first, count) = names.finish(index, &short);
                let wanted = criteria.name.filter(|_| result.found.is_none());
                if let Some(target) = wanted {
                    if !short.is_volume_label() && !short.is_relative() && names_equal(&name, target)
                    {
                        result.found = Some(Found {
                            first: chain.pos(first),
                            short: chain.pos(index),
                            count,
                            name,
                            entry: short,
                        });
                    }
                }
            }
        }

        if need > 0 && result.vacant.is_none() && run.1 >= need {
            result.vacant = Some(chain.pos(run.0));
        }
        let name_done = criteria.name.is_none() || result.found.is_some();
        let slots_done = need == 0 || result.vacant.is_some();
        if name_done && slots_done {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;

    // 末尾空闲区之后全部可用
    if let Some(tail) = tail_at {
        if need > 0 && result.vacant.is_none() {
            let start = if run.1 > 0 { run.0 } else { tail };
            if chain.len() - start >= need {
                result.vacant = Some(chain.pos(start));
            }
        }
    }

    Ok(result)
}

/// 列出目录内容，跳过前`at`项，最多返回`count`项
pub fn list(vol: &Volume, dir: ClusterId, at: usize, count: usize) -> Result<Vec<DirEntry>> {
    let chain = DirChain::load(vol, dir)?;
    let mut names = NameAssembler::default();
    let mut seen = 0;
    let mut out = Vec::new();

    walk(vol, &chain, |index, raw| {
        match status(raw) {
            DirEntryStatus::TailFree => return ControlFlow::Break(()),
            DirEntryStatus::Free => names.reset(),
            DirEntryStatus::Occupied if is_long(raw) => names.push_long(index, raw),
            DirEntryStatus::Occupied => {
                let short = ShortDirEntry::decode(raw);
                let (name, first, _) = names.finish(index, &short);
                if short.is_volume_label() || short.is_relative() {
                    return ControlFlow::Continue(());
                }
                seen += 1;
                if seen > at {
                    out.push(DirEntry {
                        inode: chain.pos(first).ino(),
                        ty: entry_type(&short),
                        name,
                    });
                }
            }
        }
        if out.len() >= count {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(out)
}

pub fn entry_type(short: &ShortDirEntry) -> DirEntryType {
    if short.is_dir() {
        DirEntryType::Directory
    } else if short.is_symlink() {
        DirEntryType::SymLink
    } else {
        DirEntryType::Regular
    }
}

/// 除`.`与`..`外没有目录项
pub fn is_empty_dir(vol: &Volume, dir: ClusterId) -> Result<bool> {
    let chain = DirChain::load(vol, dir)?;
    let mut empty = true;
    walk(vol, &chain, |_, raw| match status(raw) {
        DirEntryStatus::TailFree => ControlFlow::Break(()),
        DirEntryStatus::Free => ControlFlow::Continue(()),
        DirEntryStatus::Occupied => {
            let short = ShortDirEntry::decode(raw);
            if is_long(raw) || short.is_relative() || short.is_volume_label() {
                ControlFlow::Continue(())
            } else {
                empty = false;
                ControlFlow::Break(())
            }
        }
    })?;
    Ok(empty)
}

/// 读取`..`目录项得到父目录
pub fn parent_of(vol: &Volume, dir: ClusterId) -> Result<ClusterId> {
    let root = vol.geometry().root_cluster;
    if dir == root {
        return Ok(root);
    }
    let dotdot = read_entry(
        vol,
        DePos {
            cluster: dir,
            offset: ENTRY_SIZE as u32,
        },
    )?;
    if !dotdot.is_relative() {
        log::error!("Directory {dir} has no `..` entry");
        return Err(Error::Corrupted);
    }
    match dotdot.cluster_id() {
        ClusterId::FREE => Ok(root),
        id => Ok(id),
    }
}

pub fn read_entry(vol: &Volume, pos: DePos) -> Result<ShortDirEntry> {
    let (sid, at) = pos.location(vol);
    let sector = vol.cache().get_sector(vol, sid, CacheFlag::De.into())?;
    Ok(sector.map(|buf| {
        let mut raw = [0; ENTRY_SIZE];
        raw.copy_from_slice(&buf[at..at + ENTRY_SIZE]);
        ShortDirEntry::decode(&raw)
    }))
}

/// 写入从`at`开始的一组目录项。
///
/// 目标簇先合并为连续段，整扇区覆盖时不读介质。
pub fn write_entries(
    vol: &Volume,
    dir: ClusterId,
    at: DePos,
    entries: &[RawEntry],
    flags: CacheFlags,
    owner: Option<OwnerTag>,
) -> Result<()> {
    modify_slots(vol, dir, at, entries.len(), flags, owner, true, |i, slot| {
        slot.copy_from_slice(&entries[i]);
    })
}

/// 将从`at`开始的`count`个目录项标记为已删除
pub fn delete_entries(
    vol: &Volume,
    dir: ClusterId,
    at: DePos,
    count: usize,
    flags: CacheFlags,
    owner: Option<OwnerTag>,
) -> Result<()> {
    modify_slots(vol, dir, at, count, flags, owner, false, |_, slot| {
        slot[0] = FREE_MARK;
    })
}

#[allow(clippy::too_many_arguments)]
fn modify_slots(
    vol: &Volume,
    dir: ClusterId,
    at: DePos,
    count: usize,
    flags: CacheFlags,
    owner: Option<OwnerTag>,
    overwrite: bool,
    mut f: impl FnMut(usize, &mut [u8]),
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let geo = vol.geometry();
    let chain = DirChain::load(vol, dir)?;
    let first = at.index();
    let last = first + count - 1;
    if last >= chain.len() {
        log::error!("Directory entries {first}..={last} lie beyond directory {dir}");
        return Err(Error::Corrupted);
    }

    let ce = chain.cluster_entries;
    let targets =
        ClusterVector::coalesce(chain.clusters[first / ce..=last / ce].iter().copied());
    let sectors: Vec<SectorId> = targets
        .runs()
        .iter()
        .flat_map(|run| {
            geo.cluster_sector(run.start)
                .span(run.count as usize * geo.cluster_sectors)
        })
        .collect();

    let per_sector = geo.sector_bytes / ENTRY_SIZE;
    let base = (first / ce) * ce;
    let mut done = 0;
    while done < count {
        let linear = first + done - base;
        let in_sector = linear % per_sector;
        let n = (per_sector - in_sector).min(count - done);

        let mut get = CacheFlags::from(CacheFlag::De);
        if overwrite && n == per_sector {
            get |= CacheFlag::NoRead;
        }
        let mut sector = vol.cache().get_sector(vol, sectors[linear / per_sector], get)?;
        sector.map_mut(|buf| {
            for j in 0..n {
                let byte = (in_sector + j) * ENTRY_SIZE;
                f(done + j, &mut buf[byte..byte + ENTRY_SIZE]);
            }
        });
        sector.put(flags | CacheFlag::Dirty, owner)?;
        done += n;
    }
    Ok(())
}

/// 绕过缓存向介质写零，已缓存的扇区同时清零
pub fn zero_cluster(vol: &Volume, cluster: ClusterId) -> Result<()> {
    let geo = vol.geometry();
    let zero = vec![0; geo.cluster_bytes()];
    vol.cache()
        .write_through(vol, geo.cluster_sector(cluster), &zero, geo.cluster_sectors)
}

/// 初始化新目录的簇：写入`.`与`..`，其余清零
pub fn init_dir_cluster(
    vol: &Volume,
    cluster: ClusterId,
    entry: &ShortDirEntry,
    parent: ClusterId,
    now: DosTime,
    owner: Option<OwnerTag>,
) -> Result<()> {
    zero_cluster(vol, cluster)?;

    let mut dot = entry.as_cwd();
    dot.set_cluster_id(cluster);
    let dotdot = ShortDirEntry::new_parent(parent, vol.geometry().root_cluster, now);

    let sid = vol.geometry().cluster_sector(cluster);
    let mut sector = vol
        .cache()
        .get_sector(vol, sid, CacheFlag::De | CacheFlag::NoRead)?;
    sector.map_mut(|buf| {
        buf[..ENTRY_SIZE].copy_from_slice(&dot.encode());
        buf[ENTRY_SIZE..2 * ENTRY_SIZE].copy_from_slice(&dotdot.encode());
    });
    sector.put(CacheFlag::Dirty.into(), owner)
}

/// 为目录追加一个清零的簇，返回新簇第一个目录项的位置
pub fn expand_dir(vol: &Volume, dir: ClusterId, owner: Option<OwnerTag>) -> Result<DePos> {
    let chain = DirChain::load(vol, dir)?;
    if chain.len() + chain.cluster_entries > MAX_DIR_ENTRIES {
        return Err(Error::NoSpace);
    }
    let Some(&last) = chain.clusters.last() else {
        return Err(Error::Corrupted);
    };

    let fat = vol.allocator();
    let vc = fat.get_free_clusters(vol, Some(last), 1)?;
    let Some(new) = vc.first() else {
        return Err(Error::NoSpace);
    };
    let linked = zero_cluster(vol, new).and_then(|()| fat.make_cluster_chain(vol, Some(last), &vc, owner));
    if let Err(e) = linked {
        log::error!("Failed to expand directory {dir}: {e}");
        if let Err(e) = fat.release_clusters(vol, &vc, Some(last), owner) {
            log::error!("Failed to release cluster {new}: {e}");
        }
        return Err(e);
    }

    log::debug!("Expanded directory {dir} with cluster {new}");
    Ok(DePos {
        cluster: new,
        offset: (chain.len() * ENTRY_SIZE) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::tests::test_volume;

    fn put_file(vol: &Volume, dir: ClusterId, at: usize, name: &str) -> DePos {
        let short = ShortDirEntry::new(name, AttrFlag::Archive.into(), DosTime::EPOCH);
        let entries = name_to_entries(name, &short);
        let pos = DePos {
            cluster: dir,
            offset: (at * ENTRY_SIZE) as u32,
        };
        write_entries(vol, dir, pos, &entries, CacheFlags::empty(), None).unwrap();
        pos
    }

    #[test]
    fn scan_finds_names_and_slots() {
        let (_disk, vol) = test_volume(8);
        let root = vol.geometry().root_cluster;
        put_file(&vol, root, 0, "first.txt");
        put_file(&vol, root, 2, "Second File.dat");

        let res = scan(
            &vol,
            root,
            &ScanCriteria {
                name: Some("SECOND FILE.DAT"),
                free_slots: 3,
            },
        )
        .unwrap();
        let found = res.found.unwrap();
        assert_eq!("Second File.dat", found.name);
        assert_eq!(2, found.first.index());
        assert_eq!(3, found.short.index());
        assert_eq!(2, found.count);
        assert_eq!(Some(4), res.vacant.map(|pos| pos.index()));

        delete_entries(&vol, root, DePos { cluster: root, offset: 0 }, 2, CacheFlags::empty(), None)
            .unwrap();
        let res = scan(
            &vol,
            root,
            &ScanCriteria {
                name: Some("first.txt"),
                free_slots: 2,
            },
        )
        .unwrap();
        assert!(res.found.is_none());
        assert_eq!(Some(0), res.vacant.map(|pos| pos.index()));

        let names: Vec<_> = list(&vol, root, 0, 16).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(vec![String::from("Second File.dat")], names);
    }

    #[test]
    fn expand_links_zeroed_cluster() {
        let (_disk, vol) = test_volume(8);
        let root = vol.geometry().root_cluster;
        let entries = vol.geometry().cluster_entries();
        // 填满根目录的唯一簇
        for i in 0..entries / 2 {
            put_file(&vol, root, i * 2, &alloc::format!("f{i}"));
        }
        let res = scan(&vol, root, &ScanCriteria { name: None, free_slots: 1 }).unwrap();
        assert!(res.vacant.is_none());

        let pos = expand_dir(&vol, root, None).unwrap();
        assert_eq!(entries, pos.index());
        assert_eq!(2, vol.allocator().chain(&vol, root).unwrap().len());
        let res = scan(&vol, root, &ScanCriteria { name: None, free_slots: 2 }).unwrap();
        assert_eq!(Some(pos), res.vacant);
        assert!(!is_empty_dir(&vol, root).unwrap());
    }
}
