//! 文件内容的读写与截断。
//!
//! 一次传输按簇边界拆开：不足一簇的头部与尾部经过扇区缓存，
//! 中间的整簇合并成连续段后直接访问介质，再与缓存中的副本对齐。

use alloc::vec;
use alloc::vec::Vec;

use super::{Node, NodeFlag, NodeInner, NodeKind, SizeSyncState, Txn, UpdateFlag, UpdateFlags, live, live_mut};
use crate::cache::{CacheFlag, CacheFlags, OwnerTag};
use crate::hooks::LogOp;
use crate::volume::Volume;
use crate::{ClusterId, ClusterVector, Error, Result};

/// FAT文件尺寸的上限
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

enum Rw<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Rw<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
        }
    }
}

/// 为写入新分配并已链接的簇，出错时归还
struct Grown {
    vc: ClusterVector,
    prev: Option<ClusterId>,
}

impl Grown {
    fn undo(&self, vol: &Volume, owner: OwnerTag) {
        if let Err(e) = vol
            .allocator()
            .release_clusters(vol, &self.vc, self.prev, Some(owner))
        {
            log::error!("Failed to release {} clusters: {e}", self.vc.total());
        }
    }
}

/// 准备好的一次传输
struct Transfer {
    chain: Vec<ClusterId>,
    offset: usize,
    len: usize,
    grown: Option<Grown>,
}

impl NodeInner {
    fn check_content(&self, vol: &Volume, write: bool) -> Result<()> {
        self.check(vol)?;
        if self.kind == NodeKind::Directory {
            return Err(Error::IsADirectory);
        }
        if self.flags.contains(NodeFlag::Unlink) && !self.flags.contains(NodeFlag::OpenUnlink) {
            return Err(Error::NotFound);
        }
        if write {
            self.check_writable(vol)?;
            if self.size_state == SizeSyncState::DirtyAwaitingRecovery {
                return Err(Error::ReadOnly);
            }
        }
        Ok(())
    }

    fn chain(&self, vol: &Volume) -> Result<Vec<ClusterId>> {
        match self.cluster {
            ClusterId::FREE => Ok(Vec::new()),
            first => vol.allocator().chain(vol, first),
        }
    }

    /// 确定传输范围；写入时按需扩展簇链。
    ///
    /// 空闲簇不足时只写能写下的部分，一个字节都写不下时返回[`Error::NoSpace`]。
    fn read_write_init(&self, vol: &Volume, offset: u64, len: usize, write: bool) -> Result<Transfer> {
        self.check_content(vol, write)?;

        let limit = if write { MAX_FILE_SIZE } else { u64::from(self.size) };
        if offset >= limit {
            return if write { Err(Error::NoSpace) } else { Ok(Transfer::empty()) };
        }
        let offset = offset as usize;
        let mut end = (offset as u64 + len as u64).min(limit) as usize;

        let mut chain = self.chain(vol)?;
        let mut grown = None;
        let cb = vol.geometry().cluster_bytes();
        if !write {
            // 尺寸字段可能超出簇链
            end = end.min(chain.len() * cb);
            if end <= offset {
                return Ok(Transfer::empty());
            }
        } else {
            let want = end.div_ceil(cb);
            if want > chain.len() {
                grown = self.grow(vol, &mut chain, want, false)?;
            }
            let capacity = chain.len() * cb;
            if offset >= capacity {
                if let Some(grown) = &grown {
                    grown.undo(vol, self.owner);
                }
                return Err(Error::NoSpace);
            }
            end = end.min(capacity);
        }

        Ok(Transfer {
            chain,
            offset,
            len: end - offset,
            grown,
        })
    }

    /// 把簇链扩展到`want`个簇。`exact`为假时空闲簇不足也尽量多分配。
    fn grow(
        &self,
        vol: &Volume,
        chain: &mut Vec<ClusterId>,
        want: usize,
        exact: bool,
    ) -> Result<Option<Grown>> {
        let fat = vol.allocator();
        let need = want - chain.len();
        let prev = chain.last().copied();
        let vc = match fat.get_free_clusters(vol, prev, need) {
            Ok(vc) => vc,
            Err(Error::NoSpace) if !exact => {
                let free = fat.free_count(vol)?;
                if free == 0 {
                    return Ok(None);
                }
                log::warn!("Only {free} of {need} clusters available for {:?}", self.name);
                fat.get_free_clusters(vol, prev, free.min(need))?
            }
            Err(e) => return Err(e),
        };

        let grown = Grown { vc, prev };
        if let Err(e) = fat.make_cluster_chain(vol, prev, &grown.vc, Some(self.owner)) {
            grown.undo(vol, self.owner);
            return Err(e);
        }
        chain.extend(grown.vc.clusters());
        Ok(Some(grown))
    }

    fn write_in(&mut self, vol: &Volume, xfer: &Transfer, buf: &[u8]) -> Result<usize> {
        let old_size = self.size as usize;
        if xfer.offset > old_size {
            zero_fill(vol, &xfer.chain, self.owner, old_size, xfer.offset)?;
        }
        copy_span(vol, &xfer.chain, self.owner, xfer.offset, Rw::Write(&buf[..xfer.len]))?;

        let end = xfer.offset + xfer.len;
        let first = xfer.chain.first().copied().unwrap_or(ClusterId::FREE);
        if end > old_size || first != self.cluster {
            let flags = if self.flags.contains(NodeFlag::Open) {
                UpdateFlags::from(UpdateFlag::DirtySizeBegin)
            } else {
                UpdateFlags::empty()
            };
            self.update_short_name_entry(vol, end.max(old_size) as u32, first, flags)?;
        }
        Ok(xfer.len)
    }
}

impl Transfer {
    fn empty() -> Self {
        Self {
            chain: Vec::new(),
            offset: 0,
            len: 0,
            grown: None,
        }
    }
}

impl Node {
    /// 从`offset`开始读，返回读到的字节数
    pub fn read_at(&self, vol: &Volume, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.read();
        let _vol = vol.read_lock();
        let inner = live(&state, vol)?;

        let xfer = inner.read_write_init(vol, offset, buf.len(), false)?;
        if xfer.len == 0 {
            return Ok(0);
        }
        copy_span(vol, &xfer.chain, inner.owner, xfer.offset, Rw::Read(&mut buf[..xfer.len]))?;
        Ok(xfer.len)
    }

    /// 从`offset`开始写，返回写入的字节数。
    ///
    /// 超出文件末尾的空洞先补零；打开的文件变长时进入脏尺寸状态。
    pub fn write_at(&self, vol: &Volume, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let inner = live_mut(&mut state, vol)?;
        if buf.is_empty() {
            inner.check_content(vol, true)?;
            return Ok(0);
        }

        let _txn = Txn::begin(vol, LogOp::Write);
        let xfer = inner.read_write_init(vol, offset, buf.len(), true)?;
        let res = inner.write_in(vol, &xfer, buf);
        if let (Err(e), Some(grown)) = (&res, &xfer.grown) {
            log::error!("Write to {:?} failed: {e}", inner.name);
            grown.undo(vol, inner.owner);
        }
        res
    }

    /// 改变文件尺寸。变长的部分补零，缩短时释放多余的簇。
    pub fn truncate(&self, vol: &Volume, size: u32) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let inner = live_mut(&mut state, vol)?;
        inner.check_content(vol, true)?;

        let old = inner.size;
        if size == old {
            return Ok(());
        }
        let _txn = Txn::begin(vol, LogOp::Truncate);
        let cb = vol.geometry().cluster_bytes();

        if size < old {
            let keep = (size as usize).div_ceil(cb);
            let first = inner.cluster;
            let cluster = if keep == 0 { ClusterId::FREE } else { first };
            // 目录项先指向缩短后的链，再释放簇
            inner.update_short_name_entry(vol, size, cluster, UpdateFlag::Force.into())?;
            if first != ClusterId::FREE {
                let freed = vol
                    .allocator()
                    .truncate_chain(vol, first, keep, Some(inner.owner))?;
                log::debug!("Truncated {:?} to {size} bytes, freed {freed} clusters", inner.name);
            }
            return Ok(());
        }

        let mut chain = inner.chain(vol)?;
        let want = (size as usize).div_ceil(cb);
        let grown = if want > chain.len() {
            inner.grow(vol, &mut chain, want, true)?
        } else {
            None
        };
        let first = chain.first().copied().unwrap_or(ClusterId::FREE);
        let owner = inner.owner;
        let res = zero_fill(vol, &chain, owner, old as usize, size as usize)
            .and_then(|()| inner.update_short_name_entry(vol, size, first, UpdateFlag::Force.into()));
        if let (Err(_), Some(grown)) = (&res, &grown) {
            grown.undo(vol, owner);
        }
        res
    }
}

/// 在簇链上从文件偏移`offset`开始传输。调用者保证链足够长。
fn copy_span(vol: &Volume, chain: &[ClusterId], owner: OwnerTag, offset: usize, mut io: Rw) -> Result<()> {
    let geo = vol.geometry();
    let (cb, sb) = (geo.cluster_bytes(), geo.sector_bytes);
    let end = offset + io.len();
    let mut pos = offset;

    while pos < end {
        let ci = pos / cb;
        let done = pos - offset;

        if pos % cb == 0 && end - pos >= cb {
            let whole = (end - pos) / cb;
            let vc = ClusterVector::coalesce(chain[ci..ci + whole].iter().copied());
            let mut at = done;
            for run in vc.runs() {
                let bytes = run.count as usize * cb;
                let sectors = run.count as usize * geo.cluster_sectors;
                let first = geo.cluster_sector(run.start);
                match &mut io {
                    Rw::Read(buf) => {
                        let part = &mut buf[at..at + bytes];
                        vol.device().read_blocks(first.block(sb), part)?;
                        vol.cache().copy_resident(vol, first, part, sectors);
                    }
                    Rw::Write(buf) => {
                        vol.cache().write_through(vol, first, &buf[at..at + bytes], sectors)?;
                    }
                }
                at += bytes;
            }
            pos += whole * cb;
            continue;
        }

        let stop = end.min((ci + 1) * cb);
        let sid = geo.cluster_sector(chain[ci]) + (pos % cb) / sb;
        let in_sector = pos % sb;
        let n = (sb - in_sector).min(stop - pos);
        match &mut io {
            Rw::Read(buf) => {
                let sector = vol.cache().get_sector(vol, sid, CacheFlag::User.into())?;
                sector.map(|data| buf[done..done + n].copy_from_slice(&data[in_sector..in_sector + n]));
            }
            Rw::Write(buf) => {
                let mut flags = CacheFlags::from(CacheFlag::User);
                if n == sb {
                    flags |= CacheFlag::NoRead;
                }
                let mut sector = vol.cache().get_sector(vol, sid, flags)?;
                sector.map_mut(|data| data[in_sector..in_sector + n].copy_from_slice(&buf[done..done + n]));
                sector.put(CacheFlag::Dirty.into(), Some(owner))?;
            }
        }
        pos += n;
    }
    Ok(())
}

/// 文件偏移`[from, to)`补零
fn zero_fill(vol: &Volume, chain: &[ClusterId], owner: OwnerTag, from: usize, to: usize) -> Result<()> {
    let cb = vol.geometry().cluster_bytes();
    let zeros = vec![0; cb];
    let mut pos = from;
    while pos < to {
        let n = (to - pos).min(cb - pos % cb);
        copy_span(vol, chain, owner, pos, Rw::Write(&zeros[..n]))?;
        pos += n;
    }
    Ok(())
}
