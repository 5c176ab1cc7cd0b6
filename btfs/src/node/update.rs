//! 短目录项的更新与脏尺寸协议。
//!
//! 打开的文件第一次变长时，目录项带上脏标记写穿到介质，此后的扩展只改内存中的尺寸，
//! 直到同步时写入真实尺寸并清除标记。崩溃后看到标记就知道尺寸字段可能落后。

use enumflags2::{BitFlags, bitflags};

use super::{Node, NodeFlag, NodeInner, SizeSyncState, Txn, live_mut};
use crate::cache::{CacheFlag, CacheFlags};
use crate::dir::{ENTRY_SIZE, ShortDirEntry};
use crate::hooks::LogOp;
use crate::volume::Volume;
use crate::{ClusterId, Result};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlag {
    /// 进入脏尺寸状态
    DirtySizeBegin = 1 << 0,
    /// 写入真实尺寸并清除脏标记
    DirtySizeEnd = 1 << 1,
    /// 立即写入尺寸字段但保留脏标记，内存中的尺寸不会因此变小
    ForceSize = 1 << 2,
    Force = 1 << 3,
    /// 写穿缓存
    Sync = 1 << 4,
}

pub type UpdateFlags = BitFlags<UpdateFlag>;

impl NodeInner {
    /// 以新的尺寸与首簇更新短目录项。
    ///
    /// 处于稳定的脏尺寸状态且没有强制标志时，尺寸只记在内存中，不写目录项。
    /// 写入失败时内存中的状态保持原样。
    pub(super) fn update_short_name_entry(
        &mut self,
        vol: &Volume,
        size: u32,
        cluster: ClusterId,
        flags: UpdateFlags,
    ) -> Result<()> {
        // 根目录没有目录项；已删除的目录项不能再写回去
        if self.is_root() || self.flags.contains(NodeFlag::Unlink) {
            self.size = size;
            self.cluster = cluster;
            return Ok(());
        }

        let mut next = self.entry;
        next.set_cluster_id(cluster);
        let mut state = self.size_state;
        let mut write = flags.intersects(UpdateFlag::Force | UpdateFlag::ForceSize);

        if flags.contains(UpdateFlag::DirtySizeEnd) {
            next.set_dirty_size(false);
            next.resize(size);
            state = SizeSyncState::Clean;
            write |= next != self.entry;
        } else if flags.contains(UpdateFlag::DirtySizeBegin) && state == SizeSyncState::Clean {
            next.set_dirty_size(true);
            next.resize(size);
            state = SizeSyncState::DirtyPendingFlush;
            write = true;
        } else if state == SizeSyncState::Clean || write {
            next.resize(size);
            write |= next != self.entry;
        } else {
            write |= next != self.entry;
        }

        if write {
            if size != self.size || cluster != self.cluster {
                next.set_modified(vol.clock().now());
            }
            // 脏标记必须先于数据到达介质
            let entering = state != SizeSyncState::Clean && self.size_state == SizeSyncState::Clean;
            let cache_flags = if flags.contains(UpdateFlag::Sync) || entering {
                CacheFlags::from(CacheFlag::Sync)
            } else {
                CacheFlags::empty()
            };
            self.store_entry(vol, &next, cache_flags)?;
            self.entry = next;
        }

        self.size = if flags.contains(UpdateFlag::ForceSize) {
            size.max(self.size)
        } else {
            size
        };
        self.cluster = cluster;
        self.size_state = state;
        Ok(())
    }

    /// 把短目录项写进缓存，失败时换回原来的内容
    fn store_entry(&self, vol: &Volume, entry: &ShortDirEntry, flags: CacheFlags) -> Result<()> {
        let res = self.write_image(vol, entry, flags);
        if let Err(e) = res {
            log::error!("Failed to store directory entry of {:?}: {e}", self.name);
            if let Err(e) = self.write_image(vol, &self.entry, CacheFlags::empty()) {
                log::error!("Failed to restore directory entry of {:?}: {e}", self.name);
            }
        }
        res
    }

    fn write_image(&self, vol: &Volume, entry: &ShortDirEntry, flags: CacheFlags) -> Result<()> {
        let (sid, at) = self.short.location(vol);
        let mut sector = vol.cache().get_sector(vol, sid, CacheFlag::De.into())?;
        sector.map_mut(|buf| buf[at..at + ENTRY_SIZE].copy_from_slice(&entry.encode()));
        sector.put(flags | CacheFlag::Dirty, Some(self.owner))
    }

    /// 同步节点。
    ///
    /// 脏尺寸状态下，若内存中的尺寸超过`size_to_be`，只把`size_to_be`写入尺寸字段；
    /// 否则写入真实尺寸并清除标记。之后写回节点名下的所有脏扇区。
    pub(super) fn sync_in(&mut self, vol: &Volume, size_to_be: u32) -> Result<()> {
        self.check(vol)?;
        if vol.is_read_only() {
            return Ok(());
        }

        let _txn = Txn::begin(vol, LogOp::Sync);
        if self.size_state == SizeSyncState::DirtyPendingFlush
            && !self.flags.contains(NodeFlag::Unlink)
        {
            let cluster = self.cluster;
            if self.size > size_to_be {
                self.update_short_name_entry(vol, size_to_be, cluster, UpdateFlag::ForceSize.into())?;
            } else {
                let size = self.size;
                self.update_short_name_entry(vol, size, cluster, UpdateFlag::DirtySizeEnd.into())?;
            }
        }
        vol.cache().sync_node(vol, self.owner, CacheFlags::empty())
    }
}

impl Node {
    pub fn sync(&self, vol: &Volume, size_to_be: u32) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        live_mut(&mut state, vol)?.sync_in(vol, size_to_be)
    }

    /// 以当前尺寸同步
    pub fn flush(&self, vol: &Volume) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let inner = live_mut(&mut state, vol)?;
        let size = inner.size;
        inner.sync_in(vol, size)
    }

    /// 清除残留的脏标记。尺寸不超过簇链的容量，返回恢复后的尺寸。
    pub fn recover_dirty_size(&self, vol: &Volume) -> Result<u32> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let inner = live_mut(&mut state, vol)?;
        inner.check_writable(vol)?;
        if inner.size_state == SizeSyncState::Clean {
            return Ok(inner.size);
        }

        let capacity = match inner.cluster {
            ClusterId::FREE => 0,
            first => {
                let clusters = vol.allocator().chain(vol, first)?.len() as u64;
                clusters * vol.geometry().cluster_bytes() as u64
            }
        };
        let size = u64::from(inner.size).min(capacity) as u32;
        log::info!("Recovering size of {:?}: {} -> {size}", inner.name, inner.size);

        let _txn = Txn::begin(vol, LogOp::Sync);
        let cluster = inner.cluster;
        inner.update_short_name_entry(vol, size, cluster, UpdateFlag::DirtySizeEnd | UpdateFlag::Sync)?;
        Ok(size)
    }
}
