//! 重命名。
//!
//! 新目录项先写入，之后删除源目录项，最后删除被替换的目标目录项，
//! 任何一步失败都撤销之前的步骤。被替换的目标的簇在目录项全部就位后才释放。

use alloc::string::String;

use spin::RwLockWriteGuard;

use super::{Node, NodeFlag, NodeInner, NodeKind, SizeSyncState, Txn, live, live_mut};
use crate::cache::{CacheFlags, OwnerTag};
use crate::dir::{self, DePos, ENTRY_SIZE, ScanCriteria, long_entries_for};
use crate::hooks::LogOp;
use crate::volume::Volume;
use crate::{ClusterId, Error, Result};

type Guard<'a> = RwLockWriteGuard<'a, Option<NodeInner>>;

/// 把`src`重命名为`dst_parent`中的`name`。
///
/// `dst`是已存在的目标的句柄；给出时它必须就是`name`所指的对象，
/// 仍被打开的目标只删除目录项，簇的回收推迟。
pub fn rename(
    vol: &Volume,
    src_parent: &Node,
    src: &Node,
    dst_parent: &Node,
    dst: Option<&Node>,
    name: &str,
) -> Result<()> {
    let name = dir::canonical_name(name)?;
    if core::ptr::eq(src, src_parent) || core::ptr::eq(src, dst_parent) {
        return Err(Error::Invalid);
    }
    let dst = dst.filter(|&dst| !core::ptr::eq(dst, src));
    if dst.is_some_and(|dst| core::ptr::eq(dst, src_parent) || core::ptr::eq(dst, dst_parent)) {
        return Err(Error::Invalid);
    }

    RenameLocks::acquire(vol, src_parent, src, dst_parent, dst).rename(vol, name)
}

/// 按固定顺序持有的锁：源节点、源父目录、目标节点、目标父目录，最后是卷
struct RenameLocks<'a> {
    src: Guard<'a>,
    src_parent: Guard<'a>,
    dst: Option<Guard<'a>>,
    /// 与源父目录相同时为`None`
    dst_parent: Option<Guard<'a>>,
    _vol: RwLockWriteGuard<'a, ()>,
}

/// 参与重命名的目录
#[derive(Debug, Clone, Copy)]
struct DirRef {
    cluster: ClusterId,
    owner: OwnerTag,
}

impl DirRef {
    fn of(node: &NodeInner) -> Result<Self> {
        node.check_dir()?;
        Ok(Self {
            cluster: node.cluster,
            owner: node.owner,
        })
    }
}

impl<'a> RenameLocks<'a> {
    fn acquire(
        vol: &'a Volume,
        src_parent: &'a Node,
        src: &'a Node,
        dst_parent: &'a Node,
        dst: Option<&'a Node>,
    ) -> Self {
        let src_guard = src.state.write();
        let src_parent_guard = src_parent.state.write();
        let dst_guard = dst.map(|dst| dst.state.write());
        let dst_parent_guard =
            (!core::ptr::eq(src_parent, dst_parent)).then(|| dst_parent.state.write());
        Self {
            src: src_guard,
            src_parent: src_parent_guard,
            dst: dst_guard,
            dst_parent: dst_parent_guard,
            _vol: vol.write_lock(),
        }
    }

    fn rename(&mut self, vol: &Volume, name: &str) -> Result<()> {
        let src = live_mut(&mut self.src, vol)?;
        src.check_writable(vol)?;
        if src.is_root() {
            return Err(Error::PermissionDenied);
        }
        if src.flags.contains(NodeFlag::Unlink) {
            return Err(Error::NotFound);
        }

        let src_dir = DirRef::of(live(&self.src_parent, vol)?)?;
        let dst_dir = match &self.dst_parent {
            Some(guard) => DirRef::of(live(guard, vol)?)?,
            None => src_dir,
        };
        if src.parent != src_dir.cluster {
            log::error!("{:?} is not a child of directory {}", src.name, src_dir.cluster);
            return Err(Error::Invalid);
        }
        if dst_dir.cluster == src_dir.cluster && src.name == name {
            return Ok(());
        }
        let moved = dst_dir.cluster != src_dir.cluster;
        if moved && src.kind == NodeKind::Directory && is_within(vol, dst_dir.cluster, src.cluster)? {
            return Err(Error::Invalid);
        }

        let scan = dir::scan(
            vol,
            dst_dir.cluster,
            &ScanCriteria {
                name: Some(name),
                free_slots: long_entries_for(name) + 1,
            },
        )?;
        // 仅大小写不同的同名项就是源自身
        let existing = scan
            .found
            .filter(|found| !(dst_dir.cluster == src.parent && found.first == src.first));

        let mut dst = match self.dst.as_mut() {
            Some(guard) => Some(live_mut(guard, vol)?),
            None => None,
        };
        match (&existing, &dst) {
            (Some(found), Some(dst)) if dst.parent != dst_dir.cluster || dst.first != found.first => {
                log::error!("Target handle {:?} does not match {name:?}", dst.name);
                return Err(Error::Invalid);
            }
            (None, Some(_)) => return Err(Error::NotFound),
            _ => {}
        }
        if let Some(found) = &existing {
            match (src.kind == NodeKind::Directory, found.entry.is_dir()) {
                (true, false) => return Err(Error::NotADirectory),
                (false, true) => return Err(Error::IsADirectory),
                _ => {}
            }
            if found.entry.is_dir() && !dir::is_empty_dir(vol, found.entry.cluster_id())? {
                return Err(Error::DirectoryNotEmpty);
            }
        }

        let _txn = Txn::begin(vol, LogOp::Rename);
        let at = match scan.vacant {
            Some(at) => at,
            None => {
                let _txn = Txn::begin(vol, LogOp::ExpandDir);
                dir::expand_dir(vol, dst_dir.cluster, Some(dst_dir.owner))?
            }
        };

        // 目录项原样搬过去，脏尺寸标记随之保留
        let raws = dir::name_to_entries(name, &src.entry);
        dir::write_entries(vol, dst_dir.cluster, at, &raws, CacheFlags::empty(), Some(src.owner))?;
        let undo_new = |vol: &Volume| {
            if let Err(e) = dir::delete_entries(vol, dst_dir.cluster, at, raws.len(), CacheFlags::empty(), Some(dst_dir.owner)) {
                log::error!("Failed to remove new entries of {name:?}: {e}");
            }
        };

        let short = match dir::position(vol, dst_dir.cluster, at.index() + raws.len() - 1) {
            Ok(short) => short,
            Err(e) => {
                undo_new(vol);
                return Err(e);
            }
        };
        let reparent = moved && src.kind == NodeKind::Directory;
        if reparent {
            if let Err(e) = set_parent_entry(vol, src.cluster, dst_dir.cluster, src.owner) {
                undo_new(vol);
                return Err(e);
            }
        }
        let undo_reparent = |vol: &Volume, cluster: ClusterId, owner: OwnerTag| {
            if reparent {
                if let Err(e) = set_parent_entry(vol, cluster, src_dir.cluster, owner) {
                    log::error!("Failed to restore `..` of directory {cluster}: {e}");
                }
            }
        };

        if let Err(e) = dir::delete_entries(vol, src_dir.cluster, src.first, src.entries, CacheFlags::empty(), Some(src.owner)) {
            undo_new(vol);
            undo_reparent(vol, src.cluster, src.owner);
            return Err(e);
        }
        if let Some(found) = &existing {
            if let Err(e) = dir::delete_entries(vol, dst_dir.cluster, found.first, found.count, CacheFlags::empty(), Some(dst_dir.owner)) {
                let old = dir::name_to_entries(&src.name, &src.entry);
                if let Err(e) = dir::write_entries(vol, src_dir.cluster, src.first, &old, CacheFlags::empty(), Some(src.owner)) {
                    log::error!("Failed to restore entries of {:?}: {e}", src.name);
                }
                undo_new(vol);
                undo_reparent(vol, src.cluster, src.owner);
                return Err(e);
            }
        }

        log::info!("Renamed {:?} in {} to {name:?} in {}", src.name, src_dir.cluster, dst_dir.cluster);
        src.parent = dst_dir.cluster;
        src.first = at;
        src.short = short;
        src.entries = raws.len();
        src.name = String::from(name);
        src.entry = src.entry.renamed(name);

        let Some(found) = existing else {
            return Ok(());
        };
        match dst.as_deref_mut() {
            Some(dst) => {
                dst.flags |= NodeFlag::Unlink;
                dst.size_state = SizeSyncState::Clean;
                if dst.flags.contains(NodeFlag::Open) {
                    dst.flags |= NodeFlag::OpenUnlink;
                    Ok(())
                } else {
                    dst.free_clusters(vol)
                }
            }
            None => vol
                .allocator()
                .deallocate_clusters(vol, found.entry.cluster_id(), Some(dst_dir.owner))
                .map(|_| ()),
        }
    }
}

/// `dir`是否位于`ancestor`之内（含自身）
fn is_within(vol: &Volume, dir: ClusterId, ancestor: ClusterId) -> Result<bool> {
    let root = vol.geometry().root_cluster;
    let mut cur = dir;
    for _ in 0..=vol.geometry().cluster_count {
        if cur == ancestor {
            return Ok(true);
        }
        if cur == root {
            return Ok(false);
        }
        cur = dir::parent_of(vol, cur)?;
    }
    log::error!("Directory {dir} does not lead back to the root");
    Err(Error::Corrupted)
}

/// 改写目录的`..`目录项
fn set_parent_entry(vol: &Volume, dir: ClusterId, parent: ClusterId, owner: OwnerTag) -> Result<()> {
    let pos = DePos {
        cluster: dir,
        offset: ENTRY_SIZE as u32,
    };
    let mut dotdot = dir::read_entry(vol, pos)?;
    if parent == vol.geometry().root_cluster {
        dotdot.set_cluster_id(ClusterId::FREE);
    } else {
        dotdot.set_cluster_id(parent);
    }
    dir::write_entries(vol, dir, pos, &[dotdot.encode()], CacheFlags::empty(), Some(owner))
}
