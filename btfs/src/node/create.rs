//! 创建与删除

use alloc::string::String;

use super::{
    CreateFlag, CreateFlags, Node, NodeFlag, NodeInner, NodeKind, SizeSyncState, Txn,
    UnlinkFlag, UnlinkFlags, live_mut,
};
use crate::cache::CacheFlags;
use crate::dir::{self, AttrFlag, ShortDirEntry, long_entries_for};
use crate::hooks::{AddonAction, LogOp};
use crate::volume::Volume;
use crate::{ClusterId, Error, Result};

impl Node {
    /// 在此目录中创建`name`
    pub fn create(&self, vol: &Volume, name: &str, flags: CreateFlags) -> Result<Node> {
        let name = dir::canonical_name(name)?;
        let is_dir = flags.contains(CreateFlag::Directory);
        if is_dir && flags.contains(CreateFlag::SymLink) {
            return Err(Error::Invalid);
        }

        let mut parent = self.state.write();
        let _vol = vol.write_lock();
        let parent = live_mut(&mut parent, vol)?;
        parent.check_writable(vol)?;

        let scan = parent.lookup_in(vol, name, long_entries_for(name) + 1)?;
        if scan.found.is_some() {
            return Err(Error::AlreadyExists);
        }

        let _txn = Txn::begin(vol, LogOp::Create);
        let at = match scan.vacant {
            Some(at) => at,
            None => {
                let _txn = Txn::begin(vol, LogOp::ExpandDir);
                dir::expand_dir(vol, parent.cluster, Some(parent.owner))?
            }
        };

        let now = vol.clock().now();
        let owner = vol.next_owner();
        let attr = if is_dir {
            AttrFlag::Directory
        } else {
            AttrFlag::Archive
        };
        let mut entry = ShortDirEntry::new(name, attr.into(), now);
        if flags.contains(CreateFlag::SymLink) {
            entry.set_symlink();
        }

        // 目录需要立刻拥有一个簇来存放`.`与`..`
        let fat = vol.allocator();
        let mut allocated = None;
        if is_dir {
            let vc = fat.get_free_clusters(vol, None, 1)?;
            let cid = vc.first().ok_or(Error::NoSpace)?;
            entry.set_cluster_id(cid);
            let made = fat
                .make_cluster_chain(vol, None, &vc, Some(owner))
                .and_then(|()| dir::init_dir_cluster(vol, cid, &entry, parent.cluster, now, Some(owner)));
            if let Err(e) = made {
                if let Err(e) = fat.release_clusters(vol, &vc, None, Some(owner)) {
                    log::error!("Failed to release cluster {cid}: {e}");
                }
                return Err(e);
            }
            allocated = Some(vc);
        }

        let raws = dir::name_to_entries(name, &entry);
        let written = dir::write_entries(vol, parent.cluster, at, &raws, CacheFlags::empty(), Some(owner))
            .and_then(|()| dir::position(vol, parent.cluster, at.index() + raws.len() - 1));
        let short = match written {
            Ok(short) => short,
            Err(e) => {
                log::error!("Failed to write entries of {name:?}: {e}");
                if let Some(vc) = allocated {
                    if let Err(e) = fat.release_clusters(vol, &vc, None, Some(owner)) {
                        log::error!("Failed to release clusters of {name:?}: {e}");
                    }
                }
                return Err(e);
            }
        };

        let kind = if is_dir {
            NodeKind::Directory
        } else if flags.contains(CreateFlag::SymLink) {
            NodeKind::SymLink
        } else {
            NodeKind::File
        };
        let inner = NodeInner {
            vol: vol.id(),
            stamp: vol.stamp(),
            parent: parent.cluster,
            first: at,
            short,
            entries: raws.len(),
            name: String::from(name),
            cluster: entry.cluster_id(),
            size: 0,
            kind,
            entry: entry.renamed(name),
            flags: NodeFlag::Valid.into(),
            size_state: SizeSyncState::Clean,
            refs: 0,
            handle: None,
            owner,
        };
        log::info!("Created {kind:?} {name:?} at {at:?}");
        vol.addon().init_node(&inner.info());
        Ok(Self::with(inner))
    }

    /// 从此目录中删除`node`。
    ///
    /// 节点仍被打开时只删除目录项，簇在最后一个引用释放时回收。
    pub fn unlink(&self, vol: &Volume, node: &Node, flags: UnlinkFlags) -> Result<()> {
        if core::ptr::eq(self, node) {
            return Err(Error::Invalid);
        }
        let mut child = node.state.write();
        let mut parent = self.state.write();
        let _vol = vol.write_lock();
        let child = live_mut(&mut child, vol)?;
        let parent = live_mut(&mut parent, vol)?;

        child.check_writable(vol)?;
        if child.is_root() {
            return Err(Error::PermissionDenied);
        }
        parent.check_dir()?;
        if child.flags.contains(NodeFlag::Unlink) {
            return Err(Error::NotFound);
        }
        if child.parent != parent.cluster {
            log::error!("{:?} is not a child of directory {}", child.name, parent.cluster);
            return Err(Error::Invalid);
        }
        if child.kind == NodeKind::Directory && !dir::is_empty_dir(vol, child.cluster)? {
            return Err(Error::DirectoryNotEmpty);
        }

        let _txn = Txn::begin(vol, LogOp::Unlink);
        if vol.addon().unlink(&parent.info(), &child.info()) == AddonAction::Handled {
            log::debug!("Unlink of {:?} handled by addon", child.name);
            child.flags |= NodeFlag::Unlink;
            return Ok(());
        }

        dir::delete_entries(
            vol,
            parent.cluster,
            child.first,
            child.entries,
            CacheFlags::empty(),
            Some(parent.owner),
        )?;
        child.flags |= NodeFlag::Unlink;
        child.size_state = SizeSyncState::Clean;

        if flags.contains(UnlinkFlag::Open) || child.flags.contains(NodeFlag::Open) {
            log::debug!("Deferring reclaim of {:?}", child.name);
            child.flags |= NodeFlag::OpenUnlink;
            Ok(())
        } else {
            child.free_clusters(vol)
        }
    }

    /// 回收已删除但曾被打开的节点的簇；其他节点上什么也不做
    pub fn unlink_open_unlinked(&self, vol: &Volume) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        live_mut(&mut state, vol)?.unlink_open_unlinked_in(vol)
    }
}

impl NodeInner {
    pub(super) fn unlink_open_unlinked_in(&mut self, vol: &Volume) -> Result<()> {
        if !self.flags.contains(NodeFlag::OpenUnlink) {
            return Ok(());
        }
        self.check_writable(vol)?;

        let _txn = Txn::begin(vol, LogOp::Unlink);
        self.free_clusters(vol)?;
        self.flags.remove(NodeFlag::OpenUnlink);
        Ok(())
    }

    /// 释放整条簇链
    pub(super) fn free_clusters(&mut self, vol: &Volume) -> Result<()> {
        if self.cluster == ClusterId::FREE {
            return Ok(());
        }
        let freed = vol
            .allocator()
            .deallocate_clusters(vol, self.cluster, Some(self.owner))?;
        log::debug!("Reclaimed {freed} clusters of {:?}", self.name);
        self.cluster = ClusterId::FREE;
        Ok(())
    }
}
