//! # 节点
//!
//! 节点是文件、目录或符号链接在内存中的句柄，以目录项位置标识：
//! `(父目录簇, 首个目录项所在簇, 首个目录项偏移)`，再加上卷的挂载代。
//!
//! 锁只能按下列顺序获取：
//!
//! - lookup: 父节点(读) -> 卷(读)
//! - create: 父节点(写) -> 卷(写)
//! - open/close/sync/读写: 节点 -> 卷(读)
//! - unlink: 节点 -> 父节点 -> 卷(写)
//! - rename: 源节点 -> 源父节点 -> 目标节点 -> 目标父节点 -> 卷(写)
//!
//! 以`_in`结尾的函数假定调用者已经持有相应的锁。

mod create;
mod rename;
mod rw;
mod update;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use enumflags2::{BitFlags, bitflags};
use spin::RwLock;
use vfs::{DirEntry, DirEntryType, Stat};

pub use self::rename::rename;
pub use self::update::{UpdateFlag, UpdateFlags};
use crate::cache::OwnerTag;
use crate::dir::{self, AttrFlag, DePos, ScanCriteria, ScanResult, ShortDirEntry};
use crate::hooks::LogOp;
use crate::volume::{Volume, VolumeId};
use crate::{ClusterId, Error, Result};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlag {
    Valid = 1 << 0,
    Open = 1 << 1,
    Unlink = 1 << 2,
    /// 删除时仍被打开，簇的回收推迟到最后一个引用释放
    OpenUnlink = 1 << 3,
    Root = 1 << 4,
}

pub type NodeFlags = BitFlags<NodeFlag>;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseFlag {
    Sync = 1 << 0,
    DecReference = 1 << 1,
    /// 最终关闭，释放节点
    ReleaseResource = 1 << 2,
}

pub type CloseFlags = BitFlags<CloseFlag>;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFlag {
    Directory = 1 << 0,
    SymLink = 1 << 1,
}

pub type CreateFlags = BitFlags<CreateFlag>;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkFlag {
    /// 调用者仍持有引用，推迟簇的回收
    Open = 1 << 0,
}

pub type UnlinkFlags = BitFlags<UnlinkFlag>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    SymLink,
}

/// 目录项尺寸与内存尺寸的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeSyncState {
    #[default]
    Clean,
    /// 目录项带着脏标记，尺寸可能落后于内存，下次同步时清除
    DirtyPendingFlush,
    /// 在只读卷上发现的脏标记，必须先恢复才能写
    DirtyAwaitingRecovery,
}

/// 交给扩展模块的节点快照
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ino: u64,
    pub name: String,
    pub cluster: ClusterId,
    pub size: u32,
    pub kind: NodeKind,
    pub flags: NodeFlags,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeInner {
    vol: VolumeId,
    stamp: u32,
    /// 父目录的首簇，根目录为[`ClusterId::FREE`]
    parent: ClusterId,
    first: DePos,
    short: DePos,
    /// 整组目录项数
    entries: usize,
    name: String,
    cluster: ClusterId,
    /// 内存中的尺寸，脏尺寸期间可能大于目录项记录的值
    size: u32,
    kind: NodeKind,
    /// 介质上短目录项的副本
    entry: ShortDirEntry,
    flags: NodeFlags,
    size_state: SizeSyncState,
    refs: u32,
    handle: Option<u64>,
    owner: OwnerTag,
}

/// 节点句柄。
///
/// 终止后内部状态为`None`，此后的`close`什么也不做。
pub struct Node {
    state: RwLock<Option<NodeInner>>,
}

impl Default for Node {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_read() {
            Some(state) => f.debug_struct("Node").field("state", &*state).finish(),
            None => f.write_str("Node { <locked> }"),
        }
    }
}

impl NodeInner {
    fn root(vol: &Volume) -> Self {
        let root = vol.geometry().root_cluster;
        let mut entry = ShortDirEntry::default();
        entry.attr = AttrFlag::Directory.into();
        entry.set_cluster_id(root);
        let pos = DePos {
            cluster: ClusterId::FREE,
            offset: 0,
        };
        Self {
            vol: vol.id(),
            stamp: vol.stamp(),
            parent: ClusterId::FREE,
            first: pos,
            short: pos,
            entries: 0,
            name: String::new(),
            cluster: root,
            size: 0,
            kind: NodeKind::Directory,
            entry,
            flags: NodeFlag::Valid | NodeFlag::Root,
            size_state: SizeSyncState::Clean,
            refs: 0,
            handle: None,
            owner: vol.next_owner(),
        }
    }

    fn from_found(vol: &Volume, parent: ClusterId, found: dir::Found) -> Self {
        let entry = found.entry;
        let kind = if entry.is_dir() {
            NodeKind::Directory
        } else if entry.is_symlink() {
            NodeKind::SymLink
        } else {
            NodeKind::File
        };
        let size_state = match (entry.is_dirty_size(), vol.is_read_only()) {
            (false, _) => SizeSyncState::Clean,
            (true, false) => SizeSyncState::DirtyPendingFlush,
            (true, true) => SizeSyncState::DirtyAwaitingRecovery,
        };
        Self {
            vol: vol.id(),
            stamp: vol.stamp(),
            parent,
            first: found.first,
            short: found.short,
            entries: found.count,
            name: found.name,
            cluster: entry.cluster_id(),
            size: if kind == NodeKind::Directory { 0 } else { entry.size() },
            kind,
            entry,
            flags: NodeFlag::Valid.into(),
            size_state,
            refs: 0,
            handle: None,
            owner: vol.next_owner(),
        }
    }

    /// 句柄属于此卷的当前挂载代
    fn check(&self, vol: &Volume) -> Result<()> {
        if self.vol != vol.id() {
            log::error!("Node of volume {} used with volume {}", self.vol, vol.id());
            return Err(Error::Invalid);
        }
        if self.stamp != vol.stamp() {
            return Err(Error::StaleGeneration);
        }
        Ok(())
    }

    fn check_writable(&self, vol: &Volume) -> Result<()> {
        self.check(vol)?;
        if vol.is_read_only() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// 作为父目录使用前的检查
    fn check_dir(&self) -> Result<()> {
        if self.kind != NodeKind::Directory {
            return Err(Error::NotADirectory);
        }
        if self.flags.contains(NodeFlag::Unlink) {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn is_root(&self) -> bool {
        self.flags.contains(NodeFlag::Root)
    }

    fn same_identity(&self, other: &Self) -> bool {
        (self.vol, self.stamp, self.parent, self.first)
            == (other.vol, other.stamp, other.parent, other.first)
    }

    fn ino(&self) -> u64 {
        self.first.ino()
    }

    fn info(&self) -> NodeInfo {
        NodeInfo {
            ino: self.ino(),
            name: self.name.clone(),
            cluster: self.cluster,
            size: self.size,
            kind: self.kind,
            flags: self.flags,
        }
    }

    /// NO_LOCK形式的查找：调用者持有父目录与卷的锁
    fn lookup_in(&self, vol: &Volume, name: &str, free_slots: usize) -> Result<ScanResult> {
        self.check_dir()?;
        dir::scan(
            vol,
            self.cluster,
            &ScanCriteria {
                name: Some(name),
                free_slots,
            },
        )
    }
}

fn live<'a>(state: &'a Option<NodeInner>, vol: &Volume) -> Result<&'a NodeInner> {
    let inner = state.as_ref().ok_or(Error::Invalid)?;
    inner.check(vol)?;
    Ok(inner)
}

fn live_mut<'a>(state: &'a mut Option<NodeInner>, vol: &Volume) -> Result<&'a mut NodeInner> {
    let inner = state.as_mut().ok_or(Error::Invalid)?;
    inner.check(vol)?;
    Ok(inner)
}

/// 日志事务，离开作用域时提交
struct Txn<'a> {
    vol: &'a Volume,
    op: LogOp,
}

impl<'a> Txn<'a> {
    fn begin(vol: &'a Volume, op: LogOp) -> Self {
        vol.journal().begin(op);
        Self { vol, op }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        self.vol.journal().commit(self.op);
    }
}

impl Node {
    /// 未初始化的节点
    pub const fn empty() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    fn with(inner: NodeInner) -> Self {
        Self {
            state: RwLock::new(Some(inner)),
        }
    }

    /// 根目录节点
    pub fn root(vol: &Volume) -> Self {
        let inner = NodeInner::root(vol);
        vol.addon().init_node(&inner.info());
        Self::with(inner)
    }

    /// 在此目录中查找`name`
    pub fn lookup(&self, vol: &Volume, name: &str) -> Result<Node> {
        let name = dir::canonical_name(name)?;
        let parent = self.state.read();
        let _vol = vol.read_lock();
        let parent = live(&parent, vol)?;

        let found = parent
            .lookup_in(vol, name, 0)?
            .found
            .ok_or(Error::NotFound)?;
        let inner = NodeInner::from_found(vol, parent.cluster, found);
        log::debug!("Found {name:?} at {:?} in directory {}", inner.first, parent.cluster);
        vol.addon().init_node(&inner.info());
        Ok(Self::with(inner))
    }

    /// 打开节点并记录外部句柄。每次调用都增加引用计数。
    pub fn open(&self, vol: &Volume, handle: u64) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let inner = live_mut(&mut state, vol)?;
        if inner.flags.contains(NodeFlag::Unlink) {
            return Err(Error::NotFound);
        }

        inner.refs += 1;
        inner.flags |= NodeFlag::Open;
        inner.handle = Some(handle);
        Ok(())
    }

    /// 关闭节点；对已终止的节点什么也不做
    pub fn close(&self, vol: &Volume, flags: CloseFlags) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let Some(inner) = state.as_mut() else {
            return Ok(());
        };
        let live = inner.check(vol).is_ok();

        let mut res = Ok(());
        if flags.contains(CloseFlag::Sync) {
            if live {
                let size = inner.size;
                res = inner.sync_in(vol, size);
            } else {
                log::warn!("Skipping sync of {:?}: volume was remounted", inner.name);
            }
        }

        if flags.contains(CloseFlag::DecReference) {
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs == 0 {
                inner.flags.remove(NodeFlag::Open);
                if live && inner.flags.contains(NodeFlag::OpenUnlink) {
                    let reclaimed = inner.unlink_open_unlinked_in(vol);
                    res = res.and(reclaimed);
                }
            }
        }

        if flags.contains(CloseFlag::ReleaseResource) {
            vol.addon().after_close(&inner.info());
            *state = None;
        }
        res
    }

    pub fn get_status(&self, vol: &Volume) -> Result<Stat> {
        let state = self.state.read();
        let _vol = vol.read_lock();
        let inner = live(&state, vol)?;

        let cluster_bytes = vol.geometry().cluster_bytes() as u64;
        let size = u64::from(inner.size);
        Ok(Stat {
            ino: inner.ino(),
            mode: match inner.kind {
                NodeKind::File => DirEntryType::Regular,
                NodeKind::Directory => DirEntryType::Directory,
                NodeKind::SymLink => DirEntryType::SymLink,
            },
            attr: inner.entry.attr.bits(),
            block_size: cluster_bytes,
            blocks: size.div_ceil(cluster_bytes) * cluster_bytes / 512,
            size,
            ctime: inner.entry.created(),
            mtime: inner.entry.modified(),
            atime: inner.entry.accessed(),
        })
    }

    /// 修改属性与时间，不允许改变文件/目录的种类
    pub fn set_status(&self, vol: &Volume, stat: &Stat) -> Result<()> {
        let mut state = self.state.write();
        let _vol = vol.read_lock();
        let inner = live_mut(&mut state, vol)?;
        inner.check_writable(vol)?;
        if inner.is_root() {
            return Err(Error::PermissionDenied);
        }
        if inner.flags.contains(NodeFlag::Unlink) {
            return Err(Error::NotFound);
        }

        let want_dir = stat.mode == DirEntryType::Directory;
        let attr = BitFlags::<AttrFlag>::from_bits_truncate(stat.attr);
        if want_dir != (inner.kind == NodeKind::Directory)
            || attr.contains(AttrFlag::Directory) != want_dir
            || attr.contains(AttrFlag::VolumeID)
        {
            return Err(Error::Invalid);
        }

        let _txn = Txn::begin(vol, LogOp::SetStatus);
        let saved = inner.entry;
        inner.entry.attr = attr;
        inner.entry.set_created(stat.ctime);
        inner.entry.set_modified(stat.mtime);
        inner.entry.set_accessed(stat.atime);
        let (size, cluster) = (inner.size, inner.cluster);
        inner
            .update_short_name_entry(vol, size, cluster, UpdateFlag::Force.into())
            .inspect_err(|_| inner.entry = saved)
    }

    /// 列出目录内容
    pub fn readdir(&self, vol: &Volume, at: usize, count: usize) -> Result<Vec<DirEntry>> {
        let state = self.state.read();
        let _vol = vol.read_lock();
        let inner = live(&state, vol)?;
        inner.check_dir()?;
        dir::list(vol, inner.cluster, at, count)
    }

    /// 两个句柄是否指向同一个对象
    pub fn is_same_node(a: &Node, b: &Node) -> bool {
        if core::ptr::eq(a, b) {
            return a.state.read().is_some();
        }
        let (a, b) = (a.state.read(), b.state.read());
        match (a.as_ref(), b.as_ref()) {
            (Some(a), Some(b)) => a.same_identity(b),
            _ => false,
        }
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.state.read().as_ref().map(NodeInner::info)
    }

    pub fn is_valid(&self) -> bool {
        self.state
            .read()
            .as_ref()
            .is_some_and(|inner| inner.flags.contains(NodeFlag::Valid))
    }

    pub fn flags(&self) -> NodeFlags {
        self.state
            .read()
            .as_ref()
            .map_or(NodeFlags::empty(), |inner| inner.flags)
    }

    pub fn size(&self) -> u32 {
        self.state.read().as_ref().map_or(0, |inner| inner.size)
    }

    pub fn cluster(&self) -> ClusterId {
        self.state
            .read()
            .as_ref()
            .map_or(ClusterId::FREE, |inner| inner.cluster)
    }

    pub fn kind(&self) -> Option<NodeKind> {
        self.state.read().as_ref().map(|inner| inner.kind)
    }

    pub fn size_state(&self) -> SizeSyncState {
        self.state
            .read()
            .as_ref()
            .map_or(SizeSyncState::Clean, |inner| inner.size_state)
    }

    pub fn refs(&self) -> u32 {
        self.state.read().as_ref().map_or(0, |inner| inner.refs)
    }

    pub fn handle(&self) -> Option<u64> {
        self.state.read().as_ref().and_then(|inner| inner.handle)
    }

    pub fn name(&self) -> Option<String> {
        self.state.read().as_ref().map(|inner| inner.name.clone())
    }

    /// 父目录的首簇
    pub fn parent_cluster(&self) -> Option<ClusterId> {
        self.state.read().as_ref().map(|inner| inner.parent)
    }

    /// 短目录项的位置，根目录没有目录项
    pub fn entry_position(&self) -> Option<DePos> {
        self.state
            .read()
            .as_ref()
            .filter(|inner| !inner.is_root())
            .map(|inner| inner.short)
    }
}
