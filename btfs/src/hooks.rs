//! 节点操作调用的外部协作者：日志、扩展模块与时钟

use vfs::DosTime;

use crate::node::NodeInfo;

/// 日志记录的操作种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Create,
    Unlink,
    Rename,
    ExpandDir,
    Truncate,
    SetStatus,
    Write,
    Sync,
}

/// 元数据日志。
///
/// 节点操作在第一次持久化修改之前调用`begin`，最后一次之后调用`commit`；
/// 失败路径同样会`commit`，由日志层自行判断是否回放。
pub trait Journal: Send + Sync {
    fn begin(&self, op: LogOp);

    fn commit(&self, op: LogOp);
}

#[derive(Debug, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn begin(&self, op: LogOp) {
        log::trace!("journal: begin {op:?}");
    }

    fn commit(&self, op: LogOp) {
        log::trace!("journal: commit {op:?}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonAction {
    /// 继续默认处理
    Continue,
    /// 扩展模块已完成处理
    Handled,
}

/// 扩展模块钩子，参数是节点的快照
///
/// NOTE: 钩子执行时节点锁仍被持有，不要在钩子里回调节点操作。
pub trait Addon: Send + Sync {
    fn init_node(&self, _node: &NodeInfo) {}

    fn after_close(&self, _node: &NodeInfo) {}

    fn unlink(&self, _parent: &NodeInfo, _node: &NodeInfo) -> AddonAction {
        AddonAction::Continue
    }
}

#[derive(Debug, Default)]
pub struct NullAddon;

impl Addon for NullAddon {}

pub trait Clock: Send + Sync {
    fn now(&self) -> DosTime;
}

/// 总是返回同一时刻
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DosTime);

impl Default for FixedClock {
    fn default() -> Self {
        Self(DosTime::EPOCH)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DosTime {
        self.0
    }
}
