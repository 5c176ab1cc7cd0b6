//! 簇编号与簇向量

use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ClusterId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterError {
    Free,
    Defective,
    Reserved,
    Eof,
}

impl From<u32> for ClusterId {
    fn from(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }
}

impl From<ClusterId> for u32 {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

impl From<ClusterId> for usize {
    fn from(id: ClusterId) -> Self {
        id.0 as usize
    }
}

/// (低16位, 高16位)
impl From<(u16, u16)> for ClusterId {
    fn from((lo, hi): (u16, u16)) -> Self {
        Self::new(((hi as u32) << 16) | lo as u32)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<ClusterError> for vfs::Error {
    fn from(e: ClusterError) -> Self {
        log::error!("Broken cluster reference: {e:?}");
        vfs::Error::Corrupted
    }
}

impl ClusterId {
    const MASK: u32 = 0x0FFF_FFFF;

    pub const FREE: Self = Self(0);

    /// 最小的可用簇号
    pub const MIN: Self = Self(2);

    /// 链表结束标记
    pub const EOF: Self = Self(0x0FFF_FFFF);

    pub const BAD: Self = Self(0x0FFF_FFF7);

    pub const fn new(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// 0x0FFFFFF8..=0x0FFFFFFF 均表示链表结束
    pub const fn is_eof(self) -> bool {
        self.0 >= 0x0FFF_FFF8
    }

    /// NOTE: 没有卷的真实最大簇编号，无法得知全部保留簇
    pub fn is_unavailable(&self) -> bool {
        *self < Self::MIN || (Self(0x0FFF_FFF8)..=Self(0x0FFF_FFFE)).contains(self)
    }

    pub fn validate(self) -> Result<Self, ClusterError> {
        match self {
            ClusterId::FREE => Err(ClusterError::Free),
            ClusterId::BAD => Err(ClusterError::Defective),
            id if id.is_eof() => Err(ClusterError::Eof),
            id if id.is_unavailable() => Err(ClusterError::Reserved),
            id => Ok(id),
        }
    }

    /// (低16位, 高16位)
    pub const fn split(self) -> (u16, u16) {
        (self.0 as u16, (self.0 >> 16) as u16)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// 一段物理连续的簇
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRun {
    pub start: ClusterId,
    pub count: u32,
}

impl ClusterRun {
    pub fn last(&self) -> ClusterId {
        ClusterId::new(self.start.raw() + self.count - 1)
    }

    pub fn clusters(&self) -> impl Iterator<Item = ClusterId> + use<> {
        let start = self.start.raw();
        (start..start + self.count).map(ClusterId::new)
    }
}

/// 簇向量（VC）：以游程编码描述可能碎片化的簇序列，
/// 使跨越不连续簇的I/O可以按段批量进行。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterVector {
    runs: Vec<ClusterRun>,
}

impl ClusterVector {
    pub const fn new() -> Self {
        Self { runs: Vec::new() }
    }

    /// 将簇序列合并为尽量少的连续段
    pub fn coalesce<I>(clusters: I) -> Self
    where
        I: IntoIterator<Item = ClusterId>,
    {
        let mut vc = Self::new();
        for cid in clusters {
            vc.push(cid);
        }
        vc
    }

    /// 追加一个簇；与最后一段相邻时并入该段
    pub fn push(&mut self, cid: ClusterId) {
        match self.runs.last_mut() {
            Some(run) if run.last().next() == cid => run.count += 1,
            _ => self.runs.push(ClusterRun {
                start: cid,
                count: 1,
            }),
        }
    }

    pub fn runs(&self) -> &[ClusterRun] {
        &self.runs
    }

    /// 簇的总数
    pub fn total(&self) -> usize {
        self.runs.iter().map(|run| run.count as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn first(&self) -> Option<ClusterId> {
        self.runs.first().map(|run| run.start)
    }

    pub fn last(&self) -> Option<ClusterId> {
        self.runs.last().map(ClusterRun::last)
    }

    pub fn clusters(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.runs.iter().flat_map(ClusterRun::clusters)
    }
}
