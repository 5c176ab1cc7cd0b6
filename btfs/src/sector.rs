//! 扇区号

use derive_more::{Add, Display, From, Into};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, From, Into)]
#[repr(transparent)]
pub struct SectorId(usize);

impl core::ops::Add<usize> for SectorId {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        self + Self(rhs)
    }
}

impl SectorId {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    /// 拉伸扇区号至块ID
    pub const fn block(self, sector_bytes: usize) -> usize {
        self.0 * (sector_bytes / crate::config::BLOCK_SIZE)
    }

    /// `self..self + count`
    pub fn span(self, count: usize) -> impl Iterator<Item = SectorId> {
        (self.0..self.0 + count).map(SectorId)
    }
}
