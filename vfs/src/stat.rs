use crate::DirEntryType;

/// FAT格式的时间戳
///
/// - `date`: bits 15-9 年份（自1980起）, 8-5 月, 4-0 日
/// - `time`: bits 15-11 时, 10-5 分, 4-0 秒/2
/// - `tenth`: 10毫秒单位的补充，范围 [0, 199]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DosTime {
    pub date: u16,
    pub time: u16,
    pub tenth: u8,
}

impl DosTime {
    /// 1980-01-01 00:00:00
    pub const EPOCH: Self = Self {
        date: (1 << 5) | 1,
        time: 0,
        tenth: 0,
    };
}

#[derive(Debug, Clone)]
pub struct Stat {
    /// 由目录项位置导出的编号
    pub ino: u64,
    pub mode: DirEntryType,
    /// FAT属性字节
    pub attr: u8,
    /// Optimal I/O block size
    pub block_size: u64,
    /// Occupying blocks
    pub blocks: u64,
    /// File size
    pub size: u64,
    pub ctime: DosTime,
    pub mtime: DosTime,
    pub atime: DosTime,
}
