//! 目录项编解码
//!
//! 目录项固定32字节，长目录项排在它所属的短目录项之前，序号倒序。

use alloc::string::String;
use alloc::vec::Vec;

use enumflags2::{BitFlags, bitflags};
use vfs::DosTime;

use super::name::short_name_basis;
use crate::ClusterId;
use crate::config::{DIRTY_SIZE_MARK, SYMLINK_MARK};

pub const ENTRY_SIZE: usize = 32;

pub type RawEntry = [u8; ENTRY_SIZE];

const CWD_NAME: [u8; 11] = *b".          ";

const PARENT_NAME: [u8; 11] = *b"..         ";

/// 已删除
pub const FREE_MARK: u8 = 0xE5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[bitflags]
#[repr(u8)]
pub enum AttrFlag {
    ReadOnly = 0b0000_0001,
    Hidden = 0b0000_0010,
    /// The corresponding file is tagged as a component of the operating system
    System = 0b0000_0100,
    /// The corresponding entry contains the volume label
    VolumeID = 0b0000_1000,
    Directory = 0b0001_0000,
    /// Indicates that properties of the associated file have been modified
    Archive = 0b0010_0000,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DirEntryStatus {
    /// name[0] == 0xE5
    Free,
    /// name[0] == 0，此条目后的条目皆为[`DirEntryStatus::TailFree`]
    TailFree,
    /// 已被使用
    Occupied,
}

pub fn status(raw: &RawEntry) -> DirEntryStatus {
    match raw[0] {
        FREE_MARK => DirEntryStatus::Free,
        0x00 => DirEntryStatus::TailFree,
        _ => DirEntryStatus::Occupied,
    }
}

/// 长目录项的属性字节
pub fn is_long(raw: &RawEntry) -> bool {
    raw[11] & 0x3F == LongDirEntry::attr().bits()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShortDirEntry {
    name: [u8; 11],

    pub attr: BitFlags<AttrFlag>,

    /// 保留字节，借用其中两位存放脏尺寸与符号链接标记
    ntres: u8,

    /// Count of tenths of a second.
    /// Range: [0, 199]
    crt_time_tenth: u8,

    /// Creation time, granularity is 2 seconds
    crt_time: u16,

    /// Creation date
    crt_date: u16,

    /// Last access date
    lst_acc_date: u16,

    /// High word of first data cluster number
    fst_clus_hi: u16,

    /// Last modification time
    wrt_time: u16,

    /// Last modification date
    wrt_date: u16,

    /// Low word of first data cluster number
    fst_clus_lo: u16,

    /// Quantity containing size in bytes
    file_size: u32,
}

impl ShortDirEntry {
    pub fn decode(raw: &RawEntry) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let mut name = [0; 11];
        name.copy_from_slice(&raw[0..11]);
        Self {
            name,
            attr: BitFlags::from_bits_truncate(raw[11]),
            ntres: raw[12],
            crt_time_tenth: raw[13],
            crt_time: u16_at(14),
            crt_date: u16_at(16),
            lst_acc_date: u16_at(18),
            fst_clus_hi: u16_at(20),
            wrt_time: u16_at(22),
            wrt_date: u16_at(24),
            fst_clus_lo: u16_at(26),
            file_size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    pub fn encode(&self) -> RawEntry {
        let mut raw = [0; ENTRY_SIZE];
        raw[0..11].copy_from_slice(&self.name);
        raw[11] = self.attr.bits();
        raw[12] = self.ntres;
        raw[13] = self.crt_time_tenth;
        raw[14..16].copy_from_slice(&self.crt_time.to_le_bytes());
        raw[16..18].copy_from_slice(&self.crt_date.to_le_bytes());
        raw[18..20].copy_from_slice(&self.lst_acc_date.to_le_bytes());
        raw[20..22].copy_from_slice(&self.fst_clus_hi.to_le_bytes());
        raw[22..24].copy_from_slice(&self.wrt_time.to_le_bytes());
        raw[24..26].copy_from_slice(&self.wrt_date.to_le_bytes());
        raw[26..28].copy_from_slice(&self.fst_clus_lo.to_le_bytes());
        raw[28..32].copy_from_slice(&self.file_size.to_le_bytes());
        raw
    }

    /// 以`name`的短名称基底新建目录项
    pub fn new(name: &str, attr: BitFlags<AttrFlag>, now: DosTime) -> Self {
        let mut dirent = Self {
            name: short_name_basis(name),
            attr,
            ..Default::default()
        };
        dirent.set_created(now);
        dirent
    }

    pub fn as_cwd(&self) -> Self {
        let mut cwd = *self;
        cwd.name = CWD_NAME;
        cwd.file_size = 0;
        cwd.ntres = 0;
        cwd
    }

    /// 创建一个指向`pid`的父目录项(..)
    pub fn new_parent(mut pid: ClusterId, root: ClusterId, now: DosTime) -> Self {
        // 若此父目录为根，则使用[`ClusterId::FREE`]
        if pid == root {
            pid = ClusterId::FREE;
        }
        let mut dirent = Self {
            name: PARENT_NAME,
            attr: AttrFlag::Directory.into(),
            ..Default::default()
        };
        dirent.set_cluster_id(pid);
        dirent.set_created(now);
        dirent
    }

    pub fn cluster_id(&self) -> ClusterId {
        (self.fst_clus_lo, self.fst_clus_hi).into()
    }

    pub fn set_cluster_id(&mut self, id: ClusterId) {
        (self.fst_clus_lo, self.fst_clus_hi) = id.split();
    }

    pub fn checksum(&self) -> u8 {
        self.name.iter().fold(0u8, |sum, &b| {
            // NOTE: The operation is an unsigned char rotate right
            (if sum & 1 != 0 { 0x80 } else { 0u8 })
                .wrapping_add(sum >> 1)
                .wrapping_add(b)
        })
    }

    pub fn is_relative(&self) -> bool {
        self.name == CWD_NAME || self.name == PARENT_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.attr.contains(AttrFlag::Directory)
    }

    /// 卷标项，不描述文件
    pub fn is_volume_label(&self) -> bool {
        self.attr.contains(AttrFlag::VolumeID) && !self.is_dir()
    }

    pub const fn size(&self) -> u32 {
        self.file_size
    }

    pub fn resize(&mut self, size: u32) {
        self.file_size = size;
    }

    pub const fn is_dirty_size(&self) -> bool {
        self.ntres & DIRTY_SIZE_MARK != 0
    }

    pub fn set_dirty_size(&mut self, dirty: bool) {
        if dirty {
            self.ntres |= DIRTY_SIZE_MARK;
        } else {
            self.ntres &= !DIRTY_SIZE_MARK;
        }
    }

    pub const fn is_symlink(&self) -> bool {
        self.ntres & SYMLINK_MARK != 0
    }

    pub fn set_symlink(&mut self) {
        self.ntres |= SYMLINK_MARK;
    }

    pub fn created(&self) -> DosTime {
        DosTime {
            date: self.crt_date,
            time: self.crt_time,
            tenth: self.crt_time_tenth,
        }
    }

    pub fn modified(&self) -> DosTime {
        DosTime {
            date: self.wrt_date,
            time: self.wrt_time,
            tenth: 0,
        }
    }

    pub fn accessed(&self) -> DosTime {
        DosTime {
            date: self.lst_acc_date,
            ..Default::default()
        }
    }

    pub fn set_created(&mut self, at: DosTime) {
        self.crt_date = at.date;
        self.crt_time = at.time;
        self.crt_time_tenth = at.tenth;
        self.set_modified(at);
    }

    pub fn set_modified(&mut self, at: DosTime) {
        self.wrt_date = at.date;
        self.wrt_time = at.time;
        self.lst_acc_date = at.date;
    }

    pub fn set_accessed(&mut self, at: DosTime) {
        self.lst_acc_date = at.date;
    }

    /// 由8.3名称还原的显示名
    pub fn short_name(&self) -> String {
        let base = trim_padding(&self.name[..8]);
        let ext = trim_padding(&self.name[8..]);
        let mut name = String::from_utf8_lossy(base).into_owned();
        if !ext.is_empty() {
            name.push('.');
            name.push_str(&String::from_utf8_lossy(ext));
        }
        name
    }

    /// 换上新名称的短名称基底，其余字段不变
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: short_name_basis(name),
            ..*self
        }
    }
}

fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1);
    &bytes[..end]
}

/// 可容纳名字的26个字节。
///
/// 目录项名称最长为255字节，所以最多用到10个长目录项。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongDirEntry {
    /// 序号（1起）
    pub ord: u8,
    name: [u8; LongDirEntry::CAP],
    /// 此项跟随的短名称目录项的校验和。
    /// 若不一致则说明发生了错误
    pub chksum: u8,
}

impl LongDirEntry {
    pub const LAST_MASK: u8 = 0b0100_0000;

    /// 可为名称容纳的字节数
    pub const CAP: usize = 26;

    #[inline]
    pub fn attr() -> BitFlags<AttrFlag> {
        AttrFlag::ReadOnly | AttrFlag::Hidden | AttrFlag::System | AttrFlag::VolumeID
    }

    pub fn decode(raw: &RawEntry) -> Self {
        let mut name = [0; Self::CAP];
        name[0..10].copy_from_slice(&raw[1..11]);
        name[10..22].copy_from_slice(&raw[14..26]);
        name[22..26].copy_from_slice(&raw[28..32]);
        Self {
            ord: raw[0],
            name,
            chksum: raw[13],
        }
    }

    pub fn encode(&self) -> RawEntry {
        let mut raw = [0; ENTRY_SIZE];
        raw[0] = self.ord;
        raw[1..11].copy_from_slice(&self.name[0..10]);
        raw[11] = Self::attr().bits();
        raw[13] = self.chksum;
        raw[14..26].copy_from_slice(&self.name[10..22]);
        raw[28..32].copy_from_slice(&self.name[22..26]);
        raw
    }

    pub const fn order(&self) -> u8 {
        self.ord & !Self::LAST_MASK
    }

    pub const fn is_last(&self) -> bool {
        self.ord & Self::LAST_MASK != 0
    }

    /// 名称片段，去掉末尾的填充
    pub fn fragment(&self) -> &[u8] {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(Self::CAP);
        &self.name[..end]
    }
}

/// 名称需要的长目录项数
pub fn long_entries_for(name: &str) -> usize {
    name.len().div_ceil(LongDirEntry::CAP)
}

/// 构造`name`的整组目录项：长目录项按磁盘顺序（序号倒序），最后是短目录项。
///
/// `short`的名称会被换成`name`的短名称基底。
pub fn name_to_entries(name: &str, short: &ShortDirEntry) -> Vec<RawEntry> {
    let short = short.renamed(name);
    let chksum = short.checksum();

    let mut entries: Vec<RawEntry> = name
        .as_bytes()
        .chunks(LongDirEntry::CAP)
        .enumerate()
        .map(|(i, bytes)| {
            let mut long = LongDirEntry {
                ord: (i + 1) as u8,
                name: [0; LongDirEntry::CAP],
                chksum,
            };
            long.name[..bytes.len()].copy_from_slice(bytes);
            long
        })
        .rev()
        .enumerate()
        .map(|(i, mut long)| {
            if i == 0 {
                long.ord |= LongDirEntry::LAST_MASK;
            }
            long.encode()
        })
        .collect();

    entries.push(short.encode());
    entries
}

/// 拼接磁盘顺序的长目录项为名称；序号或校验和不符时返回`None`
pub fn longs_to_name(longs: &[LongDirEntry], short: &ShortDirEntry) -> Option<String> {
    let chksum = short.checksum();
    let n = longs.len();
    let ordered = longs.iter().enumerate().all(|(i, long)| {
        long.chksum == chksum && usize::from(long.order()) == n - i && (i == 0) == long.is_last()
    });
    if n == 0 || !ordered {
        return None;
    }

    let bytes: Vec<u8> = longs
        .iter()
        .rev()
        .flat_map(|long| long.fragment().iter().copied())
        .collect();
    String::from_utf8(bytes).ok()
}
