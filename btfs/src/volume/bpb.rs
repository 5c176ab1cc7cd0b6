//! BIOS Parameter Block BIOS参数块
//!
//! 位于保留区的第一扇区，该扇区又名启动扇区。
//! 只解析FAT32布局所需的字段，按偏移逐一以小端序读写。

use crate::{ClusterId, Error, Result, SectorId};

/// 字段偏移
mod off {
    pub const JMP_BOOT: usize = 0;
    pub const OEM_NAME: usize = 3;
    pub const BYTS_PER_SEC: usize = 11;
    pub const SEC_PER_CLUS: usize = 13;
    pub const RSVD_SEC_CNT: usize = 14;
    pub const NUM_FATS: usize = 16;
    pub const MEDIA: usize = 21;
    pub const TOT_SEC32: usize = 32;
    pub const FAT_SZ32: usize = 36;
    pub const EXT_FLAGS: usize = 40;
    pub const ROOT_CLUS: usize = 44;
    pub const FS_INFO: usize = 48;
    pub const BK_BOOT_SEC: usize = 50;
    pub const DRV_NUM: usize = 64;
    pub const BOOT_SIG: usize = 66;
    pub const VOL_LAB: usize = 71;
    pub const FIL_SYS_TYPE: usize = 82;
    pub const SIGNATURE_WORD: usize = 510;
}

const MEDIA_FIXED: u8 = 0xF8;
const BOOT_SIG_SET: u8 = 0x29;

/// Bits 0-3  -- Zero-based number of active FAT. Only valid if mirroring is disabled.
/// Bit  7    -- 0 means the FAT is mirrored at runtime into all FATs;
///              1 means only one FAT is active; it is the one referenced in bits 0-3.
const EXT_NO_MIRRORING: u16 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bpb {
    /// 一个扇区的字节量
    pub byts_per_sec: u16,
    /// 一个簇的扇区数
    pub sec_per_clus: u8,
    /// 保留区的扇区数
    pub rsvd_sec_cnt: u16,
    /// 此卷的文件分配表(FAT)数量，建议为2
    pub num_fats: u8,
    /// 此卷的扇区总数
    pub tot_sec32: u32,
    /// 单个FAT占用扇区数
    pub fat_sz32: u32,
    pub ext_flags: u16,
    /// 根目录首个簇的编号，应该为2
    pub root_clus: u32,
    /// FSINFO所在扇区号，通常为1
    pub fs_info: u16,
    /// 启动扇区备份所在扇区号，恒为6
    pub bk_boot_sec: u16,
}

/* 扇区剩余部分皆填0x00 */

#[derive(Debug)]
struct DiskSz2SecPerClus {
    base: [(usize, u8); 6],
}

impl DiskSz2SecPerClus {
    fn get(&self, disk_sectors: usize) -> u8 {
        self.base
            .iter()
            .find(|(dsz, _)| disk_sectors <= *dsz)
            .unwrap_or(&self.base[5])
            .1
    }
}

// NOTE: 小于32.5 MiB的卷规范上不该是FAT32，这里仍以单扇区簇格式化
#[rustfmt::skip]
static DS2SPC: DiskSz2SecPerClus = DiskSz2SecPerClus {
    base: [
        (66600,      1),   // <= 32.5 MiB => 0.5k cluster
        (532480,     1),   // <= 260  MiB => 0.5k cluster
        (16777216,   8),   // <= 8    GiB => 4k   cluster
        (33554432,   16),  // <= 16   GB  => 8k   cluster
        (67108864,   32),  // <= 32   GB  => 16k  cluster
        (usize::MAX, 64),  // >  32   GB  => 32k  cluster
    ],
};

impl Bpb {
    /// 为`total_sectors`个扇区的卷生成参数块
    pub fn new(
        total_sectors: usize,
        sector_bytes: usize,
        cluster_sectors: Option<usize>,
        fat_count: usize,
        mirroring: bool,
    ) -> Result<Self> {
        if !matches!(sector_bytes, 512 | 1024 | 2048 | 4096) {
            log::error!("Unsupported sector size {sector_bytes}");
            return Err(Error::Invalid);
        }
        let sec_per_clus = match cluster_sectors {
            Some(n) if n.is_power_of_two() && n <= 128 => n as u8,
            Some(n) => {
                log::error!("Unsupported cluster size of {n} sectors");
                return Err(Error::Invalid);
            }
            None => DS2SPC.get(total_sectors * sector_bytes / 512),
        };
        if !(1..=4).contains(&fat_count) {
            return Err(Error::Invalid);
        }
        let tot_sec32 = u32::try_from(total_sectors).map_err(|_| Error::Invalid)?;

        let mut bpb = Self {
            byts_per_sec: sector_bytes as u16,
            sec_per_clus,
            rsvd_sec_cnt: 32,
            num_fats: fat_count as u8,
            tot_sec32,
            fat_sz32: 0,
            ext_flags: if mirroring { 0 } else { EXT_NO_MIRRORING },
            root_clus: ClusterId::MIN.raw(),
            fs_info: 1,
            bk_boot_sec: 6,
        };
        bpb.set_fat_size();

        if bpb.total_clusters() < 1 || bpb.data_area().raw() >= total_sectors {
            log::error!("Volume of {total_sectors} sectors is too small");
            return Err(Error::NoSpace);
        }
        Ok(bpb)
    }

    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 512 || sector[off::SIGNATURE_WORD..off::SIGNATURE_WORD + 2] != [0x55, 0xAA]
        {
            log::error!("Missing boot sector signature");
            return Err(Error::Corrupted);
        }

        let bpb = Self {
            byts_per_sec: le_u16(sector, off::BYTS_PER_SEC),
            sec_per_clus: sector[off::SEC_PER_CLUS],
            rsvd_sec_cnt: le_u16(sector, off::RSVD_SEC_CNT),
            num_fats: sector[off::NUM_FATS],
            tot_sec32: le_u32(sector, off::TOT_SEC32),
            fat_sz32: le_u32(sector, off::FAT_SZ32),
            ext_flags: le_u16(sector, off::EXT_FLAGS),
            root_clus: le_u32(sector, off::ROOT_CLUS),
            fs_info: le_u16(sector, off::FS_INFO),
            bk_boot_sec: le_u16(sector, off::BK_BOOT_SEC),
        };
        bpb.validate()?;
        Ok(bpb)
    }

    /// 写入整个启动扇区
    pub fn encode(&self, sector: &mut [u8]) {
        sector.fill(0);
        sector[off::JMP_BOOT..off::JMP_BOOT + 3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        sector[off::OEM_NAME..off::OEM_NAME + 8].copy_from_slice(b"BTFS    ");
        put_u16(sector, off::BYTS_PER_SEC, self.byts_per_sec);
        sector[off::SEC_PER_CLUS] = self.sec_per_clus;
        put_u16(sector, off::RSVD_SEC_CNT, self.rsvd_sec_cnt);
        sector[off::NUM_FATS] = self.num_fats;
        sector[off::MEDIA] = MEDIA_FIXED;
        put_u32(sector, off::TOT_SEC32, self.tot_sec32);
        put_u32(sector, off::FAT_SZ32, self.fat_sz32);
        put_u16(sector, off::EXT_FLAGS, self.ext_flags);
        put_u32(sector, off::ROOT_CLUS, self.root_clus);
        put_u16(sector, off::FS_INFO, self.fs_info);
        put_u16(sector, off::BK_BOOT_SEC, self.bk_boot_sec);
        sector[off::DRV_NUM] = 0x80;
        sector[off::BOOT_SIG] = BOOT_SIG_SET;
        sector[off::VOL_LAB..off::VOL_LAB + 11].copy_from_slice(b"NO NAME    ");
        sector[off::FIL_SYS_TYPE..off::FIL_SYS_TYPE + 8].copy_from_slice(b"FAT32   ");
        sector[off::SIGNATURE_WORD..off::SIGNATURE_WORD + 2].copy_from_slice(&[0x55, 0xAA]);
    }

    pub const fn sector_bytes(&self) -> usize {
        self.byts_per_sec as usize
    }

    pub const fn cluster_sectors(&self) -> usize {
        self.sec_per_clus as usize
    }

    pub const fn fat_area(&self) -> SectorId {
        SectorId::new(self.rsvd_sec_cnt as usize)
    }

    pub const fn fat_count(&self) -> usize {
        self.num_fats as usize
    }

    /// 单个FAT占用的扇区数
    pub const fn fat_sectors(&self) -> usize {
        self.fat_sz32 as usize
    }

    pub fn data_area(&self) -> SectorId {
        self.fat_area() + self.fat_count() * self.fat_sectors()
    }

    pub const fn total_sectors(&self) -> usize {
        self.tot_sec32 as usize
    }

    pub fn total_clusters(&self) -> usize {
        self.total_sectors().saturating_sub(self.data_area().raw()) / self.cluster_sectors()
    }

    pub const fn mirroring(&self) -> bool {
        self.ext_flags & EXT_NO_MIRRORING == 0
    }

    pub const fn root_cluster(&self) -> ClusterId {
        ClusterId::new(self.root_clus)
    }
}

impl Bpb {
    fn validate(&self) -> Result<()> {
        let ok = matches!(self.byts_per_sec, 512 | 1024 | 2048 | 4096)
            && self.sec_per_clus.is_power_of_two()
            && self.rsvd_sec_cnt > 0
            && self.num_fats > 0
            && self.fat_sz32 > 0
            && self.data_area().raw() < self.total_sectors()
            && self.root_cluster().validate().is_ok();
        if !ok {
            log::error!("Invalid boot sector: {self:?}");
            return Err(Error::Corrupted);
        }

        // FAT必须能覆盖所有簇
        let fat_entries = self.fat_sectors() * self.sector_bytes() / 4;
        if fat_entries < self.total_clusters() + 2 {
            log::error!("FAT of {fat_entries} entries cannot cover the data area");
            return Err(Error::Corrupted);
        }
        Ok(())
    }

    /// 计算FAT占用扇区数并设置
    fn set_fat_size(&mut self) {
        let tmp1 = self.total_sectors() - self.rsvd_sec_cnt as usize;
        let entries_per_sector = self.sector_bytes() / 4;
        let tmp2 = entries_per_sector * self.cluster_sectors() + self.fat_count() / 2;
        self.fat_sz32 = tmp1.div_ceil(tmp2) as u32;

        // 两个保留条目也占FAT空间
        while self.fat_sectors() * entries_per_sector < self.total_clusters() + 2 {
            self.fat_sz32 += 1;
        }
    }
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_u16(buf: &mut [u8], at: usize, val: u16) {
    buf[at..at + 2].copy_from_slice(&val.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
}
