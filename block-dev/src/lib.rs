//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，实现了此特质的类型称为**块设备驱动**。
//!
//! 文件系统的扇区缓存只通过此接口访问介质，且认为每次读写都是同步完成的。

#![no_std]

extern crate alloc;

mod mem_disk;

use core::any::Any;
use core::fmt::{self, Debug, Formatter};

pub use self::mem_disk::MemDisk;

/// 块的字节数，扇区大小必须是它的整数倍
pub const BLOCK_SIZE: usize = 512;

/// 驱动报告的失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// 块号超出设备容量
    OutOfRange,
    /// 介质读写失败
    Media,
}

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError>;

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError>;

    /// 连续读取多个块，`buf`的长度必须是[`BLOCK_SIZE`]的整数倍
    fn read_blocks(&self, start: usize, buf: &mut [u8]) -> Result<(), DevError> {
        debug_assert_eq!(0, buf.len() % BLOCK_SIZE);
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.read_block(start + i, chunk)?;
        }
        Ok(())
    }

    /// 连续写入多个块，`buf`的长度必须是[`BLOCK_SIZE`]的整数倍
    fn write_blocks(&self, start: usize, buf: &[u8]) -> Result<(), DevError> {
        debug_assert_eq!(0, buf.len() % BLOCK_SIZE);
        for (i, chunk) in buf.chunks(BLOCK_SIZE).enumerate() {
            self.write_block(start + i, chunk)?;
        }
        Ok(())
    }
}

impl Debug for dyn BlockDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("BlockDevice")
    }
}
