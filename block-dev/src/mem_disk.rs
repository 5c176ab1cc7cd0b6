use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{BLOCK_SIZE, BlockDevice, DevError};

/// 内存盘
///
/// 主机工具与测试使用的块设备，会统计每个块被写入的次数，
/// 并可以随时注入读写故障。
#[derive(Debug)]
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<u32>>,
    total_writes: AtomicUsize,
    total_reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemDisk {
    pub fn new(bytes: usize) -> Self {
        let blocks = bytes.div_ceil(BLOCK_SIZE);
        Self {
            data: Mutex::new(vec![0; blocks * BLOCK_SIZE]),
            writes: Mutex::new(vec![0; blocks]),
            total_writes: AtomicUsize::new(0),
            total_reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn blocks(&self) -> usize {
        self.writes.lock().len()
    }

    /// 此后的读操作全部失败（或恢复）
    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    /// 此后的写操作全部失败（或恢复）
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// `block_id`被写入的次数
    pub fn writes_to(&self, block_id: usize) -> u32 {
        self.writes.lock().get(block_id).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.total_writes.load(Ordering::SeqCst)
    }

    pub fn total_reads(&self) -> usize {
        self.total_reads.load(Ordering::SeqCst)
    }

    /// 介质上`block_id`的当前内容
    pub fn snapshot(&self, block_id: usize) -> Vec<u8> {
        let start = block_id * BLOCK_SIZE;
        self.data.lock()[start..start + BLOCK_SIZE].to_vec()
    }

    fn range(&self, block_id: usize, len: usize) -> Result<core::ops::Range<usize>, DevError> {
        let start = block_id * BLOCK_SIZE;
        let end = start + len;
        if len % BLOCK_SIZE != 0 || end > self.data.lock().len() {
            return Err(DevError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DevError::Media);
        }
        let range = self.range(block_id, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        self.total_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DevError::Media);
        }
        let range = self.range(block_id, buf.len())?;
        self.data.lock()[range].copy_from_slice(buf);

        let mut writes = self.writes.lock();
        let blocks = buf.len() / BLOCK_SIZE;
        for counter in &mut writes[block_id..block_id + blocks] {
            *counter += 1;
        }
        self.total_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
