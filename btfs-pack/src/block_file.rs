use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use block_dev::{BLOCK_SIZE, BlockDevice, DevError};
use send_wrapper::SendWrapper;

/// 以宿主文件充当块设备
#[derive(Debug)]
pub struct BlockFile {
    inner: SendWrapper<RefCell<File>>,
    blocks: usize,
}

impl BlockFile {
    pub fn new(fd: File, bytes: u64) -> Self {
        Self {
            inner: SendWrapper::new(RefCell::new(fd)),
            blocks: bytes as usize / BLOCK_SIZE,
        }
    }

    fn seek(&self, file: &mut File, block_id: usize) -> Result<(), DevError> {
        if block_id >= self.blocks {
            return Err(DevError::OutOfRange);
        }
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .map_err(|e| {
                log::error!("Failed to seek to block {block_id}: {e}");
                DevError::Media
            })?;
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> Result<(), DevError> {
        let mut file = self.inner.borrow_mut();
        self.seek(&mut file, block_id)?;
        file.read_exact(&mut buf[..BLOCK_SIZE]).map_err(|e| {
            log::error!("Failed to read block {block_id}: {e}");
            DevError::Media
        })
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> Result<(), DevError> {
        let mut file = self.inner.borrow_mut();
        self.seek(&mut file, block_id)?;
        file.write_all(&buf[..BLOCK_SIZE]).map_err(|e| {
            log::error!("Failed to write block {block_id}: {e}");
            DevError::Media
        })
    }
}
