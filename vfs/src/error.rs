use block_dev::DevError;
use derive_more::Display;

/// 文件系统操作对调用者可见的失败种类
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "entry already exists")]
    AlreadyExists,
    #[display(fmt = "no such entry")]
    NotFound,
    #[display(fmt = "is a directory")]
    IsADirectory,
    #[display(fmt = "not a directory")]
    NotADirectory,
    #[display(fmt = "directory not empty")]
    DirectoryNotEmpty,
    /// 没有空闲簇，或目录已无法扩展
    #[display(fmt = "no space left on volume")]
    NoSpace,
    #[display(fmt = "read-only volume")]
    ReadOnly,
    /// 对根目录的受保护操作
    #[display(fmt = "permission denied")]
    PermissionDenied,
    /// 句柄属于卷的旧挂载代
    #[display(fmt = "stale volume generation")]
    StaleGeneration,
    #[display(fmt = "I/O error")]
    Io,
    #[display(fmt = "invalid argument")]
    Invalid,
    #[display(fmt = "name too long")]
    TooLong,
    /// 扇区缓存池耗尽，属于配置错误
    #[display(fmt = "no free cache entry")]
    NoFreeCacheEntry,
    /// 介质上的结构违反约束，例如断裂的簇链
    #[display(fmt = "corrupted on-disk structure")]
    Corrupted,
}

impl From<DevError> for Error {
    fn from(_: DevError) -> Self {
        Self::Io
    }
}
