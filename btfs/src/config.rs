//! 编译期默认值
//!
//! 运行期配置以显式的值传入：[`CacheConfig`](crate::CacheConfig)、
//! [`MountOptions`](crate::MountOptions)、[`FormatOptions`](crate::FormatOptions)。

pub use block_dev::BLOCK_SIZE;

/// 扇区缓存池的默认条目数
pub const CACHE_ENTRIES: usize = 64;

/// `sync_volume`/`sync_node` 每批写回的脏条目上限
pub const SYNC_BATCH: usize = 16;

/// 目录项名称的最大字节数
pub const MAX_NAME_LEN: usize = 255;

/// 短目录项保留字节中的脏尺寸标记位
pub const DIRTY_SIZE_MARK: u8 = 0x80;

/// 短目录项保留字节中的符号链接标记位
pub const SYMLINK_MARK: u8 = 0x40;
