//! # btfs
//!
//! FAT32兼容文件系统的元数据引擎：扇区缓存、簇链与目录项的维护，
//! 以及节点的创建、删除、重命名与尺寸同步。
//!
//! 卷的层次：
//!
//! ```text
//! Node ── dir ── SectorCache ── BlockDevice
//!   └──── ClusterAllocator ──┘
//! ```

#![no_std]

extern crate alloc;

pub mod bitmap;
pub mod cache;
mod cluster;
pub mod config;
pub mod dir;
pub mod hooks;
pub mod node;
mod sector;
pub mod volume;

pub use vfs::Error;

pub use self::{
    cache::{CacheConfig, CacheFlag, CacheFlags, OwnerTag, SectorCache, SectorRef},
    cluster::{ClusterError, ClusterId, ClusterRun, ClusterVector},
    hooks::{Addon, AddonAction, Clock, FixedClock, Journal, LogOp, NullAddon, NullJournal},
    node::{
        CloseFlag, CloseFlags, CreateFlag, CreateFlags, Node, NodeFlag, NodeFlags, NodeInfo,
        NodeKind, SizeSyncState, UnlinkFlag, UnlinkFlags, UpdateFlag, UpdateFlags, rename,
    },
    sector::SectorId,
    volume::{
        ClusterAllocator, FatAllocator, FormatOptions, Geometry, MountOptions, Volume, VolumeId,
        format,
    },
};

pub type Result<T> = core::result::Result<T, Error>;
