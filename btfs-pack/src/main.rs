mod block_file;
mod cli;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use block_dev::BlockDevice;
use btfs::{
    CacheConfig, CloseFlag, CreateFlag, CreateFlags, FormatOptions, MountOptions, Node, NodeKind,
    SectorCache, Volume, VolumeId,
};
use clap::Parser;
use typed_bytesize::ByteSizeIec;

pub use self::{block_file::BlockFile, cli::Cli};

/// 一次写入的字节数
const CHUNK: usize = 64 * 1024;

fn fs_err(e: btfs::Error) -> io::Error {
    io::Error::other(e.to_string())
}

fn main() -> io::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    println!("source={:?}\nimage={:?}", cli.source, cli.image);

    let disk_size = ByteSizeIec::mib(cli.size_mib).0;
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.image)?;
    fd.set_len(disk_size)?;

    let block_dev: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd, disk_size));
    let opts = FormatOptions {
        cluster_sectors: cli.cluster_sectors,
        ..Default::default()
    };
    let geo = btfs::format(&*block_dev, disk_size as usize, opts).map_err(fs_err)?;
    log::info!("Formatted {} clusters of {} bytes", geo.cluster_count, geo.cluster_bytes());

    let cache = Arc::new(SectorCache::new(CacheConfig {
        entries: cli.cache_entries,
        ..Default::default()
    }));
    let vol = Volume::mount(VolumeId::new(0), block_dev.clone(), cache.clone(), MountOptions::default())
        .map_err(fs_err)?;
    let root = vol.root();
    let packed = pack_dir(&vol, &root, &cli.source)?;
    vol.unmount().map_err(fs_err)?;
    println!("packed {packed} files");

    if cli.read_back {
        let opts = MountOptions { read_only: true };
        let vol = Volume::mount(VolumeId::new(1), block_dev, cache, opts).map_err(fs_err)?;
        let root = vol.root();
        let checked = check_dir(&vol, &root, &cli.source)?;
        vol.unmount().map_err(fs_err)?;
        println!("verified {checked} files");
    }

    Ok(())
}

/// 把宿主目录递归写入`dir`，返回写入的文件数
fn pack_dir(vol: &Volume, dir: &Node, host: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(host)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            log::warn!("Skipping non UTF-8 name {name:?}");
            continue;
        };
        let ty = entry.file_type()?;

        if ty.is_dir() {
            let sub = dir
                .create(vol, name, CreateFlag::Directory.into())
                .map_err(fs_err)?;
            count += pack_dir(vol, &sub, &entry.path())?;
            sub.close(vol, CloseFlag::Sync | CloseFlag::ReleaseResource)
                .map_err(fs_err)?;
        } else if ty.is_file() {
            log::info!("file={name:?}");
            let node = dir.create(vol, name, CreateFlags::empty()).map_err(fs_err)?;
            node.open(vol, count as u64).map_err(fs_err)?;
            copy_in(vol, &node, &entry.path())?;
            node.close(vol, CloseFlag::Sync | CloseFlag::DecReference | CloseFlag::ReleaseResource)
                .map_err(fs_err)?;
            count += 1;
        } else {
            log::warn!("Skipping {name:?}: neither a file nor a directory");
        }
    }
    Ok(count)
}

fn copy_in(vol: &Volume, node: &Node, host: &Path) -> io::Result<()> {
    let mut file = File::open(host)?;
    let mut buf = vec![0; CHUNK];
    let mut offset = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut done = 0;
        while done < n {
            done += node
                .write_at(vol, offset + done as u64, &buf[done..n])
                .map_err(fs_err)?;
        }
        offset += n as u64;
        node.flush(vol).map_err(fs_err)?;
    }
    Ok(())
}

/// 逐个比较镜像中的文件与宿主文件，返回比较过的文件数
fn check_dir(vol: &Volume, dir: &Node, host: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(host)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let ty = entry.file_type()?;
        if !ty.is_dir() && !ty.is_file() {
            continue;
        }

        let node = dir.lookup(vol, name).map_err(fs_err)?;
        match node.kind() {
            Some(NodeKind::Directory) => count += check_dir(vol, &node, &entry.path())?,
            _ => {
                let expected = fs::read(entry.path())?;
                let mut actual = vec![0; node.size() as usize];
                let n = node.read_at(vol, 0, &mut actual).map_err(fs_err)?;
                if n != expected.len() || actual[..n] != expected[..] {
                    return Err(io::Error::other(format!("{name:?} differs from the host copy")));
                }
                count += 1;
            }
        }
    }
    Ok(count)
}
