mod common;

use btfs::dir::AttrFlag;
use btfs::{
    CloseFlag, CreateFlag, CreateFlags, Error, NodeKind, SizeSyncState, UnlinkFlags,
};
use common::small;
use vfs::{DirEntryType, DosTime};

#[test]
fn create_lookup_and_list() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();

    let file = root.create(vol, "Notes.txt", CreateFlags::empty()).unwrap();
    assert!(file.is_valid());
    assert_eq!(0, file.size());
    assert_eq!(btfs::ClusterId::FREE, file.cluster());

    let dir = root.create(vol, "src", CreateFlag::Directory.into()).unwrap();
    assert_eq!(Some(NodeKind::Directory), dir.kind());
    assert_ne!(btfs::ClusterId::FREE, dir.cluster());

    let again = root.lookup(vol, "NOTES.TXT").unwrap();
    assert!(btfs::Node::is_same_node(&file, &again));
    assert!(!btfs::Node::is_same_node(&file, &dir));
    assert_eq!(Some("Notes.txt".into()), again.name());

    assert_eq!(
        Some(Error::AlreadyExists),
        root.create(vol, "notes.TXT", CreateFlags::empty()).err()
    );
    assert_eq!(Some(Error::NotFound), root.lookup(vol, "missing").err());
    assert_eq!(Some(Error::NotADirectory), file.lookup(vol, "x").err());
    assert_eq!(Some(Error::Invalid), root.lookup(vol, "a:b").err());

    let names: Vec<_> = root
        .readdir(vol, 0, 16)
        .unwrap()
        .into_iter()
        .map(|e| (e.name, e.ty))
        .collect();
    assert_eq!(
        vec![
            ("Notes.txt".to_string(), DirEntryType::Regular),
            ("src".to_string(), DirEntryType::Directory),
        ],
        names
    );
    // 新目录只有`.`与`..`
    assert!(dir.readdir(vol, 0, 16).unwrap().is_empty());
}

#[test]
fn long_names_span_entries() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let name = "a rather long file name that needs several entries.data";
    root.create(vol, name, CreateFlags::empty()).unwrap();
    let found = root.lookup(vol, name).unwrap();
    assert_eq!(Some(name.to_string()), found.name());
}

#[test]
fn directory_grows_when_full() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    // 512字节的簇只有16个目录项，每个文件占两个
    for i in 0..20 {
        root.create(vol, &format!("file{i}"), CreateFlags::empty()).unwrap();
    }
    assert!(fx.chain_len(root.cluster()) >= 3);
    assert_eq!(20, root.readdir(vol, 0, 100).unwrap().len());
    assert_eq!(5, root.readdir(vol, 15, 100).unwrap().len());
    root.lookup(vol, "file19").unwrap();
}

#[test]
fn nested_directories() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let a = root.create(vol, "a", CreateFlag::Directory.into()).unwrap();
    let b = a.create(vol, "b", CreateFlag::Directory.into()).unwrap();
    b.create(vol, "leaf", CreateFlags::empty()).unwrap();

    assert_eq!(Some(a.cluster()), b.parent_cluster());
    assert_eq!(a.cluster(), btfs::dir::parent_of(vol, b.cluster()).unwrap());
    assert_eq!(
        vol.geometry().root_cluster,
        btfs::dir::parent_of(vol, a.cluster()).unwrap()
    );
    let leaf = a.lookup(vol, "b").unwrap().lookup(vol, "leaf").unwrap();
    assert_eq!(Some(NodeKind::File), leaf.kind());
}

#[test]
fn sixty_four_kib_write_then_sync() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let node = root.create(vol, "A.TXT", CreateFlags::empty()).unwrap();
    assert_eq!((0, btfs::ClusterId::FREE), (node.size(), node.cluster()));
    node.open(vol, 1).unwrap();

    let data: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(65536, node.write_at(vol, 0, &data).unwrap());
    let cluster_bytes = vol.geometry().cluster_bytes();
    assert_eq!(65536usize.div_ceil(cluster_bytes), fx.chain_len(node.cluster()));
    assert_eq!(SizeSyncState::DirtyPendingFlush, node.size_state());

    let pos = node.entry_position().unwrap();
    assert!(fx.entry_on_disk(pos).is_dirty_size());

    node.sync(vol, 65536).unwrap();
    let entry = fx.entry_on_disk(pos);
    assert!(!entry.is_dirty_size());
    assert_eq!(65536, entry.size());
    assert_eq!(node.cluster(), entry.cluster_id());
    assert_eq!(SizeSyncState::Clean, node.size_state());

    let mut back = vec![0; 65536];
    assert_eq!(65536, node.read_at(vol, 0, &mut back).unwrap());
    assert_eq!(data, back);
}

#[test]
fn extending_writes_touch_the_entry_once() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "log", CreateFlags::empty()).unwrap();
    node.open(vol, 7).unwrap();
    let block = fx.entry_block(node.entry_position().unwrap());
    let before = fx.disk.writes_to(block);

    node.write_at(vol, 0, &[1; 100]).unwrap();
    node.write_at(vol, 100, &[2; 100]).unwrap();
    node.write_at(vol, 200, &[3; 1000]).unwrap();
    node.write_at(vol, 1200, &[4; 3000]).unwrap();
    assert_eq!(4200, node.size());
    assert_eq!(before + 1, fx.disk.writes_to(block));

    node.flush(vol).unwrap();
    assert_eq!(before + 2, fx.disk.writes_to(block));
    assert_eq!(4200, fx.entry_on_disk(node.entry_position().unwrap()).size());

    node.flush(vol).unwrap();
    assert_eq!(before + 2, fx.disk.writes_to(block));
}

#[test]
fn sync_below_memory_size_keeps_marker() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "grow", CreateFlags::empty()).unwrap();
    node.open(vol, 1).unwrap();
    node.write_at(vol, 0, &[9; 1000]).unwrap();
    let pos = node.entry_position().unwrap();

    node.sync(vol, 500).unwrap();
    let entry = fx.entry_on_disk(pos);
    assert_eq!(500, entry.size());
    assert!(entry.is_dirty_size());
    assert_eq!(1000, node.size());
    assert_eq!(SizeSyncState::DirtyPendingFlush, node.size_state());

    node.close(vol, CloseFlag::Sync | CloseFlag::DecReference).unwrap();
    let entry = fx.entry_on_disk(pos);
    assert_eq!(1000, entry.size());
    assert!(!entry.is_dirty_size());
}

#[test]
fn closed_files_do_not_use_the_marker() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "plain", CreateFlags::empty()).unwrap();
    node.write_at(vol, 0, b"hello").unwrap();
    assert_eq!(SizeSyncState::Clean, node.size_state());
    node.flush(vol).unwrap();
    let entry = fx.entry_on_disk(node.entry_position().unwrap());
    assert_eq!(5, entry.size());
    assert!(!entry.is_dirty_size());
}

#[test]
fn marker_found_on_read_only_volume_awaits_recovery() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "journal", CreateFlags::empty()).unwrap();
    node.open(vol, 1).unwrap();
    node.write_at(vol, 0, &[1; 100]).unwrap();
    node.write_at(vol, 100, &[2; 2900]).unwrap();
    // 模拟崩溃：数据与FAT写回，目录项仍带着标记
    vol.sync(btfs::CacheFlags::empty()).unwrap();

    vol.remount(true);
    assert_eq!(Some(Error::StaleGeneration), node.get_status(vol).err());
    let seen = vol.root().lookup(vol, "journal").unwrap();
    assert_eq!(SizeSyncState::DirtyAwaitingRecovery, seen.size_state());
    assert_eq!(100, seen.size());
    assert_eq!(Some(Error::ReadOnly), seen.write_at(vol, 0, b"x").err());
    assert_eq!(Some(Error::ReadOnly), seen.recover_dirty_size(vol).err());

    vol.remount(false);
    let seen = vol.root().lookup(vol, "journal").unwrap();
    assert_eq!(SizeSyncState::DirtyPendingFlush, seen.size_state());
    assert_eq!(100, seen.recover_dirty_size(vol).unwrap());
    assert_eq!(SizeSyncState::Clean, seen.size_state());
    assert!(!fx.entry_on_disk(seen.entry_position().unwrap()).is_dirty_size());
}

#[test]
fn stale_handles_fail_safely() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let node = root.create(vol, "old", CreateFlags::empty()).unwrap();
    vol.sync(btfs::CacheFlags::empty()).unwrap();

    vol.remount(false);
    assert_eq!(Some(Error::StaleGeneration), node.write_at(vol, 0, b"x").err());
    assert_eq!(Some(Error::StaleGeneration), node.sync(vol, 0).err());
    assert_eq!(Some(Error::StaleGeneration), root.lookup(vol, "old").err());
    assert_eq!(
        Some(Error::StaleGeneration),
        root.create(vol, "new", CreateFlags::empty()).err()
    );
    node.close(vol, CloseFlag::ReleaseResource.into()).unwrap();
    assert!(!node.is_valid());

    vol.root().lookup(vol, "old").unwrap();
}

#[test]
fn status_round_trip() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let node = root.create(vol, "stat.bin", CreateFlags::empty()).unwrap();
    node.write_at(vol, 0, &[0; 700]).unwrap();

    let mut st = node.get_status(vol).unwrap();
    assert_eq!(DirEntryType::Regular, st.mode);
    assert_eq!(700, st.size);
    assert_eq!(2, st.blocks);

    let stamp = DosTime {
        date: (44 << 9) | (5 << 5) | 17,
        time: (13 << 11) | (30 << 5),
        tenth: 0,
    };
    st.attr = (AttrFlag::ReadOnly | AttrFlag::Archive).bits();
    st.mtime = stamp;
    node.set_status(vol, &st).unwrap();

    let after = node.get_status(vol).unwrap();
    assert_eq!(st.attr, after.attr);
    assert_eq!(stamp, after.mtime);

    st.mode = DirEntryType::Directory;
    assert_eq!(Some(Error::Invalid), node.set_status(vol, &st).err());
    let root_st = root.get_status(vol).unwrap();
    assert_eq!(Some(Error::PermissionDenied), root.set_status(vol, &root_st).err());
}

#[test]
fn symlinks_report_their_kind() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let link = root.create(vol, "link", CreateFlag::SymLink.into()).unwrap();
    link.write_at(vol, 0, b"target/path").unwrap();
    assert_eq!(DirEntryType::SymLink, link.get_status(vol).unwrap().mode);

    let seen = root.lookup(vol, "link").unwrap();
    assert_eq!(Some(NodeKind::SymLink), seen.kind());
    assert_eq!(
        Some(Error::Invalid),
        root.create(vol, "bad", CreateFlag::Directory | CreateFlag::SymLink).err()
    );
}

#[test]
fn writes_past_the_end_leave_zeroes() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "sparse", CreateFlags::empty()).unwrap();
    node.write_at(vol, 0, &[0xFF; 1500]).unwrap();
    node.truncate(vol, 10).unwrap();
    assert_eq!(1, fx.chain_len(node.cluster()));

    node.write_at(vol, 1300, b"tail").unwrap();
    assert_eq!(1304, node.size());
    let mut buf = vec![0xAA; 1304];
    assert_eq!(1304, node.read_at(vol, 0, &mut buf).unwrap());
    assert!(buf[..10].iter().all(|&b| b == 0xFF));
    assert!(buf[10..1300].iter().all(|&b| b == 0));
    assert_eq!(b"tail", &buf[1300..]);

    // 越过末尾的读取什么也读不到
    assert_eq!(0, node.read_at(vol, 5000, &mut buf).unwrap());
}

#[test]
fn truncate_frees_and_extends() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "t", CreateFlags::empty()).unwrap();
    let free = fx.free_clusters();
    node.write_at(vol, 0, &[7; 2048]).unwrap();
    assert_eq!(free - 4, fx.free_clusters());

    node.truncate(vol, 3000).unwrap();
    assert_eq!(6, fx.chain_len(node.cluster()));
    let mut buf = vec![1; 952];
    node.read_at(vol, 2048, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    node.truncate(vol, 0).unwrap();
    assert_eq!(btfs::ClusterId::FREE, node.cluster());
    assert_eq!(free, fx.free_clusters());
    node.flush(vol).unwrap();
    let entry = fx.entry_on_disk(node.entry_position().unwrap());
    assert_eq!((0, btfs::ClusterId::FREE), (entry.size(), entry.cluster_id()));

    let dir = vol.root().create(vol, "d", CreateFlag::Directory.into()).unwrap();
    assert_eq!(Some(Error::IsADirectory), dir.truncate(vol, 0).err());
}

#[test]
fn short_volume_allows_partial_writes() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let hog = root.create(vol, "hog", CreateFlags::empty()).unwrap();
    let late = root.create(vol, "late", CreateFlags::empty()).unwrap();

    let free = fx.free_clusters();
    let bytes = (free - 2) * 512;
    assert_eq!(bytes, hog.write_at(vol, 0, &vec![1; bytes]).unwrap());
    assert_eq!(2, fx.free_clusters());

    assert_eq!(1024, late.write_at(vol, 0, &[2; 4 * 512]).unwrap());
    assert_eq!(1024, late.size());
    assert_eq!(Some(Error::NoSpace), late.write_at(vol, 1024, &[3; 10]).err());
    assert_eq!(
        Some(Error::NoSpace),
        root.create(vol, "dir", CreateFlag::Directory.into()).err()
    );
}

#[test]
fn read_only_volume_refuses_changes() {
    let fx = small();
    let vol = &fx.vol;
    vol.root().create(vol, "keep", CreateFlags::empty()).unwrap();
    vol.sync(btfs::CacheFlags::empty()).unwrap();
    vol.remount(true);

    let root = vol.root();
    let keep = root.lookup(vol, "keep").unwrap();
    assert_eq!(Some(Error::ReadOnly), root.create(vol, "x", CreateFlags::empty()).err());
    assert_eq!(Some(Error::ReadOnly), root.unlink(vol, &keep, UnlinkFlags::empty()).err());
    assert_eq!(Some(Error::ReadOnly), keep.truncate(vol, 1).err());
    keep.sync(vol, 0).unwrap();
}

#[test]
fn open_counts_references() {
    let fx = small();
    let vol = &fx.vol;
    let node = vol.root().create(vol, "refs", CreateFlags::empty()).unwrap();
    node.open(vol, 42).unwrap();
    node.open(vol, 42).unwrap();
    assert_eq!(2, node.refs());
    assert_eq!(Some(42), node.handle());

    node.close(vol, CloseFlag::DecReference.into()).unwrap();
    assert!(node.flags().contains(btfs::NodeFlag::Open));
    node.close(vol, CloseFlag::DecReference | CloseFlag::ReleaseResource)
        .unwrap();
    assert!(!node.is_valid());
    // 重复关闭什么也不做
    node.close(vol, CloseFlag::DecReference | CloseFlag::ReleaseResource)
        .unwrap();
}
