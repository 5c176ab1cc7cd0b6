mod common;

use std::thread;

use btfs::{CloseFlag, CreateFlags, Node};
use common::small;

#[test]
fn parallel_creates_get_distinct_entries() {
    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();

    thread::scope(|s| {
        for t in 0..4 {
            let root = &root;
            s.spawn(move || {
                for i in 0..8 {
                    let node = root.create(vol, &format!("t{t}_{i}"), CreateFlags::empty()).unwrap();
                    node.close(vol, CloseFlag::ReleaseResource.into()).unwrap();
                }
            });
        }
    });

    let listed = root.readdir(vol, 0, 100).unwrap();
    assert_eq!(32, listed.len());
    let mut inodes: Vec<_> = listed.iter().map(|e| e.inode).collect();
    inodes.sort_unstable();
    inodes.dedup();
    assert_eq!(32, inodes.len());
}

#[test]
fn parallel_writers_keep_their_data() {
    const CHUNK: usize = 700;
    const CHUNKS: usize = 8;

    let fx = small();
    let vol = &fx.vol;
    let root = vol.root();
    let nodes: Vec<Node> = (0..4)
        .map(|t| root.create(vol, &format!("w{t}"), CreateFlags::empty()).unwrap())
        .collect();
    let free = fx.free_clusters();

    thread::scope(|s| {
        for (t, node) in nodes.iter().enumerate() {
            s.spawn(move || {
                node.open(vol, t as u64).unwrap();
                let data = [t as u8 + 1; CHUNK];
                for i in 0..CHUNKS {
                    assert_eq!(CHUNK, node.write_at(vol, (i * CHUNK) as u64, &data).unwrap());
                }
                node.close(vol, CloseFlag::Sync | CloseFlag::DecReference).unwrap();
            });
        }
    });

    let per_file = (CHUNK * CHUNKS).div_ceil(512);
    assert_eq!(free - 4 * per_file, fx.free_clusters());
    for (t, node) in nodes.iter().enumerate() {
        let seen = root.lookup(vol, &format!("w{t}")).unwrap();
        assert_eq!((CHUNK * CHUNKS) as u32, seen.size());
        assert_eq!(per_file, fx.chain_len(seen.cluster()));
        assert_eq!(node.cluster(), seen.cluster());

        let mut buf = vec![0; CHUNK * CHUNKS];
        assert_eq!(buf.len(), seen.read_at(vol, 0, &mut buf).unwrap());
        assert!(buf.iter().all(|&b| b == t as u8 + 1));
    }
}
