use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use sector_fs::block_cache;
use sector_fs::vfs;
use sector_fs::BlockDevice;
use sector_fs::FreeMap;
use sector_fs::Inode;
use sector_fs::SECTOR_SIZE;

use crate::BlockFile;
use crate::FreeList;

/// The sector cache and the open-inode table are process-wide,
/// so tests touching them must not interleave.
static ENGINE: Mutex<()> = Mutex::new(());

const FREE_START: u32 = 100;
const FREE_SECTORS: u32 = 12_000;
const IMAGE_SECTORS: usize = (FREE_START + FREE_SECTORS) as usize + 64;

struct Fixture {
    device: Arc<dyn BlockDevice>,
    free_list: Arc<FreeList>,
    image: PathBuf,
    _guard: MutexGuard<'static, ()>,
}

fn setup(name: &str) -> Fixture {
    let guard = ENGINE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let image = std::env::temp_dir().join(format!("sector-fs-{name}.img"));
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&image)
        .unwrap();
    fd.set_len((IMAGE_SECTORS * SECTOR_SIZE) as u64).unwrap();

    // fresh pool and table, discarding whatever the previous test left behind
    block_cache::init();
    vfs::init();

    Fixture {
        device: Arc::new(BlockFile(Mutex::new(fd))),
        free_list: Arc::new(FreeList::new(FREE_START, FREE_SECTORS)),
        image,
        _guard: guard,
    }
}

impl Fixture {
    fn free_map(&self) -> Arc<dyn FreeMap> {
        self.free_list.clone()
    }

    fn new_file(&self, length: usize) -> Arc<Inode> {
        let free_map = self.free_map();
        let sector = self.free_list.allocate(1).unwrap()[0];
        assert!(vfs::create(sector, length, &self.device, &free_map));
        vfs::open(sector, &self.device, &free_map)
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn small_file_round_trip() {
    let fx = setup("small");
    let inode = fx.new_file(0);

    assert_eq!(inode.write_at(0, b"hello"), 5);
    assert_eq!(inode.length(), 5);

    let mut out = [0u8; 5];
    assert_eq!(inode.read_at(0, &mut out), 5);
    assert_eq!(&out, b"hello");
    inode.close();
}

#[test]
fn write_across_sector_boundary() {
    let fx = setup("boundary");
    let inode = fx.new_file(0);
    let data = pattern(700);

    assert_eq!(inode.write_at(0, &data), 700);
    assert_eq!(inode.length(), 700);

    let mut out = vec![0u8; 700];
    assert_eq!(inode.read_at(0, &mut out), 700);
    assert_eq!(out, data);
    inode.close();
}

#[test]
fn partial_sector_read_modify_write() {
    let fx = setup("rmw");
    let inode = fx.new_file(0);
    assert_eq!(inode.write_at(0, &vec![1u8; SECTOR_SIZE * 2]), SECTOR_SIZE * 2);

    // overwrite a span straddling the sector boundary
    assert_eq!(inode.write_at(SECTOR_SIZE - 50, &[9u8; 100]), 100);

    let mut out = vec![0u8; SECTOR_SIZE * 2];
    assert_eq!(inode.read_at(0, &mut out), SECTOR_SIZE * 2);
    assert!(out[..SECTOR_SIZE - 50].iter().all(|&b| b == 1));
    assert!(out[SECTOR_SIZE - 50..SECTOR_SIZE + 50].iter().all(|&b| b == 9));
    assert!(out[SECTOR_SIZE + 50..].iter().all(|&b| b == 1));
    inode.close();
}

/// One byte into each indexing level, including both sides of the
/// direct/indirect and indirect/double-indirect boundaries.
#[test]
fn index_level_boundaries() {
    let fx = setup("levels");
    let inode = fx.new_file(0);
    let file_sectors = [11usize, 12, 139, 140, 141];

    for (k, s) in file_sectors.into_iter().enumerate() {
        assert_eq!(inode.write_at(s * SECTOR_SIZE, &[0xA0 + k as u8]), 1);
    }
    for (k, s) in file_sectors.into_iter().enumerate() {
        let mut out = [0u8; 1];
        assert_eq!(inode.read_at(s * SECTOR_SIZE, &mut out), 1);
        assert_eq!(out[0], 0xA0 + k as u8);
    }
    assert_eq!(inode.length(), 141 * SECTOR_SIZE + 1);
    inode.close();
}

#[test]
fn sparse_grow_reads_zero() {
    let fx = setup("sparse");
    let inode = fx.new_file(0);

    assert_eq!(inode.write_at(100_000, b"Z"), 1);
    assert_eq!(inode.length(), 100_001);

    let mut head = [0xFFu8; 4];
    assert_eq!(inode.read_at(0, &mut head), 4);
    assert_eq!(head, [0, 0, 0, 0]);

    let mut tail = [0u8; 1];
    assert_eq!(inode.read_at(100_000, &mut tail), 1);
    assert_eq!(&tail, b"Z");
    inode.close();
}

#[test]
fn double_indirect_reach() {
    let fx = setup("double");
    let inode = fx.new_file(0);

    assert_eq!(inode.write_at(5_000_000, b"Q"), 1);
    assert_eq!(inode.length(), 5_000_001);

    let mut out = [0u8; 1];
    assert_eq!(inode.read_at(5_000_000, &mut out), 1);
    assert_eq!(&out, b"Q");
    inode.close();
}

#[test]
fn large_file_round_trip() {
    let fx = setup("large");
    let inode = fx.new_file(0);
    let data = pattern(2 * 1024 * 1024);

    assert_eq!(inode.write_at(0, &data), data.len());

    // reads stop at end of file
    let mut out = vec![0u8; data.len() + 100];
    assert_eq!(inode.read_at(0, &mut out), data.len());
    assert_eq!(out[..data.len()], data[..]);
    inode.close();
}

#[test]
fn regrow_to_same_length_allocates_nothing() {
    let fx = setup("idem");
    let inode = fx.new_file(70_000);
    let free_after_create = fx.free_list.free_sectors();

    let data = vec![7u8; 70_000];
    assert_eq!(inode.write_at(0, &data), 70_000);
    assert_eq!(inode.length(), 70_000);
    assert_eq!(fx.free_list.free_sectors(), free_after_create);
    inode.close();
}

/// Deleting a double-indirect file must hand back every data sector,
/// every index sector and the inode sector itself.
#[test]
fn delete_returns_every_sector() {
    let fx = setup("delete");
    let initial = fx.free_list.free_sectors();

    let inode = fx.new_file(0);
    let data = pattern(200_000);
    assert_eq!(inode.write_at(0, &data), data.len());
    assert!(fx.free_list.free_sectors() < initial);

    inode.remove();
    inode.close();
    assert_eq!(fx.free_list.free_sectors(), initial);
}

#[test]
fn growth_fails_cleanly_when_out_of_space() {
    let fx = setup("nospace");
    // hand the engine a nearly exhausted map instead of the fixture's
    let free_list = Arc::new(FreeList::new(FREE_START, 4));
    let free_map: Arc<dyn FreeMap> = free_list.clone();

    let sector = free_list.allocate(1).unwrap()[0];
    assert!(vfs::create(sector, 0, &fx.device, &free_map));
    let inode = vfs::open(sector, &fx.device, &free_map);

    // three sectors left: five sectors of data cannot fit, and the
    // failed growth must not leak anything
    let data = vec![9u8; SECTOR_SIZE * 5];
    assert_eq!(inode.write_at(0, &data), 0);
    assert_eq!(inode.length(), 0);
    assert_eq!(free_list.free_sectors(), 3);

    // a fitting write still succeeds afterwards
    assert_eq!(inode.write_at(0, &data[..SECTOR_SIZE * 3]), SECTOR_SIZE * 3);
    assert_eq!(inode.length(), SECTOR_SIZE * 3);
    assert_eq!(free_list.free_sectors(), 0);
    inode.close();
}

#[test]
fn deny_write_blocks_until_allowed() {
    let fx = setup("deny");
    let inode = fx.new_file(0);
    assert_eq!(inode.write_at(0, b"first"), 5);

    inode.deny_write();
    assert_eq!(inode.write_at(0, b"nope!"), 0);
    let mut out = [0u8; 5];
    assert_eq!(inode.read_at(0, &mut out), 5);
    assert_eq!(&out, b"first");

    inode.allow_write();
    assert_eq!(inode.write_at(0, b"again"), 5);
    inode.close();
}

#[test]
fn open_twice_shares_one_record() {
    let fx = setup("table");
    let free_map = fx.free_map();
    let sector = fx.free_list.allocate(1).unwrap()[0];
    assert!(vfs::create(sector, 0, &fx.device, &free_map));

    let first = vfs::open(sector, &fx.device, &free_map);
    let second = vfs::open(sector, &fx.device, &free_map);
    let third = vfs::reopen(&second);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));

    // removal is deferred until the last close
    let before = fx.free_list.free_sectors();
    first.remove();
    first.close();
    third.close();
    assert_eq!(fx.free_list.free_sectors(), before);
    second.close();
    assert_eq!(fx.free_list.free_sectors(), before + 1);
}

/// Touch one more distinct sector than the pool holds: the oldest must
/// have been evicted while the newest is still resident.
#[test]
fn lru_evicts_least_recently_used() {
    let fx = setup("lru");
    let mut buf = [0u8; SECTOR_SIZE];

    for sector in 0..65u32 {
        block_cache::read(sector, &mut buf, &fx.device);
    }

    let misses = block_cache::misses();
    block_cache::read(0, &mut buf, &fx.device);
    assert_eq!(block_cache::misses(), misses + 1);

    let hits = block_cache::hits();
    block_cache::read(64, &mut buf, &fx.device);
    assert_eq!(block_cache::hits(), hits + 1);
}

/// After a reset every written byte must be on the device itself;
/// checked by reading the image file raw, bypassing the cache.
/// Doubles as a check of the on-disk inode layout.
#[test]
fn reset_flushes_dirty_frames() {
    let fx = setup("writeback");
    let inode = fx.new_file(0);
    let data = pattern(SECTOR_SIZE * 3);
    assert_eq!(inode.write_at(0, &data), data.len());
    let inode_sector = inode.sector();

    block_cache::reset(&fx.device);

    let mut raw = std::fs::File::open(&fx.image).unwrap();
    let mut inode_raw = [0u8; SECTOR_SIZE];
    raw.seek(SeekFrom::Start(inode_sector as u64 * SECTOR_SIZE as u64))
        .unwrap();
    raw.read_exact(&mut inode_raw).unwrap();

    let field = |ofs: usize| u32::from_le_bytes(inode_raw[ofs..ofs + 4].try_into().unwrap());
    assert_eq!(field(56), data.len() as u32); // length
    assert_eq!(field(60), 0x494e4f44); // magic
    assert!(inode_raw[64..].iter().all(|&b| b == 0)); // reserved

    for i in 0..3 {
        let data_sector = field(i * 4);
        assert_ne!(data_sector, 0);
        let mut sector = [0u8; SECTOR_SIZE];
        raw.seek(SeekFrom::Start(data_sector as u64 * SECTOR_SIZE as u64))
            .unwrap();
        raw.read_exact(&mut sector).unwrap();
        assert_eq!(sector[..], data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
    }
    inode.close();
}

/// Eight threads over the same warmed file: identical bytes, no new misses.
#[test]
fn concurrent_readers_agree() {
    let fx = setup("readers");
    let inode = fx.new_file(0);
    let data = Arc::new(pattern(SECTOR_SIZE * 40));
    assert_eq!(inode.write_at(0, &data), data.len());

    let warm_misses = block_cache::misses();
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let inode = vfs::reopen(&inode);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                let mut out = vec![0u8; data.len()];
                assert_eq!(inode.read_at(0, &mut out), data.len());
                assert_eq!(out[..], data[..]);
                inode.close();
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(block_cache::misses(), warm_misses);
    inode.close();
}

/// A reader racing a writer on one inode sees, per sector, either the old
/// or the new bytes, never a torn sector.
#[test]
fn racing_reader_sees_whole_sectors() {
    let fx = setup("race");
    let inode = fx.new_file(0);
    let old = vec![0xAAu8; SECTOR_SIZE * 8];
    assert_eq!(inode.write_at(0, &old), old.len());

    let writer = {
        let inode = vfs::reopen(&inode);
        thread::spawn(move || {
            let new = vec![0x55u8; SECTOR_SIZE * 8];
            assert_eq!(inode.write_at(0, &new), new.len());
            inode.close();
        })
    };

    let mut out = vec![0u8; SECTOR_SIZE * 8];
    assert_eq!(inode.read_at(0, &mut out), out.len());
    for sector in out.chunks(SECTOR_SIZE) {
        let first = sector[0];
        assert!(first == 0xAA || first == 0x55);
        assert!(sector.iter().all(|&b| b == first));
    }

    writer.join().unwrap();
    inode.close();
}
