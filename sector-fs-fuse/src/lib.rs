#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::sync::Mutex;

use sector_fs::BlockDevice;
use sector_fs::FreeMap;
use sector_fs::SECTOR_SIZE;

pub struct BlockFile(pub Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_sector(&self, sector_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((sector_id * SECTOR_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(file.read(buf).unwrap(), SECTOR_SIZE, "not a complete sector!");
    }

    fn write_sector(&self, sector_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((sector_id * SECTOR_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(
            file.write(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete sector!"
        );
    }
}

/// Free sector pool for tools and tests: a cursor over a never-used range
/// plus a stack of recycled ids.
pub struct FreeList {
    inner: Mutex<FreeListInner>,
}

struct FreeListInner {
    current: u32,
    end: u32,
    recycled: VecDeque<u32>,
}

impl FreeList {
    pub fn new(start: u32, count: u32) -> Self {
        Self {
            inner: Mutex::new(FreeListInner {
                current: start,
                end: start + count,
                recycled: VecDeque::new(),
            }),
        }
    }

    pub fn free_sectors(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        (inner.end - inner.current) as usize + inner.recycled.len()
    }
}

impl FreeMap for FreeList {
    fn allocate(&self, count: usize) -> Option<Vec<u32>> {
        let mut inner = self.inner.lock().unwrap();
        if (inner.end - inner.current) as usize + inner.recycled.len() < count {
            return None;
        }
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            match inner.recycled.pop_back() {
                Some(id) => ids.push(id),
                None => {
                    ids.push(inner.current);
                    inner.current += 1;
                }
            }
        }
        Some(ids)
    }

    fn release(&self, sector_id: u32, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        for id in sector_id..sector_id + count {
            debug_assert!(
                !inner.recycled.contains(&id) && !(id >= inner.current && id < inner.end),
                "release of a free sector {id}"
            );
            inner.recycled.push_back(id);
        }
    }
}
