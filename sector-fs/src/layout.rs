//! # 磁盘数据结构层
//!
//! 索引节点恰好占据一个扇区：12 枚直接扇区号、1 枚一级间接、
//! 1 枚二级间接，加上文件长度与魔数，余下补零。
//! 间接扇区则是 128 枚扇区号的数组。任何位置上的 0 都表示"未分配"。

use alloc::sync::Arc;
use core::mem;
use core::ptr;
use core::slice;

use log::debug;

use crate::block_cache;
use crate::BlockDevice;
use crate::FreeMap;
use crate::INODE_MAGIC;
use crate::SECTOR_SIZE;

/// 直接索引槽数
pub const DIRECT_COUNT: usize = 12;
/// 单个索引扇区容纳的扇区号数
pub const IDS_PER_SECTOR: usize = SECTOR_SIZE / mem::size_of::<u32>();
/// 索引树所能触及的最大文件长度
pub const MAX_LENGTH: usize =
    (DIRECT_COUNT + IDS_PER_SECTOR + IDS_PER_SECTOR * IDS_PER_SECTOR) * SECTOR_SIZE;

/// 索引扇区：128 枚扇区号
type IndirectSector = [u32; IDS_PER_SECTOR];

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// 磁盘索引节点
#[repr(C)]
pub struct DiskInode {
    direct: [u32; DIRECT_COUNT],
    indirect: u32,
    indirect_double: u32,
    length: i32,
    magic: u32,
    padding: [u32; 112],
}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// 空文件的索引节点
    pub fn empty() -> Self {
        Self {
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            indirect_double: 0,
            length: 0,
            magic: INODE_MAGIC,
            padding: [0; 112],
        }
    }

    /// 经缓存读入 `sector_id` 处的索引节点
    pub fn load(sector_id: u32, device: &Arc<dyn BlockDevice>) -> Self {
        let mut disk_inode = Self::empty();
        block_cache::read(sector_id, disk_inode.as_bytes_mut(), device);
        assert!(
            disk_inode.is_valid(),
            "sector {sector_id} does not hold an inode"
        );
        disk_inode
    }

    /// 经缓存写回 `sector_id`
    pub fn store(&self, sector_id: u32, device: &Arc<dyn BlockDevice>) {
        block_cache::write(sector_id, self.as_bytes(), device);
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// 容纳 `length` 字节所需的数据扇区数
    pub fn data_sectors(length: usize) -> usize {
        length.div_ceil(SECTOR_SIZE)
    }

    /// 容纳 `length` 字节所需的数据扇区与索引扇区总数，不含索引节点本身
    pub fn total_sectors(length: usize) -> usize {
        let data = Self::data_sectors(length);
        if data <= DIRECT_COUNT {
            data
        } else if data <= DIRECT_COUNT + IDS_PER_SECTOR {
            data + 1
        } else {
            data + 2 + (data - DIRECT_COUNT - IDS_PER_SECTOR).div_ceil(IDS_PER_SECTOR)
        }
    }

    /// 文件内第 `index` 个扇区对应的设备扇区号，0 表示空洞
    pub fn sector_at(&self, index: usize, device: &Arc<dyn BlockDevice>) -> u32 {
        if index < DIRECT_COUNT {
            self.direct[index]
        } else if index < DIRECT_COUNT + IDS_PER_SECTOR {
            if self.indirect == 0 {
                return 0;
            }
            let ids = load_ids(self.indirect, device);
            ids[index - DIRECT_COUNT]
        } else {
            if self.indirect_double == 0 {
                return 0;
            }
            let index = index - DIRECT_COUNT - IDS_PER_SECTOR;
            let outer = load_ids(self.indirect_double, device);
            let inner_id = outer[index / IDS_PER_SECTOR];
            if inner_id == 0 {
                return 0;
            }
            let inner = load_ids(inner_id, device);
            inner[index % IDS_PER_SECTOR]
        }
    }

    /// 把文件调整为 `new_length` 字节。
    ///
    /// 增长所需的全部扇区在一次分配中取得，分配失败则不作任何改动；
    /// 新到手的数据扇区先经缓存清零，之后才可能被读到。
    /// 收缩永不失败，并把不再引用的数据扇区与索引扇区全部归还。
    pub fn resize(
        &mut self,
        new_length: usize,
        device: &Arc<dyn BlockDevice>,
        free_map: &Arc<dyn FreeMap>,
    ) -> bool {
        if new_length > MAX_LENGTH {
            return false;
        }

        let old_total = Self::total_sectors(self.length());
        let new_total = Self::total_sectors(new_length);
        let Some(fresh) = free_map.allocate(new_total.saturating_sub(old_total)) else {
            return false;
        };
        let mut fresh = fresh.into_iter();
        debug!("resize inode: {} -> {} bytes", self.length, new_length);

        // 直接索引
        for i in 0..DIRECT_COUNT {
            if new_length <= i * SECTOR_SIZE {
                if self.direct[i] != 0 {
                    free_map.release(self.direct[i], 1);
                    self.direct[i] = 0;
                }
            } else if self.direct[i] == 0 {
                self.direct[i] = take_zeroed(&mut fresh, device);
            }
        }

        if self.indirect == 0 && new_length <= DIRECT_COUNT * SECTOR_SIZE {
            return self.commit(new_length, fresh);
        }

        // 一级间接索引
        let mut ids = if self.indirect == 0 {
            self.indirect = next_fresh(&mut fresh);
            [0; IDS_PER_SECTOR]
        } else {
            load_ids(self.indirect, device)
        };
        for i in 0..IDS_PER_SECTOR {
            if new_length <= (DIRECT_COUNT + i) * SECTOR_SIZE {
                if ids[i] != 0 {
                    free_map.release(ids[i], 1);
                    ids[i] = 0;
                }
            } else if ids[i] == 0 {
                ids[i] = take_zeroed(&mut fresh, device);
            }
        }
        if new_length <= DIRECT_COUNT * SECTOR_SIZE {
            // 间接扇区本身也不再被引用
            free_map.release(self.indirect, 1);
            self.indirect = 0;
        } else {
            store_ids(self.indirect, &ids, device);
        }

        if self.indirect_double == 0 && new_length <= (DIRECT_COUNT + IDS_PER_SECTOR) * SECTOR_SIZE
        {
            return self.commit(new_length, fresh);
        }

        // 二级间接索引
        let mut outer = if self.indirect_double == 0 {
            self.indirect_double = next_fresh(&mut fresh);
            [0; IDS_PER_SECTOR]
        } else {
            load_ids(self.indirect_double, device)
        };
        for i in 0..IDS_PER_SECTOR {
            let covered = (DIRECT_COUNT + IDS_PER_SECTOR + i * IDS_PER_SECTOR) * SECTOR_SIZE;
            if new_length <= covered {
                if outer[i] != 0 {
                    // 整棵子树被丢弃：先归还其中的数据扇区，再归还索引扇区
                    let inner = load_ids(outer[i], device);
                    for id in inner.into_iter().filter(|&id| id != 0) {
                        free_map.release(id, 1);
                    }
                    free_map.release(outer[i], 1);
                    outer[i] = 0;
                }
            } else {
                let mut inner = if outer[i] == 0 {
                    outer[i] = next_fresh(&mut fresh);
                    [0; IDS_PER_SECTOR]
                } else {
                    load_ids(outer[i], device)
                };
                for j in 0..IDS_PER_SECTOR {
                    let base =
                        (DIRECT_COUNT + IDS_PER_SECTOR + i * IDS_PER_SECTOR + j) * SECTOR_SIZE;
                    if new_length <= base {
                        if inner[j] != 0 {
                            free_map.release(inner[j], 1);
                            inner[j] = 0;
                        }
                    } else if inner[j] == 0 {
                        inner[j] = take_zeroed(&mut fresh, device);
                    }
                }
                store_ids(outer[i], &inner, device);
            }
        }
        if new_length <= (DIRECT_COUNT + IDS_PER_SECTOR) * SECTOR_SIZE {
            free_map.release(self.indirect_double, 1);
            self.indirect_double = 0;
        } else {
            store_ids(self.indirect_double, &outer, device);
        }

        self.commit(new_length, fresh)
    }

    fn commit(&mut self, new_length: usize, mut fresh: impl Iterator<Item = u32>) -> bool {
        debug_assert!(fresh.next().is_none(), "allocation batch not fully consumed");
        self.length = new_length as i32;
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), SECTOR_SIZE) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), SECTOR_SIZE) }
    }
}

#[inline]
fn next_fresh(fresh: &mut impl Iterator<Item = u32>) -> u32 {
    fresh.next().expect("allocation batch exhausted")
}

/// 取下一枚新扇区并经缓存清零
fn take_zeroed(fresh: &mut impl Iterator<Item = u32>, device: &Arc<dyn BlockDevice>) -> u32 {
    let id = next_fresh(fresh);
    block_cache::write(id, &ZERO_SECTOR, device);
    id
}

fn load_ids(sector_id: u32, device: &Arc<dyn BlockDevice>) -> IndirectSector {
    let mut ids = [0; IDS_PER_SECTOR];
    block_cache::read(sector_id, ids_as_bytes_mut(&mut ids), device);
    ids
}

fn store_ids(sector_id: u32, ids: &IndirectSector, device: &Arc<dyn BlockDevice>) {
    block_cache::write(sector_id, ids_as_bytes(ids), device);
}

fn ids_as_bytes(ids: &IndirectSector) -> &[u8] {
    unsafe { slice::from_raw_parts(ptr::from_ref(ids).cast(), SECTOR_SIZE) }
}

fn ids_as_bytes_mut(ids: &mut IndirectSector) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(ptr::from_mut(ids).cast(), SECTOR_SIZE) }
}
