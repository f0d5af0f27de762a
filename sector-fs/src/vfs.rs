//! # 索引节点层
//!
//! 进程内维护一张以索引节点扇区号为键的**打开表**：
//! 同一扇区的再次打开返回同一条记录并递增打开计数，
//! 打开计数归零时记录销毁；若此前被标记删除，
//! 最后一次关闭还要把文件缩至零并归还索引节点扇区。
//!
//! 句柄上的 [`read_at`] / [`write_at`] 逐扇区搬运数据，
//! 不足整扇区的部分借助一个扇区大小的中转缓冲完成读改写。
//!
//! 加锁次序：打开表锁 → 单节点锁 → 缓存池锁 → 帧锁 → 空闲表锁。
//!
//! [`read_at`]: Inode::read_at
//! [`write_at`]: Inode::write_at

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;

use log::debug;
use spin::Mutex;

use crate::block_cache;
use crate::layout::DiskInode;
use crate::BlockDevice;
use crate::FreeMap;
use crate::SECTOR_SIZE;

static OPEN_INODES: Mutex<Vec<Arc<Inode>>> = Mutex::new(Vec::new());

/// 挂载钩子：清空打开表
pub fn init() {
    OPEN_INODES.lock().clear();
}

/// 在 `sector_id` 处建立一个 `length` 字节的文件。
///
/// 数据与索引扇区取自空闲表并全部清零；
/// 空间不足时返回 `false` 且不写入任何东西。
pub fn create(
    sector_id: u32,
    length: usize,
    device: &Arc<dyn BlockDevice>,
    free_map: &Arc<dyn FreeMap>,
) -> bool {
    let mut disk_inode = DiskInode::empty();
    if !disk_inode.resize(length, device, free_map) {
        return false;
    }
    disk_inode.store(sector_id, device);
    debug!("created inode at sector {sector_id}, {length} bytes");
    true
}

/// 打开 `sector_id` 处的索引节点。
///
/// 该节点已在打开表中时，返回同一条记录并递增打开计数。
pub fn open(
    sector_id: u32,
    device: &Arc<dyn BlockDevice>,
    free_map: &Arc<dyn FreeMap>,
) -> Arc<Inode> {
    let mut open_inodes = OPEN_INODES.lock();

    if let Some(inode) = open_inodes.iter().find(|inode| inode.sector == sector_id) {
        inode.state.lock().open_cnt += 1;
        return Arc::clone(inode);
    }

    let inode = Arc::new(Inode {
        sector: sector_id,
        device: Arc::clone(device),
        free_map: Arc::clone(free_map),
        state: Mutex::new(InodeState {
            open_cnt: 1,
            removed: false,
            deny_write_cnt: 0,
        }),
    });
    open_inodes.push(Arc::clone(&inode));
    inode
}

/// 再次打开一个已持有的句柄
pub fn reopen(inode: &Arc<Inode>) -> Arc<Inode> {
    inode.state.lock().open_cnt += 1;
    Arc::clone(inode)
}

/// 打开表中的索引节点记录，即文件句柄
pub struct Inode {
    /// 索引节点所在扇区
    sector: u32,
    device: Arc<dyn BlockDevice>,
    free_map: Arc<dyn FreeMap>,
    state: Mutex<InodeState>,
}

struct InodeState {
    open_cnt: usize,
    /// 置位后，最后一次关闭时归还全部扇区
    removed: bool,
    /// 大于零期间写入一律返回 0
    deny_write_cnt: usize,
}

impl Inode {
    /// 索引节点的扇区号，即它在本卷内的编号
    #[inline]
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// 文件长度，以磁盘上的索引节点为准
    pub fn length(&self) -> usize {
        DiskInode::load(self.sector, &self.device).length()
    }

    /// 标记删除；扇区要等最后一个句柄关闭才归还
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    /// 关闭句柄。
    ///
    /// 最后一次关闭将记录移出打开表；
    /// 若已标记删除，再把文件缩至零并归还索引节点扇区。
    pub fn close(&self) {
        let mut open_inodes = OPEN_INODES.lock();
        let mut state = self.state.lock();
        assert!(state.open_cnt > 0);
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return;
        }

        open_inodes.retain(|inode| inode.sector != self.sector);
        let removed = state.removed;
        drop(state);
        drop(open_inodes);

        if removed {
            let mut disk_inode = DiskInode::load(self.sector, &self.device);
            disk_inode.resize(0, &self.device, &self.free_map);
            self.free_map.release(self.sector, 1);
            debug!("inode at sector {} deleted on last close", self.sector);
        }
    }

    /// 拒绝写入本文件，可由多个打开者分别声明
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// 撤销一次 [`deny_write`](Self::deny_write) 声明
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }

    /// 自 `offset` 起读取至多 `buf.len()` 字节，返回实际读到的字节数。
    ///
    /// 到达文件尾即停。读者之间、读者与索引翻译之间都无须节点锁：
    /// 索引只会单调生长，已映射的数据扇区不会失效
    /// （收缩只发生在最后一次关闭，彼时已无读者）。
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let mut pos = offset;
        let mut bytes_read = 0;
        let mut bounce: Option<Box<[u8; SECTOR_SIZE]>> = None;

        while bytes_read < buf.len() {
            let length = self.length();
            if pos >= length {
                break;
            }
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = min(
                buf.len() - bytes_read,
                min(length - pos, SECTOR_SIZE - sector_ofs),
            );
            let sector_id = self.sector_for(pos);
            let dst = &mut buf[bytes_read..bytes_read + chunk];

            if sector_id == 0 {
                // 空洞读作零
                dst.fill(0);
            } else if sector_ofs == 0 && chunk == SECTOR_SIZE {
                // 整扇区直接落进调用者的缓冲
                block_cache::read(sector_id, dst, &self.device);
            } else {
                let bounce = bounce.get_or_insert_with(|| Box::new([0; SECTOR_SIZE]));
                block_cache::read(sector_id, &mut bounce[..], &self.device);
                dst.copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }

            pos += chunk;
            bytes_read += chunk;
        }
        bytes_read
    }

    /// 自 `offset` 起写入 `buf`，返回实际写入的字节数。
    ///
    /// 越过文件尾的写入先把文件扩容到 `offset + buf.len()`；
    /// 扩容失败则按旧长度写到文件尾为止。
    /// 处于拒绝写入状态时返回 0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        // 写者之间由节点锁串行化，整个调用期间持有
        let state = self.state.lock();
        if state.deny_write_cnt > 0 {
            return 0;
        }

        if offset + buf.len() > self.length() {
            let mut disk_inode = DiskInode::load(self.sector, &self.device);
            if disk_inode.resize(offset + buf.len(), &self.device, &self.free_map) {
                disk_inode.store(self.sector, &self.device);
            }
        }

        let mut pos = offset;
        let mut bytes_written = 0;
        let mut bounce: Option<Box<[u8; SECTOR_SIZE]>> = None;

        while bytes_written < buf.len() {
            let length = self.length();
            if pos >= length {
                break;
            }
            let sector_ofs = pos % SECTOR_SIZE;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = min(buf.len() - bytes_written, min(length - pos, sector_left));
            let sector_id = self.sector_for(pos);
            debug_assert_ne!(sector_id, 0);
            let src = &buf[bytes_written..bytes_written + chunk];

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                block_cache::write(sector_id, src, &self.device);
            } else {
                let bounce = bounce.get_or_insert_with(|| Box::new([0; SECTOR_SIZE]));
                if sector_ofs > 0 || chunk < sector_left {
                    // 扇区内在本次写入之外还有数据，须先读入再改写
                    block_cache::read(sector_id, &mut bounce[..], &self.device);
                } else {
                    bounce.fill(0);
                }
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(src);
                block_cache::write(sector_id, &bounce[..], &self.device);
            }

            pos += chunk;
            bytes_written += chunk;
        }
        bytes_written
    }

    /// 文件内偏移 `pos` 所在的设备扇区号
    fn sector_for(&self, pos: usize) -> u32 {
        DiskInode::load(self.sector, &self.device).sector_at(pos / SECTOR_SIZE, &self.device)
    }
}
