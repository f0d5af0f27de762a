//! # 扇区缓存层
//!
//! 设备读写远慢于内存，因此所有磁盘访问都经由一个**固定大小**的帧池：
//! 64 帧，每帧镜像一个扇区，按 LRU 置换，脏帧只在被逐出、
//! [`flush_all`] 或 [`reset`] 时写回设备（写回制）。
//!
//! 池内有两级锁：
//! - 池锁（互斥锁）守护 LRU 顺序、帧与扇区的对应关系以及命中计数；
//! - 帧锁（读写锁）守护帧的内容。
//!
//! 未命中时在**持有池锁**的情况下完成换出与换入，
//! 使"哪一帧代表哪个扇区"对所有线程都只有一种答案；
//! 命中的读者彼此只在池锁上短暂相遇，拷贝数据时互不干扰。
//! 任何路径都不得在持有帧锁时去取池锁。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::array;

use log::{debug, trace};
use spin::{Lazy, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::BlockDevice;
use crate::CACHE_FRAMES;
use crate::SECTOR_SIZE;

static CACHE: Lazy<SectorCache> = Lazy::new(SectorCache::new);

/// 把扇区当前内容拷入 `buf`（恰好一个扇区）
pub fn read(sector_id: u32, buf: &mut [u8], device: &Arc<dyn BlockDevice>) {
    assert_eq!(buf.len(), SECTOR_SIZE);
    let frame = CACHE.acquire(sector_id, false, device);
    buf.copy_from_slice(frame.data());
}

/// 以 `buf` 替换扇区的缓存内容并标脏（恰好一个扇区）
pub fn write(sector_id: u32, buf: &[u8], device: &Arc<dyn BlockDevice>) {
    assert_eq!(buf.len(), SECTOR_SIZE);
    match CACHE.acquire(sector_id, true, device) {
        FrameGuard::Exclusive(mut frame) => {
            frame.data.copy_from_slice(buf);
            frame.dirty = true;
        }
        FrameGuard::Shared(_) => unreachable!("writer was handed a shared frame"),
    }
}

/// 把所有脏帧写回设备
pub fn flush_all(device: &Arc<dyn BlockDevice>) {
    let ctrl = CACHE.ctrl.lock();
    CACHE.flush(&ctrl, device);
}

/// 卸载钩子：等价于 [`flush_all`]，帧池本身常驻
pub fn destroy(device: &Arc<dyn BlockDevice>) {
    flush_all(device);
}

/// 挂载钩子：废弃全部缓存内容并清零计数，不写回
pub fn init() {
    CACHE.ctrl.lock().reinit();
}

/// 测试钩子：写回后重建帧池
pub fn reset(device: &Arc<dyn BlockDevice>) {
    let mut ctrl = CACHE.ctrl.lock();
    CACHE.flush(&ctrl, device);
    ctrl.reinit();
    debug!("sector cache reset");
}

/// 累计命中次数
pub fn hits() -> usize {
    CACHE.ctrl.lock().hits
}

/// 累计未命中次数
pub fn misses() -> usize {
    CACHE.ctrl.lock().misses
}

struct SectorCache {
    /// 池锁：帧的身份与冷热次序
    ctrl: Mutex<PoolCtrl>,
    /// 帧锁：帧的内容
    frames: [RwLock<Frame>; CACHE_FRAMES],
}

struct PoolCtrl {
    /// LRU 队列中的帧号，队首为最近使用
    lru: VecDeque<usize>,
    /// 每帧镜像的扇区号及有效位
    tags: [FrameTag; CACHE_FRAMES],
    hits: usize,
    misses: usize,
}

#[derive(Clone, Copy, Default)]
struct FrameTag {
    sector: u32,
    valid: bool,
}

struct Frame {
    data: [u8; SECTOR_SIZE],
    /// 脏帧的内容新于磁盘；干净的有效帧与磁盘一致
    dirty: bool,
}

/// 按调用者意图持有的帧内容锁
enum FrameGuard<'a> {
    Shared(RwLockReadGuard<'a, Frame>),
    Exclusive(RwLockWriteGuard<'a, Frame>),
}

impl FrameGuard<'_> {
    fn data(&self) -> &[u8] {
        match self {
            Self::Shared(frame) => &frame.data,
            Self::Exclusive(frame) => &frame.data,
        }
    }
}

impl SectorCache {
    fn new() -> Self {
        Self {
            ctrl: Mutex::new(PoolCtrl {
                lru: (0..CACHE_FRAMES).collect(),
                tags: [FrameTag::default(); CACHE_FRAMES],
                hits: 0,
                misses: 0,
            }),
            frames: array::from_fn(|_| {
                RwLock::new(Frame {
                    data: [0; SECTOR_SIZE],
                    dirty: false,
                })
            }),
        }
    }

    /// 定位 `sector_id` 所在的帧并按 `exclusive` 取得其内容锁。
    ///
    /// 未命中时逐出队尾的帧：先在帧的写锁下把脏内容写回旧扇区，
    /// 再换入新扇区。换入全程持有池锁，返回前才释放。
    fn acquire(
        &self,
        sector_id: u32,
        exclusive: bool,
        device: &Arc<dyn BlockDevice>,
    ) -> FrameGuard<'_> {
        let mut ctrl = self.ctrl.lock();

        // 命中：提到队首
        if let Some(pos) = ctrl
            .lru
            .iter()
            .position(|&no| ctrl.tags[no].valid && ctrl.tags[no].sector == sector_id)
        {
            let frame_no = ctrl.lru.remove(pos).unwrap();
            ctrl.lru.push_front(frame_no);
            ctrl.hits += 1;

            return if exclusive {
                FrameGuard::Exclusive(self.frames[frame_no].write())
            } else {
                FrameGuard::Shared(self.frames[frame_no].read())
            };
        }

        // 未命中：队尾即最久未用的受害者
        let frame_no = ctrl.lru.pop_back().unwrap();
        ctrl.lru.push_front(frame_no);
        ctrl.misses += 1;

        let mut frame = self.frames[frame_no].write();
        let tag = ctrl.tags[frame_no];
        if tag.valid && frame.dirty {
            trace!("evict sector {} for {}", tag.sector, sector_id);
            device.write_sector(tag.sector as usize, &frame.data);
        }
        ctrl.tags[frame_no] = FrameTag {
            sector: sector_id,
            valid: true,
        };
        device.read_sector(sector_id as usize, &mut frame.data);
        frame.dirty = false;

        if exclusive {
            FrameGuard::Exclusive(frame)
        } else {
            FrameGuard::Shared(frame.downgrade())
        }
    }

    fn flush(&self, ctrl: &PoolCtrl, device: &Arc<dyn BlockDevice>) {
        for (frame_no, tag) in ctrl.tags.iter().enumerate() {
            if !tag.valid {
                continue;
            }
            let mut frame = self.frames[frame_no].write();
            if frame.dirty {
                device.write_sector(tag.sector as usize, &frame.data);
                frame.dirty = false;
            }
        }
    }
}

impl PoolCtrl {
    fn reinit(&mut self) {
        self.lru = (0..CACHE_FRAMES).collect();
        self.tags = [FrameTag::default(); CACHE_FRAMES];
        self.hits = 0;
        self.misses = 0;
    }
}
