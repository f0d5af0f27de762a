//! # 空闲扇区表接口层
//!
//! 空闲扇区的管理属于卷格式的职责，不在本 crate 之内；
//! [`FreeMap`] 是索引层消费的分配能力。

use alloc::vec::Vec;

/// 空闲扇区分配器特质
///
/// 分配器须自行保证线程安全。
pub trait FreeMap: Send + Sync {
    /// 一次性取得 `count` 枚互不相同的空闲扇区号，不要求连续。
    ///
    /// 无法全额满足时返回 `None`，且不产生任何副作用；
    /// `count` 为 0 时返回空表。
    fn allocate(&self, count: usize) -> Option<Vec<u32>>;

    /// 归还自 `sector_id` 起的连续 `count` 枚扇区
    fn release(&self, sector_id: u32, count: u32);
}
