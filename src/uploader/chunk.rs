// 上传分片管理
//
// 分片规则：
// - 分片数 = ceil(文件大小 / 分片大小)，分片数 > 1 时分片上传（或强制分片）
// - 分片按索引连续划分 [0, size)，无空隙、无重叠
// - 待上传索引 FIFO 取出，失败的分片放回队首
// - 分片数据按索引懒加载并缓存，避免重复切片

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use tracing::debug;

/// 默认分片大小: 2MB
pub const DEFAULT_PART_SIZE: u64 = 2 * 1024 * 1024;

/// 计算分片总数
pub fn total_parts(file_size: u64, part_size: u64) -> usize {
    if part_size == 0 {
        return 0;
    }
    file_size.div_ceil(part_size) as usize
}

/// 是否需要分片上传
pub fn should_chunk(file_size: u64, part_size: u64, mandatory: bool) -> bool {
    mandatory || total_parts(file_size, part_size) > 1
}

/// 分片描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（不含）
    pub end: u64,
    /// 分片大小
    pub size: u64,
    /// 分片总数
    pub total_parts: usize,
}

impl ChunkDescriptor {
    /// 根据当前文件大小计算分片
    ///
    /// 文件缩小后，超出范围的分片大小为 0
    pub fn compute(file_size: u64, part_size: u64, index: usize, total_parts: usize) -> Self {
        let start = (index as u64).saturating_mul(part_size).min(file_size);
        let end = start.saturating_add(part_size).min(file_size);
        Self {
            index,
            start,
            end,
            size: end - start,
            total_parts,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// 划分所有分片
pub fn partition(file_size: u64, part_size: u64) -> Vec<ChunkDescriptor> {
    let total = total_parts(file_size, part_size);
    (0..total)
        .map(|index| ChunkDescriptor::compute(file_size, part_size, index, total))
        .collect()
}

/// 分片进度状态（可持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingState {
    /// 待上传分片索引（FIFO）
    pub remaining: VecDeque<usize>,
    /// 上传中的分片索引
    #[serde(rename = "inProgress")]
    pub in_progress: Vec<usize>,
}

impl ChunkingState {
    /// 创建全新状态：所有分片待上传
    pub fn new(total_parts: usize) -> Self {
        Self {
            remaining: (0..total_parts).collect(),
            in_progress: Vec::new(),
        }
    }

    /// 取出下一个待上传分片并标记为上传中
    pub fn next(&mut self) -> Option<usize> {
        let index = self.remaining.pop_front()?;
        self.in_progress.push(index);
        Some(index)
    }

    /// 标记分片完成，返回是否确实在上传中
    pub fn complete(&mut self, index: usize) -> bool {
        match self.in_progress.iter().position(|i| *i == index) {
            Some(pos) => {
                self.in_progress.remove(pos);
                true
            }
            None => false,
        }
    }

    /// 分片失败：放回待上传队首
    pub fn requeue(&mut self, index: usize) {
        if let Some(pos) = self.in_progress.iter().position(|i| *i == index) {
            self.in_progress.remove(pos);
        }
        if !self.remaining.contains(&index) {
            self.remaining.push_front(index);
        }
    }

    /// 把所有上传中分片按索引顺序放回待上传队首
    pub fn fold_in_progress(&mut self) {
        let mut in_progress = std::mem::take(&mut self.in_progress);
        in_progress.sort_unstable();
        for index in in_progress.into_iter().rev() {
            if !self.remaining.contains(&index) {
                self.remaining.push_front(index);
            }
        }
    }

    /// 所有分片均已确认
    pub fn is_done(&self) -> bool {
        self.remaining.is_empty() && self.in_progress.is_empty()
    }

    /// 校验状态：索引均在 [0, total) 内，且两个集合之间无重复
    pub fn is_valid_for(&self, total_parts: usize) -> bool {
        let mut seen = vec![false; total_parts];
        for index in self.remaining.iter().chain(self.in_progress.iter()) {
            if *index >= total_parts || seen[*index] {
                return false;
            }
            seen[*index] = true;
        }
        true
    }

    /// 已完成的分片数
    pub fn completed_count(&self, total_parts: usize) -> usize {
        total_parts.saturating_sub(self.remaining.len() + self.in_progress.len())
    }
}

/// 分片数据缓存（按索引）
#[derive(Debug, Default)]
pub struct ChunkCache {
    slices: HashMap<usize, Bytes>,
}

impl ChunkCache {
    pub fn get(&self, index: usize) -> Option<Bytes> {
        self.slices.get(&index).cloned()
    }

    pub fn insert(&mut self, index: usize, data: Bytes) {
        self.slices.insert(index, data);
    }

    pub fn remove(&mut self, index: usize) {
        if self.slices.remove(&index).is_some() {
            debug!("丢弃分片 #{} 的缓存数据", index);
        }
    }

    pub fn clear(&mut self) {
        self.slices.clear();
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_partition_scenario() {
        let chunks = partition(5_000_000, 2_000_000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].range(), 0..2_000_000);
        assert_eq!(chunks[1].range(), 2_000_000..4_000_000);
        assert_eq!(chunks[2].range(), 4_000_000..5_000_000);
        assert_eq!(chunks[2].size, 1_000_000);
        assert!(chunks.iter().all(|c| c.total_parts == 3));
    }

    #[test]
    fn test_should_chunk() {
        assert!(!should_chunk(1000, 2000, false));
        assert!(!should_chunk(2000, 2000, false));
        assert!(should_chunk(2001, 2000, false));
        assert!(should_chunk(10, 2000, true));
    }

    #[test]
    fn test_shrunk_file_yields_zero_size_chunk() {
        // 按 3 个分片规划后文件缩小到 1 个分片
        let chunk = ChunkDescriptor::compute(1500, 1000, 2, 3);
        assert_eq!(chunk.size, 0);
        assert_eq!(chunk.start, 1500);
        assert_eq!(chunk.end, 1500);
    }

    #[test]
    fn test_chunking_state_flow() {
        let mut state = ChunkingState::new(5);
        assert_eq!(state.next(), Some(0));
        assert_eq!(state.next(), Some(1));
        assert!(state.complete(0));
        assert!(!state.complete(0));

        state.requeue(1);
        assert_eq!(state.remaining.front(), Some(&1));
        assert!(state.in_progress.is_empty());
        assert_eq!(state.completed_count(5), 1);
    }

    #[test]
    fn test_fold_in_progress_keeps_order() {
        let mut state = ChunkingState::new(5);
        state.next();
        state.next();
        state.complete(0);
        state.complete(1);
        // 分片 2、3 上传中
        state.next();
        state.next();
        state.in_progress.reverse();

        state.fold_in_progress();
        assert_eq!(state.remaining, VecDeque::from(vec![2, 3, 4]));
        assert!(state.in_progress.is_empty());
        assert!(state.is_valid_for(5));
    }

    #[test]
    fn test_validity_check() {
        let state = ChunkingState {
            remaining: VecDeque::from(vec![1, 2]),
            in_progress: vec![2],
        };
        assert!(!state.is_valid_for(3));

        let state = ChunkingState {
            remaining: VecDeque::from(vec![5]),
            in_progress: vec![],
        };
        assert!(!state.is_valid_for(3));
    }

    #[test]
    fn test_chunk_cache() {
        let mut cache = ChunkCache::default();
        cache.insert(1, Bytes::from_static(b"abc"));
        assert_eq!(cache.get(1).as_deref(), Some(&b"abc"[..]));
        cache.remove(1);
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn prop_partition_is_contiguous(size in 0u64..50_000_000, part in 1u64..5_000_000) {
            let chunks = partition(size, part);
            prop_assert_eq!(chunks.len() as u64, size.div_ceil(part));

            let mut offset = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.start, offset);
                prop_assert_eq!(chunk.end - chunk.start, chunk.size);
                prop_assert!(chunk.size > 0);
                offset = chunk.end;
            }
            prop_assert_eq!(offset, size);
        }
    }
}
