// 全局连接预算
//
// 整个上传会话共享的并发额度，统一计算整文件请求与分片请求：
// - 整文件槽位：文件开始上传时占用
// - 分片槽位：文件的第一个分片复用整文件槽位，额外的并发分片各占一个
// - 等待列表：没有额度时文件进入等待，释放槽位时按 FIFO 晋升
//
// 已占用 = 整文件槽位数 - 有分片在途的文件数 + 在途分片总数 ≤ max_connections

use crate::uploader::FileId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Ledger {
    /// 占用整文件槽位的文件（按占用顺序）
    open_files: Vec<FileId>,
    /// 文件 -> 在途分片索引
    open_chunks: HashMap<FileId, Vec<usize>>,
    /// 等待额度的文件（FIFO）
    waiting: VecDeque<FileId>,
}

impl Ledger {
    fn occupied(&self) -> usize {
        let chunk_entries = self.open_chunks.len();
        let chunk_slots: usize = self.open_chunks.values().map(|c| c.len()).sum();
        (self.open_files.len() + chunk_slots).saturating_sub(chunk_entries)
    }
}

/// 连接预算管理器
#[derive(Debug)]
pub struct ConnectionBudget {
    max_connections: usize,
    ledger: Mutex<Ledger>,
}

impl ConnectionBudget {
    pub fn new(max_connections: usize) -> Self {
        info!("创建连接预算: 最大连接数={}", max_connections);
        Self {
            max_connections,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// 剩余可用额度
    pub fn available(&self) -> usize {
        let ledger = self.ledger.lock();
        self.max_connections.saturating_sub(ledger.occupied())
    }

    /// 当前已占用额度
    pub fn occupied(&self) -> usize {
        self.ledger.lock().occupied()
    }

    /// 申请额度
    ///
    /// # 参数
    /// * `id` - 文件 ID
    /// * `chunk` - 分片索引；None 表示整文件槽位
    ///
    /// # 返回
    /// 是否获得额度。整文件申请失败时文件进入等待列表；
    /// 分片申请要求文件已持有整文件槽位
    pub fn open(&self, id: FileId, chunk: Option<usize>) -> bool {
        let mut ledger = self.ledger.lock();
        let available = self.max_connections.saturating_sub(ledger.occupied());

        match chunk {
            None => {
                if ledger.open_files.contains(&id) {
                    return true;
                }
                if available > 0 {
                    ledger.waiting.retain(|w| *w != id);
                    ledger.open_files.push(id);
                    debug!("文件 {} 获得连接槽位 (剩余 {})", id, available - 1);
                    true
                } else {
                    if !ledger.waiting.contains(&id) {
                        ledger.waiting.push_back(id);
                    }
                    debug!("文件 {} 进入等待列表 (等待数 {})", id, ledger.waiting.len());
                    false
                }
            }
            Some(index) => {
                if !ledger.open_files.contains(&id) {
                    return false;
                }
                let first_chunk = ledger.open_chunks.get(&id).map_or(true, |c| c.is_empty());
                if !first_chunk && available == 0 {
                    return false;
                }
                let chunks = ledger.open_chunks.entry(id).or_default();
                if !chunks.contains(&index) {
                    chunks.push(index);
                }
                true
            }
        }
    }

    /// 释放单个分片槽位，文件保留整文件槽位
    pub fn close_chunk(&self, id: FileId, index: usize) {
        let mut ledger = self.ledger.lock();
        if let Some(chunks) = ledger.open_chunks.get_mut(&id) {
            chunks.retain(|c| *c != index);
            if chunks.is_empty() {
                ledger.open_chunks.remove(&id);
            }
        }
    }

    /// 释放文件的所有分片槽位，文件保留整文件槽位
    pub fn close_chunks(&self, id: FileId) {
        self.ledger.lock().open_chunks.remove(&id);
    }

    /// 释放文件占用的全部额度
    ///
    /// # 参数
    /// * `id` - 文件 ID
    /// * `suppress_promotion` - 为 true 时不晋升等待文件
    ///
    /// # 返回
    /// 被晋升（已获得槽位）的等待文件，由调用方负责启动
    pub fn free(&self, id: FileId, suppress_promotion: bool) -> Vec<FileId> {
        let mut ledger = self.ledger.lock();

        ledger.open_chunks.remove(&id);
        ledger.waiting.retain(|w| *w != id);
        let was_open = match ledger.open_files.iter().position(|f| *f == id) {
            Some(pos) => {
                ledger.open_files.remove(pos);
                true
            }
            None => false,
        };

        let mut promoted = Vec::new();
        if suppress_promotion {
            return promoted;
        }

        while ledger.occupied() < self.max_connections {
            let Some(next) = ledger.waiting.pop_front() else {
                break;
            };
            ledger.open_files.push(next);
            promoted.push(next);
        }

        if was_open || !promoted.is_empty() {
            debug!("文件 {} 释放连接槽位, 晋升等待文件: {:?}", id, promoted);
        }
        promoted
    }

    /// 文件是否持有整文件槽位
    pub fn is_open(&self, id: FileId) -> bool {
        self.ledger.lock().open_files.contains(&id)
    }

    /// 文件是否在等待列表中
    pub fn is_waiting(&self, id: FileId) -> bool {
        self.ledger.lock().waiting.contains(&id)
    }

    pub fn waiting_count(&self) -> usize {
        self.ledger.lock().waiting.len()
    }

    /// 清空所有槽位与等待列表
    pub fn reset(&self) {
        let mut ledger = self.ledger.lock();
        *ledger = Ledger::default();
        info!("连接预算已重置");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u64) -> FileId {
        FileId(n)
    }

    #[test]
    fn test_whole_file_slots_and_waiting() {
        let budget = ConnectionBudget::new(2);

        assert!(budget.open(id(1), None));
        assert!(budget.open(id(2), None));
        assert!(!budget.open(id(3), None));
        assert!(budget.is_waiting(id(3)));
        assert_eq!(budget.available(), 0);

        let promoted = budget.free(id(1), false);
        assert_eq!(promoted, vec![id(3)]);
        assert!(budget.is_open(id(3)));
        assert_eq!(budget.waiting_count(), 0);
    }

    #[test]
    fn test_first_chunk_reuses_file_slot() {
        let budget = ConnectionBudget::new(3);
        assert!(budget.open(id(1), None));
        assert_eq!(budget.occupied(), 1);

        assert!(budget.open(id(1), Some(0)));
        assert_eq!(budget.occupied(), 1);

        assert!(budget.open(id(1), Some(1)));
        assert!(budget.open(id(1), Some(2)));
        assert_eq!(budget.occupied(), 3);
        assert!(!budget.open(id(1), Some(3)));

        budget.close_chunk(id(1), 0);
        assert_eq!(budget.occupied(), 2);
        budget.close_chunks(id(1));
        assert_eq!(budget.occupied(), 1);
    }

    #[test]
    fn test_chunk_requires_file_slot() {
        let budget = ConnectionBudget::new(2);
        assert!(!budget.open(id(9), Some(0)));
        assert_eq!(budget.occupied(), 0);
    }

    #[test]
    fn test_free_is_idempotent_and_suppressible() {
        let budget = ConnectionBudget::new(1);
        assert!(budget.open(id(1), None));
        assert!(!budget.open(id(2), None));

        assert!(budget.free(id(1), true).is_empty());
        assert!(budget.free(id(1), true).is_empty());
        assert!(budget.is_waiting(id(2)));

        // 再次释放（不抑制晋升）时晋升等待文件
        assert_eq!(budget.free(id(1), false), vec![id(2)]);
        assert!(budget.free(id(5), false).is_empty());
    }

    #[test]
    fn test_free_waiting_file_removes_it() {
        let budget = ConnectionBudget::new(1);
        budget.open(id(1), None);
        budget.open(id(2), None);
        budget.free(id(2), false);
        assert!(!budget.is_waiting(id(2)));
        assert_eq!(budget.free(id(1), false), Vec::<FileId>::new());
    }

    #[derive(Debug, Clone)]
    enum Op {
        OpenFile(u64),
        OpenChunk(u64, usize),
        CloseChunk(u64, usize),
        Free(u64, bool),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..6).prop_map(Op::OpenFile),
            (0u64..6, 0usize..8).prop_map(|(f, c)| Op::OpenChunk(f, c)),
            (0u64..6, 0usize..8).prop_map(|(f, c)| Op::CloseChunk(f, c)),
            (0u64..6, any::<bool>()).prop_map(|(f, s)| Op::Free(f, s)),
        ]
    }

    proptest! {
        #[test]
        fn prop_occupied_never_exceeds_max(
            max in 1usize..6,
            ops in proptest::collection::vec(op_strategy(), 1..200),
        ) {
            let budget = ConnectionBudget::new(max);
            for op in ops {
                match op {
                    Op::OpenFile(f) => { budget.open(id(f), None); }
                    Op::OpenChunk(f, c) => { budget.open(id(f), Some(c)); }
                    Op::CloseChunk(f, c) => budget.close_chunk(id(f), c),
                    Op::Free(f, s) => { budget.free(id(f), s); }
                }
                prop_assert!(budget.occupied() <= max);
            }
        }
    }
}
