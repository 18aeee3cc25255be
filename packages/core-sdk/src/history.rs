use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use crate::models::ConversationEntry;

/** \brief 最多保留的会话条数。 */
pub const HISTORY_CAPACITY: usize = 100;
/** \brief 未指定 `limit` 时返回的条数。 */
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/**
 * \brief 有界的内存会话记录，写入互斥，超出容量时淘汰最旧的记录。
 */
#[derive(Debug)]
pub struct ConversationStore {
    entries: Mutex<VecDeque<ConversationEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY) + 1)),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /** \brief 分配新的记录 ID，单调递增。 */
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /**
     * \brief 追加记录；超出容量时从头部淘汰直到等于容量。
     */
    pub fn append(&self, entry: ConversationEntry) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.push_back(entry);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    /**
     * \brief 最近的 `limit` 条记录，新的在前；`None` 时取默认条数。
     */
    pub fn list(&self, limit: Option<usize>) -> Vec<ConversationEntry> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear(&self) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
