use std::{fmt, string::String, sync::Arc, vec::Vec};

use dashmap::DashMap;

use crate::applications::directory::DirectoryEntry;

/// 目录条目的键值存储契约，键为终端名。
///
/// # 教案式解读
/// - **意图（Why）**：目录服务只需要“带寿命的覆盖写、点查、过滤扫描”三类语义，
///   存储引擎与模式留给实现者决定；
/// - **契约（What）**：
///   - 所有方法均为单键原子操作，扫描结果是调用时刻的快照；
///   - 存储层不理解寿命，过期判断由目录服务在读取时完成；
///   - `modify` 与 `remove_if` 的闭包在持有该键的写入权期间执行，不得回调存储本身。
pub trait DirectoryStore: Send + Sync + fmt::Debug + 'static {
    /// 覆盖写入，返回旧条目。
    fn upsert(&self, entry: Arc<DirectoryEntry>) -> Option<Arc<DirectoryEntry>>;

    fn get(&self, endpoint: &str) -> Option<Arc<DirectoryEntry>>;

    fn remove(&self, endpoint: &str) -> Option<Arc<DirectoryEntry>>;

    /// 仅当 `predicate` 成立时删除。
    fn remove_if(
        &self,
        endpoint: &str,
        predicate: &dyn Fn(&DirectoryEntry) -> bool,
    ) -> Option<Arc<DirectoryEntry>>;

    /// 原地替换：`apply` 返回 `Some` 时写入新条目并返回之，返回 `None` 时保持不变。
    fn modify(
        &self,
        endpoint: &str,
        apply: &dyn Fn(&DirectoryEntry) -> Option<DirectoryEntry>,
    ) -> Option<Arc<DirectoryEntry>>;

    /// 过滤扫描，顺序不作保证。
    fn scan(&self, filter: &dyn Fn(&DirectoryEntry) -> bool) -> Vec<Arc<DirectoryEntry>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 基于 `DashMap` 的内存存储。
///
/// - 克隆体共享同一张表；
/// - 适用于单进程部署与测试，进程重启即丢失全部注册。
#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectoryStore {
    inner: Arc<DashMap<String, Arc<DirectoryEntry>>>,
}

impl InMemoryDirectoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirectoryStore for InMemoryDirectoryStore {
    fn upsert(&self, entry: Arc<DirectoryEntry>) -> Option<Arc<DirectoryEntry>> {
        self.inner.insert(entry.endpoint().to_owned(), entry)
    }

    fn get(&self, endpoint: &str) -> Option<Arc<DirectoryEntry>> {
        self.inner.get(endpoint).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, endpoint: &str) -> Option<Arc<DirectoryEntry>> {
        self.inner.remove(endpoint).map(|(_, entry)| entry)
    }

    fn remove_if(
        &self,
        endpoint: &str,
        predicate: &dyn Fn(&DirectoryEntry) -> bool,
    ) -> Option<Arc<DirectoryEntry>> {
        self.inner
            .remove_if(endpoint, |_, entry| predicate(entry))
            .map(|(_, entry)| entry)
    }

    fn modify(
        &self,
        endpoint: &str,
        apply: &dyn Fn(&DirectoryEntry) -> Option<DirectoryEntry>,
    ) -> Option<Arc<DirectoryEntry>> {
        let mut slot = self.inner.get_mut(endpoint)?;
        let replacement = Arc::new(apply(slot.value())?);
        *slot.value_mut() = Arc::clone(&replacement);
        Some(replacement)
    }

    fn scan(&self, filter: &dyn Fn(&DirectoryEntry) -> bool) -> Vec<Arc<DirectoryEntry>> {
        self.inner
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
