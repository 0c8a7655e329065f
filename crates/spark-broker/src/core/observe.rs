//! # ObserverRegistry：按路径索引的观察者登记表
//!
//! ## 核心意图（Why）
//! - 记录“哪个事务在观察哪个资源”，并在资源变更或删除时给出受影响的观察关系集合；
//! - 观察关系不挂在资源节点上，而是以路径为键放在独立索引里，节点无需感知事务生命周期。
//!
//! ## 行为契约（What）
//! - 登记表只持有 [`Observation`] 的 `Weak` 句柄，强引用由传输层随事务保存；
//!   传输层丢弃事务（连接丢失）即视为失效，失效条目在下一次遍历时惰性清理；
//! - `register` 对同一 (资源, 事务) 幂等；同一端点以同一令牌重复登记也复用既有关系；
//! - `notify` 只返回存活的观察关系，不修改任何事务状态，组装推送由分发器负责；
//! - `unregister` 移除某事务的全部观察条目，并把关系标记为已取消。
//!
//! ## 风险提示（Trade-offs）
//! - 两张 `DashMap` 之间不存在嵌套持锁的反向顺序：凡需同时访问时，先释放 `by_transaction`
//!   的 guard 再进入 `by_path`。

use std::{
    borrow::ToOwned,
    net::SocketAddr,
    string::String,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    vec::Vec,
};

use dashmap::DashMap;

use crate::core::{
    message::{MessageType, Token, Transaction, TransactionId},
    namespace::ResourceNode,
};

/// 一条观察关系：某个事务（及其令牌、对端地址）对某个资源路径的订阅。
#[derive(Debug)]
pub struct Observation {
    transaction: TransactionId,
    path: String,
    token: Token,
    destination: SocketAddr,
    mtype: MessageType,
    cancelled: AtomicBool,
}

impl Observation {
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// 推送目的地址，即登记请求的源地址。
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// 登记请求所用的报文类型。
    pub fn message_type(&self) -> MessageType {
        self.mtype
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct ObserverEntry {
    transaction: TransactionId,
    handle: Weak<Observation>,
}

impl ObserverEntry {
    fn live(&self) -> Option<Arc<Observation>> {
        self.handle
            .upgrade()
            .filter(|observation| !observation.is_cancelled())
    }
}

/// 观察者登记表。
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    by_path: DashMap<String, Vec<ObserverEntry>>,
    by_transaction: DashMap<TransactionId, Vec<String>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 `transaction` 对 `resource` 的观察，返回需由传输层持有的强引用。
    ///
    /// ## 契约说明
    /// - **输入**：已解析的资源节点与携带 observe=0 的事务；
    /// - **前置条件**：调用方须保证 `resource` 仍挂在命名空间内（见
    ///   [`ResourceNamespace::with_linked`](crate::core::namespace::ResourceNamespace::with_linked)），
    ///   否则登记会落在一个再也不会被通知的路径上；
    /// - **后置条件**：同一事务或同一 (端点, 令牌) 重复登记时返回既有关系；顺带清理该路径上
    ///   已失效的条目及其反向索引记录。
    pub fn register(&self, resource: &ResourceNode, transaction: &Transaction) -> Arc<Observation> {
        let request = transaction.request();
        let id = transaction.id();
        let path = resource.path();

        let mut entries = self.by_path.entry(path.to_owned()).or_default();
        let mut dead = Vec::new();
        entries.retain(|entry| keep_live(entry, &mut dead));
        let existing = entries.iter().find_map(|entry| {
            entry.live().filter(|observation| {
                entry.transaction == id
                    || (observation.destination == request.source
                        && observation.token == request.token)
            })
        });
        if let Some(observation) = existing {
            drop(entries);
            self.release_transactions(path, &dead);
            return observation;
        }

        let observation = Arc::new(Observation {
            transaction: id,
            path: path.to_owned(),
            token: request.token.clone(),
            destination: request.source,
            mtype: request.mtype,
            cancelled: AtomicBool::new(false),
        });
        entries.push(ObserverEntry {
            transaction: id,
            handle: Arc::downgrade(&observation),
        });
        drop(entries);
        self.release_transactions(path, &dead);
        self.by_transaction
            .entry(id)
            .or_default()
            .push(path.to_owned());
        tracing::debug!(path, transaction = %id, "observer registered");
        observation
    }

    /// 返回当前观察 `resource` 的全部存活关系，同时清理失效条目。
    ///
    /// - **后置条件**：失效条目从正反两张索引中一并移除；路径上已无条目时整项删除。
    pub fn notify(&self, resource: &ResourceNode) -> Vec<Arc<Observation>> {
        let path = resource.path();
        let Some(mut entries) = self.by_path.get_mut(path) else {
            return Vec::new();
        };
        let mut live = Vec::with_capacity(entries.len());
        let mut dead = Vec::new();
        entries.retain(|entry| match entry.live() {
            Some(observation) => {
                live.push(observation);
                true
            }
            None => {
                dead.push(entry.transaction);
                false
            }
        });
        drop(entries);
        if !dead.is_empty() {
            self.by_path.remove_if(path, |_, entries| entries.is_empty());
            self.release_transactions(path, &dead);
        }
        live
    }

    /// 移除某事务的全部观察条目（连接丢失或显式注销），返回移除的条目数。
    pub fn unregister(&self, transaction: TransactionId) -> usize {
        let Some((_, paths)) = self.by_transaction.remove(&transaction) else {
            return 0;
        };
        let mut removed = 0;
        for path in paths {
            if let Some(mut entries) = self.by_path.get_mut(&path) {
                entries.retain(|entry| {
                    if entry.transaction != transaction {
                        return true;
                    }
                    if let Some(observation) = entry.handle.upgrade() {
                        observation.cancel();
                    }
                    removed += 1;
                    false
                });
            }
            self.by_path.remove_if(&path, |_, entries| entries.is_empty());
        }
        if removed > 0 {
            tracing::debug!(transaction = %transaction, removed, "observer entries unregistered");
        }
        removed
    }

    /// 取消某端点以某令牌在 `path` 上的观察（Observe=1 注销）。
    pub fn cancel(&self, path: &str, destination: SocketAddr, token: &Token) -> bool {
        let target = self.by_path.get(path).and_then(|entries| {
            entries.iter().find_map(|entry| {
                entry.live().filter(|observation| {
                    observation.destination == destination && &observation.token == token
                })
            })
        });
        match target {
            Some(observation) => {
                self.unregister(observation.transaction);
                true
            }
            None => false,
        }
    }

    /// 丢弃某路径上的全部条目，资源被删除后调用。
    pub fn forget(&self, path: &str) -> usize {
        let Some((_, entries)) = self.by_path.remove(path) else {
            return 0;
        };
        let transactions: Vec<TransactionId> = entries.iter().map(|entry| entry.transaction).collect();
        self.release_transactions(path, &transactions);
        entries.len()
    }

    /// 从反向索引中移除 `transactions` 对 `path` 的记录，记录清空的事务整项删除。
    fn release_transactions(&self, path: &str, transactions: &[TransactionId]) {
        for transaction in transactions {
            if let Some(mut paths) = self.by_transaction.get_mut(transaction) {
                paths.retain(|p| p != path);
            }
            self.by_transaction
                .remove_if(transaction, |_, paths| paths.is_empty());
        }
    }

    /// 被追踪的事务数（反向索引大小）。
    pub fn tracked_transactions(&self) -> usize {
        self.by_transaction.len()
    }

    /// 某路径上的存活观察者数量。
    pub fn observer_count(&self, path: &str) -> usize {
        self.by_path
            .get(path)
            .map(|entries| entries.iter().filter(|entry| entry.live().is_some()).count())
            .unwrap_or(0)
    }
}

/// `retain` 谓词：保留存活条目，失效条目的事务号记入 `dead`。
fn keep_live(entry: &ObserverEntry, dead: &mut Vec<TransactionId>) -> bool {
    if entry.live().is_some() {
        true
    } else {
        dead.push(entry.transaction);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        message::{Method, Request},
        namespace::{ResourceDescriptor, ResourceNamespace},
        path::ROOT,
    };

    fn topic() -> Arc<ResourceNode> {
        let ns = ResourceNamespace::new();
        ns.insert(ROOT, "t", ResourceDescriptor::topic()).expect("topic")
    }

    fn observe_tx(port: u16, token: &'static [u8]) -> Transaction {
        let request = Request::new(Method::Get, "t", SocketAddr::from(([10, 0, 0, 1], port)))
            .token(Token::new(token))
            .observe(0);
        Transaction::new(request)
    }

    #[test]
    fn register_is_idempotent_per_transaction() {
        let node = topic();
        let registry = ObserverRegistry::new();
        let tx = observe_tx(1000, b"a");
        let first = registry.register(&node, &tx);
        let second = registry.register(&node, &tx);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.notify(&node).len(), 1);
    }

    #[test]
    fn dropped_handles_are_pruned_lazily() {
        let node = topic();
        let registry = ObserverRegistry::new();
        let kept = registry.register(&node, &observe_tx(1000, b"a"));
        let dropped = registry.register(&node, &observe_tx(1001, b"b"));
        drop(dropped);
        let live = registry.notify(&node);
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(&live[0], &kept));
    }

    #[test]
    fn unregister_cancels_all_entries_of_transaction() {
        let node = topic();
        let registry = ObserverRegistry::new();
        let tx = observe_tx(1000, b"a");
        let observation = registry.register(&node, &tx);
        assert_eq!(registry.unregister(tx.id()), 1);
        assert!(observation.is_cancelled());
        assert!(registry.notify(&node).is_empty());
        assert_eq!(registry.unregister(tx.id()), 0);
    }

    /// 丢弃观察句柄（连接丢失）后，正反两张索引都会在下一次遍历时排空。
    #[test]
    fn dropped_handles_drain_both_indexes() {
        let node = topic();
        let registry = ObserverRegistry::new();
        for port in 0..200u16 {
            let observation = registry.register(&node, &observe_tx(2000 + port, b"x"));
            drop(observation);
        }
        assert!(registry.notify(&node).is_empty());
        assert_eq!(registry.tracked_transactions(), 0);
        assert!(registry.by_path.is_empty());
    }

    #[test]
    fn register_prunes_dead_reverse_entries() {
        let node = topic();
        let registry = ObserverRegistry::new();
        drop(registry.register(&node, &observe_tx(1000, b"a")));
        let kept = registry.register(&node, &observe_tx(1001, b"b"));
        assert_eq!(registry.tracked_transactions(), 1);
        assert_eq!(registry.notify(&node).len(), 1);
        drop(kept);
    }

    #[test]
    fn cancel_matches_endpoint_and_token() {
        let node = topic();
        let registry = ObserverRegistry::new();
        let tx = observe_tx(1000, b"a");
        let _observation = registry.register(&node, &tx);
        let peer = SocketAddr::from(([10, 0, 0, 1], 1000));
        assert!(!registry.cancel("/t", peer, &Token::new(&b"z"[..])));
        assert!(registry.cancel("/t", peer, &Token::new(&b"a"[..])));
        assert_eq!(registry.observer_count("/t"), 0);
    }
}
