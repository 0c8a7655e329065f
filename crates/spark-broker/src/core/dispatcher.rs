//! # RequestDispatcher：按方法分发的事务状态机
//!
//! ## 核心意图（Why）
//! - 传输层的唯一入口：接收已填充请求的 [`Transaction`]，原样交还填好响应（或确定不回复）的事务；
//! - 负责主题前缀下的 PUT 自动建档，以及删除时对观察者的带外推送。
//!
//! ## 行为契约（What）
//! - 状态沿 `Received → Resolved → (Handled | Error) → Responded` 前进；
//! - 未识别的方法码不构造响应，直接 `Received → Responded`；
//! - 所有 [`BrokerError`] 就地折算为响应码，不会逃逸给传输层；
//! - 推送经 [`DatagramSink`] 投递，单条失败只记 `warn!`，既不重试也不影响其余观察者和删除事务本身。
//!
//! ## 并发模型（How）
//! - 命名空间的插入/摘除各自在一把写锁内完成；删除时观察者快照与登记表清理在同一把写锁内完成；
//! - 观察登记在命名空间读锁内进行，因此要么先于删除快照（收到 4.04），要么看到节点已摘除（得到 4.04）；
//! - 推送报文在锁外组装并入队，不在持锁期间做任何 I/O。

use std::{borrow::ToOwned, fmt, string::String, sync::Arc, vec::Vec};

use crate::{
    core::{
        message::{MessageType, Method, Response, ResponseCode, Transaction, TransactionState},
        namespace::{Representation, ResourceDescriptor, ResourceNamespace, ResourceNode},
        observe::{Observation, ObserverRegistry},
        outbound::DatagramSink,
        path,
        resource_layer::ResourceLayer,
    },
    error::BrokerError,
};

/// 分发器的路由参数，均为规范化后的绝对路径。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchSettings {
    /// 允许 PUT 自动建档的保留前缀。
    pub topic_prefix: String,
    /// 资源发现入口。
    pub discovery_path: String,
    /// 内容变更推送所用的报文类型；删除推送恒为 `Non`。
    pub notification_type: MessageType,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            topic_prefix: "/ps".to_owned(),
            discovery_path: "/.well-known/core".to_owned(),
            notification_type: MessageType::Non,
        }
    }
}

/// 删除快照中的一项：被摘除节点当时的下一观察序号与存活观察关系。
struct Doomed {
    sequence: u32,
    observers: Vec<Arc<Observation>>,
}

/// 请求分发器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“方法 × 路径是否可解析”的分支集中在一个状态机里，
///   命名空间、观察者登记表与出站通道在构造时显式注入，不依赖全局变量；
/// - **契约 (What)**：[`RequestDispatcher::receive_request`] 对每条入站请求恰好调用一次；
/// - **风险提示**：处理器回调发生在命名空间锁之外，处理器内部不得假设路径在回调期间仍然存在。
pub struct RequestDispatcher {
    namespace: Arc<ResourceNamespace>,
    observers: Arc<ObserverRegistry>,
    resources: ResourceLayer,
    sink: Arc<dyn DatagramSink>,
    settings: DispatchSettings,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("resources", &self.namespace.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    pub fn new(
        namespace: Arc<ResourceNamespace>,
        observers: Arc<ObserverRegistry>,
        sink: Arc<dyn DatagramSink>,
        settings: DispatchSettings,
    ) -> Self {
        let resources = ResourceLayer::new(Arc::clone(&namespace));
        Self {
            namespace,
            observers,
            resources,
            sink,
            settings,
        }
    }

    pub fn namespace(&self) -> &Arc<ResourceNamespace> {
        &self.namespace
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// 处理一条入站事务并交还。
    pub fn receive_request(&self, mut tx: Transaction) -> Transaction {
        let method = match Method::from_code(tx.request().code) {
            Ok(method) => method,
            Err(err) => {
                tracing::debug!(transaction = %tx.id(), error = %err, "request dropped without response");
                tx.drop_response();
                tx.advance(TransactionState::Responded);
                return tx;
            }
        };

        tx.begin_response();
        tx.advance(TransactionState::Resolved);

        let outcome = path::normalize(&tx.request().uri_path)
            .and_then(|path| self.dispatch(method, &path, &mut tx));
        match outcome {
            Ok(()) => {
                tx.advance(TransactionState::Handled);
            }
            Err(err) => {
                tracing::debug!(transaction = %tx.id(), ?method, error = %err, "request failed");
                match err.response_code() {
                    Some(code) => tx.begin_response().code = Some(code),
                    None => tx.drop_response(),
                }
                tx.advance(TransactionState::Error);
            }
        }
        tx.advance(TransactionState::Responded);
        tx
    }

    fn dispatch(&self, method: Method, path: &str, tx: &mut Transaction) -> Result<(), BrokerError> {
        match method {
            Method::Get => self.handle_get(path, tx),
            Method::Put => self.handle_put(path, tx),
            Method::Post => self.resources.create_resource(path, tx).map(|_| ()),
            Method::Delete => self.handle_delete(path, tx),
        }
    }

    fn handle_get(&self, path: &str, tx: &mut Transaction) -> Result<(), BrokerError> {
        if path == self.settings.discovery_path {
            return self.resources.discover(tx);
        }
        let node = self.namespace.resolve(path)?;
        tx.attach_resource(Arc::clone(&node));
        let representation = self.resources.get_resource(tx)?;

        match tx.request().observe {
            Some(0) if node.is_observable() => {
                let observation = self.observe(&node, tx)?;
                tx.attach_observation(observation);
                tx.response_or_begin().observe = Some(representation.observe_count);
            }
            Some(1) => {
                let request = tx.request();
                self.observers.cancel(path, request.source, &request.token);
            }
            _ => {}
        }
        Ok(())
    }

    /// 在节点仍挂在树上的前提下登记观察；节点已被摘除时返回 NotFound。
    fn observe(&self, node: &Arc<ResourceNode>, tx: &Transaction) -> Result<Arc<Observation>, BrokerError> {
        self.namespace
            .with_linked(node, || self.observers.register(node, tx))
    }

    fn handle_put(&self, path: &str, tx: &mut Transaction) -> Result<(), BrokerError> {
        let (node, created) = match self.namespace.resolve(path) {
            Ok(node) => (node, false),
            Err(BrokerError::NotFound { .. }) if path::is_beneath(path, &self.settings.topic_prefix) => {
                self.auto_create(path)?
            }
            Err(err) => return Err(err),
        };
        tx.attach_resource(Arc::clone(&node));
        let representation = self.resources.update_resource(tx, created)?;
        self.publish(&node, &representation);
        Ok(())
    }

    /// PUT 自动建档：仅补齐最后一级，父节点缺失即 NotFound。
    fn auto_create(&self, path: &str) -> Result<(Arc<ResourceNode>, bool), BrokerError> {
        let (parent, name) = path::split_parent(path).ok_or_else(|| BrokerError::not_found(path))?;
        let (node, created) = self
            .namespace
            .insert_or_get(parent, name, ResourceDescriptor::topic())?;
        if created {
            tracing::info!(path, "topic created on first publish");
        }
        Ok((node, created))
    }

    fn handle_delete(&self, path: &str, tx: &mut Transaction) -> Result<(), BrokerError> {
        let node = self.namespace.resolve(path)?;
        tx.attach_resource(node);
        let doomed = self
            .resources
            .delete_resource(tx, path, |nodes| self.snapshot(nodes))?;
        self.announce_removal(doomed);
        Ok(())
    }

    /// 不经事务摘除子树并推送删除通知，返回推送条数。
    ///
    /// `condition` 在写锁内以目标节点调用，返回 `false` 时放弃摘除并返回 Conflict。
    pub(crate) fn detach_if(
        &self,
        path: &str,
        condition: impl FnOnce(&ResourceNode) -> bool,
    ) -> Result<usize, BrokerError> {
        let (_, doomed) = self
            .namespace
            .remove_guarded(path, condition, |nodes| self.snapshot(nodes))?;
        Ok(self.announce_removal(doomed))
    }

    /// 在命名空间写锁内调用：取存活观察者并清空对应路径的登记。
    fn snapshot(&self, nodes: &[Arc<ResourceNode>]) -> Vec<Doomed> {
        nodes
            .iter()
            .map(|node| {
                let observers = self.observers.notify(node);
                self.observers.forget(node.path());
                Doomed {
                    sequence: node.observe_count().wrapping_add(1),
                    observers,
                }
            })
            .collect()
    }

    fn announce_removal(&self, doomed: Vec<Doomed>) -> usize {
        let mut pushed = 0;
        for entry in doomed {
            for observation in &entry.observers {
                let mut response = Response::new(observation.token().clone(), observation.destination());
                response.code = Some(ResponseCode::NotFound);
                response.observe = Some(entry.sequence);
                response.mtype = Some(MessageType::Non);
                if self.push(observation, response) {
                    pushed += 1;
                }
            }
        }
        if pushed > 0 {
            tracing::debug!(pushed, "removal notifications handed to transport");
        }
        pushed
    }

    /// 向 `node` 的全部存活观察者推送新表示。
    fn publish(&self, node: &ResourceNode, representation: &Representation) {
        if !node.is_observable() {
            return;
        }
        for observation in self.observers.notify(node) {
            let mut response = Response::new(observation.token().clone(), observation.destination());
            response.code = Some(ResponseCode::Content);
            response.observe = Some(representation.observe_count);
            response.mtype = Some(self.settings.notification_type);
            response.content_format = Some(representation.content_format);
            response.payload = representation.payload.clone();
            self.push(&observation, response);
        }
    }

    fn push(&self, observation: &Observation, response: Response) -> bool {
        match self.sink.send_datagram(response) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    path = observation.path(),
                    transaction = %observation.transaction(),
                    error = %err,
                    "observer notification dropped"
                );
                false
            }
        }
    }
}
