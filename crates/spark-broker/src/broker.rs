//! # Broker：按配置装配的代理实例
//!
//! ## 核心意图（Why）
//! - 把命名空间、观察者登记表、分发器与资源目录按 [`BrokerConfig`] 一次性装配好，
//!   传输层只需面对 [`Broker::receive_request`] 与 [`Broker::connection_lost`] 两个入口；
//! - 目录条目过期后，同时回收命名空间中的 `rd/<ep>` 入口并通知其观察者；
//!   清扫与重新注册并发时，摘除前在命名空间写锁内复核目录，仍存活的注册保留原节点。
//!
//! ## 装配顺序（How）
//! 1. 校验配置并得到规范化的分发参数；
//! 2. 逐段创建主题前缀（末段标注 `rt="core.ps"`）；
//! 3. 目录启用时挂载 `rd`、`rd-lookup` 系列资源；
//! 4. 构造分发器，注入出站通道。

use std::{borrow::ToOwned, sync::Arc};

use crate::{
    applications::{
        clock::{Clock, SystemClock},
        directory::{DirectoryService, registration_location},
        eviction::{EvictionHandle, ExpirySweep, spawn_eviction},
        rd,
        store::{DirectoryStore, InMemoryDirectoryStore},
    },
    config::BrokerConfig,
    core::{
        dispatcher::RequestDispatcher,
        message::{Transaction, TransactionId},
        namespace::{ResourceDescriptor, ResourceNamespace},
        observe::ObserverRegistry,
        outbound::DatagramSink,
        path::{self, ROOT},
    },
    error::{BrokerError, ConfigError},
};

/// 代理实例。
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    dispatcher: RequestDispatcher,
    directory: Option<Arc<DirectoryService>>,
}

impl Broker {
    /// 以内存目录存储与宿主时钟装配。
    pub fn new(config: BrokerConfig, sink: Arc<dyn DatagramSink>) -> Result<Self, ConfigError> {
        Self::with_components(
            config,
            sink,
            Arc::new(InMemoryDirectoryStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// 注入目录存储与时钟装配，测试以此替换时间轴。
    pub fn with_components(
        config: BrokerConfig,
        sink: Arc<dyn DatagramSink>,
        store: Arc<dyn DirectoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let settings = config.dispatch_settings()?;
        let namespace = Arc::new(ResourceNamespace::new());
        create_prefix(&namespace, &settings.topic_prefix).map_err(|err| ConfigError::Invalid {
            key: "broker.topic_prefix",
            detail: err.to_string(),
        })?;

        let directory = if config.directory.enabled {
            let directory = Arc::new(DirectoryService::new(store, clock, config.directory.settings()));
            rd::install(&namespace, &directory).map_err(|err| ConfigError::Invalid {
                key: "broker.topic_prefix",
                detail: format!("resource directory cannot be mounted: {err}"),
            })?;
            Some(directory)
        } else {
            None
        };

        tracing::info!(
            topic_prefix = %settings.topic_prefix,
            discovery_path = %settings.discovery_path,
            directory = directory.is_some(),
            "broker assembled"
        );
        let dispatcher = RequestDispatcher::new(
            namespace,
            Arc::new(ObserverRegistry::new()),
            sink,
            settings,
        );
        Ok(Self {
            config,
            dispatcher,
            directory,
        })
    }

    /// 传输层入口：每条入站请求调用一次。
    pub fn receive_request(&self, transaction: Transaction) -> Transaction {
        self.dispatcher.receive_request(transaction)
    }

    /// 连接丢失：移除该事务的全部观察关系，返回移除条数。
    pub fn connection_lost(&self, transaction: TransactionId) -> usize {
        self.dispatcher.observers().unregister(transaction)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Arc<ResourceNamespace> {
        self.dispatcher.namespace()
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        self.dispatcher.observers()
    }

    pub fn directory(&self) -> Option<&Arc<DirectoryService>> {
        self.directory.as_ref()
    }

    /// 清除过期注册并摘除对应的 `rd/<ep>` 资源，返回清除的注册数。
    pub fn evict_expired(&self) -> usize {
        let Some(directory) = &self.directory else {
            return 0;
        };
        let evicted = directory.evict_expired();
        for endpoint in &evicted {
            self.retire_registration(directory, endpoint);
        }
        evicted.len()
    }

    /// 摘除 `rd/<ep>` 节点，前提是目录里已查不到该终端。
    ///
    /// - **前置条件**：`endpoint` 刚被目录清扫移除；
    /// - **后置条件**：复核在命名空间写锁内完成；此刻终端已重新注册则节点与观察者原样保留，
    ///   否则节点被摘除，观察者收到 4.04 通知。返回是否摘除。
    fn retire_registration(&self, directory: &DirectoryService, endpoint: &str) -> bool {
        let location = format!("/{}", registration_location(endpoint));
        match self
            .dispatcher
            .detach_if(&location, |_| directory.lookup_by_endpoint(endpoint).is_err())
        {
            Ok(notified) => {
                tracing::debug!(endpoint, notified, "registration resource removed after expiry");
                true
            }
            Err(BrokerError::Conflict { .. }) => {
                tracing::debug!(endpoint, "endpoint re-registered during sweep, resource kept");
                false
            }
            Err(BrokerError::NotFound { .. }) => false,
            Err(err) => {
                tracing::warn!(endpoint, error = %err, "failed to remove expired registration resource");
                false
            }
        }
    }

    /// 启动周期清扫；目录未启用时返回 `None`。须在 Tokio 运行时内调用。
    pub fn spawn_eviction(self: &Arc<Self>) -> Option<EvictionHandle> {
        self.directory.as_ref()?;
        Some(spawn_eviction(
            Arc::clone(self),
            self.config.directory.eviction_interval(),
        ))
    }
}

impl ExpirySweep for Broker {
    fn sweep(&self) -> usize {
        self.evict_expired()
    }
}

/// 逐段补齐前缀路径；末段标注为发布订阅入口。
fn create_prefix(namespace: &ResourceNamespace, prefix: &str) -> Result<(), BrokerError> {
    let mut parent = ROOT.to_owned();
    let mut segments = prefix.trim_start_matches('/').split('/').peekable();
    while let Some(segment) = segments.next() {
        let mut descriptor = ResourceDescriptor::topic();
        if segments.peek().is_none() {
            descriptor = descriptor.with_resource_type("core.ps");
        }
        namespace.insert_or_get(&parent, segment, descriptor)?;
        parent = path::join(&parent, segment);
    }
    Ok(())
}
