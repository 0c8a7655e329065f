//! # 资源层：发现、读取、创建、更新、删除
//!
//! ## 核心意图（Why）
//! - 承接分发器解析出的目标，对命名空间执行方法语义，并把结果写入事务响应；
//! - 通过 [`ResourceHandler`] 让个别资源（如资源目录的注册与查询入口）接管自己的方法渲染，
//!   其余资源按“主题”默认语义处理：GET 返回载荷，PUT 覆盖载荷，POST 创建子主题。
//!
//! ## 行为契约（What）
//! - 每个操作接收 `&mut Transaction`，成功时设置响应码与载荷，失败时返回 [`BrokerError`]，
//!   由分发器统一折算为响应码；
//! - 响应码约定：读取/发现→2.05，创建→2.01，更新→2.04（新建后的首次更新保持 2.01），删除→2.02。

use std::{
    borrow::ToOwned,
    fmt,
    string::String,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    vec::Vec,
};

use bytes::Bytes;

use crate::{
    core::{
        link_format::{self, Link},
        message::{ContentFormat, Method, Request, ResponseCode, Transaction},
        namespace::{Representation, ResourceDescriptor, ResourceNamespace, ResourceNode},
        path,
    },
    error::BrokerError,
};

/// 处理器对 POST 的裁决。
#[derive(Debug)]
pub enum PostOutcome {
    /// 按通用规则在目标下创建子资源（链接格式载荷给出建议名）。
    CreateChild,
    /// 创建或沿用处理器指定的子资源。
    ///
    /// `refreshed == true` 且节点已存在时响应 2.04，否则 2.01。
    Child {
        name: String,
        descriptor: ResourceDescriptor,
        refreshed: bool,
    },
    /// 资源自身状态已变化，无需新建节点。
    Changed { payload: Bytes },
}

/// 资源自定义方法渲染。
///
/// # 教案式说明
/// - **契约 (What)**：所有方法都有默认实现，默认行为即主题语义；
///   `render_put` 与 `render_delete` 在变更之前调用，返回错误即拒绝请求；
/// - **前置条件**：调用时命名空间锁未被持有，处理器可以自由访问自己的共享状态；
/// - **风险提示**：`render_delete` 成功后摘除仍可能因并发删除而失败（NotFound），
///   处理器在其中执行的副作用须能容忍这种情况。
pub trait ResourceHandler: Send + Sync + fmt::Debug {
    fn render_get(&self, node: &ResourceNode, _request: &Request) -> Result<Representation, BrokerError> {
        Ok(node.representation())
    }

    fn render_post(&self, _node: &ResourceNode, _request: &Request) -> Result<PostOutcome, BrokerError> {
        Ok(PostOutcome::CreateChild)
    }

    fn render_put(&self, _node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Ok(())
    }

    fn render_delete(&self, _node: &ResourceNode, _request: &Request) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// 构造 [`BrokerError::MethodNotAllowed`] 的便捷函数，供处理器使用。
pub fn method_not_allowed(node: &ResourceNode, method: Method) -> BrokerError {
    BrokerError::MethodNotAllowed {
        path: node.path().to_owned(),
        method,
    }
}

/// 资源层协作者。
#[derive(Debug)]
pub struct ResourceLayer {
    namespace: Arc<ResourceNamespace>,
    next_name: AtomicU64,
}

impl ResourceLayer {
    /// 以共享命名空间构造资源层。
    ///
    /// - **输入**：与分发器共用的命名空间，资源层不持有任何独立的资源状态；
    /// - **输出**：服务端分配名从 `1` 开始以十六进制递增，仅用于无载荷的 POST 建档；
    /// - **后置条件**：构造本身不修改命名空间。
    pub fn new(namespace: Arc<ResourceNamespace>) -> Self {
        Self {
            namespace,
            next_name: AtomicU64::new(1),
        }
    }

    /// 发现：以链接格式列出顶层资源，支持 `rt=` 过滤。
    pub fn discover(&self, tx: &mut Transaction) -> Result<(), BrokerError> {
        let rt_filter = tx.request().query_value("rt").map(str::to_owned);
        let links: Vec<Link> = self
            .namespace
            .top_level()
            .iter()
            .filter(|node| match rt_filter.as_deref() {
                Some(rt) => node.resource_types().iter().any(|t| t == rt),
                None => true,
            })
            .map(|node| describe(node))
            .collect();
        let payload = link_format::render(&links);
        let response = tx.response_or_begin();
        response.code = Some(ResponseCode::Content);
        response.content_format = Some(ContentFormat::LINK_FORMAT);
        response.payload = Bytes::from(payload);
        Ok(())
    }

    /// 读取事务已挂载的资源。
    pub fn get_resource(&self, tx: &mut Transaction) -> Result<Representation, BrokerError> {
        let node = attached(tx)?;
        let representation = match node.handler() {
            Some(handler) => handler.render_get(&node, tx.request())?,
            None => node.representation(),
        };
        let response = tx.response_or_begin();
        response.code = Some(ResponseCode::Content);
        response.content_format = Some(representation.content_format);
        response.payload = representation.payload.clone();
        Ok(representation)
    }

    /// 在 `path` 下创建子资源，或交给该资源的处理器。
    pub fn create_resource(&self, path: &str, tx: &mut Transaction) -> Result<Arc<ResourceNode>, BrokerError> {
        let parent = self.namespace.resolve(path)?;
        tx.attach_resource(Arc::clone(&parent));
        let outcome = match parent.handler() {
            Some(handler) => handler.render_post(&parent, tx.request())?,
            None => PostOutcome::CreateChild,
        };

        match outcome {
            PostOutcome::CreateChild => {
                let (name, descriptor) = self.child_from_payload(tx.request())?;
                let child = match name {
                    Some(name) => self.namespace.insert(path, &name, descriptor)?,
                    None => self.insert_server_named(path, descriptor)?,
                };
                tracing::info!(path = child.path(), "resource created on POST");
                respond_created(tx, &child, ResponseCode::Created);
                Ok(child)
            }
            PostOutcome::Child {
                name,
                descriptor,
                refreshed,
            } => {
                let (child, created) = self.namespace.insert_or_get(path, &name, descriptor)?;
                let code = if refreshed && !created {
                    ResponseCode::Changed
                } else {
                    ResponseCode::Created
                };
                respond_created(tx, &child, code);
                Ok(child)
            }
            PostOutcome::Changed { payload } => {
                parent.touch();
                let response = tx.response_or_begin();
                response.code = Some(ResponseCode::Changed);
                response.payload = payload;
                Ok(parent)
            }
        }
    }

    /// 原地更新事务已挂载的资源，返回更新后的表示。
    ///
    /// `created == true` 表示资源刚由本事务创建，响应码保持 2.01。
    pub fn update_resource(&self, tx: &mut Transaction, created: bool) -> Result<Representation, BrokerError> {
        let node = attached(tx)?;
        if let Some(handler) = node.handler() {
            handler.render_put(&node, tx.request())?;
        }
        let request = tx.request();
        let representation = node.update(request.payload.clone(), request.content_format);
        tx.set_code(if created {
            ResponseCode::Created
        } else {
            ResponseCode::Changed
        });
        Ok(representation)
    }

    /// 删除 `path` 处的资源及其子树。
    ///
    /// `before` 在命名空间写锁内、摘除之前以整棵子树调用，用于取观察者快照。
    pub fn delete_resource<T>(
        &self,
        tx: &mut Transaction,
        path: &str,
        before: impl FnOnce(&[Arc<ResourceNode>]) -> T,
    ) -> Result<T, BrokerError> {
        let node = attached(tx)?;
        if let Some(handler) = node.handler() {
            handler.render_delete(&node, tx.request())?;
        }
        let (removed, carried) = self.namespace.remove_with(path, before)?;
        tracing::debug!(path, removed = removed.len(), "resource subtree deleted");
        tx.set_code(ResponseCode::Deleted);
        Ok(carried)
    }

    fn child_from_payload(&self, request: &Request) -> Result<(Option<String>, ResourceDescriptor), BrokerError> {
        let mut descriptor = ResourceDescriptor::topic();
        if request.payload.is_empty() {
            return Ok((None, descriptor));
        }
        let text = std::str::from_utf8(&request.payload)
            .map_err(|err| BrokerError::validation(format!("link payload is not UTF-8: {err}")))?;
        let links = link_format::parse(text)?;
        let link = links
            .first()
            .ok_or_else(|| BrokerError::validation("link payload names no resource"))?;
        let name = link.target().trim_start_matches('/');
        path::validate_segment(name)?;
        if let Some(format) = link.content_format()? {
            descriptor.content_format = format;
        }
        descriptor.resource_types = link.values("rt").map(str::to_owned).collect();
        Ok((Some(name.to_owned()), descriptor))
    }

    fn insert_server_named(&self, parent: &str, descriptor: ResourceDescriptor) -> Result<Arc<ResourceNode>, BrokerError> {
        loop {
            let name = format!("{:x}", self.next_name.fetch_add(1, Ordering::Relaxed));
            match self.namespace.insert(parent, &name, descriptor.clone()) {
                Err(BrokerError::Conflict { .. }) => continue,
                other => return other,
            }
        }
    }
}

fn attached(tx: &Transaction) -> Result<Arc<ResourceNode>, BrokerError> {
    tx.resource()
        .cloned()
        .ok_or_else(|| BrokerError::not_found(&tx.request().uri_path))
}

fn respond_created(tx: &mut Transaction, child: &ResourceNode, code: ResponseCode) {
    let response = tx.response_or_begin();
    response.code = Some(code);
    response.location_path = Some(child.path().trim_start_matches('/').to_owned());
}

/// 资源的发现描述：`<path>;ct=..;rt="..";obs`。
pub(crate) fn describe(node: &ResourceNode) -> Link {
    let mut link = Link::new(node.path()).with_attr("ct", node.content_format().0.to_string());
    if !node.resource_types().is_empty() {
        link = link.with_attr("rt", node.resource_types().join(" "));
    }
    if node.is_observable() {
        link = link.with_flag("obs");
    }
    link
}
