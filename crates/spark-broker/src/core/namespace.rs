//! # ResourceNamespace：层级资源命名空间
//!
//! ## 核心意图（Why）
//! - 将绝对路径映射到资源节点，支撑分发器的查找、插入、删除与父子遍历；
//! - 命名空间是唯一所有者：节点是否存在完全由树成员关系决定。
//!
//! ## 行为契约（What）
//! - `resolve`：精确匹配；根路径 `/` 永远返回 NotFound；
//! - `insert`：父路径缺失返回 NotFound，同名子节点已存在返回 Conflict；
//! - `remove`：摘除节点及其整棵子树，返回被摘除的节点；在途事务持有的 `Arc<ResourceNode>` 仍然有效；
//! - 节点路径恒等于 `parent.path + "/" + name`，父节点的子列表与节点表在同一把写锁内更新。
//!
//! ## 并发模型（How）
//! - 整棵树由一把 `parking_lot::RwLock` 保护：只读解析取读锁，插入/删除取写锁；
//! - 读者只会看到完整链接的节点，不存在“已入表但未挂到父节点”的中间态；
//! - [`ResourceNamespace::remove_with`] 允许调用方在同一把写锁内先取观察者快照再摘除节点。

use std::{
    borrow::ToOwned,
    collections::HashMap,
    fmt,
    string::String,
    sync::Arc,
    vec::Vec,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{
    core::{
        message::ContentFormat,
        path::{self, ROOT},
        resource_layer::ResourceHandler,
    },
    error::BrokerError,
};

/// 新建资源时使用的描述符。
///
/// - `handler` 为空时资源是纯数据节点（主题），GET 返回载荷、PUT 覆盖载荷；
/// - 非空时方法由处理器渲染，例如资源目录的注册与查询资源。
#[derive(Clone, Default)]
pub struct ResourceDescriptor {
    pub content_format: ContentFormat,
    pub resource_types: Vec<String>,
    pub payload: Bytes,
    pub observable: bool,
    pub handler: Option<Arc<dyn ResourceHandler>>,
}

impl ResourceDescriptor {
    /// 主题资源：空载荷、默认内容格式、可观察。
    pub fn topic() -> Self {
        Self {
            observable: true,
            ..Self::default()
        }
    }

    /// 由处理器驱动的资源。
    pub fn handled(handler: Arc<dyn ResourceHandler>) -> Self {
        Self {
            handler: Some(handler),
            ..Self::default()
        }
    }

    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.content_format = format;
        self
    }

    pub fn with_resource_type(mut self, rt: impl Into<String>) -> Self {
        self.resource_types.push(rt.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        self
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("content_format", &self.content_format)
            .field("resource_types", &self.resource_types)
            .field("payload_len", &self.payload.len())
            .field("observable", &self.observable)
            .field("handled", &self.handler.is_some())
            .finish()
    }
}

/// 资源在某一时刻的表示快照。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Representation {
    pub payload: Bytes,
    pub content_format: ContentFormat,
    pub observe_count: u32,
}

#[derive(Debug)]
struct ResourceState {
    payload: Bytes,
    content_format: ContentFormat,
    observe_count: u32,
}

/// 命名空间中的资源节点。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `name`/`path`/`parent` 在节点生命周期内不变，父引用仅记录路径，不持有所有权；
///   - `observe_count` 在每次成功的可观察状态变更后单调递增；
///   - 节点被摘除后仍可读取，但不再能被 `resolve` 命中。
pub struct ResourceNode {
    name: String,
    path: String,
    parent: Option<String>,
    resource_types: Vec<String>,
    observable: bool,
    handler: Option<Arc<dyn ResourceHandler>>,
    state: Mutex<ResourceState>,
}

impl ResourceNode {
    fn new(name: String, path: String, parent: Option<String>, descriptor: ResourceDescriptor) -> Self {
        Self {
            name,
            path,
            parent,
            resource_types: descriptor.resource_types,
            observable: descriptor.observable,
            handler: descriptor.handler,
            state: Mutex::new(ResourceState {
                payload: descriptor.payload,
                content_format: descriptor.content_format,
                observe_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 父节点路径；根节点返回 `None`。
    pub fn parent_path(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    pub fn handler(&self) -> Option<&Arc<dyn ResourceHandler>> {
        self.handler.as_ref()
    }

    pub fn observe_count(&self) -> u32 {
        self.state.lock().observe_count
    }

    pub fn content_format(&self) -> ContentFormat {
        self.state.lock().content_format
    }

    pub fn representation(&self) -> Representation {
        let state = self.state.lock();
        Representation {
            payload: state.payload.clone(),
            content_format: state.content_format,
            observe_count: state.observe_count,
        }
    }

    /// 原地替换内容并递增观察计数，节点身份保持不变。
    ///
    /// `content_format == None` 时保留原内容格式。
    pub(crate) fn update(&self, payload: Bytes, content_format: Option<ContentFormat>) -> Representation {
        let mut state = self.state.lock();
        state.payload = payload;
        if let Some(format) = content_format {
            state.content_format = format;
        }
        state.observe_count = state.observe_count.wrapping_add(1);
        Representation {
            payload: state.payload.clone(),
            content_format: state.content_format,
            observe_count: state.observe_count,
        }
    }

    /// 仅递增观察计数，用于处理器驱动资源的状态变化。
    pub(crate) fn touch(&self) -> u32 {
        let mut state = self.state.lock();
        state.observe_count = state.observe_count.wrapping_add(1);
        state.observe_count
    }
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceNode")
            .field("path", &self.path)
            .field("observe_count", &self.observe_count())
            .field("handled", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Entry {
    node: Arc<ResourceNode>,
    children: Vec<String>,
}

#[derive(Debug)]
struct Tree {
    entries: HashMap<String, Entry>,
}

impl Tree {
    fn with_root() -> Self {
        let root = ResourceNode::new(String::new(), ROOT.to_owned(), None, ResourceDescriptor::default());
        let mut entries = HashMap::new();
        entries.insert(
            ROOT.to_owned(),
            Entry {
                node: Arc::new(root),
                children: Vec::new(),
            },
        );
        Self { entries }
    }

    fn link_child(
        &mut self,
        parent: &str,
        name: &str,
        descriptor: ResourceDescriptor,
    ) -> Result<Arc<ResourceNode>, BrokerError> {
        let child_path = path::join(parent, name);
        let node = Arc::new(ResourceNode::new(
            name.to_owned(),
            child_path.clone(),
            Some(parent.to_owned()),
            descriptor,
        ));
        let parent_entry = self
            .entries
            .get_mut(parent)
            .ok_or_else(|| BrokerError::not_found(parent))?;
        parent_entry.children.push(name.to_owned());
        self.entries.insert(
            child_path,
            Entry {
                node: Arc::clone(&node),
                children: Vec::new(),
            },
        );
        Ok(node)
    }

    /// 先序收集子树节点路径，目标节点在首位。
    fn subtree(&self, path: &str) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut stack = vec![path.to_owned()];
        while let Some(current) = stack.pop() {
            if let Some(entry) = self.entries.get(&current) {
                for child in entry.children.iter().rev() {
                    stack.push(path::join(&current, child));
                }
                ordered.push(current);
            }
        }
        ordered
    }
}

/// 层级资源命名空间。
#[derive(Debug)]
pub struct ResourceNamespace {
    tree: RwLock<Tree>,
}

impl Default for ResourceNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceNamespace {
    /// 创建只含根节点的命名空间。
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::with_root()),
        }
    }

    /// 精确查找资源；根路径不可解析。
    ///
    /// - **输入**：规范化后的绝对路径（见 [`path::normalize`]）；
    /// - **输出**：命中时返回节点的共享引用，未命中或为根时返回 [`BrokerError::NotFound`]；
    /// - **风险提示**：返回后读锁即释放，调用方拿到的节点可能随即被摘除；需要“仍在树上”
    ///   这一前提的后续操作应改用 [`ResourceNamespace::with_linked`]。
    pub fn resolve(&self, path: &str) -> Result<Arc<ResourceNode>, BrokerError> {
        if path == ROOT {
            return Err(BrokerError::not_found(path));
        }
        self.tree
            .read()
            .entries
            .get(path)
            .map(|entry| Arc::clone(&entry.node))
            .ok_or_else(|| BrokerError::not_found(path))
    }

    /// 在读锁内确认 `node` 仍挂在树上，并在持锁期间执行 `f`。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：观察登记必须与删除快照互斥，否则删除之后才落地的登记既收不到 4.04，
    ///   又会残留在路径上，被同名新资源的推送命中；
    /// - **契约 (What)**：同路径下的节点须与 `node` 为同一个 `Arc`，否则返回 NotFound 且不调用 `f`；
    /// - **前置条件**：`f` 不得再访问命名空间的写操作，否则会死锁。
    pub fn with_linked<T>(&self, node: &Arc<ResourceNode>, f: impl FnOnce() -> T) -> Result<T, BrokerError> {
        let tree = self.tree.read();
        match tree.entries.get(node.path()) {
            Some(entry) if Arc::ptr_eq(&entry.node, node) => Ok(f()),
            _ => Err(BrokerError::not_found(node.path())),
        }
    }

    /// 路径是否存在（含根）。
    pub fn contains(&self, path: &str) -> bool {
        self.tree.read().entries.contains_key(path)
    }

    /// 在 `parent` 下插入名为 `name` 的子节点。
    ///
    /// # 教案式说明
    /// - **参数**：
    ///   - `parent`：规范化后的父路径，可以是根；
    ///   - `name`：单个路径段，不得为空、`.`、`..` 或包含 `/`；
    ///   - `descriptor`：新节点的初始内容与处理器。
    /// - **前置条件**：父路径存在，同名子节点不存在。
    /// - **后置条件**：节点表与父节点子列表在同一把写锁内更新，读者要么看不到新节点，
    ///   要么看到完整链接的新节点；新节点观察计数为 0。
    /// - **错误**：父路径缺失返回 NotFound，同名冲突返回 Conflict，名称非法返回 Validation。
    pub fn insert(
        &self,
        parent: &str,
        name: &str,
        descriptor: ResourceDescriptor,
    ) -> Result<Arc<ResourceNode>, BrokerError> {
        path::validate_segment(name)?;
        let mut tree = self.tree.write();
        if !tree.entries.contains_key(parent) {
            return Err(BrokerError::not_found(parent));
        }
        let child_path = path::join(parent, name);
        if tree.entries.contains_key(&child_path) {
            return Err(BrokerError::conflict(&child_path));
        }
        tree.link_child(parent, name, descriptor)
    }

    /// 插入子节点；若并发请求已抢先创建同名节点，则返回既有节点。
    ///
    /// # 教案式说明
    /// - **输入**：规范化的父路径、单个路径段、新节点的描述；
    /// - **前置条件**：父节点存在，`name` 为合法路径段；
    /// - **后置条件**：检查与链接在同一次写锁内完成，并发调用者中恰有一个拿到 `true`；
    ///   既有节点原样返回，本次传入的 `descriptor` 被丢弃；
    /// - **错误**：父节点缺失返回 [`BrokerError::NotFound`]，路径段非法返回
    ///   [`BrokerError::Validation`]。
    pub fn insert_or_get(
        &self,
        parent: &str,
        name: &str,
        descriptor: ResourceDescriptor,
    ) -> Result<(Arc<ResourceNode>, bool), BrokerError> {
        path::validate_segment(name)?;
        let mut tree = self.tree.write();
        if !tree.entries.contains_key(parent) {
            return Err(BrokerError::not_found(parent));
        }
        let child_path = path::join(parent, name);
        if let Some(existing) = tree.entries.get(&child_path) {
            return Ok((Arc::clone(&existing.node), false));
        }
        tree.link_child(parent, name, descriptor).map(|node| (node, true))
    }

    /// 摘除节点及其子树，返回被摘除的节点（目标在首位，先序）。
    pub fn remove(&self, path: &str) -> Result<Vec<Arc<ResourceNode>>, BrokerError> {
        self.remove_with(path, |_| ()).map(|(nodes, ())| nodes)
    }

    /// 在同一把写锁内：先以即将摘除的子树调用 `before`，再执行摘除。
    ///
    /// - `before` 不得再访问命名空间，否则会死锁；
    /// - 目标不存在（或为根）时 `before` 不会被调用。
    pub fn remove_with<T>(
        &self,
        path: &str,
        before: impl FnOnce(&[Arc<ResourceNode>]) -> T,
    ) -> Result<(Vec<Arc<ResourceNode>>, T), BrokerError> {
        self.remove_guarded(path, |_| true, before)
    }

    /// 与 [`ResourceNamespace::remove_with`] 相同，但先在写锁内以目标节点询问 `condition`。
    ///
    /// - **契约 (What)**：`condition` 返回 `false` 时不摘除任何节点、不调用 `before`，
    ///   返回 [`BrokerError::Conflict`]，表示目标仍被占用；
    /// - **用途**：后台清扫在摘除前复核外部状态，复核与摘除之间不会插入新的插入操作。
    pub fn remove_guarded<T>(
        &self,
        path: &str,
        condition: impl FnOnce(&ResourceNode) -> bool,
        before: impl FnOnce(&[Arc<ResourceNode>]) -> T,
    ) -> Result<(Vec<Arc<ResourceNode>>, T), BrokerError> {
        if path == ROOT {
            return Err(BrokerError::not_found(path));
        }
        let mut tree = self.tree.write();
        let target = tree
            .entries
            .get(path)
            .map(|entry| Arc::clone(&entry.node))
            .ok_or_else(|| BrokerError::not_found(path))?;
        if !condition(&target) {
            return Err(BrokerError::conflict(path));
        }
        let doomed = tree.subtree(path);
        let nodes: Vec<Arc<ResourceNode>> = doomed
            .iter()
            .filter_map(|p| tree.entries.get(p).map(|entry| Arc::clone(&entry.node)))
            .collect();
        let carried = before(&nodes);

        if let Some((parent, name)) = path::split_parent(path) {
            if let Some(parent_entry) = tree.entries.get_mut(parent) {
                parent_entry.children.retain(|child| child != name);
            }
        }
        for p in &doomed {
            tree.entries.remove(p);
        }
        Ok((nodes, carried))
    }

    /// 按插入顺序列出直接子节点；`path` 可以是根。
    pub fn children(&self, path: &str) -> Result<Vec<Arc<ResourceNode>>, BrokerError> {
        let tree = self.tree.read();
        let entry = tree
            .entries
            .get(path)
            .ok_or_else(|| BrokerError::not_found(path))?;
        Ok(entry
            .children
            .iter()
            .filter_map(|name| tree.entries.get(&path::join(path, name)))
            .map(|child| Arc::clone(&child.node))
            .collect())
    }

    /// 根下的顶层资源。
    pub fn top_level(&self) -> Vec<Arc<ResourceNode>> {
        self.children(ROOT).unwrap_or_default()
    }

    /// 全部非根节点，按路径排序。
    pub fn nodes(&self) -> Vec<Arc<ResourceNode>> {
        let tree = self.tree.read();
        let mut nodes: Vec<_> = tree
            .entries
            .iter()
            .filter(|(path, _)| path.as_str() != ROOT)
            .map(|(_, entry)| Arc::clone(&entry.node))
            .collect();
        nodes.sort_by(|a, b| a.path().cmp(b.path()));
        nodes
    }

    /// 非根节点数量。
    pub fn len(&self) -> usize {
        self.tree.read().entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
