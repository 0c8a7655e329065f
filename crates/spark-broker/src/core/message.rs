//! # 报文与事务模型
//!
//! ## 核心意图（Why）
//! - 描述传输层交给代理核心的“已反序列化请求”，以及核心回填的“待序列化响应”；
//! - 以 [`Transaction`] 绑定一条入站请求与至多一条出站响应，并记录分发状态机的进度。
//!
//! ## 行为契约（What）
//! - 方法码与响应码沿用受限应用协议的数值（`class << 5 | detail`），编码由外部协议层负责；
//! - [`Transaction::begin_response`] 在任何方法相关逻辑之前写入 `destination == source` 与 `token`；
//! - 事务状态只能沿 `Received → Resolved → (Handled | Error) → Responded` 前进，违规跃迁返回 `false`。

use std::{
    fmt,
    net::SocketAddr,
    string::String,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    vec::Vec,
};

use bytes::Bytes;

use crate::{
    core::{namespace::ResourceNode, observe::Observation},
    error::BrokerError,
};

/// 请求方法的封闭枚举。
///
/// - **契约 (What)**：仅覆盖 GET/POST/PUT/DELETE；其余方法码在 [`Method::from_code`] 处被拒绝，
///   由分发器走“静默丢弃”分支。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// 返回协议方法码（`0.01` ~ `0.04`）。
    pub const fn code(self) -> u8 {
        match self {
            Method::Get => 1,
            Method::Post => 2,
            Method::Put => 3,
            Method::Delete => 4,
        }
    }

    /// 解析原始方法码。
    pub fn from_code(code: u8) -> Result<Self, BrokerError> {
        match code {
            1 => Ok(Method::Get),
            2 => Ok(Method::Post),
            3 => Ok(Method::Put),
            4 => Ok(Method::Delete),
            other => Err(BrokerError::UnsupportedMethod { code: other }),
        }
    }
}

impl TryFrom<u8> for Method {
    type Error = BrokerError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Method::from_code(code)
    }
}

/// 核心使用到的响应码。
///
/// # 教案式说明
/// - **意图 (Why)**：避免在业务代码中散落魔数，同时保留协议数值以便传输层直接编码；
/// - **契约 (What)**：`as_u8` 返回 `class << 5 | detail`，`Display` 输出 `c.dd` 形式。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum ResponseCode {
    Created = 65,
    Deleted = 66,
    Changed = 68,
    Content = 69,
    BadRequest = 128,
    NotFound = 132,
    MethodNotAllowed = 133,
    Conflict = 137,
}

impl ResponseCode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn class(self) -> u8 {
        self.as_u8() >> 5
    }

    pub const fn detail(self) -> u8 {
        self.as_u8() & 0x1f
    }

    /// 是否属于 2.xx 成功类。
    pub const fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// 报文类型。观察者推送使用 `Non`（不可靠确认）。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageType {
    Con,
    Non,
    Ack,
    Rst,
}

/// 内容格式描述符（协议注册号）。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    pub const LINK_FORMAT: ContentFormat = ContentFormat(40);
    pub const JSON: ContentFormat = ContentFormat(50);
}

impl Default for ContentFormat {
    fn default() -> Self {
        ContentFormat::TEXT_PLAIN
    }
}

/// 请求令牌，响应必须原样回带。
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Token(Bytes);

impl Token {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// 事务标识，由 [`Transaction::new`] 单调分配。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TransactionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// 已反序列化的入站请求。
///
/// - `code` 保留原始方法码，方法识别推迟到分发器；
/// - `uri_path` 不含前导 `/`，与传输层解析出的 Uri-Path 选项拼接结果一致；
/// - `uri_query` 为 `key=value` 或裸 `key` 的列表。
#[derive(Clone, Debug)]
pub struct Request {
    pub code: u8,
    pub uri_path: String,
    pub uri_query: Vec<String>,
    pub token: Token,
    pub source: SocketAddr,
    pub mtype: MessageType,
    pub observe: Option<u32>,
    pub content_format: Option<ContentFormat>,
    pub payload: Bytes,
}

impl Request {
    /// 以方法、路径与源地址构造请求；其余字段取空值，类型默认为 `Con`。
    pub fn new(method: Method, uri_path: impl Into<String>, source: SocketAddr) -> Self {
        Self::with_code(method.code(), uri_path, source)
    }

    /// 以原始方法码构造请求，用于表达协议中未被支持的方法。
    pub fn with_code(code: u8, uri_path: impl Into<String>, source: SocketAddr) -> Self {
        Self {
            code,
            uri_path: uri_path.into(),
            uri_query: Vec::new(),
            token: Token::default(),
            source,
            mtype: MessageType::Con,
            observe: None,
            content_format: None,
            payload: Bytes::new(),
        }
    }

    pub fn token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn query(mut self, item: impl Into<String>) -> Self {
        self.uri_query.push(item.into());
        self
    }

    pub fn observe(mut self, value: u32) -> Self {
        self.observe = Some(value);
        self
    }

    pub fn content_format(mut self, format: ContentFormat) -> Self {
        self.content_format = Some(format);
        self
    }

    pub fn message_type(mut self, mtype: MessageType) -> Self {
        self.mtype = mtype;
        self
    }

    /// 查找首个 `key=value` 查询参数的值；裸 `key` 返回空串。
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.uri_query.iter().find_map(|item| match item.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if item == key => Some(""),
            _ => None,
        })
    }
}

/// 待序列化的出站响应。
///
/// - `code == None` 表示处理尚未给出结论，传输层不应发送这样的响应；
/// - `mtype == None` 交由传输层按请求类型决定（捎带 ACK 或独立 CON/NON）。
#[derive(Clone, Debug)]
pub struct Response {
    pub code: Option<ResponseCode>,
    pub token: Token,
    pub destination: SocketAddr,
    pub mtype: Option<MessageType>,
    pub observe: Option<u32>,
    pub content_format: Option<ContentFormat>,
    pub location_path: Option<String>,
    pub payload: Bytes,
}

impl Response {
    /// 以令牌与目的地址构造空响应。
    pub fn new(token: Token, destination: SocketAddr) -> Self {
        Self {
            code: None,
            token,
            destination,
            mtype: None,
            observe: None,
            content_format: None,
            location_path: None,
            payload: Bytes::new(),
        }
    }
}

/// 事务在分发器中的进度。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionState {
    /// 传输层交付，尚未解析路径。
    Received,
    /// 路径已规范化，响应骨架已写入。
    Resolved,
    /// 方法处理成功。
    Handled,
    /// 方法处理以错误收尾，错误已折算为响应码。
    Error,
    /// 响应已挂载（或确定不回复），交还传输层。
    Responded,
}

impl TransactionState {
    /// 判断是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, target),
            (Received, Resolved)
                | (Received, Responded)
                | (Resolved, Handled)
                | (Resolved, Error)
                | (Handled, Responded)
                | (Error, Responded)
        )
    }
}

/// 一条入站请求与至多一条出站响应的绑定。
///
/// # 教案式说明
/// - **生命周期**：由传输层按入站报文创建，交给分发器修改，随后被传输层消费并丢弃，不复用；
/// - **契约 (What)**：
///   - `response` 为 `None` 表示不回复；
///   - `resource` 为分发期间解析到的资源节点，节点被删除后引用仍然有效；
///   - `observation` 在 GET 携带 Observe=0 时由分发器填充，传输层持有它即保持订阅存活。
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    request: Request,
    response: Option<Response>,
    resource: Option<Arc<ResourceNode>>,
    observation: Option<Arc<Observation>>,
}

impl Transaction {
    pub fn new(request: Request) -> Self {
        Self {
            id: TransactionId::next(),
            state: TransactionState::Received,
            request,
            response: None,
            resource: None,
            observation: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response> {
        self.response.as_mut()
    }

    /// 取出响应，交给传输层序列化。
    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }

    pub fn resource(&self) -> Option<&Arc<ResourceNode>> {
        self.resource.as_ref()
    }

    pub fn observation(&self) -> Option<&Arc<Observation>> {
        self.observation.as_ref()
    }

    /// 推进状态机；违规跃迁时保持原状态并返回 `false`。
    pub(crate) fn advance(&mut self, target: TransactionState) -> bool {
        if self.state.can_transition_to(target) {
            self.state = target;
            true
        } else {
            false
        }
    }

    /// 写入响应骨架：`destination = source`，`token` 原样回带。
    pub(crate) fn begin_response(&mut self) -> &mut Response {
        let response = Response::new(self.request.token.clone(), self.request.source);
        self.response.insert(response)
    }

    /// 返回已有响应；骨架尚未建立时先建立。
    pub(crate) fn response_or_begin(&mut self) -> &mut Response {
        let Self {
            request, response, ..
        } = self;
        response.get_or_insert_with(|| Response::new(request.token.clone(), request.source))
    }

    pub(crate) fn set_code(&mut self, code: ResponseCode) {
        self.response_or_begin().code = Some(code);
    }

    pub(crate) fn drop_response(&mut self) {
        self.response = None;
    }

    pub(crate) fn attach_resource(&mut self, node: Arc<ResourceNode>) {
        self.resource = Some(node);
    }

    pub(crate) fn attach_observation(&mut self, observation: Arc<Observation>) {
        self.observation = Some(observation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5683))
    }

    #[test]
    fn method_codes_are_closed() {
        for method in [Method::Get, Method::Post, Method::Put, Method::Delete] {
            assert_eq!(Method::from_code(method.code()), Ok(method));
        }
        assert_eq!(
            Method::try_from(5),
            Err(BrokerError::UnsupportedMethod { code: 5 })
        );
    }

    #[test]
    fn response_code_display_uses_class_detail() {
        assert_eq!(ResponseCode::Content.to_string(), "2.05");
        assert_eq!(ResponseCode::NotFound.to_string(), "4.04");
        assert_eq!(ResponseCode::Conflict.to_string(), "4.09");
        assert!(ResponseCode::Created.is_success());
        assert!(!ResponseCode::BadRequest.is_success());
    }

    #[test]
    fn begin_response_mirrors_source_and_token() {
        let request = Request::new(Method::Get, "a", source()).token(Token::new(&b"\x01\x02"[..]));
        let mut tx = Transaction::new(request);
        let response = tx.begin_response();
        assert_eq!(response.destination, source());
        assert_eq!(response.token.as_bytes(), &[1, 2]);
        assert!(response.code.is_none());
    }

    #[test]
    fn state_machine_rejects_skipping_resolution() {
        let mut tx = Transaction::new(Request::new(Method::Get, "a", source()));
        assert!(!tx.advance(TransactionState::Handled));
        assert!(tx.advance(TransactionState::Resolved));
        assert!(tx.advance(TransactionState::Error));
        assert!(!tx.advance(TransactionState::Handled));
        assert!(tx.advance(TransactionState::Responded));
        assert_eq!(tx.state(), TransactionState::Responded);
    }

    #[test]
    fn query_value_handles_bare_keys() {
        let request = Request::new(Method::Get, "rd-lookup/res", source())
            .query("rt=temperature")
            .query("obs");
        assert_eq!(request.query_value("rt"), Some("temperature"));
        assert_eq!(request.query_value("obs"), Some(""));
        assert_eq!(request.query_value("ep"), None);
    }
}
