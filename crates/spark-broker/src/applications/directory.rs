//! # DirectoryService：带寿命的终端注册与按属性查询
//!
//! ## 核心意图（Why）
//! - 让远端终端登记“我是谁、在哪、提供哪些资源类型”，并让客户端按资源类型或终端名查找；
//! - 注册信息落在可替换的 [`DirectoryStore`] 中，寿命判断由注入的 [`Clock`] 驱动。
//!
//! ## 行为契约（What）
//! - `register` 为覆盖写：同名且未过期的条目被刷新，返回句柄标记 `refreshed`；
//! - 查询永不返回已过期条目：过期判断发生在迭代时刻，而非快照时刻；
//! - 过期条目由 `evict_expired` 惰性清除，清除时机不影响查询正确性。
//!
//! ## 风险提示（Trade-offs）
//! - 查询结果的排序按“最近注册在前、同刻按终端名升序”，每次查询都会对快照排序，
//!   目录规模较大时应换用带二级索引的存储实现。

use std::{
    borrow::ToOwned,
    string::String,
    sync::Arc,
    time::{Duration, Instant},
    vec::Vec,
};

use url::Url;

use crate::{
    applications::{
        clock::{Clock, SystemClock},
        store::{DirectoryStore, InMemoryDirectoryStore},
    },
    core::{link_format::Link, path},
    error::BrokerError,
};

/// 终端名的最大字节数。
pub const MAX_ENDPOINT_LEN: usize = 63;

const LOCATOR_SCHEMES: [&str; 4] = ["coap", "coaps", "coap+tcp", "coaps+tcp"];

/// 一条终端注册记录。
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    endpoint: String,
    resource_types: Vec<String>,
    links: Vec<Link>,
    locator: Url,
    lifetime: Duration,
    registered_at: Instant,
    expires_at: Instant,
}

impl DirectoryEntry {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 终端声明的资源类型（注册级声明与各链接 `rt` 的并集，去重保序）。
    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn locator(&self) -> &Url {
        &self.locator
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// 最近一次注册或刷新的时刻。
    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn advertises(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|rt| rt == resource_type)
    }

    /// 在命名空间中的注册资源位置（不含前导 `/`）。
    pub fn location(&self) -> String {
        registration_location(&self.endpoint)
    }

    /// 以 `now` 为起点续期；到期时刻超出时钟可表示范围时返回 `None`。
    fn renewed(&self, now: Instant) -> Option<Self> {
        Some(Self {
            registered_at: now,
            expires_at: now.checked_add(self.lifetime)?,
            ..self.clone()
        })
    }
}

/// 注册请求。
#[derive(Clone, Debug, Default)]
pub struct Registration {
    endpoint: String,
    locator: String,
    resource_types: Vec<String>,
    links: Vec<Link>,
    lifetime: Option<Duration>,
}

impl Registration {
    pub fn new(endpoint: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            locator: locator.into(),
            ..Self::default()
        }
    }

    pub fn resource_type(mut self, rt: impl Into<String>) -> Self {
        self.resource_types.push(rt.into());
        self
    }

    pub fn links(mut self, links: Vec<Link>) -> Self {
        self.links = links;
        self
    }

    /// 指定寿命；缺省时使用目录配置的默认寿命。
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }
}

/// 注册结果。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistrationHandle {
    endpoint: String,
    location: String,
    expires_at: Instant,
    refreshed: bool,
}

impl RegistrationHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 注册资源的位置，例如 `rd/node1`。
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// `true` 表示覆盖了一条仍然有效的旧注册。
    pub fn refreshed(&self) -> bool {
        self.refreshed
    }
}

/// 目录寿命参数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirectorySettings {
    pub default_lifetime: Duration,
    pub max_lifetime: Duration,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(86_400),
            max_lifetime: Duration::from_secs(u64::from(u32::MAX)),
        }
    }
}

/// 惰性、可重复遍历的查询结果。
///
/// # 教案式说明
/// - **契约 (What)**：持有查询时刻的有序快照；每次 [`DirectoryLookup::iter`] 都以当时的
///   时钟重新过滤过期条目，因此快照之后才过期的条目不会被当作有效结果返回；
/// - **执行 (How)**：快照中的条目为 `Arc` 共享，遍历不会再次访问存储。
#[derive(Clone, Debug)]
pub struct DirectoryLookup {
    entries: Vec<Arc<DirectoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl DirectoryLookup {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DirectoryEntry>> + '_ {
        let now = self.clock.now();
        self.entries.iter().filter(move |entry| !entry.is_expired(now))
    }

    /// 遍历时刻仍然有效的终端名。
    pub fn endpoints(&self) -> Vec<&str> {
        self.iter().map(|entry| entry.endpoint()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for &'a DirectoryLookup {
    type Item = &'a Arc<DirectoryEntry>;
    type IntoIter = Box<dyn Iterator<Item = &'a Arc<DirectoryEntry>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// 目录服务。
#[derive(Clone, Debug)]
pub struct DirectoryService {
    store: Arc<dyn DirectoryStore>,
    clock: Arc<dyn Clock>,
    settings: DirectorySettings,
}

impl DirectoryService {
    pub fn new(store: Arc<dyn DirectoryStore>, clock: Arc<dyn Clock>, settings: DirectorySettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// 内存存储 + 宿主时钟。
    pub fn in_memory(settings: DirectorySettings) -> Self {
        Self::new(
            Arc::new(InMemoryDirectoryStore::new()),
            Arc::new(SystemClock),
            settings,
        )
    }

    pub fn settings(&self) -> &DirectorySettings {
        &self.settings
    }

    /// 注册或刷新终端。
    ///
    /// # 教案式说明
    /// - **前置条件**：终端名为合法路径段且不超过 [`MAX_ENDPOINT_LEN`] 字节；定位符为带主机的
    ///   `coap`/`coaps`（含 `+tcp`）URI；寿命大于零且不超过配置上限；
    /// - **后置条件**：存储中的条目被整体替换，`registered_at` 取当前时刻；
    /// - **错误**：任一前置条件不满足时返回 [`BrokerError::Validation`]，存储不变。
    pub fn register(&self, registration: Registration) -> Result<RegistrationHandle, BrokerError> {
        validate_endpoint(&registration.endpoint)?;
        let locator = parse_locator(&registration.locator)?;
        let lifetime = registration.lifetime.unwrap_or(self.settings.default_lifetime);
        if lifetime.is_zero() {
            return Err(BrokerError::validation("registration lifetime must be positive"));
        }
        if lifetime > self.settings.max_lifetime {
            return Err(BrokerError::validation(format!(
                "registration lifetime {}s exceeds maximum {}s",
                lifetime.as_secs(),
                self.settings.max_lifetime.as_secs()
            )));
        }

        let mut resource_types = registration.resource_types;
        for rt in registration.links.iter().flat_map(|link| link.values("rt")) {
            if !resource_types.iter().any(|known| known == rt) {
                resource_types.push(rt.to_owned());
            }
        }

        let now = self.clock.now();
        let expires_at = now
            .checked_add(lifetime)
            .ok_or_else(|| BrokerError::validation(format!("registration lifetime {}s is out of range", lifetime.as_secs())))?;
        let entry = Arc::new(DirectoryEntry {
            endpoint: registration.endpoint,
            resource_types,
            links: registration.links,
            locator,
            lifetime,
            registered_at: now,
            expires_at,
        });
        let previous = self.store.upsert(Arc::clone(&entry));
        let refreshed = previous.is_some_and(|old| !old.is_expired(now));
        if refreshed {
            tracing::debug!(endpoint = entry.endpoint(), lifetime_secs = lifetime.as_secs(), "endpoint registration refreshed");
        } else {
            tracing::info!(endpoint = entry.endpoint(), locator = %entry.locator, lifetime_secs = lifetime.as_secs(), "endpoint registered");
        }
        Ok(handle(&entry, refreshed))
    }

    /// 仅延长既有注册的寿命，链接与定位符保持不变。
    ///
    /// 条目缺失、已过期或续期后的到期时刻无法表示时返回 [`BrokerError::NotFound`]。
    pub fn refresh(&self, endpoint: &str) -> Result<RegistrationHandle, BrokerError> {
        let now = self.clock.now();
        let entry = self
            .store
            .modify(endpoint, &|entry| {
                if entry.is_expired(now) {
                    None
                } else {
                    entry.renewed(now)
                }
            })
            .ok_or_else(|| BrokerError::not_found(&registration_location(endpoint)))?;
        tracing::debug!(endpoint, "endpoint lifetime refreshed");
        Ok(handle(&entry, true))
    }

    /// 按资源类型查询。
    ///
    /// # 教案式说明
    /// - **输入**：资源类型字面值，按整词与条目登记的 `rt` 比对；
    /// - **输出**：按“最近注册在前、同刻按终端名升序”排好的 [`DirectoryLookup`]；
    /// - **后置条件**：结果持有调用时刻的快照，之后的注册不会出现在其中；每次迭代按当时
    ///   时钟过滤过期条目，因此时钟推进后再次迭代可能变短。
    pub fn lookup_by_type(&self, resource_type: &str) -> DirectoryLookup {
        self.lookup(&|entry| entry.advertises(resource_type))
    }

    /// 全部有效终端。
    pub fn lookup_all(&self) -> DirectoryLookup {
        self.lookup(&|_| true)
    }

    /// 按终端名点查。
    ///
    /// # 教案式说明
    /// - **输入**：终端名，不做规范化，按字节精确匹配；
    /// - **前置条件**：无；非法终端名自然查不到；
    /// - **后置条件**：只读，不清除过期条目，清除交给 [`DirectoryService::evict_expired`]；
    /// - **错误**：条目缺失或已过期时返回 [`BrokerError::NotFound`]，路径为 `rd/<ep>`。
    pub fn lookup_by_endpoint(&self, endpoint: &str) -> Result<Arc<DirectoryEntry>, BrokerError> {
        let now = self.clock.now();
        self.store
            .get(endpoint)
            .filter(|entry| !entry.is_expired(now))
            .ok_or_else(|| BrokerError::not_found(&registration_location(endpoint)))
    }

    /// 显式注销。
    ///
    /// - **后置条件**：存储中不再有该终端，已过期的条目同样被清除；
    /// - **错误**：条目缺失或已过期时返回 [`BrokerError::NotFound`]，调用方可据此区分
    ///   “本次注销”与“早已失效”。
    pub fn deregister(&self, endpoint: &str) -> Result<Arc<DirectoryEntry>, BrokerError> {
        let now = self.clock.now();
        match self.store.remove(endpoint) {
            Some(entry) if !entry.is_expired(now) => {
                tracing::info!(endpoint, "endpoint deregistered");
                Ok(entry)
            }
            _ => Err(BrokerError::not_found(&registration_location(endpoint))),
        }
    }

    /// 清除全部已过期条目，返回被清除的终端名。
    pub fn evict_expired(&self) -> Vec<String> {
        let now = self.clock.now();
        let expired = self.store.scan(&|entry| entry.is_expired(now));
        let evicted: Vec<String> = expired
            .iter()
            .filter_map(|entry| {
                self.store
                    .remove_if(entry.endpoint(), &|current| current.is_expired(now))
                    .map(|removed| removed.endpoint().to_owned())
            })
            .collect();
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "expired registrations evicted");
        }
        evicted
    }

    /// 存储中的条目数（含尚未清除的过期条目）。
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn lookup(&self, filter: &dyn Fn(&DirectoryEntry) -> bool) -> DirectoryLookup {
        let now = self.clock.now();
        let mut entries = self
            .store
            .scan(&|entry| !entry.is_expired(now) && filter(entry));
        entries.sort_by(|a, b| {
            b.registered_at
                .cmp(&a.registered_at)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        DirectoryLookup {
            entries,
            clock: Arc::clone(&self.clock),
        }
    }
}

/// 终端 `endpoint` 的注册资源位置。
pub fn registration_location(endpoint: &str) -> String {
    format!("rd/{endpoint}")
}

fn handle(entry: &DirectoryEntry, refreshed: bool) -> RegistrationHandle {
    RegistrationHandle {
        endpoint: entry.endpoint.clone(),
        location: entry.location(),
        expires_at: entry.expires_at,
        refreshed,
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), BrokerError> {
    if endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(BrokerError::validation(format!(
            "endpoint name longer than {MAX_ENDPOINT_LEN} bytes"
        )));
    }
    if endpoint.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(BrokerError::validation(format!(
            "endpoint name `{endpoint}` contains reserved characters"
        )));
    }
    path::validate_segment(endpoint)
}

fn parse_locator(raw: &str) -> Result<Url, BrokerError> {
    let locator = Url::parse(raw)
        .map_err(|err| BrokerError::validation(format!("malformed locator `{raw}`: {err}")))?;
    if !LOCATOR_SCHEMES.contains(&locator.scheme()) {
        return Err(BrokerError::validation(format!(
            "locator scheme `{}` is not supported",
            locator.scheme()
        )));
    }
    if locator.host().is_none() {
        return Err(BrokerError::validation(format!("locator `{raw}` has no host")));
    }
    Ok(locator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applications::clock::ManualClock;

    fn service() -> (DirectoryService, ManualClock) {
        let clock = ManualClock::new();
        let service = DirectoryService::new(
            Arc::new(InMemoryDirectoryStore::new()),
            Arc::new(clock.clone()),
            DirectorySettings::default(),
        );
        (service, clock)
    }

    #[test]
    fn register_then_refresh_reports_flag() {
        let (directory, _clock) = service();
        let first = directory
            .register(Registration::new("node1", "coap://[2001:db8::1]:5683").resource_type("temperature"))
            .expect("register");
        assert!(!first.refreshed());
        assert_eq!(first.location(), "rd/node1");
        let second = directory
            .register(Registration::new("node1", "coap://[2001:db8::1]:5683"))
            .expect("refresh");
        assert!(second.refreshed());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn unrepresentable_expiry_is_a_validation_error() {
        let clock = ManualClock::new();
        let directory = DirectoryService::new(
            Arc::new(InMemoryDirectoryStore::new()),
            Arc::new(clock.clone()),
            DirectorySettings {
                default_lifetime: Duration::from_secs(60),
                max_lifetime: Duration::MAX,
            },
        );
        assert!(matches!(
            directory.register(Registration::new("n", "coap://h").lifetime(Duration::MAX)),
            Err(BrokerError::Validation { .. })
        ));
        assert!(directory.is_empty());
    }

    #[test]
    fn malformed_locator_and_lifetime_are_rejected() {
        let (directory, _clock) = service();
        assert!(matches!(
            directory.register(Registration::new("n", "not a uri")),
            Err(BrokerError::Validation { .. })
        ));
        assert!(matches!(
            directory.register(Registration::new("n", "http://example.com")),
            Err(BrokerError::Validation { .. })
        ));
        assert!(matches!(
            directory.register(Registration::new("n", "coap://h").lifetime(Duration::ZERO)),
            Err(BrokerError::Validation { .. })
        ));
        assert!(matches!(
            directory.register(Registration::new("a/b", "coap://h")),
            Err(BrokerError::Validation { .. })
        ));
        assert!(directory.is_empty());
    }

    #[test]
    fn link_resource_types_are_advertised() {
        let (directory, _clock) = service();
        let links = vec![Link::new("/sensors/t").with_attr("rt", "temperature humidity")];
        directory
            .register(Registration::new("node1", "coap://h").links(links))
            .expect("register");
        let entry = directory.lookup_by_endpoint("node1").expect("entry");
        assert_eq!(entry.resource_types(), ["temperature", "humidity"]);
        assert_eq!(directory.lookup_by_type("humidity").endpoints(), ["node1"]);
    }

    #[test]
    fn refresh_extends_lifetime_of_live_entry_only() {
        let (directory, clock) = service();
        directory
            .register(Registration::new("node1", "coap://h").lifetime(Duration::from_secs(10)))
            .expect("register");
        clock.advance(Duration::from_secs(8));
        directory.refresh("node1").expect("refresh");
        clock.advance(Duration::from_secs(8));
        assert!(directory.lookup_by_endpoint("node1").is_ok());
        clock.advance(Duration::from_secs(3));
        assert!(directory.refresh("node1").is_err());
    }

    #[test]
    fn evict_removes_only_expired_entries() {
        let (directory, clock) = service();
        directory
            .register(Registration::new("short", "coap://h").lifetime(Duration::from_secs(1)))
            .expect("short");
        directory
            .register(Registration::new("long", "coap://h").lifetime(Duration::from_secs(100)))
            .expect("long");
        clock.advance(Duration::from_secs(2));
        assert_eq!(directory.evict_expired(), ["short"]);
        assert_eq!(directory.len(), 1);
        assert!(directory.evict_expired().is_empty());
    }
}
