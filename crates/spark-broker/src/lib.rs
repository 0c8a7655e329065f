//! # spark-broker
//!
//! ## 定位与职责（Why）
//! - 受限应用协议代理的请求路由与资源生命周期核心：把已反序列化的 GET/POST/PUT/DELETE 请求
//!   映射到层级资源命名空间，支持保留前缀下“首次发布即建主题”，并在资源变更或删除时向观察者推送；
//! - 附带资源目录：远端终端登记自身与所提供的资源类型，客户端按资源类型或终端名查找。
//!
//! ## 架构嵌入（Where）
//! - `core` 模块负责报文模型、命名空间、观察者登记表与分发状态机；
//! - `applications` 模块承载资源目录及其存储、时钟与过期清扫；
//! - `broker` 模块按配置装配上述组件，是传输层面对的唯一对象；
//! - `config`/`telemetry`/`error` 提供配置、日志与错误类型。
//!
//! ## 边界（Trade-offs）
//! - 不负责报文编解码、重传、去重与分块传输，这些属于传输层；
//! - 出站推送只入队不等待，投递失败仅记录日志。

/// 资源目录等应用服务。
pub mod applications;

/// 代理实例装配。
pub mod broker;

/// TOML 配置与校验。
pub mod config;

/// 请求路由与资源生命周期核心。
///
/// - **契约定位 (What)**：[`crate::core::dispatcher::RequestDispatcher`] 是状态机入口，
///   其余子模块为它提供数据结构与协作者。
pub mod core;

/// 错误类型集中声明处。
pub mod error;

/// 日志订阅器安装。
pub mod telemetry;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, ConfigError, SendError};
