//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为代理对外暴露的错误语义提供集中定义：路径缺失、重复创建、报文校验失败、方法不受支持；
//! - 所有错误都在分发器内部就地转换为响应码，不会作为未捕获失败流向传输层。
//!
//! ## 设计要求（What）
//! - 错误类型派生 `thiserror::Error`，兼容 `std::error::Error`；
//! - [`BrokerError::response_code`] 给出稳定映射；`UnsupportedMethod` 映射为“无响应”。

use std::{borrow::ToOwned, string::String};

use thiserror::Error;

use crate::core::message::{Method, ResponseCode};

/// 代理核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合命名空间、目录服务与分发器在处理单个事务时可能遇到的失败；
/// - **契约 (What)**：
///   - 所有变体均满足 `Send + Sync + 'static`；
///   - 每个变体携带可读上下文（路径、终端名或原始方法码），便于日志排障；
/// - **执行 (How)**：分发器通过 [`BrokerError::response_code`] 把错误折算为事务上的响应码。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BrokerError {
    /// 目标路径或终端不存在。
    #[error("no resource or endpoint at `{path}`")]
    NotFound { path: String },

    /// 创建目标已存在。
    #[error("`{path}` already exists")]
    Conflict { path: String },

    /// 路径、查询参数或注册报文不合法。
    #[error("validation failed: {detail}")]
    Validation { detail: String },

    /// 请求方法码不在 GET/POST/PUT/DELETE 之内。
    #[error("method code {code} is not supported")]
    UnsupportedMethod { code: u8 },

    /// 资源存在，但其处理器拒绝该方法。
    #[error("`{path}` does not accept {method:?}")]
    MethodNotAllowed { path: String, method: Method },
}

impl BrokerError {
    /// 以路径构造 [`BrokerError::NotFound`]。
    pub fn not_found(path: &str) -> Self {
        BrokerError::NotFound {
            path: path.to_owned(),
        }
    }

    /// 以路径构造 [`BrokerError::Conflict`]。
    pub fn conflict(path: &str) -> Self {
        BrokerError::Conflict {
            path: path.to_owned(),
        }
    }

    /// 以描述构造 [`BrokerError::Validation`]。
    pub fn validation(detail: impl Into<String>) -> Self {
        BrokerError::Validation {
            detail: detail.into(),
        }
    }

    /// 将错误折算为响应码。
    ///
    /// - **契约 (What)**：返回 `None` 表示事务应被静默丢弃，仅 `UnsupportedMethod` 如此；
    /// - **映射**：NotFound→4.04，Conflict→4.09，Validation→4.00，MethodNotAllowed→4.05。
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            BrokerError::NotFound { .. } => Some(ResponseCode::NotFound),
            BrokerError::Conflict { .. } => Some(ResponseCode::Conflict),
            BrokerError::Validation { .. } => Some(ResponseCode::BadRequest),
            BrokerError::MethodNotAllowed { .. } => Some(ResponseCode::MethodNotAllowed),
            BrokerError::UnsupportedMethod { .. } => None,
        }
    }
}

/// 出站通知投递失败。
///
/// - **意图 (Why)**：观察者推送为“发出即忘”，失败只记录日志，不影响删除事务自身的响应；
/// - **契约 (What)**：`Closed` 表示传输层已关闭出站队列。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SendError {
    #[error("outbound queue is closed")]
    Closed,
}

/// 配置装载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration value for `{key}`: {detail}")]
    Invalid { key: &'static str, detail: String },
}
