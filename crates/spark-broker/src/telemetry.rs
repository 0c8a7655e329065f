//! 日志订阅器安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：代理内部只通过 `tracing` 宏输出结构化事件，宿主进程启动时调用一次
//!   [`install`] 即可把事件格式化到标准输出；
//! - **逻辑（How）**：`tracing_subscriber::registry()` 组合 `EnvFilter` 与 `fmt` Layer；
//!   `RUST_LOG` 存在时优先生效，否则使用调用方给出的默认过滤指令；
//! - **契约（What）**：若外部已设置全局 Subscriber，返回 [`TelemetryError::SubscriberAlreadySet`]，
//!   不会覆盖既有设置。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装失败原因。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 外部提前设置了全局 `tracing` Subscriber。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,

    /// 默认过滤指令无法解析。
    #[error("invalid log filter `{directive}`: {source}")]
    InvalidFilter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    /// 设置全局 Subscriber 的底层错误。
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装全局订阅器，`default_filter` 形如 `"info"` 或 `"spark_broker=debug"`。
pub fn install(default_filter: &str) -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(default_filter)?)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter(default_filter: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_filter).map_err(|source| TelemetryError::InvalidFilter {
        directive: default_filter.to_owned(),
        source,
    })
}
