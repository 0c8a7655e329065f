//! # 代理配置
//!
//! ## 核心意图（Why）
//! - 以一份 TOML 文档描述代理的路由参数、目录寿命与日志过滤，所有字段均有默认值，
//!   空文档即得到可运行的配置；
//! - 使用 [`serde`] 反序列化为强类型结构，未知字段直接报错，避免拼写错误被静默忽略。
//!
//! ## 配置样例（What）
//! ```toml
//! [broker]
//! topic_prefix = "/ps"
//! discovery_path = "/.well-known/core"
//! notification_type = "non"
//!
//! [directory]
//! enabled = true
//! default_lifetime_secs = 86400
//! max_lifetime_secs = 4294967295
//! eviction_interval_secs = 60
//!
//! [telemetry]
//! filter = "info"
//! ```

use std::{fs, path::Path, string::String, time::Duration};

use serde::Deserialize;

use crate::{
    applications::directory::DirectorySettings,
    core::{dispatcher::DispatchSettings, message::MessageType, path},
    error::ConfigError,
};

/// `directory.max_lifetime_secs` 的上限，与注册报文中 `lt` 的取值范围一致。
pub const MAX_LIFETIME_SECS: u64 = u32::MAX as u64;

/// 顶层配置。
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub broker: BrokerSection,
    pub directory: DirectorySection,
    pub telemetry: TelemetrySection,
}

/// `[broker]`：分发器路由参数。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    /// PUT 自动建档的保留前缀。
    pub topic_prefix: String,
    pub discovery_path: String,
    /// 内容变更推送的报文类型。
    pub notification_type: NotificationType,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            topic_prefix: "/ps".to_owned(),
            discovery_path: "/.well-known/core".to_owned(),
            notification_type: NotificationType::Non,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Con,
    #[default]
    Non,
}

impl From<NotificationType> for MessageType {
    fn from(value: NotificationType) -> Self {
        match value {
            NotificationType::Con => MessageType::Con,
            NotificationType::Non => MessageType::Non,
        }
    }
}

/// `[directory]`：资源目录开关与寿命参数（秒）。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DirectorySection {
    pub enabled: bool,
    pub default_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_lifetime_secs: 86_400,
            max_lifetime_secs: MAX_LIFETIME_SECS,
            eviction_interval_secs: 60,
        }
    }
}

impl DirectorySection {
    pub fn settings(&self) -> DirectorySettings {
        DirectorySettings {
            default_lifetime: Duration::from_secs(self.default_lifetime_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
        }
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

/// `[telemetry]`：`RUST_LOG` 缺省时使用的过滤指令。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub filter: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl BrokerConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 校验字段组合。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：前缀与发现路径必须可规范化且互不相同，前缀不得为根；
    ///   目录启用时寿命与清扫周期均为正，且默认寿命不超过上限；
    /// - **错误**：首个不满足的字段以 [`ConfigError::Invalid`] 返回。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = normalized("broker.topic_prefix", &self.broker.topic_prefix)?;
        let discovery = normalized("broker.discovery_path", &self.broker.discovery_path)?;
        if prefix == path::ROOT {
            return Err(invalid("broker.topic_prefix", "prefix must not be the root path"));
        }
        if discovery == path::ROOT {
            return Err(invalid("broker.discovery_path", "discovery path must not be the root path"));
        }
        if prefix == discovery {
            return Err(invalid("broker.topic_prefix", "prefix collides with the discovery path"));
        }

        let directory = &self.directory;
        if directory.enabled {
            if directory.default_lifetime_secs == 0 {
                return Err(invalid("directory.default_lifetime_secs", "must be positive"));
            }
            if directory.max_lifetime_secs > MAX_LIFETIME_SECS {
                return Err(invalid(
                    "directory.max_lifetime_secs",
                    "must not exceed 4294967295 seconds",
                ));
            }
            if directory.max_lifetime_secs < directory.default_lifetime_secs {
                return Err(invalid(
                    "directory.max_lifetime_secs",
                    "must not be smaller than default_lifetime_secs",
                ));
            }
            if directory.eviction_interval_secs == 0 {
                return Err(invalid("directory.eviction_interval_secs", "must be positive"));
            }
        }
        if self.telemetry.filter.trim().is_empty() {
            return Err(invalid("telemetry.filter", "must not be empty"));
        }
        Ok(())
    }

    /// 规范化后的分发参数。
    pub fn dispatch_settings(&self) -> Result<DispatchSettings, ConfigError> {
        Ok(DispatchSettings {
            topic_prefix: normalized("broker.topic_prefix", &self.broker.topic_prefix)?,
            discovery_path: normalized("broker.discovery_path", &self.broker.discovery_path)?,
            notification_type: self.broker.notification_type.into(),
        })
    }
}

fn normalized(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    path::normalize(raw).map_err(|err| invalid(key, err.to_string()))
}

fn invalid(key: &'static str, detail: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        detail: detail.into(),
    }
}
