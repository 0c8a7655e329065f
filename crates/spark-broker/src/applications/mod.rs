//! # applications 模块说明
//!
//! ## 设计定位（Why）
//! - 聚合挂载在代理命名空间上的应用服务，目前即资源目录：终端注册、按属性查询与过期清扫；
//! - 应用服务以 [`crate::core::resource_layer::ResourceHandler`] 的形式接入，复用分发器的方法规则。
//!
//! ## 契约边界（What）
//! - 目录状态只存放在 [`store::DirectoryStore`] 中，命名空间里的 `rd/<ep>` 节点仅是入口；
//! - 时间一律经由 [`clock::Clock`] 读取，测试可注入 [`clock::ManualClock`]。

pub mod clock;
pub mod directory;
pub mod eviction;
pub mod rd;
pub mod store;
