//! # core 模块说明
//!
//! ## 设计定位（Why）
//! - 承载代理的请求路由与资源生命周期：报文模型、路径规范化、资源命名空间、观察者登记表、
//!   资源层协作者与分发状态机；
//! - 不涉及报文编解码与重传，这些由传输层在 [`message::Transaction`] 边界之外完成。
//!
//! ## 依赖方向（How）
//! - `message`/`path`/`link_format` 为叶子；`namespace` 依赖 `resource_layer` 中的处理器契约；
//! - `dispatcher` 位于最上层，组合命名空间、登记表、资源层与 [`outbound::DatagramSink`]。

pub mod dispatcher;
pub mod link_format;
pub mod message;
pub mod namespace;
pub mod observe;
pub mod outbound;
pub mod path;
pub mod resource_layer;
