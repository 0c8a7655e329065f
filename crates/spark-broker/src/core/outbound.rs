//! 出站推送通道：分发器把观察者通知交给传输层的唯一出口。
//!
//! # 教案式说明
//! - **契约 (What)**：[`DatagramSink::send_datagram`] 为“发出即忘”，不得阻塞，失败仅返回 [`SendError`]；
//!   本层不重试，重传属于传输层；
//! - **执行 (How)**：默认实现 [`OutboundQueue`] 基于 Tokio 无界 `mpsc`，发送端同步入队，
//!   传输层在自己的任务里消费 [`OutboundReceiver`] 并序列化发送。

use std::fmt;

use tokio::sync::mpsc;

use crate::{core::message::Response, error::SendError};

/// 出站报文接收方（传输层实现）。
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, response: Response) -> Result<(), SendError>;
}

/// 基于无界通道的出站队列发送端。
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Response>,
}

/// 出站队列的消费端。
pub type OutboundReceiver = mpsc::UnboundedReceiver<Response>;

/// 创建一对出站队列端点。
pub fn outbound_channel() -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundQueue { tx }, rx)
}

impl OutboundQueue {
    /// 消费端是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DatagramSink for OutboundQueue {
    fn send_datagram(&self, response: Response) -> Result<(), SendError> {
        self.tx.send(response).map_err(|_| SendError::Closed)
    }
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
