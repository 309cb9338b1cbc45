mod client;
mod jsonrpc;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

pub use self::client::RpcClient;
pub use self::jsonrpc::{Error, ErrorCode, Params, RpcNotification, Version};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to send notification: {0}")]
    SendNotification(#[from] SendError<RpcNotification>),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("stream closed")]
    StreamClosed,
    #[error(transparent)]
    JsonRpc(#[from] Error),
}
