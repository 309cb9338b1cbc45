use crate::{Params, RpcError, RpcNotification};
use serde::Serialize;
use std::io::{BufRead, Write};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// RPC client talking to the editor.
///
/// Every message is a single line of JSON in both directions.
#[derive(Debug, Clone)]
pub struct RpcClient {
    /// Sender for sending message from Rust to the editor.
    writer_sender: UnboundedSender<RpcNotification>,
}

impl RpcClient {
    /// Creates a new instance of [`RpcClient`].
    ///
    /// Notifications read from `reader` are forwarded to `sink`; `sink` is
    /// dropped once `reader` reaches EOF.
    ///
    /// # Arguments
    ///
    /// * `reader`: a buffer reader on top of [`std::io::Stdin`].
    /// * `writer`: a buffer writer on top of [`std::io::Stdout`].
    pub fn new(
        reader: impl BufRead + Send + 'static,
        writer: impl Write + Send + 'static,
        sink: UnboundedSender<RpcNotification>,
    ) -> Result<Self, RpcError> {
        std::thread::Builder::new()
            .name("stdio-reader".to_string())
            .spawn(move || {
                if let Err(error) = loop_read(reader, &sink) {
                    tracing::error!(?error, "Thread stdio-reader exited");
                }
            })?;

        let (writer_sender, io_writer_receiver) = unbounded_channel();
        tokio::spawn(async move {
            if let Err(error) = loop_write(writer, io_writer_receiver).await {
                tracing::error!(?error, "Task stdio-writer exited");
            }
        });

        Ok(Self { writer_sender })
    }

    /// Creates a client whose notifications go to `writer_sender` instead of
    /// stdout.
    pub fn from_sender(writer_sender: UnboundedSender<RpcNotification>) -> Self {
        Self { writer_sender }
    }

    /// Sends a notification to the editor.
    pub fn notify(&self, method: impl Into<String>, params: impl Serialize) -> Result<(), RpcError> {
        let notification = RpcNotification::new(method, Params::from_serialize(params)?);
        self.writer_sender.send(notification)?;
        Ok(())
    }
}

/// Keeps reading and forwarding lines from stdin until EOF.
fn loop_read(
    mut reader: impl BufRead,
    sink: &UnboundedSender<RpcNotification>,
) -> Result<(), RpcError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            tracing::debug!("EOF reached on stdin");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RpcNotification>(trimmed) {
            Ok(notification) => {
                tracing::trace!(method = %notification.method, "<= Editor");
                sink.send(notification).map_err(|_| RpcError::StreamClosed)?;
            }
            Err(err) => {
                tracing::error!(error = ?err, line = trimmed, "Invalid raw editor message");
            }
        }
    }
}

/// Keeps writing the messages from the Rust side to stdout.
async fn loop_write(
    mut writer: impl Write,
    mut io_writer_receiver: UnboundedReceiver<RpcNotification>,
) -> Result<(), RpcError> {
    while let Some(msg) = io_writer_receiver.recv().await {
        let s = serde_json::to_string(&msg)?;

        if s.len() < 128 {
            tracing::trace!(?msg, "=> Editor");
        } else {
            tracing::trace!(method = ?msg.method, msg_size = s.len(), "=> Editor");
        }

        writeln!(writer, "{s}")?;
        writer.flush()?;
    }

    Ok(())
}
