use thiserror::Error;

/// Failure to talk to a rendering surface.
///
/// Never surfaced past the session manager, which logs it and carries on.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("view has been disposed")]
    Disposed,
    #[error("no page is connected to the view")]
    NotConnected,
    #[error("failed to bind the view server: {0}")]
    Bind(#[source] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid preview config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("{0} can not be watched: no parent directory or file name")]
    InvalidWatchTarget(std::path::PathBuf),
    #[error(transparent)]
    Watch(#[from] notify::Error),
}
