//! Host side of the markdown-it live preview.
//!
//! The editor talks to [`start`] over stdio, each preview is shown in the
//! browser through a [`surface::BrowserView`] served on localhost.

mod bridge;
pub mod surface;
mod workspace;

pub use self::bridge::{Bridge, EditorEvent};
pub use self::surface::{BrowserView, BrowserViewFactory, SurfaceOptions};
pub use self::workspace::EditorWorkspace;

use preview_core::{Collaborators, LocalAssetResolver, ManagerOptions, SessionManager, WatcherRegistry};
use std::io::{BufReader, BufWriter};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Rpc(#[from] rpc::RpcError),
}

/// Starts the preview host and keeps it running until the editor exits.
///
/// `config_err` is the error of parsing the host configuration, if any, it's
/// shown to the user once the editor is connected.
pub async fn start(config_err: Option<String>) -> Result<(), ServerError> {
    let settings = &preview_config::config().preview;

    let (notification_tx, notification_rx) = tokio::sync::mpsc::unbounded_channel();
    let rpc_client = rpc::RpcClient::new(
        BufReader::new(std::io::stdin()),
        BufWriter::new(std::io::stdout()),
        notification_tx,
    )?;

    let workspace = Arc::new(EditorWorkspace::new(rpc_client));
    if let Some(err) = config_err {
        workspace.show_information(&format!(
            "Using default host config, failed to parse {}: {err}",
            preview_config::config_file().display()
        ));
    }

    let (view_tx, view_rx) = tokio::sync::mpsc::unbounded_channel();
    let (watch_tx, watch_rx) = tokio::sync::mpsc::unbounded_channel();

    let views = BrowserViewFactory::new(SurfaceOptions::from(settings), Handle::current());
    let manager = SessionManager::new(
        Collaborators {
            workspace: workspace.clone(),
            views: Arc::new(views),
            resolver: Arc::new(LocalAssetResolver::default()),
        },
        WatcherRegistry::new(watch_tx),
        view_tx,
        ManagerOptions {
            config_file_name: settings.config_file_name(),
            markdown_it_cdn: settings.markdown_it_cdn.clone(),
        },
    );

    tracing::debug!(?settings, "Preview host started");

    Bridge::new(manager, workspace, settings.open_preview_on_open)
        .run(notification_rx, view_rx, watch_rx, settings.debounce())
        .await;

    tracing::debug!("Preview host exited");

    Ok(())
}
