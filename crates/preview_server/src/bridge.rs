use crate::workspace::EditorWorkspace;
use preview_core::watcher::coalesce;
use preview_core::{
    Document, DocumentId, PreviewMode, SessionId, SessionManager, ViewEvent, WatchEvent, Workspace,
};
use rpc::RpcNotification;
use serde::Deserialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentParams {
    pub path: PathBuf,
    #[serde(default)]
    pub language_id: Option<String>,
    /// Full text of the editor buffer, read from disk when absent.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeParams {
    pub path: PathBuf,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloseParams {
    pub path: PathBuf,
}

/// Notifications the editor sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// `preview/open`
    OpenPreview(DocumentParams),
    /// `editor/didChangeActive`
    ActiveEditorChanged(DocumentParams),
    /// `document/didOpen`
    DidOpen(DocumentParams),
    /// `document/didChange`
    DidChange(ChangeParams),
    /// `document/didClose`
    DidClose(CloseParams),
    Exit,
}

impl EditorEvent {
    pub fn parse(notification: RpcNotification) -> Result<Self, rpc::Error> {
        let RpcNotification { method, params, .. } = notification;
        let event = match method.as_str() {
            "preview/open" => Self::OpenPreview(params.parse()?),
            "editor/didChangeActive" => Self::ActiveEditorChanged(params.parse()?),
            "document/didOpen" => Self::DidOpen(params.parse()?),
            "document/didChange" => Self::DidChange(params.parse()?),
            "document/didClose" => Self::DidClose(params.parse()?),
            "exit" => Self::Exit,
            other => return Err(rpc::Error::method_not_found(other)),
        };
        Ok(event)
    }
}

/// Dispatches editor notifications, page events and watch events to the
/// session manager.
#[derive(Debug, Clone)]
pub struct Bridge {
    manager: SessionManager,
    workspace: Arc<EditorWorkspace>,
    open_preview_on_open: bool,
}

impl Bridge {
    pub fn new(
        manager: SessionManager,
        workspace: Arc<EditorWorkspace>,
        open_preview_on_open: bool,
    ) -> Self {
        Self {
            manager,
            workspace,
            open_preview_on_open,
        }
    }

    /// Keeps processing events until the editor exits or hangs up.
    ///
    /// Watch events are debounced: a burst is collected until `debounce` passes
    /// without a new one, then coalesced per watch set.
    pub async fn run(
        self,
        mut notifications: UnboundedReceiver<RpcNotification>,
        mut view_events: UnboundedReceiver<(SessionId, ViewEvent)>,
        mut watch_events: UnboundedReceiver<WatchEvent>,
        debounce: Duration,
    ) {
        // If the debounce timer isn't active, it will be set to expire "never",
        // which is actually just 1 year in the future.
        const NEVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

        let mut pending_watch_events = Vec::new();
        let watch_timer = tokio::time::sleep(NEVER);
        tokio::pin!(watch_timer);

        loop {
            tokio::select! {
                maybe_notification = notifications.recv() => {
                    match maybe_notification {
                        Some(notification) => {
                            if self.handle_notification(notification).is_break() {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("Editor hung up");
                            break;
                        }
                    }
                }
                Some((session_id, event)) = view_events.recv() => {
                    self.handle_view_event(session_id, event);
                }
                Some(event) = watch_events.recv() => {
                    pending_watch_events.push(event);
                    watch_timer.as_mut().reset(Instant::now() + debounce);
                }
                _ = watch_timer.as_mut(), if !pending_watch_events.is_empty() => {
                    watch_timer.as_mut().reset(Instant::now() + NEVER);

                    for event in coalesce(std::mem::take(&mut pending_watch_events)) {
                        let manager = self.manager.clone();
                        tokio::spawn(async move {
                            manager.on_config_or_asset_event(event).await;
                        });
                    }
                }
            }
        }

        self.manager.shutdown();
    }

    pub fn handle_notification(&self, notification: RpcNotification) -> ControlFlow<()> {
        let method = notification.method.clone();
        let event = match EditorEvent::parse(notification) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(%method, %err, "Ignoring editor notification");
                return ControlFlow::Continue(());
            }
        };

        tracing::trace!(?event, "Processing editor event");

        match event {
            EditorEvent::OpenPreview(params) => self.spawn_request(params, PreviewMode::Open),
            EditorEvent::ActiveEditorChanged(params) => {
                self.spawn_request(params, PreviewMode::Follow)
            }
            EditorEvent::DidOpen(params) => {
                let params = self.track(params);
                if self.open_preview_on_open {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        let document = bridge.load_document(params).await;
                        if bridge.manager.should_open_on_open(&document).await {
                            bridge
                                .manager
                                .request_preview(document, PreviewMode::Open)
                                .await;
                        }
                    });
                }
            }
            EditorEvent::DidChange(ChangeParams { path, text }) => {
                let document = DocumentId::new(path);
                self.workspace.record_text(document.clone(), text.clone());
                self.manager.on_document_changed(&document, text);
            }
            EditorEvent::DidClose(CloseParams { path }) => {
                self.workspace.forget_text(&DocumentId::new(path));
            }
            EditorEvent::Exit => return ControlFlow::Break(()),
        }

        ControlFlow::Continue(())
    }

    fn handle_view_event(&self, session_id: SessionId, event: ViewEvent) {
        match event {
            ViewEvent::Message { revision, message } => {
                self.manager.on_inbound_message(session_id, revision, message)
            }
            ViewEvent::Closed => self.manager.on_view_closed(session_id),
        }
    }

    fn spawn_request(&self, params: DocumentParams, mode: PreviewMode) {
        let params = self.track(params);
        let bridge = self.clone();
        tokio::spawn(async move {
            let document = bridge.load_document(params).await;
            bridge.manager.request_preview(document, mode).await;
        });
    }

    /// Records what the editor told about the document.
    fn track(&self, params: DocumentParams) -> DocumentParams {
        if let Some(root) = &params.workspace_root {
            self.workspace.add_root(root.clone());
        }
        if let Some(text) = &params.text {
            self.workspace
                .record_text(DocumentId::new(&params.path), text.clone());
        }
        params
    }

    async fn load_document(&self, params: DocumentParams) -> Document {
        let DocumentParams {
            path,
            language_id,
            text,
            ..
        } = params;
        let id = DocumentId::new(path);
        let text = match text {
            Some(text) => text,
            None => self.workspace.document_text(&id).await.unwrap_or_default(),
        };
        Document::new(id, language_id, text)
    }
}
