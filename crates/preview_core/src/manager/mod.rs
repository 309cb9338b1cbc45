//! The session manager owning at most one preview session.
//!
//! Every handler runs to completion except while awaiting the workspace
//! (reading the configuration or a document's text). Before a resumed
//! handler applies its result it checks two things under the lock:
//!
//! - the session `generation` it started with, bumped whenever the session is
//!   created, re-targeted or disposed;
//! - its ticket, so that of two overlapping handlers of the same kind only the
//!   most recently started one applies its result.
//!
//! A handler failing either check drops its result without side effects.

use crate::assets::{watch_targets, AssetResolver};
use crate::channel::{
    ContentRevision, MessageChannel, SessionId, ViewEvent, ViewEventSender, ViewFactory,
    ViewOptions,
};
use crate::config::{ConfigScope, PreviewConfig, DEFAULT_CONFIG_FILE_NAME};
use crate::document::{Document, DocumentId};
use crate::protocol::{any_global_loaded, InboundMessage};
use crate::session::{PreviewSession, Retarget, SessionState};
use crate::template::{Scaffold, DEFAULT_MARKDOWN_IT_CDN};
use crate::watcher::{WatchEvent, WatchSetId, WatchTarget, WatcherRegistry};
use crate::workspace::Workspace;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[cfg(test)]
mod tests;

const EXTERNAL_SCRIPTS_WARNING: &str =
    "Preview: configured CDN scripts not detected in the preview page (check the URLs).";

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Location of the configuration file relative to a workspace root.
    pub config_file_name: PathBuf,
    pub markdown_it_cdn: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            config_file_name: PathBuf::from(DEFAULT_CONFIG_FILE_NAME),
            markdown_it_cdn: DEFAULT_MARKDOWN_IT_CDN.to_string(),
        }
    }
}

/// How a preview request was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewMode {
    /// Explicit request, creates the session if there is none.
    Open,
    /// The active editor changed, only an existing session follows it.
    Follow,
}

/// Host services the manager is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub workspace: Arc<dyn Workspace>,
    pub views: Arc<dyn ViewFactory>,
    pub resolver: Arc<dyn AssetResolver>,
}

/// Read-only copy of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub document: DocumentId,
    pub state: SessionState,
    pub content_revision: Option<ContentRevision>,
    pub pending_text: Option<String>,
    pub base: PathBuf,
    pub watch_set_id: Option<WatchSetId>,
    pub watch_targets: Vec<WatchTarget>,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct ManagerState {
    session: Option<PreviewSession>,
    generation: u64,
    request_ticket: u64,
    refresh_ticket: u64,
    last_session_id: SessionId,
}

struct Inner {
    collaborators: Collaborators,
    registry: WatcherRegistry,
    view_events: UnboundedSender<(SessionId, ViewEvent)>,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
}

/// Cheap handle to the preview session manager.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        collaborators: Collaborators,
        registry: WatcherRegistry,
        view_events: UnboundedSender<(SessionId, ViewEvent)>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                collaborators,
                registry,
                view_events,
                options,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.inner.registry
    }

    /// Creates, re-targets or focuses the preview for `document`.
    pub async fn request_preview(&self, document: Document, mode: PreviewMode) {
        let (generation, ticket) = {
            let mut state = self.inner.state.lock();
            match state.session.as_ref() {
                Some(session) if *session.document() == document.id => {
                    session.reveal();
                    return;
                }
                None if mode == PreviewMode::Follow => return,
                _ => {}
            }
            state.request_ticket += 1;
            (state.generation, state.request_ticket)
        };

        let scope = self.scope_for(&document.id);
        let config = self.load_config(&scope).await;

        if !document.is_eligible(&config) {
            tracing::debug!(document = %document.id, "Document not eligible for preview");
            return;
        }

        // Edits that arrived while the config was read only reach the workspace.
        let text = self
            .inner
            .collaborators
            .workspace
            .document_text(&document.id)
            .await
            .unwrap_or(document.text);

        let targets = watch_targets(&scope, &config, self.inner.collaborators.resolver.as_ref());
        let html = self.scaffold(&scope, &config, &text);
        let title = view_title(&document.id);

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.request_ticket != ticket || state.generation != generation {
            tracing::debug!(document = %document.id, "Preview request superseded, discarding");
            return;
        }

        match state.session.as_mut() {
            Some(session) if *session.document() == document.id => session.reveal(),
            Some(session) => {
                session.retarget(
                    &self.inner.registry,
                    Retarget {
                        document: document.id,
                        scope,
                        config,
                        title,
                        html,
                        targets,
                    },
                );
                state.generation += 1;
            }
            None if mode == PreviewMode::Follow => {}
            None => {
                state.last_session_id += 1;
                let session_id = state.last_session_id;
                let events = ViewEventSender::new(session_id, self.inner.view_events.clone());
                let options = ViewOptions {
                    title,
                    resource_root: scope.base().to_path_buf(),
                };

                let view = match self.inner.collaborators.views.create_view(options, events) {
                    Ok(view) => view,
                    Err(err) => {
                        tracing::error!(?err, document = %document.id, "Failed to create preview view");
                        return;
                    }
                };

                tracing::debug!(session_id, document = %document.id, "Created preview session");

                let mut session = PreviewSession::new(
                    session_id,
                    MessageChannel::new(session_id, view),
                    document.id,
                    scope,
                    config,
                );
                session.reveal();
                session.load_content(html);
                session.install_watchers(&self.inner.registry, targets);
                session.subscribe();

                state.session = Some(session);
                state.generation += 1;
            }
        }
    }

    /// Forwards an edit of `document` to the session if it targets it.
    pub fn on_document_changed(&self, document: &DocumentId, text: String) {
        let mut state = self.inner.state.lock();
        if let Some(session) = state.session.as_mut() {
            session.on_edit(document, text);
        }
    }

    /// Refreshes the preview after a change of its configuration or assets.
    ///
    /// Events of a watch set that is no longer installed are ignored.
    pub async fn on_config_or_asset_event(&self, event: WatchEvent) {
        let (generation, ticket, document, scope) = {
            let mut state = self.inner.state.lock();
            let Some(session) = state.session.as_ref() else {
                return;
            };
            if session.watch_set_id() != Some(event.set_id) {
                tracing::debug!(set_id = event.set_id, "Ignoring event of a replaced watch set");
                return;
            }
            let document = session.document().clone();
            let scope = session.scope().clone();
            state.refresh_ticket += 1;
            (state.generation, state.refresh_ticket, document, scope)
        };

        tracing::debug!(
            path = %event.path.display(),
            target = ?event.target,
            change = ?event.change,
            "Preview dependency changed"
        );

        let config = self.load_config(&scope).await;
        let text = self
            .inner
            .collaborators
            .workspace
            .document_text(&document)
            .await
            .unwrap_or_default();

        let targets = watch_targets(&scope, &config, self.inner.collaborators.resolver.as_ref());
        let html = self.scaffold(&scope, &config, &text);

        let mut state = self.inner.state.lock();
        if state.refresh_ticket != ticket || state.generation != generation {
            tracing::debug!(%document, "Refresh superseded, discarding");
            return;
        }
        if let Some(session) = state.session.as_mut() {
            session.refresh(&self.inner.registry, html, Some((config, targets)));
        }
    }

    /// Handles a message posted by the page of session `session_id` while it
    /// showed content `revision`.
    pub fn on_inbound_message(
        &self,
        session_id: SessionId,
        revision: ContentRevision,
        message: InboundMessage,
    ) {
        let warn_external_scripts = {
            let mut state = self.inner.state.lock();
            let Some(session) = state.session.as_mut().filter(|s| s.id() == session_id) else {
                tracing::debug!(session_id, kind = message.kind(), "Ignoring message of a stale view");
                return;
            };

            match message {
                InboundMessage::Ready => {
                    tracing::debug!(session_id, revision, "Preview page ready");
                    session.mark_ready(revision);
                    false
                }
                InboundMessage::Rendered { html } => {
                    tracing::debug!(session_id, len = html.len(), "Preview page rendered");
                    false
                }
                InboundMessage::RenderError { error } => {
                    tracing::error!(session_id, %error, "Preview page failed to render");
                    false
                }
                InboundMessage::Globals { globals } => {
                    tracing::debug!(session_id, ?globals, "Preview page globals");
                    session.config().has_external_urls() && !any_global_loaded(&globals)
                }
                InboundMessage::Log { level, message } => {
                    log_page_message(session_id, &level, &message);
                    false
                }
            }
        };

        if warn_external_scripts {
            self.inner
                .collaborators
                .workspace
                .show_warning(EXTERNAL_SCRIPTS_WARNING);
        }
    }

    /// Disposes the session if its view was closed.
    pub fn on_view_closed(&self, session_id: SessionId) {
        let mut state = self.inner.state.lock();
        if state.session.as_ref().map(PreviewSession::id) != Some(session_id) {
            tracing::debug!(session_id, "Ignoring closure of a stale view");
            return;
        }
        if let Some(mut session) = state.session.take() {
            tracing::debug!(session_id, document = %session.document(), "Preview view closed");
            session.dispose(&self.inner.registry);
            state.generation += 1;
        }
    }

    /// Whether a freshly opened document should get a preview automatically.
    ///
    /// Only documents inside a workspace qualify.
    pub async fn should_open_on_open(&self, document: &Document) -> bool {
        let Some(root) = self.inner.collaborators.workspace.workspace_root(&document.id) else {
            return false;
        };
        let scope = ConfigScope::resolve(
            &document.id,
            Some(root.as_path()),
            &self.inner.options.config_file_name,
        );
        let config = self.load_config(&scope).await;
        document.is_eligible(&config)
    }

    /// Disposes the session, if any.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if let Some(mut session) = state.session.take() {
            tracing::debug!(session_id = session.id(), "Shutting down preview session");
            session.dispose(&self.inner.registry);
            state.generation += 1;
        }
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let state = self.inner.state.lock();
        state.session.as_ref().map(|session| SessionSnapshot {
            id: session.id(),
            document: session.document().clone(),
            state: session.state(),
            content_revision: session.content_revision(),
            pending_text: session.pending_text().map(ToOwned::to_owned),
            base: session.scope().base().to_path_buf(),
            watch_set_id: session.watch_set_id(),
            watch_targets: session.watch_targets(),
            generation: state.generation,
        })
    }

    fn scope_for(&self, document: &DocumentId) -> ConfigScope {
        let root = self.inner.collaborators.workspace.workspace_root(document);
        ConfigScope::resolve(document, root.as_deref(), &self.inner.options.config_file_name)
    }

    /// Reads the configuration of `scope`, falling back to the default one.
    async fn load_config(&self, scope: &ConfigScope) -> PreviewConfig {
        let Some(path) = scope.config_file() else {
            return PreviewConfig::default();
        };

        let bytes = match self.inner.collaborators.workspace.read_file(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %path.display(), "No preview config");
                return PreviewConfig::default();
            }
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "Failed to read preview config");
                return PreviewConfig::default();
            }
        };

        PreviewConfig::from_slice(&bytes).unwrap_or_else(|err| {
            tracing::warn!(?err, path = %path.display(), "Invalid preview config, using defaults");
            PreviewConfig::default()
        })
    }

    fn scaffold(&self, scope: &ConfigScope, config: &PreviewConfig, text: &str) -> String {
        Scaffold {
            config,
            base: scope.base(),
            resolver: self.inner.collaborators.resolver.as_ref(),
            markdown_it_cdn: &self.inner.options.markdown_it_cdn,
        }
        .render(text)
    }
}

fn view_title(document: &DocumentId) -> String {
    format!("Markdown-it Preview: {}", document.file_name())
}

fn log_page_message(session_id: SessionId, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(session_id, "[page] {message}"),
        "warn" => tracing::warn!(session_id, "[page] {message}"),
        "debug" => tracing::debug!(session_id, "[page] {message}"),
        _ => tracing::info!(session_id, "[page] {message}"),
    }
}
